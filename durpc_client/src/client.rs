use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use tokio::{
    io::{self, AsyncRead, AsyncWrite, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc,
    time::{self, Instant},
};
use tokio_rustls::TlsConnector;
use tracing::debug;

use durpc_protocol::{
    CallShape, ClientTlsConfig, Error, ErrorKind, Inbound, Message, MessageStatusType,
    MessageType, Metadata, Result, Role, SerializeType, Session, METADATA_TIMEOUT_MS,
};

/// Per-connection options.
#[derive(Clone)]
pub struct Opt {
    /// Zero means connect without a timeout.
    pub connect_timeout: Duration,
    pub serialize_type: SerializeType,
    pub nodelay: Option<bool>,
    pub tls: Option<ClientTlsConfig>,
}

impl Default for Opt {
    fn default() -> Self {
        Opt {
            connect_timeout: Duration::ZERO,
            serialize_type: SerializeType::Json,
            nodelay: None,
            tls: None,
        }
    }
}

trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

type CallMap = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<Inbound>>>>;

/// One transport channel to one server. Calls multiplex over it by sequence
/// number; the reader task routes inbound frames to the owning session.
pub struct Client {
    opt: Opt,
    addr: String,
    seq: AtomicU64,
    writer_tx: mpsc::UnboundedSender<Vec<u8>>,
    calls: CallMap,
    closed: Arc<AtomicBool>,
}

impl Client {
    pub async fn connect(addr: &str, opt: Opt) -> Result<Client> {
        let stream = if opt.connect_timeout.is_zero() {
            TcpStream::connect(addr).await?
        } else {
            time::timeout(opt.connect_timeout, TcpStream::connect(addr))
                .await
                .map_err(|_| {
                    Error::new(ErrorKind::Transport, format!("connect to {addr} timed out"))
                })??
        };
        if let Some(nodelay) = opt.nodelay {
            stream.set_nodelay(nodelay)?;
        }

        let transport: Box<dyn Transport> = match &opt.tls {
            Some(tls) => {
                let config = tls.build()?;
                let connector = TlsConnector::from(Arc::new(config));
                let stream = connector
                    .connect(tls.server_name()?, stream)
                    .await
                    .map_err(|err| Error::new(ErrorKind::Security, err))?;
                Box::new(stream)
            }
            None => Box::new(stream),
        };

        let (read_half, write_half) = io::split(transport);
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let calls: CallMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(write_loop(write_half, writer_rx));
        tokio::spawn(read_loop(read_half, calls.clone(), closed.clone()));

        Ok(Client {
            opt,
            addr: addr.to_owned(),
            seq: AtomicU64::new(0),
            writer_tx,
            calls,
            closed,
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn serialize_type(&self) -> SerializeType {
        self.opt.serialize_type
    }

    /// Whether the transport channel is known to be gone. New calls on a
    /// closed client fail immediately with `Transport`.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Opens a call of the given shape and returns its session. The remaining
    /// deadline, if any, travels to the server as metadata so both sides
    /// enforce the same budget.
    pub fn call_session(
        &self,
        service_path: &str,
        service_method: &str,
        shape: CallShape,
        mut metadata: Metadata,
        timeout: Option<Duration>,
    ) -> Result<Session> {
        if self.is_closed() {
            return Err(Error::new(
                ErrorKind::Transport,
                format!("connection to {} is closed", self.addr),
            ));
        }

        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let deadline = timeout.map(|t| Instant::now() + t);
        if let Some(t) = timeout {
            metadata.insert(METADATA_TIMEOUT_MS.to_owned(), t.as_millis().to_string());
        }

        let (session, in_tx, mut out_rx) = Session::new(shape, Role::Client, deadline);
        {
            let mut calls = self.calls.lock().unwrap();
            calls.insert(seq, in_tx);
        }

        let mut template = Message::new();
        template.set_message_type(MessageType::Request);
        template.set_serialize_type(self.opt.serialize_type);
        template.set_call_shape(shape);
        template.set_seq(seq);
        template.service_path = service_path.to_owned();
        template.service_method = service_method.to_owned();
        template.metadata = metadata;

        let writer_tx = self.writer_tx.clone();
        tokio::spawn(async move {
            while let Some(out) = out_rx.recv().await {
                let mut frame = template.clone();
                if let Some(status) = out.status {
                    frame.set_message_status_type(MessageStatusType::Error);
                    frame.set_end_of_stream(true);
                    frame.payload = status.to_status_payload();
                    let _ = writer_tx.send(frame.encode());
                    break;
                }
                if let Some(payload) = out.payload {
                    frame.payload = payload;
                    if writer_tx.send(frame.encode()).is_err() {
                        break;
                    }
                    continue;
                }
                if out.end_of_stream {
                    frame.set_end_of_stream(true);
                    let _ = writer_tx.send(frame.encode());
                    break;
                }
            }
        });

        Ok(session)
    }

    /// One-shot raw call: sends a single payload and waits for the single
    /// response.
    pub async fn unary(
        &self,
        service_path: &str,
        service_method: &str,
        payload: Vec<u8>,
        metadata: Metadata,
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>> {
        let mut session =
            self.call_session(service_path, service_method, CallShape::Unary, metadata, timeout)?;
        session.send(payload)?;
        session.finish().await
    }
}

async fn write_loop<W>(mut w: io::WriteHalf<W>, mut rx: mpsc::UnboundedReceiver<Vec<u8>>)
where
    W: AsyncWrite + Send,
{
    while let Some(frame) = rx.recv().await {
        if let Err(err) = w.write_all(&frame).await {
            debug!(error = %err, "write failed, dropping connection writer");
            return;
        }
    }
}

async fn read_loop<R>(mut r: io::ReadHalf<R>, calls: CallMap, closed: Arc<AtomicBool>)
where
    R: AsyncRead + Send,
{
    loop {
        let msg = match Message::read_from(&mut r).await {
            Ok(msg) => msg,
            Err(err) => {
                debug!(error = %err, "read failed, failing in-flight calls");
                closed.store(true, Ordering::SeqCst);
                let mut calls = calls.lock().unwrap();
                for (_, tx) in calls.drain() {
                    let _ = tx.send(Inbound::Fault(Error::new(
                        ErrorKind::Transport,
                        "connection lost",
                    )));
                }
                return;
            }
        };

        let seq = msg.get_seq();
        let mut calls = calls.lock().unwrap();
        if msg.get_message_status_type() == Some(MessageStatusType::Error) {
            if let Some(tx) = calls.remove(&seq) {
                let _ = tx.send(Inbound::Fault(Error::from_status_payload(&msg.payload)));
            }
        } else if msg.is_end_of_stream() {
            if let Some(tx) = calls.remove(&seq) {
                let _ = tx.send(Inbound::Eos);
            }
        } else if let Some(tx) = calls.get(&seq) {
            let _ = tx.send(Inbound::Payload(msg.payload));
        }
        // frames for unknown calls are late arrivals after local termination
    }
}
