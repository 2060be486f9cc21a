pub mod interceptor;

pub use interceptor::*;

use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    sync::{Arc, RwLock},
    time::Duration,
};

use futures::future::{BoxFuture, FutureExt};
use tokio::{
    io::{self, AsyncRead, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
    time::Instant,
};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use durpc_protocol::{
    CancelHandle, Error, ErrorKind, Inbound, Message, MessageStatusType, MessageType, Result,
    Role, RpcParam, SerializeType, ServerTlsConfig, Session, SessionHandle, METADATA_TIMEOUT_MS,
};

trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

/// Body of a streaming handler. The wrapper installed at registration time
/// completes the call, so the future itself returns nothing.
pub type StreamingFn = Arc<dyn Fn(Context, CallStream) -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone)]
pub enum Handler {
    Unary(UnaryFn),
    ServerStreaming(StreamingFn),
    ClientStreaming(StreamingFn),
    Bidirectional(StreamingFn),
}

/// Typed view of one call's session, handed to streaming handlers.
pub struct CallStream {
    session: Session,
    st: SerializeType,
}

impl CallStream {
    pub fn serialize_type(&self) -> SerializeType {
        self.st
    }

    /// Next request message, or `None` once the client half-closes.
    pub async fn recv<A: RpcParam>(&mut self) -> Result<Option<A>> {
        match self.session.recv().await? {
            Some(payload) => Ok(Some(A::from_slice(self.st, &payload)?)),
            None => Ok(None),
        }
    }

    pub fn send<R: RpcParam>(&mut self, reply: &R) -> Result<()> {
        self.session.send(reply.into_bytes(self.st)?)
    }

    pub fn close_send(&mut self) {
        self.session.close_send();
    }

    pub fn completer(&self) -> SessionHandle {
        self.session.completer()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.session.cancel_handle()
    }
}

type ServiceMap = Arc<RwLock<HashMap<String, Handler>>>;

/// Accepts connections and dispatches calls to registered handlers.
///
/// Handlers register under `service_path.service_method`. Interceptors wrap
/// unary dispatch in registration order; the snapshot taken at `start` is
/// what connections use.
pub struct Server {
    pub addr: String,
    services: ServiceMap,
    interceptors: Vec<Arc<dyn Interceptor>>,
    tls: Option<ServerTlsConfig>,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    shutdown: watch::Sender<bool>,
}

impl Server {
    pub fn new(addr: impl Into<String>) -> Server {
        let (shutdown, _) = watch::channel(false);
        Server {
            addr: addr.into(),
            services: Arc::new(RwLock::new(HashMap::new())),
            interceptors: Vec::new(),
            tls: None,
            listener: None,
            local_addr: None,
            shutdown,
        }
    }

    /// Requires and verifies client certificates on every connection.
    pub fn set_tls(&mut self, tls: ServerTlsConfig) {
        self.tls = Some(tls);
    }

    pub fn add_interceptor(&mut self, interceptor: Arc<dyn Interceptor>) {
        self.interceptors.push(interceptor);
    }

    pub fn register(&mut self, service_path: &str, service_method: &str, handler: Handler) {
        let key = format!("{service_path}.{service_method}");
        let mut services = self.services.write().unwrap();
        services.insert(key, handler);
    }

    pub fn register_unary<A, R, F, Fut>(&mut self, service_path: &str, service_method: &str, f: F)
    where
        A: RpcParam + Send + 'static,
        R: RpcParam + Send + 'static,
        F: Fn(Context, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: UnaryFn = Arc::new(move |ctx: Context, req: Vec<u8>| {
            let f = f.clone();
            async move {
                let st = ctx.serialize_type;
                let args = A::from_slice(st, &req)?;
                let reply = f(ctx, args).await?;
                reply.into_bytes(st)
            }
            .boxed()
        });
        self.register(service_path, service_method, Handler::Unary(handler));
    }

    pub fn register_server_streaming<A, F, Fut>(
        &mut self,
        service_path: &str,
        service_method: &str,
        f: F,
    ) where
        A: RpcParam + Send + 'static,
        F: Fn(Context, A, CallStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: StreamingFn = Arc::new(move |ctx, mut stream| {
            let f = f.clone();
            async move {
                let completer = stream.completer();
                let args = match stream.recv::<A>().await {
                    Ok(Some(args)) => args,
                    Ok(None) => {
                        completer.abort(Error::new(
                            ErrorKind::Protocol,
                            "call ended without a request message",
                        ));
                        return;
                    }
                    Err(_) => return,
                };
                match f(ctx, args, stream).await {
                    Ok(()) => completer.close(),
                    Err(err) => completer.abort(err),
                }
            }
            .boxed()
        });
        self.register(service_path, service_method, Handler::ServerStreaming(handler));
    }

    pub fn register_client_streaming<R, F, Fut>(
        &mut self,
        service_path: &str,
        service_method: &str,
        f: F,
    ) where
        R: RpcParam + Send + 'static,
        F: Fn(Context, CallStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: StreamingFn = Arc::new(move |ctx, stream| {
            let f = f.clone();
            async move {
                let st = stream.serialize_type();
                let completer = stream.completer();
                match f(ctx, stream).await {
                    Ok(reply) => match reply.into_bytes(st) {
                        Ok(bytes) => completer.reply(bytes),
                        Err(err) => completer.abort(err),
                    },
                    Err(err) => completer.abort(err),
                }
            }
            .boxed()
        });
        self.register(service_path, service_method, Handler::ClientStreaming(handler));
    }

    pub fn register_bidirectional<F, Fut>(&mut self, service_path: &str, service_method: &str, f: F)
    where
        F: Fn(Context, CallStream) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let f = Arc::new(f);
        let handler: StreamingFn = Arc::new(move |ctx, stream| {
            let f = f.clone();
            async move {
                let completer = stream.completer();
                match f(ctx, stream).await {
                    Ok(()) => completer.close(),
                    Err(err) => completer.abort(err),
                }
            }
            .boxed()
        });
        self.register(service_path, service_method, Handler::Bidirectional(handler));
    }

    /// Binds the listening socket without accepting yet, so callers can learn
    /// the actual port when binding to port zero.
    pub async fn bind(&mut self) -> Result<SocketAddr> {
        let listener = TcpListener::bind(&self.addr).await?;
        let local = listener.local_addr()?;
        self.listener = Some(listener);
        self.local_addr = Some(local);
        Ok(local)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Starts accepting connections in a background task.
    pub async fn start(&mut self) -> Result<()> {
        let listener = match self.listener.take() {
            Some(listener) => listener,
            None => {
                let listener = TcpListener::bind(&self.addr).await?;
                self.local_addr = Some(listener.local_addr()?);
                listener
            }
        };
        let acceptor = match &self.tls {
            Some(tls) => Some(TlsAcceptor::from(Arc::new(tls.build()?))),
            None => None,
        };
        let services = self.services.clone();
        let interceptors: Arc<Vec<Arc<dyn Interceptor>>> = Arc::new(self.interceptors.clone());
        let mut shutdown = self.shutdown.subscribe();

        info!(addr = %self.addr, tls = acceptor.is_some(), "server listening");
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            debug!(peer = %peer, "accepted connection");
                            tokio::spawn(handle_connection(
                                stream,
                                peer,
                                acceptor.clone(),
                                services.clone(),
                                interceptors.clone(),
                            ));
                        }
                        Err(err) => warn!(error = %err, "accept failed"),
                    },
                }
            }
        });
        Ok(())
    }

    /// Stops accepting new connections. Calls in flight on existing
    /// connections run to completion.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    services: ServiceMap,
    interceptors: Arc<Vec<Arc<dyn Interceptor>>>,
) {
    let transport: Box<dyn Transport> = match acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(stream) => Box::new(stream),
            Err(err) => {
                warn!(peer = %peer, error = %err, "handshake failed");
                return;
            }
        },
        None => Box::new(stream),
    };
    let (mut read_half, write_half) = io::split(transport);
    let (writer_tx, writer_rx) = mpsc::unbounded_channel();
    tokio::spawn(write_loop(write_half, writer_rx));

    let mut calls: HashMap<u64, mpsc::UnboundedSender<Inbound>> = HashMap::new();
    loop {
        let msg = match Message::read_from(&mut read_half).await {
            Ok(msg) => msg,
            Err(err) => {
                debug!(peer = %peer, error = %err, "connection closed");
                break;
            }
        };
        let seq = msg.get_seq();
        if calls.contains_key(&seq) {
            route_continuation(&mut calls, seq, msg);
            continue;
        }
        if msg.get_message_status_type() == Some(MessageStatusType::Error) {
            // a status frame ends a call, it never opens one; a cancel can
            // arrive before any payload, or trail a call already cleaned up
            debug!(peer = %peer, seq, "dropping status frame for an unknown call");
            continue;
        }
        dispatch_call(msg, peer, &services, &interceptors, &writer_tx, &mut calls);
    }

    for (_, tx) in calls.drain() {
        let _ = tx.send(Inbound::Fault(Error::new(
            ErrorKind::Transport,
            "connection lost",
        )));
    }
}

fn route_continuation(
    calls: &mut HashMap<u64, mpsc::UnboundedSender<Inbound>>,
    seq: u64,
    msg: Message,
) {
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
}

fn dispatch_call(
    msg: Message,
    peer: SocketAddr,
    services: &ServiceMap,
    interceptors: &Arc<Vec<Arc<dyn Interceptor>>>,
    writer_tx: &mpsc::UnboundedSender<Vec<u8>>,
    calls: &mut HashMap<u64, mpsc::UnboundedSender<Inbound>>,
) {
    let seq = msg.get_seq();
    let key = format!("{}.{}", msg.service_path, msg.service_method);
    let handler = {
        let services = services.read().unwrap();
        services.get(&key).cloned()
    };
    let handler = match handler {
        Some(handler) => handler,
        None => {
            respond_error(
                writer_tx,
                &msg,
                Error::new(ErrorKind::NotFound, format!("{key} is not registered")),
            );
            return;
        }
    };
    let (shape, st) = match (msg.get_call_shape(), msg.get_serialize_type()) {
        (Some(shape), Some(st)) => (shape, st),
        _ => {
            respond_error(
                writer_tx,
                &msg,
                Error::new(ErrorKind::Protocol, "unknown call shape or serialize type"),
            );
            return;
        }
    };
    let deadline = msg
        .metadata
        .get(METADATA_TIMEOUT_MS)
        .and_then(|v| v.parse::<u64>().ok())
        .map(|ms| Instant::now() + Duration::from_millis(ms));

    let (session, in_tx, mut out_rx) = Session::new(shape, Role::Server, deadline);

    let mut template = Message::new();
    template.set_message_type(MessageType::Response);
    template.set_serialize_type(st);
    template.set_call_shape(shape);
    template.set_seq(seq);
    let pump_tx = writer_tx.clone();
    tokio::spawn(async move {
        while let Some(out) = out_rx.recv().await {
            let mut frame = template.clone();
            if let Some(status) = out.status {
                frame.set_message_status_type(MessageStatusType::Error);
                frame.set_end_of_stream(true);
                frame.payload = status.to_status_payload();
                let _ = pump_tx.send(frame.encode());
                break;
            }
            if let Some(payload) = out.payload {
                frame.payload = payload;
                if pump_tx.send(frame.encode()).is_err() {
                    break;
                }
                continue;
            }
            if out.end_of_stream {
                frame.set_end_of_stream(true);
                let _ = pump_tx.send(frame.encode());
                break;
            }
        }
    });

    let ctx = Context {
        service_path: msg.service_path.clone(),
        service_method: msg.service_method.clone(),
        metadata: msg.metadata.clone(),
        peer_addr: peer,
        deadline,
        serialize_type: st,
    };

    if msg.is_end_of_stream() {
        let _ = in_tx.send(Inbound::Eos);
    } else {
        let _ = in_tx.send(Inbound::Payload(msg.payload));
        calls.insert(seq, in_tx);
    }

    match handler {
        Handler::Unary(f) => {
            let interceptors = interceptors.clone();
            tokio::spawn(run_unary(session, ctx, f, interceptors));
        }
        Handler::ServerStreaming(f) | Handler::ClientStreaming(f) | Handler::Bidirectional(f) => {
            tokio::spawn(f(ctx, CallStream { session, st }));
        }
    }
}

async fn run_unary(
    mut session: Session,
    ctx: Context,
    f: UnaryFn,
    interceptors: Arc<Vec<Arc<dyn Interceptor>>>,
) {
    let req = match session.recv().await {
        Ok(Some(payload)) => payload,
        Ok(None) => {
            session.abort(Error::new(
                ErrorKind::Protocol,
                "call ended without a request message",
            ));
            return;
        }
        // termination already sent whatever status applies
        Err(_) => return,
    };
    match Next::new(&interceptors, &f).run(&ctx, req).await {
        Ok(reply) => {
            if session.send(reply).is_ok() {
                session.close_send();
            }
        }
        Err(err) => session.abort(err),
    }
}

/// Writes a terminal error frame for a call that never got a session.
fn respond_error(writer_tx: &mpsc::UnboundedSender<Vec<u8>>, msg: &Message, err: Error) {
    let mut frame = Message::new();
    frame.set_message_type(MessageType::Response);
    frame.set_message_status_type(MessageStatusType::Error);
    frame.set_end_of_stream(true);
    frame.set_seq(msg.get_seq());
    if let Some(st) = msg.get_serialize_type() {
        frame.set_serialize_type(st);
    }
    if let Some(shape) = msg.get_call_shape() {
        frame.set_call_shape(shape);
    }
    frame.payload = err.to_status_payload();
    let _ = writer_tx.send(frame.encode());
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
