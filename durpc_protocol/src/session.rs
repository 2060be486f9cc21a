use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use futures::future;
use tokio::{
    sync::{mpsc, Notify},
    time::{self, Instant},
};

use crate::{CallShape, Error, ErrorKind, Result};

/// Which side of the call owns this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// One item arriving on the receive direction of a session. Produced by the
/// connection layer that owns the transport channel.
#[derive(Debug)]
pub enum Inbound {
    Payload(Vec<u8>),
    /// The peer half-closed; delivered to `recv` exactly once as `Ok(None)`.
    Eos,
    /// Terminal failure, e.g. an error status from the peer or a broken channel.
    Fault(Error),
}

/// One frame leaving the session. The connection layer turns these into wire
/// messages; exactly one of the three fields is meaningful per item.
#[derive(Debug)]
pub struct Outgoing {
    pub payload: Option<Vec<u8>>,
    pub end_of_stream: bool,
    pub status: Option<Error>,
}

impl Outgoing {
    pub fn payload(payload: Vec<u8>) -> Self {
        Outgoing {
            payload: Some(payload),
            end_of_stream: false,
            status: None,
        }
    }

    pub fn eos() -> Self {
        Outgoing {
            payload: None,
            end_of_stream: true,
            status: None,
        }
    }

    pub fn status(err: Error) -> Self {
        Outgoing {
            payload: None,
            end_of_stream: true,
            status: Some(err),
        }
    }
}

/// Clonable handle that aborts a call from outside the session owner,
/// unblocking any pending `send`/`recv` with `Cancelled`.
#[derive(Clone, Default)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

#[derive(Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelHandle {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn cancel(&self) {
        if !self.inner.flag.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    pub async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // register the waiter before re-checking, so a wakeup between the
            // check and the await is not lost
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

/// Completion handle for a session whose ownership moved elsewhere.
/// Shares the half-close flag with the session, so completing through the
/// handle and through the session stays idempotent.
#[derive(Clone)]
pub struct SessionHandle {
    sent_eos: Arc<AtomicBool>,
    outbound: mpsc::UnboundedSender<Outgoing>,
}

impl SessionHandle {
    /// Half-closes the send direction.
    pub fn close(&self) {
        if !self.sent_eos.swap(true, Ordering::SeqCst) {
            let _ = self.outbound.send(Outgoing::eos());
        }
    }

    /// Terminates the call with an error status.
    pub fn abort(&self, err: Error) {
        if !self.sent_eos.swap(true, Ordering::SeqCst) {
            let _ = self.outbound.send(Outgoing::status(err));
        }
    }

    /// Sends the single reply of a unary/client-streaming call and half-closes.
    pub fn reply(&self, payload: Vec<u8>) {
        if !self.sent_eos.swap(true, Ordering::SeqCst) {
            let _ = self.outbound.send(Outgoing::payload(payload));
            let _ = self.outbound.send(Outgoing::eos());
        }
    }
}

/// One RPC invocation: a duplex state machine with independent send and
/// receive directions. Created by the connection layer on whichever side
/// initiated or accepted the call; destroyed once both directions are done.
pub struct Session {
    shape: CallShape,
    role: Role,
    deadline: Option<Instant>,
    cancel: CancelHandle,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    outbound: mpsc::UnboundedSender<Outgoing>,
    sent_eos: Arc<AtomicBool>,
    sent: u64,
    recv_done: bool,
    fault: Option<Error>,
}

enum Wake {
    Cancelled,
    Deadline,
    Item(Option<Inbound>),
}

impl Session {
    /// Builds a session plus the two channel ends the connection layer drives:
    /// a sender feeding the receive direction and a receiver draining the send
    /// direction.
    pub fn new(
        shape: CallShape,
        role: Role,
        deadline: Option<Instant>,
    ) -> (
        Session,
        mpsc::UnboundedSender<Inbound>,
        mpsc::UnboundedReceiver<Outgoing>,
    ) {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let session = Session {
            shape,
            role,
            deadline,
            cancel: CancelHandle::new(),
            inbound: in_rx,
            outbound: out_tx,
            sent_eos: Arc::new(AtomicBool::new(false)),
            sent: 0,
            recv_done: false,
            fault: None,
        };
        (session, in_tx, out_rx)
    }

    pub fn shape(&self) -> CallShape {
        self.shape
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn completer(&self) -> SessionHandle {
        SessionHandle {
            sent_eos: self.sent_eos.clone(),
            outbound: self.outbound.clone(),
        }
    }

    /// How many messages this side may send, per call shape.
    fn send_limit(&self) -> Option<u64> {
        match (self.role, self.shape) {
            (Role::Client, CallShape::Unary)
            | (Role::Client, CallShape::ServerStreaming)
            | (Role::Server, CallShape::Unary)
            | (Role::Server, CallShape::ClientStreaming) => Some(1),
            _ => None,
        }
    }

    fn check_alive(&mut self) -> Result<()> {
        if let Some(err) = &self.fault {
            return Err(err.clone());
        }
        if self.cancel.is_cancelled() {
            let err = Error::new(ErrorKind::Cancelled, "call cancelled");
            self.terminate(err.clone());
            return Err(err);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                let err = Error::new(ErrorKind::DeadlineExceeded, "deadline elapsed");
                self.terminate(err.clone());
                return Err(err);
            }
        }
        Ok(())
    }

    /// Enqueues one message for ordered delivery to the peer.
    pub fn send(&mut self, payload: Vec<u8>) -> Result<()> {
        self.check_alive()?;
        if self.sent_eos.load(Ordering::SeqCst) {
            return Err(Error::new(
                ErrorKind::SessionClosed,
                "send direction is half-closed",
            ));
        }
        if let Some(limit) = self.send_limit() {
            if self.sent >= limit {
                let err = Error::new(
                    ErrorKind::Protocol,
                    format!("{} permits one message in this direction", self.shape),
                );
                self.terminate(err.clone());
                return Err(err);
            }
        }
        self.outbound
            .send(Outgoing::payload(payload))
            .map_err(|_| Error::new(ErrorKind::Transport, "transport channel closed"))?;
        self.sent += 1;
        Ok(())
    }

    /// Waits for the next message from the peer. The peer's half-close is
    /// reported once as `Ok(None)`; a further `recv` fails with
    /// `SessionClosed`.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        self.check_alive()?;
        if self.recv_done {
            return Err(Error::new(
                ErrorKind::SessionClosed,
                "receive direction is closed",
            ));
        }

        let cancel = self.cancel.clone();
        let deadline = self.deadline;
        let wake = tokio::select! {
            _ = cancel.cancelled() => Wake::Cancelled,
            _ = deadline_elapsed(deadline) => Wake::Deadline,
            item = self.inbound.recv() => Wake::Item(item),
        };

        match wake {
            Wake::Cancelled => {
                let err = Error::new(ErrorKind::Cancelled, "call cancelled");
                self.terminate(err.clone());
                Err(err)
            }
            Wake::Deadline => {
                let err = Error::new(ErrorKind::DeadlineExceeded, "deadline elapsed");
                self.terminate(err.clone());
                Err(err)
            }
            Wake::Item(Some(Inbound::Payload(payload))) => Ok(Some(payload)),
            Wake::Item(Some(Inbound::Eos)) => {
                self.recv_done = true;
                Ok(None)
            }
            Wake::Item(Some(Inbound::Fault(err))) => {
                self.terminate(err.clone());
                Err(err)
            }
            Wake::Item(None) => {
                let err = Error::new(ErrorKind::Transport, "transport channel closed");
                self.terminate(err.clone());
                Err(err)
            }
        }
    }

    /// Half-closes the local send direction; idempotent.
    pub fn close_send(&mut self) {
        if !self.sent_eos.swap(true, Ordering::SeqCst) {
            let _ = self.outbound.send(Outgoing::eos());
        }
    }

    /// Terminates the call with an error status toward the peer.
    pub fn abort(&mut self, err: Error) {
        if self.fault.is_none() {
            self.fault = Some(err.clone());
        }
        if !self.sent_eos.swap(true, Ordering::SeqCst) {
            let _ = self.outbound.send(Outgoing::status(err));
        }
    }

    /// Client-side terminal step for the unary and client-streaming shapes:
    /// half-closes, waits for the single response, and drains to terminal.
    pub async fn finish(mut self) -> Result<Vec<u8>> {
        self.close_send();
        let reply = match self.recv().await? {
            Some(payload) => payload,
            None => {
                return Err(Error::new(
                    ErrorKind::Protocol,
                    "peer half-closed without a response",
                ))
            }
        };
        // consume the trailing end-of-stream marker
        let _ = self.recv().await;
        Ok(reply)
    }

    /// Marks both directions terminal. Errors that describe the call itself
    /// travel to the peer as a status; plain connectivity failures only
    /// half-close, since the channel they would travel on is gone.
    fn terminate(&mut self, err: Error) {
        if self.fault.is_none() {
            self.fault = Some(err.clone());
        }
        if !self.sent_eos.swap(true, Ordering::SeqCst) {
            let status = matches!(
                err.kind(),
                ErrorKind::DeadlineExceeded
                    | ErrorKind::Cancelled
                    | ErrorKind::Protocol
                    | ErrorKind::Handler
            )
            .then_some(err);
            let _ = self.outbound.send(Outgoing {
                payload: None,
                end_of_stream: true,
                status,
            });
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // a live completion handle owns termination once one exists
        if Arc::strong_count(&self.sent_eos) > 1 {
            return;
        }
        // a dropped session reads as a clean half-close to the peer
        if !self.sent_eos.swap(true, Ordering::SeqCst) {
            let _ = self.outbound.send(Outgoing::eos());
        }
    }
}

async fn deadline_elapsed(deadline: Option<Instant>) {
    match deadline {
        Some(at) => time::sleep_until(at).await,
        None => future::pending().await,
    }
}
