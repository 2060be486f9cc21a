use std::{any::Any, backtrace::Backtrace, net::SocketAddr, panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use tokio::time::Instant;
use tracing::{debug, error, info};

use durpc_protocol::{Error, ErrorKind, Metadata, Result, SerializeType};

/// Immutable call descriptor handed to handlers and interceptors.
#[derive(Debug, Clone)]
pub struct Context {
    pub service_path: String,
    pub service_method: String,
    pub metadata: Metadata,
    pub peer_addr: SocketAddr,
    pub deadline: Option<Instant>,
    pub serialize_type: SerializeType,
}

impl Context {
    pub fn full_method(&self) -> String {
        format!("{}.{}", self.service_path, self.service_method)
    }
}

/// The innermost step of a unary call: decode, run the handler, encode.
pub type UnaryFn =
    Arc<dyn Fn(Context, Vec<u8>) -> BoxFuture<'static, Result<Vec<u8>>> + Send + Sync>;

/// Wraps unary dispatch. Each interceptor sees the call before the handler
/// and its outcome after, and decides whether to run `next` at all.
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn handle(&self, ctx: &Context, req: Vec<u8>, next: Next<'_>) -> Result<Vec<u8>>;
}

/// The remainder of the chain. Consumed by `run`, so an interceptor cannot
/// invoke the rest of the chain twice.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Interceptor>],
    terminal: &'a UnaryFn,
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn Interceptor>], terminal: &'a UnaryFn) -> Self {
        Next { chain, terminal }
    }

    pub async fn run(self, ctx: &Context, req: Vec<u8>) -> Result<Vec<u8>> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                let next = Next {
                    chain: rest,
                    terminal: self.terminal,
                };
                head.handle(ctx, req, next).await
            }
            None => (self.terminal)(ctx.clone(), req).await,
        }
    }
}

/// Converts a panicking handler into a `Handler` error instead of taking the
/// connection down. The panic payload and a captured backtrace go to the log;
/// the peer only sees the error status.
pub struct Recovery;

#[async_trait]
impl Interceptor for Recovery {
    async fn handle(&self, ctx: &Context, req: Vec<u8>, next: Next<'_>) -> Result<Vec<u8>> {
        match AssertUnwindSafe(next.run(ctx, req)).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => {
                let reason = panic_reason(&*panic);
                error!(
                    method = %ctx.full_method(),
                    reason = %reason,
                    backtrace = %Backtrace::force_capture(),
                    "handler panicked"
                );
                Err(Error::new(
                    ErrorKind::Handler,
                    format!("handler panicked: {reason}"),
                ))
            }
        }
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Logs one line on the way in and one on the way out of each unary call.
/// The encoded payloads themselves are recorded at debug level.
pub struct Logging;

#[async_trait]
impl Interceptor for Logging {
    async fn handle(&self, ctx: &Context, req: Vec<u8>, next: Next<'_>) -> Result<Vec<u8>> {
        let method = ctx.full_method();
        info!(method = %method, request_bytes = req.len(), "handling call");
        debug!(method = %method, request = %String::from_utf8_lossy(&req), "request payload");
        let result = next.run(ctx, req).await;
        match &result {
            Ok(reply) => {
                info!(method = %method, response_bytes = reply.len(), "call finished");
                debug!(
                    method = %method,
                    response = %String::from_utf8_lossy(reply),
                    "response payload"
                );
            }
            Err(err) => info!(method = %method, error = %err, "call failed"),
        }
        result
    }
}
