use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::EnvFilter;

use durpc_protocol::{Error, ErrorKind, Result};
use durpc_server::{CallStream, Context, Logging, Recovery, Server};

#[derive(Debug, Serialize, Deserialize)]
struct ArithArgs {
    a: u64,
    b: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ArithReply {
    c: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct CountdownArgs {
    from: u64,
}

async fn add(_ctx: Context, args: ArithArgs) -> Result<ArithReply> {
    args.a
        .checked_add(args.b)
        .map(|c| ArithReply { c })
        .ok_or_else(|| Error::new(ErrorKind::Other, "sum overflows"))
}

async fn countdown(_ctx: Context, args: CountdownArgs, mut stream: CallStream) -> Result<()> {
    for n in (0..=args.from).rev() {
        stream.send(&n)?;
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut server = Server::new("0.0.0.0:8972");
    server.add_interceptor(Arc::new(Recovery));
    server.add_interceptor(Arc::new(Logging));
    server.register_unary("Arith", "Add", add);
    server.register_server_streaming("Arith", "Countdown", countdown);

    server.start().await?;
    info!("serving on {}", server.addr);
    // run until interrupted
    tokio::signal::ctrl_c().await?;
    server.close();
    Ok(())
}
