use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use durpc_client::{Address, BalancedClient, FailMode, Opt, RoundRobinBalancer, StaticResolver};
use durpc_protocol::Metadata;

#[derive(Debug, Serialize, Deserialize)]
struct ArithArgs {
    a: u64,
    b: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ArithReply {
    c: u64,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let resolver = Arc::new(StaticResolver::new(vec![Address::new("127.0.0.1:8972")]));
    let xclient = BalancedClient::new(
        "Arith",
        FailMode::Failover,
        resolver,
        Box::new(RoundRobinBalancer::new()),
        Opt::default(),
    );

    for i in 0u64..10 {
        let args = ArithArgs { a: i, b: 10 };
        match xclient
            .unary::<ArithArgs, ArithReply>(
                "Add",
                &args,
                Metadata::new(),
                Some(Duration::from_secs(3)),
            )
            .await
        {
            Ok(reply) => info!(a = args.a, b = args.b, c = reply.c, "added"),
            Err(err) => error!(error = %err, "call failed"),
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }
}
