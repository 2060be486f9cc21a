#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::Arc};

    use serde::{Deserialize, Serialize};

    use durpc::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct Empty {}

    #[derive(Debug, Serialize, Deserialize)]
    struct WhoAmI {
        id: u64,
    }

    async fn start_tagged_server(id: u64) -> (SocketAddr, Server) {
        let mut server = Server::new("127.0.0.1:0");
        server.register_unary("Meta", "WhoAmI", move |_ctx: Context, _args: Empty| async move {
            Ok(WhoAmI { id })
        });
        let addr = server.bind().await.unwrap();
        server.start().await.unwrap();
        (addr, server)
    }

    #[tokio::test]
    async fn round_robin_spreads_calls_evenly() {
        let (addr_a, _server_a) = start_tagged_server(1).await;
        let (addr_b, _server_b) = start_tagged_server(2).await;

        let resolver = Arc::new(StaticResolver::new(vec![
            Address::new(addr_a.to_string()),
            Address::new(addr_b.to_string()),
        ]));
        let xclient = BalancedClient::new(
            "Meta",
            FailMode::Failfast,
            resolver,
            Box::new(RoundRobinBalancer::new()),
            Opt::default(),
        );

        let mut seen = [0u32; 2];
        for _ in 0..10 {
            let reply: WhoAmI = xclient
                .unary("WhoAmI", &Empty {}, Metadata::new(), None)
                .await
                .unwrap();
            seen[(reply.id - 1) as usize] += 1;
        }
        assert_eq!([5, 5], seen);
    }

    #[tokio::test]
    async fn failover_retries_on_another_address() {
        let (addr, _server) = start_tagged_server(7).await;
        // one dead address, one live; failover keeps picking until it lands
        let resolver = Arc::new(StaticResolver::new(vec![
            Address::new("127.0.0.1:1".to_owned()),
            Address::new(addr.to_string()),
        ]));
        let xclient = BalancedClient::new(
            "Meta",
            FailMode::Failover,
            resolver,
            Box::new(RoundRobinBalancer::new()),
            Opt::default(),
        );

        for _ in 0..4 {
            let reply: WhoAmI = xclient
                .unary("WhoAmI", &Empty {}, Metadata::new(), None)
                .await
                .unwrap();
            assert_eq!(7, reply.id);
        }
    }

    #[tokio::test]
    async fn failfast_reports_the_first_connect_error() {
        let resolver = Arc::new(StaticResolver::new(vec![Address::new("127.0.0.1:1")]));
        let xclient = BalancedClient::new(
            "Meta",
            FailMode::Failfast,
            resolver,
            Box::new(RoundRobinBalancer::new()),
            Opt::default(),
        );
        let err = xclient
            .unary::<Empty, WhoAmI>("WhoAmI", &Empty {}, Metadata::new(), None)
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::Transport, err.kind());
    }

    #[tokio::test]
    async fn empty_resolver_means_no_addresses() {
        let resolver = Arc::new(StaticResolver::new(vec![]));
        let xclient = BalancedClient::new(
            "Meta",
            FailMode::Failover,
            resolver,
            Box::new(RoundRobinBalancer::new()),
            Opt::default(),
        );
        let err = xclient
            .unary::<Empty, WhoAmI>("WhoAmI", &Empty {}, Metadata::new(), None)
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::NoAddressesAvailable, err.kind());
    }

    #[tokio::test]
    async fn registry_builds_a_static_resolver_from_a_target() {
        let (addr, _server) = start_tagged_server(3).await;
        let registry = ResolverRegistry::default();
        let resolver = registry
            .build(&format!("static://{addr}"))
            .unwrap();
        let xclient = BalancedClient::new(
            "Meta",
            FailMode::Failfast,
            resolver,
            Box::new(RoundRobinBalancer::new()),
            Opt::default(),
        );
        let reply: WhoAmI = xclient
            .unary("WhoAmI", &Empty {}, Metadata::new(), None)
            .await
            .unwrap();
        assert_eq!(3, reply.id);
    }
}
