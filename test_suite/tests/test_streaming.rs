#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    };

    use serde::{Deserialize, Serialize};

    use durpc::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct ArithArgs {
        a: u64,
        b: u64,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct ArithReply {
        c: u64,
    }

    async fn add(_ctx: Context, args: ArithArgs) -> Result<ArithReply> {
        Ok(ArithReply { c: args.a + args.b })
    }

    async fn sleepy_add(_ctx: Context, args: ArithArgs) -> Result<ArithReply> {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(ArithReply { c: args.a + args.b })
    }

    async fn countdown(_ctx: Context, from: u64, mut stream: CallStream) -> Result<()> {
        for n in (0..from).rev() {
            stream.send(&n)?;
        }
        Ok(())
    }

    async fn sum(_ctx: Context, mut stream: CallStream) -> Result<u64> {
        let mut total = 0u64;
        while let Some(n) = stream.recv::<u64>().await? {
            total += n;
        }
        Ok(total)
    }

    async fn echo(_ctx: Context, mut stream: CallStream) -> Result<()> {
        while let Some(line) = stream.recv::<String>().await? {
            stream.send(&line)?;
        }
        Ok(())
    }

    async fn start_server() -> (SocketAddr, Server) {
        let mut server = Server::new("127.0.0.1:0");
        server.register_unary("Arith", "Add", add);
        server.register_unary("Arith", "SleepyAdd", sleepy_add);
        server.register_server_streaming("Stream", "Countdown", countdown);
        server.register_client_streaming("Stream", "Sum", sum);
        server.register_bidirectional("Stream", "Echo", echo);
        let addr = server.bind().await.unwrap();
        server.start().await.unwrap();
        (addr, server)
    }

    fn xclient_for(addr: SocketAddr, service_path: &str) -> BalancedClient {
        let resolver = Arc::new(StaticResolver::new(vec![Address::new(addr.to_string())]));
        BalancedClient::new(
            service_path,
            FailMode::Failfast,
            resolver,
            Box::new(RoundRobinBalancer::new()),
            Opt::default(),
        )
    }

    #[tokio::test]
    async fn unary_round_trip() {
        let (addr, _server) = start_server().await;
        let xclient = xclient_for(addr, "Arith");
        let reply: ArithReply = xclient
            .unary("Add", &ArithArgs { a: 7, b: 35 }, Metadata::new(), None)
            .await
            .unwrap();
        assert_eq!(42, reply.c);
    }

    #[tokio::test]
    async fn unknown_method_reports_not_found() {
        let (addr, _server) = start_server().await;
        let xclient = xclient_for(addr, "Arith");
        let err = xclient
            .unary::<ArithArgs, ArithReply>(
                "Nope",
                &ArithArgs { a: 1, b: 2 },
                Metadata::new(),
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::NotFound, err.kind());
    }

    #[tokio::test]
    async fn server_streaming_preserves_order_then_ends_once() {
        let (addr, _server) = start_server().await;
        let xclient = xclient_for(addr, "Stream");
        let mut call = xclient
            .server_streaming::<u64, u64>("Countdown", &5, Metadata::new(), None)
            .await
            .unwrap();

        let mut got = Vec::new();
        while let Some(n) = call.recv().await.unwrap() {
            got.push(n);
        }
        assert_eq!(vec![4, 3, 2, 1, 0], got);

        // the end of the stream is reported exactly once
        let err = call.recv().await.unwrap_err();
        assert_eq!(ErrorKind::SessionClosed, err.kind());
    }

    #[tokio::test]
    async fn client_streaming_sums_everything_sent() {
        let (addr, _server) = start_server().await;
        let xclient = xclient_for(addr, "Stream");
        let mut call = xclient
            .client_streaming::<u64, u64>("Sum", Metadata::new(), None)
            .await
            .unwrap();
        for n in 1..=10u64 {
            call.send(&n).unwrap();
        }
        assert_eq!(55, call.finish().await.unwrap());
    }

    #[tokio::test]
    async fn client_streaming_with_no_messages_is_valid() {
        let (addr, _server) = start_server().await;
        let xclient = xclient_for(addr, "Stream");
        let call = xclient
            .client_streaming::<u64, u64>("Sum", Metadata::new(), None)
            .await
            .unwrap();
        assert_eq!(0, call.finish().await.unwrap());
    }

    #[tokio::test]
    async fn bidirectional_echoes_in_order() {
        let (addr, _server) = start_server().await;
        let xclient = xclient_for(addr, "Stream");
        let mut call = xclient
            .bidirectional::<String, String>("Echo", Metadata::new(), None)
            .await
            .unwrap();

        for word in ["uno", "dos", "tres"] {
            call.send(&word.to_owned()).unwrap();
            assert_eq!(word, call.recv().await.unwrap().unwrap());
        }
        call.close_send();
        assert!(call.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn deadline_cuts_off_a_slow_handler() {
        let (addr, _server) = start_server().await;
        let xclient = xclient_for(addr, "Arith");
        let err = xclient
            .unary::<ArithArgs, ArithReply>(
                "SleepyAdd",
                &ArithArgs { a: 1, b: 2 },
                Metadata::new(),
                Some(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::DeadlineExceeded, err.kind());
    }

    #[tokio::test]
    async fn generous_deadline_does_not_fire() {
        let (addr, _server) = start_server().await;
        let xclient = xclient_for(addr, "Arith");
        let reply: ArithReply = xclient
            .unary(
                "SleepyAdd",
                &ArithArgs { a: 1, b: 2 },
                Metadata::new(),
                Some(Duration::from_secs(5)),
            )
            .await
            .unwrap();
        assert_eq!(3, reply.c);
    }

    #[tokio::test]
    async fn cancel_unblocks_a_streaming_call() {
        let (addr, _server) = start_server().await;
        let xclient = xclient_for(addr, "Stream");
        let mut call = xclient
            .bidirectional::<String, String>("Echo", Metadata::new(), None)
            .await
            .unwrap();
        let handle = call.cancel_handle();

        let waiter = tokio::spawn(async move { call.recv().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();

        let err = waiter.await.unwrap().unwrap_err();
        assert_eq!(ErrorKind::Cancelled, err.kind());
    }

    #[tokio::test]
    async fn cancelling_before_any_send_never_runs_the_handler() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut server = Server::new("127.0.0.1:0");
        let counter = hits.clone();
        server.register_bidirectional("Stream", "Echo", move |_ctx, mut stream: CallStream| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                while let Some(line) = stream.recv::<String>().await? {
                    stream.send(&line)?;
                }
                Ok(())
            }
        });
        let addr = server.bind().await.unwrap();
        server.start().await.unwrap();
        let xclient = xclient_for(addr, "Stream");

        let mut call = xclient
            .bidirectional::<String, String>("Echo", Metadata::new(), None)
            .await
            .unwrap();
        call.cancel_handle().cancel();
        let err = call.recv().await.unwrap_err();
        assert_eq!(ErrorKind::Cancelled, err.kind());

        // the only frame the server ever saw was the cancel status
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(0, hits.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn msgpack_encoding_round_trips() {
        let (addr, _server) = start_server().await;
        let resolver = Arc::new(StaticResolver::new(vec![Address::new(addr.to_string())]));
        let opt = Opt {
            serialize_type: SerializeType::MsgPack,
            ..Default::default()
        };
        let xclient = BalancedClient::new(
            "Arith",
            FailMode::Failfast,
            resolver,
            Box::new(RoundRobinBalancer::new()),
            opt,
        );
        let reply: ArithReply = xclient
            .unary("Add", &ArithArgs { a: 20, b: 22 }, Metadata::new(), None)
            .await
            .unwrap();
        assert_eq!(42, reply.c);
    }

    #[tokio::test]
    async fn calls_multiplex_on_one_connection() {
        let (addr, _server) = start_server().await;
        let xclient = Arc::new(xclient_for(addr, "Arith"));

        let mut handles = Vec::new();
        for i in 0..20u64 {
            let xclient = xclient.clone();
            handles.push(tokio::spawn(async move {
                let reply: ArithReply = xclient
                    .unary("Add", &ArithArgs { a: i, b: i }, Metadata::new(), None)
                    .await
                    .unwrap();
                assert_eq!(i * 2, reply.c);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
