#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::Arc};

    use rcgen::{
        BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa,
        KeyPair,
    };
    use serde::{Deserialize, Serialize};

    use durpc::*;

    #[derive(Debug, Serialize, Deserialize)]
    struct Ping {
        n: u64,
    }

    async fn pong(_ctx: Context, args: Ping) -> Result<Ping> {
        Ok(Ping { n: args.n + 1 })
    }

    fn make_ca(name: &str) -> (Certificate, KeyPair) {
        let mut params = CertificateParams::default();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.distinguished_name.push(DnType::CommonName, name);
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        (cert, key)
    }

    fn make_leaf(
        san: &str,
        purpose: ExtendedKeyUsagePurpose,
        ca_cert: &Certificate,
        ca_key: &KeyPair,
    ) -> Identity {
        let mut params = CertificateParams::new(vec![san.to_owned()]).unwrap();
        params.extended_key_usages = vec![purpose];
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, ca_cert, ca_key).unwrap();
        Identity::new(cert.pem().into_bytes(), key.serialize_pem().into_bytes())
    }

    async fn start_tls_server(ca_cert: &Certificate, ca_key: &KeyPair) -> (SocketAddr, Server) {
        let server_identity = make_leaf(
            "localhost",
            ExtendedKeyUsagePurpose::ServerAuth,
            ca_cert,
            ca_key,
        );
        let mut server = Server::new("127.0.0.1:0");
        server.set_tls(ServerTlsConfig::new(
            server_identity,
            ca_cert.pem().into_bytes(),
        ));
        server.register_unary("Ping", "Pong", pong);
        let addr = server.bind().await.unwrap();
        server.start().await.unwrap();
        (addr, server)
    }

    fn tls_xclient(addr: SocketAddr, client_identity: Identity, roots_pem: Vec<u8>) -> BalancedClient {
        let opt = Opt {
            tls: Some(ClientTlsConfig::new(client_identity, roots_pem, "localhost")),
            ..Default::default()
        };
        let resolver = Arc::new(StaticResolver::new(vec![Address::new(addr.to_string())]));
        BalancedClient::new(
            "Ping",
            FailMode::Failfast,
            resolver,
            Box::new(RoundRobinBalancer::new()),
            opt,
        )
    }

    #[tokio::test]
    async fn mutual_tls_round_trip() {
        let (ca_cert, ca_key) = make_ca("test root");
        let (addr, _server) = start_tls_server(&ca_cert, &ca_key).await;

        let client_identity = make_leaf(
            "client.test",
            ExtendedKeyUsagePurpose::ClientAuth,
            &ca_cert,
            &ca_key,
        );
        let xclient = tls_xclient(addr, client_identity, ca_cert.pem().into_bytes());

        let reply: Ping = xclient
            .unary("Pong", &Ping { n: 41 }, Metadata::new(), None)
            .await
            .unwrap();
        assert_eq!(42, reply.n);
    }

    #[tokio::test]
    async fn client_cert_from_an_untrusted_ca_is_rejected() {
        let (ca_cert, ca_key) = make_ca("test root");
        let (addr, _server) = start_tls_server(&ca_cert, &ca_key).await;

        let (rogue_ca_cert, rogue_ca_key) = make_ca("rogue root");
        let rogue_identity = make_leaf(
            "client.test",
            ExtendedKeyUsagePurpose::ClientAuth,
            &rogue_ca_cert,
            &rogue_ca_key,
        );
        // the server's roots are still the trusted CA, so the handshake dies
        let xclient = tls_xclient(addr, rogue_identity, ca_cert.pem().into_bytes());

        let err = xclient
            .unary::<Ping, Ping>("Pong", &Ping { n: 1 }, Metadata::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::Security | ErrorKind::Transport
        ));
    }

    #[tokio::test]
    async fn server_cert_from_an_untrusted_ca_is_rejected() {
        let (ca_cert, ca_key) = make_ca("test root");
        let (addr, _server) = start_tls_server(&ca_cert, &ca_key).await;

        let (other_ca_cert, other_ca_key) = make_ca("other root");
        let client_identity = make_leaf(
            "client.test",
            ExtendedKeyUsagePurpose::ClientAuth,
            &other_ca_cert,
            &other_ca_key,
        );
        // the client only trusts the other CA, so the server cert fails
        let xclient = tls_xclient(addr, client_identity, other_ca_cert.pem().into_bytes());

        let err = xclient
            .unary::<Ping, Ping>("Pong", &Ping { n: 1 }, Metadata::new(), None)
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::Security, err.kind());
    }

    #[tokio::test]
    async fn plaintext_client_cannot_talk_to_a_tls_server() {
        let (ca_cert, ca_key) = make_ca("test root");
        let (addr, _server) = start_tls_server(&ca_cert, &ca_key).await;

        let resolver = Arc::new(StaticResolver::new(vec![Address::new(addr.to_string())]));
        let xclient = BalancedClient::new(
            "Ping",
            FailMode::Failfast,
            resolver,
            Box::new(RoundRobinBalancer::new()),
            Opt::default(),
        );
        let err = xclient
            .unary::<Ping, Ping>("Pong", &Ping { n: 1 }, Metadata::new(), None)
            .await
            .unwrap_err();
        assert_eq!(ErrorKind::Transport, err.kind());
    }
}
