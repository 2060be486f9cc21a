use std::sync::Arc;

use rustls::{
    pki_types::{CertificateDer, PrivateKeyDer, ServerName},
    server::WebPkiClientVerifier,
    ClientConfig, RootCertStore, ServerConfig,
};

use crate::{Error, ErrorKind, Result};

/// A certificate chain and matching private key, both PEM bytes. Used once per
/// transport channel establishment and never persisted beyond it.
#[derive(Clone)]
pub struct Identity {
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
}

impl Identity {
    pub fn new(cert_pem: Vec<u8>, key_pem: Vec<u8>) -> Self {
        Identity { cert_pem, key_pem }
    }
}

/// Client-side mutual-TLS material: the client identity, the roots trusted to
/// sign the server certificate, and the expected server name. Binding the name
/// explicitly avoids the deprecated common-name matching rules.
#[derive(Clone)]
pub struct ClientTlsConfig {
    pub identity: Identity,
    pub trusted_roots_pem: Vec<u8>,
    pub server_name: String,
}

impl ClientTlsConfig {
    pub fn new(identity: Identity, trusted_roots_pem: Vec<u8>, server_name: impl Into<String>) -> Self {
        ClientTlsConfig {
            identity,
            trusted_roots_pem,
            server_name: server_name.into(),
        }
    }

    pub fn server_name(&self) -> Result<ServerName<'static>> {
        ServerName::try_from(self.server_name.clone())
            .map_err(|err| Error::new(ErrorKind::Security, err))
    }

    pub fn build(&self) -> Result<ClientConfig> {
        let roots = root_store_from_pem(&self.trusted_roots_pem)?;
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(
                certs_from_pem(&self.identity.cert_pem)?,
                key_from_pem(&self.identity.key_pem)?,
            )
            .map_err(|err| Error::new(ErrorKind::Security, err))
    }
}

/// Server-side mutual-TLS material. Client certificates are required and
/// verified against the trusted roots; a failed handshake aborts channel
/// setup before any frame is exchanged.
#[derive(Clone)]
pub struct ServerTlsConfig {
    pub identity: Identity,
    pub trusted_roots_pem: Vec<u8>,
}

impl ServerTlsConfig {
    pub fn new(identity: Identity, trusted_roots_pem: Vec<u8>) -> Self {
        ServerTlsConfig {
            identity,
            trusted_roots_pem,
        }
    }

    pub fn build(&self) -> Result<ServerConfig> {
        let roots = root_store_from_pem(&self.trusted_roots_pem)?;
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|err| Error::new(ErrorKind::Security, err))?;
        ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(
                certs_from_pem(&self.identity.cert_pem)?,
                key_from_pem(&self.identity.key_pem)?,
            )
            .map_err(|err| Error::new(ErrorKind::Security, err))
    }
}

fn certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &*pem)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|err| Error::new(ErrorKind::Security, err))?;
    if certs.is_empty() {
        return Err(Error::new(ErrorKind::Security, "no certificate in pem input"));
    }
    Ok(certs)
}

fn key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    rustls_pemfile::private_key(&mut &*pem)
        .map_err(|err| Error::new(ErrorKind::Security, err))?
        .ok_or_else(|| Error::new(ErrorKind::Security, "no private key in pem input"))
}

fn root_store_from_pem(pem: &[u8]) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in certs_from_pem(pem)? {
        roots
            .add(cert)
            .map_err(|err| Error::new(ErrorKind::Security, err))?;
    }
    Ok(roots)
}
