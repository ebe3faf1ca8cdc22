//! Loading of this server's own TLS certificate and key.

use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;

use crate::verifier::LenientClientCertVerifier;
use crate::{Error, Result};

/// The server's TLS identity, ready to hand to [`tokio_rustls::TlsAcceptor`].
///
/// Wrapping the `rustls::ServerConfig` in an `Arc` lets every accepted
/// connection share one parsed configuration instead of re-parsing PEM
/// files per handshake.
#[derive(Clone)]
pub struct Credentials {
    pub tls_config: Arc<rustls::ServerConfig>,
}

impl Credentials {
    /// Loads a certificate chain and private key from PEM files, builds a
    /// `rustls::ServerConfig` that requests (but does not strictly require)
    /// a client certificate, and removes the source files from disk.
    ///
    /// The certificate and key only ever need to be read once at startup;
    /// the original implementation unlinks them immediately after loading
    /// so a compromise of the running process's filesystem view afterwards
    /// cannot exfiltrate the private key.
    pub fn load(cert_path: &Path, key_path: &Path, client_ca_path: Option<&Path>) -> Result<Self> {
        let cert_chain = load_certs(cert_path)?;
        let key = load_key(key_path)?;

        let client_verifier = if let Some(ca_path) = client_ca_path {
            let roots = load_root_store(ca_path)?;
            let inner = WebPkiClientVerifier::builder(Arc::new(roots))
                .allow_unauthenticated()
                .build()
                .map_err(|e| Error::CertStore(format!("building client verifier: {e}")))?;
            Arc::new(LenientClientCertVerifier::new(inner))
        } else {
            Arc::new(LenientClientCertVerifier::permissive())
        };

        let config = rustls::ServerConfig::builder()
            .with_client_cert_verifier(client_verifier)
            .with_single_cert(cert_chain, key)?;

        let _ = std::fs::remove_file(cert_path);
        let _ = std::fs::remove_file(key_path);

        Ok(Credentials {
            tls_config: Arc::new(config),
        })
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(Error::Io)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)?
        .ok_or_else(|| Error::CertStore(format!("no private key found in {}", path.display())))
}

fn load_root_store(path: &Path) -> Result<RootCertStore> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::new(file);
    let mut store = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        store.add(cert?).map_err(Error::Tls)?;
    }
    Ok(store)
}
