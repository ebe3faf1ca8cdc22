//! Per-connection orchestration: protocol sniffing, TLS handshake, backend
//! selection, metadata construction, and the pump.
//!
//! This is the Rust re-expression of `connection_thread_main` from the
//! original implementation, minus the explicit thread: each accepted
//! connection becomes one `tokio::spawn`ed task instead of one pthread.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpStream, UnixStream};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::cert_store::CertStore;
use crate::config::ServerConfig;
use crate::connection::ClientStream;
use crate::credentials::Credentials;
use crate::fingerprint::Fingerprint;
use crate::metadata::ConnectionMetadata;
use crate::{cert_store, factory, pump, redirect, Result};

const HANDSHAKE_PEEK_TIMEOUT: Duration = Duration::from_secs(30);

/// Handles one accepted TCP connection end to end. Errors are logged by the
/// caller; this always returns once the connection is finished, one way or
/// another.
pub async fn handle_connection(
    tcp: TcpStream,
    credentials: Option<Arc<Credentials>>,
    config: Arc<ServerConfig>,
    cert_store: Arc<CertStore>,
) -> Result<()> {
    let Some(first_byte) = peek_first_byte(&tcp).await? else {
        debug!("client sent no data within handshake window, dropping connection");
        return Ok(());
    };

    let is_tls_handshake = first_byte == 22;

    // Whether we reject non-loopback plaintext connections and redirect them
    // to HTTPS instead. When TLS is disabled entirely (`--no-tls`), plaintext
    // is always the expected protocol and nothing is redirected.
    let require_https = !config.no_tls;

    let (mut client, cert_handle) = if is_tls_handshake {
        let Some(credentials) = credentials else {
            warn!("got a TLS connection but no server certificate is configured; refusing");
            return Ok(());
        };
        let acceptor = TlsAcceptor::from(credentials.tls_config.clone());
        let tls_stream = acceptor.accept(tcp).await?;
        let client = ClientStream::Tls(Box::new(tls_stream));

        let cert_handle = accept_client_certificate(&client, &cert_store).await?;
        (client, cert_handle)
    } else {
        (ClientStream::Plain(tcp), None)
    };

    let result = run_connection(&mut client, require_https, &config, &cert_handle).await;

    if let Some(handle) = cert_handle {
        cert_store.close(handle).await?;
    }

    result
}

async fn peek_first_byte(tcp: &TcpStream) -> Result<Option<u8>> {
    let mut buf = [0u8; 1];
    match timeout(HANDSHAKE_PEEK_TIMEOUT, tcp.peek(&mut buf)).await {
        Ok(Ok(0)) => Ok(None),
        Ok(Ok(_)) => Ok(Some(buf[0])),
        Ok(Err(e)) => Err(e.into()),
        Err(_) => Ok(None),
    }
}

/// After a successful TLS handshake, registers any presented client
/// certificate in the [`CertStore`] and returns its handle. Returns `None`
/// if no certificate was presented (the caller should then use the "no
/// cert" sentinel fingerprint, [`Fingerprint::empty_cert`]).
async fn accept_client_certificate(
    client: &ClientStream,
    cert_store: &CertStore,
) -> Result<Option<cert_store::CertFileHandle>> {
    let certs = client.peer_certificates();
    let Some(leaf) = certs.first() else {
        return Ok(None);
    };

    let pem = cert_store::pem_encode_certificate(leaf);
    let handle = cert_store.open(leaf, &pem).await?;
    Ok(Some(handle))
}

async fn run_connection(
    client: &mut ClientStream,
    require_https: bool,
    config: &ServerConfig,
    cert_handle: &Option<cert_store::CertFileHandle>,
) -> Result<()> {
    let peer_addr = client.peer_addr().ok();
    let is_tls = client.is_tls();

    let mut backend = connect_backend(client, is_tls, require_https, config, cert_handle).await?;

    // The backend reads the certificate back out of the cert-store directory
    // by this bare filename, not a full path it has no business knowing.
    let cert_filename = cert_handle
        .as_ref()
        .map(|handle| handle.fingerprint.as_str().to_owned());
    let metadata = ConnectionMetadata::from_peer_addr(peer_addr, cert_filename.as_deref());
    let metadata_fd = Some(metadata.seal_into_memfd()?);

    pump::pump(client, &mut backend, metadata_fd).await
}

async fn connect_backend(
    client: &ClientStream,
    is_tls: bool,
    require_https: bool,
    config: &ServerConfig,
    cert_handle: &Option<cert_store::CertFileHandle>,
) -> Result<UnixStream> {
    if !is_tls && require_https && !redirect::is_loopback(client.tcp_stream()) {
        return redirect::connect_redirect_backend(&config.wsinstance_dir).await;
    }

    if !is_tls {
        let path = config.wsinstance_dir.join("http.sock");
        return Ok(UnixStream::connect(path).await?);
    }

    let fingerprint = cert_handle
        .as_ref()
        .map(|h| h.fingerprint.clone())
        .unwrap_or_else(Fingerprint::empty_cert);

    connect_dynamic_wsinstance(&config.wsinstance_dir, &fingerprint).await
}

async fn connect_dynamic_wsinstance(wsinstance_dir: &std::path::Path, fingerprint: &Fingerprint) -> Result<UnixStream> {
    let sockname = format!("https@{fingerprint}.sock");
    let path = wsinstance_dir.join(&sockname);

    match UnixStream::connect(&path).await {
        Ok(stream) => return Ok(stream),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound || e.kind() == std::io::ErrorKind::ConnectionRefused => {
            debug!("{sockname} not ready yet, requesting activation");
        }
        Err(e) => return Err(e.into()),
    }

    factory::request_backend_start(wsinstance_dir, fingerprint).await?;

    Ok(UnixStream::connect(&path).await?)
}
