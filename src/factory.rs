//! Client for the `https-factory.sock` backend activation protocol.
//!
//! Dynamic ws instances are started on demand: when no socket exists yet
//! for a fingerprint, this process asks a factory service (outside this
//! crate's scope — typically a systemd socket-activated unit) to start one,
//! then retries the connection. See [`crate::engine`] for where this fits
//! into the per-connection flow.

use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;

use crate::fingerprint::Fingerprint;
use crate::{Error, Result};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const REPLY_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_REPLY_LEN: usize = 20;

/// Asks the factory to start (or confirm already-running) a ws instance for
/// `fingerprint`. Returns `Ok(())` only if the factory replies `done`.
pub async fn request_backend_start(wsinstance_dir: &Path, fingerprint: &Fingerprint) -> Result<()> {
    let socket_path = wsinstance_dir.join("https-factory.sock");

    let mut stream = tokio::time::timeout(SEND_TIMEOUT, UnixStream::connect(&socket_path))
        .await
        .map_err(|_| Error::FactoryTimeout)??;

    tokio::time::timeout(SEND_TIMEOUT, stream.write_all(fingerprint.as_str().as_bytes()))
        .await
        .map_err(|_| Error::FactoryTimeout)??;
    stream.shutdown().await?;

    let reply = tokio::time::timeout(REPLY_TIMEOUT, recv_alnum(&mut stream, MAX_REPLY_LEN))
        .await
        .map_err(|_| Error::FactoryTimeout)??;

    if reply == "done" {
        Ok(())
    } else {
        Err(Error::FactoryFailed)
    }
}

/// Reads up to `max_len` alphanumeric bytes from `stream`, stopping at the
/// first non-alphanumeric byte or EOF. Mirrors the original `recv_alnum`
/// helper, which treats the factory's reply as a short bare word
/// (`done`/`fail`) with no length prefix or delimiter.
async fn recv_alnum(stream: &mut UnixStream, max_len: usize) -> Result<String> {
    let mut out = Vec::with_capacity(max_len);
    let mut byte = [0u8; 1];

    loop {
        if out.len() >= max_len {
            break;
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            break;
        }
        if !byte[0].is_ascii_alphanumeric() {
            break;
        }
        out.push(byte[0]);
    }

    String::from_utf8(out).map_err(|_| Error::FactoryMalformedReply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn successful_activation_returns_ok() {
        let dir = tempfile::tempdir().unwrap();
        let listener = UnixListener::bind(dir.path().join("https-factory.sock")).unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            sock.read_to_end(&mut buf).await.unwrap();
            sock.write_all(b"done").await.unwrap();
            sock.shutdown().await.unwrap();
        });

        let fp = Fingerprint::empty_cert();
        let result = request_backend_start(dir.path(), &fp).await;
        server.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn failed_activation_returns_factory_failed() {
        let dir = tempfile::tempdir().unwrap();
        let listener = UnixListener::bind(dir.path().join("https-factory.sock")).unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            sock.read_to_end(&mut buf).await.unwrap();
            sock.write_all(b"fail").await.unwrap();
            sock.shutdown().await.unwrap();
        });

        let fp = Fingerprint::empty_cert();
        let result = request_backend_start(dir.path(), &fp).await;
        server.await.unwrap();
        assert!(matches!(result, Err(Error::FactoryFailed)));
    }
}
