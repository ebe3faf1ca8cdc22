//! A minimal stand-in for the out-of-scope HTTP-redirect service, used only
//! by the `redirect-nonloopback` scenario. The real redirector is its own
//! process; this stub just accepts one connection on `http-redirect.sock`
//! and writes back a literal `301 Moved Permanently`, enough to prove that
//! a non-loopback plaintext connection gets routed here instead of to
//! `http.sock`.

use std::path::Path;

use tokio::io::AsyncWriteExt;
use tokio::net::UnixListener;

/// Binds `http-redirect.sock` in `wsinstance_dir` and, once, replies to a
/// connection with a `301 Moved Permanently` before closing it.
pub async fn serve_one(wsinstance_dir: &Path) {
    let listener = UnixListener::bind(wsinstance_dir.join("http-redirect.sock")).unwrap();
    let (mut sock, _) = listener.accept().await.unwrap();
    sock.write_all(b"HTTP/1.1 301 Moved Permanently\r\nLocation: https://\r\n\r\n")
        .await
        .unwrap();
    sock.shutdown().await.unwrap();
}
