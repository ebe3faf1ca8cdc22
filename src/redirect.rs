//! Loopback detection and the HTTP-redirect escape hatch.
//!
//! When the server is configured to require HTTPS (`AllowUnencrypted =
//! false`) but a plaintext connection arrives from somewhere other than
//! localhost, it isn't forwarded to a backend at all: instead it's handed to
//! a small redirector service that replies with a `301 Location:
//! https://...` and closes the connection. Localhost is exempted because
//! that's how development tooling and health checks typically talk to the
//! gateway.

use std::net::{IpAddr, Ipv6Addr};
use std::path::Path;

use tokio::net::{TcpStream, UnixStream};

use crate::Result;

/// `true` if the *local* address of `stream` (not the peer) is a loopback
/// address. We inspect the local side rather than the remote side so that a
/// client connecting to a non-loopback address that happens to route to
/// this host is NOT treated as local, even though the peer socket would
/// otherwise still report `127.0.0.1`.
pub fn is_loopback(stream: &TcpStream) -> bool {
    match stream.local_addr() {
        Ok(addr) => match addr.ip() {
            IpAddr::V4(v4) => v4.is_loopback(),
            IpAddr::V6(v6) => v6.is_loopback() || is_v4_mapped_loopback(&v6),
        },
        Err(_) => false,
    }
}

fn is_v4_mapped_loopback(v6: &Ipv6Addr) -> bool {
    matches!(v6.to_ipv4_mapped(), Some(v4) if v4.is_loopback())
}

/// Connects to the redirector's UNIX socket so it can complete the
/// connection with an HTTP redirect to HTTPS.
pub async fn connect_redirect_backend(wsinstance_dir: &Path) -> Result<UnixStream> {
    let path = wsinstance_dir.join("http-redirect.sock");
    Ok(UnixStream::connect(path).await?)
}
