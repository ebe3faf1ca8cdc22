//! Bidirectional byte pump between a client connection and its backend.
//!
//! Each direction is driven by a [`crate::ring_buffer::RingBuffer`]: bytes
//! are read from one side into the buffer, then written out the other side,
//! with half-close state propagated once each buffer's source has hit EOF
//! and its sink has drained. The two directions run concurrently via
//! `tokio::select!`, which plays the role the original implementation gives
//! `poll(2)` over both file descriptors at once.
//!
//! The one-shot connection metadata fd is attached as `SCM_RIGHTS` ancillary
//! data on the first successful write to the backend, which is the only
//! half of the connection that is always a UNIX domain socket.

use std::io::ErrorKind;
use std::os::fd::{AsRawFd, OwnedFd};

use nix::sys::socket::{sendmsg, shutdown, ControlMessage, MsgFlags, Shutdown as NixShutdown};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Interest};
use tokio::net::UnixStream;

use crate::ring_buffer::RingBuffer;
use crate::Result;

/// Drives bytes between `client` and `backend` until both directions have
/// fully shut down. `metadata_fd`, if present, is sent as ancillary data on
/// the first successful write to `backend`.
pub async fn pump<C>(client: &mut C, backend: &mut UnixStream, mut metadata_fd: Option<OwnedFd>) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_to_backend = RingBuffer::new();
    let mut backend_to_client = RingBuffer::new();

    while client_to_backend.alive() || backend_to_client.alive() {
        tokio::select! {
            result = read_into(client, &mut client_to_backend), if client_to_backend.can_read() => {
                result?;
            }
            result = write_from_unix(backend, &mut client_to_backend, &mut metadata_fd), if client_to_backend.can_write() => {
                result?;
            }
            result = read_into(backend, &mut backend_to_client), if backend_to_client.can_read() => {
                result?;
            }
            result = write_into(client, &mut backend_to_client), if backend_to_client.can_write() => {
                result?;
            }
            else => {
                // Neither side has pending work this tick but at least one
                // direction is still draining a half-close; yield once so
                // we don't spin.
                tokio::task::yield_now().await;
            }
        }

        maybe_shut_rd(client, &mut client_to_backend).await;
        maybe_shut_wr_unix(backend, &mut client_to_backend).await;
        maybe_shut_rd_unix(backend, &mut backend_to_client).await;
        maybe_shut_wr(client, &mut backend_to_client).await;
    }

    Ok(())
}

async fn read_into<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut RingBuffer) -> Result<()> {
    let slice = buf.free_mut();
    match reader.read(slice).await {
        Ok(0) => buf.mark_eof(),
        Ok(n) => buf.mark_filled(n),
        Err(e) if e.kind() == ErrorKind::WouldBlock => {}
        Err(_) => buf.mark_eof(),
    }
    Ok(())
}

async fn write_into<W: AsyncWrite + Unpin>(writer: &mut W, buf: &mut RingBuffer) -> Result<()> {
    if buf.is_empty() {
        return Ok(());
    }
    match writer.write(buf.occupied()).await {
        Ok(n) => buf.mark_consumed(n),
        Err(e) if e.kind() == ErrorKind::WouldBlock => {}
        Err(_) => {
            buf.mark_consumed(buf.len());
            buf.mark_eof();
        }
    }
    Ok(())
}

/// Like [`write_into`], but over a `UnixStream` via raw `sendmsg` so the
/// one-shot metadata fd can ride along as `SCM_RIGHTS` on the first call
/// that actually sends bytes.
async fn write_from_unix(
    backend: &mut UnixStream,
    buf: &mut RingBuffer,
    metadata_fd: &mut Option<OwnedFd>,
) -> Result<()> {
    if buf.is_empty() {
        return Ok(());
    }

    let occupied = buf.occupied();
    let fd_to_send = metadata_fd.as_ref().map(|fd| fd.as_raw_fd());
    let fd_slice = fd_to_send.map(|fd| [fd]);

    let result = backend.try_io(Interest::WRITABLE, || {
        let iov = [std::io::IoSlice::new(occupied)];
        let cmsgs = fd_slice
            .as_ref()
            .map(|fd| vec![ControlMessage::ScmRights(fd)])
            .unwrap_or_default();
        sendmsg::<()>(backend.as_raw_fd(), &iov, &cmsgs, MsgFlags::MSG_NOSIGNAL, None)
            .map_err(|e| std::io::Error::from_raw_os_error(e as i32))
    });

    match result {
        Ok(n) => {
            buf.mark_consumed(n);
            if fd_to_send.is_some() {
                *metadata_fd = None;
            }
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock => {}
        Err(_) => {
            buf.mark_consumed(buf.len());
            buf.mark_eof();
        }
    }

    Ok(())
}

async fn maybe_shut_rd<R: AsyncRead + Unpin>(_reader: &mut R, buf: &mut RingBuffer) {
    if buf.needs_shut_rd() {
        buf.set_shut_rd();
    }
}

async fn maybe_shut_wr<W: AsyncWrite + Unpin>(writer: &mut W, buf: &mut RingBuffer) {
    if buf.needs_shut_wr() {
        let _ = writer.shutdown().await;
        buf.set_shut_wr();
    }
}

async fn maybe_shut_rd_unix(backend: &UnixStream, buf: &mut RingBuffer) {
    if buf.needs_shut_rd() {
        let _ = shutdown(backend.as_raw_fd(), NixShutdown::Read);
        buf.set_shut_rd();
    }
}

async fn maybe_shut_wr_unix(backend: &UnixStream, buf: &mut RingBuffer) {
    if buf.needs_shut_wr() {
        let _ = shutdown(backend.as_raw_fd(), NixShutdown::Write);
        buf.set_shut_wr();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::UnixStream as TokioUnixStream;

    #[tokio::test]
    async fn pumps_bytes_in_both_directions_and_terminates() {
        let (mut client, client_peer) = TokioUnixStream::pair().unwrap();
        let (mut backend, mut backend_peer) = TokioUnixStream::pair().unwrap();

        let mut client_peer = client_peer;
        let pumping = tokio::spawn(async move { pump(&mut client_peer, &mut backend, None).await });

        client.write_all(b"hello backend").await.unwrap();
        let mut got = vec![0u8; "hello backend".len()];
        backend_peer.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello backend");

        backend_peer.write_all(b"hello client").await.unwrap();
        let mut got = vec![0u8; "hello client".len()];
        client.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello client");

        drop(client);
        drop(backend_peer);

        let result = tokio::time::timeout(std::time::Duration::from_secs(5), pumping)
            .await
            .expect("pump should terminate after both sides close")
            .unwrap();
        assert!(result.is_ok());
    }
}
