//! One-shot connection metadata, handed to the backend as a sealed memfd
//! alongside the first bytes of forwarded traffic.
//!
//! The backend (cockpit-ws) needs to know the browser's real origin address
//! and, if one was presented, where to find the client certificate file —
//! information that isn't otherwise available once this process has taken
//! over the TCP/TLS connection. Rather than inventing an out-of-band
//! protocol, the metadata is serialized as JSON, sealed into an immutable
//! memfd, and passed as `SCM_RIGHTS` ancillary data on the first successful
//! write to the backend socket (see [`crate::pump`]).

use std::net::SocketAddr;
use std::os::fd::OwnedFd;

use nix::fcntl::{FcntlArg, SealFlag};
use nix::sys::memfd::{memfd_create, MFdFlags};
use nix::unistd;
use serde::Serialize;

use crate::Result;

#[derive(Debug, Serialize)]
pub struct ConnectionMetadata {
    #[serde(rename = "origin-ip")]
    pub origin_ip: String,
    #[serde(rename = "origin-port")]
    pub origin_port: u16,
    #[serde(rename = "client-certificate", skip_serializing_if = "Option::is_none")]
    pub client_certificate: Option<String>,
}

impl ConnectionMetadata {
    /// `cert_filename` is the bare filename of the client certificate inside
    /// the cert-store directory (e.g. the fingerprint), never a full path —
    /// the backend already knows which directory to look in and has no
    /// business learning this process's on-disk layout.
    pub fn from_peer_addr(peer: Option<SocketAddr>, cert_filename: Option<&str>) -> Self {
        let (origin_ip, origin_port) = match peer {
            Some(addr) => (addr.ip().to_string(), addr.port()),
            None => (String::new(), 0),
        };

        ConnectionMetadata {
            origin_ip,
            origin_port,
            client_certificate: cert_filename.map(str::to_owned),
        }
    }

    /// Serializes this metadata to JSON, writes it into an anonymous memfd,
    /// and seals the memfd read-only so the receiving end can trust its
    /// contents cannot change out from under it.
    pub fn seal_into_memfd(&self) -> Result<OwnedFd> {
        let json = serde_json::to_vec(self)?;

        let fd = memfd_create(c"cockpit-tls metadata", MFdFlags::MFD_ALLOW_SEALING)?;

        unistd::write(&fd, &json)?;

        nix::fcntl::fcntl(
            &fd,
            FcntlArg::F_ADD_SEALS(
                SealFlag::F_SEAL_SHRINK
                    | SealFlag::F_SEAL_GROW
                    | SealFlag::F_SEAL_WRITE
                    | SealFlag::F_SEAL_SEAL,
            ),
        )?;

        Ok(fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_without_client_certificate() {
        let meta = ConnectionMetadata::from_peer_addr(
            Some("127.0.0.1:1234".parse().unwrap()),
            None,
        );
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"origin-ip\":\"127.0.0.1\""));
        assert!(json.contains("\"origin-port\":1234"));
        assert!(!json.contains("client-certificate"));
    }

    #[test]
    fn serializes_with_client_certificate() {
        let meta = ConnectionMetadata::from_peer_addr(
            Some("[::1]:443".parse().unwrap()),
            Some("abcd1234"),
        );
        let json = serde_json::to_string(&meta).unwrap();
        assert!(json.contains("\"client-certificate\":\"abcd1234\""));
    }

    #[test]
    fn seal_into_memfd_round_trips_json() {
        let meta = ConnectionMetadata::from_peer_addr(
            Some("127.0.0.1:80".parse().unwrap()),
            None,
        );
        let fd = meta.seal_into_memfd().unwrap();
        let mut buf = vec![0u8; 4096];
        let n = nix::unistd::lseek(&fd, 0, nix::unistd::Whence::SeekEnd).unwrap();
        nix::unistd::lseek(&fd, 0, nix::unistd::Whence::SeekSet).unwrap();
        let n = n as usize;
        let read = nix::unistd::read(&fd, &mut buf[..n]).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&buf[..read]).unwrap();
        assert_eq!(parsed["origin-port"], 80);
    }
}
