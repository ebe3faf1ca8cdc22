//! Content-addressed, reference-counted client certificate files.
//!
//! Every connection that presents a client certificate needs that
//! certificate's PEM encoding available on disk, under a well-known path, so
//! the backend ws instance can read it back out of `/proc/self/fd` or the
//! runtime directory. Multiple concurrent connections can share the same
//! certificate (the same user opening several browser tabs), so the file is
//! named by fingerprint and kept alive for as long as any connection
//! references it.
//!
//! A single in-process mutex plus an flock on the file itself makes this
//! safe across connection tasks and across this process restarting and
//! encountering files left by a predecessor: taking a shared lock on open
//! and trying to upgrade to an exclusive lock on close is what lets the
//! last closer detect that it is the last closer, even though "reference
//! count" is never stored anywhere explicit. See [`CertStore::open`] and
//! [`CertStore::close`].

use std::os::fd::{AsRawFd, OwnedFd};
use std::path::{Path, PathBuf};

use base64::Engine as _;

use nix::fcntl::{self, FlockArg, OFlag};
use nix::sys::stat::Mode;
use nix::unistd;
use tokio::sync::Mutex;

use crate::fingerprint::Fingerprint;
use crate::{Error, Result};

/// A guard for one connection's reference to a certificate file.
///
/// Dropping this without calling [`CertStore::close`] leaks a shared flock
/// held by the now-gone fd; the kernel releases it automatically when the
/// fd is closed, which `OwnedFd`'s `Drop` impl takes care of, but the
/// directory-entry cleanup in `close` will simply not run for the
/// leaked guard. Callers should always route through `close`.
pub struct CertFileHandle {
    pub fingerprint: Fingerprint,
    fd: OwnedFd,
}

impl CertFileHandle {
    pub fn fd(&self) -> &OwnedFd {
        &self.fd
    }
}

/// Serializes access to the certificate directory so that two connections
/// racing to open, or opening while a third is closing, cannot see a file
/// spring in and out of existence underneath them.
pub struct CertStore {
    dir: PathBuf,
    lock: Mutex<()>,
}

fn cgroup_header(fingerprint: &Fingerprint) -> String {
    format!(
        "0::/system.slice/system-cockpithttps.slice/cockpit-wsinstance-https@{}.service\n",
        fingerprint.as_str()
    )
}

impl CertStore {
    pub fn new(dir: PathBuf) -> Self {
        CertStore {
            dir,
            lock: Mutex::new(()),
        }
    }

    fn dirfd(&self) -> Result<OwnedFd> {
        Ok(fcntl::open(
            &self.dir,
            OFlag::O_DIRECTORY | OFlag::O_RDONLY,
            Mode::empty(),
        )?)
    }

    /// Opens (creating if necessary) the certificate file for `der`, writes
    /// the PEM-encoded certificate the first time the file is created, and
    /// returns a handle holding a shared `flock` on it.
    ///
    /// Concurrent calls for the same fingerprint all succeed and each hold
    /// their own shared lock on the one underlying file.
    pub async fn open(&self, der: &[u8], pem: &str) -> Result<CertFileHandle> {
        let fingerprint = Fingerprint::of_der(der);
        let _guard = self.lock.lock().await;

        let dirfd = self.dirfd()?;
        let name = fingerprint.as_str();

        let fd = match fcntl::openat(
            &dirfd,
            name,
            OFlag::O_RDWR,
            Mode::empty(),
        ) {
            Ok(fd) => fd,
            Err(nix::Error::ENOENT) => self.create_and_populate(&dirfd, &fingerprint, pem)?,
            Err(e) => return Err(e.into()),
        };

        if let Err(e) = fcntl::flock(fd.as_raw_fd(), FlockArg::LockSharedNonblock) {
            return Err(Error::CertStore(format!(
                "couldn't acquire shared lock on certificate file {name}: {e}"
            )));
        }

        Ok(CertFileHandle { fingerprint, fd })
    }

    fn create_and_populate(
        &self,
        dirfd: &OwnedFd,
        fingerprint: &Fingerprint,
        pem: &str,
    ) -> Result<OwnedFd> {
        let name = fingerprint.as_str();
        let fd = fcntl::openat(
            dirfd,
            name,
            OFlag::O_CREAT | OFlag::O_EXCL | OFlag::O_RDWR,
            Mode::from_bits_truncate(0o666),
        )?;

        let write_result = (|| -> Result<()> {
            let header = cgroup_header(fingerprint);
            unistd::write(&fd, header.as_bytes())?;
            unistd::write(&fd, pem.as_bytes())?;
            Ok(())
        })();

        if let Err(e) = write_result {
            let _ = unistd::unlinkat(dirfd, name, unistd::UnlinkatFlags::NoRemoveDir);
            return Err(e);
        }

        Ok(fd)
    }

    /// Releases this connection's reference. If this was the last reference
    /// (detected by successfully upgrading the shared lock to an exclusive
    /// one), unlinks the file. Otherwise drops the shared lock and leaves
    /// the file for the remaining holders.
    ///
    /// A failure to unlink as the last holder comes back as
    /// [`Error::StaleCertFile`] rather than the generic [`Error::CertStore`]:
    /// a client certificate file left behind on disk is a security issue,
    /// not an ordinary per-connection failure, and the caller is expected to
    /// treat it as such.
    pub async fn close(&self, handle: CertFileHandle) -> Result<()> {
        let _guard = self.lock.lock().await;
        let name = handle.fingerprint.as_str();

        match fcntl::flock(handle.fd.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {
                let dirfd = self.dirfd()?;
                unistd::unlinkat(&dirfd, name, unistd::UnlinkatFlags::NoRemoveDir)
                    .map_err(|e| {
                        Error::StaleCertFile(format!(
                            "failed to unlink certificate file {name} as last holder: {e}"
                        ))
                    })?;
            }
            Err(nix::Error::EWOULDBLOCK) => {
                fcntl::flock(handle.fd.as_raw_fd(), FlockArg::Unlock).map_err(|e| {
                    Error::CertStore(format!("failed to drop shared lock on {name}: {e}"))
                })?;
            }
            Err(e) => {
                return Err(Error::CertStore(format!(
                    "failed to take exclusive lock on {name}: {e}"
                )));
            }
        }

        Ok(())
    }

    pub fn path_for(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.dir.join(fingerprint.as_str())
    }
}

pub fn exists(dir: &Path, fingerprint: &Fingerprint) -> bool {
    dir.join(fingerprint.as_str()).exists()
}

/// Encodes DER bytes as a PEM `CERTIFICATE` block, wrapped at 64 columns.
pub fn pem_encode_certificate(der: &[u8]) -> String {
    let b64 = base64::engine::general_purpose::STANDARD.encode(der);
    let mut out = String::from("-----BEGIN CERTIFICATE-----\n");
    for chunk in b64.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).unwrap());
        out.push('\n');
    }
    out.push_str("-----END CERTIFICATE-----\n");
    out
}
