//! `tls-session-gateway` terminates TLS for a cockpit-style web console and
//! fans connections out to per-session UNIX-socket backends, partitioned by
//! client certificate fingerprint.
//!
//! The architecture follows three subsystems: the [`listener`] (accept loop,
//! socket activation, idle-exit timer), the per-connection [`engine`]
//! (handshake, backend selection, [`pump`]), and the [`cert_store`]
//! (content-addressed, reference-counted client certificate files).

pub mod cert_store;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod engine;
pub mod factory;
pub mod fingerprint;
pub mod listener;
pub mod metadata;
pub mod pump;
pub mod redirect;
pub mod ring_buffer;
pub mod verifier;

pub use config::{Cli, ServerConfig};
pub use fingerprint::Fingerprint;
pub use listener::Server;

/// Errors produced anywhere in the gateway.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    #[error("invalid fingerprint: {0}")]
    InvalidFingerprint(String),

    #[error("certificate store error: {0}")]
    CertStore(String),

    #[error("failed to remove stale client certificate file: {0}")]
    StaleCertFile(String),

    #[error("backend factory did not start an instance for this fingerprint")]
    FactoryFailed,

    #[error("backend factory timed out waiting for an instance")]
    FactoryTimeout,

    #[error("backend factory sent a malformed reply")]
    FactoryMalformedReply,

    #[error("no server credentials available (pass --no-tls to run in plaintext)")]
    NoCredentials,

    #[error("$RUNTIME_DIRECTORY is not set")]
    MissingRuntimeDirectory,

    #[error("LISTEN_PID does not match our pid, ignoring socket activation fds")]
    ForeignListenPid,

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("nix system call failed: {0}")]
    Nix(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
