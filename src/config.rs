//! Command-line parsing and the resolved server configuration.

use clap::Parser;

/// TLS-terminating session gateway.
///
/// Listens on `--port`, terminating TLS and optionally requesting a client
/// certificate, then forwards each connection to a UNIX-socket backend
/// selected by the certificate's fingerprint.
#[derive(Debug, Parser)]
#[command(name = "tls-session-gatewayd", version, about)]
pub struct Cli {
    /// Port to listen on for incoming connections.
    #[arg(short = 'p', long, default_value_t = 9090)]
    pub port: u16,

    /// Run without TLS: accept plaintext connections only. Intended for
    /// deployments that terminate TLS upstream of this process.
    #[arg(long)]
    pub no_tls: bool,

    /// Seconds of zero active connections before the process exits.
    /// `0` disables the idle-exit timer.
    #[arg(long, default_value_t = 90)]
    pub idle_timeout: u32,

    /// Directory containing the ws instance sockets
    /// (`http.sock`, `https-factory.sock`, `https@<fingerprint>.sock`).
    /// Defaults to `$RUNTIME_DIRECTORY` if unset.
    #[arg(long)]
    pub wsinstance_dir: Option<std::path::PathBuf>,
}

/// Resolved, validated configuration used to build a [`crate::Server`].
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub no_tls: bool,
    pub idle_timeout_secs: u32,
    pub wsinstance_dir: std::path::PathBuf,
}

impl ServerConfig {
    pub fn from_cli(cli: Cli, runtime_directory: std::path::PathBuf) -> Self {
        ServerConfig {
            port: cli.port,
            no_tls: cli.no_tls,
            idle_timeout_secs: cli.idle_timeout,
            wsinstance_dir: cli.wsinstance_dir.unwrap_or(runtime_directory),
        }
    }
}
