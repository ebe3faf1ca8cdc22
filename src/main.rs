use std::path::PathBuf;

use clap::Parser;
use tls_session_gateway::credentials::Credentials;
use tls_session_gateway::{Cli, Error, Server, ServerConfig};

const SERVER_CERT_PATH: &str = "/run/cockpit/tls/server/cert";
const SERVER_KEY_PATH: &str = "/run/cockpit/tls/server/key";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = run().await {
        tracing::error!(error = %e, "fatal error");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Error> {
    let cli = Cli::parse();

    let runtime_directory = runtime_directory()?;
    let config = ServerConfig::from_cli(cli, runtime_directory);

    std::fs::create_dir_all(config.wsinstance_dir.join("clients")).ok();

    let credentials = if config.no_tls {
        None
    } else {
        Some(Credentials::load(
            std::path::Path::new(SERVER_CERT_PATH),
            std::path::Path::new(SERVER_KEY_PATH),
            None,
        )?)
    };

    let listener = tls_session_gateway::listener::bind_listener(&config)?;
    let server = Server::new(listener, credentials, config);

    tracing::info!("tls-session-gatewayd starting up");
    server.run().await
}

fn runtime_directory() -> Result<PathBuf, Error> {
    std::env::var_os("RUNTIME_DIRECTORY")
        .map(PathBuf::from)
        .ok_or(Error::MissingRuntimeDirectory)
}
