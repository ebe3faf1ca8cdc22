//! Listener and connection dispatcher.
//!
//! Binds (or adopts, via systemd socket activation) the public listening
//! socket, accepts connections, spawns one task per connection, and tracks
//! the active connection count to drive an idle-exit timer. This is the
//! Rust re-expression of `server.c`'s epoll/timerfd/pthread loop as a
//! `tokio::select!` over the accept future, the idle timer, and shutdown
//! signals.

use std::os::fd::{FromRawFd, RawFd};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::cert_store::CertStore;
use crate::config::ServerConfig;
use crate::credentials::Credentials;
use crate::{engine, Error, Result};

const SD_LISTEN_FDS_START: RawFd = 3;

/// Tracks how many connections are currently being served, and arms/disarms
/// the idle-exit timer as that count transitions to/from zero.
struct ActiveConnections {
    count: AtomicU32,
    idle_timeout: Duration,
    went_idle: Notify,
}

impl ActiveConnections {
    fn new(idle_timeout: Duration) -> Self {
        ActiveConnections {
            count: AtomicU32::new(0),
            idle_timeout,
            went_idle: Notify::new(),
        }
    }

    fn connection_started(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn connection_finished(&self) {
        if self.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.went_idle.notify_one();
        }
    }

    /// Resolves once the connection count has been zero for `idle_timeout`,
    /// restarting the wait any time a new connection arrives in the
    /// meantime. Never resolves if `idle_timeout` is zero.
    async fn wait_for_idle_exit(&self) {
        if self.idle_timeout.is_zero() {
            std::future::pending::<()>().await;
        }
        loop {
            self.went_idle.notified().await;
            tokio::time::sleep(self.idle_timeout).await;
            if self.count.load(Ordering::SeqCst) == 0 {
                return;
            }
        }
    }
}

/// Binds the gateway's listening socket, adopting an inherited systemd
/// socket-activation fd when `LISTEN_FDS`/`LISTEN_PID` indicate one is
/// available for this process, and otherwise binding `config.port` fresh.
pub fn bind_listener(config: &ServerConfig) -> Result<TcpListener> {
    if let Some(listener) = adopt_activated_socket()? {
        info!("adopted socket-activated listener");
        return Ok(listener);
    }

    let std_listener = std::net::TcpListener::bind(("0.0.0.0", config.port))?;
    std_listener.set_nonblocking(true)?;
    Ok(TcpListener::from_std(std_listener)?)
}

fn adopt_activated_socket() -> Result<Option<TcpListener>> {
    let Ok(n_fds) = std::env::var("LISTEN_FDS") else {
        return Ok(None);
    };
    let n_fds: u32 = n_fds
        .parse()
        .map_err(|_| Error::CertStore("invalid $LISTEN_FDS".into()))?;
    if n_fds < 1 {
        return Ok(None);
    }

    let listen_pid: i32 = std::env::var("LISTEN_PID")
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(Error::ForeignListenPid)?;
    if listen_pid != std::process::id() as i32 {
        warn!("$LISTEN_PID does not match our pid, ignoring socket activation fds");
        return Ok(None);
    }

    // SAFETY: SD_LISTEN_FDS_START is the first fd systemd promises to have
    // set up for us per the sd_listen_fds(3) protocol; ownership transfers
    // to this process exactly once.
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(SD_LISTEN_FDS_START) };
    std_listener.set_nonblocking(true)?;
    Ok(Some(TcpListener::from_std(std_listener)?))
}

pub struct Server {
    listener: TcpListener,
    credentials: Option<Arc<Credentials>>,
    config: Arc<ServerConfig>,
    cert_store: Arc<CertStore>,
    active: Arc<ActiveConnections>,
}

impl Server {
    pub fn new(listener: TcpListener, credentials: Option<Credentials>, config: ServerConfig) -> Self {
        let cert_store = Arc::new(CertStore::new(config.wsinstance_dir.join("clients")));
        let idle_timeout = Duration::from_secs(config.idle_timeout_secs as u64);
        Server {
            listener,
            credentials: credentials.map(Arc::new),
            config: Arc::new(config),
            cert_store,
            active: Arc::new(ActiveConnections::new(idle_timeout)),
        }
    }

    /// Runs the accept loop until a shutdown signal arrives or the idle-exit
    /// timer fires.
    pub async fn run(&self) -> Result<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (tcp, peer) = accepted?;
                    info!(%peer, "accepted connection");
                    self.spawn_connection(tcp);
                }
                _ = self.active.wait_for_idle_exit() => {
                    info!("idle timeout reached with no active connections, exiting");
                    return Ok(());
                }
                _ = shutdown_signal() => {
                    info!("shutdown signal received");
                    return Ok(());
                }
            }
        }
    }

    fn spawn_connection(&self, tcp: tokio::net::TcpStream) {
        self.active.connection_started();

        let credentials = self.credentials.clone();
        let config = self.config.clone();
        let cert_store = self.cert_store.clone();
        let active = self.active.clone();

        tokio::spawn(async move {
            match engine::handle_connection(tcp, credentials, config, cert_store).await {
                Ok(()) => {}
                Err(Error::StaleCertFile(msg)) => {
                    // A client certificate file survived its last holder's
                    // close: the on-disk session-to-certificate mapping can
                    // no longer be trusted. Crash loudly rather than limp
                    // along with a potentially stale file on disk.
                    error!(error = %msg, "stale client certificate file could not be removed, aborting");
                    std::process::abort();
                }
                Err(e) => warn!(error = %e, "connection ended with an error"),
            }
            active.connection_finished();
        });
    }
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}
