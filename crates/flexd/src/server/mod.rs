//! Daemon supervisor: listeners, serve loop and shutdown.
//!
//! The daemon:
//! - Resolves the ID map of the running user once, at start
//! - Listens on a Unix socket and, optionally, a TCP address
//! - Serves each connection on its own task
//! - Stops on request, cancelling attach sessions and removing the socket
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │      Daemon      │  start() / stop()
//! │  UnixListener    │
//! │  TcpListener?    │
//! └────────┬─────────┘
//!          │ accept()
//!          ▼
//! ┌──────────────────┐     ┌──────────────────┐
//! │ serve_connection │────▶│    Dispatcher    │
//! │  (per client)    │     │                  │
//! └──────────────────┘     └────────┬─────────┘
//!                                   │ attach
//!                                   ▼
//!                          ┌──────────────────┐
//!                          │  AttachSession   │
//!                          │ (TaskTracker)    │
//!                          └──────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Accept errors are logged and the loop keeps serving
//! - A panicked serve task is reported by `stop()` as an error

mod connection;

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream, UnixListener};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use flex_core::{var_path, Config, IdMap, IdMapError, IdOwner};

use crate::dispatch::{Dispatcher, Peer};
use crate::runtime::ContainerRuntime;

use connection::serve_connection;

/// Socket file name under the flex directory.
pub const SOCKET_NAME: &str = "unix.socket";

/// How long `stop()` waits for sessions and connections to wind down.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// Pause after a failed accept, so a full descriptor table does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

/// Errors that can occur starting or stopping the daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("Failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },

    #[error("Failed to listen on {addr}: {error}")]
    TcpSetup { addr: String, error: String },

    #[error("Cannot resolve ID map: {0}")]
    IdMap(#[from] IdMapError),

    #[error("Daemon task failed: {0}")]
    Supervisor(String),
}

/// Settings the daemon needs at start.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub socket_path: PathBuf,
    pub listen_addr: Option<String>,
    pub relay_bind: Ipv4Addr,
    pub subuid_path: PathBuf,
    pub subgid_path: PathBuf,
}

impl DaemonConfig {
    /// Builds daemon settings from the user configuration, with the socket
    /// under `$FLEX_DIR`.
    pub fn from_config(config: &Config) -> Self {
        Self {
            socket_path: var_path([SOCKET_NAME]),
            listen_addr: config.listen_addr.clone(),
            relay_bind: config.relay_bind_addr(),
            subuid_path: config.subuid_path.clone(),
            subgid_path: config.subgid_path.clone(),
        }
    }
}

/// A running daemon.
///
/// Dropping a `Daemon` without calling [`Daemon::stop`] leaves its tasks
/// running until the runtime shuts down.
pub struct Daemon {
    socket_path: PathBuf,
    tcp_addr: Option<SocketAddr>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    serve: JoinHandle<()>,
}

impl Daemon {
    /// Starts the daemon.
    ///
    /// Nothing is left running if this returns an error.
    pub async fn start(
        config: DaemonConfig,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self, DaemonError> {
        let owner = IdOwner::current()?;
        let idmap = IdMap::resolve_from(&config.subuid_path, &config.subgid_path, &owner)?;

        let unix = bind_unix(&config.socket_path)?;
        let tcp = match &config.listen_addr {
            Some(addr) => match TcpListener::bind(addr.as_str()).await {
                Ok(listener) => Some(listener),
                Err(e) => {
                    drop(unix);
                    remove_socket(&config.socket_path);
                    return Err(DaemonError::TcpSetup {
                        addr: addr.clone(),
                        error: e.to_string(),
                    });
                }
            },
            None => None,
        };
        let tcp_addr = tcp.as_ref().and_then(|l| l.local_addr().ok());

        let cancel = CancellationToken::new();
        let tasks = TaskTracker::new();
        let dispatcher = Arc::new(Dispatcher::new(
            runtime,
            idmap,
            config.relay_bind,
            tasks.clone(),
            cancel.clone(),
        ));

        info!(
            socket = %config.socket_path.display(),
            tcp = ?tcp_addr,
            uid_map = %format!("{}+{}", idmap.uid_min(), idmap.uid_range()),
            gid_map = %format!("{}+{}", idmap.gid_min(), idmap.gid_range()),
            "Daemon listening"
        );

        let serve = tokio::spawn(
            serve(
                unix,
                tcp,
                config.socket_path.clone(),
                dispatcher,
                tasks.clone(),
                cancel.clone(),
            )
            .instrument(info_span!("flexd")),
        );

        Ok(Self {
            socket_path: config.socket_path,
            tcp_addr,
            cancel,
            tasks,
            serve,
        })
    }

    /// Path of the Unix control socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Bound TCP address, if a TCP listener was requested.
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp_addr
    }

    /// Stops the daemon.
    ///
    /// Cancels the serve loop, every connection and every attach session,
    /// then waits for them. Returns an error only if the serve task failed.
    pub async fn stop(self) -> Result<(), DaemonError> {
        info!("Daemon stop requested");
        self.cancel.cancel();

        let served = self
            .serve
            .await
            .map_err(|e| DaemonError::Supervisor(e.to_string()));

        self.tasks.close();
        if timeout(STOP_GRACE, self.tasks.wait()).await.is_err() {
            warn!(
                remaining = self.tasks.len(),
                "Tasks still running after stop grace period"
            );
        }

        if served.is_ok() {
            info!("Daemon stopped");
        }
        served
    }
}

fn bind_unix(path: &Path) -> Result<UnixListener, DaemonError> {
    let setup_err = |e: io::Error| DaemonError::SocketSetup {
        path: path.to_path_buf(),
        error: e.to_string(),
    };

    // Remove a stale socket left by an earlier run
    if path.exists() {
        std::fs::remove_file(path).map_err(setup_err)?;
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(setup_err)?;
        }
    }

    UnixListener::bind(path).map_err(setup_err)
}

fn remove_socket(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(socket = %path.display(), error = %e, "Failed to remove socket file");
        }
    }
}

async fn accept_tcp(listener: Option<&TcpListener>) -> io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

async fn serve(
    unix: UnixListener,
    tcp: Option<TcpListener>,
    socket_path: PathBuf,
    dispatcher: Arc<Dispatcher>,
    tasks: TaskTracker,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Serve loop shutting down");
                break;
            }

            result = unix.accept() => match result {
                Ok((stream, _addr)) => {
                    spawn_connection(&tasks, stream, Peer::Unix, &dispatcher, &cancel);
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept unix connection");
                    sleep(ACCEPT_BACKOFF).await;
                }
            },

            result = accept_tcp(tcp.as_ref()) => match result {
                Ok((stream, addr)) => {
                    spawn_connection(&tasks, stream, Peer::Tcp(addr), &dispatcher, &cancel);
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept tcp connection");
                    sleep(ACCEPT_BACKOFF).await;
                }
            },
        }
    }

    drop(unix);
    drop(tcp);
    remove_socket(&socket_path);
}

fn spawn_connection<S>(
    tasks: &TaskTracker,
    stream: S,
    peer: Peer,
    dispatcher: &Arc<Dispatcher>,
    cancel: &CancellationToken,
) where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    debug!(%peer, "Accepted connection");
    tasks.spawn(
        serve_connection(stream, peer, Arc::clone(dispatcher), cancel.clone())
            .instrument(info_span!("conn", %peer)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_daemon_error_display() {
        let err = DaemonError::SocketSetup {
            path: PathBuf::from("/tmp/flex/unix.socket"),
            error: "permission denied".to_string(),
        };
        assert!(err.to_string().contains("/tmp/flex/unix.socket"));
        assert!(err.to_string().contains("permission denied"));
    }

    #[tokio::test]
    async fn test_bind_unix_replaces_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SOCKET_NAME);

        let first = bind_unix(&path).unwrap();
        drop(first);
        assert!(path.exists());
        let _second = bind_unix(&path).unwrap();
    }

    #[test]
    fn test_config_from_user_config() {
        let config = Config {
            listen_addr: Some("127.0.0.1:0".to_string()),
            ..Config::default()
        };
        let daemon = DaemonConfig::from_config(&config);
        assert_eq!(daemon.listen_addr.as_deref(), Some("127.0.0.1:0"));
        assert!(daemon.socket_path.ends_with(SOCKET_NAME));
        assert_eq!(daemon.relay_bind, Ipv4Addr::UNSPECIFIED);

        let daemon = DaemonConfig::from_config(&Config::default());
        assert_eq!(daemon.relay_bind, Ipv4Addr::LOCALHOST);
    }
}
