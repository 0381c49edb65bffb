//! Shared helpers for daemon integration tests.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use flex_client::{Client, Endpoint};
use flex_core::{Config, ContainerInfo, ContainerState, IdMap, Template};
use flexd::pty::run_on_tty;
use flexd::{ContainerRuntime, Daemon, DaemonConfig, RuntimeError};
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tokio::process::Command;
use tokio::time::{sleep, timeout, Instant};

// ============================================================================
// Constants
// ============================================================================

/// Upper bound for anything a test waits on
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Runtime
// ============================================================================

/// In-memory container table whose `exec` runs the command on the host.
#[derive(Default)]
pub struct HostRuntime {
    containers: Mutex<BTreeMap<String, ContainerState>>,
    execs: AtomicUsize,
}

impl HostRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of processes started through `exec`.
    pub fn exec_count(&self) -> usize {
        self.execs.load(Ordering::SeqCst)
    }

    pub fn state_of(&self, name: &str) -> Option<ContainerState> {
        self.containers.lock().unwrap().get(name).cloned()
    }

    fn set_state(&self, name: &str, state: ContainerState) -> Result<(), RuntimeError> {
        let mut table = self.containers.lock().unwrap();
        match table.get_mut(name) {
            Some(current) => {
                *current = state;
                Ok(())
            }
            None => Err(RuntimeError::NotFound {
                name: name.to_string(),
            }),
        }
    }
}

#[async_trait]
impl ContainerRuntime for HostRuntime {
    async fn list(&self) -> Result<Vec<ContainerInfo>, RuntimeError> {
        let table = self.containers.lock().unwrap();
        Ok(table
            .iter()
            .map(|(name, state)| ContainerInfo::new(name.clone(), state.clone()))
            .collect())
    }

    async fn lookup(&self, name: &str) -> Result<ContainerInfo, RuntimeError> {
        self.state_of(name)
            .map(|state| ContainerInfo::new(name, state))
            .ok_or_else(|| RuntimeError::NotFound {
                name: name.to_string(),
            })
    }

    async fn create(
        &self,
        name: &str,
        _template: &Template,
        _idmap: &IdMap,
    ) -> Result<(), RuntimeError> {
        let mut table = self.containers.lock().unwrap();
        if table.contains_key(name) {
            return Err(RuntimeError::InvalidCommand(format!("{name} exists")));
        }
        table.insert(name.to_string(), ContainerState::Stopped);
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        self.set_state(name, ContainerState::Running)
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        self.set_state(name, ContainerState::Stopped)
    }

    async fn reboot(&self, name: &str) -> Result<(), RuntimeError> {
        self.set_state(name, ContainerState::Running)
    }

    async fn destroy(&self, name: &str) -> Result<(), RuntimeError> {
        let mut table = self.containers.lock().unwrap();
        table
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound {
                name: name.to_string(),
            })
    }

    async fn exec(
        &self,
        _name: &str,
        command: &[String],
        tty: OwnedFd,
    ) -> Result<ExitStatus, RuntimeError> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| RuntimeError::InvalidCommand(String::new()))?;
        self.execs.fetch_add(1, Ordering::SeqCst);

        let mut cmd = Command::new(program);
        cmd.args(args).env_clear();
        Ok(run_on_tty(cmd, tty).await?)
    }
}

// ============================================================================
// Daemon
// ============================================================================

/// A daemon on a temporary socket, backed by a [`HostRuntime`].
pub struct TestDaemon {
    pub daemon: Daemon,
    pub runtime: Arc<HostRuntime>,
    _temp_dir: TempDir,
}

impl TestDaemon {
    pub async fn start() -> Self {
        Self::start_with(None).await
    }

    /// Starts a daemon, optionally also listening on `tcp`.
    pub async fn start_with(tcp: Option<&str>) -> Self {
        let temp_dir = tempfile::tempdir().expect("create temp dir");
        let config = test_config(temp_dir.path(), tcp);
        let runtime = HostRuntime::new();
        let daemon = Daemon::start(config, runtime.clone())
            .await
            .expect("start daemon");

        assert!(
            daemon.socket_path().exists(),
            "Daemon socket missing after start"
        );

        Self {
            daemon,
            runtime,
            _temp_dir: temp_dir,
        }
    }

    pub fn socket_path(&self) -> PathBuf {
        self.daemon.socket_path().to_path_buf()
    }

    pub fn client(&self) -> Client {
        Client::new(Endpoint::Unix(self.socket_path()))
    }

    pub async fn stop(self) {
        timeout(WAIT_TIMEOUT, self.daemon.stop())
            .await
            .expect("daemon stop timed out")
            .expect("daemon stop failed");
    }
}

/// Daemon config rooted at `dir`, with id tables granting the current user
/// one range. Relay binding follows the user-config defaults.
pub fn test_config(dir: &Path, tcp: Option<&str>) -> DaemonConfig {
    let uid = nix::unistd::getuid().as_raw();
    let line = format!("{uid}:100000:65536\n");
    let subuid_path = dir.join("subuid");
    let subgid_path = dir.join("subgid");
    std::fs::write(&subuid_path, &line).unwrap();
    std::fs::write(&subgid_path, &line).unwrap();

    let user_config = Config {
        listen_addr: tcp.map(str::to_string),
        subuid_path,
        subgid_path,
        ..Config::default()
    };
    DaemonConfig {
        socket_path: dir.join("unix.socket"),
        ..DaemonConfig::from_config(&user_config)
    }
}

// ============================================================================
// Raw requests
// ============================================================================

/// Sends a bare `GET` over the Unix socket and returns the status code and
/// body.
pub async fn raw_get(socket: &Path, target: &str) -> (u16, String) {
    let mut stream = UnixStream::connect(socket).await.unwrap();
    let request = format!("GET {target} HTTP/1.1\r\nHost: flex\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut raw = Vec::new();
    timeout(WAIT_TIMEOUT, stream.read_to_end(&mut raw))
        .await
        .expect("reply timed out")
        .unwrap();
    let text = String::from_utf8_lossy(&raw).into_owned();

    let status = text
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("status line");
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    (status, body)
}

// ============================================================================
// Relay helpers
// ============================================================================

/// Dials the relay on `port` and presents `secret`.
pub async fn dial_relay(port: u16, secret: &[u8]) -> TcpStream {
    let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))
        .await
        .expect("dial relay");
    stream.write_all(secret).await.unwrap();
    stream
}

/// Reads from `stream` until the output contains `needle`.
pub async fn read_until(stream: &mut TcpStream, needle: &str) -> String {
    let mut seen = Vec::new();
    let deadline = Instant::now() + WAIT_TIMEOUT;
    let mut buf = [0u8; 1024];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let n = timeout(remaining, stream.read(&mut buf))
            .await
            .unwrap_or_else(|_| {
                panic!(
                    "Timed out waiting for {needle:?}; got {:?}",
                    String::from_utf8_lossy(&seen)
                )
            })
            .unwrap();
        assert!(
            n > 0,
            "Relay closed before {needle:?}; got {:?}",
            String::from_utf8_lossy(&seen)
        );
        seen.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&seen);
        if text.contains(needle) {
            return text.into_owned();
        }
    }
}

/// Waits for the daemon to close `stream`, discarding anything it sends.
pub async fn wait_closed(stream: &mut TcpStream) {
    let mut buf = [0u8; 1024];
    timeout(WAIT_TIMEOUT, async {
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await
    .expect("relay connection was not closed");
}

/// Polls `check` until it holds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT_TIMEOUT;
    while !check() {
        assert!(Instant::now() < deadline, "Condition not met in time");
        sleep(POLL_INTERVAL).await;
    }
}
