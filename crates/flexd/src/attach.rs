//! Interactive attach sessions.
//!
//! An attach request opens a one-shot TCP listener on an ephemeral port and
//! tells the client which port to dial. The first connection must present
//! the request's secret as its first bytes; after that the connection is
//! relayed to a pseudo-terminal running the requested command inside the
//! container.
//!
//! ```text
//!  Requested ──▶ ListenerOpen ──▶ Authenticating ──▶ Relaying ──▶ Closed
//!                                       │                            ▲
//!                                       └──── wrong secret ──────────┘
//! ```
//!
//! While relaying, two pump tasks copy bytes network→terminal and
//! terminal→network. Both run under a session token that is a child of the
//! daemon's token, so stopping the daemon tears every session down.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`
//! - Buffer slicing goes through `get()`
//! - Every failure ends in a `CloseReason` and a log line

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use flex_protocol::MAX_SECRET_LEN;

use crate::pty::Pty;
use crate::runtime::ContainerRuntime;

/// Longest secret a session accepts.
pub const SECRET_LIMIT: usize = MAX_SECRET_LEN;

/// How long the listener waits for the client to dial in.
pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(60);

/// How long an accepted connection has to send the secret.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// How long terminal output is drained after the process exits.
pub const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// How long a hung-up process gets to exit before it is killed.
pub const EXIT_GRACE: Duration = Duration::from_secs(2);

const RELAY_BUFFER_SIZE: usize = 8 * 1024;

// ============================================================================
// Types
// ============================================================================

/// A validated attach request.
#[derive(Clone)]
pub struct AttachRequest {
    pub name: String,
    pub command: Vec<String>,
    pub secret: Vec<u8>,
}

impl fmt::Debug for AttachRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachRequest")
            .field("name", &self.name)
            .field("command", &self.command)
            .field("secret_len", &self.secret.len())
            .finish()
    }
}

/// Errors raised before the session is handed to its background task.
#[derive(Error, Debug)]
pub enum AttachError {
    #[error("Attach secret is empty")]
    EmptySecret,

    #[error("Attach secret is {len} bytes, limit is {max}")]
    SecretTooLong { len: usize, max: usize },

    #[error("Failed to bind relay listener on {addr}: {source}")]
    Bind {
        addr: Ipv4Addr,
        #[source]
        source: io::Error,
    },
}

/// Lifecycle of a session, as reported in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Requested,
    ListenerOpen,
    Authenticating,
    Relaying,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Requested => "requested",
            Self::ListenerOpen => "listener-open",
            Self::Authenticating => "authenticating",
            Self::Relaying => "relaying",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The relay connection did not present the secret
    AuthFailed,
    /// The process exited on its own; `None` if it was killed by a signal
    Exited(Option<i32>),
    /// The client went away and the terminal was hung up
    Hangup,
    /// The daemon is stopping
    Cancelled,
    /// Something failed on the daemon side
    Failed(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthFailed => f.write_str("authentication failed"),
            Self::Exited(Some(code)) => write!(f, "exited with code {code}"),
            Self::Exited(None) => f.write_str("killed by signal"),
            Self::Hangup => f.write_str("hangup"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::Failed(msg) => write!(f, "failed: {msg}"),
        }
    }
}

/// Returns true if `received` is exactly `secret`.
pub fn secret_matches(received: &[u8], secret: &[u8]) -> bool {
    received.len() == secret.len() && received == secret
}

// ============================================================================
// Session
// ============================================================================

/// An attach session whose listener is bound and waiting for the client.
#[derive(Debug)]
pub struct AttachSession {
    request: AttachRequest,
    listener: TcpListener,
    port: u16,
}

impl AttachSession {
    /// Validates the request and binds the relay listener on `bind`.
    pub async fn listen(request: AttachRequest, bind: Ipv4Addr) -> Result<Self, AttachError> {
        debug!(state = %SessionState::Requested, container = %request.name, "Attach session");

        if request.secret.is_empty() {
            return Err(AttachError::EmptySecret);
        }
        if request.secret.len() > SECRET_LIMIT {
            return Err(AttachError::SecretTooLong {
                len: request.secret.len(),
                max: SECRET_LIMIT,
            });
        }

        let bind_err = |source| AttachError::Bind { addr: bind, source };
        let listener = TcpListener::bind(SocketAddrV4::new(bind, 0))
            .await
            .map_err(bind_err)?;
        let port = listener.local_addr().map_err(bind_err)?.port();

        debug!(state = %SessionState::ListenerOpen, port, "Attach session");
        Ok(Self {
            request,
            listener,
            port,
        })
    }

    /// Port the client must dial.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Drives the session to completion.
    pub async fn run(
        self,
        runtime: Arc<dyn ContainerRuntime>,
        cancel: CancellationToken,
    ) -> CloseReason {
        let Self {
            request, listener, ..
        } = self;

        let reason = match authenticate(listener, &request.secret, &cancel).await {
            Ok((conn, peer)) => {
                info!(state = %SessionState::Relaying, peer = %peer, command = ?request.command, "Attaching");
                relay(conn, &request, runtime, &cancel).await
            }
            Err(reason) => reason,
        };

        info!(state = %SessionState::Closed, reason = %reason, "Attach session");
        reason
    }
}

/// Accepts exactly one connection and checks its secret.
async fn authenticate(
    listener: TcpListener,
    secret: &[u8],
    cancel: &CancellationToken,
) -> Result<(TcpStream, SocketAddr), CloseReason> {
    let accepted = tokio::select! {
        _ = cancel.cancelled() => return Err(CloseReason::Cancelled),
        res = timeout(ACCEPT_TIMEOUT, listener.accept()) => res,
    };
    drop(listener);

    let (mut conn, peer) = match accepted {
        Ok(Ok(pair)) => pair,
        Ok(Err(e)) => {
            warn!(error = %e, "Failed to accept relay connection");
            return Err(CloseReason::Failed(e.to_string()));
        }
        Err(_) => {
            warn!("No relay connection before deadline");
            return Err(CloseReason::Failed("no relay connection".to_string()));
        }
    };
    debug!(state = %SessionState::Authenticating, peer = %peer, "Attach session");

    // Exactly the secret's length is consumed; anything after it is relay input.
    let mut received = vec![0u8; secret.len()];
    tokio::select! {
        _ = cancel.cancelled() => return Err(CloseReason::Cancelled),
        res = timeout(AUTH_TIMEOUT, conn.read_exact(&mut received)) => match res {
            Ok(Ok(_)) => {}
            Ok(Err(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                warn!(peer = %peer, expected = secret.len(), "Relay connection closed before the full secret");
                return Err(CloseReason::AuthFailed);
            }
            Ok(Err(e)) => {
                warn!(peer = %peer, error = %e, "Bad read from relay connection");
                return Err(CloseReason::AuthFailed);
            }
            Err(_) => {
                warn!(peer = %peer, expected = secret.len(), "Relay connection sent no full secret");
                return Err(CloseReason::AuthFailed);
            }
        },
    }

    if !secret_matches(&received, secret) {
        warn!(peer = %peer, "Secret mismatch");
        return Err(CloseReason::AuthFailed);
    }
    Ok((conn, peer))
}

// ============================================================================
// Relay
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// network → terminal
    Inbound,
    /// terminal → network
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inbound => f.write_str("inbound"),
            Self::Outbound => f.write_str("outbound"),
        }
    }
}

async fn relay(
    conn: TcpStream,
    request: &AttachRequest,
    runtime: Arc<dyn ContainerRuntime>,
    cancel: &CancellationToken,
) -> CloseReason {
    let (master, slave) = match Pty::open().and_then(Pty::into_parts) {
        Ok(parts) => parts,
        Err(e) => {
            warn!(error = %e, "Failed to open pty");
            return CloseReason::Failed(format!("failed opening pty: {e}"));
        }
    };

    let token = cancel.child_token();
    let (pty_read, pty_write) = tokio::io::split(master);
    let (net_read, net_write) = conn.into_split();

    let mut inbound = tokio::spawn(pump(Direction::Inbound, net_read, pty_write, token.clone()));
    let mut outbound = tokio::spawn(pump(Direction::Outbound, pty_read, net_write, token.clone()));

    let mut exec = runtime.exec(&request.name, &request.command, slave);

    let finished = tokio::select! {
        biased;
        res = &mut exec => Some(res),
        _ = token.cancelled() => None,
    };

    match finished {
        Some(result) => {
            let drained = timeout(DRAIN_GRACE, &mut outbound).await.is_ok();
            token.cancel();
            join_pump(Direction::Inbound, &mut inbound).await;
            if !drained {
                join_pump(Direction::Outbound, &mut outbound).await;
            }
            match result {
                Ok(status) => CloseReason::Exited(status.code()),
                Err(e) => {
                    warn!(error = %e, "Exec failed");
                    CloseReason::Failed(e.to_string())
                }
            }
        }
        None => {
            // Both pumps own a half of the master; joining them closes it.
            join_pump(Direction::Inbound, &mut inbound).await;
            join_pump(Direction::Outbound, &mut outbound).await;

            let status = match timeout(EXIT_GRACE, &mut exec).await {
                Ok(Ok(status)) => Some(status),
                Ok(Err(e)) => {
                    debug!(error = %e, "Exec failed after hangup");
                    None
                }
                Err(_) => {
                    warn!("Process ignored hangup, killing it");
                    None
                }
            };
            drop(exec);

            if cancel.is_cancelled() {
                CloseReason::Cancelled
            } else {
                match status.and_then(|s| s.code()) {
                    Some(code) => CloseReason::Exited(Some(code)),
                    None => CloseReason::Hangup,
                }
            }
        }
    }
}

async fn join_pump(direction: Direction, handle: &mut JoinHandle<u64>) {
    match handle.await {
        Ok(bytes) => debug!(%direction, bytes, "Relay pump finished"),
        Err(e) => warn!(%direction, error = %e, "Relay pump task failed"),
    }
}

/// Copies `reader` into `writer` until end-of-file, an error or cancellation.
///
/// The inbound pump cancels the session when it stops, since the client is
/// gone. The outbound pump only cancels on errors; its end-of-file means the
/// process closed the terminal.
async fn pump<R, W>(direction: Direction, mut reader: R, mut writer: W, token: CancellationToken) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total: u64 = 0;

    loop {
        let n = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            res = reader.read(&mut buf) => match res {
                Ok(0) => {
                    debug!(%direction, "Relay reached end of input");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    debug!(%direction, error = %e, "Relay read failed");
                    token.cancel();
                    break;
                }
            },
        };

        let chunk = buf.get(..n).unwrap_or_default();
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            res = writer.write_all(chunk) => {
                if let Err(e) = res {
                    debug!(%direction, error = %e, "Relay write failed");
                    token.cancel();
                    break;
                }
            }
        }
        total += n as u64;
    }

    let _ = writer.shutdown().await;
    if direction == Direction::Inbound {
        token.cancel();
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_secret_matches_exact_bytes() {
        assert!(secret_matches(b"s3cret", b"s3cret"));
        assert!(!secret_matches(b"S3CRET", b"s3cret"));
        assert!(!secret_matches(b"s3cre", b"s3cret"));
        assert!(!secret_matches(b"s3cret\n", b"s3cret"));
    }

    #[test]
    fn test_close_reason_display() {
        assert_eq!(CloseReason::Exited(Some(0)).to_string(), "exited with code 0");
        assert_eq!(CloseReason::AuthFailed.to_string(), "authentication failed");
    }

    #[test]
    fn test_request_debug_hides_secret() {
        let req = AttachRequest {
            name: "c1".into(),
            command: vec!["/bin/sh".into()],
            secret: b"topsecret".to_vec(),
        };
        let shown = format!("{req:?}");
        assert!(!shown.contains("topsecret"));
        assert!(shown.contains("secret_len: 9"));
    }

    #[tokio::test]
    async fn test_listen_rejects_bad_secrets() {
        let mut req = AttachRequest {
            name: "c1".into(),
            command: vec!["/bin/sh".into()],
            secret: Vec::new(),
        };
        assert!(matches!(
            AttachSession::listen(req.clone(), Ipv4Addr::LOCALHOST).await,
            Err(AttachError::EmptySecret)
        ));

        req.secret = vec![b'a'; SECRET_LIMIT + 1];
        assert!(matches!(
            AttachSession::listen(req, Ipv4Addr::LOCALHOST).await,
            Err(AttachError::SecretTooLong { .. })
        ));
    }

    #[tokio::test]
    async fn test_listen_binds_ephemeral_port() {
        let req = AttachRequest {
            name: "c1".into(),
            command: vec!["/bin/sh".into()],
            secret: b"abc".to_vec(),
        };
        let session = AttachSession::listen(req, Ipv4Addr::LOCALHOST).await.unwrap();
        assert_ne!(session.port(), 0);
    }

    #[tokio::test]
    async fn test_pump_copies_until_eof() {
        let token = CancellationToken::new();
        let (client, mut server) = tokio::io::duplex(64);
        let (mut out_read, out_write) = tokio::io::duplex(64);

        let task = tokio::spawn(pump(Direction::Outbound, client, out_write, token.clone()));
        server.write_all(b"hello").await.unwrap();
        drop(server);

        let copied = task.await.unwrap();
        assert_eq!(copied, 5);
        assert!(!token.is_cancelled());

        let mut got = Vec::new();
        out_read.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn test_inbound_pump_cancels_on_eof() {
        let token = CancellationToken::new();
        let (client, server) = tokio::io::duplex(64);
        let (_sink_read, sink_write) = tokio::io::duplex(64);
        drop(server);

        pump(Direction::Inbound, client, sink_write, token.clone()).await;
        assert!(token.is_cancelled());
    }
}
