//! Control-channel client.
//!
//! Each call opens a fresh HTTP/1.1 connection to the daemon, sends one
//! `GET` and reads the text reply. Reply bodies are checked against the
//! shape each route answers with on success; anything else is returned as
//! `ClientError::Daemon` carrying the daemon's failure text.
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()`.

use std::fmt;
use std::path::PathBuf;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper::header::HOST;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use rand::distr::Alphanumeric;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};
use tracing::debug;

use flex_core::{var_path, Config, Lifecycle, Template};
use flex_protocol::message::{parse_list, CREATE_OK, PONG};
use flex_protocol::params::{self as param, Params};
use flex_protocol::{AttachReply, ListEntry, ProtocolVersion, Route, VERSION_HEADER};

use crate::error::{ClientError, Result};

/// Length of generated attach secrets.
pub const SECRET_LEN: usize = 32;

/// Generates a random alphanumeric attach secret.
pub fn generate_secret() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(SECRET_LEN)
        .map(char::from)
        .collect()
}

// ============================================================================
// Endpoint
// ============================================================================

/// Where the daemon is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// Local Unix socket
    Unix(PathBuf),
    /// Remote `host:port`
    Tcp(String),
}

impl Endpoint {
    /// The local daemon socket under `$FLEX_DIR`.
    pub fn local() -> Self {
        Self::Unix(var_path(["unix.socket"]))
    }

    /// Chooses the endpoint for `remote`, falling back to the configured
    /// default remote and then to the local socket.
    pub fn from_config(config: &Config, remote: Option<&str>) -> Result<Self> {
        let Some(name) = remote.or(config.default_remote.as_deref()) else {
            return Ok(Self::local());
        };
        config
            .remote_addr(Some(name))
            .map(|addr| Self::Tcp(addr.to_string()))
            .ok_or_else(|| ClientError::UnknownRemote(name.to_string()))
    }

    /// Host the attach relay is dialed on.
    ///
    /// Relay listeners are bound on the daemon's machine, so a local daemon
    /// is reached over loopback and a remote one over its own host name.
    pub fn relay_host(&self) -> String {
        match self {
            Self::Unix(_) => "127.0.0.1".to_string(),
            Self::Tcp(addr) => {
                let host = addr.rsplit_once(':').map_or(addr.as_str(), |(h, _)| h);
                host.trim_start_matches('[').trim_end_matches(']').to_string()
            }
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "{}", path.display()),
            Self::Tcp(addr) => f.write_str(addr),
        }
    }
}

// ============================================================================
// Client
// ============================================================================

/// A handle for issuing requests to one daemon.
#[derive(Debug, Clone)]
pub struct Client {
    endpoint: Endpoint,
}

impl Client {
    pub fn new(endpoint: Endpoint) -> Self {
        Self { endpoint }
    }

    /// Resolves the endpoint from `config` and checks the daemon answers.
    pub async fn connect(config: &Config, remote: Option<&str>) -> Result<Self> {
        let client = Self::new(Endpoint::from_config(config, remote)?);
        client.ping().await?;
        Ok(client)
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub async fn ping(&self) -> Result<()> {
        let body = self.get(Route::Ping, &Params::new()).await?;
        expect_body(body, PONG)
    }

    pub async fn list(&self) -> Result<Vec<ListEntry>> {
        let body = self.get(Route::List, &Params::new()).await?;
        parse_list(&body).map_err(|_| ClientError::Daemon(body))
    }

    pub async fn create(&self, name: &str, template: &Template) -> Result<()> {
        let params = Params::new()
            .with(param::NAME, name)
            .with(param::DISTRO, template.distro.as_str())
            .with(param::RELEASE, template.release.as_str())
            .with(param::ARCH, template.arch.as_str());
        let body = self.get(Route::Create, &params).await?;
        expect_body(body, CREATE_OK)
    }

    /// Asks the daemon to open an attach session and returns its relay port.
    pub async fn attach(&self, name: &str, command: &str, secret: &str) -> Result<AttachReply> {
        let params = Params::new()
            .with(param::NAME, name)
            .with(param::COMMAND, command)
            .with(param::SECRET, secret);
        let body = self.get(Route::Attach, &params).await?;
        AttachReply::parse(&body).map_err(|_| ClientError::Daemon(body))
    }

    /// Dials the relay announced in `reply` and presents `secret`.
    ///
    /// The returned stream is connected to the session's terminal.
    pub async fn open_relay(&self, reply: AttachReply, secret: &str) -> Result<TcpStream> {
        let addr = format!("{}:{}", self.endpoint.relay_host(), reply.port);
        debug!(%addr, "Dialing attach relay");
        let mut stream = TcpStream::connect(addr.as_str())
            .await
            .map_err(ClientError::Relay)?;
        stream
            .write_all(secret.as_bytes())
            .await
            .map_err(ClientError::Relay)?;
        Ok(stream)
    }

    pub async fn lifecycle(&self, op: Lifecycle, name: &str) -> Result<()> {
        let params = Params::new().with(param::NAME, name);
        let body = self.get(Route::Lifecycle(op), &params).await?;
        expect_body(body, "")
    }

    pub async fn start(&self, name: &str) -> Result<()> {
        self.lifecycle(Lifecycle::Start, name).await
    }

    pub async fn stop(&self, name: &str) -> Result<()> {
        self.lifecycle(Lifecycle::Stop, name).await
    }

    pub async fn reboot(&self, name: &str) -> Result<()> {
        self.lifecycle(Lifecycle::Reboot, name).await
    }

    pub async fn destroy(&self, name: &str) -> Result<()> {
        self.lifecycle(Lifecycle::Destroy, name).await
    }

    /// Sends one request and returns the reply body.
    async fn get(&self, route: Route, params: &Params) -> Result<String> {
        let uri = if params.is_empty() {
            route.path()
        } else {
            format!("{}?{}", route.path(), params.encode())
        };
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .header(HOST, "flex")
            .header(VERSION_HEADER, ProtocolVersion::CURRENT.to_string())
            .body(Empty::<Bytes>::new())
            .map_err(|e| ClientError::Request(e.to_string()))?;

        let connect_err = |source| ClientError::Connect {
            endpoint: self.endpoint.to_string(),
            source,
        };
        let response = match &self.endpoint {
            Endpoint::Unix(path) => {
                let stream = UnixStream::connect(path).await.map_err(connect_err)?;
                send_on(stream, request).await?
            }
            Endpoint::Tcp(addr) => {
                let stream = TcpStream::connect(addr.as_str()).await.map_err(connect_err)?;
                send_on(stream, request).await?
            }
        };

        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        let text = String::from_utf8_lossy(&body).into_owned();
        debug!(route = %route, status = status.as_u16(), "Daemon replied");

        if !status.is_success() {
            return Err(ClientError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        Ok(text)
    }
}

async fn send_on<S>(stream: S, request: Request<Empty<Bytes>>) -> Result<Response<Incoming>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "Daemon connection ended");
        }
    });
    Ok(sender.send_request(request).await?)
}

fn expect_body(body: String, expected: &str) -> Result<()> {
    if body.trim() == expected {
        Ok(())
    } else {
        Err(ClientError::Daemon(body))
    }
}
