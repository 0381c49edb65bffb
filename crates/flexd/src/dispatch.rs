//! Request dispatch: routes and parameters to runtime calls and replies.
//!
//! Every handler answers with a short text body. Per-request failures are
//! reported in the body and never affect the daemon itself.

use std::convert::Infallible;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Request, Response, StatusCode};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, info_span, warn, Instrument};

use flex_core::{ContainerName, IdMap, Lifecycle, Template};
use flex_protocol::message::{render_list, CREATE_FAILED, CREATE_OK, PONG};
use flex_protocol::params::{self as param, Params};
use flex_protocol::{
    AttachReply, Failure, ListEntry, ProtocolVersion, Route, MAX_SECRET_LEN, VERSION_HEADER,
};

use crate::attach::{AttachError, AttachRequest, AttachSession};
use crate::runtime::{split_command, ContainerRuntime};

/// Where a request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peer {
    Unix,
    Tcp(SocketAddr),
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix => f.write_str("unix socket"),
            Self::Tcp(addr) => write!(f, "{addr}"),
        }
    }
}

/// A text reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub status: StatusCode,
    pub body: String,
}

impl Reply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: StatusCode::OK,
            body: body.into(),
        }
    }

    pub fn into_response(self) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(self.body)));
        *response.status_mut() = self.status;
        response.headers_mut().insert(
            CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}

impl From<Failure> for Reply {
    fn from(failure: Failure) -> Self {
        Self {
            status: StatusCode::from_u16(failure.status()).unwrap_or(StatusCode::OK),
            body: failure.to_string(),
        }
    }
}

/// Routes requests to the container runtime and attach sessions.
pub struct Dispatcher {
    runtime: Arc<dyn ContainerRuntime>,
    idmap: IdMap,
    relay_bind: Ipv4Addr,
    sessions: TaskTracker,
    cancel: CancellationToken,
}

impl Dispatcher {
    /// Creates a dispatcher.
    ///
    /// Attach sessions are spawned on `sessions` with a child of `cancel`.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        idmap: IdMap,
        relay_bind: Ipv4Addr,
        sessions: TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runtime,
            idmap,
            relay_bind,
            sessions,
            cancel,
        }
    }

    /// Serves one HTTP request.
    pub async fn handle<B>(
        self: Arc<Self>,
        request: Request<B>,
        peer: Peer,
    ) -> Result<Response<Full<Bytes>>, Infallible> {
        let (parts, body) = request.into_parts();
        drop(body);
        let version = parts
            .headers
            .get(VERSION_HEADER)
            .map(|v| v.to_str().unwrap_or_default().to_string());
        let path = parts.uri.path().to_string();
        let query = parts.uri.query().map(str::to_string);

        let reply = self
            .dispatch(&path, query.as_deref(), version.as_deref(), peer)
            .await;
        Ok(reply.into_response())
    }

    /// Dispatches a request by path and query string.
    pub async fn dispatch(
        &self,
        path: &str,
        query: Option<&str>,
        version: Option<&str>,
        peer: Peer,
    ) -> Reply {
        if let Err(e) = ProtocolVersion::check_header(version) {
            warn!(%peer, error = %e, "Rejecting request");
            return Failure::IncompatibleVersion(e.to_string()).into();
        }

        let Some(route) = Route::parse(path) else {
            debug!(%peer, path, "Unknown route");
            return Failure::UnknownRoute(path.to_string()).into();
        };

        info!(%peer, "Responding to {route}");
        let params = Params::parse(query.unwrap_or_default());

        let result = match route {
            Route::Ping => Ok(Reply::ok(PONG)),
            Route::List => self.list().await,
            Route::Create => self.create(&params).await,
            Route::Attach => self.attach(&params).await,
            Route::Lifecycle(op) => self.lifecycle(op, &params).await,
        };
        result.unwrap_or_else(Reply::from)
    }

    async fn list(&self) -> Result<Reply, Failure> {
        let containers = self.runtime.list().await.map_err(|e| {
            warn!(error = %e, "Listing containers failed");
            Failure::Operation
        })?;
        let entries: Vec<ListEntry> = containers
            .into_iter()
            .enumerate()
            .map(|(index, c)| ListEntry {
                index,
                name: c.name,
                state: c.state,
            })
            .collect();
        Ok(Reply::ok(render_list(&entries)))
    }

    async fn create(&self, params: &Params) -> Result<Reply, Failure> {
        let name = require_name(params)?;
        let template = Template::new(
            params.require(param::DISTRO)?,
            params.require(param::RELEASE)?,
            params.require(param::ARCH)?,
        );

        match self.runtime.create(name.as_str(), &template, &self.idmap).await {
            Ok(()) => Ok(Reply::ok(CREATE_OK)),
            Err(e) => {
                warn!(container = %name, template = %template, error = %e, "Create failed");
                Ok(Reply::ok(CREATE_FAILED))
            }
        }
    }

    async fn attach(&self, params: &Params) -> Result<Reply, Failure> {
        let name = require_name(params)?;
        let command = split_command(params.require(param::COMMAND)?)
            .map_err(|_| Failure::Parse(param::COMMAND))?;
        let secret = params.require(param::SECRET)?;
        if secret.len() > MAX_SECRET_LEN {
            return Err(Failure::Parse(param::SECRET));
        }

        let request = AttachRequest {
            name: name.to_string(),
            command,
            secret: secret.as_bytes().to_vec(),
        };
        let session = AttachSession::listen(request, self.relay_bind)
            .await
            .map_err(|e| match e {
                AttachError::EmptySecret | AttachError::SecretTooLong { .. } => {
                    Failure::Parse(param::SECRET)
                }
                AttachError::Bind { .. } => {
                    warn!(error = %e, "Attach listener failed");
                    Failure::Listen
                }
            })?;

        let port = session.port();
        let span = info_span!("attach", container = %name, port);
        let runtime = Arc::clone(&self.runtime);
        let token = self.cancel.child_token();
        self.sessions
            .spawn(session.run(runtime, token).instrument(span));

        Ok(Reply::ok(AttachReply { port }.to_string()))
    }

    async fn lifecycle(&self, op: Lifecycle, params: &Params) -> Result<Reply, Failure> {
        let name = require_name(params)?;

        if let Err(e) = self.runtime.lookup(name.as_str()).await {
            debug!(container = %name, error = %e, "Lookup failed");
            return Err(Failure::LookupContainer);
        }
        if let Err(e) = self.runtime.apply(name.as_str(), op).await {
            warn!(container = %name, op = %op, error = %e, "Operation failed");
            return Err(Failure::Operation);
        }
        info!(container = %name, op = %op, "Operation complete");
        Ok(Reply::ok(""))
    }
}

fn require_name(params: &Params) -> Result<ContainerName, Failure> {
    let raw = params.require(param::NAME)?;
    ContainerName::parse(raw).map_err(|e| {
        debug!(error = %e, "Rejecting container name");
        Failure::Parse(param::NAME)
    })
}
