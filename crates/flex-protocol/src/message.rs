//! Response bodies exchanged over the control channel.
//!
//! Every response is plain text. Successful replies have a fixed shape per
//! route; failures are one of the [`Failure`] texts.

use std::convert::Infallible;
use std::fmt;

use flex_core::ContainerState;

use crate::ProtocolError;

/// Body of a successful `ping`.
pub const PONG: &str = "pong";

/// Body of a successful `create`.
pub const CREATE_OK: &str = "success!";

/// Body of a failed `create`.
pub const CREATE_FAILED: &str = "fail!";

/// Prefix of the `attach` reply line.
pub const PORT_PREFIX: &str = "Port:";

// ============================================================================
// List
// ============================================================================

/// One line of a `list` reply: `<index>: <name> (<state>)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListEntry {
    pub index: usize,
    pub name: String,
    pub state: ContainerState,
}

impl ListEntry {
    /// Parses a single list line.
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        let invalid = || ProtocolError::InvalidBody(line.to_string());

        let (index, rest) = line.split_once(": ").ok_or_else(invalid)?;
        let index = index.trim().parse::<usize>().map_err(|_| invalid())?;
        let rest = rest.trim_end().strip_suffix(')').ok_or_else(invalid)?;
        let (name, state) = rest.rsplit_once(" (").ok_or_else(invalid)?;
        if name.is_empty() {
            return Err(invalid());
        }

        Ok(Self {
            index,
            name: name.to_string(),
            state: state.parse().unwrap_or_else(|never: Infallible| match never {}),
        })
    }
}

impl fmt::Display for ListEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.index, self.name, self.state)
    }
}

/// Parses a full `list` reply; blank lines are ignored.
pub fn parse_list(body: &str) -> Result<Vec<ListEntry>, ProtocolError> {
    body.lines()
        .filter(|line| !line.trim().is_empty())
        .map(ListEntry::parse)
        .collect()
}

/// Renders entries as a `list` reply, one newline-terminated line each.
pub fn render_list(entries: &[ListEntry]) -> String {
    entries.iter().map(|e| format!("{e}\n")).collect()
}

// ============================================================================
// Attach
// ============================================================================

/// Reply to a successful `attach`: the relay port to dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttachReply {
    pub port: u16,
}

impl AttachReply {
    /// Extracts the port from the `Port:` line of a reply body.
    pub fn parse(body: &str) -> Result<Self, ProtocolError> {
        body.lines()
            .find_map(|line| line.trim().strip_prefix(PORT_PREFIX))
            .and_then(|port| port.trim().parse::<u16>().ok())
            .filter(|port| *port != 0)
            .map(|port| Self { port })
            .ok_or_else(|| ProtocolError::InvalidBody(body.to_string()))
    }
}

impl fmt::Display for AttachReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", PORT_PREFIX, self.port)
    }
}

// ============================================================================
// Failures
// ============================================================================

/// Failure texts the daemon answers with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// A required parameter was missing or unusable
    Parse(&'static str),
    /// The attach listener could not be bound
    Listen,
    /// The named container does not exist
    LookupContainer,
    /// The runtime rejected a lifecycle operation
    Operation,
    /// No route matches the request path
    UnknownRoute(String),
    /// The client speaks an incompatible protocol version
    IncompatibleVersion(String),
}

impl Failure {
    /// HTTP status the failure is sent with.
    ///
    /// Per-request failures travel with `200 OK` and are recognised by their
    /// body; only routing and versioning problems use error statuses.
    pub fn status(&self) -> u16 {
        match self {
            Self::UnknownRoute(_) => 404,
            Self::IncompatibleVersion(_) => 400,
            _ => 200,
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Parse(param) => write!(f, "failed parsing {param}"),
            Self::Listen => f.write_str("failed listening"),
            Self::LookupContainer => f.write_str("failed getting container"),
            Self::Operation => f.write_str("operation failed"),
            Self::UnknownRoute(path) => write!(f, "unknown route {path}"),
            Self::IncompatibleVersion(detail) => {
                write!(f, "incompatible protocol version: {detail}")
            }
        }
    }
}

impl From<ProtocolError> for Failure {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::MissingParam(p) => Self::Parse(p),
            ProtocolError::InvalidBody(_) => Self::Operation,
        }
    }
}
