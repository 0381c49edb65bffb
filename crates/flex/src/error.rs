//! Error types for the flex client.
//!
//! **Panic-Free Policy:** No `.unwrap()`, `.expect()`, `panic!()`,
//! `unreachable!()`, or `todo!()` in this crate's production code.

use std::io;
use thiserror::Error;

/// Client errors.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The daemon could not be reached.
    ///
    /// Usually means `flex daemon` is not running, or `FLEX_DIR` points
    /// somewhere else than the daemon's.
    #[error("Cannot connect to daemon at {endpoint}: {source}")]
    Connect {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// HTTP-level failure talking to the daemon.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// The request could not be built.
    #[error("Invalid request: {0}")]
    Request(String),

    /// The daemon answered with an error status.
    #[error("Daemon returned {status}: {body}")]
    Status { status: u16, body: String },

    /// The daemon reported a failure in the reply body.
    #[error("Daemon error: {0}")]
    Daemon(String),

    /// No remote with this name is configured.
    #[error("Unknown remote: {0}")]
    UnknownRemote(String),

    /// The attach relay connection failed.
    #[error("Relay error: {0}")]
    Relay(#[source] io::Error),

    /// The local terminal could not be switched to raw mode.
    #[error("Terminal error: {0}")]
    Terminal(#[source] io::Error),
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_names_endpoint() {
        let err = ClientError::Connect {
            endpoint: "/var/lib/flex/unix.socket".to_string(),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        assert!(err.to_string().contains("/var/lib/flex/unix.socket"));
    }

    #[test]
    fn test_daemon_error_display() {
        let err = ClientError::Daemon("failed getting container".to_string());
        assert_eq!(err.to_string(), "Daemon error: failed getting container");
    }
}
