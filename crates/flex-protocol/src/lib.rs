//! flex protocol - control channel between the `flex` client and the daemon
//!
//! Requests are HTTP/1.1 `GET`s whose path names a [`Route`] and whose query
//! string carries [`Params`]. Replies are short plain-text bodies described
//! in [`message`].

pub mod message;
pub mod params;
pub mod route;
pub mod version;

use thiserror::Error;

pub use message::{AttachReply, Failure, ListEntry};
pub use params::{Params, MAX_SECRET_LEN};
pub use route::Route;
pub use version::{ProtocolVersion, VersionError, VERSION_HEADER};

/// Errors from decoding requests or replies.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Missing parameter: {0}")]
    MissingParam(&'static str),

    #[error("Unexpected reply: {0:?}")]
    InvalidBody(String),
}
