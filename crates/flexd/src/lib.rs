//! flexd - container lifecycle and interactive attach daemon
//!
//! This crate provides the daemon side of flex:
//! - `server` - Supervisor owning the control listeners and serve loop
//! - `dispatch` - Routes control requests to the runtime and attach sessions
//! - `attach` - One-shot relay listener, secret handshake and pty relay
//! - `runtime` - The container runtime seam and its LXC implementation
//! - `pty` - Pseudo-terminal allocation and async master I/O
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         flexd                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │     Daemon      │────▶│        Dispatcher           │   │
//! │  │ (unix + tcp)    │     │  ping list create lifecycle │   │
//! │  └─────────────────┘     └──────────────┬──────────────┘   │
//! │                                         │ attach            │
//! │                                         ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │ ContainerRuntime│◀────│      AttachSession          │   │
//! │  │   (LXC tools)   │ exec│  tcp relay ◀──▶ pty master  │   │
//! │  └─────────────────┘     └─────────────────────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows a panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Per-request and per-session failures never stop the daemon

pub mod attach;
pub mod dispatch;
pub mod pty;
pub mod runtime;
pub mod server;

pub use attach::{AttachRequest, AttachSession, CloseReason};
pub use dispatch::{Dispatcher, Peer, Reply};
pub use runtime::{ContainerRuntime, LxcRuntime, RuntimeError};
pub use server::{Daemon, DaemonConfig, DaemonError};
