//! flex client - talks to the flex daemon over its control channel
//!
//! - [`Client`] issues ping, list, create, attach and lifecycle requests
//! - [`relay`] joins the local terminal to an attach session
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate avoids `.unwrap()`, `.expect()`,
//! `panic!()`; every failure surfaces as a [`ClientError`].

pub mod client;
pub mod error;
pub mod relay;

pub use client::{generate_secret, Client, Endpoint};
pub use error::{ClientError, Result};
