//! flex core - shared types for the flex daemon and client
//!
//! This crate provides the domain types shared between
//! the daemon (flexd) and the client (flex-client):
//! - `idmap` - subordinate uid/gid ranges delegated to containers
//! - `container` - container names, states and templates
//! - `config` - the on-disk client/daemon configuration
//! - `paths` - the runtime directory (`FLEX_DIR`)
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod config;
pub mod container;
pub mod error;
pub mod idmap;
pub mod paths;

// Re-exports for convenience
pub use config::{Config, ConfigError, RemoteConfig};
pub use container::{ContainerInfo, ContainerName, ContainerState, Lifecycle, Template};
pub use error::{DomainError, DomainResult};
pub use idmap::{IdMap, IdMapError, IdOwner, IdRange};
pub use paths::{flex_dir, var_path, DEFAULT_FLEX_DIR, FLEX_DIR_ENV};
