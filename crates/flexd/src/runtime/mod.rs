//! Container runtime seam.
//!
//! The daemon never talks to LXC directly; every container operation goes
//! through [`ContainerRuntime`]. [`LxcRuntime`] drives the `lxc-*` tools,
//! tests plug in their own implementations.

mod lxc;

pub use lxc::LxcRuntime;

use std::io;
use std::os::fd::OwnedFd;
use std::process::ExitStatus;

use async_trait::async_trait;
use thiserror::Error;

use flex_core::{ContainerInfo, IdMap, Lifecycle, Template};

/// Errors reported by a container runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Container {name:?} does not exist")]
    NotFound { name: String },

    #[error("Failed to run {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{tool} exited with {status}: {stderr}")]
    CommandFailed {
        tool: &'static str,
        status: ExitStatus,
        stderr: String,
    },

    #[error("Invalid command: {0:?}")]
    InvalidCommand(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Operations the daemon needs from a container backend.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    /// Lists all containers, in a stable order.
    async fn list(&self) -> Result<Vec<ContainerInfo>, RuntimeError>;

    /// Looks up one container; `RuntimeError::NotFound` if it does not exist.
    async fn lookup(&self, name: &str) -> Result<ContainerInfo, RuntimeError>;

    /// Creates an unprivileged container mapped onto `idmap`.
    async fn create(
        &self,
        name: &str,
        template: &Template,
        idmap: &IdMap,
    ) -> Result<(), RuntimeError>;

    async fn start(&self, name: &str) -> Result<(), RuntimeError>;

    async fn stop(&self, name: &str) -> Result<(), RuntimeError>;

    async fn reboot(&self, name: &str) -> Result<(), RuntimeError>;

    async fn destroy(&self, name: &str) -> Result<(), RuntimeError>;

    /// Runs `command` inside the container with a cleared environment and
    /// `tty` as its standard streams, returning when the process exits.
    ///
    /// Implementations must close their copies of `tty` once the process
    /// has been started, and must kill the process if the returned future
    /// is dropped.
    async fn exec(
        &self,
        name: &str,
        command: &[String],
        tty: OwnedFd,
    ) -> Result<ExitStatus, RuntimeError>;

    /// Applies a lifecycle operation by name.
    async fn apply(&self, name: &str, op: Lifecycle) -> Result<(), RuntimeError> {
        match op {
            Lifecycle::Start => self.start(name).await,
            Lifecycle::Stop => self.stop(name).await,
            Lifecycle::Reboot => self.reboot(name).await,
            Lifecycle::Destroy => self.destroy(name).await,
        }
    }
}

/// Splits an attach command line into arguments.
///
/// Arguments are separated by whitespace; there is no quoting.
pub fn split_command(command: &str) -> Result<Vec<String>, RuntimeError> {
    let argv: Vec<String> = command.split_whitespace().map(str::to_string).collect();
    if argv.is_empty() {
        return Err(RuntimeError::InvalidCommand(command.to_string()));
    }
    Ok(argv)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_command() {
        assert_eq!(
            split_command("/bin/bash -l").unwrap(),
            vec!["/bin/bash".to_string(), "-l".to_string()]
        );
        assert_eq!(split_command("  ls   /  ").unwrap().len(), 2);
    }

    #[test]
    fn test_split_command_rejects_blank() {
        assert!(matches!(
            split_command("   "),
            Err(RuntimeError::InvalidCommand(_))
        ));
    }
}
