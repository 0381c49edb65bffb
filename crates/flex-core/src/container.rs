//! Container names, states, templates and lifecycle operations.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Longest container name accepted.
pub const MAX_NAME_LEN: usize = 64;

// ============================================================================
// Container Name
// ============================================================================

/// Validated container name.
///
/// Names end up as command arguments and as file names under the runtime
/// directory, so only `[A-Za-z0-9._-]` is allowed and the first character
/// must be alphanumeric.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerName(String);

impl ContainerName {
    /// Validates and wraps a container name.
    ///
    /// # Errors
    ///
    /// Returns `DomainError::InvalidName` describing the first rule broken.
    pub fn parse(name: &str) -> DomainResult<Self> {
        let invalid = |reason| DomainError::InvalidName {
            name: name.to_string(),
            reason,
        };

        let first = name.chars().next().ok_or_else(|| invalid("name is empty"))?;
        if name.len() > MAX_NAME_LEN {
            return Err(invalid("name is too long"));
        }
        if !first.is_ascii_alphanumeric() {
            return Err(invalid("name must start with a letter or digit"));
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        {
            return Err(invalid("name contains invalid characters"));
        }
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ContainerName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ContainerName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<ContainerName> for String {
    fn from(name: ContainerName) -> Self {
        name.0
    }
}

// ============================================================================
// Container State
// ============================================================================

/// Runtime state of a container as reported by LXC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Aborting,
    Freezing,
    Frozen,
    Thawed,
    /// A state string the daemon does not know, kept verbatim
    Other(String),
}

impl ContainerState {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Stopped => "STOPPED",
            Self::Starting => "STARTING",
            Self::Running => "RUNNING",
            Self::Stopping => "STOPPING",
            Self::Aborting => "ABORTING",
            Self::Freezing => "FREEZING",
            Self::Frozen => "FROZEN",
            Self::Thawed => "THAWED",
            Self::Other(s) => s,
        }
    }
}

impl FromStr for ContainerState {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_uppercase().as_str() {
            "STOPPED" => Self::Stopped,
            "STARTING" => Self::Starting,
            "RUNNING" => Self::Running,
            "STOPPING" => Self::Stopping,
            "ABORTING" => Self::Aborting,
            "FREEZING" => Self::Freezing,
            "FROZEN" => Self::Frozen,
            "THAWED" => Self::Thawed,
            _ => Self::Other(s.trim().to_string()),
        })
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A container known to the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub name: String,
    pub state: ContainerState,
}

impl ContainerInfo {
    pub fn new(name: impl Into<String>, state: ContainerState) -> Self {
        Self {
            name: name.into(),
            state,
        }
    }
}

// ============================================================================
// Template and Lifecycle
// ============================================================================

/// Image selection for the LXC `download` template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Template {
    pub distro: String,
    pub release: String,
    pub arch: String,
}

impl Template {
    pub fn new(
        distro: impl Into<String>,
        release: impl Into<String>,
        arch: impl Into<String>,
    ) -> Self {
        Self {
            distro: distro.into(),
            release: release.into(),
            arch: arch.into(),
        }
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.distro, self.release, self.arch)
    }
}

/// Operations applied to an existing container by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifecycle {
    Start,
    Stop,
    Reboot,
    Destroy,
}

impl Lifecycle {
    pub const ALL: [Lifecycle; 4] = [Self::Start, Self::Stop, Self::Reboot, Self::Destroy];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Reboot => "reboot",
            Self::Destroy => "destroy",
        }
    }
}

impl fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
