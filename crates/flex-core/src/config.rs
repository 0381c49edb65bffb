//! Client and daemon configuration.
//!
//! The configuration is a flat TOML document stored at
//! `~/.flex/config.toml`. A missing file is equivalent to the defaults.
//! Writes go to a temporary `.new` file that is renamed into place, so a
//! failed write never leaves a truncated configuration behind.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::idmap::{DEFAULT_SUBGID_PATH, DEFAULT_SUBUID_PATH};

/// Default LXC container path.
pub const DEFAULT_LXC_PATH: &str = "/var/lib/lxc";

/// Errors from reading or writing the configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not determine home directory")]
    NoHome,

    #[error("Cannot open config file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot read configuration: {0}")]
    Read(#[source] io::Error),

    #[error("Cannot parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Cannot serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Cannot write configuration to {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// A named remote daemon reachable over TCP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub addr: String,
}

/// Settings used by a client or daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// TCP address the daemon listens on in addition to the unix socket
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen_addr: Option<String>,

    /// Address the attach relay listeners bind to; see [`Config::relay_bind_addr`]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay_bind: Option<Ipv4Addr>,

    /// Directory holding the LXC containers
    pub lxc_path: PathBuf,

    /// Subordinate uid table
    pub subuid_path: PathBuf,

    /// Subordinate gid table
    pub subgid_path: PathBuf,

    /// Remote used by the client when none is given on the command line
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_remote: Option<String>,

    /// Used only for testing purposes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_option: Option<String>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub remotes: BTreeMap<String, RemoteConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: None,
            relay_bind: None,
            lxc_path: PathBuf::from(DEFAULT_LXC_PATH),
            subuid_path: PathBuf::from(DEFAULT_SUBUID_PATH),
            subgid_path: PathBuf::from(DEFAULT_SUBGID_PATH),
            default_remote: None,
            test_option: None,
            remotes: BTreeMap::new(),
        }
    }
}

impl Config {
    /// Returns the default configuration file path (`~/.flex/config.toml`).
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        dirs::home_dir()
            .map(|home| home.join(".flex").join("config.toml"))
            .ok_or(ConfigError::NoHome)
    }

    /// Loads the default configuration file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::default_path()?)
    }

    /// Loads the configuration at `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match fs::File::open(path) {
            Ok(file) => Self::from_reader(file),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No config file, using defaults");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Open {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Reads settings from `reader`.
    pub fn from_reader(mut reader: impl Read) -> Result<Self, ConfigError> {
        let mut data = String::new();
        reader.read_to_string(&mut data).map_err(ConfigError::Read)?;
        Self::parse(&data)
    }

    /// Parses settings from a TOML document.
    pub fn parse(data: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(data)?)
    }

    /// Serializes the settings as a TOML document.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }

    /// Writes the settings to `writer`.
    pub fn write_to(&self, mut writer: impl Write) -> Result<(), ConfigError> {
        let data = self.to_toml()?;
        writer
            .write_all(data.as_bytes())
            .map_err(|source| ConfigError::Write {
                path: PathBuf::from("<writer>"),
                source,
            })
    }

    /// Saves the settings to the default configuration file.
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&Self::default_path()?)
    }

    /// Atomically replaces the file at `path` with these settings.
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let data = self.to_toml()?;
        let write_err = |source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            create_private_dir(parent).map_err(write_err)?;
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".new");
        let tmp = PathBuf::from(tmp);

        let result = fs::write(&tmp, data).and_then(|()| fs::rename(&tmp, path));
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result.map_err(write_err)
    }

    /// Address attach relays bind to.
    ///
    /// Without an explicit `relay-bind`, a daemon that also listens on TCP
    /// binds relays on all interfaces so remote clients can dial back;
    /// otherwise relays stay on loopback.
    pub fn relay_bind_addr(&self) -> Ipv4Addr {
        match (self.relay_bind, &self.listen_addr) {
            (Some(addr), _) => addr,
            (None, Some(_)) => Ipv4Addr::UNSPECIFIED,
            (None, None) => Ipv4Addr::LOCALHOST,
        }
    }

    /// Address of the named remote, or of the default remote.
    pub fn remote_addr(&self, name: Option<&str>) -> Option<&str> {
        let name = name.or(self.default_remote.as_deref())?;
        self.remotes.get(name).map(|r| r.addr.as_str())
    }
}

#[cfg(unix)]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    if dir.as_os_str().is_empty() || dir.exists() {
        return Ok(());
    }
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dir(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.test_option, None);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "test-option = \"value\"\n").unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.test_option.as_deref(), Some("value"));
        assert_eq!(config.relay_bind, None);
        assert_eq!(config.relay_bind_addr(), Ipv4Addr::LOCALHOST);
    }

    #[test]
    fn test_relay_bind_follows_tcp_listener() {
        let config = Config {
            listen_addr: Some("0.0.0.0:8443".to_string()),
            ..Config::default()
        };
        assert_eq!(config.relay_bind_addr(), Ipv4Addr::UNSPECIFIED);

        let config = Config::parse("listen-addr = \"0.0.0.0:8443\"\nrelay-bind = \"10.0.0.5\"\n").unwrap();
        assert_eq!(config.relay_bind_addr(), Ipv4Addr::new(10, 0, 0, 5));
    }

    #[test]
    fn test_from_reader() {
        let config = Config::from_reader("test-option = \"value\"".as_bytes()).unwrap();
        assert_eq!(config.test_option.as_deref(), Some("value"));
    }

    #[test]
    fn test_parse_error() {
        let err = Config::parse("test-option = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_save_creates_directory_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".flex").join("config.toml");
        let config = Config {
            test_option: Some("value".to_string()),
            ..Config::default()
        };
        config.save_to(&path).unwrap();

        let data = fs::read_to_string(&path).unwrap();
        assert!(data.contains("test-option = \"value\""));
        assert!(!dir.path().join(".flex").join("config.toml.new").exists());
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_write_to_writer_leaves_no_file() {
        let mut buf = Vec::new();
        let config = Config {
            test_option: Some("value".to_string()),
            ..Config::default()
        };
        config.write_to(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("test-option = \"value\""));
        assert!(!text.contains("listen-addr"));
    }

    #[test]
    fn test_remote_addr_uses_default_remote() {
        let mut config = Config {
            default_remote: Some("test".to_string()),
            ..Config::default()
        };
        config.remotes.insert(
            "test".to_string(),
            RemoteConfig {
                addr: "localhost:43789".to_string(),
            },
        );
        assert_eq!(config.remote_addr(None), Some("localhost:43789"));
        assert_eq!(config.remote_addr(Some("other")), None);
    }
}
