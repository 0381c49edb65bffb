//! LXC backend driving the `lxc-*` command-line tools.

use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::process::{ExitStatus, Output};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use flex_core::{ContainerInfo, ContainerState, IdMap, Template};

use super::{ContainerRuntime, RuntimeError};
use crate::pty::run_on_tty;

/// Runtime backed by the LXC userspace tools.
#[derive(Debug, Clone)]
pub struct LxcRuntime {
    /// Container path passed as `-P`
    lxc_path: PathBuf,
    /// Directory for the per-container creation configs
    config_dir: PathBuf,
}

impl LxcRuntime {
    pub fn new(lxc_path: impl Into<PathBuf>, config_dir: impl Into<PathBuf>) -> Self {
        Self {
            lxc_path: lxc_path.into(),
            config_dir: config_dir.into(),
        }
    }

    fn command(&self, tool: &'static str, name: Option<&str>) -> Command {
        let mut cmd = Command::new(tool);
        cmd.arg("-P").arg(&self.lxc_path);
        if let Some(name) = name {
            cmd.arg("-n").arg(name);
        }
        cmd.kill_on_drop(true);
        cmd
    }

    async fn run(&self, tool: &'static str, mut cmd: Command) -> Result<Output, RuntimeError> {
        debug!(tool, "Running LXC tool");
        let output = cmd
            .output()
            .await
            .map_err(|source| RuntimeError::Spawn { tool, source })?;
        if !output.status.success() {
            return Err(RuntimeError::CommandFailed {
                tool,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(output)
    }

    fn config_file(&self, name: &str) -> PathBuf {
        self.config_dir.join(format!("{name}.conf"))
    }
}

/// Container config applied at creation time.
fn idmap_config(idmap: &IdMap) -> String {
    format!(
        "lxc.idmap = u 0 {} {}\nlxc.idmap = g 0 {} {}\n",
        idmap.uid_min(),
        idmap.uid_range(),
        idmap.gid_min(),
        idmap.gid_range()
    )
}

/// Parses `lxc-ls --fancy --fancy-format NAME,STATE` output.
fn parse_ls(stdout: &str) -> Vec<ContainerInfo> {
    stdout
        .lines()
        .skip(1)
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let name = fields.next()?;
            let state = fields.next().unwrap_or("UNKNOWN");
            Some(ContainerInfo::new(
                name,
                state
                    .parse()
                    .unwrap_or_else(|never: std::convert::Infallible| match never {}),
            ))
        })
        .collect()
}

/// Parses `lxc-info -s` output (`State:   RUNNING`).
fn parse_info_state(stdout: &str) -> Option<ContainerState> {
    stdout.lines().find_map(|line| {
        let state = line.trim().strip_prefix("State:")?;
        state.trim().parse().ok()
    })
}

#[async_trait]
impl ContainerRuntime for LxcRuntime {
    async fn list(&self) -> Result<Vec<ContainerInfo>, RuntimeError> {
        let mut cmd = self.command("lxc-ls", None);
        cmd.args(["--fancy", "--fancy-format", "NAME,STATE"]);
        let output = self.run("lxc-ls", cmd).await?;
        Ok(parse_ls(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn lookup(&self, name: &str) -> Result<ContainerInfo, RuntimeError> {
        let mut cmd = self.command("lxc-info", Some(name));
        cmd.arg("-s");
        let not_found = || RuntimeError::NotFound {
            name: name.to_string(),
        };
        let output = match self.run("lxc-info", cmd).await {
            Ok(output) => output,
            Err(RuntimeError::CommandFailed { .. }) => return Err(not_found()),
            Err(e) => return Err(e),
        };
        let state = parse_info_state(&String::from_utf8_lossy(&output.stdout))
            .ok_or_else(not_found)?;
        Ok(ContainerInfo::new(name, state))
    }

    async fn create(
        &self,
        name: &str,
        template: &Template,
        idmap: &IdMap,
    ) -> Result<(), RuntimeError> {
        tokio::fs::create_dir_all(&self.config_dir).await?;
        let config = self.config_file(name);
        tokio::fs::write(&config, idmap_config(idmap)).await?;

        let mut cmd = self.command("lxc-create", Some(name));
        cmd.arg("-f")
            .arg(&config)
            .args(["-t", "download", "--"])
            .args(["--dist", &template.distro])
            .args(["--release", &template.release])
            .args(["--arch", &template.arch]);

        if let Err(e) = self.run("lxc-create", cmd).await {
            let _ = tokio::fs::remove_file(&config).await;
            return Err(e);
        }
        info!(container = name, template = %template, "Container created");
        Ok(())
    }

    async fn start(&self, name: &str) -> Result<(), RuntimeError> {
        let mut cmd = self.command("lxc-start", Some(name));
        cmd.arg("-d");
        self.run("lxc-start", cmd).await.map(drop)
    }

    async fn stop(&self, name: &str) -> Result<(), RuntimeError> {
        let cmd = self.command("lxc-stop", Some(name));
        self.run("lxc-stop", cmd).await.map(drop)
    }

    async fn reboot(&self, name: &str) -> Result<(), RuntimeError> {
        let mut cmd = self.command("lxc-stop", Some(name));
        cmd.arg("-r");
        self.run("lxc-stop", cmd).await.map(drop)
    }

    async fn destroy(&self, name: &str) -> Result<(), RuntimeError> {
        let cmd = self.command("lxc-destroy", Some(name));
        self.run("lxc-destroy", cmd).await?;
        if let Err(e) = tokio::fs::remove_file(self.config_file(name)).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(container = name, error = %e, "Failed to remove container config");
            }
        }
        Ok(())
    }

    async fn exec(
        &self,
        name: &str,
        command: &[String],
        tty: OwnedFd,
    ) -> Result<ExitStatus, RuntimeError> {
        if command.is_empty() {
            return Err(RuntimeError::InvalidCommand(String::new()));
        }
        let mut cmd = self.command("lxc-attach", Some(name));
        cmd.arg("--clear-env").arg("--").args(command).env_clear();
        run_on_tty(cmd, tty)
            .await
            .map_err(|source| RuntimeError::Spawn {
                tool: "lxc-attach",
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flex_core::IdRange;

    #[test]
    fn test_parse_ls() {
        let out = "NAME  STATE\nweb   RUNNING\ndb    STOPPED\n";
        let list = parse_ls(out);
        assert_eq!(list.len(), 2);
        assert_eq!(list[0], ContainerInfo::new("web", ContainerState::Running));
        assert_eq!(list[1].state, ContainerState::Stopped);
    }

    #[test]
    fn test_parse_ls_empty() {
        assert!(parse_ls("").is_empty());
        assert!(parse_ls("NAME STATE\n").is_empty());
    }

    #[test]
    fn test_parse_info_state() {
        let out = "State:          RUNNING\n";
        assert_eq!(parse_info_state(out), Some(ContainerState::Running));
        assert_eq!(parse_info_state("nothing here"), None);
    }

    #[test]
    fn test_idmap_config() {
        let map = IdMap::new(IdRange::new(100000, 65536), IdRange::new(200000, 1000)).unwrap();
        assert_eq!(
            idmap_config(&map),
            "lxc.idmap = u 0 100000 65536\nlxc.idmap = g 0 200000 1000\n"
        );
    }

    #[test]
    fn test_command_carries_lxc_path() {
        let rt = LxcRuntime::new("/tmp/lxc", "/tmp/conf");
        let cmd = rt.command("lxc-info", Some("c1"));
        let args: Vec<_> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, ["-P", "/tmp/lxc", "-n", "c1"]);
        assert_eq!(rt.config_file("c1"), PathBuf::from("/tmp/conf/c1.conf"));
    }
}
