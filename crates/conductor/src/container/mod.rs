//! Docker/Podman CLI driver for worker containers.

mod container;
mod error;

pub use container::{
    Container, ContainerConfig, ContainerState, PortMapping, ResourceLimits,
    parse_container_list, validate_container_id_or_name, validate_container_name,
    validate_image_name,
};
pub use error::{ContainerError, ContainerResult};

use std::ffi::OsStr;
use std::fmt;
use std::process::{Output, Stdio};

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeType {
    Docker,
    #[default]
    Podman,
}

impl RuntimeType {
    pub fn binary_name(self) -> &'static str {
        match self {
            RuntimeType::Docker => "docker",
            RuntimeType::Podman => "podman",
        }
    }

    /// Podman hosts usually enforce SELinux, so bind mounts get `:Z`.
    fn relabels_mounts(self) -> bool {
        self == RuntimeType::Podman
    }

    /// Lookup order when nothing is configured.
    fn detection_order() -> [RuntimeType; 2] {
        if cfg!(target_os = "macos") {
            [RuntimeType::Docker, RuntimeType::Podman]
        } else {
            [RuntimeType::Podman, RuntimeType::Docker]
        }
    }
}

impl fmt::Display for RuntimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary_name())
    }
}

/// What the container backend needs from a runtime. Tests swap in a fake.
#[async_trait]
pub trait ContainerRuntimeApi: Send + Sync {
    /// `run -d`; returns the new container id.
    async fn launch(&self, config: &ContainerConfig) -> ContainerResult<String>;
    async fn stop(&self, container_id: &str, grace_secs: Option<u32>) -> ContainerResult<()>;
    async fn remove(&self, container_id: &str, force: bool) -> ContainerResult<()>;
    async fn list(&self, include_stopped: bool) -> ContainerResult<Vec<Container>>;
    /// Host port bound to `container_port/tcp`.
    async fn host_port(&self, container_id: &str, container_port: u16)
    -> ContainerResult<Option<u16>>;
    async fn has_image(&self, image: &str) -> ContainerResult<bool>;
    async fn pull(&self, image: &str) -> ContainerResult<()>;
}

#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    kind: RuntimeType,
    binary: String,
}

impl ContainerRuntime {
    /// First runtime found on `PATH`. Falls back to podman so the first call
    /// reports the missing binary.
    pub fn detect() -> Self {
        let kind = RuntimeType::detection_order()
            .into_iter()
            .find(|kind| on_path(kind.binary_name()))
            .unwrap_or_default();
        Self::of(kind)
    }

    pub fn of(kind: RuntimeType) -> Self {
        Self {
            kind,
            binary: kind.binary_name().to_string(),
        }
    }

    /// Honour configured type and binary; guess whichever is missing.
    pub fn from_settings(kind: Option<RuntimeType>, binary: Option<String>) -> Self {
        match (kind, binary) {
            (kind, Some(binary)) => {
                let kind = kind.unwrap_or(if binary.contains("docker") {
                    RuntimeType::Docker
                } else {
                    RuntimeType::Podman
                });
                Self { kind, binary }
            }
            (Some(kind), None) => Self::of(kind),
            (None, None) => Self::detect(),
        }
    }

    pub fn kind(&self) -> RuntimeType {
        self.kind
    }

    async fn exec<I, S>(&self, verb: &str, args: I) -> ContainerResult<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Command::new(&self.binary)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| ContainerError::CommandFailed {
                command: format!("{} {}", self.binary, verb),
                stderr: e.to_string(),
            })
    }

    /// [`Self::exec`] that also rejects a non-zero exit; yields stdout.
    async fn exec_ok<I, S>(&self, verb: &str, args: I) -> ContainerResult<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let out = self.exec(verb, args).await?;
        if out.status.success() {
            return Ok(String::from_utf8_lossy(&out.stdout).into_owned());
        }
        Err(ContainerError::CommandFailed {
            command: format!("{} {}", self.binary, verb),
            stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
        })
    }

    /// Runtime version JSON; an error means the CLI is unusable.
    pub async fn version(&self) -> ContainerResult<String> {
        self.exec_ok("version", ["version", "--format", "json"]).await
    }

    /// Arguments for `run`, image and command last.
    pub fn run_args(&self, config: &ContainerConfig) -> Vec<String> {
        let mut args = CliArgs::new(["run", "-d"]);
        args.opt("--name", config.name.as_deref());
        args.opt("--network", config.network_mode.as_deref());
        args.opt("--user", config.user.as_deref());
        args.opt("--memory", config.limits.memory.as_deref());
        args.opt("--cpus", config.limits.cpus.map(|c| c.to_string()));
        args.opt("--pids-limit", config.limits.pids.map(|p| p.to_string()));

        // Published ports are meaningless on the host network.
        if config.network_mode.as_deref() != Some("host") {
            args.each("-p", config.ports.iter().map(PortMapping::to_arg));
        }

        let relabel = if self.kind.relabels_mounts() { ":Z" } else { "" };
        args.each(
            "-v",
            config
                .volumes
                .iter()
                .map(|(host, target)| format!("{host}:{target}{relabel}")),
        );
        args.each("-e", config.env.iter().map(|(k, v)| format!("{k}={v}")));
        args.each("--label", config.labels.iter().map(|(k, v)| format!("{k}={v}")));
        args.opt("-w", config.workdir.as_deref());

        let mut args = args.0;
        args.push(config.image.clone());
        args.extend(config.command.iter().cloned());
        args
    }
}

/// Flag/value pairs for a CLI invocation.
struct CliArgs(Vec<String>);

impl CliArgs {
    fn new<const N: usize>(head: [&str; N]) -> Self {
        Self(head.iter().map(|s| s.to_string()).collect())
    }

    fn opt(&mut self, flag: &str, value: Option<impl Into<String>>) {
        if let Some(value) = value {
            self.0.push(flag.to_string());
            self.0.push(value.into());
        }
    }

    fn each(&mut self, flag: &str, values: impl Iterator<Item = String>) {
        for value in values {
            self.opt(flag, Some(value));
        }
    }
}

fn on_path(binary: &str) -> bool {
    std::process::Command::new("which")
        .arg(binary)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}

/// First host port in `port` output, e.g. `0.0.0.0:49153\n[::]:49153`.
fn parse_port_output(stdout: &str) -> Option<u16> {
    stdout
        .lines()
        .filter_map(|line| line.trim().rsplit_once(':'))
        .find_map(|(_, port)| port.parse().ok())
}

#[async_trait]
impl ContainerRuntimeApi for ContainerRuntime {
    async fn launch(&self, config: &ContainerConfig) -> ContainerResult<String> {
        config.validate()?;
        debug!("{} run {} as {:?}", self.binary, config.image, config.name);
        let id = self.exec_ok("run", self.run_args(config)).await?;
        Ok(id.trim().to_string())
    }

    async fn stop(&self, container_id: &str, grace_secs: Option<u32>) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;
        let mut args = CliArgs::new(["stop"]);
        args.opt("-t", grace_secs.map(|s| s.to_string()));
        args.0.push(container_id.to_string());
        self.exec_ok("stop", args.0).await?;
        Ok(())
    }

    async fn remove(&self, container_id: &str, force: bool) -> ContainerResult<()> {
        validate_container_id_or_name(container_id)?;
        let args: &[&str] = if force {
            &["rm", "-f", container_id]
        } else {
            &["rm", container_id]
        };
        self.exec_ok("rm", args).await?;
        Ok(())
    }

    async fn list(&self, include_stopped: bool) -> ContainerResult<Vec<Container>> {
        let args: &[&str] = if include_stopped {
            &["ps", "-a", "--format", "json"]
        } else {
            &["ps", "--format", "json"]
        };
        parse_container_list(&self.exec_ok("ps", args).await?)
    }

    async fn host_port(
        &self,
        container_id: &str,
        container_port: u16,
    ) -> ContainerResult<Option<u16>> {
        validate_container_id_or_name(container_id)?;
        let target = format!("{container_port}/tcp");
        let out = self.exec("port", ["port", container_id, target.as_str()]).await?;
        if !out.status.success() {
            return Ok(None);
        }
        Ok(parse_port_output(&String::from_utf8_lossy(&out.stdout)))
    }

    async fn has_image(&self, image: &str) -> ContainerResult<bool> {
        validate_image_name(image)?;
        let out = self.exec("image inspect", ["image", "inspect", image]).await?;
        Ok(out.status.success())
    }

    async fn pull(&self, image: &str) -> ContainerResult<()> {
        validate_image_name(image)?;
        self.exec_ok("pull", ["pull", image]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_carry_limits_user_and_labels() {
        let runtime = ContainerRuntime::of(RuntimeType::Docker);
        let config = ContainerConfig::new("agent-worker:latest")
            .name("conductor-task-7")
            .user("1000:1000")
            .env("TASK_ID", "7")
            .label("conductor.task", "7")
            .port(PortMapping::ephemeral(8080))
            .volume("/srv/tasks/7", "/workspace")
            .limits(ResourceLimits {
                memory: Some("2g".to_string()),
                cpus: Some(2.0),
                pids: Some(512),
            });

        let args = runtime.run_args(&config);
        let joined = args.join(" ");
        assert!(joined.starts_with("run -d --name conductor-task-7"));
        assert!(joined.contains("--user 1000:1000"));
        assert!(joined.contains("--memory 2g"));
        assert!(joined.contains("--cpus 2"));
        assert!(joined.contains("--pids-limit 512"));
        assert!(joined.contains("-p 127.0.0.1::8080"));
        assert!(joined.contains("-v /srv/tasks/7:/workspace"));
        assert!(!joined.contains(":Z"));
        assert!(joined.contains("-e TASK_ID=7"));
        assert!(joined.contains("--label conductor.task=7"));
        assert_eq!(args.last().map(String::as_str), Some("agent-worker:latest"));
    }

    #[test]
    fn test_podman_relabels_mounts() {
        let runtime = ContainerRuntime::of(RuntimeType::Podman);
        let config = ContainerConfig::new("img").volume("/a", "/b");
        assert!(runtime.run_args(&config).contains(&"/a:/b:Z".to_string()));
    }

    #[test]
    fn test_host_network_skips_ports() {
        let runtime = ContainerRuntime::of(RuntimeType::Docker);
        let config = ContainerConfig::new("img")
            .network_mode("host")
            .port(PortMapping::ephemeral(8080));
        assert!(!runtime.run_args(&config).contains(&"-p".to_string()));
    }

    #[test]
    fn test_parse_port_output() {
        assert_eq!(parse_port_output("0.0.0.0:49153\n[::]:49153\n"), Some(49153));
        assert_eq!(parse_port_output("127.0.0.1:40001"), Some(40001));
        assert_eq!(parse_port_output(""), None);
    }

    #[test]
    fn test_binary_implies_type() {
        let rt = ContainerRuntime::from_settings(None, Some("/usr/local/bin/docker".to_string()));
        assert_eq!(rt.kind(), RuntimeType::Docker);
        let rt = ContainerRuntime::from_settings(Some(RuntimeType::Docker), None);
        assert_eq!(rt.binary, "docker");
    }

    #[tokio::test]
    async fn test_version_when_installed() {
        // Only meaningful where docker or podman is installed.
        if let Ok(version) = ContainerRuntime::detect().version().await {
            assert!(!version.is_empty());
        }
    }
}
