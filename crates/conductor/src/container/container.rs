//! Worker container configuration, listing types and input validation.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

use super::error::{ContainerError, ContainerResult};

/// Port publication for a worker container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Host interface to bind.
    pub host_ip: String,
    /// Host port; `0` lets the runtime pick a free one.
    pub host_port: u16,
    /// Port inside the container.
    pub container_port: u16,
}

impl PortMapping {
    /// Publish `container_port` on an ephemeral loopback port.
    pub fn ephemeral(container_port: u16) -> Self {
        Self {
            host_ip: "127.0.0.1".to_string(),
            host_port: 0,
            container_port,
        }
    }

    /// `-p` argument for the runtime CLI.
    pub fn to_arg(&self) -> String {
        if self.host_port == 0 {
            format!("{}::{}", self.host_ip, self.container_port)
        } else {
            format!("{}:{}:{}", self.host_ip, self.host_port, self.container_port)
        }
    }
}

/// Resource ceilings applied at `run` time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory limit in runtime syntax, e.g. `4g`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,
    /// Fractional CPU count, e.g. `2.0`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pids: Option<u32>,
}

/// Configuration for launching a worker container.
#[derive(Debug, Clone, Default)]
pub struct ContainerConfig {
    pub name: Option<String>,
    pub image: String,
    pub command: Vec<String>,
    /// Sorted so the generated CLI invocation is deterministic.
    pub env: BTreeMap<String, String>,
    pub ports: Vec<PortMapping>,
    /// Volume mounts (host_path -> container_path).
    pub volumes: Vec<(String, String)>,
    pub workdir: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub network_mode: Option<String>,
    /// `uid:gid` to run as.
    pub user: Option<String>,
    pub limits: ResourceLimits,
}

impl ContainerConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    /// Validate every field that ends up on the runtime command line.
    pub fn validate(&self) -> ContainerResult<()> {
        validate_image_name(&self.image)?;

        if let Some(ref name) = self.name {
            validate_container_name(name)?;
        }

        for key in self.env.keys() {
            validate_env_var_key(key)?;
        }

        for key in self.labels.keys() {
            validate_label_key(key)?;
        }

        for (host_path, container_path) in &self.volumes {
            validate_volume_path(host_path, "host")?;
            validate_volume_path(container_path, "container")?;
        }

        if let Some(ref workdir) = self.workdir {
            validate_container_path(workdir)?;
        }

        if let Some(ref user) = self.user {
            validate_user_spec(user)?;
        }

        if let Some(ref memory) = self.limits.memory {
            validate_memory_limit(memory)?;
        }

        if let Some(cpus) = self.limits.cpus
            && !(cpus.is_finite() && cpus > 0.0)
        {
            return Err(ContainerError::InvalidInput(format!(
                "cpu limit must be a positive number, got {cpus}"
            )));
        }

        Ok(())
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn command(mut self, cmd: Vec<String>) -> Self {
        self.command = cmd;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn port(mut self, mapping: PortMapping) -> Self {
        self.ports.push(mapping);
        self
    }

    pub fn volume(
        mut self,
        host_path: impl Into<String>,
        container_path: impl Into<String>,
    ) -> Self {
        self.volumes.push((host_path.into(), container_path.into()));
        self
    }

    pub fn workdir(mut self, workdir: impl Into<String>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn network_mode(mut self, mode: impl Into<String>) -> Self {
        self.network_mode = Some(mode.into());
        self
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }
}

/// Container state as reported by `ps`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    #[default]
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerState::Created => write!(f, "created"),
            ContainerState::Running => write!(f, "running"),
            ContainerState::Paused => write!(f, "paused"),
            ContainerState::Restarting => write!(f, "restarting"),
            ContainerState::Removing => write!(f, "removing"),
            ContainerState::Exited => write!(f, "exited"),
            ContainerState::Dead => write!(f, "dead"),
            ContainerState::Unknown => write!(f, "unknown"),
        }
    }
}

/// One entry of `ps --format json`.
///
/// Podman prints an array with `Names` as a list; docker prints one object
/// per line with `Names` as a comma separated string. Both are accepted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Container {
    #[serde(alias = "ID")]
    pub id: String,

    #[serde(default, deserialize_with = "deserialize_names")]
    pub names: Vec<String>,

    #[serde(default)]
    pub image: String,

    #[serde(default, deserialize_with = "deserialize_state")]
    pub state: ContainerState,
}

impl Container {
    /// Names with the leading `/` some runtimes add stripped.
    pub fn clean_names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(|n| n.trim_start_matches('/'))
    }
}

fn deserialize_names<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Names {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<Names>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(Names::One(s)) => s
            .split(',')
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect(),
        Some(Names::Many(v)) => v,
    })
}

/// Docker reports `State` as a string, older podman as an object with `Status`.
fn deserialize_state<'de, D>(deserializer: D) -> Result<ContainerState, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    let text = match &value {
        serde_json::Value::String(s) => s.to_ascii_lowercase(),
        serde_json::Value::Object(obj) => obj
            .get("Status")
            .and_then(|s| s.as_str())
            .unwrap_or_default()
            .to_ascii_lowercase(),
        _ => String::new(),
    };
    Ok(serde_json::from_value(serde_json::Value::String(text)).unwrap_or_default())
}

/// Parse `ps --format json` output from either runtime.
pub fn parse_container_list(stdout: &str) -> ContainerResult<Vec<Container>> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    if trimmed.starts_with('[') {
        return serde_json::from_str(trimmed).map_err(unreadable);
    }

    trimmed
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| serde_json::from_str(l).map_err(unreadable))
        .collect()
}

fn unreadable(e: serde_json::Error) -> ContainerError {
    ContainerError::UnreadableListing(e.to_string())
}

// ============================================================================
// Input validation
// ============================================================================

/// Validate an OCI image reference: `[registry/][namespace/]name[:tag][@digest]`.
pub fn validate_image_name(image: &str) -> ContainerResult<()> {
    if image.is_empty() {
        return Err(ContainerError::InvalidInput(
            "image name cannot be empty".to_string(),
        ));
    }

    if image.len() > 256 {
        return Err(ContainerError::InvalidInput(
            "image name exceeds maximum length of 256 characters".to_string(),
        ));
    }

    let valid_chars =
        |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '/' | ':' | '@');

    if !image.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' contains invalid characters",
            image
        )));
    }

    if image.contains("..") || image.starts_with('-') {
        return Err(ContainerError::InvalidInput(format!(
            "image name '{}' is not a valid reference",
            image
        )));
    }

    Ok(())
}

/// Container names: alphanumeric, `-`, `_`, starting with alphanumeric or `_`.
pub fn validate_container_name(name: &str) -> ContainerResult<()> {
    let Some(first_char) = name.chars().next() else {
        return Err(ContainerError::InvalidInput(
            "container name cannot be empty".to_string(),
        ));
    };

    if name.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container name exceeds maximum length of 128 characters".to_string(),
        ));
    }

    if !first_char.is_ascii_alphanumeric() && first_char != '_' {
        return Err(ContainerError::InvalidInput(
            "container name must start with an alphanumeric character or underscore".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !name.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "container name '{}' contains invalid characters",
            name
        )));
    }

    Ok(())
}

/// Container ids are hex; names follow [`validate_container_name`].
pub fn validate_container_id_or_name(id: &str) -> ContainerResult<()> {
    if id.is_empty() {
        return Err(ContainerError::InvalidInput(
            "container ID or name cannot be empty".to_string(),
        ));
    }

    if id.len() > 128 {
        return Err(ContainerError::InvalidInput(
            "container ID or name exceeds maximum length".to_string(),
        ));
    }

    let valid_chars = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';
    if !id.chars().all(valid_chars) || id.starts_with('-') {
        return Err(ContainerError::InvalidInput(format!(
            "container ID or name '{}' contains invalid characters",
            id
        )));
    }

    Ok(())
}

fn validate_env_var_key(key: &str) -> ContainerResult<()> {
    let Some(first_char) = key.chars().next() else {
        return Err(ContainerError::InvalidInput(
            "environment variable key cannot be empty".to_string(),
        ));
    };

    if !first_char.is_ascii_alphabetic() && first_char != '_' {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' must start with a letter or underscore",
            key
        )));
    }

    if !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(ContainerError::InvalidInput(format!(
            "environment variable key '{}' contains invalid characters",
            key
        )));
    }

    Ok(())
}

fn validate_label_key(key: &str) -> ContainerResult<()> {
    let valid_chars = |c: char| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_');
    if key.is_empty() || !key.chars().all(valid_chars) {
        return Err(ContainerError::InvalidInput(format!(
            "label key '{}' is invalid",
            key
        )));
    }
    Ok(())
}

fn validate_volume_path(path: &str, side: &str) -> ContainerResult<()> {
    if path.is_empty() {
        return Err(ContainerError::InvalidInput(format!(
            "{} volume path cannot be empty",
            side
        )));
    }

    if path.len() > 4096 {
        return Err(ContainerError::InvalidInput(format!(
            "{} volume path exceeds maximum length of 4096 characters",
            side
        )));
    }

    // ':' would split the -v argument.
    const FORBIDDEN: &[char] = &[
        '\0', ':', '$', '`', '!', '&', '|', ';', '<', '>', '(', ')', '{', '}', '*', '?', '\\', '"',
        '\'', '\n', '\r',
    ];
    if let Some(c) = path.chars().find(|c| FORBIDDEN.contains(c)) {
        return Err(ContainerError::InvalidInput(format!(
            "{} volume path contains forbidden character {:?}",
            side, c
        )));
    }

    Ok(())
}

fn validate_container_path(path: &str) -> ContainerResult<()> {
    if !path.starts_with('/') {
        return Err(ContainerError::InvalidInput(
            "container path must be absolute (start with '/')".to_string(),
        ));
    }

    if path.contains('\0') {
        return Err(ContainerError::InvalidInput(
            "container path cannot contain null bytes".to_string(),
        ));
    }

    Ok(())
}

/// `uid` or `uid:gid`, numeric only.
fn validate_user_spec(user: &str) -> ContainerResult<()> {
    let numeric = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    let ok = match user.split_once(':') {
        Some((uid, gid)) => numeric(uid) && numeric(gid),
        None => numeric(user),
    };
    if !ok {
        return Err(ContainerError::InvalidInput(format!(
            "user '{}' must be numeric uid or uid:gid",
            user
        )));
    }
    Ok(())
}

/// Digits with an optional `b`/`k`/`m`/`g` unit.
fn validate_memory_limit(memory: &str) -> ContainerResult<()> {
    let digits = memory.trim_end_matches(['b', 'k', 'm', 'g', 'B', 'K', 'M', 'G']);
    let unit_len = memory.len() - digits.len();
    if digits.is_empty() || unit_len > 1 || !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(ContainerError::InvalidInput(format!(
            "memory limit '{}' is invalid",
            memory
        )));
    }
    Ok(())
}
