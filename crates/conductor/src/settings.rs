//! Application configuration.
//!
//! Layered with the `config` crate: built-in defaults, then the TOML file
//! (`$XDG_CONFIG_HOME/conductor/config.toml` unless overridden), then
//! `CONDUCTOR__SECTION__KEY` environment variables.

use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::backend::{
    AgentBackend, BackendKind, CliAgentRuntime, CloudBackend, CloudBackendConfig, Collaborators,
    ContainerBackend, ContainerBackendConfig, InProcessBackend, InProcessConfig,
};

pub const APP_NAME: &str = "conductor";
const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    /// Backend used by `run`.
    pub backend: BackendKind,
    pub in_process: InProcessConfig,
    pub container: ContainerBackendConfig,
    pub cloud: CloudBackendConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl AppConfig {
    /// Construct the configured backend.
    pub fn build_backend(&self, collaborators: Collaborators) -> Result<Arc<dyn AgentBackend>> {
        self.build_backend_of(self.backend, collaborators)
    }

    pub fn build_backend_of(
        &self,
        kind: BackendKind,
        collaborators: Collaborators,
    ) -> Result<Arc<dyn AgentBackend>> {
        let backend: Arc<dyn AgentBackend> = match kind {
            BackendKind::InProcess => {
                let runtime = Arc::new(CliAgentRuntime::new(self.in_process.cli.clone()));
                Arc::new(
                    InProcessBackend::new(runtime, self.in_process.clone())
                        .with_collaborators(collaborators),
                )
            }
            BackendKind::Container => Arc::new(ContainerBackend::new(
                self.container.clone(),
                collaborators,
            )),
            BackendKind::Cloud => Arc::new(
                CloudBackend::new(self.cloud.clone(), collaborators)
                    .context("configuring cloud backend")?,
            ),
        };
        Ok(backend)
    }
}

/// Where configuration lives on disk.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub config_file: PathBuf,
}

impl AppPaths {
    /// `override_path` may name the file itself or the directory holding
    /// `config.toml`.
    pub fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path.map(expand_path).transpose()? {
            Some(dir) if dir.is_dir() => dir.join(CONFIG_FILE_NAME),
            Some(file) => file,
            None => default_config_dir()?.join(CONFIG_FILE_NAME),
        };
        anyhow::ensure!(
            config_file.file_name().is_some(),
            "config path {} does not name a file",
            config_file.display()
        );
        Ok(Self { config_file })
    }
}

impl fmt::Display for AppPaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "config: {}", self.config_file.display())
    }
}

/// Load configuration from `path` (optional) and environment variables
/// starting with `{env_prefix}__`.
#[instrument(level = "debug")]
pub fn load_config(path: &Path, env_prefix: &str) -> Result<AppConfig> {
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .set_default("backend", "in_process")?
        .add_source(File::from(path).format(FileFormat::Toml).required(false))
        .add_source(Environment::with_prefix(env_prefix).separator("__"))
        .build()
        .with_context(|| format!("reading configuration from {}", path.display()))?;

    let mut config: AppConfig = built
        .try_deserialize()
        .context("deserializing configuration")?;

    config.logging.file = config
        .logging
        .file
        .as_deref()
        .map(|file| expand_str_path(file).map(|p| p.display().to_string()))
        .transpose()?;

    Ok(config)
}

/// Write [`AppConfig::default`] as commented TOML, creating parent dirs.
pub fn write_default_config(path: &Path) -> Result<()> {
    let dir = path.parent().filter(|d| !d.as_os_str().is_empty());
    if let Some(dir) = dir {
        fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    }

    let defaults =
        toml::to_string_pretty(&AppConfig::default()).context("encoding default config")?;
    let body = format!(
        "# Configuration for {APP_NAME}\n\
         # Override any key with {}__SECTION__KEY.\n\n{defaults}",
        env_prefix()
    );
    fs::write(path, body).with_context(|| format!("writing {}", path.display()))
}

pub fn expand_path(path: PathBuf) -> Result<PathBuf> {
    match path.to_str() {
        Some(text) => expand_str_path(text),
        None => Ok(path),
    }
}

/// `~` and `$VAR` expansion.
pub fn expand_str_path(text: &str) -> Result<PathBuf> {
    let expanded =
        shellexpand::full(text).with_context(|| format!("expanding path {text:?}"))?;
    Ok(PathBuf::from(expanded.into_owned()))
}

/// `$XDG_CONFIG_HOME/conductor`, else the platform config dir, else
/// `~/.config/conductor`.
fn default_config_dir() -> Result<PathBuf> {
    let base = env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(dirs::config_dir)
        .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
        .ok_or_else(|| anyhow!("cannot locate a configuration directory"))?;
    Ok(base.join(APP_NAME))
}

/// Prefix of configuration environment variables (`CONDUCTOR`).
pub fn env_prefix() -> String {
    APP_NAME
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' => c.to_ascii_uppercase(),
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::RuntimeType;

    #[test]
    fn test_default_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        write_default_config(&path).unwrap();

        let body = fs::read_to_string(&path).unwrap();
        assert!(body.starts_with("# Configuration for conductor"));

        let config = load_config(&path, "CONDUCTOR_TEST_DEFAULTS").unwrap();
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.toml"), "CONDUCTOR_TEST_MISSING")
            .unwrap();
        assert_eq!(config.backend, BackendKind::InProcess);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_file_and_env_layering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
backend = "container"

[container]
runtime = "docker"
image = "worker:dev"
credentials = [{ name = "ANTHROPIC_API_KEY", required = true }]

[container.limits]
memory = "2g"

[cloud]
pool = "from-file"
"#,
        )
        .unwrap();

        // SAFETY: the prefix is unique to this test.
        unsafe {
            env::set_var("CONDUCTOR_TEST_LAYERING__CLOUD__POOL", "from-env");
        }
        let config = load_config(&path, "CONDUCTOR_TEST_LAYERING").unwrap();
        unsafe {
            env::remove_var("CONDUCTOR_TEST_LAYERING__CLOUD__POOL");
        }

        assert_eq!(config.backend, BackendKind::Container);
        assert_eq!(config.container.runtime, Some(RuntimeType::Docker));
        assert_eq!(config.container.image, "worker:dev");
        assert_eq!(config.container.limits.memory.as_deref(), Some("2g"));
        assert!(config.container.credentials[0].required);
        assert_eq!(config.container.name_prefix, "conductor-");
        assert_eq!(config.cloud.pool, "from-env");
    }

    #[test]
    fn test_env_prefix() {
        assert_eq!(env_prefix(), "CONDUCTOR");
    }

    #[test]
    fn test_discover_directory_override() {
        let dir = tempfile::tempdir().unwrap();
        let paths = AppPaths::discover(Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(paths.config_file, dir.path().join("config.toml"));
    }

    #[test]
    fn test_cloud_backend_requires_token_credential() {
        let config = AppConfig {
            backend: BackendKind::Cloud,
            cloud: CloudBackendConfig {
                token_credential: Some("CONDUCTOR_TEST_UNSET_TOKEN".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = config.build_backend(Collaborators::default()).err().unwrap();
        assert!(format!("{err:#}").contains("CONDUCTOR_TEST_UNSET_TOKEN"));
    }

    #[tokio::test]
    async fn test_builds_each_backend() {
        let config = AppConfig::default();
        for kind in [BackendKind::InProcess, BackendKind::Container, BackendKind::Cloud] {
            let backend = config
                .build_backend_of(kind, Collaborators::default())
                .unwrap();
            assert_eq!(backend.kind(), kind);
            assert!(backend.list_sessions().await.is_empty());
        }
    }
}
