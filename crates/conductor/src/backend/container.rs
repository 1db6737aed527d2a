//! Container-per-task backend.
//!
//! Each task gets one worker container, launched on first use and reused by
//! every later session of the task while it stays healthy. Sessions without a
//! task get a container of their own that lives exactly as long as the
//! session. Agent traffic is proxied to the worker's HTTP API.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conductor_protocol::worker::{AnswerBody, CreateSessionBody, SendMessageBody};
use conductor_protocol::{AgentMode, Answers};
use dashmap::DashMap;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::worker::{PumpOutcome, WorkerCall, proxy_turn};
use super::{
    AgentBackend, BackendKind, Collaborators, EventEmitter, EventStream, HealthProbe,
    HttpHealthProbe, StartSessionRequest, WorkerClient, error_stream, new_session_id,
};
use crate::container::{
    ContainerConfig, ContainerRuntime, ContainerRuntimeApi, PortMapping, ResourceLimits,
    RuntimeType,
};
use crate::error::{BackendError, BackendResult};
use crate::registry::{SessionRecord, SessionRegistry, SessionStatus};
use crate::transport::Transport;

/// Label set on every container this backend launches.
const MANAGED_LABEL: &str = "conductor.managed";
const TASK_LABEL: &str = "conductor.task";
/// Grace period when sweeping orphans.
const ORPHAN_STOP_TIMEOUT_SECS: u32 = 5;

/// A host environment variable passed into worker containers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSpec {
    /// Host variable to read.
    pub name: String,
    /// Fail the launch when the variable is unset.
    #[serde(default)]
    pub required: bool,
    /// Variable name inside the container; defaults to `name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
}

impl CredentialSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            required: false,
            destination: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Resolve to a `(container_var, value)` pair. `Ok(None)` for an unset
    /// optional credential.
    pub fn resolve<F>(&self, lookup: F) -> BackendResult<Option<(String, String)>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let destination = self.destination.clone().unwrap_or_else(|| self.name.clone());
        match lookup(&self.name) {
            Some(value) => Ok(Some((destination, value))),
            None if self.required => Err(BackendError::Startup(format!(
                "required credential {} is not set",
                self.name
            ))),
            None => {
                debug!("optional credential {} is not set", self.name);
                Ok(None)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerBackendConfig {
    /// Runtime type; auto-detected when unset.
    pub runtime: Option<RuntimeType>,
    /// Runtime binary; derived from the type when unset.
    pub binary: Option<String>,
    pub image: String,
    /// Container name prefix; also identifies containers for the orphan sweep.
    pub name_prefix: String,
    /// Port the worker listens on inside the container.
    pub worker_port: u16,
    /// Host address published ports are bound to.
    pub host: String,
    /// Where the workspace is mounted inside the container.
    pub workspace_mount: String,
    pub network: Option<String>,
    /// Run as the invoking user's uid:gid.
    pub map_user: bool,
    pub limits: ResourceLimits,
    pub credentials: Vec<CredentialSpec>,
    pub env: BTreeMap<String, String>,
    pub project_id: Option<String>,
    pub pull_missing_image: bool,
    pub health_attempts: u32,
    pub health_interval_ms: u64,
    pub stop_timeout_secs: u32,
}

impl Default for ContainerBackendConfig {
    fn default() -> Self {
        Self {
            runtime: None,
            binary: None,
            image: "conductor-worker:latest".to_string(),
            name_prefix: "conductor-".to_string(),
            worker_port: 8080,
            host: "127.0.0.1".to_string(),
            workspace_mount: "/workspace".to_string(),
            network: None,
            map_user: true,
            limits: ResourceLimits::default(),
            credentials: Vec::new(),
            env: BTreeMap::new(),
            project_id: None,
            pull_missing_image: true,
            health_attempts: 30,
            health_interval_ms: 1000,
            stop_timeout_secs: 10,
        }
    }
}

/// A launched worker container.
#[derive(Debug, Clone, PartialEq, Eq)]
struct WorkerContainer {
    container_id: String,
    name: String,
    base_url: String,
}

#[derive(Debug, Clone)]
struct ContainerSlot {
    /// Key into the container table.
    key: String,
    /// Session id assigned by the worker; unset until `session-started`.
    worker_session_id: Option<String>,
    task_scoped: bool,
}

type Record = SessionRecord<ContainerSlot>;

type EnvLookup = dyn Fn(&str) -> Option<String> + Send + Sync;

struct Inner {
    config: ContainerBackendConfig,
    runtime: Arc<dyn ContainerRuntimeApi>,
    probe: Arc<dyn HealthProbe>,
    transport: Transport,
    collaborators: Collaborators,
    env_lookup: Box<EnvLookup>,
    registry: SessionRegistry<ContainerSlot>,
    /// Tracked containers by key (`task:{id}` or `session:{id}`).
    containers: DashMap<String, WorkerContainer>,
    launch_locks: DashMap<String, Arc<Mutex<()>>>,
}

pub struct ContainerBackend {
    inner: Arc<Inner>,
}

impl ContainerBackend {
    /// Backend driving the docker/podman CLI and probing workers over HTTP.
    pub fn new(config: ContainerBackendConfig, collaborators: Collaborators) -> Self {
        let runtime = ContainerRuntime::from_settings(config.runtime, config.binary.clone());
        info!("container backend using {}", runtime.kind());
        let transport = Transport::new();
        let probe = HttpHealthProbe::new(
            transport.clone(),
            config.health_attempts,
            Duration::from_millis(config.health_interval_ms),
        );
        Self::with_parts(config, Arc::new(runtime), Arc::new(probe), transport, collaborators)
    }

    pub fn with_parts(
        config: ContainerBackendConfig,
        runtime: Arc<dyn ContainerRuntimeApi>,
        probe: Arc<dyn HealthProbe>,
        transport: Transport,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                runtime,
                probe,
                transport,
                collaborators,
                env_lookup: Box::new(|name| std::env::var(name).ok()),
                registry: SessionRegistry::new(),
                containers: DashMap::new(),
                launch_locks: DashMap::new(),
            }),
        }
    }

    /// Tear down a task's container and end its sessions. Returns whether a
    /// container was tracked for the task.
    pub async fn close_task(&self, task_id: &str) -> bool {
        let inner = &self.inner;
        for record in inner.registry.list() {
            if record.task_id.as_deref() == Some(task_id) {
                inner.registry.remove(&record.session_id);
                record.cancel.cancel();
                record.gate.close();
            }
        }
        inner.release(&task_key(task_id)).await
    }

    /// Number of tracked containers.
    pub fn container_count(&self) -> usize {
        self.inner.containers.len()
    }
}

fn task_key(task_id: &str) -> String {
    format!("task:{}", task_id)
}

fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

/// Container name for a tracking key: prefix plus the key with anything the
/// runtime would reject replaced by `-`.
fn container_name(prefix: &str, key: &str) -> String {
    let suffix: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("{}{}", prefix, suffix)
}

fn host_user() -> String {
    use rustix::process::{getgid, getuid};
    format!("{}:{}", getuid().as_raw(), getgid().as_raw())
}

impl Inner {
    fn launch_lock(&self, key: &str) -> Arc<Mutex<()>> {
        Arc::clone(self.launch_locks.entry(key.to_string()).or_default().value())
    }

    /// Drop the key's launch lock unless another caller holds or awaits it.
    fn forget_launch_lock(&self, key: &str) {
        self.launch_locks
            .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    fn worker(&self, key: &str) -> Option<WorkerClient> {
        self.containers
            .get(key)
            .map(|c| WorkerClient::new(self.transport.clone(), c.base_url.clone()))
    }

    /// Reuse the key's container if it is healthy, otherwise launch one.
    async fn get_or_start(
        &self,
        key: &str,
        task_id: Option<&str>,
        working_directory: &Path,
        cancel: &CancellationToken,
    ) -> BackendResult<WorkerContainer> {
        let lock = self.launch_lock(key);
        let _guard = lock.lock().await;
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }

        let existing = self.containers.get(key).map(|c| c.value().clone());
        if let Some(existing) = existing {
            if self.probe.is_healthy(&existing.base_url).await {
                debug!("reusing container {} for {}", existing.name, key);
                return Ok(existing);
            }
            warn!(
                "container {} for {} is unhealthy, replacing it",
                existing.name, key
            );
            self.containers.remove(key);
            self.teardown(&existing).await;
        }

        self.launch(key, task_id, working_directory, cancel).await
    }

    async fn launch(
        &self,
        key: &str,
        task_id: Option<&str>,
        working_directory: &Path,
        cancel: &CancellationToken,
    ) -> BackendResult<WorkerContainer> {
        let workspace = match task_id {
            Some(task_id) => self
                .collaborators
                .workspaces
                .ensure_workspace(task_id)
                .await
                .map_err(|e| BackendError::Startup(format!("workspace: {:#}", e)))?
                .map(|w| w.working_directory)
                .unwrap_or_else(|| working_directory.to_path_buf()),
            None => working_directory.to_path_buf(),
        };

        self.ensure_image().await?;
        let config = self.container_config(key, task_id, &workspace)?;
        config.validate()?;

        let name = config.name.clone().unwrap_or_default();
        info!("launching container {} from {}", name, config.image);
        let container_id = self.runtime.launch(&config).await?;

        let base_url = match self.resolve_address(&container_id).await {
            Ok(url) => url,
            Err(e) => {
                self.teardown(&WorkerContainer {
                    container_id,
                    name,
                    base_url: String::new(),
                })
                .await;
                return Err(e);
            }
        };

        let worker = WorkerContainer {
            container_id,
            name,
            base_url,
        };
        self.containers.insert(key.to_string(), worker.clone());

        match self.probe.wait_healthy(&worker.base_url, cancel).await {
            Ok(()) => {
                info!("container {} ready at {}", worker.name, worker.base_url);
                Ok(worker)
            }
            // Whoever cancelled owns the teardown.
            Err(BackendError::Cancelled) => Err(BackendError::Cancelled),
            Err(e) => {
                if let Some((_, tracked)) = self.containers.remove(key) {
                    self.teardown(&tracked).await;
                }
                Err(e)
            }
        }
    }

    async fn ensure_image(&self) -> BackendResult<()> {
        let image = &self.config.image;
        if self.runtime.has_image(image).await? {
            return Ok(());
        }
        if !self.config.pull_missing_image {
            return Err(BackendError::Startup(format!("image {} not found", image)));
        }
        info!("pulling image {}", image);
        self.runtime.pull(image).await?;
        Ok(())
    }

    fn container_config(
        &self,
        key: &str,
        task_id: Option<&str>,
        workspace: &Path,
    ) -> BackendResult<ContainerConfig> {
        let cfg = &self.config;
        let mut config = ContainerConfig::new(&cfg.image)
            .name(container_name(&cfg.name_prefix, key))
            .port(PortMapping::ephemeral(cfg.worker_port))
            .volume(workspace.display().to_string(), &cfg.workspace_mount)
            .workdir(&cfg.workspace_mount)
            .label(MANAGED_LABEL, "true")
            .limits(cfg.limits.clone());

        if let Some(ref network) = cfg.network {
            config = config.network_mode(network);
        }
        if cfg.map_user {
            config = config.user(host_user());
        }
        for (k, v) in &cfg.env {
            config = config.env(k, v);
        }
        for spec in &cfg.credentials {
            if let Some((name, value)) = spec.resolve(|n| (self.env_lookup)(n))? {
                config = config.env(name, value);
            }
        }
        if let Some(task_id) = task_id {
            config = config.env("TASK_ID", task_id).label(TASK_LABEL, task_id);
        }
        if let Some(ref project_id) = cfg.project_id {
            config = config.env("PROJECT_ID", project_id);
        }
        Ok(config)
    }

    async fn resolve_address(&self, container_id: &str) -> BackendResult<String> {
        let cfg = &self.config;
        if cfg.network.as_deref() == Some("host") {
            return Ok(format!("http://{}:{}", cfg.host, cfg.worker_port));
        }
        match self
            .runtime
            .host_port(container_id, cfg.worker_port)
            .await?
        {
            Some(port) => Ok(format!("http://{}:{}", cfg.host, port)),
            None => Err(BackendError::Startup(format!(
                "container {} publishes no port for {}",
                container_id, cfg.worker_port
            ))),
        }
    }

    /// Stop and force-remove. Errors are logged.
    async fn teardown(&self, worker: &WorkerContainer) {
        info!("tearing down container {} ({})", worker.name, worker.container_id);
        if let Err(e) = self
            .runtime
            .stop(&worker.container_id, Some(self.config.stop_timeout_secs))
            .await
        {
            debug!(
                "stop container {} (may already be stopped): {:?}",
                worker.container_id, e
            );
        }
        if let Err(e) = self.runtime.remove(&worker.container_id, true).await {
            warn!("failed to remove container {}: {}", worker.container_id, e);
        }
    }

    /// Tear down the key's container once any launch in progress settles.
    async fn release(&self, key: &str) -> bool {
        let lock = self.launch_lock(key);
        let guard = lock.lock().await;
        let removed = self.containers.remove(key);
        if let Some((_, ref worker)) = removed {
            self.teardown(worker).await;
        }
        drop(guard);
        drop(lock);
        self.forget_launch_lock(key);
        removed.is_some()
    }

    /// Proxy one turn and report its outcome on the emitter.
    async fn run_turn(
        &self,
        record: &Record,
        emitter: &EventEmitter,
        client: &WorkerClient,
        call: WorkerCall,
    ) -> PumpOutcome {
        let outcome = proxy_turn(&self.registry, record, emitter, client, call, None, |slot, id| {
            slot.worker_session_id = Some(id.to_string())
        })
        .await;
        match outcome {
            PumpOutcome::Failed(ref e) => {
                emitter.error(e).await;
            }
            PumpOutcome::Cancelled => info!("turn cancelled for session {}", record.session_id),
            PumpOutcome::Closed => debug!("caller dropped stream for {}", record.session_id),
            PumpOutcome::Completed | PumpOutcome::Deadline => {}
        }
        outcome
    }

    fn create_body(
        &self,
        prompt: String,
        mode: AgentMode,
        model: Option<String>,
        system_prompt: Option<String>,
        resume_id: Option<String>,
    ) -> CreateSessionBody {
        CreateSessionBody {
            prompt,
            working_directory: Some(self.config.workspace_mount.clone()),
            mode,
            model,
            system_prompt,
            resume_id,
            allowed_tools: mode.allowed_tools(),
            permission_mode: mode.permission_mode().map(str::to_string),
        }
    }
}

#[async_trait]
impl AgentBackend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn start_session(&self, request: StartSessionRequest) -> EventStream {
        let inner = Arc::clone(&self.inner);
        let session_id = request.session_id.clone().unwrap_or_else(new_session_id);
        let key = match request.task_id {
            Some(ref task_id) => task_key(task_id),
            None => session_key(&session_id),
        };
        // Registered before launch so stop can find and tear down a session
        // whose container is still starting.
        let slot = ContainerSlot {
            key: key.clone(),
            worker_session_id: None,
            task_scoped: request.task_id.is_some(),
        };
        let inserted = inner.registry.try_insert(
            SessionRecord::new(
                &session_id,
                request.working_directory.clone(),
                request.mode,
                slot,
            )
            .with_model(request.model.clone())
            .with_system_prompt(request.system_prompt.clone())
            .with_task_id(request.task_id.clone())
            .with_conversation_id(request.resume_id.clone()),
        );
        let Some(record) = inserted else {
            return error_stream(
                &session_id,
                &BackendError::Protocol(format!("session {} already exists", session_id)),
            );
        };

        if let Err(e) = inner
            .collaborators
            .cache
            .initialize_session(
                &session_id,
                &request.working_directory,
                request.task_id.as_deref(),
            )
            .await
        {
            warn!("failed to initialize message cache for {}: {:#}", session_id, e);
        }

        let (emitter, stream) = EventEmitter::channel(&session_id, inner.collaborators.clone());
        tokio::spawn(async move {
            let Some(_permit) = record.acquire_gate().await else {
                return;
            };
            let Some(current) = inner.registry.get(&record.session_id) else {
                return;
            };

            let worker = match inner
                .get_or_start(
                    &key,
                    request.task_id.as_deref(),
                    &request.working_directory,
                    &current.cancel,
                )
                .await
            {
                Ok(worker) => worker,
                Err(e) => {
                    if !matches!(e, BackendError::Cancelled) {
                        inner.registry.remove(&current.session_id);
                        inner.forget_launch_lock(&key);
                    }
                    emitter.error(&e).await;
                    return;
                }
            };

            let client = WorkerClient::new(inner.transport.clone(), worker.base_url);
            let body = inner.create_body(
                request.prompt,
                request.mode,
                request.model,
                request.system_prompt,
                request.resume_id,
            );
            inner
                .run_turn(&current, &emitter, &client, WorkerCall::Create(body))
                .await;
        });

        stream
    }

    async fn send_message(
        &self,
        session_id: &str,
        message: &str,
        model: Option<String>,
    ) -> EventStream {
        let inner = Arc::clone(&self.inner);
        let Some(record) = inner.registry.get(session_id) else {
            return error_stream(session_id, &BackendError::NotFound(session_id.to_string()));
        };

        let (emitter, stream) = EventEmitter::channel(session_id, inner.collaborators.clone());
        let message = message.to_string();
        tokio::spawn(async move {
            let Some(_permit) = record.acquire_gate().await else {
                emitter
                    .error(&BackendError::NotFound(record.session_id.clone()))
                    .await;
                return;
            };
            let Some(current) = inner.registry.get(&record.session_id) else {
                emitter
                    .error(&BackendError::NotFound(record.session_id.clone()))
                    .await;
                return;
            };
            let worker = match inner
                .get_or_start(
                    &current.slot.key,
                    current.task_id.as_deref(),
                    &current.working_directory,
                    &current.cancel,
                )
                .await
            {
                Ok(worker) => worker,
                Err(e) => {
                    emitter.error(&e).await;
                    return;
                }
            };
            let client = WorkerClient::new(inner.transport.clone(), worker.base_url);

            let known = current.slot.worker_session_id.clone();
            let resumable = known.is_some();
            let call = match known {
                Some(worker_session_id) => WorkerCall::Send {
                    worker_session_id,
                    body: SendMessageBody {
                        message: message.clone(),
                        model: model.clone(),
                    },
                },
                // The first turn ended before the worker confirmed a session.
                None => {
                    info!(
                        "no worker session for {}, creating one",
                        current.session_id
                    );
                    WorkerCall::Create(inner.create_body(
                        message.clone(),
                        current.mode,
                        model.clone().or_else(|| current.model.clone()),
                        current.system_prompt.clone(),
                        current.conversation_id.clone(),
                    ))
                }
            };
            let outcome = proxy_turn(
                &inner.registry,
                &current,
                &emitter,
                &client,
                call,
                None,
                |slot, id| slot.worker_session_id = Some(id.to_string()),
            )
            .await;

            // A relaunched worker no longer knows the session: resume the
            // conversation in a fresh worker session.
            if let PumpOutcome::Failed(BackendError::Transport(ref e)) = outcome
                && resumable
                && e.status() == Some(404)
            {
                info!(
                    "worker lost session {}, resuming {:?}",
                    current.session_id, current.conversation_id
                );
                let Some(current) = inner.registry.get(&current.session_id) else {
                    return;
                };
                let body = inner.create_body(
                    message,
                    current.mode,
                    model.or_else(|| current.model.clone()),
                    current.system_prompt.clone(),
                    current.conversation_id.clone(),
                );
                inner
                    .run_turn(&current, &emitter, &client, WorkerCall::Create(body))
                    .await;
                return;
            }
            if let PumpOutcome::Failed(ref e) = outcome {
                emitter.error(e).await;
            }
        });

        stream
    }

    async fn answer_question(
        &self,
        session_id: &str,
        tool_use_id: &str,
        answers: Answers,
    ) -> BackendResult<Option<EventStream>> {
        let inner = Arc::clone(&self.inner);
        let record = inner
            .registry
            .get(session_id)
            .ok_or_else(|| BackendError::NotFound(session_id.to_string()))?;
        let worker_session_id = record.slot.worker_session_id.clone().ok_or_else(|| {
            BackendError::Protocol("worker session was never started".to_string())
        })?;
        let client = inner.worker(&record.slot.key).ok_or_else(|| {
            BackendError::Protocol(format!("no worker container for {}", session_id))
        })?;

        let (emitter, stream) = EventEmitter::channel(session_id, inner.collaborators.clone());
        let call = WorkerCall::Answer {
            worker_session_id,
            body: AnswerBody {
                tool_use_id: tool_use_id.to_string(),
                answers,
            },
        };
        tokio::spawn(async move {
            inner.run_turn(&record, &emitter, &client, call).await;
        });
        Ok(Some(stream))
    }

    async fn interrupt_session(&self, session_id: &str) -> BackendResult<()> {
        let inner = &self.inner;
        let previous = inner
            .registry
            .get(session_id)
            .ok_or_else(|| BackendError::NotFound(session_id.to_string()))?;
        inner.registry.update(session_id, |r| r.with_fresh_scope());
        previous.cancel.cancel();

        if let (Some(worker_session_id), Some(client)) = (
            previous.slot.worker_session_id.as_deref(),
            inner.worker(&previous.slot.key),
        ) && let Err(e) = client.interrupt(worker_session_id).await
        {
            warn!("failed to interrupt worker session {}: {}", worker_session_id, e);
        }
        info!("interrupted session {}", session_id);
        Ok(())
    }

    async fn stop_session(&self, session_id: &str) -> BackendResult<()> {
        let inner = &self.inner;
        let record = inner
            .registry
            .remove(session_id)
            .ok_or_else(|| BackendError::NotFound(session_id.to_string()))?;
        record.cancel.cancel();
        record.gate.close();

        if record.slot.task_scoped {
            // The task's container outlives the session.
            if let (Some(worker_session_id), Some(client)) = (
                record.slot.worker_session_id.as_deref(),
                inner.worker(&record.slot.key),
            ) && let Err(e) = client.delete_session(worker_session_id).await
            {
                warn!("failed to delete worker session {}: {}", worker_session_id, e);
            }
        } else {
            inner.release(&record.slot.key).await;
        }
        info!("stopped session {}", session_id);
        Ok(())
    }

    async fn session_status(&self, session_id: &str) -> Option<SessionStatus> {
        self.inner
            .registry
            .get(session_id)
            .map(|r| r.status(BackendKind::Container))
    }

    async fn list_sessions(&self) -> Vec<SessionStatus> {
        self.inner
            .registry
            .list()
            .iter()
            .map(|r| r.status(BackendKind::Container))
            .collect()
    }

    async fn cleanup_orphaned_containers(&self) -> BackendResult<usize> {
        let inner = &self.inner;
        let containers = inner.runtime.list(true).await?;
        let known: HashSet<String> = inner
            .containers
            .iter()
            .map(|c| c.container_id.clone())
            .collect();
        // `ps` may print short ids while `run` returned the full one.
        let is_known = |id: &str| {
            known
                .iter()
                .any(|k| k.starts_with(id) || id.starts_with(k.as_str()))
        };

        let orphans: Vec<_> = containers
            .into_iter()
            .filter(|c| {
                c.clean_names()
                    .any(|name| name.starts_with(&inner.config.name_prefix))
                    && !is_known(&c.id)
            })
            .collect();
        if !orphans.is_empty() {
            info!("found {} orphan container(s)", orphans.len());
        }

        let mut cleaned = 0;
        for container in orphans {
            let name = container
                .clean_names()
                .next()
                .map(str::to_string)
                .unwrap_or_else(|| container.id.clone());
            info!("removing orphan container {} ({})", name, container.id);
            if let Err(e) = inner
                .runtime
                .stop(&container.id, Some(ORPHAN_STOP_TIMEOUT_SECS))
                .await
            {
                debug!(
                    "stop container {} (may already be stopped): {:?}",
                    container.id, e
                );
            }
            match inner.runtime.remove(&container.id, true).await {
                Ok(()) => cleaned += 1,
                Err(e) => warn!(
                    "failed to remove orphan container {} ({}): {:?}",
                    name, container.id, e
                ),
            }
        }
        Ok(cleaned)
    }

    async fn shutdown(&self) {
        for status in self.list_sessions().await {
            if let Err(e) = self.stop_session(&status.session_id).await {
                warn!("failed to stop session {}: {}", status.session_id, e);
            }
        }
        let keys: Vec<String> = self
            .inner
            .containers
            .iter()
            .map(|c| c.key().clone())
            .collect();
        for key in keys {
            self.inner.release(&key).await;
        }
    }
}
