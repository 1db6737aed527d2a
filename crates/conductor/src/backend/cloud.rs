//! Cloud dynamic-session backend.
//!
//! Each session leases a worker from a pool on a cloud control plane. The
//! lease carries an endpoint that speaks the same worker API as the
//! container backend, and is held for at most `max_session_duration_secs`;
//! a session that outlives it ends with `session.ended{reason:"max_duration"}`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conductor_protocol::worker::{
    AnswerBody, CreateSessionBody, PoolSession, PoolSessionRequest, SendMessageBody,
};
use conductor_protocol::{Answers, EventPayload};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::worker::{PumpOutcome, WorkerCall, proxy_turn};
use super::{
    AgentBackend, BackendKind, Collaborators, EventEmitter, EventStream, HealthProbe,
    HttpHealthProbe, StartSessionRequest, WorkerClient, error_stream, new_session_id,
};
use crate::error::{BackendError, BackendResult};
use crate::registry::{SessionRecord, SessionRegistry, SessionStatus};
use crate::transport::{Transport, join_url};

/// Reason reported when a session hits its duration ceiling.
pub const MAX_DURATION_REASON: &str = "max_duration";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudBackendConfig {
    /// Control plane base URL.
    pub base_url: String,
    pub pool: String,
    /// Environment variable holding the control plane bearer token.
    pub token_credential: Option<String>,
    pub max_session_duration_secs: u64,
    pub health_attempts: u32,
    pub health_interval_ms: u64,
    pub request_timeout_secs: u64,
}

impl Default for CloudBackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8700".to_string(),
            pool: "default".to_string(),
            token_credential: None,
            max_session_duration_secs: 3600,
            health_attempts: 60,
            health_interval_ms: 1000,
            request_timeout_secs: 30,
        }
    }
}

/// Leases and releases pool sessions.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn allocate(&self, label: Option<String>) -> BackendResult<PoolSession>;
    async fn release(&self, pool_session_id: &str) -> BackendResult<()>;
}

/// `POST/DELETE {base}/pools/{pool}/sessions[/{id}]`.
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    transport: Transport,
    base_url: String,
    pool: String,
}

impl HttpControlPlane {
    pub fn new(transport: Transport, base_url: impl Into<String>, pool: impl Into<String>) -> Self {
        Self {
            transport,
            base_url: base_url.into(),
            pool: pool.into(),
        }
    }

    fn sessions_url(&self) -> String {
        join_url(&self.base_url, &format!("pools/{}/sessions", self.pool))
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn allocate(&self, label: Option<String>) -> BackendResult<PoolSession> {
        let session: PoolSession = self
            .transport
            .post_json(&self.sessions_url(), &PoolSessionRequest { label })
            .await
            .map_err(|e| BackendError::Startup(format!("allocating pool session: {}", e)))?;
        Ok(session)
    }

    async fn release(&self, pool_session_id: &str) -> BackendResult<()> {
        let url = join_url(&self.sessions_url(), pool_session_id);
        self.transport.delete(&url).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
struct CloudSlot {
    /// Lease from the control plane; unset while allocating.
    lease: Option<PoolSession>,
    /// Session id assigned by the worker; unset until `session-started`.
    worker_session_id: Option<String>,
    /// Absolute end of the lease.
    deadline: Instant,
}

type Record = SessionRecord<CloudSlot>;

struct Inner {
    config: CloudBackendConfig,
    control: Arc<dyn ControlPlane>,
    probe: Arc<dyn HealthProbe>,
    transport: Transport,
    collaborators: Collaborators,
    registry: SessionRegistry<CloudSlot>,
}

pub struct CloudBackend {
    inner: Arc<Inner>,
}

impl CloudBackend {
    /// Backend talking to the configured control plane. Fails when the named
    /// token credential is configured but unset.
    pub fn new(config: CloudBackendConfig, collaborators: Collaborators) -> BackendResult<Self> {
        let token = match config.token_credential {
            Some(ref name) => Some(std::env::var(name).map_err(|_| {
                BackendError::Startup(format!("credential {} is not set", name))
            })?),
            None => None,
        };
        let transport = Transport::new()
            .with_bearer_token(token)
            .with_request_timeout(Duration::from_secs(config.request_timeout_secs));
        let control = HttpControlPlane::new(transport.clone(), &config.base_url, &config.pool);
        let probe = HttpHealthProbe::new(
            transport.clone(),
            config.health_attempts,
            Duration::from_millis(config.health_interval_ms),
        );
        Ok(Self::with_parts(
            config,
            Arc::new(control),
            Arc::new(probe),
            transport,
            collaborators,
        ))
    }

    pub fn with_parts(
        config: CloudBackendConfig,
        control: Arc<dyn ControlPlane>,
        probe: Arc<dyn HealthProbe>,
        transport: Transport,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                control,
                probe,
                transport,
                collaborators,
                registry: SessionRegistry::new(),
            }),
        }
    }
}

impl Inner {
    fn worker(&self, lease: &PoolSession) -> WorkerClient {
        WorkerClient::new(self.transport.clone(), lease.endpoint.clone())
    }

    /// Best-effort lease release.
    async fn release(&self, lease: &PoolSession) {
        info!("releasing pool session {}", lease.id);
        if let Err(e) = self.control.release(&lease.id).await {
            warn!("failed to release pool session {}: {}", lease.id, e);
        }
    }

    /// Remove the session, cancel its scope and release its lease. Returns
    /// `None` when the session was already gone.
    async fn discard(&self, session_id: &str) -> Option<Arc<Record>> {
        let record = self.registry.remove(session_id)?;
        record.cancel.cancel();
        record.gate.close();
        if let Some(ref lease) = record.slot.lease {
            self.release(lease).await;
        }
        Some(record)
    }

    /// End a session that reached its duration ceiling.
    async fn expire(&self, session_id: &str, emitter: &EventEmitter) {
        info!("session {} reached its maximum duration", session_id);
        emitter
            .emit(EventPayload::SessionEnded {
                reason: MAX_DURATION_REASON.to_string(),
            })
            .await;
        self.discard(session_id).await;
    }

    /// Lease a worker unless the session holds one, then wait for it. On
    /// failure the session is discarded.
    async fn acquire_worker(&self, record: &Record) -> BackendResult<PoolSession> {
        let lease = match record.slot.lease.clone() {
            Some(lease) => lease,
            None => self.allocate(record).await?,
        };

        match self.probe.wait_healthy(&lease.endpoint, &record.cancel).await {
            Ok(()) => Ok(lease),
            Err(BackendError::Cancelled) => Err(BackendError::Cancelled),
            Err(e) => {
                self.discard(&record.session_id).await;
                Err(e)
            }
        }
    }

    async fn allocate(&self, record: &Record) -> BackendResult<PoolSession> {
        let label = record.task_id.clone();
        let lease = match self.control.allocate(label).await {
            Ok(lease) => lease,
            Err(e) => {
                self.registry.remove(&record.session_id);
                return Err(e);
            }
        };
        info!(
            "leased pool session {} at {} for {}",
            lease.id, lease.endpoint, record.session_id
        );

        let stored = self.registry.update(&record.session_id, |r| {
            let mut next = r.clone();
            next.slot.lease = Some(lease.clone());
            next
        });
        if stored.is_none() {
            // Stopped while allocating.
            self.release(&lease).await;
            return Err(BackendError::Cancelled);
        }
        Ok(lease)
    }

    async fn run_turn(
        &self,
        record: &Record,
        emitter: &EventEmitter,
        lease: &PoolSession,
        call: WorkerCall,
    ) {
        if Instant::now() >= record.slot.deadline {
            self.expire(&record.session_id, emitter).await;
            return;
        }
        let client = self.worker(lease);
        let outcome = proxy_turn(
            &self.registry,
            record,
            emitter,
            &client,
            call,
            Some(record.slot.deadline),
            |slot, id| slot.worker_session_id = Some(id.to_string()),
        )
        .await;
        match outcome {
            PumpOutcome::Deadline => self.expire(&record.session_id, emitter).await,
            PumpOutcome::Failed(ref e) => {
                emitter.error(e).await;
            }
            PumpOutcome::Cancelled => info!("turn cancelled for session {}", record.session_id),
            PumpOutcome::Closed => debug!("caller dropped stream for {}", record.session_id),
            PumpOutcome::Completed => {}
        }
    }
}

/// Body that opens a worker session for `record`.
fn create_body(record: &Record, prompt: String, model: Option<String>) -> CreateSessionBody {
    let mode = record.mode;
    CreateSessionBody {
        prompt,
        working_directory: Some(record.working_directory.display().to_string()),
        mode,
        model: model.or_else(|| record.model.clone()),
        system_prompt: record.system_prompt.clone(),
        resume_id: record.conversation_id.clone(),
        allowed_tools: mode.allowed_tools(),
        permission_mode: mode.permission_mode().map(str::to_string),
    }
}

/// Lease and worker session id of a live session, or the error to report.
fn worker_target(record: &Record) -> BackendResult<(PoolSession, String)> {
    let lease = record.slot.lease.clone().ok_or_else(|| {
        BackendError::Protocol(format!("session {} has no worker", record.session_id))
    })?;
    let worker_session_id = record.slot.worker_session_id.clone().ok_or_else(|| {
        BackendError::Protocol("worker session was never started".to_string())
    })?;
    Ok((lease, worker_session_id))
}

#[async_trait]
impl AgentBackend for CloudBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cloud
    }

    async fn start_session(&self, request: StartSessionRequest) -> EventStream {
        let inner = Arc::clone(&self.inner);
        let session_id = request.session_id.clone().unwrap_or_else(new_session_id);
        let slot = CloudSlot {
            lease: None,
            worker_session_id: None,
            deadline: Instant::now() + Duration::from_secs(inner.config.max_session_duration_secs),
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
            let lease = match inner.acquire_worker(&current).await {
                Ok(lease) => lease,
                Err(e) => {
                    emitter.error(&e).await;
                    return;
                }
            };

            let body = create_body(&current, request.prompt, None);
            inner
                .run_turn(&current, &emitter, &lease, WorkerCall::Create(body))
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
            let target = if current.slot.worker_session_id.is_some() {
                worker_target(&current).map(|(lease, worker_session_id)| {
                    let call = WorkerCall::Send {
                        worker_session_id,
                        body: SendMessageBody { message, model },
                    };
                    (lease, call)
                })
            } else {
                // The first turn ended before the worker confirmed a session.
                info!(
                    "no worker session for {}, creating one",
                    current.session_id
                );
                inner.acquire_worker(&current).await.map(|lease| {
                    let call = WorkerCall::Create(create_body(&current, message, model));
                    (lease, call)
                })
            };
            match target {
                Ok((lease, call)) => inner.run_turn(&current, &emitter, &lease, call).await,
                Err(e) => {
                    emitter.error(&e).await;
                }
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
        let (lease, worker_session_id) = worker_target(&record)?;

        let (emitter, stream) = EventEmitter::channel(session_id, inner.collaborators.clone());
        let call = WorkerCall::Answer {
            worker_session_id,
            body: AnswerBody {
                tool_use_id: tool_use_id.to_string(),
                answers,
            },
        };
        tokio::spawn(async move {
            inner.run_turn(&record, &emitter, &lease, call).await;
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

        if let Ok((lease, worker_session_id)) = worker_target(&previous)
            && let Err(e) = inner.worker(&lease).interrupt(&worker_session_id).await
        {
            warn!("failed to interrupt worker session {}: {}", worker_session_id, e);
        }
        info!("interrupted session {}", session_id);
        Ok(())
    }

    async fn stop_session(&self, session_id: &str) -> BackendResult<()> {
        self.inner
            .discard(session_id)
            .await
            .ok_or_else(|| BackendError::NotFound(session_id.to_string()))?;
        info!("stopped session {}", session_id);
        Ok(())
    }

    async fn session_status(&self, session_id: &str) -> Option<SessionStatus> {
        self.inner
            .registry
            .get(session_id)
            .map(|r| r.status(BackendKind::Cloud))
    }

    async fn list_sessions(&self) -> Vec<SessionStatus> {
        self.inner
            .registry
            .list()
            .iter()
            .map(|r| r.status(BackendKind::Cloud))
            .collect()
    }
}
