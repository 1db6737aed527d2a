//! Test utilities: a fake worker and a fake cloud control plane served over
//! real HTTP, plus a container runtime that "publishes" the fake worker.
#![allow(dead_code)]

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event as SseEvent, Sse};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use conductor::container::{
    Container, ContainerConfig, ContainerResult, ContainerRuntimeApi, ContainerState,
};
use conductor_protocol::Event;
use conductor_protocol::worker::{
    AnswerBody, CreateSessionBody, PoolSession, PoolSessionRequest, SSE_DONE,
    SSE_SESSION_STARTED, SendMessageBody,
};
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{Value, json};

type EventBody = BoxStream<'static, Result<SseEvent, Infallible>>;

/// Serve `app` on an ephemeral local port and return its base URL.
pub async fn serve(app: Router) -> (String, u16) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let port = listener.local_addr().expect("local addr").port();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });
    (format!("http://127.0.0.1:{port}"), port)
}

/// Collect a stream with a generous ceiling so a hung backend fails the test
/// instead of blocking it.
pub async fn collect(stream: conductor::EventStream) -> Vec<Event> {
    tokio::time::timeout(Duration::from_secs(10), stream.collect())
        .await
        .expect("event stream did not finish")
}

// ============================================================================
// Fake worker
// ============================================================================

/// Requests seen by the fake worker.
#[derive(Default)]
pub struct WorkerState {
    next_id: AtomicUsize,
    /// Worker session id -> conversation id.
    sessions: Mutex<HashMap<String, String>>,
    pub created: Mutex<Vec<CreateSessionBody>>,
    pub sent: Mutex<Vec<(String, SendMessageBody)>>,
    pub answers: Mutex<Vec<(String, AnswerBody)>>,
    pub interrupted: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
    pub authorization: Mutex<Vec<Option<String>>>,
}

impl WorkerState {
    /// Drop every worker session, as a restarted worker would.
    pub fn forget_sessions(&self) {
        self.sessions.lock().unwrap().clear();
    }

    fn conversation(&self, worker_session_id: &str) -> Option<String> {
        self.sessions
            .lock()
            .unwrap()
            .get(worker_session_id)
            .cloned()
    }
}

pub struct FakeWorker {
    pub base_url: String,
    pub port: u16,
    pub state: Arc<WorkerState>,
}

impl FakeWorker {
    pub async fn start() -> Self {
        let state = Arc::new(WorkerState::default());
        let app = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route("/sessions", post(create_session))
            .route("/sessions/{id}/messages", post(send_message))
            .route("/sessions/{id}/answer", post(answer))
            .route("/sessions/{id}/interrupt", post(interrupt))
            .route("/sessions/{id}", delete(delete_session))
            .with_state(Arc::clone(&state));
        let (base_url, port) = serve(app).await;
        Self {
            base_url,
            port,
            state,
        }
    }
}

fn sse(name: &str, data: Value) -> Result<SseEvent, Infallible> {
    Ok(SseEvent::default().event(name).data(data.to_string()))
}

fn stream_event(event: Value) -> Result<SseEvent, Infallible> {
    sse("stream_event", json!({ "type": "stream_event", "event": event }))
}

/// A streamed text answer, split over two deltas, closed by a result.
pub fn text_turn(conversation_id: &str, text: &str) -> Vec<Result<SseEvent, Infallible>> {
    let (head, tail) = text.split_at(text.len() / 2);
    vec![
        sse(
            "system",
            json!({ "type": "system", "subtype": "init", "session_id": conversation_id }),
        ),
        stream_event(json!({
            "type": "content_block_start",
            "index": 0,
            "content_block": { "type": "text", "text": "" }
        })),
        stream_event(json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "text_delta", "text": head }
        })),
        stream_event(json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "text_delta", "text": tail }
        })),
        stream_event(json!({ "type": "content_block_stop", "index": 0 })),
        sse(
            "assistant",
            json!({
                "type": "assistant",
                "message": { "role": "assistant", "content": [{ "type": "text", "text": text }] }
            }),
        ),
        sse(
            "result",
            json!({
                "type": "result",
                "subtype": "success",
                "session_id": conversation_id,
                "total_cost_usd": 0.01,
                "duration_ms": 12,
                "num_turns": 1,
                "is_error": false
            }),
        ),
        sse(SSE_DONE, json!({})),
    ]
}

/// The agent asks which database to use, then the stream pauses.
fn ask_turn() -> Vec<Result<SseEvent, Infallible>> {
    let input = json!({
        "questions": [{
            "question": "Which database?",
            "header": "DB",
            "options": [{ "label": "Postgres" }, { "label": "SQLite" }],
            "multiSelect": false
        }]
    })
    .to_string();
    let (head, tail) = input.split_at(input.len() / 2);
    vec![
        stream_event(json!({
            "type": "content_block_start",
            "index": 0,
            "content_block": { "type": "tool_use", "id": "toolu_1", "name": "AskUserQuestion", "input": {} }
        })),
        stream_event(json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "input_json_delta", "partial_json": head }
        })),
        stream_event(json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": { "type": "input_json_delta", "partial_json": tail }
        })),
        stream_event(json!({ "type": "content_block_stop", "index": 0 })),
        sse(SSE_DONE, json!({})),
    ]
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn create_session(
    State(state): State<Arc<WorkerState>>,
    headers: HeaderMap,
    Json(body): Json<CreateSessionBody>,
) -> Sse<EventBody> {
    state.authorization.lock().unwrap().push(bearer(&headers));
    let n = state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    let worker_id = format!("w-{n}");
    let conversation = body
        .resume_id
        .clone()
        .unwrap_or_else(|| format!("conv-{n}"));
    state
        .sessions
        .lock()
        .unwrap()
        .insert(worker_id.clone(), conversation.clone());
    let prompt = body.prompt.clone();
    state.created.lock().unwrap().push(body);

    let mut events = vec![sse(
        SSE_SESSION_STARTED,
        json!({ "session_id": worker_id }),
    )];
    match prompt.as_str() {
        // Holds the response headers, so the caller never learns the id.
        "stall" => tokio::time::sleep(Duration::from_secs(30)).await,
        "hang" => return Sse::new(stream::iter(events).chain(stream::pending()).boxed()),
        "ask" => events.extend(ask_turn()),
        _ => events.extend(text_turn(&conversation, &format!("Hello from {worker_id}"))),
    }
    Sse::new(stream::iter(events).boxed())
}

async fn send_message(
    State(state): State<Arc<WorkerState>>,
    Path(id): Path<String>,
    Json(body): Json<SendMessageBody>,
) -> Result<Sse<EventBody>, StatusCode> {
    let conversation = state.conversation(&id).ok_or(StatusCode::NOT_FOUND)?;
    let text = format!("Echo: {}", body.message);
    state.sent.lock().unwrap().push((id, body));
    Ok(Sse::new(
        stream::iter(text_turn(&conversation, &text)).boxed(),
    ))
}

async fn answer(
    State(state): State<Arc<WorkerState>>,
    Path(id): Path<String>,
    Json(body): Json<AnswerBody>,
) -> Result<Sse<EventBody>, StatusCode> {
    let conversation = state.conversation(&id).ok_or(StatusCode::NOT_FOUND)?;
    let picked = body
        .answers
        .get("Which database?")
        .cloned()
        .unwrap_or_default();
    state.answers.lock().unwrap().push((id, body));
    Ok(Sse::new(
        stream::iter(text_turn(&conversation, &format!("Using {picked}"))).boxed(),
    ))
}

async fn interrupt(State(state): State<Arc<WorkerState>>, Path(id): Path<String>) -> StatusCode {
    state.interrupted.lock().unwrap().push(id);
    StatusCode::OK
}

async fn delete_session(
    State(state): State<Arc<WorkerState>>,
    Path(id): Path<String>,
) -> StatusCode {
    state.sessions.lock().unwrap().remove(&id);
    state.deleted.lock().unwrap().push(id);
    StatusCode::NO_CONTENT
}

// ============================================================================
// Fake control plane
// ============================================================================

#[derive(Default)]
pub struct ControlPlaneState {
    next_id: AtomicUsize,
    endpoint: String,
    pub allocated: Mutex<Vec<(String, Option<String>)>>,
    pub released: Mutex<Vec<String>>,
    pub authorization: Mutex<Vec<Option<String>>>,
}

pub struct FakeControlPlane {
    pub base_url: String,
    pub state: Arc<ControlPlaneState>,
}

impl FakeControlPlane {
    /// Control plane whose pool sessions all point at `endpoint`.
    pub async fn start(endpoint: &str) -> Self {
        let state = Arc::new(ControlPlaneState {
            endpoint: endpoint.to_string(),
            ..Default::default()
        });
        let app = Router::new()
            .route("/pools/{pool}/sessions", post(allocate))
            .route("/pools/{pool}/sessions/{id}", delete(release))
            .with_state(Arc::clone(&state));
        let (base_url, _) = serve(app).await;
        Self { base_url, state }
    }
}

async fn allocate(
    State(state): State<Arc<ControlPlaneState>>,
    Path(pool): Path<String>,
    headers: HeaderMap,
    Json(body): Json<PoolSessionRequest>,
) -> Json<PoolSession> {
    state.authorization.lock().unwrap().push(bearer(&headers));
    state.allocated.lock().unwrap().push((pool, body.label));
    let n = state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    Json(PoolSession {
        id: format!("pool-{n}"),
        endpoint: state.endpoint.clone(),
    })
}

async fn release(
    State(state): State<Arc<ControlPlaneState>>,
    Path((_pool, id)): Path<(String, String)>,
) -> StatusCode {
    state.released.lock().unwrap().push(id);
    StatusCode::NO_CONTENT
}

// ============================================================================
// Container runtime publishing the fake worker
// ============================================================================

/// Every "container" is the fake worker listening on `port`.
pub struct PublishingRuntime {
    port: u16,
    pub created: Mutex<Vec<ContainerConfig>>,
    pub stopped: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    pub listed: Mutex<Vec<Container>>,
}

impl PublishingRuntime {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            created: Mutex::new(Vec::new()),
            stopped: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            listed: Mutex::new(Vec::new()),
        }
    }
}

pub fn listed_container(id: &str, name: &str) -> Container {
    Container {
        id: id.to_string(),
        names: vec![name.to_string()],
        image: "conductor-worker:latest".to_string(),
        state: ContainerState::Running,
    }
}

#[async_trait]
impl ContainerRuntimeApi for PublishingRuntime {
    async fn launch(&self, config: &ContainerConfig) -> ContainerResult<String> {
        let mut created = self.created.lock().unwrap();
        created.push(config.clone());
        Ok(format!("cid-{}", created.len()))
    }

    async fn stop(&self, id: &str, _timeout: Option<u32>) -> ContainerResult<()> {
        self.stopped.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn remove(&self, id: &str, _force: bool) -> ContainerResult<()> {
        self.removed.lock().unwrap().push(id.to_string());
        Ok(())
    }

    async fn list(&self, _all: bool) -> ContainerResult<Vec<Container>> {
        Ok(self.listed.lock().unwrap().clone())
    }

    async fn host_port(&self, _id: &str, _port: u16) -> ContainerResult<Option<u16>> {
        Ok(Some(self.port))
    }

    async fn has_image(&self, _image: &str) -> ContainerResult<bool> {
        Ok(true)
    }

    async fn pull(&self, _image: &str) -> ContainerResult<()> {
        Ok(())
    }
}

// ============================================================================
// Message cache recorder
// ============================================================================

#[derive(Default)]
pub struct RecordingCache {
    pub initialized: Mutex<Vec<String>>,
    pub appended: Mutex<Vec<Event>>,
}

#[async_trait]
impl conductor::backend::MessageCache for RecordingCache {
    async fn initialize_session(
        &self,
        session_id: &str,
        _working_directory: &std::path::Path,
        _task_id: Option<&str>,
    ) -> anyhow::Result<()> {
        self.initialized.lock().unwrap().push(session_id.to_string());
        Ok(())
    }

    async fn append_message(&self, _session_id: &str, event: &Event) -> anyhow::Result<()> {
        self.appended.lock().unwrap().push(event.clone());
        Ok(())
    }
}
