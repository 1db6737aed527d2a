//! In-process backend: drives an agent runtime client directly.
//!
//! The agent asks the user through a `can_use_tool` control request for the
//! ask-user tool. The turn emits a question event and parks on a single-slot
//! rendezvous until [`AgentBackend::answer_question`] fills it; the answers
//! go back to the agent as the tool's updated input and the turn continues
//! on its original stream.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use conductor_protocol::messages::{ControlRequest, allow_tool_response, deny_tool_response};
use conductor_protocol::{ASK_USER_TOOL, AgentMessage, AgentMode, Answers, EventPayload};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::runtime::{AgentClient, AgentOptions, AgentRuntime, CliAgentConfig, QueryRequest};
use super::{
    AgentBackend, BackendKind, Collaborators, EventEmitter, EventStream, StartSessionRequest,
    error_stream, new_session_id,
};
use crate::error::{BackendError, BackendResult};
use crate::registry::{SessionRecord, SessionRegistry, SessionStatus};
use crate::stream::{StreamAssembler, TurnTranslator, question_event};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InProcessConfig {
    /// Model used when a session does not name one.
    pub default_model: Option<String>,
    pub cli: CliAgentConfig,
}

enum QuestionReply {
    Answered(Answers),
    Cancelled,
}

struct PendingQuestion {
    tool_use_id: String,
    reply: oneshot::Sender<QuestionReply>,
}

/// Holds at most one unanswered question per session.
#[derive(Default)]
struct QuestionSlot {
    pending: Mutex<Option<PendingQuestion>>,
}

impl QuestionSlot {
    async fn open(&self, tool_use_id: &str) -> oneshot::Receiver<QuestionReply> {
        let (tx, rx) = oneshot::channel();
        let previous = self.pending.lock().await.replace(PendingQuestion {
            tool_use_id: tool_use_id.to_string(),
            reply: tx,
        });
        if let Some(previous) = previous {
            warn!("question {} superseded by {}", previous.tool_use_id, tool_use_id);
            let _ = previous.reply.send(QuestionReply::Cancelled);
        }
        rx
    }

    async fn answer(&self, tool_use_id: &str, answers: Answers) -> BackendResult<()> {
        let mut pending = self.pending.lock().await;
        match pending.take() {
            Some(question) if question.tool_use_id == tool_use_id => {
                if question.reply.send(QuestionReply::Answered(answers)).is_err() {
                    return Err(BackendError::Protocol(format!(
                        "question {} is no longer waiting",
                        tool_use_id
                    )));
                }
                Ok(())
            }
            Some(question) => {
                let expected = question.tool_use_id.clone();
                *pending = Some(question);
                Err(BackendError::Protocol(format!(
                    "no pending question {} (waiting on {})",
                    tool_use_id, expected
                )))
            }
            None => Err(BackendError::Protocol(format!(
                "no pending question {}",
                tool_use_id
            ))),
        }
    }

    async fn cancel(&self) {
        if let Some(question) = self.pending.lock().await.take() {
            debug!("cancelling pending question {}", question.tool_use_id);
            let _ = question.reply.send(QuestionReply::Cancelled);
        }
    }
}

/// Runtime slot of an in-process session.
#[derive(Clone)]
struct InProcessSlot {
    client: Arc<dyn AgentClient>,
    questions: Arc<QuestionSlot>,
}

impl fmt::Debug for InProcessSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InProcessSlot").finish_non_exhaustive()
    }
}

type Registry = SessionRegistry<InProcessSlot>;
type Record = SessionRecord<InProcessSlot>;

pub struct InProcessBackend {
    runtime: Arc<dyn AgentRuntime>,
    config: InProcessConfig,
    registry: Arc<Registry>,
    collaborators: Collaborators,
}

impl InProcessBackend {
    pub fn new(runtime: Arc<dyn AgentRuntime>, config: InProcessConfig) -> Self {
        Self {
            runtime,
            config,
            registry: Arc::new(Registry::new()),
            collaborators: Collaborators::default(),
        }
    }

    pub fn with_collaborators(mut self, collaborators: Collaborators) -> Self {
        self.collaborators = collaborators;
        self
    }

    /// Spawn a task that waits for the session gate and runs one turn.
    fn spawn_turn(
        &self,
        session_id: &str,
        record: Arc<Record>,
        prompt: String,
        model: Option<String>,
        announce: bool,
    ) -> EventStream {
        let (emitter, stream) = EventEmitter::channel(session_id, self.collaborators.clone());
        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            let Some(_permit) = record.acquire_gate().await else {
                emitter
                    .error(&BackendError::NotFound(record.session_id.clone()))
                    .await;
                return;
            };
            // Re-read: an interrupt or an earlier turn may have replaced the
            // scope or the conversation id while this task waited.
            let Some(current) = registry.get(&record.session_id) else {
                emitter
                    .error(&BackendError::NotFound(record.session_id.clone()))
                    .await;
                return;
            };

            let conversation_id = match run_turn(&current, &emitter, prompt, model, announce).await
            {
                Ok(conversation_id) => conversation_id,
                Err(e) => {
                    // The agent never ran, so there is no session to keep.
                    if announce && let Some(removed) = registry.remove(&current.session_id) {
                        removed.cancel.cancel();
                        removed.gate.close();
                        removed.slot.client.close().await;
                    }
                    emitter.error(&e).await;
                    return;
                }
            };
            registry.update(&current.session_id, |r| {
                let conversation_id = conversation_id.or_else(|| r.conversation_id.clone());
                r.touched().with_conversation_id(conversation_id)
            });
        });

        stream
    }
}

/// Run one query to completion, returning the conversation id it reported.
///
/// Fails only when the query could not be started. Errors after that are
/// emitted as events.
async fn run_turn(
    record: &Record,
    emitter: &EventEmitter,
    prompt: String,
    model: Option<String>,
    announce: bool,
) -> BackendResult<Option<String>> {
    let cancel = record.cancel.clone();
    let query_cancel = cancel.child_token();
    let request = QueryRequest {
        prompt,
        resume_id: record.conversation_id.clone(),
        model,
        cancel: query_cancel.clone(),
    };

    let mut handle = record
        .slot
        .client
        .query(request)
        .await
        .map_err(|e| BackendError::Startup(format!("{:#}", e)))?;

    if announce
        && !emitter
            .emit(EventPayload::SessionStarted {
                conversation_id: record.conversation_id.clone(),
            })
            .await
    {
        query_cancel.cancel();
        return Ok(None);
    }

    let mut translator =
        TurnTranslator::with_assembler(StreamAssembler::new().without_question_events());

    let result = loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break Err(BackendError::Cancelled),
            message = handle.messages.recv() => message,
        };
        let Some(message) = message else {
            break Err(BackendError::Protocol(
                "agent exited before finishing the turn".to_string(),
            ));
        };

        match message {
            AgentMessage::ControlRequest {
                request_id,
                request,
            } => {
                let response =
                    match on_control_request(record, emitter, &cancel, &request_id, request).await {
                        Ok(Some(response)) => response,
                        Ok(None) => continue,
                        Err(e) => break Err(e),
                    };
                if handle.control.send(response).await.is_err() {
                    break Err(BackendError::Protocol(
                        "agent stopped reading control responses".to_string(),
                    ));
                }
            }
            other => {
                let done = matches!(other, AgentMessage::Result(_));
                if !emitter.emit_all(translator.translate(&other)).await {
                    debug!("caller dropped stream for session {}", record.session_id);
                    break Err(BackendError::Cancelled);
                }
                if done {
                    break Ok(());
                }
            }
        }
    };

    if let Err(e) = result {
        query_cancel.cancel();
        if matches!(e, BackendError::Cancelled) {
            info!("turn cancelled for session {}", record.session_id);
        }
        emitter.error(&e).await;
    }
    Ok(translator.conversation_id().map(str::to_string))
}

/// Handle a control request. `Ok(None)` means no response is owed.
async fn on_control_request(
    record: &Record,
    emitter: &EventEmitter,
    cancel: &CancellationToken,
    request_id: &str,
    request: ControlRequest,
) -> BackendResult<Option<Value>> {
    let ControlRequest::CanUseTool {
        tool_name,
        input,
        tool_use_id,
    } = request
    else {
        debug!("ignoring unsupported control request {}", request_id);
        return Ok(None);
    };

    if tool_name != ASK_USER_TOOL {
        if let Some(allowed) = record.mode.allowed_tools()
            && !allowed.iter().any(|t| t == &tool_name)
        {
            info!("denying {} in {} mode", tool_name, record.mode);
            let message = format!("{} is not available in {} mode", tool_name, record.mode);
            return Ok(Some(deny_tool_response(request_id, &message)));
        }
        return Ok(Some(allow_tool_response(request_id, input)));
    }

    let tool_use_id = tool_use_id.unwrap_or_else(|| request_id.to_string());
    let Some(question) = question_event(tool_use_id.clone(), &input) else {
        return Ok(Some(deny_tool_response(
            request_id,
            "question input could not be read",
        )));
    };

    let reply_rx = record.slot.questions.open(&tool_use_id).await;
    if !emitter.emit(question).await {
        record.slot.questions.cancel().await;
        return Err(BackendError::Cancelled);
    }

    let reply = tokio::select! {
        _ = cancel.cancelled() => QuestionReply::Cancelled,
        reply = reply_rx => reply.unwrap_or(QuestionReply::Cancelled),
    };
    match reply {
        QuestionReply::Answered(answers) => {
            debug!("question {} answered", tool_use_id);
            Ok(Some(allow_tool_response(request_id, with_answers(input, answers))))
        }
        QuestionReply::Cancelled => Err(BackendError::Cancelled),
    }
}

/// The ask-user input with the user's answers attached.
fn with_answers(mut input: Value, answers: Answers) -> Value {
    let answers = Value::Object(
        answers
            .into_iter()
            .map(|(k, v)| (k, Value::String(v)))
            .collect(),
    );
    match input.as_object_mut() {
        Some(obj) => {
            obj.insert("answers".to_string(), answers);
            input
        }
        None => serde_json::json!({ "answers": answers }),
    }
}

#[async_trait]
impl AgentBackend for InProcessBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::InProcess
    }

    async fn start_session(&self, request: StartSessionRequest) -> EventStream {
        let session_id = request.session_id.clone().unwrap_or_else(new_session_id);
        if self.registry.get(&session_id).is_some() {
            return error_stream(
                &session_id,
                &BackendError::Protocol(format!("session {} already exists", session_id)),
            );
        }

        let model = request.model.clone().or_else(|| self.config.default_model.clone());
        let options = AgentOptions {
            working_directory: request.working_directory.clone(),
            allowed_tools: request.mode.allowed_tools(),
            permission_mode: request.mode.permission_mode().map(str::to_string),
            model: model.clone(),
            system_prompt: request.system_prompt.clone(),
        };
        let client = match self.runtime.connect(options).await {
            Ok(client) => client,
            Err(e) => {
                return error_stream(&session_id, &BackendError::Startup(format!("{:#}", e)));
            }
        };

        let slot = InProcessSlot {
            client: Arc::clone(&client),
            questions: Arc::new(QuestionSlot::default()),
        };
        let inserted = self.registry.try_insert(
            SessionRecord::new(
                &session_id,
                request.working_directory.clone(),
                request.mode,
                slot,
            )
            .with_model(model)
            .with_system_prompt(request.system_prompt)
            .with_task_id(request.task_id.clone())
            .with_conversation_id(request.resume_id),
        );
        let Some(record) = inserted else {
            // Another start claimed the id while the client connected.
            client.close().await;
            return error_stream(
                &session_id,
                &BackendError::Protocol(format!("session {} already exists", session_id)),
            );
        };

        if let Err(e) = self
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
        info!("started in-process session {}", session_id);

        self.spawn_turn(&session_id, record, request.prompt, None, true)
    }

    async fn send_message(
        &self,
        session_id: &str,
        message: &str,
        model: Option<String>,
    ) -> EventStream {
        let Some(record) = self.registry.get(session_id) else {
            return error_stream(session_id, &BackendError::NotFound(session_id.to_string()));
        };
        if let Some(ref model) = model {
            self.registry
                .update(session_id, |r| r.clone().with_model(Some(model.clone())));
        }
        self.spawn_turn(session_id, record, message.to_string(), model, false)
    }

    async fn answer_question(
        &self,
        session_id: &str,
        tool_use_id: &str,
        answers: Answers,
    ) -> BackendResult<Option<EventStream>> {
        let record = self
            .registry
            .get(session_id)
            .ok_or_else(|| BackendError::NotFound(session_id.to_string()))?;
        record.slot.questions.answer(tool_use_id, answers).await?;
        Ok(None)
    }

    async fn interrupt_session(&self, session_id: &str) -> BackendResult<()> {
        let previous = self
            .registry
            .get(session_id)
            .ok_or_else(|| BackendError::NotFound(session_id.to_string()))?;
        self.registry.update(session_id, |r| r.with_fresh_scope());
        previous.cancel.cancel();
        previous.slot.questions.cancel().await;
        info!("interrupted session {}", session_id);
        Ok(())
    }

    async fn stop_session(&self, session_id: &str) -> BackendResult<()> {
        let record = self
            .registry
            .remove(session_id)
            .ok_or_else(|| BackendError::NotFound(session_id.to_string()))?;
        record.cancel.cancel();
        record.gate.close();
        record.slot.questions.cancel().await;
        record.slot.client.close().await;
        info!("stopped session {}", session_id);
        Ok(())
    }

    async fn session_status(&self, session_id: &str) -> Option<SessionStatus> {
        self.registry
            .get(session_id)
            .map(|r| r.status(BackendKind::InProcess))
    }

    async fn list_sessions(&self) -> Vec<SessionStatus> {
        self.registry
            .list()
            .iter()
            .map(|r| r.status(BackendKind::InProcess))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::runtime::QueryHandle;
    use conductor_protocol::{ErrorKind, Event, Role};
    use futures::StreamExt;
    use serde_json::json;
    use std::collections::HashMap;
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scripted agent: each query replays the next script. A `"wait"` entry
    /// blocks for a control response; `"hang"` blocks until cancelled.
    #[derive(Default)]
    struct FakeRuntime {
        scripts: StdMutex<Vec<Vec<Value>>>,
        queries: Arc<StdMutex<Vec<(String, Option<String>)>>>,
        control: Arc<StdMutex<Vec<Value>>>,
        options: StdMutex<Option<AgentOptions>>,
        closed: AtomicUsize,
    }

    impl FakeRuntime {
        fn with_scripts(scripts: Vec<Vec<Value>>) -> Arc<Self> {
            Arc::new(Self {
                scripts: StdMutex::new(scripts),
                ..Default::default()
            })
        }
    }

    struct FakeClient {
        runtime: Arc<FakeRuntime>,
    }

    #[async_trait]
    impl AgentRuntime for Arc<FakeRuntime> {
        async fn connect(&self, options: AgentOptions) -> anyhow::Result<Arc<dyn AgentClient>> {
            if options.working_directory == PathBuf::from("/missing") {
                anyhow::bail!("working directory missing");
            }
            *self.options.lock().unwrap() = Some(options);
            Ok(Arc::new(FakeClient {
                runtime: Arc::clone(self),
            }))
        }
    }

    #[async_trait]
    impl AgentClient for FakeClient {
        async fn query(&self, request: QueryRequest) -> anyhow::Result<QueryHandle> {
            if request.prompt == "unspawnable" {
                anyhow::bail!("agent executable not found");
            }
            self.runtime
                .queries
                .lock()
                .unwrap()
                .push((request.prompt.clone(), request.resume_id.clone()));
            let script = {
                let mut scripts = self.runtime.scripts.lock().unwrap();
                if scripts.is_empty() {
                    Vec::new()
                } else {
                    scripts.remove(0)
                }
            };

            let (msg_tx, msg_rx) = mpsc::channel(64);
            let (ctl_tx, mut ctl_rx) = mpsc::channel::<Value>(8);
            let control = Arc::clone(&self.runtime.control);
            tokio::spawn(async move {
                for line in script {
                    match line.as_str() {
                        Some("wait") => match ctl_rx.recv().await {
                            Some(v) => control.lock().unwrap().push(v),
                            None => return,
                        },
                        Some("hang") => {
                            request.cancel.cancelled().await;
                            return;
                        }
                        _ => {
                            let msg: AgentMessage = serde_json::from_value(line).unwrap();
                            if msg_tx.send(msg).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
            Ok(QueryHandle {
                messages: msg_rx,
                control: ctl_tx,
            })
        }

        async fn close(&self) {
            self.runtime.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn text_turn(text: &str, conversation: &str) -> Vec<Value> {
        vec![
            json!({"type":"system","subtype":"init","session_id":conversation}),
            json!({"type":"stream_event","event":{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}}),
            json!({"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":text}}}),
            json!({"type":"stream_event","event":{"type":"content_block_stop","index":0}}),
            json!({"type":"assistant","message":{"content":[{"type":"text","text":text}]}}),
            json!({"type":"result","subtype":"success","session_id":conversation,"is_error":false}),
        ]
    }

    fn backend(runtime: &Arc<FakeRuntime>) -> InProcessBackend {
        InProcessBackend::new(Arc::new(Arc::clone(runtime)), InProcessConfig::default())
    }

    async fn collect(stream: EventStream) -> Vec<Event> {
        tokio::time::timeout(Duration::from_secs(5), stream.collect())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_start_session_streams_turn() {
        let runtime = FakeRuntime::with_scripts(vec![text_turn("hello", "conv-1")]);
        let backend = backend(&runtime);

        let events = collect(
            backend
                .start_session(StartSessionRequest::new("hi", "/tmp").session_id("ses_a"))
                .await,
        )
        .await;

        let names: Vec<_> = events
            .iter()
            .map(|e| serde_json::to_value(e).unwrap()["event"].clone())
            .collect();
        assert_eq!(
            names,
            vec![
                json!("session.started"),
                json!("content.block"),
                json!("message"),
                json!("result")
            ]
        );
        assert!(events.iter().all(|e| e.session_id == "ses_a"));

        let status = backend.session_status("ses_a").await.unwrap();
        assert_eq!(status.conversation_id.as_deref(), Some("conv-1"));
        assert!(!status.busy);
    }

    #[tokio::test]
    async fn test_send_message_resumes_conversation() {
        let runtime = FakeRuntime::with_scripts(vec![
            text_turn("one", "conv-1"),
            text_turn("two", "conv-1"),
        ]);
        let backend = backend(&runtime);
        collect(
            backend
                .start_session(StartSessionRequest::new("first", "/tmp").session_id("s"))
                .await,
        )
        .await;

        let events = collect(backend.send_message("s", "second", None).await).await;
        assert!(matches!(
            events.last().map(|e| &e.payload),
            Some(EventPayload::Result(_))
        ));
        let queries = runtime.queries.lock().unwrap().clone();
        assert_eq!(queries[1], ("second".to_string(), Some("conv-1".to_string())));
    }

    #[tokio::test]
    async fn test_plan_mode_options() {
        let runtime = FakeRuntime::with_scripts(vec![text_turn("x", "c")]);
        let backend = backend(&runtime);
        collect(
            backend
                .start_session(StartSessionRequest::new("p", "/tmp").mode(AgentMode::Plan))
                .await,
        )
        .await;
        let options = runtime.options.lock().unwrap().clone().unwrap();
        assert_eq!(options.permission_mode.as_deref(), Some("plan"));
        assert!(options.allowed_tools.unwrap().contains(&"Grep".to_string()));
    }

    #[tokio::test]
    async fn test_startup_failure_is_error_event() {
        let runtime = FakeRuntime::with_scripts(vec![]);
        let backend = backend(&runtime);
        let events = collect(
            backend
                .start_session(StartSessionRequest::new("p", "/missing"))
                .await,
        )
        .await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0].payload,
            EventPayload::Error {
                kind: ErrorKind::Startup,
                ..
            }
        ));
        assert!(backend.list_sessions().await.is_empty());

        // The client connects but the agent process cannot be spawned.
        let events = collect(
            backend
                .start_session(StartSessionRequest::new("unspawnable", "/tmp").session_id("s1"))
                .await,
        )
        .await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0].payload,
            EventPayload::Error {
                kind: ErrorKind::Startup,
                ..
            }
        ));
        assert!(backend.session_status("s1").await.is_none());
        assert_eq!(runtime.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_session_id_is_rejected() {
        let runtime = FakeRuntime::with_scripts(vec![
            text_turn("one", "conv-1"),
            text_turn("two", "conv-2"),
        ]);
        let backend = backend(&runtime);

        let (a, b) = tokio::join!(
            backend.start_session(StartSessionRequest::new("a", "/tmp").session_id("dup")),
            backend.start_session(StartSessionRequest::new("b", "/tmp").session_id("dup")),
        );
        let (a, b) = tokio::join!(collect(a), collect(b));

        assert_eq!([&a, &b].iter().filter(|e| started_first(e)).count(), 1);
        let rejected = if started_first(&a) { &b } else { &a };
        assert!(matches!(
            rejected[0].payload,
            EventPayload::Error {
                kind: ErrorKind::Protocol,
                ..
            }
        ));
        assert_eq!(backend.list_sessions().await.len(), 1);
        assert_eq!(runtime.queries.lock().unwrap().len(), 1);
    }

    fn started_first(events: &[Event]) -> bool {
        matches!(
            events.first().map(|e| &e.payload),
            Some(EventPayload::SessionStarted { .. })
        )
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let runtime = FakeRuntime::with_scripts(vec![]);
        let backend = backend(&runtime);

        let events = collect(backend.send_message("nope", "x", None).await).await;
        assert!(matches!(
            events[0].payload,
            EventPayload::Error {
                kind: ErrorKind::NotFound,
                ..
            }
        ));
        assert!(matches!(
            backend.interrupt_session("nope").await,
            Err(BackendError::NotFound(_))
        ));
        assert!(matches!(
            backend.stop_session("nope").await,
            Err(BackendError::NotFound(_))
        ));
        assert!(
            backend
                .answer_question("nope", "t", HashMap::new())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_ask_user_round_trip() {
        let ask = json!({
            "type": "control_request",
            "request_id": "req-1",
            "request": {
                "subtype": "can_use_tool",
                "tool_name": "AskUserQuestion",
                "tool_use_id": "toolu_q",
                "input": {"questions": [{
                    "question": "Which database?",
                    "header": "DB",
                    "options": [{"label": "Postgres"}, {"label": "SQLite"}, {"label": "Other"}],
                    "multiSelect": false
                }]}
            }
        });
        let mut script = vec![ask, json!("wait")];
        script.extend(text_turn("done", "conv-q"));
        let runtime = FakeRuntime::with_scripts(vec![script]);
        let backend = Arc::new(backend(&runtime));

        let mut stream = backend
            .start_session(StartSessionRequest::new("p", "/tmp").session_id("q"))
            .await;

        let mut question = None;
        while let Some(event) = stream.next().await {
            if let EventPayload::Question {
                tool_use_id,
                questions,
            } = event.payload
            {
                assert_eq!(questions.len(), 1);
                assert_eq!(questions[0].options.len(), 3);
                question = Some(tool_use_id);
                break;
            }
        }
        let tool_use_id = question.unwrap();
        assert!(backend.session_status("q").await.unwrap().busy);

        // Wrong id leaves the question pending.
        assert!(
            backend
                .answer_question("q", "other", HashMap::new())
                .await
                .is_err()
        );
        let answers = HashMap::from([("Which database?".to_string(), "SQLite".to_string())]);
        assert!(
            backend
                .answer_question("q", &tool_use_id, answers)
                .await
                .unwrap()
                .is_none()
        );

        let rest = collect(stream).await;
        assert!(matches!(
            rest.last().map(|e| &e.payload),
            Some(EventPayload::Result(_))
        ));
        let control = runtime.control.lock().unwrap().clone();
        assert_eq!(control.len(), 1);
        let response = &control[0]["response"]["response"];
        assert_eq!(response["behavior"], "allow");
        assert_eq!(response["updatedInput"]["answers"]["Which database?"], "SQLite");
    }

    #[tokio::test]
    async fn test_plan_mode_denies_write_tools() {
        let request = json!({
            "type": "control_request",
            "request_id": "req-7",
            "request": {"subtype": "can_use_tool", "tool_name": "Bash", "input": {"command": "ls"}}
        });
        let mut script = vec![request, json!("wait")];
        script.extend(text_turn("ok", "c"));
        let runtime = FakeRuntime::with_scripts(vec![script]);
        let backend = backend(&runtime);
        collect(
            backend
                .start_session(StartSessionRequest::new("p", "/tmp").mode(AgentMode::Plan))
                .await,
        )
        .await;
        let control = runtime.control.lock().unwrap().clone();
        assert_eq!(control[0]["response"]["response"]["behavior"], "deny");
    }

    #[tokio::test]
    async fn test_interrupt_keeps_session_usable() {
        let runtime = FakeRuntime::with_scripts(vec![
            vec![json!("hang")],
            text_turn("after", "conv-2"),
        ]);
        let backend = Arc::new(backend(&runtime));
        let stream = backend
            .start_session(
                StartSessionRequest::new("p", "/tmp")
                    .session_id("i")
                    .resume("conv-1"),
            )
            .await;
        let consumer = tokio::spawn(collect(stream));

        tokio::time::sleep(Duration::from_millis(50)).await;
        backend.interrupt_session("i").await.unwrap();
        let first = consumer.await.unwrap();
        // Cancellation ends the stream without an error event.
        assert!(
            first
                .iter()
                .all(|e| !matches!(e.payload, EventPayload::Error { .. }))
        );

        let events = collect(backend.send_message("i", "again", None).await).await;
        assert!(matches!(
            events.last().map(|e| &e.payload),
            Some(EventPayload::Result(_))
        ));
        let queries = runtime.queries.lock().unwrap().clone();
        assert_eq!(queries[1].1.as_deref(), Some("conv-1"));
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_question() {
        let ask = json!({
            "type": "control_request",
            "request_id": "req-1",
            "request": {"subtype": "can_use_tool", "tool_name": "AskUserQuestion",
                        "input": {"questions": [{"question": "Go?", "options": []}]}}
        });
        let runtime = FakeRuntime::with_scripts(vec![vec![ask, json!("wait")]]);
        let backend = Arc::new(backend(&runtime));
        let mut stream = backend
            .start_session(StartSessionRequest::new("p", "/tmp").session_id("s"))
            .await;
        while let Some(event) = stream.next().await {
            if matches!(event.payload, EventPayload::Question { .. }) {
                break;
            }
        }

        backend.stop_session("s").await.unwrap();
        let rest = collect(stream).await;
        assert!(rest.is_empty());
        assert!(backend.session_status("s").await.is_none());
        assert!(matches!(
            backend.stop_session("s").await,
            Err(BackendError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sends_are_serialized() {
        let runtime = FakeRuntime::with_scripts(vec![
            text_turn("a", "c"),
            text_turn("b", "c"),
            text_turn("c", "c"),
        ]);
        let backend = Arc::new(backend(&runtime));
        collect(
            backend
                .start_session(StartSessionRequest::new("p", "/tmp").session_id("s"))
                .await,
        )
        .await;

        let one = backend.send_message("s", "one", None).await;
        let two = backend.send_message("s", "two", None).await;
        let (a, b) = tokio::join!(collect(one), collect(two));
        for events in [a, b] {
            let messages = events
                .iter()
                .filter(|e| {
                    matches!(
                        e.payload,
                        EventPayload::Message {
                            role: Role::Assistant,
                            ..
                        }
                    )
                })
                .count();
            assert_eq!(messages, 1);
        }
        assert_eq!(runtime.queries.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_with_answers() {
        let input = with_answers(
            json!({"questions": []}),
            HashMap::from([("q".to_string(), "a".to_string())]),
        );
        assert_eq!(input["answers"]["q"], "a");
        assert!(input.get("questions").is_some());
        assert_eq!(with_answers(Value::Null, HashMap::new())["answers"], json!({}));
    }
}
