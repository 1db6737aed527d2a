//! Agent runtime client used by the in-process backend.
//!
//! The [`AgentRuntime`] trait binds a client to a working directory and mode;
//! each [`AgentClient::query`] runs one turn and hands back channels for the
//! native message stream and for control responses. [`CliAgentRuntime`]
//! implements it by spawning the agent CLI in `stream-json` mode, one process
//! per turn, continuing the conversation with `--resume`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use conductor_protocol::AgentMessage;
use conductor_protocol::messages::user_message_line;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What a client is bound to for its lifetime.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentOptions {
    pub working_directory: PathBuf,
    /// Restrict the agent to these tools (plan mode).
    pub allowed_tools: Option<Vec<String>>,
    pub permission_mode: Option<String>,
    pub model: Option<String>,
    pub system_prompt: Option<String>,
}

/// One turn.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub prompt: String,
    /// Conversation to continue.
    pub resume_id: Option<String>,
    /// Per-turn model override.
    pub model: Option<String>,
    /// Cancelling this kills the turn.
    pub cancel: CancellationToken,
}

/// Channels of a running turn. Dropping the handle ends the turn's input.
#[derive(Debug)]
pub struct QueryHandle {
    /// Native messages in arrival order; closes when the agent exits.
    pub messages: mpsc::Receiver<AgentMessage>,
    /// Raw control lines written to the agent (`control_response`, ...).
    pub control: mpsc::Sender<Value>,
}

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    /// Create a client bound to `options`.
    async fn connect(&self, options: AgentOptions) -> Result<Arc<dyn AgentClient>>;
}

#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn query(&self, request: QueryRequest) -> Result<QueryHandle>;

    /// Release client resources.
    async fn close(&self) {}
}

/// How to invoke the agent CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliAgentConfig {
    pub executable: String,
    /// Appended after the generated arguments.
    pub extra_args: Vec<String>,
    pub env: HashMap<String, String>,
    /// Buffered messages between the stdout reader and the backend.
    pub message_buffer: usize,
}

impl Default for CliAgentConfig {
    fn default() -> Self {
        Self {
            executable: "claude".to_string(),
            extra_args: Vec::new(),
            env: HashMap::new(),
            message_buffer: 256,
        }
    }
}

/// Spawns the agent CLI as a local subprocess.
#[derive(Debug, Clone, Default)]
pub struct CliAgentRuntime {
    config: CliAgentConfig,
}

impl CliAgentRuntime {
    pub fn new(config: CliAgentConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AgentRuntime for CliAgentRuntime {
    async fn connect(&self, options: AgentOptions) -> Result<Arc<dyn AgentClient>> {
        let metadata = tokio::fs::metadata(&options.working_directory)
            .await
            .with_context(|| {
                format!(
                    "working directory {:?} is not accessible",
                    options.working_directory
                )
            })?;
        if !metadata.is_dir() {
            anyhow::bail!(
                "working directory {:?} is not a directory",
                options.working_directory
            );
        }

        Ok(Arc::new(CliAgentClient {
            config: self.config.clone(),
            options,
        }))
    }
}

struct CliAgentClient {
    config: CliAgentConfig,
    options: AgentOptions,
}

#[async_trait]
impl AgentClient for CliAgentClient {
    async fn query(&self, request: QueryRequest) -> Result<QueryHandle> {
        let args = command_args(&self.options, &request, &self.config.extra_args);
        info!(
            "spawning agent in {:?}, resume={:?}",
            self.options.working_directory, request.resume_id
        );

        let mut cmd = Command::new(&self.config.executable);
        cmd.args(&args)
            .current_dir(&self.options.working_directory)
            .envs(&self.config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().with_context(|| {
            format!(
                "failed to spawn agent. Executable: {}, Working dir: {:?}",
                self.config.executable, self.options.working_directory
            )
        })?;

        let stdin = child.stdin.take().context("agent process has no stdin")?;
        let stdout = child.stdout.take().context("agent process has no stdout")?;

        let (message_tx, message_rx) = mpsc::channel(self.config.message_buffer.max(1));
        let (control_tx, control_rx) = mpsc::channel::<Value>(16);

        control_tx
            .send(user_message_line(&request.prompt))
            .await
            .context("agent input channel closed")?;

        tokio::spawn(stdin_writer_task(stdin, control_rx));
        tokio::spawn(stdout_reader_task(stdout, message_tx));
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(stderr_reader_task(stderr));
        }
        tokio::spawn(supervise(child, request.cancel));

        Ok(QueryHandle {
            messages: message_rx,
            control: control_tx,
        })
    }
}

/// CLI arguments for one turn.
fn command_args(options: &AgentOptions, request: &QueryRequest, extra: &[String]) -> Vec<String> {
    let mut args: Vec<String> = [
        "--print",
        "--output-format",
        "stream-json",
        "--input-format",
        "stream-json",
        "--verbose",
        "--include-partial-messages",
        "--permission-prompt-tool",
        "stdio",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    if let Some(ref id) = request.resume_id {
        args.push("--resume".to_string());
        args.push(id.clone());
    }
    if let Some(model) = request.model.as_ref().or(options.model.as_ref()) {
        args.push("--model".to_string());
        args.push(model.clone());
    }
    if let Some(ref tools) = options.allowed_tools {
        args.push("--allowedTools".to_string());
        args.push(tools.join(","));
    }
    if let Some(ref mode) = options.permission_mode {
        args.push("--permission-mode".to_string());
        args.push(mode.clone());
    }
    if let Some(ref prompt) = options.system_prompt {
        args.push("--append-system-prompt".to_string());
        args.push(prompt.clone());
    }
    args.extend(extra.iter().cloned());
    args
}

async fn stdin_writer_task(mut stdin: ChildStdin, mut control_rx: mpsc::Receiver<Value>) {
    while let Some(value) = control_rx.recv().await {
        let line = format!("{}\n", value);
        let display: String = line.trim_end().chars().take(200).collect();
        debug!("sending to agent: {}", display);
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            error!("failed to write to agent stdin: {:?}", e);
            break;
        }
        if let Err(e) = stdin.flush().await {
            error!("failed to flush agent stdin: {:?}", e);
            break;
        }
    }
    // Dropping stdin signals end of input; the agent exits after the turn.
    debug!("agent stdin writer task ended");
}

async fn stdout_reader_task(stdout: ChildStdout, message_tx: mpsc::Sender<AgentMessage>) {
    let mut lines = BufReader::new(stdout).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        let display: String = line.chars().take(200).collect();
        match AgentMessage::parse(&line) {
            Ok(AgentMessage::Unknown) => debug!("ignoring agent line: {}", display),
            Ok(message) => {
                if message_tx.send(message).await.is_err() {
                    debug!("agent message receiver dropped");
                    break;
                }
            }
            Err(e) => warn!("failed to parse agent line: {:?}, line: {}", e, display),
        }
    }
    debug!("agent stdout reader task ended");
}

async fn stderr_reader_task(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if !line.trim().is_empty() {
            warn!("agent stderr: {}", line);
        }
    }
}

/// Wait for the agent to exit, killing it if the turn is cancelled.
async fn supervise(mut child: Child, cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {
            info!("killing agent process {:?}", child.id());
            if let Err(e) = child.kill().await {
                warn!("failed to kill agent process: {}", e);
            }
        }
        status = child.wait() => match status {
            Ok(status) if status.success() => debug!("agent exited"),
            Ok(status) => warn!("agent exited with {}", status),
            Err(e) => warn!("failed to wait for agent: {}", e),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_protocol::AgentMode;

    fn request(resume: Option<&str>, model: Option<&str>) -> QueryRequest {
        QueryRequest {
            prompt: "hi".to_string(),
            resume_id: resume.map(str::to_string),
            model: model.map(str::to_string),
            cancel: CancellationToken::new(),
        }
    }

    #[test]
    fn test_build_mode_args() {
        let options = AgentOptions {
            working_directory: PathBuf::from("/tmp"),
            model: Some("default-model".to_string()),
            ..Default::default()
        };
        let args = command_args(&options, &request(Some("conv-1"), None), &[]);

        assert!(args.contains(&"stream-json".to_string()));
        let resume = args.iter().position(|a| a == "--resume").unwrap();
        assert_eq!(args[resume + 1], "conv-1");
        let model = args.iter().position(|a| a == "--model").unwrap();
        assert_eq!(args[model + 1], "default-model");
        assert!(!args.contains(&"--allowedTools".to_string()));
    }

    #[test]
    fn test_plan_mode_args() {
        let mode = AgentMode::Plan;
        let options = AgentOptions {
            working_directory: PathBuf::from("/tmp"),
            allowed_tools: mode.allowed_tools(),
            permission_mode: mode.permission_mode().map(str::to_string),
            system_prompt: Some("be brief".to_string()),
            ..Default::default()
        };
        let args = command_args(
            &options,
            &request(None, Some("override")),
            &["--debug".to_string()],
        );

        let tools = args.iter().position(|a| a == "--allowedTools").unwrap();
        assert!(args[tools + 1].contains("Read"));
        assert!(args[tools + 1].contains("AskUserQuestion"));
        assert!(!args[tools + 1].contains("Bash"));
        let pm = args.iter().position(|a| a == "--permission-mode").unwrap();
        assert_eq!(args[pm + 1], "plan");
        let model = args.iter().position(|a| a == "--model").unwrap();
        assert_eq!(args[model + 1], "override");
        assert_eq!(args.last().map(String::as_str), Some("--debug"));
        assert!(!args.contains(&"--resume".to_string()));
    }

    #[tokio::test]
    async fn test_connect_rejects_missing_directory() {
        let runtime = CliAgentRuntime::default();
        let options = AgentOptions {
            working_directory: PathBuf::from("/definitely/not/here"),
            ..Default::default()
        };
        assert!(runtime.connect(options).await.is_err());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let runtime = CliAgentRuntime::new(CliAgentConfig {
            executable: "conductor-no-such-agent-binary".to_string(),
            ..Default::default()
        });
        let client = runtime
            .connect(AgentOptions {
                working_directory: dir.path().to_path_buf(),
                ..Default::default()
            })
            .await
            .unwrap();
        let err = client.query(request(None, None)).await.unwrap_err();
        assert!(err.to_string().contains("failed to spawn agent"));
    }
}
