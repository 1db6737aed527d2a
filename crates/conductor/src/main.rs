use std::env;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use conductor::backend::{
    AgentBackend, BackendKind, Collaborators, EventStream, StartSessionRequest, new_session_id,
};
use conductor::settings::{self, APP_NAME, AppConfig, AppPaths};
use conductor_protocol::{AgentMode, Answers, BlockKind, Event, EventPayload, QuestionItem};
use futures::StreamExt;
use futures::stream::SelectAll;
use log::{LevelFilter, debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader, Lines, Stdin};

type StdinLines = Lines<BufReader<Stdin>>;

fn main() {
    if let Err(err) = try_main() {
        eprintln!("conductor: {err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let Cli { global, command } = Cli::parse();
    let ctx = RuntimeContext::new(global)?;
    ctx.install_logging();
    debug!("resolved paths: {}", ctx.paths);

    match command {
        Command::Run(cmd) => run_async(handle_run(&ctx, cmd)),
        Command::Cleanup(cmd) => run_async(handle_cleanup(&ctx, cmd)),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config { action } => handle_config(&ctx, action),
        Command::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), APP_NAME, &mut io::stdout());
            Ok(())
        }
    }
}

/// Only the commands that talk to a backend need a runtime.
fn run_async<F: Future<Output = Result<()>>>(fut: F) -> Result<()> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?
        .block_on(fut)
}

#[derive(Debug, Parser)]
#[command(
    name = APP_NAME,
    version,
    about = "Run coding-agent sessions in-process, in worker containers or on a cloud pool",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    global: GlobalOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct GlobalOpts {
    /// Config file or directory (default: $XDG_CONFIG_HOME/conductor)
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,
    /// More log output; -vv for trace
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Shorthand for -v
    #[arg(long, global = true)]
    debug: bool,
    /// Shorthand for -vv
    #[arg(long, global = true)]
    trace: bool,
    /// Print events and reports as JSON lines; JSON logs on stderr
    #[arg(long, global = true, conflicts_with = "yaml")]
    json: bool,
    /// Print `config show` as YAML
    #[arg(long, global = true)]
    yaml: bool,
    /// When to colour log output
    #[arg(long, value_enum, default_value_t = ColorChoice::Auto, global = true)]
    color: ColorChoice,
    /// Report what would change without touching disk or containers
    #[arg(long, global = true)]
    dry_run: bool,
    /// Overwrite without asking
    #[arg(short = 'y', long = "yes", global = true)]
    assume_yes: bool,
    /// Include targets and source locations in log lines
    #[arg(long, global = true)]
    diagnostics: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ColorChoice {
    Auto,
    Always,
    Never,
}

impl ColorChoice {
    fn enabled(self) -> bool {
        match self {
            ColorChoice::Always => true,
            ColorChoice::Never => false,
            ColorChoice::Auto => {
                env::var_os("NO_COLOR").is_none()
                    && (env::var_os("FORCE_COLOR").is_some() || io::stderr().is_terminal())
            }
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a session and stream its events
    Run(RunCommand),
    /// Remove worker containers no session tracks
    Cleanup(CleanupCommand),
    /// Write the default config file
    Init(InitCommand),
    /// Show or reset configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Print a completion script
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Debug, Clone, Args)]
struct RunCommand {
    /// First message of the session
    #[arg(value_name = "PROMPT")]
    prompt: String,
    /// Working directory of the agent
    #[arg(short = 'C', long = "dir", default_value = ".", value_name = "PATH")]
    working_directory: PathBuf,
    /// Backend to run on (in_process, container, cloud); defaults to config
    #[arg(long)]
    backend: Option<BackendKind>,
    /// Task the session belongs to (shares the task's container)
    #[arg(long, value_name = "ID")]
    task: Option<String>,
    /// Agent mode (plan, build)
    #[arg(long, default_value = "build")]
    mode: AgentMode,
    /// Model override
    #[arg(long)]
    model: Option<String>,
    /// Extra system prompt
    #[arg(long, value_name = "TEXT")]
    system_prompt: Option<String>,
    /// Conversation id to resume
    #[arg(long, value_name = "ID")]
    resume: Option<String>,
    /// Orchestrator session id (generated when omitted)
    #[arg(long, value_name = "ID")]
    session_id: Option<String>,
    /// Keep reading follow-up messages from stdin after each turn
    #[arg(short, long)]
    interactive: bool,
}

#[derive(Debug, Clone, Args)]
struct CleanupCommand {
    /// Backend to sweep
    #[arg(long, default_value = "container")]
    backend: BackendKind,
}

#[derive(Debug, Clone, Args)]
struct InitCommand {
    /// Replace an existing config file
    #[arg(long)]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Print the config file location
    Path,
    /// Overwrite the config file with defaults
    Reset,
}

#[derive(Debug, Clone)]
struct RuntimeContext {
    global: GlobalOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(global: GlobalOpts) -> Result<Self> {
        let paths = AppPaths::discover(global.config.clone())?;
        let config = load_or_init_config(&paths, global.dry_run)?;
        Ok(Self {
            global,
            paths,
            config,
        })
    }

    /// Flags win over `logging.level`; `RUST_LOG` wins over both.
    fn log_level(&self) -> LevelFilter {
        let g = &self.global;
        if g.quiet {
            return LevelFilter::Error;
        }
        let bump = g.verbose.max(u8::from(g.debug)).max(if g.trace { 2 } else { 0 });
        match bump {
            0 => self.config.logging.level.parse().unwrap_or(LevelFilter::Info),
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    /// `tracing` subscriber for spans and structured events, `env_logger`
    /// for the `log` records the library emits.
    fn install_logging(&self) {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        let level = self.log_level();
        let directive = format!("{APP_NAME}={}", level.as_str().to_ascii_lowercase());
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
        let detailed = self.global.diagnostics;

        let fmt = tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_target(detailed)
            .with_file(detailed)
            .with_line_number(detailed);
        let installed = if self.global.json {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt.json())
                .try_init()
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt.with_ansi(self.global.color.enabled()))
                .try_init()
        };
        if let Err(e) = installed {
            eprintln!("tracing subscriber already installed: {e}");
        }

        env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(level.as_str().to_ascii_lowercase()),
        )
        .filter_level(level)
        .try_init()
        .ok();
    }
}

/// How the event sequence of one operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnEnd {
    Completed,
    Failed,
    /// The session is gone (duration ceiling).
    Ended,
}

async fn handle_run(ctx: &RuntimeContext, cmd: RunCommand) -> Result<()> {
    let kind = cmd.backend.unwrap_or(ctx.config.backend);
    let backend = ctx.config.build_backend_of(kind, Collaborators::default())?;

    let working_directory = settings::expand_path(cmd.working_directory)?;
    let working_directory = std::fs::canonicalize(&working_directory).with_context(|| {
        format!("resolving working directory {}", working_directory.display())
    })?;

    let session_id = cmd.session_id.unwrap_or_else(new_session_id);
    let mut request = StartSessionRequest::new(cmd.prompt, working_directory)
        .session_id(&session_id)
        .mode(cmd.mode);
    if let Some(model) = cmd.model {
        request = request.model(model);
    }
    if let Some(prompt) = cmd.system_prompt {
        request = request.system_prompt(prompt);
    }
    if let Some(resume) = cmd.resume {
        request = request.resume(resume);
    }
    if let Some(task) = cmd.task {
        request = request.task(task);
    }
    tracing::info!(session_id = %session_id, backend = %kind, "starting session");

    let mut input = BufReader::new(tokio::io::stdin()).lines();
    let mut stream = backend.start_session(request).await;
    let mut failed = false;

    loop {
        let end = tokio::select! {
            end = drive_turn(backend.as_ref(), &session_id, stream, &mut input, ctx.global.json) => {
                end?
            }
            _ = shutdown_signal() => {
                info!("shutdown signal received, stopping session {}", session_id);
                stop_and_shutdown(backend.as_ref(), &session_id).await;
                return Err(anyhow!("interrupted"));
            }
        };
        match end {
            TurnEnd::Ended => return Ok(()),
            TurnEnd::Failed => failed = true,
            TurnEnd::Completed => {}
        }
        if !cmd.interactive || backend.session_status(&session_id).await.is_none() {
            break;
        }

        let Some(message) = read_follow_up(&mut input).await? else {
            break;
        };
        stream = backend.send_message(&session_id, &message, None).await;
    }

    stop_and_shutdown(backend.as_ref(), &session_id).await;
    if failed {
        return Err(anyhow!("session {} reported an error", session_id));
    }
    Ok(())
}

async fn stop_and_shutdown(backend: &dyn AgentBackend, session_id: &str) {
    if backend.session_status(session_id).await.is_some()
        && let Err(e) = backend.stop_session(session_id).await
    {
        warn!("failed to stop session {}: {}", session_id, e);
    }
    backend.shutdown().await;
}

/// Print the events of one operation, answering questions from stdin.
async fn drive_turn(
    backend: &dyn AgentBackend,
    session_id: &str,
    stream: EventStream,
    input: &mut StdinLines,
    json: bool,
) -> Result<TurnEnd> {
    let mut streams: SelectAll<EventStream> = SelectAll::new();
    streams.push(stream);
    let mut end = TurnEnd::Completed;

    while let Some(event) = streams.next().await {
        print_event(&event, json)?;
        match event.payload {
            EventPayload::Question {
                tool_use_id,
                questions,
            } => {
                let answers = prompt_answers(&questions, input).await?;
                match backend
                    .answer_question(session_id, &tool_use_id, answers)
                    .await
                {
                    Ok(Some(continued)) => streams.push(continued),
                    Ok(None) => {}
                    Err(e) => error!("failed to deliver answers: {}", e),
                }
            }
            EventPayload::SessionEnded { .. } => end = TurnEnd::Ended,
            EventPayload::Error { .. } => end = TurnEnd::Failed,
            _ => {}
        }
    }
    Ok(end)
}

fn print_event(event: &Event, json: bool) -> Result<()> {
    if json {
        println!(
            "{}",
            serde_json::to_string(event).context("serializing event to JSON")?
        );
        return Ok(());
    }

    match &event.payload {
        EventPayload::SessionStarted { conversation_id } => match conversation_id {
            Some(id) => eprintln!("session {} started (conversation {})", event.session_id, id),
            None => eprintln!("session {} started", event.session_id),
        },
        EventPayload::ContentBlock { block } => match block.kind {
            BlockKind::Text => println!("{}", block.text),
            BlockKind::Thinking => debug!("thinking: {}", block.text),
            BlockKind::ToolUse => eprintln!(
                "[tool] {} {}",
                block.tool_name.as_deref().unwrap_or("?"),
                truncate(&block.text, 120)
            ),
            BlockKind::ToolResult => eprintln!(
                "[result{}] {}",
                if block.success == Some(false) { " failed" } else { "" },
                truncate(&block.text, 120)
            ),
        },
        EventPayload::Message { .. } => {}
        EventPayload::Result(result) => {
            let mut summary = String::from("turn complete");
            if let Some(cost) = result.cost_usd {
                summary.push_str(&format!(", ${cost:.4}"));
            }
            if let Some(ms) = result.duration_ms {
                summary.push_str(&format!(", {:.1}s", ms as f64 / 1000.0));
            }
            if let Some(ref id) = result.conversation_id {
                summary.push_str(&format!(", resume with --resume {id}"));
            }
            eprintln!("{summary}");
        }
        EventPayload::Question { questions, .. } => {
            for item in questions {
                if !item.header.is_empty() {
                    eprintln!("[{}]", item.header);
                }
                eprintln!("? {}", item.question);
                for (i, option) in item.options.iter().enumerate() {
                    if option.description.is_empty() {
                        eprintln!("  {}. {}", i + 1, option.label);
                    } else {
                        eprintln!("  {}. {} - {}", i + 1, option.label, option.description);
                    }
                }
            }
        }
        EventPayload::SessionEnded { reason } => eprintln!("session ended: {reason}"),
        EventPayload::Error { error, kind } => eprintln!("error ({kind}): {error}"),
    }
    Ok(())
}

/// Read one answer per question. A number picks the matching option.
async fn prompt_answers(questions: &[QuestionItem], input: &mut StdinLines) -> Result<Answers> {
    let mut answers = Answers::new();
    for item in questions {
        eprint!("{} > ", item.question);
        io::stderr().flush().ok();
        let line = input
            .next_line()
            .await
            .context("reading answer from stdin")?
            .ok_or_else(|| anyhow!("stdin closed while a question was pending"))?;
        answers.insert(item.question.clone(), resolve_answer(item, line.trim()));
    }
    Ok(answers)
}

fn resolve_answer(item: &QuestionItem, line: &str) -> String {
    line.parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| item.options.get(i))
        .map(|option| option.label.clone())
        .unwrap_or_else(|| line.to_string())
}

async fn read_follow_up(input: &mut StdinLines) -> Result<Option<String>> {
    eprint!("> ");
    io::stderr().flush().ok();
    let line = input
        .next_line()
        .await
        .context("reading message from stdin")?;
    Ok(line
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty()))
}

fn truncate(text: &str, max: usize) -> String {
    let flat = text.replace('\n', " ");
    if flat.chars().count() <= max {
        flat
    } else {
        let cut: String = flat.chars().take(max).collect();
        format!("{cut}...")
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn handle_cleanup(ctx: &RuntimeContext, cmd: CleanupCommand) -> Result<()> {
    if ctx.global.dry_run {
        info!("dry-run: would sweep orphaned {} workers", cmd.backend);
        return Ok(());
    }

    let backend: Arc<dyn AgentBackend> = ctx
        .config
        .build_backend_of(cmd.backend, Collaborators::default())?;
    let removed = backend
        .cleanup_orphaned_containers()
        .await
        .context("sweeping orphaned containers")?;

    if ctx.global.json {
        println!("{}", serde_json::json!({ "removed": removed }));
    } else {
        println!("Removed {removed} orphaned container(s)");
    }
    Ok(())
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    let path = &ctx.paths.config_file;
    if path.exists() && !cmd.force && !ctx.global.assume_yes {
        return Err(anyhow!(
            "{} already exists; pass --force to replace it",
            path.display()
        ));
    }
    write_config(ctx, "initialise")
}

fn handle_config(ctx: &RuntimeContext, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let rendered = if ctx.global.json {
                serde_json::to_string_pretty(&ctx.config).context("rendering config as JSON")?
            } else if ctx.global.yaml {
                serde_yaml::to_string(&ctx.config).context("rendering config as YAML")?
            } else {
                toml::to_string_pretty(&ctx.config).context("rendering config as TOML")?
            };
            println!("{}", rendered.trim_end());
        }
        ConfigAction::Path => println!("{}", ctx.paths.config_file.display()),
        ConfigAction::Reset => write_config(ctx, "reset")?,
    }
    Ok(())
}

fn write_config(ctx: &RuntimeContext, verb: &str) -> Result<()> {
    let path = &ctx.paths.config_file;
    if ctx.global.dry_run {
        info!("dry-run: would {} {}", verb, path.display());
        return Ok(());
    }
    settings::write_default_config(path)?;
    eprintln!("wrote {}", path.display());
    Ok(())
}

/// First run writes the defaults so there is a file to edit.
fn load_or_init_config(paths: &AppPaths, dry_run: bool) -> Result<AppConfig> {
    let path = &paths.config_file;
    if !path.exists() {
        if dry_run {
            info!("dry-run: would create {}", path.display());
        } else {
            settings::write_default_config(path)?;
        }
    }
    settings::load_config(path, &settings::env_prefix())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_protocol::QuestionOption;

    fn question() -> QuestionItem {
        QuestionItem {
            question: "Which database?".to_string(),
            header: "DB".to_string(),
            options: vec![
                QuestionOption {
                    label: "Postgres".to_string(),
                    description: String::new(),
                },
                QuestionOption {
                    label: "SQLite".to_string(),
                    description: "embedded".to_string(),
                },
            ],
            multi_select: false,
        }
    }

    #[test]
    fn test_resolve_answer() {
        let item = question();
        assert_eq!(resolve_answer(&item, "2"), "SQLite");
        assert_eq!(resolve_answer(&item, "3"), "3");
        assert_eq!(resolve_answer(&item, "0"), "0");
        assert_eq!(resolve_answer(&item, "MySQL"), "MySQL");
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("a\nb", 10), "a b");
        assert_eq!(truncate("abcdef", 3), "abc...");
    }

    #[test]
    fn test_cli_parses_run() {
        let cli = Cli::try_parse_from([
            "conductor",
            "run",
            "fix the bug",
            "--backend",
            "container",
            "--mode",
            "plan",
            "--task",
            "t-1",
            "-i",
        ])
        .unwrap();
        match cli.command {
            Command::Run(cmd) => {
                assert_eq!(cmd.backend, Some(BackendKind::Container));
                assert_eq!(cmd.mode, AgentMode::Plan);
                assert_eq!(cmd.task.as_deref(), Some("t-1"));
                assert!(cmd.interactive);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }
}
