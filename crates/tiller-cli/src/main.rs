use anyhow::{Result, anyhow};
use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tiller_agent::{Agent, ApprovalRequest};
use tiller_core::{AppConfig, EventEnvelope, EventKind, StreamChunk, is_abort_error};
use tiller_llm::HttpProvider;
use tiller_observe::Observer;
use tiller_tools::{LocalToolHost, tool_definitions};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "tiller")]
#[command(about = "A coding agent for your terminal", long_about = None)]
struct Cli {
    /// Non-interactive mode: run the prompt and print the final answer.
    #[arg(short = 'p', long = "print")]
    print_mode: bool,

    /// Override the configured model for this invocation.
    #[arg(long, global = true)]
    model: Option<String>,

    /// Approve every tool call without prompting.
    #[arg(long = "auto-approve", global = true)]
    auto_approve: bool,

    /// Never prompt: unapproved tool calls are denied, checkpoints continue.
    #[arg(long = "no-input", global = true)]
    no_input: bool,

    /// Mirror agent events to stderr.
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    /// Cap the number of loop iterations per turn.
    #[arg(long = "max-iterations", global = true)]
    max_iterations: Option<u64>,

    /// Skip the planning call at the start of each turn.
    #[arg(long = "no-plan", global = true)]
    no_plan: bool,

    /// Run against this directory instead of the current one.
    #[arg(long, global = true)]
    workspace: Option<PathBuf>,

    /// Prompt for print mode (positional, used when -p is set).
    #[arg(trailing_var_arg = true)]
    prompt_args: Vec<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Interactive chat (the default when no subcommand is given).
    Chat,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let workspace = match &cli.workspace {
        Some(dir) => dir
            .canonicalize()
            .map_err(|err| anyhow!("workspace {}: {err}", dir.display()))?,
        None => std::env::current_dir()?,
    };

    if cli.print_mode {
        return run_print_mode(&workspace, &cli);
    }

    match cli.command {
        Some(Commands::Chat) | None => run_chat(&workspace, &cli),
    }
}

fn run_print_mode(workspace: &Path, cli: &Cli) -> Result<()> {
    use std::io::{IsTerminal, Read, stdin};

    let prompt = if !cli.prompt_args.is_empty() {
        cli.prompt_args.join(" ")
    } else if !stdin().is_terminal() {
        let mut buf = String::new();
        stdin().read_to_string(&mut buf)?;
        buf.trim().to_string()
    } else {
        return Err(anyhow!(
            "-p/--print requires a prompt argument or stdin input"
        ));
    };
    if prompt.is_empty() {
        return Err(anyhow!("empty prompt"));
    }

    let (mut agent, _host, _observer) = build_agent(workspace, cli)?;
    install_sigint_abort(&agent)?;

    match agent.run_turn(&prompt) {
        Ok(text) => {
            println!("{text}");
            Ok(())
        }
        Err(err) if is_abort_error(&err) => {
            eprintln!("aborted");
            std::process::exit(130);
        }
        Err(err) => Err(err),
    }
}

fn run_chat(workspace: &Path, cli: &Cli) -> Result<()> {
    use std::io::{Write, stdin, stdout};

    let (mut agent, host, observer) = build_agent(workspace, cli)?;
    install_sigint_abort(&agent)?;

    {
        let cfg = agent.config();
        if std::env::var(&cfg.llm.api_key_env).is_err() {
            observer.warn_log(&format!(
                "{} is not set; model calls will fail",
                cfg.llm.api_key_env
            ));
        }
        println!("tiller chat (type 'exit' to quit)");
        println!(
            "model: {} approvals: {} plan: {}",
            cfg.llm.model,
            effective_approval_mode(cfg, cli),
            if cfg.agent.pre_plan { "on" } else { "off" }
        );
    }

    // Deltas stream straight to stdout; the flag tells the loop below
    // whether the final text already reached the screen that way.
    let streamed = Arc::new(AtomicBool::new(false));
    if agent.config().agent.native_tools {
        agent.set_stream_callback(stdout_stream_callback(Arc::clone(&streamed)));
    }

    loop {
        print!("> ");
        stdout().flush()?;
        let mut line = String::new();
        if stdin().read_line(&mut line)? == 0 {
            break;
        }
        let prompt = line.trim();
        if prompt.is_empty() {
            continue;
        }
        if prompt == "exit" || prompt == "quit" {
            break;
        }
        if let Some(command) = parse_repl_command(prompt) {
            match run_repl_command(command, &mut agent, &host) {
                Ok(output) => println!("{output}"),
                Err(err) => eprintln!("error: {err:#}"),
            }
            continue;
        }

        streamed.store(false, Ordering::Relaxed);
        match agent.run_turn(prompt) {
            Ok(text) => {
                if !streamed.load(Ordering::Relaxed) {
                    println!("{text}");
                }
            }
            Err(err) if is_abort_error(&err) => {
                println!();
                println!("(turn aborted)");
            }
            Err(err) => eprintln!("error: {err:#}"),
        }
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum ReplCommand {
    Help,
    Compact,
    Todos,
    Unknown(String),
}

/// REPL-local commands never reach the model. `None` means the line is a
/// prompt for the agent.
fn parse_repl_command(line: &str) -> Option<ReplCommand> {
    let rest = line.strip_prefix('/')?;
    let name = rest.split_whitespace().next().unwrap_or("");
    Some(match name {
        "help" => ReplCommand::Help,
        "compact" => ReplCommand::Compact,
        "todos" => ReplCommand::Todos,
        other => ReplCommand::Unknown(other.to_string()),
    })
}

fn run_repl_command(
    command: ReplCommand,
    agent: &mut Agent,
    host: &Arc<LocalToolHost>,
) -> Result<String> {
    match command {
        ReplCommand::Help => Ok(
            "commands: /help /compact /todos exit\nanything else is sent to the model".to_string(),
        ),
        ReplCommand::Compact => agent.compact_history(None).map(|report| {
            if report.compacted {
                format!(
                    "history compacted {} -> {} messages",
                    report.before, report.after
                )
            } else {
                format!("nothing to compact ({} messages)", report.before)
            }
        }),
        ReplCommand::Todos => Ok(host.todos_rendered()),
        ReplCommand::Unknown(name) => Ok(format!("unknown command: /{name} (try /help)")),
    }
}

fn build_agent(
    workspace: &Path,
    cli: &Cli,
) -> Result<(Agent, Arc<LocalToolHost>, Arc<Observer>)> {
    let mut cfg = AppConfig::load(workspace)?;
    apply_cli_flags(&mut cfg, cli);

    let provider = Arc::new(HttpProvider::new(cfg.llm.clone())?);
    let host = Arc::new(LocalToolHost::new(workspace, cfg.approvals.clone())?);
    let tools = tool_definitions(host.hub().has_servers());
    let server_names = host.hub().server_names();

    let mut agent = Agent::new(provider, host.clone(), cfg, workspace, tools);
    agent.set_mcp_servers(server_names);
    agent.set_project_instructions(read_project_instructions(workspace));

    let mut observer = Observer::new(workspace)?;
    observer.set_verbose(cli.verbose);
    let observer = Arc::new(observer);
    let sink = Arc::clone(&observer);
    let session_id = Uuid::now_v7();
    let seq = AtomicU64::new(0);
    agent.set_event_callback(Arc::new(move |kind| {
        sink.verbose_log(&describe_event(&kind));
        let envelope = EventEnvelope {
            seq_no: seq.fetch_add(1, Ordering::SeqCst) + 1,
            at: Utc::now(),
            session_id,
            kind,
        };
        // Journal failures must not take the turn down with them.
        let _ = sink.record_event(&envelope);
    }));

    if !cli.no_input {
        agent.set_approval_callback(stdin_approval_callback());
    }

    Ok((agent, host, observer))
}

fn apply_cli_flags(cfg: &mut AppConfig, cli: &Cli) {
    if let Some(model) = &cli.model {
        cfg.llm.model = model.clone();
    }
    if let Some(max) = cli.max_iterations {
        cfg.agent.max_iterations = max;
    }
    if cli.no_plan {
        cfg.agent.pre_plan = false;
    }
    if cli.auto_approve {
        cfg.approvals.mode = "auto".to_string();
    }
}

fn effective_approval_mode(cfg: &AppConfig, cli: &Cli) -> &'static str {
    if cfg.approvals.mode == "auto" {
        "auto"
    } else if cli.no_input {
        "deny"
    } else {
        "ask"
    }
}

/// `TILLER.md` at the workspace root, when present and non-empty.
fn read_project_instructions(workspace: &Path) -> Option<String> {
    let text = std::fs::read_to_string(workspace.join("TILLER.md")).ok()?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Wire Ctrl-C to the agent's cancel token. The token is re-armed at the
/// start of every turn, so one registration covers the whole session.
#[cfg(unix)]
fn install_sigint_abort(agent: &Agent) -> Result<()> {
    signal_hook::flag::register(
        signal_hook::consts::SIGINT,
        agent.cancel_token().abort_flag(),
    )?;
    Ok(())
}

#[cfg(not(unix))]
fn install_sigint_abort(_agent: &Agent) -> Result<()> {
    Ok(())
}

fn stdin_approval_callback() -> tiller_agent::ApprovalCallback {
    Arc::new(|req: ApprovalRequest<'_>| {
        use std::io::{Write, stdin, stdout};
        match req {
            ApprovalRequest::Tool(call) => {
                let args = serde_json::to_string(&call.args)
                    .unwrap_or_else(|_| "<unserializable>".to_string());
                print!("approve {} {}? [y/N] ", call.name, truncate_line(&args, 120));
                stdout().flush()?;
                let mut line = String::new();
                stdin().read_line(&mut line)?;
                Ok(matches!(line.trim(), "y" | "Y" | "yes"))
            }
            ApprovalRequest::Checkpoint { iterations } => {
                print!("agent has run {iterations} iterations; keep going? [Y/n] ");
                stdout().flush()?;
                let mut line = String::new();
                stdin().read_line(&mut line)?;
                Ok(!matches!(line.trim(), "n" | "N" | "no"))
            }
        }
    })
}

fn stdout_stream_callback(streamed: Arc<AtomicBool>) -> tiller_core::StreamCallback {
    Arc::new(move |chunk: StreamChunk| {
        use std::io::Write as _;
        let out = std::io::stdout();
        let mut handle = out.lock();
        match chunk {
            StreamChunk::ContentDelta(text) => {
                streamed.store(true, Ordering::Relaxed);
                let _ = write!(handle, "{text}");
                let _ = handle.flush();
            }
            StreamChunk::ReasoningDelta(_) => {}
            StreamChunk::ToolCallStart {
                name, args_summary, ..
            } => {
                let _ = writeln!(handle, "\n[tool: {name}] {args_summary}");
                let _ = handle.flush();
            }
            StreamChunk::ToolCallEnd { name, success, .. } => {
                let status = if success { "ok" } else { "error" };
                let _ = writeln!(handle, "[tool: {name}] {status}");
                let _ = handle.flush();
            }
            StreamChunk::Done => {
                let _ = writeln!(handle);
                let _ = handle.flush();
            }
        }
    })
}

/// One-line rendering of an event for `--verbose` stderr output.
fn describe_event(kind: &EventKind) -> String {
    match kind {
        EventKind::TurnStartedV1 { prompt } => {
            format!("turn started: {}", truncate_line(prompt, 60))
        }
        EventKind::PlanCreatedV1 { plan } => format!(
            "plan: {} step(s), tool budget {}",
            plan.steps.len(),
            plan.tool_budget
        ),
        EventKind::PlanRevisedV1 { plan } => {
            format!("plan revised: tool budget {}", plan.tool_budget)
        }
        EventKind::ThoughtV1 { content } => {
            format!("thought: {}", truncate_line(content, 60))
        }
        EventKind::ToolStartedV1 {
            name, args_summary, ..
        } => format!("tool {name}: {args_summary}"),
        EventKind::ToolFinishedV1 {
            name,
            success,
            duration_ms,
            ..
        } => {
            let status = if *success { "ok" } else { "failed" };
            format!("tool {name} {status} ({duration_ms}ms)")
        }
        EventKind::CompactionV1 { before, after } => {
            format!("history compacted {before} -> {after}")
        }
        EventKind::UsageUpdatedV1 { usage } => format!(
            "usage: {} in / {} out",
            usage.input_tokens, usage.output_tokens
        ),
        EventKind::TurnFinishedV1 {
            finish_reason,
            iterations,
            tool_calls,
        } => format!(
            "turn finished: {finish_reason} ({iterations} iteration(s), {tool_calls} tool call(s))"
        ),
    }
}

fn truncate_line(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_chars).collect();
        format!("{cut}...")
    }
}
