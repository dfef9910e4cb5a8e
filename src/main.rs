// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::{self, IsTerminal, Read, Write as _};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::{mpsc, Mutex};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use corvid_config::Config;
use corvid_core::{
    Agent, AgentEvent, AgentRuntimeContext, CompactionStrategyUsed, EditOperation, EditResolution,
    TaskTool,
};
use corvid_tools::{
    events::{TodoItem, ToolEvent},
    EditFileTool, FindFileTool, GrepTool, ListDirTool, ReadFileTool, ShellTool, SwitchModeTool,
    TodoWriteTool, ToolRegistry, WebFetchTool, WebSearchTool, WriteTool,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if let Some(cmd) = &cli.command {
        match cmd {
            Commands::Completions { shell } => {
                cli::print_completions(*shell);
                return Ok(());
            }
            Commands::ShowConfig => {
                let config = corvid_config::load(cli.config.as_deref())?;
                println!("{}", serde_yaml::to_string(&config).unwrap_or_default());
                return Ok(());
            }
        }
    }

    let mut config = corvid_config::load(cli.config.as_deref())?;
    apply_overrides(&mut config, &cli);

    let prompt = resolve_prompt(cli.prompt)?;
    run(config, prompt).await
}

/// Fold CLI flags into the loaded configuration.
fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(mode) = cli.mode {
        config.agent.default_mode = mode;
    }
    if let Some(model) = &cli.model {
        config.model.name = model.clone();
    }
    if let Some(provider) = &cli.provider {
        config.model.provider = provider.clone();
    }
    if let Some(max_rounds) = cli.max_tool_rounds {
        config.agent.max_tool_rounds = max_rounds;
    }
    if cli.auto_approve_edits {
        config.tools.auto_approve_edits = true;
    }
}

/// Resolve the prompt text: the positional argument if given, otherwise the
/// whole of stdin (when stdin is piped, not a terminal).
fn resolve_prompt(arg: Option<String>) -> anyhow::Result<String> {
    if let Some(p) = arg {
        return Ok(p);
    }
    if io::stdin().is_terminal() {
        anyhow::bail!("no prompt given; pass one as an argument or pipe it on stdin");
    }
    let mut buf = String::new();
    io::stdin().read_to_string(&mut buf).context("reading prompt from stdin")?;
    if buf.trim().is_empty() {
        anyhow::bail!("stdin was empty; nothing to submit");
    }
    Ok(buf)
}

/// Drive one conversation turn from `prompt` to completion, streaming text to
/// stdout and handling pending edit review over the terminal.
async fn run(config: Config, prompt: String) -> anyhow::Result<()> {
    let config = Arc::new(config);
    let model = corvid_model::from_config(&config.model)?;
    let max_context_tokens = model.catalog_context_window().unwrap_or(128_000) as usize;

    let mode_lock = Arc::new(Mutex::new(config.agent.default_mode));
    let (tool_tx, tool_rx) = mpsc::channel::<ToolEvent>(64);
    let todos: Arc<Mutex<Vec<TodoItem>>> = Arc::new(Mutex::new(Vec::new()));

    let mut registry = ToolRegistry::new();
    registry.register(ReadFileTool);
    registry.register(ListDirTool);
    registry.register(FindFileTool);
    registry.register(GrepTool);
    registry.register(WebFetchTool);
    registry.register(WebSearchTool { api_key: config.tools.web.search.api_key.clone() });
    registry.register(TodoWriteTool::new(todos, tool_tx.clone()));
    registry.register(SwitchModeTool::new(mode_lock.clone(), tool_tx));
    registry.register(WriteTool);
    registry.register(EditFileTool);
    registry.register(ShellTool { timeout_secs: config.tools.timeout_secs });
    registry.register(TaskTool::new(
        model.clone(),
        config.clone(),
        Arc::new(config.agent.clone()),
        Arc::new(AtomicUsize::new(0)),
    ));

    let mut runtime = AgentRuntimeContext::new();
    if let Ok(cwd) = std::env::current_dir() {
        runtime = runtime.with_project_root(cwd);
    }

    let mut agent = Agent::new(
        model,
        Arc::new(registry),
        Arc::new(config.agent.clone()),
        Arc::new(config.tools.clone()),
        runtime,
        mode_lock,
        tool_rx,
        max_context_tokens,
    );

    let pending_edits = agent.pending_edits().clone();
    let (event_tx, event_rx) = mpsc::channel::<AgentEvent>(256);

    let submit = tokio::spawn(async move { agent.submit(&prompt, event_tx).await });
    drive_events(event_rx, pending_edits).await?;

    match submit.await.context("agent task panicked")? {
        Ok(()) => Ok(()),
        Err(e) => {
            eprintln!("\n[error] {e}");
            std::process::exit(1);
        }
    }
}

/// Consume `AgentEvent`s until the turn completes, printing streamed text and
/// resolving any pending edit review requests.
async fn drive_events(
    mut rx: mpsc::Receiver<AgentEvent>,
    pending_edits: Arc<corvid_core::PendingEditTable>,
) -> anyhow::Result<()> {
    let mut stdin_lines = BufReader::new(tokio::io::stdin()).lines();
    let interactive = io::stdin().is_terminal();

    while let Some(event) = rx.recv().await {
        match event {
            AgentEvent::TextDelta(text) => {
                print!("{text}");
                io::stdout().flush().ok();
            }
            AgentEvent::TextComplete(_) => {
                println!();
            }
            AgentEvent::ThinkingDelta(_) | AgentEvent::ThinkingComplete(_) => {
                // Reasoning is logged, not printed: it is not the turn's answer.
            }
            AgentEvent::ToolCallStarted(call) => {
                info!(tool = %call.name, call_id = %call.id, "running tool");
            }
            AgentEvent::ToolCallFinished { tool_name, is_error, .. } => {
                if is_error {
                    warn!(tool = %tool_name, "tool call failed");
                } else {
                    debug!(tool = %tool_name, "tool call finished");
                }
            }
            AgentEvent::ContextCompacted { tokens_before, tokens_after, strategy, .. } => {
                let label = match strategy {
                    CompactionStrategyUsed::Structured => "structured",
                    CompactionStrategyUsed::Narrative => "narrative",
                    CompactionStrategyUsed::Emergency => "emergency",
                };
                info!(tokens_before, tokens_after, strategy = label, "context compacted");
            }
            AgentEvent::TokenUsage { input, output, context_total, .. } => {
                debug!(input, output, context_total, "token usage");
            }
            AgentEvent::TodoUpdate(_) | AgentEvent::ModeChanged(_) => {}
            AgentEvent::EditPending(edit) => {
                let resolution = if interactive {
                    prompt_edit_resolution(&mut stdin_lines, &edit).await?
                } else {
                    EditResolution::Rejected {
                        feedback: Some(
                            "non-interactive session: pass --auto-approve-edits to apply writes"
                                .to_string(),
                        ),
                    }
                };
                pending_edits.resolve(&edit.id, resolution).await;
            }
            AgentEvent::EditResolved { file_path, approved, .. } => {
                info!(file = %file_path, approved, "edit resolved");
            }
            AgentEvent::Aborted { partial_text } => {
                if !partial_text.is_empty() {
                    println!("{partial_text}");
                }
                println!("\n[aborted]");
            }
            AgentEvent::Error(message) => {
                eprintln!("\n[error] {message}");
            }
            AgentEvent::TurnComplete => break,
        }
    }
    Ok(())
}

async fn prompt_edit_resolution(
    lines: &mut tokio::io::Lines<BufReader<tokio::io::Stdin>>,
    edit: &corvid_core::PendingEdit,
) -> anyhow::Result<EditResolution> {
    let verb = match edit.operation {
        EditOperation::Write => "write",
        EditOperation::Edit => "edit",
    };
    eprint!(
        "\npending {verb}: {}\napprove? [y]es / [n]o / [a]llow all / [N] reject (default no): ",
        edit.file_path
    );
    io::stderr().flush().ok();
    let answer = lines.next_line().await.context("reading edit approval from stdin")?;
    let resolution = match answer.as_deref().map(str::trim).unwrap_or_default() {
        "y" | "yes" => EditResolution::approved(),
        "a" | "allow" => EditResolution::allow_all(),
        _ => EditResolution::Rejected { feedback: None },
    };
    Ok(resolution)
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .with(filter)
        .try_init();
}
