// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use corvid_config::AgentMode;

#[derive(Parser, Debug)]
#[command(
    name = "corvid",
    about = "Execution core of a local agentic coding assistant",
    version,
    long_about = None,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// The task to hand to the agent. Omit to read the prompt from stdin.
    #[arg(value_name = "PROMPT")]
    pub prompt: Option<String>,

    /// Path to config file (overrides auto-discovery)
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Operating mode for the run
    #[arg(long, short = 'm', value_enum)]
    pub mode: Option<AgentMode>,

    /// Model name to use, overriding the configured default
    #[arg(long, short = 'M', env = "CORVID_MODEL")]
    pub model: Option<String>,

    /// Model provider to use, overriding the configured default
    #[arg(long, short = 'p')]
    pub provider: Option<String>,

    /// Apply file writes/edits without waiting for interactive review
    #[arg(long)]
    pub auto_approve_edits: bool,

    /// Maximum tool-call rounds for this run, overriding the configured default
    #[arg(long)]
    pub max_tool_rounds: Option<u32>,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print the effective configuration (merged from all config layers) and exit
    ShowConfig,
    /// Generate a shell completion script
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

pub fn print_completions(shell: Shell) {
    let mut cmd = Cli::command();
    generate(shell, &mut cmd, "corvid", &mut std::io::stdout());
}
