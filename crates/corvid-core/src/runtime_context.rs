// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Runtime context for an agent session.
//!
//! This is separate from [`corvid_config::AgentConfig`], which holds only
//! config-file fields. [`AgentRuntimeContext`] carries values detected or
//! specified at runtime: project root, git/CI context, prompt overrides.

use std::path::PathBuf;

/// Environment-detected context injected into an agent at construction time.
#[derive(Debug, Default, Clone)]
pub struct AgentRuntimeContext {
    /// Absolute path to the project root (found via `.git` walk-up).
    pub project_root: Option<PathBuf>,
    /// Pre-formatted git context block (branch, commit, dirty status).
    pub git_context_note: Option<String>,
    /// Pre-formatted CI environment context block.
    pub ci_context_note: Option<String>,
    /// Contents of the project context file (`AGENTS.md`, etc.).
    pub project_context_file: Option<String>,
    /// Text appended to the default system prompt (from `--append-system-prompt`).
    pub append_system_prompt: Option<String>,
    /// Full system prompt override (from `--system-prompt-file`).
    /// When set, replaces `AgentConfig::system_prompt` entirely.
    pub system_prompt_override: Option<String>,
}

impl AgentRuntimeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_project_root(mut self, root: PathBuf) -> Self {
        self.project_root = Some(root);
        self
    }

    pub fn with_git_context_note(mut self, note: impl Into<String>) -> Self {
        self.git_context_note = Some(note.into());
        self
    }

    pub fn with_ci_context_note(mut self, note: impl Into<String>) -> Self {
        self.ci_context_note = Some(note.into());
        self
    }

    pub fn with_project_context_file(mut self, contents: impl Into<String>) -> Self {
        self.project_context_file = Some(contents.into());
        self
    }

    pub fn with_append_system_prompt(mut self, text: impl Into<String>) -> Self {
        self.append_system_prompt = Some(text.into());
        self
    }

    pub fn with_system_prompt_override(mut self, text: impl Into<String>) -> Self {
        self.system_prompt_override = Some(text.into());
        self
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
