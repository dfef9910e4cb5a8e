// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use corvid_config::AgentMode;
use corvid_tools::{events::TodoItem, ToolCall};

use crate::executor::{EditOperation, PendingEdit};

/// Which compaction strategy actually produced a given [`AgentEvent::ContextCompacted`].
///
/// `Structured`/`Narrative` mirror [`corvid_config::CompactionStrategy`] — the
/// strategy the caller configured and that ran successfully. `Emergency`
/// marks the fallback path: a configured strategy's summarization call
/// itself failed or returned something unusable, and the session was saved
/// by dropping the oldest messages instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionStrategyUsed {
    Structured,
    Narrative,
    Emergency,
}

/// Events emitted by the agent during a single turn.
/// Consumers (CI runner, TUI) subscribe to these to drive their output.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    /// A text chunk streamed from the model
    TextDelta(String),
    /// A complete text response from the model (after streaming finishes)
    TextComplete(String),
    /// A thinking/reasoning chunk from the model (extended thinking API).
    /// Consumers should accumulate deltas and finalise them into a Thinking
    /// segment when the model signals the end of the reasoning block.
    ThinkingDelta(String),
    /// A complete thinking/reasoning block (accumulated from ThinkingDelta events).
    ThinkingComplete(String),
    /// The model has requested a tool call
    ToolCallStarted(ToolCall),
    /// A tool call finished
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        output: String,
        is_error: bool,
    },
    /// Context was compacted; statistics for the UI
    ContextCompacted {
        tokens_before: usize,
        tokens_after: usize,
        strategy: CompactionStrategyUsed,
        /// Turn index at which compaction ran, for correlating with other
        /// per-turn events in a transcript.
        turn: u32,
    },
    /// Current token usage update
    TokenUsage {
        input: u32,
        output: u32,
        context_total: usize,
        /// Tokens served from the provider's prompt cache this turn.
        cache_read: u32,
        /// Tokens written into the provider's prompt cache this turn.
        cache_write: u32,
        /// Running total of cache-read tokens across the whole session.
        cache_read_total: u64,
        /// Running total of cache-write tokens across the whole session.
        cache_write_total: u64,
        /// The model's configured maximum output tokens, for UI budget bars.
        max_tokens: u32,
    },
    /// The agent has finished processing the current user turn
    TurnComplete,
    /// The turn was cancelled before completion; any text streamed so far.
    Aborted { partial_text: String },
    /// A recoverable error occurred
    Error(String),
    /// The todo list was updated
    TodoUpdate(Vec<TodoItem>),
    /// The agent mode was changed
    ModeChanged(AgentMode),
    /// A file write/edit is awaiting approval before it is applied.
    EditPending(PendingEdit),
    /// A previously pending edit was resolved (approved or rejected).
    EditResolved {
        id: String,
        approved: bool,
        operation: EditOperation,
        file_path: String,
    },
}
