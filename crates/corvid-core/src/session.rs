// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use corvid_model::Message;
use uuid::Uuid;

/// One saved turn in the conversation log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub role: String,
    pub content: String,
}

/// In-memory conversation session.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub messages: Vec<Message>,
    /// Approximate total token count for the current message list
    pub token_count: usize,
    /// Maximum context tokens (set from model config / provider limits)
    pub max_tokens: usize,
    /// Tokens reserved for the model's response, subtracted from the
    /// available input budget.
    pub max_output_tokens: usize,
    /// Estimated fixed cost of the tool schemas sent with every request,
    /// also subtracted from the available input budget.
    pub schema_overhead: usize,
    /// Correction factor applied to our approximate token counts to track
    /// the provider's real tokenizer, refined by [`Session::update_calibration`]
    /// after each turn that reports real usage.
    pub calibration_factor: f32,
    /// Running total of tokens served from the provider's prompt cache.
    pub cache_read_total: u64,
    /// Running total of tokens written into the provider's prompt cache.
    pub cache_write_total: u64,
}

impl Session {
    pub fn new(max_tokens: usize) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            messages: Vec::new(),
            token_count: 0,
            max_tokens,
            max_output_tokens: 0,
            schema_overhead: 0,
            calibration_factor: 1.0,
            cache_read_total: 0,
            cache_write_total: 0,
        }
    }

    /// Reserve response and tool-schema budget out of the context window.
    pub fn with_output_budget(mut self, max_output_tokens: usize, schema_overhead: usize) -> Self {
        self.max_output_tokens = max_output_tokens;
        self.schema_overhead = schema_overhead;
        self
    }

    pub fn push(&mut self, msg: Message) {
        self.token_count += msg.approx_tokens();
        self.messages.push(msg);
    }

    pub fn push_many(&mut self, msgs: impl IntoIterator<Item = Message>) {
        for m in msgs { self.push(m); }
    }

    /// Fraction of context window consumed (0.0–1.0)
    pub fn context_fraction(&self) -> f32 {
        if self.max_tokens == 0 { return 0.0; }
        (self.token_count as f32) / (self.max_tokens as f32)
    }

    pub fn is_near_limit(&self, threshold: f32) -> bool {
        self.context_fraction() >= threshold
    }

    /// Recalculate token count from scratch (call after compaction).
    pub fn recalculate_tokens(&mut self) {
        self.token_count = self.messages.iter().map(|m| m.approx_tokens()).sum();
    }

    /// Replace the message list and recalculate token count (for resubmit / edit).
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.recalculate_tokens();
    }

    /// How many approximate-token-units of conversation history we can send,
    /// after reserving output and tool-schema overhead and applying the
    /// calibration correction. A `calibration_factor` above 1.0 means our
    /// estimator has historically undercounted real tokens, so the usable
    /// budget shrinks accordingly.
    pub fn input_budget(&self) -> usize {
        let raw = self
            .max_tokens
            .saturating_sub(self.max_output_tokens)
            .saturating_sub(self.schema_overhead);
        if self.calibration_factor <= 0.0 {
            return raw;
        }
        ((raw as f32) / self.calibration_factor).max(0.0) as usize
    }

    /// Record cache usage reported for the most recent completion call.
    pub fn add_cache_usage(&mut self, cache_read: u32, cache_write: u32) {
        self.cache_read_total += cache_read as u64;
        self.cache_write_total += cache_write as u64;
    }

    /// Refine the calibration factor from a real `input_tokens` figure
    /// reported by the provider for the request whose estimated size (our
    /// `approx_tokens` count) was `estimated`. Uses an exponential moving
    /// average so a single noisy sample doesn't swing the budget wildly.
    pub fn update_calibration(&mut self, estimated: usize, actual: u32) {
        if estimated == 0 {
            return;
        }
        let sample = (actual as f32) / (estimated as f32);
        if !sample.is_finite() || sample <= 0.0 {
            return;
        }
        self.calibration_factor = 0.7 * self.calibration_factor + 0.3 * sample;
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
