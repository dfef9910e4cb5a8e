// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Error taxonomy for the agent loop.
//!
//! Every failure that can escape a turn is mapped onto one of these kinds
//! before it reaches a caller, so consumers (CI runner, TUI) can decide
//! whether to retry, surface guidance, or abort without string-matching
//! error messages.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("tool validation failed for `{tool}`: {message}")]
    ToolValidation { tool: String, message: String },

    #[error("tool execution failed for `{tool}`: {message}")]
    ToolExecution { tool: String, message: String },

    /// A transient streaming fault the loop should retry within the same
    /// iteration (rate limit, connection reset, 5xx).
    #[error("retryable stream error: {0}")]
    StreamRetryable(String),

    /// A stream fault the loop must not retry.
    #[error("fatal stream error: {0}")]
    StreamFatal(String),

    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    /// The provider returned a finish reason the loop doesn't recognize,
    /// and no tool calls were present to continue the turn.
    #[error("unrecognized finish reason with no tool calls: {0}")]
    UnknownFinishReason(String),

    #[error("reached the iteration cap ({0} rounds)")]
    IterationCap(u32),

    #[error("cancelled")]
    Cancelled,

    #[error("file edit match failed: {0}")]
    FileEditMatchFail(String),

    #[error("path security violation: {0}")]
    PathSecurityViolation(String),

    #[error("compression failure: {0}")]
    CompressionFailure(String),
}

impl AgentError {
    /// Short, stable label used in the `"Unexpected error in agent loop
    /// (<error-kind>): <message>"` wrapper format.
    pub fn kind(&self) -> &'static str {
        match self {
            AgentError::ToolValidation { .. } => "tool-validation",
            AgentError::ToolExecution { .. } => "tool-execution",
            AgentError::StreamRetryable(_) => "stream-retryable",
            AgentError::StreamFatal(_) => "stream-fatal",
            AgentError::ModelUnavailable(_) => "model-unavailable",
            AgentError::UnknownFinishReason(_) => "unknown-finish-reason",
            AgentError::IterationCap(_) => "iteration-cap",
            AgentError::Cancelled => "cancelled",
            AgentError::FileEditMatchFail(_) => "file-edit-match-fail",
            AgentError::PathSecurityViolation(_) => "path-security-violation",
            AgentError::CompressionFailure(_) => "compression-failure",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, AgentError::StreamRetryable(_))
    }

    /// Render the loop-error message format mandated for anything that
    /// escapes the agent loop as a terminal failure.
    pub fn loop_message(&self) -> String {
        format!("Unexpected error in agent loop ({}): {}", self.kind(), self)
    }
}

/// Classify a raw transport/provider error surfaced from a streaming
/// completion call as retryable or fatal.
///
/// Retryable faults are the ones a client is expected to recover from by
/// retrying the same request: rate limiting, connection resets, and 5xx
/// server errors. Anything else (auth failures, malformed requests,
/// context-window overflows) is fatal — retrying would just fail again.
pub fn classify_stream_error(err: &anyhow::Error) -> AgentError {
    let msg = err.to_string().to_lowercase();
    let retryable = [
        "timed out",
        "timeout",
        "connection reset",
        "connection closed",
        "broken pipe",
        "429",
        "rate limit",
        "too many requests",
        "502",
        "503",
        "504",
        "overloaded",
        "temporarily unavailable",
    ]
    .iter()
    .any(|needle| msg.contains(needle));

    if retryable {
        AgentError::StreamRetryable(err.to_string())
    } else {
        AgentError::StreamFatal(err.to_string())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_is_retryable() {
        let e = anyhow::anyhow!("HTTP 429 Too Many Requests");
        assert!(classify_stream_error(&e).is_retryable());
    }

    #[test]
    fn connection_reset_is_retryable() {
        let e = anyhow::anyhow!("connection reset by peer");
        assert!(classify_stream_error(&e).is_retryable());
    }

    #[test]
    fn server_5xx_is_retryable() {
        let e = anyhow::anyhow!("provider returned 503 Service Unavailable");
        assert!(classify_stream_error(&e).is_retryable());
    }

    #[test]
    fn auth_failure_is_fatal() {
        let e = anyhow::anyhow!("401 Unauthorized: invalid API key");
        assert!(!classify_stream_error(&e).is_retryable());
    }

    #[test]
    fn malformed_request_is_fatal() {
        let e = anyhow::anyhow!("400 Bad Request: invalid schema");
        assert!(!classify_stream_error(&e).is_retryable());
    }

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(AgentError::Cancelled.kind(), "cancelled");
        assert_eq!(AgentError::IterationCap(5).kind(), "iteration-cap");
    }

    #[test]
    fn loop_message_has_expected_format() {
        let e = AgentError::StreamFatal("boom".into());
        assert_eq!(
            e.loop_message(),
            "Unexpected error in agent loop (stream-fatal): fatal stream error: boom"
        );
    }
}
