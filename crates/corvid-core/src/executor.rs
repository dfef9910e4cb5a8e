// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tool Executor and the human-in-the-loop file-edit review protocol.
//!
//! [`ToolExecutor::run`] dispatches a batch of tool calls phase-by-phase
//! according to [`crate::analyzer::plan`]: every call within a phase runs
//! concurrently, phases run strictly in order, and cancellation is checked
//! between phases so a cancelled run never starts work past the point the
//! caller asked it to stop.
//!
//! [`PendingEditTable`] sits in front of file-mutating tools. When a write or
//! edit is not auto-approved, the agent loop raises a [`PendingEdit`] here
//! instead of calling the tool directly, and awaits the paired
//! [`EditResolution`] from whatever surface (TUI, CI harness) is driving
//! approvals.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{oneshot, Mutex};

use serde_json::Value;

use corvid_tools::{ToolCall, ToolOutput, ToolRegistry};

use crate::analyzer;

/// Validate `args` against a tool's declared JSON-Schema `parameters_schema`
/// before dispatch. Only the shape-level checks the schema can express
/// without a full JSON-Schema engine are performed: required-field presence
/// and, where `properties` declares a `type`, a loose type match. Returns the
/// name of the first offending field on failure.
fn validate_input(schema: &Value, args: &Value) -> Result<(), String> {
    let Some(obj) = schema.as_object() else {
        return Ok(());
    };
    let required = obj
        .get("required")
        .and_then(Value::as_array)
        .map(|a| a.iter().filter_map(Value::as_str).collect::<Vec<_>>())
        .unwrap_or_default();
    let properties = obj.get("properties").and_then(Value::as_object);

    for field in &required {
        if args.get(field).is_none() {
            return Err(format!("missing required field `{field}`"));
        }
    }

    if let Some(properties) = properties {
        for (field, prop_schema) in properties {
            let Some(value) = args.get(field) else {
                continue;
            };
            let Some(expected_type) = prop_schema.get("type").and_then(Value::as_str) else {
                continue;
            };
            if !type_matches(expected_type, value) {
                return Err(format!(
                    "field `{field}` must be of type `{expected_type}`"
                ));
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        _ => true,
    }
}

/// One tool call paired with the output it produced.
#[derive(Debug, Clone)]
pub struct ExecutedCall {
    pub call: ToolCall,
    pub output: ToolOutput,
}

/// Dispatches tool calls according to the dependency-analyzer's execution
/// plan, respecting cancellation between phases.
pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self { registry }
    }

    /// Run every call in `calls`, honoring the phase ordering from
    /// [`analyzer::plan`]. `should_cancel` is polled before each phase; once
    /// it returns `true`, every call in every remaining phase is short
    /// circuited to a cancelled-error output without ever reaching the tool.
    ///
    /// Results are returned in the same order as `calls`, regardless of
    /// which phase or concurrent slot actually produced them.
    pub async fn run(
        &self,
        calls: &[ToolCall],
        mut should_cancel: impl FnMut() -> bool,
    ) -> Vec<ExecutedCall> {
        if calls.is_empty() {
            return Vec::new();
        }

        let plan = analyzer::plan(calls, &self.registry);
        let mut outputs: HashMap<String, ToolOutput> = HashMap::with_capacity(calls.len());
        let mut cancelled = false;

        for phase in &plan.phases {
            if !cancelled && should_cancel() {
                cancelled = true;
            }
            if cancelled {
                for call in phase {
                    outputs.insert(call.id.clone(), ToolOutput::err(&call.id, "cancelled"));
                }
                continue;
            }

            let mut dispatchable = Vec::with_capacity(phase.len());
            for call in phase {
                match self.registry.get(&call.name) {
                    None => {
                        outputs.insert(
                            call.id.clone(),
                            ToolOutput::err(&call.id, format!("unknown tool: {}", call.name)),
                        );
                    }
                    Some(tool) => match validate_input(&tool.parameters_schema(), &call.args) {
                        Ok(()) => dispatchable.push(call.clone()),
                        Err(reason) => {
                            outputs.insert(
                                call.id.clone(),
                                ToolOutput::err(
                                    &call.id,
                                    format!("tool validation failed for `{}`: {reason}", call.name),
                                ),
                            );
                        }
                    },
                }
            }

            let futures = dispatchable.iter().map(|call| {
                let registry = Arc::clone(&self.registry);
                let call = call.clone();
                async move {
                    let output = registry.execute(&call).await;
                    (call.id.clone(), output)
                }
            });
            let results = futures::future::join_all(futures).await;
            for (id, output) in results {
                outputs.insert(id, output);
            }
        }

        calls
            .iter()
            .map(|call| {
                let output = outputs
                    .remove(&call.id)
                    .unwrap_or_else(|| ToolOutput::err(&call.id, "tool produced no output"));
                ExecutedCall { call: call.clone(), output }
            })
            .collect()
    }
}

// ─── Pending Edit review protocol ───────────────────────────────────────────

/// Whether a pending edit would create a new file or modify an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOperation {
    Write,
    Edit,
}

/// A file mutation awaiting human review before it is applied.
#[derive(Debug, Clone)]
pub struct PendingEdit {
    pub id: String,
    pub conversation_id: String,
    pub file_path: String,
    pub original_content: String,
    pub new_content: String,
    pub operation: EditOperation,
    pub timestamp: DateTime<Utc>,
}

/// The reviewer's decision on a [`PendingEdit`].
#[derive(Debug, Clone)]
pub enum EditResolution {
    /// Write the file. `allow_all` also flips the conversation's
    /// auto-approve setting so future edits skip the review wait.
    Approved { allow_all: bool },
    Rejected { feedback: Option<String> },
}

impl EditResolution {
    pub fn approved() -> Self {
        Self::Approved { allow_all: false }
    }

    pub fn allow_all() -> Self {
        Self::Approved { allow_all: true }
    }
}

/// One applied edit recorded for audit/undo purposes. Only approved edits
/// are logged — a rejected edit never touched disk.
#[derive(Debug, Clone)]
pub struct ChangeLogEntry {
    pub conversation_id: String,
    pub file_path: String,
    pub operation: EditOperation,
    pub original_content: String,
    pub final_content: String,
}

/// Tracks file edits awaiting approval and the resulting change log.
///
/// `resolve` is idempotent: the first call to resolve a given id removes it
/// from the pending table and (if approved) appends to the change log; any
/// further call with the same id is a no-op that returns `false`, since the
/// `oneshot::Sender` has already been consumed.
pub struct PendingEditTable {
    auto_approve: Mutex<bool>,
    pending: Mutex<HashMap<String, (PendingEdit, oneshot::Sender<EditResolution>)>>,
    change_log: Mutex<Vec<ChangeLogEntry>>,
}

impl PendingEditTable {
    pub fn new(auto_approve: bool) -> Self {
        Self {
            auto_approve: Mutex::new(auto_approve),
            pending: Mutex::new(HashMap::new()),
            change_log: Mutex::new(Vec::new()),
        }
    }

    pub async fn is_auto_approved(&self) -> bool {
        *self.auto_approve.lock().await
    }

    pub async fn set_auto_approve(&self, value: bool) {
        *self.auto_approve.lock().await = value;
    }

    /// Register `edit` as awaiting review and return a receiver that
    /// resolves once the caller (or anyone holding a reference to this
    /// table) resolves it via [`PendingEditTable::resolve`].
    pub async fn raise(&self, edit: PendingEdit) -> oneshot::Receiver<EditResolution> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(edit.id.clone(), (edit, tx));
        rx
    }

    /// Resolve a pending edit by id. Returns `false` if the id is unknown or
    /// was already resolved.
    pub async fn resolve(&self, id: &str, resolution: EditResolution) -> bool {
        let entry = self.pending.lock().await.remove(id);
        let Some((edit, tx)) = entry else {
            return false;
        };
        if let EditResolution::Approved { allow_all } = resolution {
            self.change_log.lock().await.push(ChangeLogEntry {
                conversation_id: edit.conversation_id,
                file_path: edit.file_path,
                operation: edit.operation,
                original_content: edit.original_content,
                final_content: edit.new_content,
            });
            if allow_all {
                *self.auto_approve.lock().await = true;
            }
        }
        // The receiver may have been dropped (caller cancelled); that's fine.
        let _ = tx.send(resolution);
        true
    }

    pub async fn change_log(&self) -> Vec<ChangeLogEntry> {
        self.change_log.lock().await.clone()
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
