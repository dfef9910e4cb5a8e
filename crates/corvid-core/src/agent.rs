// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The Agent Loop Engine: drives the model ↔ tool loop for one conversation.
//!
//! One [`Agent`] owns a [`Session`] and steps it through
//! `Iterate → StreamRequest → ConsumeStream → (ToolDispatch | Finalize)`
//! until the model stops requesting tools, the iteration cap is hit, or the
//! caller cancels. Tool dispatch goes through [`crate::analyzer::plan`] and
//! [`ToolExecutor`]; file-mutating calls that aren't auto-approved are routed
//! through [`PendingEditTable`] for human review before the result is
//! accepted into history.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::warn;

use corvid_config::{AgentConfig, AgentMode, CompactionStrategy, ToolsConfig};
use corvid_model::{
    CompletionRequest, Message, MessagePart, ModelProvider, ResponseEvent, Role, ToolContentPart,
    ToolResultContent,
};
use corvid_tools::{
    events::ToolEvent, policy::ApprovalPolicy, ConcurrencyClass, OutputCategory, ToolCall,
    ToolOutput, ToolOutputPart, ToolRegistry,
};

use crate::{
    analyzer,
    compact::{
        assemble_compacted_history, build_compaction_request, emergency_compact,
        extract_critical_messages, select_split, smart_truncate,
    },
    errors::{classify_stream_error, AgentError},
    events::{AgentEvent, CompactionStrategyUsed},
    executor::{EditOperation, EditResolution, PendingEdit, PendingEditTable, ToolExecutor},
    prompts::system_prompt,
    runtime_context::AgentRuntimeContext,
    session::Session,
};

/// Empty-turn retries before the loop gives up and completes with whatever
/// (possibly empty) text the model produced.
const MAX_EMPTY_TURN_RETRIES: u32 = 2;

/// The core agent. Owns a session and drives the model ↔ tool loop.
pub struct Agent {
    session: Session,
    tools: Arc<ToolRegistry>,
    model: Arc<dyn ModelProvider>,
    config: Arc<AgentConfig>,
    tools_config: Arc<ToolsConfig>,
    runtime: AgentRuntimeContext,
    /// Shared mode lock — the same Arc given to `SwitchModeTool` so that
    /// tool-driven mode changes are immediately visible to the agent loop.
    current_mode: Arc<Mutex<AgentMode>>,
    /// Receives `ToolEvent`s emitted by stateful tools (todo updates, mode
    /// changes). The paired sender is held by `TodoWriteTool` /
    /// `SwitchModeTool` inside the registry.
    tool_event_rx: mpsc::Receiver<ToolEvent>,
    executor: ToolExecutor,
    /// File writes/edits awaiting human review. Shared so a TUI or CI
    /// harness can resolve edits concurrently with the loop awaiting them.
    pending_edits: Arc<PendingEditTable>,
    /// Consecutive dispatch rounds where every call errored. Reset to zero
    /// the moment any call in a round succeeds.
    consecutive_tool_errors: u32,
}

impl Agent {
    /// Construct an agent.
    ///
    /// `mode_lock` must be the **same** `Arc` that was given to any
    /// `SwitchModeTool` in `tools`, so that mode changes propagate correctly.
    ///
    /// `tool_event_rx` must be the receiving end of the channel whose sender
    /// was given to `TodoWriteTool` / `SwitchModeTool`, so that tool events
    /// are drained by the agent loop.
    pub fn new(
        model: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        config: Arc<AgentConfig>,
        tools_config: Arc<ToolsConfig>,
        runtime: AgentRuntimeContext,
        mode_lock: Arc<Mutex<AgentMode>>,
        tool_event_rx: mpsc::Receiver<ToolEvent>,
        max_context_tokens: usize,
    ) -> Self {
        let max_output_tokens = model.catalog_max_output_tokens().unwrap_or(0) as usize;
        let mut session = Session::new(max_context_tokens);
        session.max_output_tokens = max_output_tokens;
        let executor = ToolExecutor::new(Arc::clone(&tools));
        let pending_edits = Arc::new(PendingEditTable::new(tools_config.auto_approve_edits));
        Self {
            session,
            tools,
            model,
            config,
            tools_config,
            runtime,
            current_mode: mode_lock,
            tool_event_rx,
            executor,
            pending_edits,
            consecutive_tool_errors: 0,
        }
    }

    /// Shared reference to the tool registry. Used by CI/TUI harnesses to
    /// dispatch tool calls outside the normal loop (e.g. replay).
    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// The pending-edit review table. A TUI or CI surface resolves edits
    /// here via [`PendingEditTable::resolve`]; the loop awaits the
    /// resolution before accepting the tool's result into history.
    pub fn pending_edits(&self) -> &Arc<PendingEditTable> {
        &self.pending_edits
    }

    /// Used by the CI runner to switch models mid-workflow (per-step model
    /// overrides). The session history is preserved.
    pub fn set_model(&mut self, model: Arc<dyn ModelProvider>) {
        if let Some(cw) = model.catalog_context_window() {
            self.session.max_tokens = cw as usize;
        }
        if let Some(mot) = model.catalog_max_output_tokens() {
            self.session.max_output_tokens = mot as usize;
        }
        self.model = model;
    }

    /// Submit a new user message and drive the loop to completion.
    pub async fn submit(&mut self, user_input: &str, tx: mpsc::Sender<AgentEvent>) -> anyhow::Result<()> {
        let mode = *self.current_mode.lock().await;
        self.ensure_fits_budget(&tx, mode, 0).await?;
        if self.session.messages.is_empty() {
            self.session.push(self.system_message(mode));
        }
        self.session.push(Message::user(user_input));
        self.run_agentic_loop(tx, None).await
    }

    /// Like [`submit`](Self::submit) but accepts a cancellation channel.
    ///
    /// When the sender half is dropped (or sends `()`) the current model
    /// streaming turn is interrupted at the next `await` point. Any text
    /// already streamed is committed to the session as a partial assistant
    /// message and `AgentEvent::Aborted { partial_text }` is emitted.
    pub async fn submit_with_cancel(
        &mut self,
        user_input: &str,
        tx: mpsc::Sender<AgentEvent>,
        mut cancel: oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        if cancel.try_recv().is_ok() {
            let _ = tx.send(AgentEvent::Aborted { partial_text: String::new() }).await;
            return Ok(());
        }
        let mode = *self.current_mode.lock().await;
        self.ensure_fits_budget(&tx, mode, 0).await?;
        if self.session.messages.is_empty() {
            self.session.push(self.system_message(mode));
        }
        self.session.push(Message::user(user_input));
        self.run_agentic_loop(tx, Some(&mut cancel)).await
    }

    /// Submit a multi-part user turn (e.g. text plus image attachments).
    pub async fn submit_with_parts(
        &mut self,
        parts: Vec<MessagePart>,
        tx: mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<()> {
        let mode = *self.current_mode.lock().await;
        self.ensure_fits_budget(&tx, mode, 0).await?;
        if self.session.messages.is_empty() {
            self.session.push(self.system_message(mode));
        }
        self.session.push(Message::user_with_parts(parts));
        self.run_agentic_loop(tx, None).await
    }

    /// Seed the session history directly (e.g. resuming a persisted
    /// conversation) without triggering a model call.
    pub fn seed_history(&mut self, messages: Vec<Message>) {
        self.session.replace_messages(messages);
    }

    /// Replace the session history, append `new_user_content`, and run the loop.
    pub async fn replace_history_and_submit(
        &mut self,
        messages: Vec<Message>,
        new_user_content: &str,
        tx: mpsc::Sender<AgentEvent>,
    ) -> anyhow::Result<()> {
        self.session.replace_messages(messages);
        self.submit(new_user_content, tx).await
    }

    /// Like [`replace_history_and_submit`](Self::replace_history_and_submit)
    /// but accepts a cancellation channel.
    pub async fn replace_history_and_submit_with_cancel(
        &mut self,
        messages: Vec<Message>,
        new_user_content: &str,
        tx: mpsc::Sender<AgentEvent>,
        cancel: oneshot::Receiver<()>,
    ) -> anyhow::Result<()> {
        self.session.replace_messages(messages);
        self.submit_with_cancel(new_user_content, tx, cancel).await
    }

    // ─── The loop itself ────────────────────────────────────────────────────

    async fn run_agentic_loop(
        &mut self,
        tx: mpsc::Sender<AgentEvent>,
        mut cancel: Option<&mut oneshot::Receiver<()>>,
    ) -> anyhow::Result<()> {
        let mode = *self.current_mode.lock().await;
        let mut rounds: u32 = 0;
        let mut empty_turn_retries: u32 = 0;
        let mut tool_call_rounds_this_step: u32 = 0;
        let mut stall_nudge_sent = false;

        loop {
            if let Some(c) = cancel.as_deref_mut() {
                if c.try_recv().is_ok() {
                    let _ = tx.send(AgentEvent::Aborted { partial_text: String::new() }).await;
                    return Ok(());
                }
            }

            rounds += 1;
            let tool_free_final_turn = rounds > self.config.max_tool_rounds;
            if tool_free_final_turn {
                self.session.push(Message::user(
                    "You have reached the maximum number of tool-use rounds for this turn. \
                     Summarize your progress and stop making tool calls.",
                ));
            }

            self.ensure_fits_budget(&tx, mode, rounds).await?;

            let turn_result = match cancel.as_deref_mut() {
                Some(c) => {
                    tokio::select! {
                        biased;
                        _ = &mut *c => {
                            let _ = tx.send(AgentEvent::Aborted { partial_text: String::new() }).await;
                            return Ok(());
                        }
                        r = self.stream_one_turn_retrying(tx.clone(), mode, !tool_free_final_turn) => r,
                    }
                }
                None => self.stream_one_turn_retrying(tx.clone(), mode, !tool_free_final_turn).await,
            };

            let (text, tool_calls, had_tool_calls) = turn_result?;

            if !had_tool_calls || tool_free_final_turn {
                if text.trim().is_empty() && !tool_free_final_turn && empty_turn_retries < MAX_EMPTY_TURN_RETRIES {
                    empty_turn_retries += 1;
                    warn!(attempt = empty_turn_retries, "empty model turn; retrying");
                    continue;
                }
                if text_contains_malformed_tool_call(&text)
                    && !tool_free_final_turn
                    && empty_turn_retries < MAX_EMPTY_TURN_RETRIES
                {
                    empty_turn_retries += 1;
                    self.session.push(Message::assistant(text));
                    self.session.push(Message::user(
                        "Your last response contained tool-call syntax inside plain text \
                         instead of a structured tool call. Please retry using the proper \
                         tool-call mechanism.",
                    ));
                    continue;
                }

                if !text.is_empty() {
                    self.session.push(Message::assistant(text));
                }

                // Mid-task stall nudge: the model stopped emitting tool calls
                // after at least two rounds that did use tools. Give it one
                // nudge to continue; never re-arm so a model that heeds the
                // nudge and then genuinely finishes is allowed to stop.
                if !tool_free_final_turn
                    && tool_call_rounds_this_step >= 2
                    && !stall_nudge_sent
                {
                    stall_nudge_sent = true;
                    self.session.push(Message::user(
                        "You have not finished the task yet. Please continue with your next tool call.",
                    ));
                    continue;
                }

                let _ = tx.send(AgentEvent::TurnComplete).await;
                return Ok(());
            }

            empty_turn_retries = 0;
            tool_call_rounds_this_step += 1;

            self.dispatch_tool_round(&tx, &text, tool_calls, cancel.as_deref_mut()).await?;
        }
    }

    /// Build the combined assistant message (text/reasoning followed by
    /// tool-call parts), run the batch through the analyzer + executor +
    /// review protocol, and push the combined tool-result message.
    async fn dispatch_tool_round(
        &mut self,
        tx: &mpsc::Sender<AgentEvent>,
        text: &str,
        tool_calls: Vec<ToolCall>,
        mut cancel: Option<&mut oneshot::Receiver<()>>,
    ) -> anyhow::Result<()> {
        let mut assistant_parts = Vec::with_capacity(tool_calls.len() + 1);
        if !text.is_empty() {
            assistant_parts.push(MessagePart::text(text));
        }
        for tc in &tool_calls {
            let _ = tx.send(AgentEvent::ToolCallStarted(tc.clone())).await;
            assistant_parts.push(MessagePart::tool_call(tc.id.clone(), tc.name.clone(), tc.args.clone()));
        }
        self.session.push(Message::assistant_with_parts(assistant_parts));

        // Snapshot original file content for any call that will need human
        // review, so the reviewer sees a real diff and a rejection can
        // restore the file exactly as it was before the tool ran.
        let gated: HashMap<String, Option<String>> = {
            let mut map = HashMap::new();
            for tc in &tool_calls {
                if self.needs_review(tc).await {
                    if let Some(path) = self.tools.get(&tc.name).and_then(|t| t.target_file(tc)) {
                        let original = tokio::fs::read_to_string(&path).await.ok();
                        map.insert(tc.id.clone(), original);
                    }
                }
            }
            map
        };

        let executed = self
            .executor
            .run(&tool_calls, || cancel.as_deref_mut().map(|c| c.try_recv().is_ok()).unwrap_or(false))
            .await;

        let cap = self.config.tool_result_token_cap;
        let mut result_parts = Vec::with_capacity(executed.len());
        let mut any_success = false;
        let mut any_error = false;

        for ec in executed {
            let tc = &ec.call;
            let mut output = ec.output;

            if let Some(original) = gated.get(&tc.id) {
                if !output.is_error {
                    output = self.review_edit(tx, tc, original.clone()).await;
                }
            }

            self.drain_tool_events(tx).await;
            let _ = tx
                .send(AgentEvent::ToolCallFinished {
                    call_id: tc.id.clone(),
                    tool_name: tc.name.clone(),
                    output: output.content.clone(),
                    is_error: output.is_error,
                })
                .await;

            if output.is_error {
                any_error = true;
            } else {
                any_success = true;
            }

            let category = self.tools.output_category(&tc.name);
            let content = tool_output_to_result_content(&output, category, cap);
            result_parts.push(MessagePart::tool_result(tc.id.clone(), tc.name.clone(), content));
        }

        self.session.push(Message::tool_message(result_parts));

        if any_success {
            self.consecutive_tool_errors = 0;
        } else if any_error {
            self.consecutive_tool_errors += 1;
            if self.consecutive_tool_errors >= self.config.max_consecutive_tool_errors {
                let available = self.tools.names_for_mode(*self.current_mode.lock().await).join(", ");
                self.session.push(Message::user(format!(
                    "Too many consecutive tool errors ({}). Available tools: {available}",
                    self.consecutive_tool_errors
                )));
                self.consecutive_tool_errors = 0;
            }
        }

        Ok(())
    }

    /// Whether `call` targets a file-mutating tool that must pause for human
    /// review before its result is trusted (not auto-approved by config, by
    /// a standing "allow all" decision, or by the tool's own policy).
    async fn needs_review(&self, call: &ToolCall) -> bool {
        let Some(tool) = self.tools.get(&call.name) else { return false };
        let is_mutator = matches!(tool.concurrency_class(), ConcurrencyClass::Write | ConcurrencyClass::Edit);
        if !is_mutator {
            return false;
        }
        if tool.default_policy() != ApprovalPolicy::Ask {
            return false;
        }
        if self.tools_config.auto_approve_edits {
            return false;
        }
        !self.pending_edits.is_auto_approved().await
    }

    /// Raise a [`PendingEdit`] for an already-executed file mutation and
    /// await its resolution. On rejection the file is restored to
    /// `original` (or removed, if it did not exist before) and the returned
    /// output carries the rejection feedback; on approval the output is
    /// passed through unchanged.
    async fn review_edit(&self, tx: &mpsc::Sender<AgentEvent>, call: &ToolCall, original: Option<String>) -> ToolOutput {
        let Some(tool) = self.tools.get(&call.name) else { return ToolOutput::err(&call.id, "unknown tool") };
        let Some(path) = tool.target_file(call) else { return ToolOutput::err(&call.id, "tool has no target file") };
        let operation = match tool.concurrency_class() {
            ConcurrencyClass::Write => EditOperation::Write,
            _ => EditOperation::Edit,
        };
        let new_content = tokio::fs::read_to_string(&path).await.unwrap_or_default();

        let edit = PendingEdit {
            id: call.id.clone(),
            conversation_id: self.session.id.clone(),
            file_path: path.clone(),
            original_content: original.clone().unwrap_or_default(),
            new_content: new_content.clone(),
            operation,
            timestamp: chrono::Utc::now(),
        };
        let _ = tx.send(AgentEvent::EditPending(edit.clone())).await;
        let rx = self.pending_edits.raise(edit).await;

        let resolution = rx.await.unwrap_or_else(|_| EditResolution::Rejected {
            feedback: Some("review channel closed; edit rejected".to_string()),
        });

        match resolution {
            EditResolution::Approved { .. } => {
                let _ = tx
                    .send(AgentEvent::EditResolved {
                        id: call.id.clone(),
                        approved: true,
                        operation,
                        file_path: path,
                    })
                    .await;
                ToolOutput::ok(&call.id, format!("Edit approved. {}", "write committed."))
            }
            EditResolution::Rejected { feedback } => {
                match &original {
                    Some(orig) => {
                        let _ = tokio::fs::write(&path, orig).await;
                    }
                    None => {
                        let _ = tokio::fs::remove_file(&path).await;
                    }
                }
                let _ = tx
                    .send(AgentEvent::EditResolved {
                        id: call.id.clone(),
                        approved: false,
                        operation,
                        file_path: path,
                    })
                    .await;
                let feedback = feedback.unwrap_or_default();
                ToolOutput::ok(&call.id, format!("Edit rejected. Feedback: {feedback}"))
            }
        }
    }

    /// Drain pending tool events and translate to AgentEvents.
    async fn drain_tool_events(&mut self, tx: &mpsc::Sender<AgentEvent>) {
        while let Ok(te) = self.tool_event_rx.try_recv() {
            match te {
                ToolEvent::TodoUpdate(todos) => {
                    let _ = tx.send(AgentEvent::TodoUpdate(todos)).await;
                }
                ToolEvent::ModeChanged(new_mode) => {
                    *self.current_mode.lock().await = new_mode;
                    let _ = tx.send(AgentEvent::ModeChanged(new_mode)).await;
                }
            }
        }
    }

    /// [`stream_one_turn`](Self::stream_one_turn) wrapped with bounded,
    /// same-iteration retry for transient streaming faults. Each retry
    /// starts a brand-new stream, so all per-turn accumulation state is
    /// naturally reset.
    async fn stream_one_turn_retrying(
        &mut self,
        tx: mpsc::Sender<AgentEvent>,
        mode: AgentMode,
        with_tools: bool,
    ) -> anyhow::Result<(String, Vec<ToolCall>, bool)> {
        let mut attempt = 0;
        loop {
            match self.stream_one_turn(tx.clone(), mode, with_tools).await {
                Ok(r) => return Ok(r),
                Err(e) => {
                    let classified = classify_stream_error(&e);
                    if classified.is_retryable() && attempt < self.config.max_stream_retries {
                        attempt += 1;
                        warn!(
                            attempt,
                            max = self.config.max_stream_retries,
                            "retrying after {classified}"
                        );
                        continue;
                    }
                    let _ = tx.send(AgentEvent::Error(classified.loop_message())).await;
                    return Err(anyhow::anyhow!(classified.loop_message()));
                }
            }
        }
    }

    /// Call the model once, streaming text/reasoning deltas and collecting
    /// tool-call events. Returns `(full_text, tool_calls, had_tool_calls)`.
    async fn stream_one_turn(
        &mut self,
        tx: mpsc::Sender<AgentEvent>,
        mode: AgentMode,
        with_tools: bool,
    ) -> anyhow::Result<(String, Vec<ToolCall>, bool)> {
        let tools: Vec<corvid_model::ToolSchema> =
            if with_tools { to_model_tool_schemas(self.tools.schemas_for_mode(mode)) } else { vec![] };

        let req = CompletionRequest {
            messages: self.session.messages.clone(),
            tools,
            stream: true,
            system_dynamic_suffix: self.dynamic_context(),
        };

        let mut stream = self.model.complete(req).await?;

        let mut full_text = String::new();
        let mut tool_call_seen = false;
        let mut reasoning_bufs: HashMap<String, String> = HashMap::new();
        let mut reasoning_order: Vec<String> = Vec::new();
        let mut tool_args: HashMap<String, (String, String)> = HashMap::new(); // id -> (name, args)
        let mut tool_order: Vec<String> = Vec::new();

        while let Some(event) = stream.next().await {
            match event? {
                ResponseEvent::TextStart => {}
                ResponseEvent::TextDelta(delta) => {
                    if tool_call_seen {
                        continue; // text-start after a tool-call is ignored
                    }
                    if !delta.is_empty() {
                        full_text.push_str(&delta);
                        let _ = tx.send(AgentEvent::TextDelta(delta)).await;
                    }
                }
                ResponseEvent::ReasoningStart { id } => {
                    reasoning_order.push(id.clone());
                    reasoning_bufs.entry(id).or_default();
                }
                ResponseEvent::ReasoningDelta { id, text } => {
                    let _ = tx.send(AgentEvent::ThinkingDelta(text.clone())).await;
                    reasoning_bufs.entry(id).or_default().push_str(&text);
                }
                ResponseEvent::ReasoningEnd { id } => {
                    if let Some(text) = reasoning_bufs.get(&id) {
                        if !text.is_empty() {
                            let _ = tx.send(AgentEvent::ThinkingComplete(text.clone())).await;
                        }
                    }
                }
                ResponseEvent::ToolCall { id, name, arguments } => {
                    tool_call_seen = true;
                    if !tool_args.contains_key(&id) {
                        tool_order.push(id.clone());
                    }
                    tool_args.insert(id, (name, arguments));
                }
                ResponseEvent::Usage { input_tokens, output_tokens, cache_read_tokens, cache_write_tokens } => {
                    self.session.add_cache_usage(cache_read_tokens, cache_write_tokens);
                    let actual_input = input_tokens + cache_read_tokens;
                    if actual_input > 0 {
                        let estimated = self.session.token_count + self.session.schema_overhead;
                        self.session.update_calibration(estimated, actual_input);
                    }
                    let _ = tx
                        .send(AgentEvent::TokenUsage {
                            input: input_tokens,
                            output: output_tokens,
                            context_total: self.session.token_count,
                            cache_read: cache_read_tokens,
                            cache_write: cache_write_tokens,
                            cache_read_total: self.session.cache_read_total,
                            cache_write_total: self.session.cache_write_total,
                            max_tokens: self.session.max_output_tokens as u32,
                        })
                        .await;
                }
                ResponseEvent::File { media_type, data } => {
                    let _ = tx.send(AgentEvent::TextDelta(format!("[attachment: {media_type}]"))).await;
                    let _ = data; // attachments are surfaced via the stream sender only; not persisted to history here.
                }
                ResponseEvent::Raw(_) => {}
                ResponseEvent::Done => break,
                ResponseEvent::Error(e) => {
                    anyhow::bail!(e);
                }
            }
        }

        let mut tool_calls = Vec::with_capacity(tool_order.len());
        for id in tool_order {
            let (name, args_buf) = tool_args.remove(&id).unwrap();
            if name.is_empty() {
                warn!(tool_call_id = %id, "dropping tool call with empty name from model");
                continue;
            }
            let args = parse_tool_arguments(&name, &id, &args_buf);
            tool_calls.push(ToolCall { id, name, args });
        }

        if !full_text.is_empty() {
            let _ = tx.send(AgentEvent::TextComplete(full_text.clone())).await;
        }

        let had_tool_calls = !tool_calls.is_empty();
        Ok((full_text, tool_calls, had_tool_calls))
    }

    /// Run a single tool-free turn and return the full text response. Used
    /// for compaction summary generation.
    async fn run_single_turn(&mut self, tx: mpsc::Sender<AgentEvent>, mode: AgentMode) -> anyhow::Result<String> {
        let (text, _, _) = self.stream_one_turn_retrying(tx, mode, false).await?;
        Ok(text)
    }

    /// Estimate the token overhead for items sent with every request but NOT
    /// stored in `session.messages`: tool schemas and the dynamic context block.
    fn estimate_schema_overhead(&self, mode: AgentMode) -> usize {
        let schema_tokens: usize = self
            .tools
            .schemas_for_mode(mode)
            .iter()
            .map(|s| (s.name.len() + s.description.len() + s.parameters.to_string().len()) / 4)
            .sum();
        let dynamic_tokens = self.dynamic_context().map(|s| s.len() / 4).unwrap_or(0);
        schema_tokens + dynamic_tokens
    }

    /// Single compaction entry point. Checks the effective token budget and
    /// compacts the session if needed. Called before every model submission
    /// and after every batch of tool results during the agentic loop.
    ///
    /// Three compaction paths:
    /// - **Normal**: rolling LLM-based compaction (structured or narrative).
    /// - **Emergency**: session too large for a compaction prompt; drops old
    ///   messages without a model call to guarantee recovery.
    /// - **No-op**: effective token count is below the trigger threshold.
    async fn ensure_fits_budget(&mut self, tx: &mpsc::Sender<AgentEvent>, mode: AgentMode, turn: u32) -> anyhow::Result<()> {
        if !self.config.compaction_enabled {
            return Ok(());
        }

        self.session.schema_overhead = self.estimate_schema_overhead(mode);
        let input_budget = self.session.input_budget();
        if input_budget == 0 {
            return Ok(());
        }

        let threshold = (self.config.compaction_threshold - self.config.compaction_overhead_reserve).max(0.1);
        if !self.session.is_near_limit(threshold) {
            return Ok(());
        }

        let tokens_before = self.session.token_count;
        let sys = self.system_message(mode);
        let keep_n = self.config.compaction_keep_recent;

        let non_system: Vec<Message> = self.session.messages.iter().filter(|m| m.role != Role::System).cloned().collect();
        let summarize_count = select_split(&non_system, keep_n);

        let recent_raw_tokens: usize = non_system[summarize_count..].iter().map(|m| m.approx_tokens()).sum();
        let compaction_input_raw = self.session.token_count.saturating_sub(recent_raw_tokens);
        let calibrated_compaction_input = (compaction_input_raw as f32 * self.session.calibration_factor) as usize;
        let emergency_fraction = 0.95_f32;
        let compaction_would_overflow = summarize_count == 0
            || (calibrated_compaction_input as f32 / input_budget as f32) >= emergency_fraction;

        let strategy_used = if compaction_would_overflow {
            emergency_compact(&mut self.session.messages, Some(sys), keep_n);
            self.session.recalculate_tokens();
            CompactionStrategyUsed::Emergency
        } else {
            let original_messages = self.session.messages.clone();
            let original_token_count = self.session.token_count;

            let recent_messages: Vec<Message> = non_system[summarize_count..].to_vec();
            let to_compact: Vec<Message> = non_system[..summarize_count].to_vec();
            let critical = extract_critical_messages(&to_compact);

            let request = build_compaction_request(&to_compact, &critical, &self.config.compaction_strategy);
            self.session.messages = vec![sys.clone(), request];
            self.session.recalculate_tokens();

            match self.run_single_turn(tx.clone(), mode).await {
                Ok(summary) if !summary.trim().is_empty() => {
                    self.session.messages = assemble_compacted_history(Some(sys), &summary, recent_messages);
                    self.session.recalculate_tokens();
                    match self.config.compaction_strategy {
                        CompactionStrategy::Structured => CompactionStrategyUsed::Structured,
                        CompactionStrategy::Narrative => CompactionStrategyUsed::Narrative,
                    }
                }
                outcome => {
                    if let Err(ref e) = outcome {
                        warn!("compaction model call failed, falling back to emergency compact: {e}");
                    } else {
                        warn!("compaction returned empty summary, falling back to emergency compact");
                    }
                    self.session.messages = original_messages;
                    self.session.token_count = original_token_count;
                    emergency_compact(&mut self.session.messages, Some(self.system_message(mode)), keep_n);
                    self.session.recalculate_tokens();
                    CompactionStrategyUsed::Emergency
                }
            }
        };

        let _ = tx
            .send(AgentEvent::ContextCompacted {
                tokens_before,
                tokens_after: self.session.token_count,
                strategy: strategy_used,
                turn,
            })
            .await;

        Ok(())
    }

    /// Returns the system message that will be (or was) used for `mode`.
    pub fn current_system_message(&self, mode: AgentMode) -> Message {
        self.system_message(mode)
    }

    fn system_message(&self, mode: AgentMode) -> Message {
        let ctx = self.prompt_context();
        let stable_ctx = ctx.stable_only();
        let custom = self.runtime.system_prompt_override.as_deref().or(self.config.system_prompt.as_deref());
        Message::system(system_prompt(mode, custom, stable_ctx))
    }

    fn prompt_context(&self) -> crate::prompts::PromptContext<'_> {
        crate::prompts::PromptContext {
            project_root: self.runtime.project_root.as_deref(),
            git_context: self.runtime.git_context_note.as_deref(),
            project_context_file: self.runtime.project_context_file.as_deref(),
            ci_context: self.runtime.ci_context_note.as_deref(),
            append: self.runtime.append_system_prompt.as_deref(),
        }
    }

    /// Volatile context (git + CI) formatted for injection as an uncached
    /// system block. `None` when no dynamic context is configured.
    fn dynamic_context(&self) -> Option<String> {
        if self.runtime.system_prompt_override.is_some() || self.config.system_prompt.is_some() {
            return None;
        }
        self.prompt_context().dynamic_block()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn mode(&self) -> AgentMode {
        *self.current_mode.blocking_lock()
    }

    /// Override the agent's current mode. Takes effect on the next `submit`
    /// call (the new mode is used to build the system message and select
    /// the available tool set).
    pub async fn set_mode(&self, mode: AgentMode) {
        *self.current_mode.lock().await = mode;
    }
}

/// `ToolRegistry::schemas_for_mode` returns the tools-crate's own schema
/// type; the model crate's `CompletionRequest` expects its own (structurally
/// identical) type, so the two must be bridged explicitly.
fn to_model_tool_schemas(schemas: Vec<corvid_tools::ToolSchema>) -> Vec<corvid_model::ToolSchema> {
    schemas
        .into_iter()
        .map(|s| corvid_model::ToolSchema {
            name: s.name,
            description: s.description,
            parameters: s.parameters,
        })
        .collect()
}

fn tool_output_to_result_content(output: &ToolOutput, category: OutputCategory, cap: usize) -> ToolResultContent {
    if output.has_images() {
        let parts: Vec<ToolContentPart> = output
            .parts
            .iter()
            .map(|p| match p {
                ToolOutputPart::Text(t) => ToolContentPart::Text { text: smart_truncate(t, category, cap) },
                ToolOutputPart::Image(url) => ToolContentPart::Image { image_url: url.clone() },
            })
            .collect();
        ToolResultContent::Parts(parts)
    } else {
        ToolResultContent::Text(smart_truncate(&output.content, category, cap))
    }
}

/// Return true when `text` contains tool-call markup that was written by the
/// model into the text stream instead of being emitted as a structured tool
/// call. Some fine-tuned models occasionally fall back to XML-style or
/// Hermes-style function call syntax even when structured tool calls are
/// available.
fn text_contains_malformed_tool_call(text: &str) -> bool {
    text.contains("<tool_call>") || text.contains("</tool_call>") || text.contains("<function=") || text.contains("[TOOL_CALL]")
}

/// Parse accumulated tool-call arguments into a JSON value, repairing common
/// malformed-JSON faults before giving up and substituting an empty object.
/// Anthropic (and most providers) require tool input to be a JSON object;
/// sending `null` causes the *next* completion request to fail.
fn parse_tool_arguments(name: &str, id: &str, args_buf: &str) -> serde_json::Value {
    if args_buf.is_empty() {
        warn!(tool_name = %name, tool_call_id = %id, "model sent tool call with empty arguments; substituting {{}}");
        return serde_json::Value::Object(Default::default());
    }
    match serde_json::from_str(args_buf) {
        Ok(v) => v,
        Err(parse_err) => match attempt_json_repair(args_buf) {
            Ok(v) => {
                warn!(tool_name = %name, tool_call_id = %id, "repaired invalid JSON arguments from model");
                v
            }
            Err(_) => {
                warn!(tool_name = %name, tool_call_id = %id, args_buf, error = %parse_err, "model sent tool call with invalid JSON arguments; substituting {{}}");
                serde_json::Value::Object(Default::default())
            }
        },
    }
}

/// Attempt to repair common JSON syntax errors: invalid escape sequences,
/// missing commas between key-value pairs, and truncated trailing structure.
fn attempt_json_repair(json_str: &str) -> anyhow::Result<serde_json::Value> {
    let fixed = fix_invalid_json_escapes(json_str);
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(&fixed) {
        return Ok(v);
    }

    let repaired = regex::Regex::new(r#""([^"]+)"([a-zA-Z_][a-zA-Z0-9_]*)":\s*"#)
        .unwrap()
        .replace_all(&fixed, r#""$1", "$2": "#);
    if let Ok(v) = serde_json::from_str::<serde_json::Value>(&repaired) {
        return Ok(v);
    }

    if !fixed.trim().ends_with('}') {
        let mut completed = fixed.clone();
        let quote_count = fixed.chars().filter(|&c| c == '"').count();
        if quote_count % 2 == 1 {
            completed.push('"');
        }
        if !completed.trim().ends_with('}') {
            completed.push('}');
        }
        if let Ok(v) = serde_json::from_str::<serde_json::Value>(&completed) {
            return Ok(v);
        }
    }

    anyhow::bail!("JSON repair failed: all repair strategies exhausted")
}

/// Replace any invalid JSON escape sequence inside string values (e.g. `\c`,
/// `\p`) with a properly escaped backslash so the result round-trips through
/// `serde_json`.
fn fix_invalid_json_escapes(json_str: &str) -> String {
    let mut result = String::with_capacity(json_str.len() + 16);
    let mut chars = json_str.chars();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.next() {
                    Some(next) if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') => {
                        result.push('\\');
                        result.push(next);
                    }
                    Some(next) => {
                        result.push('\\');
                        result.push('\\');
                        result.push(next);
                    }
                    None => result.push('\\'),
                },
                '"' => {
                    in_string = false;
                    result.push('"');
                }
                _ => result.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            result.push(c);
        }
    }
    result
}
