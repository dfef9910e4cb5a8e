// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Message Compactor.
//!
//! Proactive context compaction: when a session's token usage crosses the
//! configured threshold, the oldest portion of the history is replaced with
//! a single model-generated summary while the most recent turns are kept
//! verbatim. [`select_split`] finds a safe boundary (never inside a
//! tool-call/tool-result pair), [`build_compaction_request`] produces the
//! one-shot summarization prompt, and [`assemble_compacted_history`]
//! reassembles the session once the summary text comes back.

use corvid_config::CompactionStrategy;
use corvid_model::{Message, MessagePart, Role, ToolResultContent};
use corvid_tools::OutputCategory;

/// Marker prefix on the synthetic user message that carries a previous
/// compaction's summary, so a later compaction pass can recognise and skip
/// it rather than re-summarising an already-compacted prefix.
pub const SUMMARY_MARKER: &str = "[Previous conversation summary]";

/// Tool names whose most recent call/result pair is always preserved across
/// compaction, regardless of where the summarisation boundary falls. Closed
/// rather than configurable: see DESIGN.md for the rationale.
pub const CRITICAL_TOOLS: &[&str] = &["todo_write", "exit_plan_mode"];

// ─── Compaction prompts ───────────────────────────────────────────────────────

const NARRATIVE_PROMPT: &str =
    "You are a context compaction assistant. Summarise the following conversation history \
     in a concise, information-dense way. Preserve all technical details, decisions, file \
     names, code snippets, and tool outputs that may be relevant to future work. \
     The summary will replace the original history to free up context space.";

/// Exact section set and order required of a structured compaction summary.
pub const STRUCTURED_SECTIONS: &[&str] = &[
    "Primary Request and Intent",
    "Key Technical Concepts",
    "Files and Code Sections",
    "Errors and Fixes",
    "Problem Solving",
    "All User Messages",
    "Pending Tasks",
    "Current Work",
];

const STRUCTURED_COMPACTION_PROMPT: &str = "\
Your task is to create a detailed summary of the conversation so far, paying close \
attention to the user's explicit requests and your previous actions. This summary should \
be thorough in capturing technical details, code patterns, and architectural decisions \
that would be essential for continuing development work without losing context.

Before providing your final summary, wrap your analysis in <analysis> tags to organize \
your thoughts, making sure to cover all the points instructed below.

Your summary should include the following sections, numbered and titled exactly as below:

1. Primary Request and Intent: Capture all of the user's explicit requests and intents in \
detail.
2. Key Technical Concepts: List all important technical concepts, technologies, and \
frameworks discussed.
3. Files and Code Sections: Enumerate specific files and code sections examined, modified, \
or created. Pay special attention to the most recent changes.
4. Errors and Fixes: List all errors encountered and how they were fixed, including any \
specific user feedback received about them.
5. Problem Solving: Document problems solved so far and any ongoing troubleshooting.
6. All User Messages: List every explicit user message, excluding tool results, so the \
exact intent of each user turn is preserved.
7. Pending Tasks: Outline any pending tasks explicitly requested.
8. Current Work: Describe in detail precisely what was being worked on immediately before \
this summary request.

Output only the <analysis> block followed by the numbered sections; do not add commentary \
before or after.";

// ─── Boundary selection ─────────────────────────────────────────────────────

/// Number of leading (oldest) non-system messages to summarise, given a
/// request to keep `keep_recent` recent turns.
///
/// Moves the split backward past any `ToolCall`/`ToolResult` message so the
/// preserved tail never begins mid-pair and the summarised prefix never ends
/// with an orphaned tool result.
pub fn select_split(non_system: &[Message], keep_recent: usize) -> usize {
    if non_system.len() <= keep_recent * 2 {
        return 0;
    }
    let mut summarize_count = non_system.len().saturating_sub(keep_recent);
    while summarize_count > 0 && summarize_count < non_system.len() {
        let has_tool_parts = non_system[summarize_count]
            .parts
            .iter()
            .any(|p| matches!(p, MessagePart::ToolCall { .. } | MessagePart::ToolResult { .. }));
        if has_tool_parts {
            summarize_count -= 1;
        } else {
            break;
        }
    }
    summarize_count
}

/// Find, within `to_compact`, the most recent call/result message pair for
/// each name in `CRITICAL_TOOLS`, in the order the tools are listed. A tool
/// with no call in `to_compact` contributes nothing.
pub fn extract_critical_messages(to_compact: &[Message]) -> Vec<Message> {
    let mut out = Vec::new();
    for &name in CRITICAL_TOOLS {
        let call_idx = to_compact.iter().rposition(|m| {
            m.role == Role::Assistant
                && m.parts
                    .iter()
                    .any(|p| matches!(p, MessagePart::ToolCall { tool_name, .. } if tool_name == name))
        });
        let Some(idx) = call_idx else { continue };
        out.push(to_compact[idx].clone());
        if let Some(result) = to_compact[idx + 1..].iter().find(|m| {
            m.role == Role::Tool
                && m.parts
                    .iter()
                    .any(|p| matches!(p, MessagePart::ToolResult { tool_name, .. } if tool_name == name))
        }) {
            out.push(result.clone());
        }
    }
    out
}

// ─── Request construction ───────────────────────────────────────────────────

/// Build the single-shot, tool-free user message that asks the compaction
/// model for a summary of `to_compact`. `critical` messages (if any) are
/// appended as a "preserve verbatim" appendix so the compaction model can
/// reference them without needing them re-summarised.
pub fn build_compaction_request(
    to_compact: &[Message],
    critical: &[Message],
    strategy: &CompactionStrategy,
) -> Message {
    let prompt = match strategy {
        CompactionStrategy::Structured => STRUCTURED_COMPACTION_PROMPT,
        CompactionStrategy::Narrative => NARRATIVE_PROMPT,
    };
    let history_text = serialize_history(to_compact);
    let mut body = format!("{prompt}\n\n---\n\n{history_text}");
    if !critical.is_empty() {
        let critical_text = serialize_history(critical);
        body.push_str(&format!(
            "\n\n---\n\nThe following tool interactions must be reflected accurately in \
             your summary regardless of where they fall in the history above:\n\n{critical_text}"
        ));
    }
    Message::user(body)
}

/// Replace `messages` in place with just the system message (if any) and the
/// compaction request for `to_compact`, using `strategy`. Returns the
/// original message count.
///
/// The caller is responsible for invoking the model on the resulting
/// messages and passing the response text to
/// [`assemble_compacted_history`].
pub fn compact_session_with_strategy(
    messages: &mut Vec<Message>,
    system_msg: Option<Message>,
    strategy: &CompactionStrategy,
) -> usize {
    let before = messages.len();
    let non_system: Vec<Message> = messages.iter().filter(|m| m.role != Role::System).cloned().collect();
    let request = build_compaction_request(&non_system, &[], strategy);
    messages.clear();
    if let Some(sys) = system_msg {
        messages.push(sys);
    }
    messages.push(request);
    before
}

// ─── Response parsing & assembly ───────────────────────────────────────────

/// A compaction summary parsed out of the compaction model's raw response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedSummary {
    /// Contents of a leading `<analysis>...</analysis>` block, if present.
    pub analysis: Option<String>,
    /// `(title, body)` pairs found via the numbered-heading grammar
    /// (`^\s*N[.)-]\s*Title:\s*`). Empty when the response used neither the
    /// numbered grammar nor a bare "Summary" fallback.
    pub sections: Vec<(String, String)>,
    /// The full response with only the `<analysis>` block stripped, used
    /// verbatim when no numbered sections are recognised.
    pub body: String,
}

/// Parse a compaction model's raw text response.
///
/// Recognises an optional leading `<analysis>...</analysis>` block, then
/// splits the remainder on lines matching `^\s*N[.)-]\s*Title:\s*` (e.g.
/// `"1. Primary Request and Intent:"`, `"2) Key Technical Concepts:"`). If no
/// numbered heading is found but the response contains a single bare
/// `Summary:` heading, that is used as the sole section. Otherwise the whole
/// (analysis-stripped) response becomes `body` with no sections.
pub fn parse_summary(raw: &str) -> ParsedSummary {
    let heading_re =
        regex::Regex::new(r"(?m)^\s*(?:\d+[.)-]\s*(.+?)|Summary)\s*:\s*$").unwrap();

    let (analysis, rest) = extract_analysis_block(raw);

    let mut sections = Vec::new();
    let mut matches: Vec<(usize, usize, String)> = Vec::new();
    for cap in heading_re.captures_iter(&rest) {
        let m = cap.get(0).unwrap();
        let title = cap
            .get(1)
            .map(|g| g.as_str().trim().to_string())
            .unwrap_or_else(|| "Summary".to_string());
        matches.push((m.start(), m.end(), title));
    }
    for (i, (_, end, title)) in matches.iter().enumerate() {
        let body_end = matches.get(i + 1).map(|(s, _, _)| *s).unwrap_or(rest.len());
        let body = rest[*end..body_end].trim().to_string();
        sections.push((title.clone(), body));
    }

    ParsedSummary { analysis, sections, body: rest.trim().to_string() }
}

fn extract_analysis_block(raw: &str) -> (Option<String>, String) {
    let trimmed = raw.trim_start();
    if let Some(after_open) = trimmed.strip_prefix("<analysis>") {
        if let Some(close) = after_open.find("</analysis>") {
            let analysis = after_open[..close].trim().to_string();
            let rest = after_open[close + "</analysis>".len()..].to_string();
            return (Some(analysis), rest);
        }
    }
    (None, raw.to_string())
}

/// Rebuild the session's message list after a successful compaction call:
/// system prompt, then a synthetic user message carrying the summary
/// (prefixed with [`SUMMARY_MARKER`]), then an assistant acknowledgment, then
/// `preserved` with any earlier summary-carrying user message filtered out
/// (a session compacted twice must not accumulate nested summaries).
pub fn assemble_compacted_history(
    system: Option<Message>,
    summary_raw: &str,
    preserved: Vec<Message>,
) -> Vec<Message> {
    let mut out = Vec::with_capacity(preserved.len() + 3);
    if let Some(sys) = system {
        out.push(sys);
    }
    out.push(Message::user(format!("{SUMMARY_MARKER}\n\n{summary_raw}")));
    out.push(Message::assistant(
        "Understood. I have the prior context summarized above and will continue from there.",
    ));
    out.extend(
        preserved
            .into_iter()
            .filter(|m| !(m.role == Role::User && is_summary_message(m))),
    );
    out
}

fn is_summary_message(m: &Message) -> bool {
    m.as_text().map(|t| t.starts_with(SUMMARY_MARKER)).unwrap_or(false)
}

/// Emergency fallback compaction used when the session is too large to fit
/// even a compaction prompt within the context window.
///
/// Drops all but the last `keep_n` non-system messages and prepends a canned
/// notice. No model call is made — this is a purely deterministic operation
/// that always succeeds regardless of session size.
pub fn emergency_compact(messages: &mut Vec<Message>, system_msg: Option<Message>, keep_n: usize) -> usize {
    let before = messages.len();
    let non_system: Vec<Message> = messages.iter().filter(|m| m.role != Role::System).cloned().collect();
    let keep = keep_n.min(non_system.len());
    let preserved: Vec<Message> = non_system[non_system.len() - keep..].to_vec();
    let notice = Message::assistant(
        "[Context emergency-compacted: earlier history was dropped to prevent a \
         context-window overflow. The agent may lack full context for earlier \
         decisions. Proceed carefully and ask the user to re-provide any missing \
         requirements if needed.]",
    );
    messages.clear();
    if let Some(sys) = system_msg {
        messages.push(sys);
    }
    messages.push(notice);
    messages.extend(preserved);
    before
}

/// Deterministic, content-aware tool-result truncation.
///
/// Returns `content` unchanged when it fits within `cap_tokens`.
/// Otherwise applies a category-specific extraction strategy that preserves
/// the most useful portion of the output. Dispatching on [`OutputCategory`]
/// (not on tool names) keeps this function independent of the tools crate's
/// concrete tool list; each tool declares its own category.
///
/// - [`OutputCategory::HeadTail`]: keep the first 60 + last 40 lines so both
///   the command preamble and the final result are visible.
/// - [`OutputCategory::MatchList`]: keep leading matches (highest relevance
///   first); the tail is not preserved because later matches are less relevant.
/// - [`OutputCategory::FileContent`]: balanced head + tail with a separator,
///   preserving both the imports/declarations and the most recent changes.
/// - [`OutputCategory::Generic`]: hard-truncate at the nearest line boundary.
///
/// Every truncated result ends with an explicit notice so the model knows
/// that additional content exists and how to retrieve it.
pub fn smart_truncate(content: &str, category: OutputCategory, cap_tokens: usize) -> String {
    if cap_tokens == 0 {
        return content.to_string();
    }
    let cap_chars = cap_tokens * 4;
    if content.len() <= cap_chars {
        return content.to_string();
    }
    let omitted_bytes = content.len().saturating_sub(cap_chars);
    match category {
        OutputCategory::HeadTail => head_tail_lines(
            content,
            cap_chars,
            60,
            40,
            &format!("[... {{lines}} lines / {omitted_bytes} bytes omitted ...]"),
        ),
        OutputCategory::MatchList => head_lines(
            content,
            cap_chars,
            &format!(
                "[... {{lines}} more matches omitted ({omitted_bytes} bytes); \
                     use a more specific pattern to see them ...]"
            ),
        ),
        OutputCategory::FileContent => head_tail_lines(
            content,
            cap_chars,
            usize::MAX,
            usize::MAX,
            &format!(
                "[... {{lines}} lines omitted ({omitted_bytes} bytes); \
                     use read_file with offset/limit to see more ...]"
            ),
        ),
        OutputCategory::Generic => {
            let cut = content[..cap_chars].rfind('\n').map(|p| p + 1).unwrap_or(cap_chars);
            format!(
                "{}\n[... {omitted_bytes} bytes omitted; \
                 content truncated to fit context budget ...]",
                &content[..cut]
            )
        }
    }
}

// ─── Private helpers ──────────────────────────────────────────────────────────

/// Serialise a message list into plain text for inclusion in a compaction prompt.
fn serialize_history(messages: &[Message]) -> String {
    messages
        .iter()
        .filter(|m| !matches!(m.role, Role::System))
        .map(|m| {
            let role = match m.role {
                Role::User => "User",
                Role::Assistant => "Assistant",
                Role::Tool => "Tool",
                Role::System => "System",
            };
            let text = m
                .parts
                .iter()
                .map(|p| match p {
                    MessagePart::Text { text } => text.clone(),
                    MessagePart::Reasoning { text } => format!("[reasoning: {text}]"),
                    MessagePart::ToolCall { tool_name, input, .. } => {
                        format!("[tool_call: {tool_name}({input})]")
                    }
                    MessagePart::ToolResult { tool_name, content, .. } => match content {
                        ToolResultContent::Text(t) => format!("[tool_result {tool_name}: {t}]"),
                        ToolResultContent::Parts(_) => {
                            format!("[tool_result {tool_name}: {content}]")
                        }
                    },
                    MessagePart::File { media_type, .. } => format!("[{media_type} attachment]"),
                })
                .collect::<Vec<_>>()
                .join(" ");
            format!("{role}: {text}")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Keep only the leading lines that fit within `cap_chars`.
fn head_lines(content: &str, cap_chars: usize, notice_template: &str) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let mut kept = String::with_capacity(cap_chars);
    let mut kept_count = 0usize;
    for line in &lines {
        let needed = if kept.is_empty() { line.len() } else { line.len() + 1 };
        if kept.len() + needed > cap_chars {
            break;
        }
        if !kept.is_empty() {
            kept.push('\n');
        }
        kept.push_str(line);
        kept_count += 1;
    }
    let omitted = lines.len().saturating_sub(kept_count);
    if omitted == 0 {
        return content[..cap_chars.min(content.len())].to_string();
    }
    let notice = notice_template.replace("{lines}", &omitted.to_string());
    format!("{kept}\n{notice}")
}

/// Keep `max_head` leading lines and `max_tail` trailing lines, inserting a
/// notice between them. Pass `usize::MAX` to split evenly by character budget.
fn head_tail_lines(
    content: &str,
    cap_chars: usize,
    max_head: usize,
    max_tail: usize,
    notice_template: &str,
) -> String {
    let lines: Vec<&str> = content.lines().collect();
    let half_cap = cap_chars / 2;

    let mut head = String::with_capacity(half_cap);
    let mut head_count = 0usize;
    for line in lines.iter().take(max_head) {
        let needed = if head.is_empty() { line.len() } else { line.len() + 1 };
        if head.len() + needed > half_cap {
            break;
        }
        if !head.is_empty() {
            head.push('\n');
        }
        head.push_str(line);
        head_count += 1;
    }

    let mut tail_lines: Vec<&str> = Vec::new();
    let mut tail_chars = 0usize;
    for line in lines.iter().rev().take(max_tail) {
        let needed = if tail_lines.is_empty() { line.len() } else { line.len() + 1 };
        if tail_chars + needed > half_cap {
            break;
        }
        tail_chars += needed;
        tail_lines.push(line);
    }
    tail_lines.reverse();
    let tail_count = tail_lines.len();
    let tail = tail_lines.join("\n");

    let omitted = lines.len().saturating_sub(head_count + tail_count);
    if omitted == 0 {
        return content[..cap_chars.min(content.len())].to_string();
    }
    let notice = notice_template.replace("{lines}", &omitted.to_string());
    format!("{head}\n{notice}\n{tail}")
}

// ─── Unit tests ───────────────────────────────────────────────────────────────
