// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use serde_json::{json, Value};
use similar::{ChangeTag, TextDiff};
use tracing::debug;

use corvid_config::AgentMode;

use crate::policy::ApprovalPolicy;
use crate::tool::{ConcurrencyClass, Tool, ToolCall, ToolOutput};

/// Upper bound on the number of edits accepted in a single transaction.
const MAX_EDITS: usize = 10;

/// Number of fuzzy-match suggestions surfaced when no region matches.
const MAX_SUGGESTIONS: usize = 3;

// ── Normalization ─────────────────────────────────────────────────────────────

/// Convert CRLF and bare CR to LF. Tabs and spaces are preserved byte-wise.
fn to_lf(s: &str) -> String {
    s.replace("\r\n", "\n").replace('\r', "\n")
}

/// Undo literal escape sequences a model sometimes emits instead of real
/// control characters (`\n`, `\t`, `\r`, `\"`) in an `old` string.
fn unescape_sequences(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.peek() {
                Some('n') => { out.push('\n'); chars.next(); }
                Some('t') => { out.push('\t'); chars.next(); }
                Some('r') => { out.push('\r'); chars.next(); }
                Some('"') => { out.push('"'); chars.next(); }
                _ => out.push(c),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Strip leading whitespace from every line.
fn trim_leading_whitespace(s: &str) -> String {
    s.lines().map(|l| l.trim_start()).collect::<Vec<_>>().join("\n")
}

/// Collapse every run of spaces/tabs into a single space, so tab/space
/// conventions don't prevent an otherwise-identical region from matching.
fn normalize_whitespace_class(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_run = false;
    for c in s.chars() {
        if c == ' ' || c == '\t' {
            if !in_run {
                out.push(' ');
                in_run = true;
            }
        } else {
            out.push(c);
            in_run = false;
        }
    }
    out
}

// ── Matching ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum MatchResult {
    /// `old` (already LF-normalized) is a byte substring of `content`.
    Exact { corrected: String, occurrences: usize },
    /// A tolerant normalization found exactly one matching region.
    Smart { corrected: String },
    /// No normalization produced a unique region.
    None,
}

fn count_occurrences(content: &str, needle: &str) -> usize {
    if needle.is_empty() {
        return 0;
    }
    content.matches(needle).count()
}

/// Search `content` for line-windows matching `old` once both are passed
/// through `normalize`. Returns the distinct raw window texts found.
fn normalized_window_matches(content: &str, old: &str, normalize: fn(&str) -> String) -> Vec<String> {
    let norm_old = normalize(old);
    let old_line_count = old.lines().count().max(1);
    let content_lines: Vec<&str> = content.lines().collect();
    if content_lines.len() < old_line_count {
        return Vec::new();
    }
    let mut hits: Vec<String> = Vec::new();
    for i in 0..=(content_lines.len() - old_line_count) {
        let window = content_lines[i..i + old_line_count].join("\n");
        if normalize(&window) == norm_old && !hits.contains(&window) {
            hits.push(window);
        }
    }
    hits
}

/// Smart-match `old` against `content` (both assumed already LF-normalized).
fn smart_match(content: &str, old: &str) -> MatchResult {
    if content.contains(old) {
        return MatchResult::Exact {
            corrected: old.to_string(),
            occurrences: count_occurrences(content, old),
        };
    }

    // Cascade 1: escape-sequence conversion, checked as a direct substring match.
    let unescaped = unescape_sequences(old);
    if unescaped != old && content.contains(&unescaped) {
        let occurrences = count_occurrences(content, &unescaped);
        if occurrences == 1 {
            return MatchResult::Smart { corrected: unescaped };
        }
    }

    // Cascade 2: leading-whitespace trimming, window-based (old may span
    // multiple lines with indentation the model dropped).
    let hits = normalized_window_matches(content, &unescaped, trim_leading_whitespace);
    if hits.len() == 1 {
        return MatchResult::Smart { corrected: hits.into_iter().next().unwrap() };
    }

    // Cascade 3: tab/space class normalization.
    let hits = normalized_window_matches(content, &unescaped, normalize_whitespace_class);
    if hits.len() == 1 {
        return MatchResult::Smart { corrected: hits.into_iter().next().unwrap() };
    }

    MatchResult::None
}

/// Similarity ratio in [0,1] using character-level diff (2×matches / total).
fn similarity_ratio(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    let diff = TextDiff::from_chars(a, b);
    let matching: usize = diff
        .iter_all_changes()
        .filter(|c| c.tag() == ChangeTag::Equal)
        .map(|c| c.value().len())
        .sum();
    (matching * 2) as f64 / total as f64
}

/// Up to `MAX_SUGGESTIONS` windows in `content` most similar to `old`,
/// sorted by descending similarity. Used to build actionable error text.
fn fuzzy_suggestions(content: &str, old: &str) -> Vec<(f64, String)> {
    let n = old.lines().count().max(1);
    let content_lines: Vec<&str> = content.lines().collect();
    if content_lines.len() < n {
        return Vec::new();
    }
    let mut candidates: Vec<(f64, String)> = content_lines
        .windows(n)
        .map(|win| {
            let text = win.join("\n");
            (similarity_ratio(old, &text), text)
        })
        .filter(|(r, _)| *r > 0.3)
        .collect();
    candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    candidates.dedup_by(|a, b| a.1 == b.1);
    candidates.truncate(MAX_SUGGESTIONS);
    candidates
}

fn replace_first(content: &str, old: &str, new: &str) -> String {
    match content.find(old) {
        Some(idx) => {
            let mut out = String::with_capacity(content.len());
            out.push_str(&content[..idx]);
            out.push_str(new);
            out.push_str(&content[idx + old.len()..]);
            out
        }
        None => content.to_string(),
    }
}

// ── Transaction ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct PlannedEdit {
    old: String,
    new: String,
    description: Option<String>,
    replace_all: bool,
}

#[derive(Debug)]
struct AppliedEdit {
    occurrences: usize,
    used_smart_match: bool,
}

/// Parse and validate the raw `edits` JSON array. Enforces every precondition
/// that must hold before the transaction is attempted.
fn parse_edits(value: &Value) -> Result<Vec<PlannedEdit>, String> {
    let arr = value
        .as_array()
        .ok_or_else(|| "'edits' must be an array".to_string())?;

    if arr.is_empty() {
        return Err("'edits' must contain at least one edit".to_string());
    }
    if arr.len() > MAX_EDITS {
        return Err(format!("'edits' contains {} entries; at most {MAX_EDITS} allowed", arr.len()));
    }

    let mut edits = Vec::with_capacity(arr.len());
    for (i, item) in arr.iter().enumerate() {
        let old = item
            .get("old")
            .and_then(|v| v.as_str())
            .ok_or_else(|| format!("edit {}: missing 'old'", i + 1))?;
        let new = item
            .get("new")
            .and_then(|v| v.as_str())
            .ok_or_else(|| format!("edit {}: missing 'new'", i + 1))?;
        if old.trim().is_empty() {
            return Err(format!("edit {}: 'old' must not be empty", i + 1));
        }
        if old == new {
            return Err(format!("edit {}: 'old' and 'new' are identical", i + 1));
        }
        let description = item
            .get("description")
            .and_then(|v| v.as_str())
            .map(str::to_string);
        let replace_all = item.get("replace_all").and_then(|v| v.as_bool()).unwrap_or(false);

        edits.push(PlannedEdit {
            old: to_lf(old),
            new: to_lf(new),
            description,
            replace_all,
        });
    }

    for i in 0..edits.len() {
        for j in (i + 1)..edits.len() {
            if edits[i].old == edits[j].old && edits[i].new == edits[j].new {
                return Err(format!("edits {} and {} are identical", i + 1, j + 1));
            }
        }
    }

    Ok(edits)
}

/// Apply `edits` sequentially to `original`. On any `none` match the whole
/// transaction aborts and `original` is returned unchanged alongside an
/// error naming the failed edit and fuzzy-match suggestions.
fn apply_transaction(
    original: &str,
    edits: &[PlannedEdit],
) -> Result<(String, Vec<AppliedEdit>), String> {
    let mut current = original.to_string();
    let mut applied = Vec::with_capacity(edits.len());

    for (i, edit) in edits.iter().enumerate() {
        match smart_match(&current, &edit.old) {
            MatchResult::Exact { corrected, occurrences } => {
                current = if edit.replace_all {
                    current.replace(&corrected, &edit.new)
                } else {
                    replace_first(&current, &corrected, &edit.new)
                };
                applied.push(AppliedEdit { occurrences, used_smart_match: false });
            }
            MatchResult::Smart { corrected } => {
                current = if edit.replace_all {
                    current.replace(&corrected, &edit.new)
                } else {
                    replace_first(&current, &corrected, &edit.new)
                };
                applied.push(AppliedEdit { occurrences: 1, used_smart_match: true });
            }
            MatchResult::None => {
                let label = edit
                    .description
                    .clone()
                    .unwrap_or_else(|| format!("edit {}", i + 1));
                let mut msg = format!("{label}: no unique match for the given text.\nExpected:\n");
                for line in edit.old.lines() {
                    msg.push_str(&format!("  |{line}|\n"));
                }
                let suggestions = fuzzy_suggestions(&current, &edit.old);
                if suggestions.is_empty() {
                    msg.push_str("No similar region found.");
                } else {
                    msg.push_str("Closest candidates:\n");
                    for (ratio, text) in &suggestions {
                        msg.push_str(&format!("--- similarity {:.0}% ---\n", ratio * 100.0));
                        for line in text.lines() {
                            msg.push_str(&format!("  |{line}|\n"));
                        }
                    }
                }
                msg.push_str("Re-read the file and retry with corrected text.");
                return Err(msg);
            }
        }
    }

    Ok((current, applied))
}

// ── Tool ──────────────────────────────────────────────────────────────────────

pub struct EditFileTool;

#[async_trait]
impl Tool for EditFileTool {
    fn name(&self) -> &str {
        "edit_file"
    }

    fn description(&self) -> &str {
        "Make exact string replacements in a file.\n\n\
         Supply a list of `{old, new, description?}` edits (up to 10); each `old` must be \
         unique within the file unless `replace_all` is set, and is replaced literally — no \
         regex interpretation. Edits apply sequentially to the same working copy, so later \
         edits see the effect of earlier ones.\n\n\
         If the exact text isn't found, a tolerant cascade (escaped `\\n`/`\\t`, leading \
         whitespace, tab/space differences) is tried before giving up. If no edit produces a \
         unique match, the whole transaction is aborted and the file is left untouched; the \
         error names the failing edit and shows the closest candidate regions.\n\n\
         For new files use the `write` tool instead — `edit_file` requires the file to already \
         exist."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "Absolute or relative path to the file to edit"
                },
                "edits": {
                    "type": "array",
                    "description": "List of edits to apply sequentially (max 10)",
                    "minItems": 1,
                    "maxItems": MAX_EDITS,
                    "items": {
                        "type": "object",
                        "properties": {
                            "old": {
                                "type": "string",
                                "description": "Exact text to find and replace"
                            },
                            "new": {
                                "type": "string",
                                "description": "Replacement text"
                            },
                            "description": {
                                "type": "string",
                                "description": "Optional short label for this edit, used in error messages"
                            },
                            "replace_all": {
                                "type": "boolean",
                                "description": "Replace every occurrence instead of just the first (default false)"
                            }
                        },
                        "required": ["old", "new"],
                        "additionalProperties": false
                    }
                }
            },
            "required": ["path", "edits"],
            "additionalProperties": false
        })
    }

    fn default_policy(&self) -> ApprovalPolicy {
        ApprovalPolicy::Ask
    }

    fn modes(&self) -> &[AgentMode] {
        &[AgentMode::Agent]
    }

    fn concurrency_class(&self) -> ConcurrencyClass {
        ConcurrencyClass::Edit
    }

    fn target_file(&self, call: &ToolCall) -> Option<String> {
        call.args.get("path").and_then(|v| v.as_str()).map(str::to_string)
    }

    async fn execute(&self, call: &ToolCall) -> ToolOutput {
        let path = match call.args.get("path").and_then(|v| v.as_str()) {
            Some(s) => s.to_string(),
            None => return ToolOutput::err(&call.id, "Missing required parameter: path"),
        };
        let edits_value = match call.args.get("edits") {
            Some(v) => v,
            None => return ToolOutput::err(&call.id, "Missing required parameter: edits"),
        };

        let edits = match parse_edits(edits_value) {
            Ok(e) => e,
            Err(e) => return ToolOutput::err(&call.id, e),
        };

        debug!(path = %path, edits = edits.len(), "edit_file tool");

        let original = match tokio::fs::read_to_string(&path).await {
            Ok(c) => to_lf(&c),
            Err(e) => {
                return ToolOutput::err(
                    &call.id,
                    format!("cannot read {path}: {e}. Use the write tool to create a new file."),
                )
            }
        };

        let (final_content, applied) = match apply_transaction(&original, &edits) {
            Ok(r) => r,
            Err(e) => return ToolOutput::err(&call.id, e),
        };

        if let Err(e) = tokio::fs::write(&path, &final_content).await {
            return ToolOutput::err(&call.id, format!("write failed: {e}"));
        }

        let total_occurrences: usize = applied.iter().map(|a| a.occurrences).sum();
        let smart_matched = applied.iter().filter(|a| a.used_smart_match).count();
        let mut summary = format!(
            "Applied {} edit(s) to {path} ({total_occurrences} occurrence(s) replaced)",
            applied.len()
        );
        if smart_matched > 0 {
            summary.push_str(&format!("; {smart_matched} used fuzzy text matching"));
        }
        summary.push('.');

        ToolOutput::ok(&call.id, summary)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
