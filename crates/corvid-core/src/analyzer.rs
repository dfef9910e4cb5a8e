// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Tool Dependency Analyzer.
//!
//! Partitions a batch of tool calls requested in a single model turn into an
//! ordered [`ExecutionPlan`] of phases. Each phase may be dispatched with
//! full internal concurrency; phases themselves run strictly in order.
//!
//! Grouping rule: walk the call list and cut it into maximal runs of
//! adjacent calls sharing the same scheduling category (`Read` / mutator
//! `Write`+`Edit` / `Other{may_parallel}`). Each run becomes its own group,
//! processed independently:
//!
//! - A `Read` run becomes one phase — reads never conflict with each other.
//! - A mutator run (`Write`/`Edit` calls, treated as one class) is packed by
//!   first-fit bin packing on [`corvid_tools::Tool::target_file`]: two calls
//!   may share a phase only when both declare a target file and the files
//!   differ. A call with no declared target file conflicts with everything
//!   in its bin.
//! - An `Other { may_parallel: true }` run becomes one phase.
//! - An `Other { may_parallel: false }` run becomes one phase per call, in
//!   order — these calls must never overlap with each other or anything else.
//!
//! Phases are emitted in group traversal order, so cross-group ordering is
//! exactly the order in which the model emitted the calls.

use corvid_tools::{ConcurrencyClass, ToolCall, ToolRegistry};

/// An ordered batch of phases; each phase's calls may run concurrently, but
/// phases themselves are strictly sequenced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecutionPlan {
    pub phases: Vec<Vec<ToolCall>>,
}

impl ExecutionPlan {
    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Total number of calls across all phases — used to assert the plan is
    /// a total partition of the input (testable property: plan-partition
    /// totality).
    pub fn call_count(&self) -> usize {
        self.phases.iter().map(|p| p.len()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupKind {
    Read,
    Mutate,
    OtherParallel,
    OtherSerial,
}

fn classify(registry: &ToolRegistry, call: &ToolCall) -> GroupKind {
    let class = registry
        .get(&call.name)
        .map(|t| t.concurrency_class())
        .unwrap_or(ConcurrencyClass::Other { may_parallel: false });
    match class {
        ConcurrencyClass::Read => GroupKind::Read,
        ConcurrencyClass::Write | ConcurrencyClass::Edit => GroupKind::Mutate,
        ConcurrencyClass::Other { may_parallel: true } => GroupKind::OtherParallel,
        ConcurrencyClass::Other { may_parallel: false } => GroupKind::OtherSerial,
    }
}

/// Normalize path separators for conflict comparison. Case is preserved —
/// the analyzer's job is to catch the same logical path spelled two ways
/// with different separators, not to second-guess a case-sensitive
/// filesystem.
fn normalize_path(path: &str) -> String {
    path.replace('\\', "/")
}

fn target_file(registry: &ToolRegistry, call: &ToolCall) -> Option<String> {
    registry
        .get(&call.name)
        .and_then(|t| t.target_file(call))
        .map(|p| normalize_path(&p))
}

/// Greedy first-fit packing of a mutator run into conflict-free phases.
fn pack_mutators(registry: &ToolRegistry, group: &[ToolCall]) -> Vec<Vec<ToolCall>> {
    let mut bins: Vec<Vec<ToolCall>> = Vec::new();
    let mut bin_targets: Vec<Vec<Option<String>>> = Vec::new();

    for call in group {
        let tf = target_file(registry, call);
        let mut placed = false;
        for (bin, targets) in bins.iter_mut().zip(bin_targets.iter_mut()) {
            let conflicts = targets
                .iter()
                .any(|t| t.is_none() || tf.is_none() || t == &tf);
            if !conflicts {
                bin.push(call.clone());
                targets.push(tf.clone());
                placed = true;
                break;
            }
        }
        if !placed {
            bins.push(vec![call.clone()]);
            bin_targets.push(vec![tf.clone()]);
        }
    }

    bins
}

/// Build the execution plan for one batch of tool calls.
pub fn plan(calls: &[ToolCall], registry: &ToolRegistry) -> ExecutionPlan {
    let mut phases: Vec<Vec<ToolCall>> = Vec::new();
    let mut i = 0;
    while i < calls.len() {
        let kind = classify(registry, &calls[i]);
        let mut j = i + 1;
        while j < calls.len() && classify(registry, &calls[j]) == kind {
            j += 1;
        }
        let group = &calls[i..j];
        match kind {
            GroupKind::Read | GroupKind::OtherParallel => phases.push(group.to_vec()),
            GroupKind::OtherSerial => {
                for call in group {
                    phases.push(vec![call.clone()]);
                }
            }
            GroupKind::Mutate => phases.extend(pack_mutators(registry, group)),
        }
        i = j;
    }
    ExecutionPlan { phases }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
