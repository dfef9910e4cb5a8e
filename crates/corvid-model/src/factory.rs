// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Resolves a [`corvid_config::ModelConfig`] into a concrete [`ModelProvider`].
//!
//! Real HTTP drivers (OpenAI, Anthropic, ...) are external collaborators and
//! are not implemented in this crate (see the crate-level docs); the only
//! provider this factory can actually construct is `mock`, which is useful
//! for dry runs and for exercising the agent loop without network access.

use std::sync::Arc;

use corvid_config::ModelConfig;

use crate::{MockProvider, ModelProvider};

/// Construct the provider named by `config.provider`.
///
/// Currently only `"mock"` is resolvable in-tree. Any other provider name
/// fails fast with a descriptive error rather than silently falling back,
/// per the `model-unavailable` error kind.
pub fn from_config(config: &ModelConfig) -> anyhow::Result<Arc<dyn ModelProvider>> {
    match config.provider.as_str() {
        "mock" => Ok(Arc::new(MockProvider)),
        other => anyhow::bail!(
            "no provider adapter registered for {other:?}; live model provider drivers are \
             external collaborators not bundled with this crate — implement `ModelProvider` \
             and construct it where this factory is called"
        ),
    }
}
