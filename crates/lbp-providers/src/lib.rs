// SPDX-License-Identifier: MIT OR Apache-2.0
//! Provider adapter.
//!
//! A [`Provider`] groups one or more base URLs serving the same
//! `(backend_kind, model_name)` pair behind one capability surface.
//! [`ProviderAdapter::build`] is meant to be called fresh on every resolve —
//! it holds no state across calls.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use lbp_core::{Backend, BackendKind, Capability, LlmState, Model, PulledModelStatus};
use std::collections::BTreeMap;

/// A declared cloud backend plus the models it is configured to serve.
/// Cloud providers are not reconciled (there is nothing to pull); they come
/// straight from configuration and expose a fixed canonical endpoint.
#[derive(Debug, Clone)]
pub struct CloudProviderConfig {
    /// The cloud backend record (kind must be [`BackendKind::CloudA`] or
    /// [`BackendKind::CloudB`]).
    pub backend: Backend,
    /// Models this backend is configured to serve.
    pub models: Vec<Model>,
}

/// One resolvable serving option: a backend kind and model name, the base
/// URLs that currently serve it, and the capabilities that kind supports.
#[derive(Debug, Clone, PartialEq)]
pub struct Provider {
    /// Backend type this provider speaks.
    pub kind: BackendKind,
    /// Model name served.
    pub model_name: String,
    /// Base URLs currently serving this model (more than one when several
    /// backends of the same type and model are healthy).
    pub base_urls: Vec<String>,
    /// Representative API key, if this kind requires one.
    pub api_key: Option<String>,
    /// Context window length, if known.
    pub context_length: Option<u32>,
    capabilities: &'static [Capability],
}

impl Provider {
    /// Whether this provider can serve [`Capability::Chat`].
    #[must_use]
    pub fn can_chat(&self) -> bool {
        self.capabilities.contains(&Capability::Chat)
    }

    /// Whether this provider can serve [`Capability::Prompt`].
    #[must_use]
    pub fn can_prompt(&self) -> bool {
        self.capabilities.contains(&Capability::Prompt)
    }

    /// Whether this provider can serve [`Capability::Embed`].
    #[must_use]
    pub fn can_embed(&self) -> bool {
        self.capabilities.contains(&Capability::Embed)
    }

    /// Whether this provider can serve [`Capability::Stream`].
    #[must_use]
    pub fn can_stream(&self) -> bool {
        self.capabilities.contains(&Capability::Stream)
    }

    /// Whether this provider exposes `cap`.
    #[must_use]
    pub fn supports(&self, cap: Capability) -> bool {
        self.capabilities.contains(&cap)
    }
}

/// Capability surface for each backend kind. A deployment-specific design
/// decision: self-hosted generic (Ollama-shaped) servers
/// expose all four; self-hosted OpenAI-compatible servers typically lack a
/// dedicated embeddings route in this deployment; Anthropic's Messages API
/// has no embeddings endpoint; OpenAI's does.
fn capabilities_for_kind(kind: BackendKind) -> &'static [Capability] {
    use Capability::{Chat, Embed, Prompt, Stream};
    match kind {
        BackendKind::SelfHostedGeneric => &[Chat, Prompt, Embed, Stream],
        BackendKind::SelfHostedOpenAiCompatible => &[Chat, Prompt, Stream],
        BackendKind::CloudA => &[Chat, Prompt, Stream],
        BackendKind::CloudB => &[Chat, Prompt, Embed, Stream],
    }
}

/// A queryable set of providers built from one reconciliation snapshot.
pub struct ProviderAdapter {
    providers: Vec<Provider>,
}

impl ProviderAdapter {
    /// Build the provider set grouping algorithm.
    ///
    /// `llm_states` are the reconciler's per-backend snapshot; only backends
    /// reporting `healthy` contribute, and only models with
    /// [`PulledModelStatus::Ready`] are exposed. `model_catalog` supplies
    /// context-length lookups by name. `cloud_configs` are declared
    /// out-of-band and always contribute regardless of reconciler health.
    #[must_use]
    pub fn build(
        llm_states: &[LlmState],
        model_catalog: &[Model],
        cloud_configs: &[CloudProviderConfig],
    ) -> Self {
        let context_length_of = |name: &str| -> Option<u32> {
            model_catalog
                .iter()
                .find(|m| m.name == name)
                .and_then(|m| m.context_length)
        };

        // Group by (kind, model_name) -> (base_urls, representative api_key).
        let mut groups: BTreeMap<(BackendKindKey, String), (Vec<String>, Option<String>)> =
            BTreeMap::new();

        for state in llm_states {
            if !state.healthy {
                continue;
            }
            let key_kind = BackendKindKey(state.backend.kind);
            for model in &state.pulled_models {
                if model.status != PulledModelStatus::Ready {
                    continue;
                }
                let entry = groups
                    .entry((key_kind, model.name.clone()))
                    .or_insert_with(|| (Vec::new(), state.api_key.clone()));
                if !entry.0.contains(&state.backend.base_url) {
                    entry.0.push(state.backend.base_url.clone());
                }
            }
        }

        for config in cloud_configs {
            let key_kind = BackendKindKey(config.backend.kind);
            for model in &config.models {
                let entry = groups
                    .entry((key_kind, model.name.clone()))
                    .or_insert_with(|| (Vec::new(), config.backend.api_key.clone()));
                if !entry.0.contains(&config.backend.base_url) {
                    entry.0.push(config.backend.base_url.clone());
                }
            }
        }

        let providers = groups
            .into_iter()
            .map(|((kind, model_name), (base_urls, api_key))| Provider {
                context_length: context_length_of(&model_name),
                capabilities: capabilities_for_kind(kind.0),
                kind: kind.0,
                model_name,
                base_urls,
                api_key,
            })
            .collect();

        Self { providers }
    }

    /// Query providers by backend type. Empty `types` returns every provider
    ///.
    #[must_use]
    pub fn providers_for(&self, types: &[BackendKind]) -> Vec<&Provider> {
        if types.is_empty() {
            return self.providers.iter().collect();
        }
        self.providers
            .iter()
            .filter(|p| types.contains(&p.kind))
            .collect()
    }

    /// All providers, unfiltered.
    #[must_use]
    pub fn all(&self) -> &[Provider] {
        &self.providers
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BackendKindKey(BackendKind);

// `BackendKind` has no natural ordering of its own (it's a plain
// classification enum); rank it here so `(kind, model_name)` pairs can key a
// `BTreeMap`.
fn kind_rank(kind: BackendKind) -> u8 {
    match kind {
        BackendKind::SelfHostedGeneric => 0,
        BackendKind::SelfHostedOpenAiCompatible => 1,
        BackendKind::CloudA => 2,
        BackendKind::CloudB => 3,
    }
}

impl PartialOrd for BackendKindKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BackendKindKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        kind_rank(self.0).cmp(&kind_rank(other.0))
    }
}
