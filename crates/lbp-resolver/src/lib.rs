// SPDX-License-Identifier: MIT OR Apache-2.0
//! Filter → policy → select pipeline for capability-typed provider
//! resolution.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use lbp_core::{BackendKind, Capability};
use lbp_error::{ErrorCode, LbpError};
use lbp_providers::{Provider, ProviderAdapter};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicU64, Ordering};

/// Tie-break policy used to select one provider (and one of its base URLs)
/// among several that satisfy a request.
#[derive(Debug, Clone, Copy)]
pub enum Policy {
    /// Seeded random choice, for determinism per call.
    Randomly {
        /// Seed driving the call's `StdRng`.
        seed: u64,
    },
    /// Lowest observed latency"; see
    /// `DESIGN.md` — currently an alias for `RoundRobin`).
    LowestLatency,
    /// Round-robin over satisfying candidates.
    RoundRobin,
}

/// A resolve request: `{contextLength, modelNames[], providerTypes[], capability}`.
#[derive(Debug, Clone)]
pub struct ResolveRequest<'a> {
    /// Minimum context window the chosen provider must support. `None`
    /// means no requirement. A provider with an unknown (`None`) context
    /// length is treated as satisfying any request (a permissive default;
    /// see `DESIGN.md` Open Questions).
    pub context_length: Option<u32>,
    /// Acceptable model names. Empty means any model name is acceptable.
    pub model_names: &'a [String],
    /// Acceptable provider (backend) types. Empty means any type.
    pub provider_types: &'a [BackendKind],
    /// Capability the call site needs (Chat/Prompt/Embed/Stream).
    pub capability: Capability,
}

/// The outcome of a successful resolve: one backend base URL, bound to
/// one model name, plus enough information to construct the matching
/// vendor client.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Backend type resolved to.
    pub kind: BackendKind,
    /// Model name to request.
    pub model_name: String,
    /// The chosen base URL (one of possibly several serving this model).
    pub base_url: String,
    /// API key for this backend, if any.
    pub api_key: Option<String>,
}

fn satisfies(provider: &Provider, request: &ResolveRequest<'_>) -> bool {
    let model_ok =
        request.model_names.is_empty() || request.model_names.iter().any(|m| m == &provider.model_name);
    let context_ok = match (request.context_length, provider.context_length) {
        (Some(required), Some(available)) => available >= required,
        _ => true,
    };
    model_ok && context_ok && provider.supports(request.capability)
}

/// Selects `(Provider, base_url)` pairs for resolve requests against a
/// fresh [`ProviderAdapter`] snapshot.
///
/// Holds no state except the round-robin cursor `Policy::RoundRobin` and
/// `Policy::LowestLatency` share; build one `Resolver` per long-lived
/// caller (e.g. once per dispatch worker), not once per call, so the
/// cursor actually rotates.
#[derive(Debug, Default)]
pub struct Resolver {
    round_robin_cursor: AtomicU64,
}

impl Resolver {
    /// Construct a resolver with a fresh round-robin cursor.
    #[must_use]
    pub fn new() -> Self {
        Self {
            round_robin_cursor: AtomicU64::new(0),
        }
    }

    /// Resolve `request` against `adapter` under `policy`.
    ///
    /// # Errors
    /// Returns [`ErrorCode::NoSatisfyingProvider`] when no provider in
    /// `adapter` satisfies `request`.
    pub fn resolve(
        &self,
        adapter: &ProviderAdapter,
        request: &ResolveRequest<'_>,
        policy: Policy,
    ) -> Result<Resolution, LbpError> {
        let candidates: Vec<&Provider> = adapter
            .providers_for(request.provider_types)
            .into_iter()
            .filter(|p| satisfies(p, request))
            .collect();

        if candidates.is_empty() {
            return Err(LbpError::new(
                ErrorCode::NoSatisfyingProvider,
                "no provider satisfies the requested model/context/capability combination",
            ));
        }

        let provider_index = self.pick_index(candidates.len(), policy);
        let provider = candidates[provider_index];

        let url_index = self.pick_index(provider.base_urls.len(), policy);
        let base_url = provider.base_urls[url_index].clone();

        Ok(Resolution {
            kind: provider.kind,
            model_name: provider.model_name.clone(),
            base_url,
            api_key: provider.api_key.clone(),
        })
    }

    fn pick_index(&self, len: usize, policy: Policy) -> usize {
        debug_assert!(len > 0);
        match policy {
            Policy::Randomly { seed } => {
                let mut rng = StdRng::seed_from_u64(seed);
                rng.gen_range(0..len)
            }
            Policy::RoundRobin | Policy::LowestLatency => {
                let cursor = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed);
                (cursor as usize) % len
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use lbp_core::{Backend, LlmState, Model, PulledModel, PulledModelStatus};
    use lbp_providers::CloudProviderConfig;
    use uuid::Uuid;

    fn backend(kind: BackendKind, base_url: &str) -> Backend {
        Backend {
            id: Uuid::new_v4(),
            name: base_url.to_string(),
            base_url: base_url.to_string(),
            kind,
            api_key: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn ready_state(kind: BackendKind, base_url: &str, model: &str) -> LlmState {
        LlmState {
            backend: backend(kind, base_url),
            pulled_models: vec![PulledModel {
                name: model.into(),
                status: PulledModelStatus::Ready,
                digest: None,
                bytes: None,
            }],
            api_key: None,
            healthy: true,
        }
    }

    #[test]
    fn empty_model_names_and_no_providers_is_no_satisfying_provider() {
        let adapter = ProviderAdapter::build(&[], &[], &[]);
        let resolver = Resolver::new();
        let req = ResolveRequest {
            context_length: None,
            model_names: &[],
            provider_types: &[],
            capability: Capability::Chat,
        };
        let err = resolver.resolve(&adapter, &req, Policy::Randomly { seed: 1 }).unwrap_err();
        assert_eq!(err.code, ErrorCode::NoSatisfyingProvider);
    }

    #[test]
    fn filters_out_providers_below_requested_context_length() {
        let config = CloudProviderConfig {
            backend: backend(BackendKind::CloudB, "https://api.openai.com"),
            models: vec![Model {
                id: Uuid::new_v4(),
                name: "gpt-4o-mini".into(),
                context_length: Some(8_000),
            }],
        };
        let adapter = ProviderAdapter::build(&[], &[], &[config]);
        let resolver = Resolver::new();
        let req = ResolveRequest {
            context_length: Some(32_000),
            model_names: &[],
            provider_types: &[],
            capability: Capability::Chat,
        };
        let err = resolver.resolve(&adapter, &req, Policy::Randomly { seed: 1 }).unwrap_err();
        assert_eq!(err.code, ErrorCode::NoSatisfyingProvider);
    }

    #[test]
    fn unknown_context_length_satisfies_any_request() {
        let config = CloudProviderConfig {
            backend: backend(BackendKind::CloudA, "https://api.anthropic.com"),
            models: vec![Model {
                id: Uuid::new_v4(),
                name: "claude-3".into(),
                context_length: None,
            }],
        };
        let adapter = ProviderAdapter::build(&[], &[], &[config]);
        let resolver = Resolver::new();
        let req = ResolveRequest {
            context_length: Some(200_000),
            model_names: &[],
            provider_types: &[],
            capability: Capability::Chat,
        };
        let resolution = resolver.resolve(&adapter, &req, Policy::Randomly { seed: 1 }).unwrap();
        assert_eq!(resolution.model_name, "claude-3");
    }

    #[test]
    fn capability_mismatch_is_filtered_out() {
        let config = CloudProviderConfig {
            backend: backend(BackendKind::CloudA, "https://api.anthropic.com"),
            models: vec![Model {
                id: Uuid::new_v4(),
                name: "claude-3".into(),
                context_length: None,
            }],
        };
        let adapter = ProviderAdapter::build(&[], &[], &[config]);
        let resolver = Resolver::new();
        let req = ResolveRequest {
            context_length: None,
            model_names: &[],
            provider_types: &[],
            capability: Capability::Embed,
        };
        let err = resolver.resolve(&adapter, &req, Policy::Randomly { seed: 1 }).unwrap_err();
        assert_eq!(err.code, ErrorCode::NoSatisfyingProvider);
    }

    #[test]
    fn randomly_is_deterministic_given_the_same_seed() {
        let states = vec![
            ready_state(BackendKind::SelfHostedGeneric, "http://a", "m1"),
            ready_state(BackendKind::SelfHostedGeneric, "http://b", "m2"),
        ];
        let adapter = ProviderAdapter::build(&states, &[], &[]);
        let resolver = Resolver::new();
        let req = ResolveRequest {
            context_length: None,
            model_names: &[],
            provider_types: &[],
            capability: Capability::Chat,
        };
        let a = resolver.resolve(&adapter, &req, Policy::Randomly { seed: 42 }).unwrap();
        let b = resolver.resolve(&adapter, &req, Policy::Randomly { seed: 42 }).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn round_robin_cycles_through_candidates() {
        let states = vec![
            ready_state(BackendKind::SelfHostedGeneric, "http://a", "m1"),
            ready_state(BackendKind::SelfHostedGeneric, "http://b", "m2"),
        ];
        let adapter = ProviderAdapter::build(&states, &[], &[]);
        let resolver = Resolver::new();
        let req = ResolveRequest {
            context_length: None,
            model_names: &[],
            provider_types: &[],
            capability: Capability::Chat,
        };
        let first = resolver.resolve(&adapter, &req, Policy::RoundRobin).unwrap();
        let second = resolver.resolve(&adapter, &req, Policy::RoundRobin).unwrap();
        assert_ne!(first.model_name, second.model_name);
    }

    #[test]
    fn selects_one_base_url_among_several_for_the_same_provider() {
        let states = vec![
            ready_state(BackendKind::SelfHostedGeneric, "http://a", "m1"),
            ready_state(BackendKind::SelfHostedGeneric, "http://b", "m1"),
        ];
        let adapter = ProviderAdapter::build(&states, &[], &[]);
        let resolver = Resolver::new();
        let req = ResolveRequest {
            context_length: None,
            model_names: &[],
            provider_types: &[],
            capability: Capability::Chat,
        };
        let resolution = resolver.resolve(&adapter, &req, Policy::Randomly { seed: 7 }).unwrap();
        assert!(["http://a", "http://b"].contains(&resolution.base_url.as_str()));
    }
}
