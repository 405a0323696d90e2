//! Reconciled per-backend runtime state.
//!
//! `LlmState` is never persisted directly; it is reconstructed fresh on
//! every reconciliation tick and published as an immutable snapshot.

use crate::backend::Backend;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Status of a model pull on a given backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PulledModelStatus {
    /// Pull is in progress.
    Pulling,
    /// Model is fully pulled and ready to serve.
    Ready,
    /// The last pull attempt failed.
    Failed,
}

/// One pulled (or pulling) model on a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PulledModel {
    /// Model name, matching [`crate::backend::Model::name`].
    pub name: String,
    /// Current pull status.
    pub status: PulledModelStatus,
    /// Content digest, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    /// Size in bytes, once known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,
}

/// In-memory per-backend snapshot produced by the reconciler.
///
/// Reconstructed each reconciliation tick; never
/// persisted directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LlmState {
    /// The backend this state describes.
    pub backend: Backend,
    /// Models currently pulled (or pulling) on this backend.
    pub pulled_models: Vec<PulledModel>,
    /// API key to use when talking to this backend, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Whether the backend responded successfully to the last probe.
    pub healthy: bool,
}

impl LlmState {
    /// Whether this state reports `name` as ready to serve.
    #[must_use]
    pub fn has_ready_model(&self, name: &str) -> bool {
        self.pulled_models
            .iter()
            .any(|m| m.name == name && m.status == PulledModelStatus::Ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use chrono::Utc;
    use uuid::Uuid;

    fn backend() -> Backend {
        Backend {
            id: Uuid::nil(),
            name: "local".into(),
            base_url: "http://localhost:11434".into(),
            kind: BackendKind::SelfHostedGeneric,
            api_key: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn has_ready_model_requires_ready_status() {
        let state = LlmState {
            backend: backend(),
            pulled_models: vec![PulledModel {
                name: "llama3.1:8b".into(),
                status: PulledModelStatus::Pulling,
                digest: None,
                bytes: None,
            }],
            api_key: None,
            healthy: true,
        };
        assert!(!state.has_ready_model("llama3.1:8b"));
    }

    #[test]
    fn has_ready_model_true_when_ready() {
        let mut state = LlmState {
            backend: backend(),
            pulled_models: vec![],
            api_key: None,
            healthy: true,
        };
        state.pulled_models.push(PulledModel {
            name: "llama3.1:8b".into(),
            status: PulledModelStatus::Ready,
            digest: Some("sha256:abc".into()),
            bytes: Some(4_700_000_000),
        });
        assert!(state.has_ready_model("llama3.1:8b"));
        assert!(!state.has_ready_model("other"));
    }
}
