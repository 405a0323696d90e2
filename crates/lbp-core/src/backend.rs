//! Backend, Model, and Pool catalog entities.
//!
//! These are declared by operators and read, never mutated, by the
//! reconciler.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The four declared backend types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// A self-hosted server exposing a vendor-specific pull/list/generate API
    /// (e.g. an Ollama-shaped server).
    SelfHostedGeneric,
    /// A self-hosted server exposing an OpenAI-compatible chat completions
    /// API (e.g. vLLM, text-generation-inference).
    SelfHostedOpenAiCompatible,
    /// A cloud vendor using the Anthropic Messages API shape.
    CloudA,
    /// A cloud vendor using the OpenAI Chat Completions API shape.
    CloudB,
}

impl BackendKind {
    /// Whether this backend kind is self-hosted (and therefore subject to
    /// reconciliation/model-pull cycles) as opposed to a fixed cloud
    /// endpoint.
    #[must_use]
    pub fn is_self_hosted(&self) -> bool {
        matches!(
            self,
            Self::SelfHostedGeneric | Self::SelfHostedOpenAiCompatible
        )
    }
}

/// A declared inference endpoint.
///
/// Unique by `name` and by `base_url`. Created/updated/deleted by operators;
/// the reconciler only reads this record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Backend {
    /// Unique identifier.
    pub id: Uuid,
    /// Unique human-readable name.
    pub name: String,
    /// Unique base URL of the inference endpoint.
    pub base_url: String,
    /// Declared backend type.
    pub kind: BackendKind,
    /// Optional API key for this backend (cloud backends; self-hosted
    /// backends are typically unauthenticated or use a shared key).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// A catalog entry naming a model artifact. Unique by `name`, not bound to
/// any particular backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Model {
    /// Unique identifier.
    pub id: Uuid,
    /// Unique model name (e.g. `"llama3.1:8b"`, `"gpt-4o-mini"`).
    pub name: String,
    /// Context window length, in tokens, if known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u32>,
}

/// A named grouping of backends and models with a purpose tag
///.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Pool {
    /// Unique identifier.
    pub id: Uuid,
    /// Unique pool name.
    pub name: String,
    /// Purpose tag. Validated non-empty; operators may define their own
    /// tags beyond the conventional `embed`/`exec`.
    pub purpose: PoolPurpose,
}

/// A pool's purpose tag.
///
/// Kept as a validated non-empty string rather than a closed enum:
/// `embed`/`exec` are examples, not an exhaustive list, so operators may
/// register pools under other purpose tags.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct PoolPurpose(String);

/// Error constructing a [`PoolPurpose`] from an empty string.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("pool purpose must be non-empty")]
pub struct EmptyPoolPurpose;

impl PoolPurpose {
    /// The conventional embedding-pool purpose tag.
    pub const EMBED: &'static str = "embed";
    /// The conventional execution-pool purpose tag.
    pub const EXEC: &'static str = "exec";

    /// Construct a purpose tag, rejecting the empty string.
    pub fn new(value: impl Into<String>) -> Result<Self, EmptyPoolPurpose> {
        let value = value.into();
        if value.is_empty() {
            return Err(EmptyPoolPurpose);
        }
        Ok(Self(value))
    }

    /// Borrow the underlying tag string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PoolPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
