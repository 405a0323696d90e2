//! Chat roles, capability vocabulary, and finish-reason mapping shared by
//! the resolver, provider adapter, and LLM clients.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A chat message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// System/instruction message.
    System,
    /// End-user message.
    User,
    /// Assistant (model) reply.
    Assistant,
    /// Vendor-specific alias for assistant used by some dialects.
    Model,
}

impl Role {
    /// Whether a message with this role may be the last in a chat turn list
    ///.
    #[must_use]
    pub fn valid_as_final_message(&self) -> bool {
        matches!(self, Self::User | Self::System)
    }
}

/// One turn in a chat conversation, as accepted by [`Capability::Chat`]
/// clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ChatMessage {
    /// Speaker role.
    pub role: Role,
    /// Message text.
    pub content: String,
}

impl ChatMessage {
    /// Construct a new chat message.
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// A capability an LLM client or provider may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Multi-turn chat completion.
    Chat,
    /// Single-string prompt completion.
    Prompt,
    /// Text embedding.
    Embed,
    /// Streamed token generation.
    Stream,
}

/// Upstream finish-reason, normalized across vendors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// Normal stop. Maps to success, unless the returned content is empty.
    Stop,
    /// The model exhausted its token budget.
    Length,
    /// The response was withheld by a content filter.
    ContentFilter,
    /// Any other / vendor-specific reason.
    Other,
}
