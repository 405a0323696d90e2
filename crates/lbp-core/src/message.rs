//! Conversation stream entities.

use crate::capability::Role;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An addressable conversation stream owned by an identity.
///
/// Invariant: every [`Message::idx`] references an existing
/// `MessageIndex`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MessageIndex {
    /// Stream identifier.
    pub idx: Uuid,
    /// Owning identity (user id, bot id, etc). Opaque to the core.
    pub identity: String,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

/// One ordered, opaque message within a [`MessageIndex`].
///
/// Primary key is `(idx, id)`. Invariant within an `idx`: ids unique,
/// canonical read order is `added_at` ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Message {
    /// Owning stream.
    pub idx: Uuid,
    /// Message identifier, unique within `idx`.
    pub id: String,
    /// Speaker role.
    pub role: Role,
    /// Message content.
    pub content: String,
    /// Logical message timestamp (used in the deterministic id derivation
    /// and for ordering when added_at ties occur).
    pub timestamp: DateTime<Utc>,
    /// Timestamp the row was actually appended to the store.
    pub added_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_index_roundtrip() {
        let idx = MessageIndex {
            idx: Uuid::nil(),
            identity: "user-1".into(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&idx).unwrap();
        let back: MessageIndex = serde_json::from_str(&json).unwrap();
        assert_eq!(back, idx);
    }
}
