//! Prefix-scoped key-value cache entries.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One entry in the prefix-scoped key-value cache.
///
/// Primary key is `(prefix, key)`. The cache itself treats `value` as
/// opaque; callers agree on its shape out of band per `prefix`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct KvEntry {
    /// Namespace the key lives in, e.g. `"resolver.pool"` or
    /// `"botpoller.offset"`.
    pub prefix: String,
    /// Key, unique within `prefix`.
    pub key: String,
    /// Opaque JSON value.
    pub value: serde_json::Value,
    /// Last write timestamp.
    pub updated_at: DateTime<Utc>,
}

impl KvEntry {
    /// Construct a new entry stamped with the current time.
    pub fn new(prefix: impl Into<String>, key: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            prefix: prefix.into(),
            key: key.into(),
            value,
            updated_at: Utc::now(),
        }
    }
}
