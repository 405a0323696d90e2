//! Job and leased-job queue entities.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unit of pending work.
///
/// Invariant: `valid_until >= scheduled_for`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Unique identifier.
    pub id: Uuid,
    /// Task type; used to select a pop/fetcher queue.
    pub task_type: String,
    /// Operation name within the task type.
    pub operation: String,
    /// Human-readable subject.
    pub subject: String,
    /// Identifier of the entity this job concerns, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    /// Type name of the entity this job concerns, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    /// Opaque payload, typically a small JSON document the consumer of
    /// `task_type` knows how to interpret. The core does not look inside it.
    pub payload: serde_json::Value,
    /// Earliest time this job may run.
    pub scheduled_for: DateTime<Utc>,
    /// Latest time this job is still valid to run.
    pub valid_until: DateTime<Utc>,
    /// Number of times this job has been retried.
    pub retry_count: u32,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Whether `scheduled_for <= valid_until` holds
    /// invariant.
    #[must_use]
    pub fn has_valid_window(&self) -> bool {
        self.scheduled_for <= self.valid_until
    }
}

/// A [`Job`] currently checked out by a worker under a time-bounded lease.
///
/// Invariant: a given id exists in exactly one of
/// `{jobs, leased_jobs}` at any time, enforced by transactional move in the
/// store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct LeasedJob {
    /// The underlying job.
    #[serde(flatten)]
    pub job: Job,
    /// Identifier of the leaseholder.
    pub leaser: String,
    /// Requested lease duration, in seconds.
    pub lease_duration_secs: u64,
    /// Absolute lease expiration time.
    pub lease_expiration: DateTime<Utc>,
}
