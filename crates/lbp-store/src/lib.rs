// SPDX-License-Identifier: MIT OR Apache-2.0
//! The sole durable substrate for the LLM Backplane.
//!
//! [`Store`] is the trait every other crate in this workspace depends on to
//! read and write durable state. [`pg::PgStore`] is the production
//! implementation over Postgres via `sqlx`; [`mock::MockStore`] is an
//! in-memory fake of the same trait used throughout this workspace's test
//! suites so that tests never require a live database.
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Store-level error taxonomy and `sqlx::Error` mapping.
pub mod error;
/// In-memory fake [`Store`] implementation for tests.
pub mod mock;
/// Postgres-backed [`Store`] implementation.
pub mod pg;

pub use error::StoreError;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lbp_core::{Backend, BackendKind, KvEntry, LeasedJob, Message, MessageIndex, Model, Pool, PoolPurpose, Role};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Supporting types
// ---------------------------------------------------------------------------

/// Fields needed to append a new [`lbp_core::Job`]; `id` and `created_at`
/// are assigned by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    /// Task type; used to select a pop/fetcher queue.
    pub task_type: String,
    /// Operation name within the task type.
    pub operation: String,
    /// Human-readable subject.
    pub subject: String,
    /// Identifier of the entity this job concerns, if any.
    pub entity_id: Option<String>,
    /// Type name of the entity this job concerns, if any.
    pub entity_type: Option<String>,
    /// Opaque payload.
    pub payload: serde_json::Value,
    /// Earliest time this job may run.
    pub scheduled_for: DateTime<Utc>,
    /// Latest time this job is still valid to run.
    pub valid_until: DateTime<Utc>,
}

/// Fields needed to append a new [`Message`]; `id` is derived by the caller
/// (lbp-chat) or left `None` to let the store derive one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewMessage {
    /// Message identifier. If `None`, the store is not responsible for
    /// derivation — callers in this workspace always supply one (see
    /// `lbp-chat`'s deterministic id rule).
    pub id: String,
    /// Speaker role.
    pub role: Role,
    /// Message content.
    pub content: String,
    /// Logical message timestamp.
    pub timestamp: DateTime<Utc>,
}

/// Fields needed to create a new [`Backend`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewBackend {
    /// Unique human-readable name.
    pub name: String,
    /// Unique base URL.
    pub base_url: String,
    /// Declared backend type.
    pub kind: BackendKind,
    /// Optional API key.
    pub api_key: Option<String>,
}

/// Partial update to a [`Backend`]; `None` fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendPatch {
    /// New name, if changing.
    pub name: Option<String>,
    /// New base URL, if changing.
    pub base_url: Option<String>,
    /// New API key, if changing (`Some(None)` clears it).
    pub api_key: Option<Option<String>>,
}

/// Fields needed to create a new [`Model`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewModel {
    /// Unique model name.
    pub name: String,
    /// Known context window length, if any.
    pub context_length: Option<u32>,
}

/// Fields needed to create a new [`Pool`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewPool {
    /// Unique pool name.
    pub name: String,
    /// Purpose tag.
    pub purpose: PoolPurpose,
}

/// Opaque cursor for descending-by-`created_at` pagination
///`), encoded as `created_at_rfc3339/id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageCursor {
    /// `created_at` of the last item on the previous page.
    pub created_at: DateTime<Utc>,
    /// `id` of the last item on the previous page (tiebreak).
    pub id: Uuid,
}

impl PageCursor {
    /// Encode as an opaque string suitable for passing back to the caller.
    #[must_use]
    pub fn encode(&self) -> String {
        format!("{}/{}", self.created_at.to_rfc3339(), self.id)
    }

    /// Decode a previously-[`encode`](Self::encode)d cursor string.
    pub fn decode(s: &str) -> Option<Self> {
        let (ts, id) = s.split_once('/')?;
        Some(Self {
            created_at: DateTime::parse_from_rfc3339(ts).ok()?.with_timezone(&Utc),
            id: Uuid::parse_str(id).ok()?,
        })
    }
}

/// A single page of results plus a cursor for the next page, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    /// Items on this page, in the store's canonical order.
    pub items: Vec<T>,
    /// Cursor to pass for the next page; `None` once exhausted.
    pub next_cursor: Option<String>,
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// The durable substrate: typed CRUD plus queue primitives over a SQL
/// engine.
///
/// Implementations must uphold the structural invariant that a job id
/// exists in exactly one of `{pending, leased}` at any time — the
/// `lease_job_for_type` / `mark_leased_job_done` / `retry_leased_job` /
/// `recover_expired_leases` methods are each responsible for performing
/// their table move atomically.
#[async_trait]
pub trait Store: Send + Sync {
    // -- Jobs ----------------------------------------------------------
    /// Append a new pending job.
    async fn append_job(&self, job: NewJob) -> Result<lbp_core::Job, StoreError>;
    /// Atomically pop the oldest pending job of `task_type`, ties broken by
    /// id lexicographically.
    async fn pop_job_for_type(&self, task_type: &str) -> Result<Option<lbp_core::Job>, StoreError>;
    /// Pop up to `limit` oldest pending jobs of `task_type`.
    async fn pop_jobs_for_type(
        &self,
        task_type: &str,
        limit: i64,
    ) -> Result<Vec<lbp_core::Job>, StoreError>;
    /// List (without removing) all pending jobs of `task_type`.
    async fn get_jobs_for_type(&self, task_type: &str) -> Result<Vec<lbp_core::Job>, StoreError>;
    /// Page through all pending jobs, newest `created_at` first.
    async fn list_jobs(
        &self,
        cursor: Option<PageCursor>,
        limit: i64,
    ) -> Result<Page<lbp_core::Job>, StoreError>;

    // -- Leased jobs -----------------------------------------------------
    /// Atomically move the oldest pending job of `task_type` into the
    /// leased table under `leaser` with the given lease duration.
    async fn lease_job_for_type(
        &self,
        task_type: &str,
        leaser: &str,
        lease_duration: Duration,
    ) -> Result<Option<LeasedJob>, StoreError>;
    /// Look up a leased job by id.
    async fn get_leased_job(&self, id: Uuid) -> Result<Option<LeasedJob>, StoreError>;
    /// Delete a leased job by id unconditionally (used by
    /// `mark_leased_job_done` internally; exposed for store-level tests).
    async fn delete_leased_job(&self, id: Uuid) -> Result<(), StoreError>;
    /// Page through all leased jobs, newest `created_at` first.
    async fn list_leased_jobs(
        &self,
        cursor: Option<PageCursor>,
        limit: i64,
    ) -> Result<Page<LeasedJob>, StoreError>;
    /// Mark a leased job done: delete the leased row. Fails with
    /// [`StoreError::NotFound`] if absent.
    async fn mark_leased_job_done(&self, id: Uuid, leaser: &str) -> Result<(), StoreError>;
    /// Retry a leased job: requires `leaser` to match the stored leaser.
    /// Atomically deletes the leased row and re-inserts into pending with
    /// `retry_count += 1`.
    async fn retry_leased_job(&self, id: Uuid, leaser: &str) -> Result<lbp_core::Job, StoreError>;
    /// Move every leased row whose `lease_expiration <= now` back to
    /// pending, atomically per row. Returns the number recovered.
    async fn recover_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, StoreError>;

    // -- Messages --------------------------------------------------------
    /// Create a new addressable conversation stream.
    async fn create_message_index(&self, identity: &str) -> Result<MessageIndex, StoreError>;
    /// Batch-insert messages into `idx`. All rows in the batch receive the
    /// same `added_at`).
    async fn append_messages(
        &self,
        idx: Uuid,
        messages: Vec<NewMessage>,
    ) -> Result<Vec<Message>, StoreError>;
    /// List all messages for `idx`, ordered by `added_at` ascending.
    async fn list_messages(&self, idx: Uuid) -> Result<Vec<Message>, StoreError>;
    /// Delete all messages for `idx`.
    async fn delete_messages(&self, idx: Uuid) -> Result<(), StoreError>;

    // -- KV ----------------------------------------------------------------
    /// Upsert a KV entry.
    async fn set_kv(
        &self,
        prefix: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<KvEntry, StoreError>;
    /// Delete a KV entry. A missing key is a no-op.
    async fn delete_kv(&self, prefix: &str, key: &str) -> Result<(), StoreError>;
    /// List every KV entry.
    async fn list_kv(&self) -> Result<Vec<KvEntry>, StoreError>;
    /// List every KV entry whose key matches `prefix` exactly (the cache's
    /// configured prefix).
    async fn list_kv_prefix(&self, prefix: &str) -> Result<Vec<KvEntry>, StoreError>;

    // -- Catalog: backends -------------------------------------------------
    /// Create a backend.
    async fn create_backend(&self, backend: NewBackend) -> Result<Backend, StoreError>;
    /// Apply a partial update to a backend.
    async fn update_backend(&self, id: Uuid, patch: BackendPatch) -> Result<Backend, StoreError>;
    /// Delete a backend (and its pool memberships).
    async fn delete_backend(&self, id: Uuid) -> Result<(), StoreError>;
    /// Fetch one backend by id.
    async fn get_backend(&self, id: Uuid) -> Result<Option<Backend>, StoreError>;
    /// List all backends.
    async fn list_backends(&self) -> Result<Vec<Backend>, StoreError>;

    // -- Catalog: models -----------------------------------------------------
    /// Create a model catalog entry.
    async fn create_model(&self, model: NewModel) -> Result<Model, StoreError>;
    /// List all models.
    async fn list_models(&self) -> Result<Vec<Model>, StoreError>;

    // -- Catalog: pools and memberships --------------------------------------
    /// Create a pool.
    async fn create_pool(&self, pool: NewPool) -> Result<Pool, StoreError>;
    /// List all pools.
    async fn list_pools(&self) -> Result<Vec<Pool>, StoreError>;
    /// Assign a backend to a pool (idempotent).
    async fn assign_backend_to_pool(&self, pool_id: Uuid, backend_id: Uuid) -> Result<(), StoreError>;
    /// Assign a model to a pool (idempotent).
    async fn assign_model_to_pool(&self, pool_id: Uuid, model_id: Uuid) -> Result<(), StoreError>;
    /// List the backends belonging to a pool.
    async fn backends_in_pool(&self, pool_id: Uuid) -> Result<Vec<Backend>, StoreError>;
    /// List the models assigned to a pool.
    async fn models_in_pool(&self, pool_id: Uuid) -> Result<Vec<Model>, StoreError>;
    /// List the pools a backend belongs to.
    async fn pools_for_backend(&self, backend_id: Uuid) -> Result<Vec<Pool>, StoreError>;
}
