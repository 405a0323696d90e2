// SPDX-License-Identifier: MIT OR Apache-2.0
//! At-least-once leased job queue.
//!
//! [`Queue`] names the four lease transitions over a [`lbp_store::Store`]:
//! pop-and-lease, mark-done, retry, and the out-of-band expired-lease sweep.
//! Storage already guarantees a job id lives in exactly one of
//! `{pending, leased}`; this crate is a thin, typed front door onto that.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use lbp_core::{Job, LeasedJob};
use lbp_store::{NewJob, Store};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Default lease duration when the caller does not specify one.
pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(10);

/// A typed façade over [`Store`]'s job and leased-job operations.
pub struct Queue {
    store: Arc<dyn Store>,
}

impl Queue {
    /// Wrap a store.
    #[must_use]
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Append a new pending job.
    pub async fn append(&self, job: NewJob) -> Result<Job, lbp_store::StoreError> {
        self.store.append_job(job).await
    }

    /// Pop the oldest pending job of `task_type` and lease it to `leaser`
    /// for `lease_duration` (defaults to [`DEFAULT_LEASE_DURATION`] when
    /// `None`). The pop-then-insert-leased move is one transaction in the
    /// store.
    pub async fn lease(
        &self,
        task_type: &str,
        leaser: &str,
        lease_duration: Option<Duration>,
    ) -> Result<Option<LeasedJob>, lbp_store::StoreError> {
        self.store
            .lease_job_for_type(task_type, leaser, lease_duration.unwrap_or(DEFAULT_LEASE_DURATION))
            .await
    }

    /// Mark a leased job done. `leaser` must match the stored leaseholder.
    pub async fn mark_done(&self, id: Uuid, leaser: &str) -> Result<(), lbp_store::StoreError> {
        self.store.mark_leased_job_done(id, leaser).await
    }

    /// Retry a leased job: requires `leaser` to match the stored leaseholder.
    /// Moves the job back to pending with `retry_count += 1`, atomically.
    pub async fn retry(&self, id: Uuid, leaser: &str) -> Result<Job, lbp_store::StoreError> {
        self.store.retry_leased_job(id, leaser).await
    }

    /// Move every lease expired as of `now` back to pending. Returns the
    /// number recovered. Intended to be driven by an out-of-core sweeper.
    pub async fn recover_expired_leases(
        &self,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<u64, lbp_store::StoreError> {
        self.store.recover_expired_leases(now).await
    }

    /// Look up a leased job by id.
    pub async fn get_leased(&self, id: Uuid) -> Result<Option<LeasedJob>, lbp_store::StoreError> {
        self.store.get_leased_job(id).await
    }

    /// Page through pending jobs, newest first.
    pub async fn pending(
        &self,
        cursor: Option<lbp_store::PageCursor>,
        limit: i64,
    ) -> Result<lbp_store::Page<Job>, lbp_store::StoreError> {
        self.store.list_jobs(cursor, limit).await
    }

    /// Page through in-progress (leased) jobs, newest first.
    pub async fn in_progress(
        &self,
        cursor: Option<lbp_store::PageCursor>,
        limit: i64,
    ) -> Result<lbp_store::Page<LeasedJob>, lbp_store::StoreError> {
        self.store.list_leased_jobs(cursor, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lbp_store::mock::MockStore;

    fn queue() -> Queue {
        Queue::new(Arc::new(MockStore::new()))
    }

    fn new_job(task_type: &str) -> NewJob {
        let now = chrono::Utc::now();
        NewJob {
            task_type: task_type.into(),
            operation: "ingest".into(),
            subject: "test".into(),
            entity_id: None,
            entity_type: None,
            payload: serde_json::json!({}),
            scheduled_for: now,
            valid_until: now + chrono::Duration::seconds(60),
        }
    }

    #[tokio::test]
    async fn lease_uses_default_duration_when_unset() {
        let q = queue();
        q.append(new_job("bot.poll")).await.unwrap();
        let leased = q.lease("bot.poll", "worker-1", None).await.unwrap().unwrap();
        assert_eq!(leased.lease_duration_secs, DEFAULT_LEASE_DURATION.as_secs());
    }

    #[tokio::test]
    async fn retry_requires_matching_leaser() {
        let q = queue();
        q.append(new_job("bot.poll")).await.unwrap();
        let leased = q.lease("bot.poll", "worker-1", None).await.unwrap().unwrap();
        let err = q.retry(leased.job.id, "worker-2").await.unwrap_err();
        assert_eq!(err.code(), lbp_error::ErrorCode::LeaseMismatch);
    }

    #[tokio::test]
    async fn retry_increments_retry_count_and_returns_to_pending() {
        let q = queue();
        q.append(new_job("bot.poll")).await.unwrap();
        let leased = q.lease("bot.poll", "worker-1", None).await.unwrap().unwrap();
        let retried = q.retry(leased.job.id, "worker-1").await.unwrap();
        assert_eq!(retried.retry_count, 1);
        assert!(q.get_leased(leased.job.id).await.unwrap().is_none());
        let page = q.pending(None, 10).await.unwrap();
        assert_eq!(page.items.len(), 1);
    }

    #[tokio::test]
    async fn mark_done_removes_lease() {
        let q = queue();
        q.append(new_job("bot.poll")).await.unwrap();
        let leased = q.lease("bot.poll", "worker-1", None).await.unwrap().unwrap();
        q.mark_done(leased.job.id, "worker-1").await.unwrap();
        assert!(q.get_leased(leased.job.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recover_expired_leases_returns_jobs_to_pending() {
        let q = queue();
        q.append(new_job("bot.poll")).await.unwrap();
        q.lease("bot.poll", "worker-1", Some(Duration::from_secs(1)))
            .await
            .unwrap();
        let future = chrono::Utc::now() + chrono::Duration::seconds(10);
        let recovered = q.recover_expired_leases(future).await.unwrap();
        assert_eq!(recovered, 1);
        let page = q.pending(None, 10).await.unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].retry_count, 0);
    }
}
