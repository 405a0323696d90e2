// SPDX-License-Identifier: MIT OR Apache-2.0
//! Validated dispatch service over the leased job queue.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use lbp_core::{Job, LeasedJob};
use lbp_queue::Queue;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Minimum allowed `limit` for paginated listings.
pub const MIN_LIMIT: i64 = 1;
/// Maximum allowed `limit` for paginated listings.
pub const MAX_LIMIT: i64 = 1000;

/// A request to create a new job, prior to validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateJobRequest {
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

/// A validation failure accumulated while checking a [`CreateJobRequest`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid create-job request: {0:?}")]
pub struct ValidationError(pub Vec<String>);

/// Errors a [`Dispatch`] operation may fail with.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The request failed validation before reaching the store.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The store returned an error.
    #[error(transparent)]
    Store(#[from] lbp_store::StoreError),
    /// No job types were offered to [`Dispatch::assign_pending_job`].
    #[error("at least one job type must be offered")]
    NoJobTypesOffered,
}

/// Validates and forwards requests to a [`Queue`].
pub struct Dispatch {
    queue: Queue,
}

impl Dispatch {
    /// Wrap a queue.
    #[must_use]
    pub fn new(store: Arc<dyn lbp_store::Store>) -> Self {
        Self {
            queue: Queue::new(store),
        }
    }

    /// Validate and create a job.
    ///
    /// Validates `task_type`, `operation`, `subject` non-empty, and
    /// `scheduled_for <= valid_until`.
    pub async fn create_job(&self, req: CreateJobRequest) -> Result<Job, DispatchError> {
        let errors = validate(&req);
        if !errors.is_empty() {
            return Err(ValidationError(errors).into());
        }
        let job = self
            .queue
            .append(lbp_store::NewJob {
                task_type: req.task_type,
                operation: req.operation,
                subject: req.subject,
                entity_id: req.entity_id,
                entity_type: req.entity_type,
                payload: req.payload,
                scheduled_for: req.scheduled_for,
                valid_until: req.valid_until,
            })
            .await?;
        Ok(job)
    }

    /// Page through pending jobs. `limit` must satisfy
    /// `MIN_LIMIT <= limit <= MAX_LIMIT`; out-of-range values are rejected
    /// rather than clamped.
    pub async fn pending_jobs(
        &self,
        cursor: Option<lbp_store::PageCursor>,
        limit: i64,
    ) -> Result<lbp_store::Page<Job>, DispatchError> {
        let limit = check_limit(limit)?;
        Ok(self.queue.pending(cursor, limit).await?)
    }

    /// Page through in-progress (leased) jobs. `limit` must satisfy
    /// `MIN_LIMIT <= limit <= MAX_LIMIT`; out-of-range values are rejected
    /// rather than clamped.
    pub async fn in_progress_jobs(
        &self,
        cursor: Option<lbp_store::PageCursor>,
        limit: i64,
    ) -> Result<lbp_store::Page<LeasedJob>, DispatchError> {
        let limit = check_limit(limit)?;
        Ok(self.queue.in_progress(cursor, limit).await?)
    }

    /// Choose a job type uniformly at random from `job_types` and pop one
    /// pending job of that type, leasing it to `leaser_id` for `duration`
    /// (default 10s).
    pub async fn assign_pending_job(
        &self,
        leaser_id: &str,
        duration: Option<Duration>,
        job_types: &[String],
    ) -> Result<Option<LeasedJob>, DispatchError> {
        let chosen = job_types
            .choose(&mut rand::thread_rng())
            .ok_or(DispatchError::NoJobTypesOffered)?;
        Ok(self.queue.lease(chosen, leaser_id, duration).await?)
    }

    /// Mark a leased job done, enforcing leaser identity.
    pub async fn mark_job_as_done(&self, id: Uuid, leaser_id: &str) -> Result<(), DispatchError> {
        Ok(self.queue.mark_done(id, leaser_id).await?)
    }

    /// Mark a leased job as failed (retried), enforcing leaser identity.
    pub async fn mark_job_as_failed(&self, id: Uuid, leaser_id: &str) -> Result<Job, DispatchError> {
        Ok(self.queue.retry(id, leaser_id).await?)
    }
}

fn check_limit(limit: i64) -> Result<i64, ValidationError> {
    if (MIN_LIMIT..=MAX_LIMIT).contains(&limit) {
        Ok(limit)
    } else {
        Err(ValidationError(vec![format!(
            "limit must be between {MIN_LIMIT} and {MAX_LIMIT}, got {limit}"
        )]))
    }
}

fn validate(req: &CreateJobRequest) -> Vec<String> {
    let mut errors = Vec::new();
    if req.task_type.trim().is_empty() {
        errors.push("task_type must not be empty".into());
    }
    if req.operation.trim().is_empty() {
        errors.push("operation must not be empty".into());
    }
    if req.subject.trim().is_empty() {
        errors.push("subject must not be empty".into());
    }
    if req.scheduled_for > req.valid_until {
        errors.push("scheduled_for must be <= valid_until".into());
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use lbp_store::mock::MockStore;

    fn dispatch() -> Dispatch {
        Dispatch::new(Arc::new(MockStore::new()))
    }

    fn valid_request() -> CreateJobRequest {
        let now = Utc::now();
        CreateJobRequest {
            task_type: "bot.poll".into(),
            operation: "ingest".into(),
            subject: "telegram update".into(),
            entity_id: None,
            entity_type: None,
            payload: serde_json::json!({}),
            scheduled_for: now,
            valid_until: now + chrono::Duration::seconds(60),
        }
    }

    #[tokio::test]
    async fn create_job_accepts_valid_request() {
        let d = dispatch();
        let job = d.create_job(valid_request()).await.unwrap();
        assert_eq!(job.task_type, "bot.poll");
    }

    #[tokio::test]
    async fn create_job_rejects_empty_task_type() {
        let d = dispatch();
        let mut req = valid_request();
        req.task_type = "".into();
        let err = d.create_job(req).await.unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
    }

    #[tokio::test]
    async fn create_job_rejects_inverted_window() {
        let d = dispatch();
        let mut req = valid_request();
        req.valid_until = req.scheduled_for - chrono::Duration::seconds(1);
        let err = d.create_job(req).await.unwrap_err();
        match err {
            DispatchError::Validation(ValidationError(errs)) => {
                assert!(errs.iter().any(|e| e.contains("scheduled_for")));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_job_accumulates_multiple_errors() {
        let d = dispatch();
        let mut req = valid_request();
        req.task_type = "".into();
        req.operation = "".into();
        let err = d.create_job(req).await.unwrap_err();
        match err {
            DispatchError::Validation(ValidationError(errs)) => assert_eq!(errs.len(), 2),
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pending_jobs_rejects_zero_limit() {
        let d = dispatch();
        d.create_job(valid_request()).await.unwrap();
        let err = d.pending_jobs(None, 0).await.unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
    }

    #[tokio::test]
    async fn pending_jobs_rejects_limit_above_max() {
        let d = dispatch();
        d.create_job(valid_request()).await.unwrap();
        let err = d.pending_jobs(None, 1001).await.unwrap_err();
        assert!(matches!(err, DispatchError::Validation(_)));
    }

    #[tokio::test]
    async fn pending_jobs_accepts_max_limit() {
        let d = dispatch();
        d.create_job(valid_request()).await.unwrap();
        let page = d.pending_jobs(None, 1000).await.unwrap();
        assert_eq!(page.items.len(), 1);
    }

    #[tokio::test]
    async fn assign_pending_job_requires_at_least_one_type() {
        let d = dispatch();
        let err = d.assign_pending_job("worker-1", None, &[]).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoJobTypesOffered));
    }

    #[tokio::test]
    async fn assign_pending_job_leases_from_offered_types() {
        let d = dispatch();
        d.create_job(valid_request()).await.unwrap();
        let leased = d
            .assign_pending_job("worker-1", None, &["bot.poll".to_string()])
            .await
            .unwrap();
        assert!(leased.is_some());
    }

    #[tokio::test]
    async fn mark_job_as_failed_increments_retry_count() {
        let d = dispatch();
        d.create_job(valid_request()).await.unwrap();
        let leased = d
            .assign_pending_job("worker-1", None, &["bot.poll".to_string()])
            .await
            .unwrap()
            .unwrap();
        let job = d.mark_job_as_failed(leased.job.id, "worker-1").await.unwrap();
        assert_eq!(job.retry_count, 1);
    }
}
