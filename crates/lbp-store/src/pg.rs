//! Postgres-backed [`Store`] implementation via `sqlx::PgPool`.
//!
//! Uses runtime-checked `query`/`query_as` rather than the `query!` family
//! of compile-time macros, so this crate builds without a live database
//! connection available at compile time.

use crate::error::{map_sqlx_error, StoreError};
use crate::{BackendPatch, NewBackend, NewJob, NewMessage, NewModel, NewPool, Page, PageCursor, Store};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lbp_core::{
    Backend, BackendKind, Job, KvEntry, LeasedJob, Message, MessageIndex, Model, Pool, PoolPurpose,
    Role,
};
use sqlx::{PgPool, Row};
use std::time::Duration;
use uuid::Uuid;

/// Postgres-backed production [`Store`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

/// A handle to an in-flight transaction against [`PgStore`].
///
/// Dropping an uncommitted `StoreTx` rolls back automatically (`sqlx`'s
/// `Transaction::drop` does this), so release is safe to call
/// unconditionally, matching  `WithTransaction` contract.
pub struct StoreTx<'a> {
    tx: sqlx::Transaction<'a, sqlx::Postgres>,
}

impl<'a> StoreTx<'a> {
    /// Commit the transaction.
    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await.map_err(|e| {
            StoreError::TxFailed(format!("commit failed: {e}"))
        })
    }

    /// Borrow the underlying executor for use with `sqlx::query*` calls.
    pub fn executor(&mut self) -> &mut sqlx::PgConnection {
        &mut self.tx
    }
}

impl PgStore {
    /// Wrap an existing connection pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url` and wrap the resulting pool.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(map_sqlx_error)?;
        Ok(Self::new(pool))
    }

    /// Run the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Operational(format!("migration failed: {e}")))
    }

    /// Begin a transaction.
    pub async fn begin(&self) -> Result<StoreTx<'_>, StoreError> {
        let tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        Ok(StoreTx { tx })
    }

    fn kind_to_str(kind: BackendKind) -> &'static str {
        match kind {
            BackendKind::SelfHostedGeneric => "self_hosted_generic",
            BackendKind::SelfHostedOpenAiCompatible => "self_hosted_openai_compatible",
            BackendKind::CloudA => "cloud_a",
            BackendKind::CloudB => "cloud_b",
        }
    }

    fn kind_from_str(s: &str) -> Result<BackendKind, StoreError> {
        match s {
            "self_hosted_generic" => Ok(BackendKind::SelfHostedGeneric),
            "self_hosted_openai_compatible" => Ok(BackendKind::SelfHostedOpenAiCompatible),
            "cloud_a" => Ok(BackendKind::CloudA),
            "cloud_b" => Ok(BackendKind::CloudB),
            other => Err(StoreError::InvalidInputSyntax(format!(
                "unknown backend kind '{other}'"
            ))),
        }
    }

    fn role_to_str(role: Role) -> &'static str {
        match role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Model => "model",
        }
    }

    fn role_from_str(s: &str) -> Result<Role, StoreError> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "model" => Ok(Role::Model),
            other => Err(StoreError::InvalidInputSyntax(format!(
                "unknown message role '{other}'"
            ))),
        }
    }

    fn job_from_row(row: &sqlx::postgres::PgRow) -> Result<Job, StoreError> {
        Ok(Job {
            id: row.try_get("id").map_err(map_sqlx_error)?,
            task_type: row.try_get("task_type").map_err(map_sqlx_error)?,
            operation: row.try_get("operation").map_err(map_sqlx_error)?,
            subject: row.try_get("subject").map_err(map_sqlx_error)?,
            entity_id: row.try_get("entity_id").map_err(map_sqlx_error)?,
            entity_type: row.try_get("entity_type").map_err(map_sqlx_error)?,
            payload: row.try_get("payload").map_err(map_sqlx_error)?,
            scheduled_for: row.try_get("scheduled_for").map_err(map_sqlx_error)?,
            valid_until: row.try_get("valid_until").map_err(map_sqlx_error)?,
            retry_count: row.try_get::<i32, _>("retry_count").map_err(map_sqlx_error)? as u32,
            created_at: row.try_get("created_at").map_err(map_sqlx_error)?,
        })
    }

    fn leased_job_from_row(row: &sqlx::postgres::PgRow) -> Result<LeasedJob, StoreError> {
        Ok(LeasedJob {
            job: Self::job_from_row(row)?,
            leaser: row.try_get("leaser").map_err(map_sqlx_error)?,
            lease_duration_secs: row
                .try_get::<i64, _>("lease_duration_secs")
                .map_err(map_sqlx_error)? as u64,
            lease_expiration: row.try_get("lease_expiration").map_err(map_sqlx_error)?,
        })
    }

    fn backend_from_row(row: &sqlx::postgres::PgRow) -> Result<Backend, StoreError> {
        let kind_str: String = row.try_get("kind").map_err(map_sqlx_error)?;
        Ok(Backend {
            id: row.try_get("id").map_err(map_sqlx_error)?,
            name: row.try_get("name").map_err(map_sqlx_error)?,
            base_url: row.try_get("base_url").map_err(map_sqlx_error)?,
            kind: Self::kind_from_str(&kind_str)?,
            api_key: row.try_get("api_key").map_err(map_sqlx_error)?,
            created_at: row.try_get("created_at").map_err(map_sqlx_error)?,
            updated_at: row.try_get("updated_at").map_err(map_sqlx_error)?,
        })
    }

    fn model_from_row(row: &sqlx::postgres::PgRow) -> Result<Model, StoreError> {
        Ok(Model {
            id: row.try_get("id").map_err(map_sqlx_error)?,
            name: row.try_get("name").map_err(map_sqlx_error)?,
            context_length: row
                .try_get::<Option<i32>, _>("context_length")
                .map_err(map_sqlx_error)?
                .map(|v| v as u32),
        })
    }

    fn pool_from_row(row: &sqlx::postgres::PgRow) -> Result<Pool, StoreError> {
        let purpose_str: String = row.try_get("purpose").map_err(map_sqlx_error)?;
        Ok(Pool {
            id: row.try_get("id").map_err(map_sqlx_error)?,
            name: row.try_get("name").map_err(map_sqlx_error)?,
            purpose: PoolPurpose::new(purpose_str)
                .map_err(|_| StoreError::CheckViolation("pool purpose must be non-empty".into()))?,
        })
    }

    fn message_from_row(row: &sqlx::postgres::PgRow) -> Result<Message, StoreError> {
        let role_str: String = row.try_get("role").map_err(map_sqlx_error)?;
        Ok(Message {
            idx: row.try_get("idx").map_err(map_sqlx_error)?,
            id: row.try_get("id").map_err(map_sqlx_error)?,
            role: Self::role_from_str(&role_str)?,
            content: row.try_get("content").map_err(map_sqlx_error)?,
            timestamp: row.try_get("timestamp").map_err(map_sqlx_error)?,
            added_at: row.try_get("added_at").map_err(map_sqlx_error)?,
        })
    }

    fn kv_from_row(row: &sqlx::postgres::PgRow) -> Result<KvEntry, StoreError> {
        Ok(KvEntry {
            prefix: row.try_get("prefix").map_err(map_sqlx_error)?,
            key: row.try_get("key").map_err(map_sqlx_error)?,
            value: row.try_get("value").map_err(map_sqlx_error)?,
            updated_at: row.try_get("updated_at").map_err(map_sqlx_error)?,
        })
    }
}

const JOB_COLUMNS: &str = "id, task_type, operation, subject, entity_id, entity_type, payload, \
     scheduled_for, valid_until, retry_count, created_at";

#[async_trait]
impl Store for PgStore {
    async fn append_job(&self, job: NewJob) -> Result<Job, StoreError> {
        let id = Uuid::new_v4();
        let created_at = Utc::now();
        sqlx::query(
            "INSERT INTO job_queue (id, task_type, operation, subject, entity_id, entity_type, \
             payload, scheduled_for, valid_until, retry_count, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 0, $10)",
        )
        .bind(id)
        .bind(&job.task_type)
        .bind(&job.operation)
        .bind(&job.subject)
        .bind(&job.entity_id)
        .bind(&job.entity_type)
        .bind(&job.payload)
        .bind(job.scheduled_for)
        .bind(job.valid_until)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(Job {
            id,
            task_type: job.task_type,
            operation: job.operation,
            subject: job.subject,
            entity_id: job.entity_id,
            entity_type: job.entity_type,
            payload: job.payload,
            scheduled_for: job.scheduled_for,
            valid_until: job.valid_until,
            retry_count: 0,
            created_at,
        })
    }

    async fn pop_job_for_type(&self, task_type: &str) -> Result<Option<Job>, StoreError> {
        let sql = format!(
            "DELETE FROM job_queue WHERE id = (\
               SELECT id FROM job_queue WHERE task_type = $1 \
               ORDER BY created_at ASC, id ASC LIMIT 1 FOR UPDATE SKIP LOCKED) \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(task_type)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.map(|r| Self::job_from_row(&r)).transpose()
    }

    async fn pop_jobs_for_type(&self, task_type: &str, limit: i64) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "DELETE FROM job_queue WHERE id IN (\
               SELECT id FROM job_queue WHERE task_type = $1 \
               ORDER BY created_at ASC, id ASC LIMIT $2 FOR UPDATE SKIP LOCKED) \
             RETURNING {JOB_COLUMNS}"
        );
        let rows = sqlx::query(&sql)
            .bind(task_type)
            .bind(limit.max(0))
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(Self::job_from_row).collect()
    }

    async fn get_jobs_for_type(&self, task_type: &str) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM job_queue WHERE task_type = $1 ORDER BY created_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(task_type)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(Self::job_from_row).collect()
    }

    async fn list_jobs(&self, cursor: Option<PageCursor>, limit: i64) -> Result<Page<Job>, StoreError> {
        let rows = match cursor {
            None => {
                let sql = format!(
                    "SELECT {JOB_COLUMNS} FROM job_queue ORDER BY created_at DESC, id DESC LIMIT $1"
                );
                sqlx::query(&sql)
                    .bind(limit + 1)
                    .fetch_all(&self.pool)
                    .await
            }
            Some(c) => {
                let sql = format!(
                    "SELECT {JOB_COLUMNS} FROM job_queue WHERE (created_at, id) < ($1, $2) \
                     ORDER BY created_at DESC, id DESC LIMIT $3"
                );
                sqlx::query(&sql)
                    .bind(c.created_at)
                    .bind(c.id)
                    .bind(limit + 1)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(map_sqlx_error)?;
        paginate(rows, limit, Self::job_from_row, |j| PageCursor {
            created_at: j.created_at,
            id: j.id,
        })
    }

    async fn lease_job_for_type(
        &self,
        task_type: &str,
        leaser: &str,
        lease_duration: Duration,
    ) -> Result<Option<LeasedJob>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let sql = format!(
            "DELETE FROM job_queue WHERE id = (\
               SELECT id FROM job_queue WHERE task_type = $1 \
               ORDER BY created_at ASC, id ASC LIMIT 1 FOR UPDATE SKIP LOCKED) \
             RETURNING {JOB_COLUMNS}"
        );
        let row = sqlx::query(&sql)
            .bind(task_type)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        let Some(row) = row else {
            tx.rollback().await.map_err(map_sqlx_error)?;
            return Ok(None);
        };
        let job = Self::job_from_row(&row)?;
        let lease_expiration =
            Utc::now() + chrono::Duration::from_std(lease_duration).unwrap_or_default();
        sqlx::query(
            "INSERT INTO leased_jobs (id, task_type, operation, subject, entity_id, entity_type, \
             payload, scheduled_for, valid_until, retry_count, created_at, leaser, \
             lease_duration_secs, lease_expiration) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)",
        )
        .bind(job.id)
        .bind(&job.task_type)
        .bind(&job.operation)
        .bind(&job.subject)
        .bind(&job.entity_id)
        .bind(&job.entity_type)
        .bind(&job.payload)
        .bind(job.scheduled_for)
        .bind(job.valid_until)
        .bind(job.retry_count as i32)
        .bind(job.created_at)
        .bind(leaser)
        .bind(lease_duration.as_secs() as i64)
        .bind(lease_expiration)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(Some(LeasedJob {
            job,
            leaser: leaser.to_string(),
            lease_duration_secs: lease_duration.as_secs(),
            lease_expiration,
        }))
    }

    async fn get_leased_job(&self, id: Uuid) -> Result<Option<LeasedJob>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS}, leaser, lease_duration_secs, lease_expiration \
             FROM leased_jobs WHERE id = $1"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        row.map(|r| Self::leased_job_from_row(&r)).transpose()
    }

    async fn delete_leased_job(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM leased_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn list_leased_jobs(
        &self,
        cursor: Option<PageCursor>,
        limit: i64,
    ) -> Result<Page<LeasedJob>, StoreError> {
        let rows = match cursor {
            None => {
                let sql = format!(
                    "SELECT {JOB_COLUMNS}, leaser, lease_duration_secs, lease_expiration \
                     FROM leased_jobs ORDER BY created_at DESC, id DESC LIMIT $1"
                );
                sqlx::query(&sql)
                    .bind(limit + 1)
                    .fetch_all(&self.pool)
                    .await
            }
            Some(c) => {
                let sql = format!(
                    "SELECT {JOB_COLUMNS}, leaser, lease_duration_secs, lease_expiration \
                     FROM leased_jobs WHERE (created_at, id) < ($1, $2) \
                     ORDER BY created_at DESC, id DESC LIMIT $3"
                );
                sqlx::query(&sql)
                    .bind(c.created_at)
                    .bind(c.id)
                    .bind(limit + 1)
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .map_err(map_sqlx_error)?;
        paginate(rows, limit, Self::leased_job_from_row, |j| PageCursor {
            created_at: j.job.created_at,
            id: j.job.id,
        })
    }

    async fn mark_leased_job_done(&self, id: Uuid, leaser: &str) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let row = sqlx::query("SELECT leaser FROM leased_jobs WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        let Some(row) = row else {
            return Err(StoreError::NotFound(format!("leased job {id}")));
        };
        let stored_leaser: String = row.try_get("leaser").map_err(map_sqlx_error)?;
        if stored_leaser != leaser {
            return Err(StoreError::LeaseMismatch(format!(
                "job {id} is leased by '{stored_leaser}', not '{leaser}'"
            )));
        }
        sqlx::query("DELETE FROM leased_jobs WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn retry_leased_job(&self, id: Uuid, leaser: &str) -> Result<Job, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let sql = format!(
            "SELECT {JOB_COLUMNS}, leaser, lease_duration_secs, lease_expiration \
             FROM leased_jobs WHERE id = $1 FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        let Some(row) = row else {
            return Err(StoreError::NotFound(format!("leased job {id}")));
        };
        let leased = Self::leased_job_from_row(&row)?;
        if leased.leaser != leaser {
            return Err(StoreError::LeaseMismatch(format!(
                "job {id} is leased by '{}', not '{leaser}'",
                leased.leaser
            )));
        }
        sqlx::query("DELETE FROM leased_jobs WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
        let mut job = leased.job;
        job.retry_count += 1;
        sqlx::query(
            "INSERT INTO job_queue (id, task_type, operation, subject, entity_id, entity_type, \
             payload, scheduled_for, valid_until, retry_count, created_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
        )
        .bind(job.id)
        .bind(&job.task_type)
        .bind(&job.operation)
        .bind(&job.subject)
        .bind(&job.entity_id)
        .bind(&job.entity_type)
        .bind(&job.payload)
        .bind(job.scheduled_for)
        .bind(job.valid_until)
        .bind(job.retry_count as i32)
        .bind(job.created_at)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(job)
    }

    async fn recover_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let sql = format!(
            "SELECT id, leaser, lease_duration_secs, lease_expiration FROM leased_jobs \
             WHERE lease_expiration <= $1"
        );
        let expired_ids: Vec<Uuid> = sqlx::query(&sql)
            .bind(now)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?
            .iter()
            .map(|r| r.try_get::<Uuid, _>("id"))
            .collect::<Result<_, _>>()
            .map_err(map_sqlx_error)?;
        let mut recovered = 0u64;
        for id in expired_ids {
            let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
            let job_sql = format!(
                "SELECT {JOB_COLUMNS} FROM leased_jobs WHERE id = $1 AND lease_expiration <= $2 \
                 FOR UPDATE"
            );
            let row = sqlx::query(&job_sql)
                .bind(id)
                .bind(now)
                .fetch_optional(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
            let Some(row) = row else {
                tx.rollback().await.map_err(map_sqlx_error)?;
                continue;
            };
            let job = Self::job_from_row(&row)?;
            sqlx::query("DELETE FROM leased_jobs WHERE id = $1")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
            sqlx::query(
                "INSERT INTO job_queue (id, task_type, operation, subject, entity_id, \
                 entity_type, payload, scheduled_for, valid_until, retry_count, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(job.id)
            .bind(&job.task_type)
            .bind(&job.operation)
            .bind(&job.subject)
            .bind(&job.entity_id)
            .bind(&job.entity_type)
            .bind(&job.payload)
            .bind(job.scheduled_for)
            .bind(job.valid_until)
            .bind(job.retry_count as i32)
            .bind(job.created_at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
            tx.commit().await.map_err(map_sqlx_error)?;
            recovered += 1;
        }
        Ok(recovered)
    }

    async fn create_message_index(&self, identity: &str) -> Result<MessageIndex, StoreError> {
        let idx = MessageIndex {
            idx: Uuid::new_v4(),
            identity: identity.to_string(),
            created_at: Utc::now(),
        };
        sqlx::query("INSERT INTO message_indices (idx, identity, created_at) VALUES ($1, $2, $3)")
            .bind(idx.idx)
            .bind(&idx.identity)
            .bind(idx.created_at)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(idx)
    }

    async fn append_messages(
        &self,
        idx: Uuid,
        messages: Vec<NewMessage>,
    ) -> Result<Vec<Message>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        let added_at = Utc::now();
        let mut rows = Vec::with_capacity(messages.len());
        for m in messages {
            sqlx::query(
                "INSERT INTO messages (idx, id, role, content, timestamp, added_at) \
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(idx)
            .bind(&m.id)
            .bind(Self::role_to_str(m.role))
            .bind(&m.content)
            .bind(m.timestamp)
            .bind(added_at)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;
            rows.push(Message {
                idx,
                id: m.id,
                role: m.role,
                content: m.content,
                timestamp: m.timestamp,
                added_at,
            });
        }
        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(rows)
    }

    async fn list_messages(&self, idx: Uuid) -> Result<Vec<Message>, StoreError> {
        let rows = sqlx::query(
            "SELECT idx, id, role, content, timestamp, added_at FROM messages \
             WHERE idx = $1 ORDER BY added_at ASC, id ASC",
        )
        .bind(idx)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        rows.iter().map(Self::message_from_row).collect()
    }

    async fn delete_messages(&self, idx: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM messages WHERE idx = $1")
            .bind(idx)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn set_kv(
        &self,
        prefix: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<KvEntry, StoreError> {
        let updated_at = Utc::now();
        sqlx::query(
            "INSERT INTO kv (prefix, key, value, updated_at) VALUES ($1, $2, $3, $4) \
             ON CONFLICT (prefix, key) DO UPDATE SET value = EXCLUDED.value, \
             updated_at = EXCLUDED.updated_at",
        )
        .bind(prefix)
        .bind(key)
        .bind(&value)
        .bind(updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(KvEntry {
            prefix: prefix.to_string(),
            key: key.to_string(),
            value,
            updated_at,
        })
    }

    async fn delete_kv(&self, prefix: &str, key: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM kv WHERE prefix = $1 AND key = $2")
            .bind(prefix)
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn list_kv(&self) -> Result<Vec<KvEntry>, StoreError> {
        let rows = sqlx::query("SELECT prefix, key, value, updated_at FROM kv")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(Self::kv_from_row).collect()
    }

    async fn list_kv_prefix(&self, prefix: &str) -> Result<Vec<KvEntry>, StoreError> {
        if prefix.is_empty() {
            return self.list_kv().await;
        }
        let rows = sqlx::query("SELECT prefix, key, value, updated_at FROM kv WHERE prefix = $1")
            .bind(prefix)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(Self::kv_from_row).collect()
    }

    async fn create_backend(&self, backend: NewBackend) -> Result<Backend, StoreError> {
        let now = Utc::now();
        let row = Backend {
            id: Uuid::new_v4(),
            name: backend.name,
            base_url: backend.base_url,
            kind: backend.kind,
            api_key: backend.api_key,
            created_at: now,
            updated_at: now,
        };
        sqlx::query(
            "INSERT INTO backends (id, name, base_url, kind, api_key, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(row.id)
        .bind(&row.name)
        .bind(&row.base_url)
        .bind(Self::kind_to_str(row.kind))
        .bind(&row.api_key)
        .bind(row.created_at)
        .bind(row.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(row)
    }

    async fn update_backend(&self, id: Uuid, patch: BackendPatch) -> Result<Backend, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, base_url, kind, api_key, created_at, updated_at FROM backends \
             WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        let Some(row) = row else {
            return Err(StoreError::NotFound(format!("backend {id}")));
        };
        let mut current = Self::backend_from_row(&row)?;
        if let Some(name) = patch.name {
            current.name = name;
        }
        if let Some(base_url) = patch.base_url {
            current.base_url = base_url;
        }
        if let Some(api_key) = patch.api_key {
            current.api_key = api_key;
        }
        current.updated_at = Utc::now();
        sqlx::query(
            "UPDATE backends SET name = $2, base_url = $3, api_key = $4, updated_at = $5 \
             WHERE id = $1",
        )
        .bind(current.id)
        .bind(&current.name)
        .bind(&current.base_url)
        .bind(&current.api_key)
        .bind(current.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(current)
    }

    async fn delete_backend(&self, id: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM backends WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn get_backend(&self, id: Uuid) -> Result<Option<Backend>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, base_url, kind, api_key, created_at, updated_at FROM backends \
             WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        row.map(|r| Self::backend_from_row(&r)).transpose()
    }

    async fn list_backends(&self) -> Result<Vec<Backend>, StoreError> {
        let rows = sqlx::query(
            "SELECT id, name, base_url, kind, api_key, created_at, updated_at FROM backends \
             ORDER BY name ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        rows.iter().map(Self::backend_from_row).collect()
    }

    async fn create_model(&self, model: NewModel) -> Result<Model, StoreError> {
        let row = Model {
            id: Uuid::new_v4(),
            name: model.name,
            context_length: model.context_length,
        };
        sqlx::query("INSERT INTO models (id, name, context_length) VALUES ($1, $2, $3)")
            .bind(row.id)
            .bind(&row.name)
            .bind(row.context_length.map(|v| v as i32))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(row)
    }

    async fn list_models(&self) -> Result<Vec<Model>, StoreError> {
        let rows = sqlx::query("SELECT id, name, context_length FROM models ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(Self::model_from_row).collect()
    }

    async fn create_pool(&self, pool: NewPool) -> Result<Pool, StoreError> {
        let row = Pool {
            id: Uuid::new_v4(),
            name: pool.name,
            purpose: pool.purpose,
        };
        sqlx::query("INSERT INTO pools (id, name, purpose) VALUES ($1, $2, $3)")
            .bind(row.id)
            .bind(&row.name)
            .bind(row.purpose.as_str())
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(row)
    }

    async fn list_pools(&self) -> Result<Vec<Pool>, StoreError> {
        let rows = sqlx::query("SELECT id, name, purpose FROM pools ORDER BY name ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        rows.iter().map(Self::pool_from_row).collect()
    }

    async fn assign_backend_to_pool(&self, pool_id: Uuid, backend_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO pool_backends (pool_id, backend_id) VALUES ($1, $2) \
             ON CONFLICT DO NOTHING",
        )
        .bind(pool_id)
        .bind(backend_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn assign_model_to_pool(&self, pool_id: Uuid, model_id: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO pool_models (pool_id, model_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        )
        .bind(pool_id)
        .bind(model_id)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        Ok(())
    }

    async fn backends_in_pool(&self, pool_id: Uuid) -> Result<Vec<Backend>, StoreError> {
        let rows = sqlx::query(
            "SELECT b.id, b.name, b.base_url, b.kind, b.api_key, b.created_at, b.updated_at \
             FROM backends b JOIN pool_backends pb ON pb.backend_id = b.id \
             WHERE pb.pool_id = $1",
        )
        .bind(pool_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        rows.iter().map(Self::backend_from_row).collect()
    }

    async fn models_in_pool(&self, pool_id: Uuid) -> Result<Vec<Model>, StoreError> {
        let rows = sqlx::query(
            "SELECT m.id, m.name, m.context_length FROM models m \
             JOIN pool_models pm ON pm.model_id = m.id WHERE pm.pool_id = $1",
        )
        .bind(pool_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        rows.iter().map(Self::model_from_row).collect()
    }

    async fn pools_for_backend(&self, backend_id: Uuid) -> Result<Vec<Pool>, StoreError> {
        let rows = sqlx::query(
            "SELECT p.id, p.name, p.purpose FROM pools p \
             JOIN pool_backends pb ON pb.pool_id = p.id WHERE pb.backend_id = $1",
        )
        .bind(backend_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx_error)?;
        rows.iter().map(Self::pool_from_row).collect()
    }
}

/// Shared pagination helper: `rows` was fetched with `limit + 1` so we can
/// detect whether a next page exists without a second round trip.
fn paginate<T>(
    rows: Vec<sqlx::postgres::PgRow>,
    limit: i64,
    from_row: impl Fn(&sqlx::postgres::PgRow) -> Result<T, StoreError>,
    cursor_of: impl Fn(&T) -> PageCursor,
) -> Result<Page<T>, StoreError> {
    let limit = limit.max(0) as usize;
    let has_more = rows.len() > limit;
    let mut items: Vec<T> = rows
        .iter()
        .take(limit)
        .map(from_row)
        .collect::<Result<_, _>>()?;
    let next_cursor = if has_more {
        items.last().map(|t| cursor_of(t).encode())
    } else {
        None
    };
    // `take` above already truncated; nothing further to drop.
    items.truncate(limit);
    Ok(Page { items, next_cursor })
}
