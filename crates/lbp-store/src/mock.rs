//! In-memory [`Store`] fake used throughout this workspace's test suites.
//!
//! Every invariant the production [`crate::pg::PgStore`] must uphold —
//! pending/leased single-occupancy, message ordering, KV prefix scoping — is
//! enforced here too, so tests exercising `MockStore` are meaningful tests of
//! the contract, not just of a stub.

use crate::{
    BackendPatch, NewBackend, NewJob, NewMessage, NewModel, NewPool, Page, PageCursor, Store,
    StoreError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lbp_core::{Backend, Job, KvEntry, LeasedJob, Message, MessageIndex, Model, Pool};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    leased: HashMap<Uuid, LeasedJob>,
    message_indices: HashMap<Uuid, MessageIndex>,
    messages: HashMap<Uuid, Vec<Message>>,
    kv: HashMap<(String, String), KvEntry>,
    backends: HashMap<Uuid, Backend>,
    models: HashMap<Uuid, Model>,
    pools: HashMap<Uuid, Pool>,
    pool_backends: HashSet<(Uuid, Uuid)>,
    pool_models: HashSet<(Uuid, Uuid)>,
}

/// An in-memory [`Store`] implementation. Cheap to construct; safe to share
/// via `Arc` across concurrent tasks.
#[derive(Default)]
pub struct MockStore {
    inner: Mutex<Inner>,
}

impl MockStore {
    /// Construct an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("mock store lock poisoned")
    }
}

fn page_of<T: Clone>(
    mut items: Vec<(DateTime<Utc>, Uuid, T)>,
    cursor: Option<PageCursor>,
    limit: i64,
) -> Page<T> {
    // Newest created_at first; ties broken by id descending for a total order.
    items.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));
    let start = match cursor {
        None => 0,
        Some(c) => items
            .iter()
            .position(|(ts, id, _)| (*ts, *id) < (c.created_at, c.id))
            .unwrap_or(items.len()),
    };
    let limit = limit.max(0) as usize;
    let page: Vec<_> = items.iter().skip(start).take(limit).cloned().collect();
    let next_cursor = if start + page.len() < items.len() {
        page.last().map(|(ts, id, _)| {
            PageCursor {
                created_at: *ts,
                id: *id,
            }
            .encode()
        })
    } else {
        None
    };
    Page {
        items: page.into_iter().map(|(_, _, v)| v).collect(),
        next_cursor,
    }
}

#[async_trait]
impl Store for MockStore {
    async fn append_job(&self, job: NewJob) -> Result<Job, StoreError> {
        let mut inner = self.lock();
        let created = Job {
            id: Uuid::new_v4(),
            task_type: job.task_type,
            operation: job.operation,
            subject: job.subject,
            entity_id: job.entity_id,
            entity_type: job.entity_type,
            payload: job.payload,
            scheduled_for: job.scheduled_for,
            valid_until: job.valid_until,
            retry_count: 0,
            created_at: Utc::now(),
        };
        inner.jobs.insert(created.id, created.clone());
        Ok(created)
    }

    async fn pop_job_for_type(&self, task_type: &str) -> Result<Option<Job>, StoreError> {
        let mut inner = self.lock();
        let next_id = inner
            .jobs
            .values()
            .filter(|j| j.task_type == task_type)
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
            .map(|j| j.id);
        Ok(next_id.and_then(|id| inner.jobs.remove(&id)))
    }

    async fn pop_jobs_for_type(&self, task_type: &str, limit: i64) -> Result<Vec<Job>, StoreError> {
        let mut out = Vec::new();
        for _ in 0..limit.max(0) {
            match self.pop_job_for_type(task_type).await? {
                Some(j) => out.push(j),
                None => break,
            }
        }
        Ok(out)
    }

    async fn get_jobs_for_type(&self, task_type: &str) -> Result<Vec<Job>, StoreError> {
        let inner = self.lock();
        let mut out: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| j.task_type == task_type)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn list_jobs(&self, cursor: Option<PageCursor>, limit: i64) -> Result<Page<Job>, StoreError> {
        let inner = self.lock();
        let items = inner
            .jobs
            .values()
            .map(|j| (j.created_at, j.id, j.clone()))
            .collect();
        Ok(page_of(items, cursor, limit))
    }

    async fn lease_job_for_type(
        &self,
        task_type: &str,
        leaser: &str,
        lease_duration: Duration,
    ) -> Result<Option<LeasedJob>, StoreError> {
        let mut inner = self.lock();
        let next_id = inner
            .jobs
            .values()
            .filter(|j| j.task_type == task_type)
            .min_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
            .map(|j| j.id);
        let Some(id) = next_id else { return Ok(None) };
        let job = inner.jobs.remove(&id).expect("id just found");
        let leased = LeasedJob {
            job,
            leaser: leaser.to_string(),
            lease_duration_secs: lease_duration.as_secs(),
            lease_expiration: Utc::now() + chrono::Duration::from_std(lease_duration).unwrap_or_default(),
        };
        inner.leased.insert(id, leased.clone());
        Ok(Some(leased))
    }

    async fn get_leased_job(&self, id: Uuid) -> Result<Option<LeasedJob>, StoreError> {
        Ok(self.lock().leased.get(&id).cloned())
    }

    async fn delete_leased_job(&self, id: Uuid) -> Result<(), StoreError> {
        self.lock().leased.remove(&id);
        Ok(())
    }

    async fn list_leased_jobs(
        &self,
        cursor: Option<PageCursor>,
        limit: i64,
    ) -> Result<Page<LeasedJob>, StoreError> {
        let inner = self.lock();
        let items = inner
            .leased
            .values()
            .map(|j| (j.job.created_at, j.job.id, j.clone()))
            .collect();
        Ok(page_of(items, cursor, limit))
    }

    async fn mark_leased_job_done(&self, id: Uuid, leaser: &str) -> Result<(), StoreError> {
        let mut inner = self.lock();
        match inner.leased.get(&id) {
            None => Err(StoreError::NotFound(format!("leased job {id}"))),
            Some(leased) if leased.leaser != leaser => {
                Err(StoreError::LeaseMismatch(format!(
                    "job {id} is leased by '{}', not '{leaser}'",
                    leased.leaser
                )))
            }
            Some(_) => {
                inner.leased.remove(&id);
                Ok(())
            }
        }
    }

    async fn retry_leased_job(&self, id: Uuid, leaser: &str) -> Result<Job, StoreError> {
        let mut inner = self.lock();
        let leased = match inner.leased.get(&id) {
            None => return Err(StoreError::NotFound(format!("leased job {id}"))),
            Some(l) if l.leaser != leaser => {
                return Err(StoreError::LeaseMismatch(format!(
                    "job {id} is leased by '{}', not '{leaser}'",
                    l.leaser
                )))
            }
            Some(l) => l.clone(),
        };
        inner.leased.remove(&id);
        let mut job = leased.job;
        job.retry_count += 1;
        inner.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn recover_expired_leases(&self, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut inner = self.lock();
        let expired: Vec<Uuid> = inner
            .leased
            .values()
            .filter(|l| l.lease_expiration <= now)
            .map(|l| l.job.id)
            .collect();
        let count = expired.len() as u64;
        for id in expired {
            if let Some(leased) = inner.leased.remove(&id) {
                inner.jobs.insert(leased.job.id, leased.job);
            }
        }
        Ok(count)
    }

    async fn create_message_index(&self, identity: &str) -> Result<MessageIndex, StoreError> {
        let mut inner = self.lock();
        let idx = MessageIndex {
            idx: Uuid::new_v4(),
            identity: identity.to_string(),
            created_at: Utc::now(),
        };
        inner.message_indices.insert(idx.idx, idx.clone());
        inner.messages.insert(idx.idx, Vec::new());
        Ok(idx)
    }

    async fn append_messages(
        &self,
        idx: Uuid,
        messages: Vec<NewMessage>,
    ) -> Result<Vec<Message>, StoreError> {
        let mut inner = self.lock();
        if !inner.message_indices.contains_key(&idx) {
            return Err(StoreError::ForeignKeyViolation(format!(
                "message index {idx} does not exist"
            )));
        }
        let existing = inner.messages.entry(idx).or_default();
        let mut seen: HashSet<&str> = existing.iter().map(|m| m.id.as_str()).collect();
        for m in &messages {
            if !seen.insert(m.id.as_str()) {
                return Err(StoreError::UniqueViolation(format!(
                    "duplicate message id '{}' for idx {idx}",
                    m.id
                )));
            }
        }
        let added_at = Utc::now();
        let mut appended = Vec::with_capacity(messages.len());
        for m in messages {
            let row = Message {
                idx,
                id: m.id,
                role: m.role,
                content: m.content,
                timestamp: m.timestamp,
                added_at,
            };
            existing.push(row.clone());
            appended.push(row);
        }
        Ok(appended)
    }

    async fn list_messages(&self, idx: Uuid) -> Result<Vec<Message>, StoreError> {
        let inner = self.lock();
        let mut rows = inner.messages.get(&idx).cloned().unwrap_or_default();
        rows.sort_by(|a, b| a.added_at.cmp(&b.added_at).then_with(|| a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn delete_messages(&self, idx: Uuid) -> Result<(), StoreError> {
        if let Some(rows) = self.lock().messages.get_mut(&idx) {
            rows.clear();
        }
        Ok(())
    }

    async fn set_kv(
        &self,
        prefix: &str,
        key: &str,
        value: serde_json::Value,
    ) -> Result<KvEntry, StoreError> {
        let mut inner = self.lock();
        let entry = KvEntry {
            prefix: prefix.to_string(),
            key: key.to_string(),
            value,
            updated_at: Utc::now(),
        };
        inner
            .kv
            .insert((prefix.to_string(), key.to_string()), entry.clone());
        Ok(entry)
    }

    async fn delete_kv(&self, prefix: &str, key: &str) -> Result<(), StoreError> {
        self.lock().kv.remove(&(prefix.to_string(), key.to_string()));
        Ok(())
    }

    async fn list_kv(&self) -> Result<Vec<KvEntry>, StoreError> {
        Ok(self.lock().kv.values().cloned().collect())
    }

    async fn list_kv_prefix(&self, prefix: &str) -> Result<Vec<KvEntry>, StoreError> {
        let inner = self.lock();
        if prefix.is_empty() {
            return Ok(inner.kv.values().cloned().collect());
        }
        Ok(inner
            .kv
            .values()
            .filter(|e| e.prefix == prefix)
            .cloned()
            .collect())
    }

    async fn create_backend(&self, backend: NewBackend) -> Result<Backend, StoreError> {
        let mut inner = self.lock();
        if inner.backends.values().any(|b| b.name == backend.name) {
            return Err(StoreError::UniqueViolation(format!(
                "backend name '{}' already exists",
                backend.name
            )));
        }
        if inner.backends.values().any(|b| b.base_url == backend.base_url) {
            return Err(StoreError::UniqueViolation(format!(
                "backend base_url '{}' already exists",
                backend.base_url
            )));
        }
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
        inner.backends.insert(row.id, row.clone());
        Ok(row)
    }

    async fn update_backend(&self, id: Uuid, patch: BackendPatch) -> Result<Backend, StoreError> {
        let mut inner = self.lock();
        let Some(mut row) = inner.backends.get(&id).cloned() else {
            return Err(StoreError::NotFound(format!("backend {id}")));
        };
        if let Some(name) = patch.name {
            if inner.backends.values().any(|b| b.id != id && b.name == name) {
                return Err(StoreError::UniqueViolation(format!(
                    "backend name '{name}' already exists"
                )));
            }
            row.name = name;
        }
        if let Some(base_url) = patch.base_url {
            if inner
                .backends
                .values()
                .any(|b| b.id != id && b.base_url == base_url)
            {
                return Err(StoreError::UniqueViolation(format!(
                    "backend base_url '{base_url}' already exists"
                )));
            }
            row.base_url = base_url;
        }
        if let Some(api_key) = patch.api_key {
            row.api_key = api_key;
        }
        row.updated_at = Utc::now();
        inner.backends.insert(id, row.clone());
        Ok(row)
    }

    async fn delete_backend(&self, id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.lock();
        inner.backends.remove(&id);
        inner.pool_backends.retain(|(_, b)| *b != id);
        Ok(())
    }

    async fn get_backend(&self, id: Uuid) -> Result<Option<Backend>, StoreError> {
        Ok(self.lock().backends.get(&id).cloned())
    }

    async fn list_backends(&self) -> Result<Vec<Backend>, StoreError> {
        Ok(self.lock().backends.values().cloned().collect())
    }

    async fn create_model(&self, model: NewModel) -> Result<Model, StoreError> {
        let mut inner = self.lock();
        if inner.models.values().any(|m| m.name == model.name) {
            return Err(StoreError::UniqueViolation(format!(
                "model name '{}' already exists",
                model.name
            )));
        }
        let row = Model {
            id: Uuid::new_v4(),
            name: model.name,
            context_length: model.context_length,
        };
        inner.models.insert(row.id, row.clone());
        Ok(row)
    }

    async fn list_models(&self) -> Result<Vec<Model>, StoreError> {
        Ok(self.lock().models.values().cloned().collect())
    }

    async fn create_pool(&self, pool: NewPool) -> Result<Pool, StoreError> {
        let mut inner = self.lock();
        if inner.pools.values().any(|p| p.name == pool.name) {
            return Err(StoreError::UniqueViolation(format!(
                "pool name '{}' already exists",
                pool.name
            )));
        }
        let row = Pool {
            id: Uuid::new_v4(),
            name: pool.name,
            purpose: pool.purpose,
        };
        inner.pools.insert(row.id, row.clone());
        Ok(row)
    }

    async fn list_pools(&self) -> Result<Vec<Pool>, StoreError> {
        Ok(self.lock().pools.values().cloned().collect())
    }

    async fn assign_backend_to_pool(&self, pool_id: Uuid, backend_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if !inner.pools.contains_key(&pool_id) {
            return Err(StoreError::ForeignKeyViolation(format!("pool {pool_id}")));
        }
        if !inner.backends.contains_key(&backend_id) {
            return Err(StoreError::ForeignKeyViolation(format!("backend {backend_id}")));
        }
        inner.pool_backends.insert((pool_id, backend_id));
        Ok(())
    }

    async fn assign_model_to_pool(&self, pool_id: Uuid, model_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.lock();
        if !inner.pools.contains_key(&pool_id) {
            return Err(StoreError::ForeignKeyViolation(format!("pool {pool_id}")));
        }
        if !inner.models.contains_key(&model_id) {
            return Err(StoreError::ForeignKeyViolation(format!("model {model_id}")));
        }
        inner.pool_models.insert((pool_id, model_id));
        Ok(())
    }

    async fn backends_in_pool(&self, pool_id: Uuid) -> Result<Vec<Backend>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .pool_backends
            .iter()
            .filter(|(p, _)| *p == pool_id)
            .filter_map(|(_, b)| inner.backends.get(b).cloned())
            .collect())
    }

    async fn models_in_pool(&self, pool_id: Uuid) -> Result<Vec<Model>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .pool_models
            .iter()
            .filter(|(p, _)| *p == pool_id)
            .filter_map(|(_, m)| inner.models.get(m).cloned())
            .collect())
    }

    async fn pools_for_backend(&self, backend_id: Uuid) -> Result<Vec<Pool>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .pool_backends
            .iter()
            .filter(|(_, b)| *b == backend_id)
            .filter_map(|(p, _)| inner.pools.get(p).cloned())
            .collect())
    }
}
