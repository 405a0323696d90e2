// SPDX-License-Identifier: MIT OR Apache-2.0
//! Periodic bot poller: converts external events into jobs
//! via pluggable [`Fetcher`]s.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use async_trait::async_trait;
use lbp_error::{ErrorCode, LbpError};
use lbp_store::{NewJob, Store};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// An opaque external-source binding (GitHub repo, Telegram frontend, or
/// similar) treated as an opaque collaborator record by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bot {
    /// Unique identifier.
    pub id: Uuid,
    /// Registered fetcher key; looked up in the [`FetcherRegistry`] under
    /// this bot's type.
    pub bot_type: String,
    /// `taskType` assigned to every job this bot's updates become.
    pub job_type: String,
    /// Optional chain id threaded into every produced job's payload.
    pub task_chain_id: Option<String>,
    /// Fetcher-opaque resume cursor (e.g. a Telegram `offset` or a GitHub
    /// `since` timestamp), round-tripped through [`Fetcher::fetch_updates`].
    pub state: serde_json::Value,
}

/// Where registered [`Bot`]s live. Bots are an out-of-core entity —
/// integrations with specific chat platforms or code hosts are external
/// collaborators — this crate only needs to list and persist
/// their state, not own their full lifecycle.
#[async_trait]
pub trait BotSource: Send + Sync {
    /// List every bot currently registered for polling.
    async fn list_bots(&self) -> Result<Vec<Bot>, LbpError>;
    /// Persist `state` as the new resume cursor for `bot_id`.
    async fn update_bot_state(&self, bot_id: Uuid, state: serde_json::Value) -> Result<(), LbpError>;
}

/// One fetcher capability implementation, keyed by [`Bot::bot_type`] in a
/// [`FetcherRegistry`]. Fetchers are pluggable capability implementations;
/// the core treats updates as opaque JSON-encodable values.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch new updates given the bot's current `state`, returning the
    /// updates plus the state to persist afterward.
    async fn fetch_updates(
        &self,
        state: serde_json::Value,
    ) -> Result<(Vec<serde_json::Value>, serde_json::Value), LbpError>;
}

/// A registry of [`Fetcher`]s keyed by bot type.
#[derive(Default, Clone)]
pub struct FetcherRegistry {
    fetchers: HashMap<String, Arc<dyn Fetcher>>,
}

impl FetcherRegistry {
    /// Construct an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fetcher under `bot_type`. Replaces any prior registration
    /// for the same type.
    pub fn register(&mut self, bot_type: impl Into<String>, fetcher: Arc<dyn Fetcher>) {
        self.fetchers.insert(bot_type.into(), fetcher);
    }

    /// Look up the fetcher registered for `bot_type`.
    #[must_use]
    pub fn get(&self, bot_type: &str) -> Option<Arc<dyn Fetcher>> {
        self.fetchers.get(bot_type).cloned()
    }
}

/// Payload of a job produced from one bot update.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct BotUpdatePayload {
    bot_id: Uuid,
    update: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    chain_id: Option<String>,
}

/// Outcome of polling a single bot, for callers that want per-bot
/// visibility into an otherwise best-effort cycle.
#[derive(Debug, Clone)]
pub enum BotOutcome {
    /// New jobs were appended and the bot's state advanced.
    Polled {
        /// The bot polled.
        bot_id: Uuid,
        /// Number of jobs appended.
        jobs_appended: usize,
    },
    /// No fetcher was registered for this bot's type.
    NoFetcher {
        /// The bot skipped.
        bot_id: Uuid,
        /// The unregistered type.
        bot_type: String,
    },
    /// Fetching or appending failed; the bot's state was left untouched.
    Failed {
        /// The bot that failed.
        bot_id: Uuid,
        /// Why it failed.
        error: LbpError,
    },
}

/// Drives one polling cycle over every registered [`Bot`].
/// Intended to be ticked by an `lbp-runner` `PeriodicRunner`.
pub struct BotPoller {
    store: Arc<dyn Store>,
    bots: Arc<dyn BotSource>,
    fetchers: FetcherRegistry,
}

impl BotPoller {
    /// Construct a poller over `bots`, dispatching to `fetchers`, and
    /// appending produced jobs through `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, bots: Arc<dyn BotSource>, fetchers: FetcherRegistry) -> Self {
        Self { store, bots, fetchers }
    }

    /// Run one polling cycle: list bots, poll each independently, and
    /// report the outcome of each.
    ///
    /// A single bot's failure (missing fetcher, fetch error, append error)
    /// does not abort the cycle for the others — this mirrors the
    /// reconciler's per-backend isolation: record the failure and move on.
    pub async fn run_cycle(&self) -> Result<Vec<BotOutcome>, LbpError> {
        let bots = self.bots.list_bots().await?;
        let mut outcomes = Vec::with_capacity(bots.len());
        for bot in bots {
            outcomes.push(self.poll_one(&bot).await);
        }
        Ok(outcomes)
    }

    async fn poll_one(&self, bot: &Bot) -> BotOutcome {
        let Some(fetcher) = self.fetchers.get(&bot.bot_type) else {
            warn!(bot_id = %bot.id, bot_type = %bot.bot_type, "no fetcher registered for bot type");
            return BotOutcome::NoFetcher {
                bot_id: bot.id,
                bot_type: bot.bot_type.clone(),
            };
        };

        let (updates, new_state) = match fetcher.fetch_updates(bot.state.clone()).await {
            Ok(result) => result,
            Err(error) => {
                warn!(bot_id = %bot.id, %error, "fetch_updates failed");
                return BotOutcome::Failed { bot_id: bot.id, error };
            }
        };

        if !updates.is_empty() {
            if let Err(error) = self.append_jobs(bot, &updates).await {
                warn!(bot_id = %bot.id, %error, "appending jobs for bot updates failed, state left untouched");
                return BotOutcome::Failed { bot_id: bot.id, error };
            }
        }

        if let Err(error) = self.bots.update_bot_state(bot.id, new_state).await {
            warn!(bot_id = %bot.id, %error, "jobs appended but persisting bot state failed");
            return BotOutcome::Failed { bot_id: bot.id, error };
        }

        BotOutcome::Polled { bot_id: bot.id, jobs_appended: updates.len() }
    }

    async fn append_jobs(&self, bot: &Bot, updates: &[serde_json::Value]) -> Result<(), LbpError> {
        for update in updates {
            let payload = serde_json::to_value(BotUpdatePayload {
                bot_id: bot.id,
                update: update.clone(),
                chain_id: bot.task_chain_id.clone(),
            })
            .map_err(|e| LbpError::new(ErrorCode::InvalidInput, format!("encode bot update payload: {e}")))?;
            let now = chrono::Utc::now();
            self.store
                .append_job(NewJob {
                    task_type: bot.job_type.clone(),
                    operation: "bot.update".into(),
                    subject: format!("bot {} update", bot.id),
                    entity_id: Some(bot.id.to_string()),
                    entity_type: Some("bot".into()),
                    payload,
                    scheduled_for: now,
                    valid_until: now + chrono::Duration::days(1),
                })
                .await?;
        }
        Ok(())
    }
}
