//! [`BotSource`] backed by the KV store, for the small set
//! of bots this deployment configures statically (today: at most one
//! Telegram bot, from `RuntimeConfig::telegram_bot_token`).
//!
//! Bots are an out-of-core entity — there is no
//! `bots` table. Registration is a fixed list supplied at construction;
//! only each bot's resume cursor is durable, under the `"botpoller"` KV
//! prefix already called out in `lbp_core::KvEntry`'s docs.

use async_trait::async_trait;
use lbp_botpoller::{Bot, BotSource};
use lbp_error::LbpError;
use lbp_store::Store;
use std::sync::Arc;
use uuid::Uuid;

const KV_PREFIX: &str = "botpoller";

/// A statically configured bot, before its persisted resume state is loaded.
#[derive(Debug, Clone)]
pub struct BotSpec {
    /// Stable identity; also used as its KV key.
    pub id: Uuid,
    /// Registered [`lbp_botpoller::Fetcher`] key.
    pub bot_type: String,
    /// `taskType` assigned to jobs this bot's updates become.
    pub job_type: String,
    /// Optional chain id threaded into produced jobs.
    pub task_chain_id: Option<String>,
}

/// [`BotSource`] over a fixed list of [`BotSpec`]s, with state round-tripped
/// through the store's KV table.
pub struct KvBotSource {
    store: Arc<dyn Store>,
    specs: Vec<BotSpec>,
}

impl KvBotSource {
    /// Wrap `specs`, persisting/loading their cursors via `store`.
    #[must_use]
    pub fn new(store: Arc<dyn Store>, specs: Vec<BotSpec>) -> Self {
        Self { store, specs }
    }
}

#[async_trait]
impl BotSource for KvBotSource {
    async fn list_bots(&self) -> Result<Vec<Bot>, LbpError> {
        let mut bots = Vec::with_capacity(self.specs.len());
        for spec in &self.specs {
            let state = self
                .store
                .list_kv_prefix(KV_PREFIX)
                .await?
                .into_iter()
                .find(|e| e.key == spec.id.to_string())
                .map(|e| e.value)
                .unwrap_or(serde_json::Value::Null);
            bots.push(Bot {
                id: spec.id,
                bot_type: spec.bot_type.clone(),
                job_type: spec.job_type.clone(),
                task_chain_id: spec.task_chain_id.clone(),
                state,
            });
        }
        Ok(bots)
    }

    async fn update_bot_state(&self, bot_id: Uuid, state: serde_json::Value) -> Result<(), LbpError> {
        self.store.set_kv(KV_PREFIX, &bot_id.to_string(), state).await?;
        Ok(())
    }
}
