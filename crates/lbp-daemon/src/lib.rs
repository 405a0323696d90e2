// SPDX-License-Identifier: MIT OR Apache-2.0
//! Process wiring for the LLM Backplane.
//!
//! This crate owns no core algorithm of its own. It constructs the store,
//! bus, reconciler, provider adapter, resolver, queue, dispatch, bot
//! poller, and chat manager from [`lbp_config::RuntimeConfig`], and wires
//! each periodic subsystem onto its own [`lbp_runner::PeriodicRunner`].
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Bot registration backed by the KV store.
pub mod bots;
/// Health/readiness HTTP surface (the only axum surface this crate owns;
/// see crate docs).
pub mod health;
/// [`lbp_reconciler::BackendProber`] adapters for self-hosted backend kinds.
pub mod prober;

#[cfg(test)]
mod test_support;

use lbp_botpoller::{BotPoller, FetcherRegistry};
use lbp_bus::Bus;
use lbp_cache::Cache;
use lbp_chat::ChatManager;
use lbp_dispatch::Dispatch;
use lbp_error::LbpError;
use lbp_providers::ProviderAdapter;
use lbp_reconciler::Reconciler;
use lbp_resolver::Resolver;
use lbp_store::Store;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Every long-lived component this daemon wires together, shared across
/// its periodic loops and the health server.
pub struct AppState {
    /// Durable store every other component reads and writes through.
    pub store: Arc<dyn Store>,
    /// Runtime state reconciler.
    pub reconciler: Arc<Reconciler>,
    /// KV configuration cache.
    pub cache: Arc<Cache>,
    /// Leased job dispatch service.
    pub dispatch: Arc<Dispatch>,
    /// Capability resolver.
    pub resolver: Arc<Resolver>,
    /// Provider set built from the reconciler's latest snapshot; refreshed
    /// after every reconcile cycle via [`AppState::refresh_providers`].
    pub providers: RwLock<Arc<ProviderAdapter>>,
    /// Conversation history manager.
    pub chat: Arc<ChatManager>,
    /// Bot poller, if any bots are configured. `None` when
    /// no bots were wired — the loop simply isn't spawned.
    pub bot_poller: Option<Arc<BotPoller>>,
    /// Pub/sub bus.
    pub bus: Arc<Bus>,
}

impl AppState {
    /// Rebuild [`AppState::providers`] from the reconciler's current
    /// snapshot and the store's model catalog. Cloud providers are not
    /// modeled in `RuntimeConfig` yet, so only self-hosted backends
    /// contribute (see `DESIGN.md`).
    pub async fn refresh_providers(&self) -> Result<(), LbpError> {
        let llm_states: Vec<_> = self.reconciler.get().values().cloned().collect();
        let model_catalog = self.store.list_models().await?;
        let adapter = ProviderAdapter::build(&llm_states, &model_catalog, &[]);
        *self.providers.write().await = Arc::new(adapter);
        Ok(())
    }
}

/// Construct an empty [`FetcherRegistry`]; a deployment registers concrete
/// fetchers (Telegram, GitHub, ...) before passing it to a [`BotPoller`].
/// Kept here so `lbp-daemon`'s `main.rs` has one obvious place to start.
#[must_use]
pub fn empty_fetcher_registry() -> FetcherRegistry {
    FetcherRegistry::new()
}
