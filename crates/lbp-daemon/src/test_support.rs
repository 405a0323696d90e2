//! In-memory [`AppState`] builder shared by this crate's route tests.

use crate::AppState;
use lbp_bus::Bus;
use lbp_cache::Cache;
use lbp_chat::ChatManager;
use lbp_dispatch::Dispatch;
use lbp_providers::ProviderAdapter;
use lbp_reconciler::Reconciler;
use lbp_resolver::Resolver;
use lbp_store::mock::MockStore;
use lbp_tokenizer::TinyTokenizer;
use std::sync::Arc;
use tokio::sync::RwLock;

pub async fn test_app_state() -> Arc<AppState> {
    let store: Arc<dyn lbp_store::Store> = Arc::new(MockStore::new());
    let bus = Arc::new(Bus::new());
    let prober = lbp_reconciler::CompositeProber::new();
    let reconciler = Arc::new(Reconciler::new(store.clone(), bus.clone(), prober, false));
    let cache = Arc::new(Cache::new(store.clone(), "test"));
    let dispatch = Arc::new(Dispatch::new(store.clone()));
    let resolver = Arc::new(Resolver::new());
    let chat = Arc::new(ChatManager::new(store.clone(), Arc::new(TinyTokenizer)));

    Arc::new(AppState {
        store,
        reconciler,
        cache,
        dispatch,
        resolver,
        providers: RwLock::new(Arc::new(ProviderAdapter::build(&[], &[], &[]))),
        chat,
        bot_poller: None,
        bus,
    })
}
