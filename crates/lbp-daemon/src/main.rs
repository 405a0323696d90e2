#![deny(unsafe_code)]
use anyhow::{Context, Result};
use clap::Parser;
use lbp_bus::Bus;
use lbp_cache::Cache;
use lbp_cancel::CancellationToken;
use lbp_chat::ChatManager;
use lbp_daemon::bots::{BotSpec, KvBotSource};
use lbp_daemon::{health, prober, AppState};
use lbp_dispatch::Dispatch;
use lbp_providers::ProviderAdapter;
use lbp_queue::Queue;
use lbp_reconciler::{CompositeProber, Reconciler};
use lbp_resolver::Resolver;
use lbp_store::pg::PgStore;
use lbp_store::Store;
use lbp_tokenizer::{HttpTokenizer, TinyTokenizer, Tokenizer};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "lbp-daemon", version, about = "LLM Backplane daemon")]
struct Args {
    /// Bind address for the health/readiness server.
    #[arg(long, default_value = "127.0.0.1:8089")]
    bind: String,

    /// Path to a TOML config file; falls back to `RuntimeConfig::default()`
    /// plus `LBP_*` environment overrides when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = lbp_config::load_config(args.config.as_deref()).context("load config")?;
    let filter = EnvFilter::new(config.log_level.clone().unwrap_or_else(|| "info".into()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    for warning in lbp_config::validate_config(&config).context("validate config")? {
        warn!(%warning, "config warning");
    }

    let database_url = config
        .database_url
        .as_deref()
        .context("LBP_DATABASE_URL or database_url must be set")?;
    let pool = sqlx::PgPool::connect(database_url)
        .await
        .context("connect to postgres")?;
    let store: Arc<dyn Store> = Arc::new(PgStore::new(pool));

    let bus = Arc::new(Bus::new());

    let http_client = reqwest::Client::new();
    let mut composite = CompositeProber::new();
    prober::register_default(&mut composite, http_client.clone());
    let reconciler = Arc::new(Reconciler::new(store.clone(), bus.clone(), composite, false));

    let cache = Arc::new(Cache::new(store.clone(), "config"));
    let dispatch = Arc::new(Dispatch::new(store.clone()));
    let queue = Arc::new(Queue::new(store.clone()));
    let resolver = Arc::new(Resolver::new());

    let tokenizer: Arc<dyn Tokenizer> = match &config.tokenizer_addr {
        Some(addr) => Arc::new(HttpTokenizer::new(http_client.clone(), addr.clone())),
        None => {
            warn!("no tokenizer_addr configured, falling back to the byte-estimate tokenizer");
            Arc::new(TinyTokenizer)
        }
    };
    let chat = Arc::new(ChatManager::new(store.clone(), tokenizer));

    let bot_specs: Vec<BotSpec> = config
        .telegram_bot_token
        .as_ref()
        .map(|_| {
            vec![BotSpec {
                id: uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_URL, b"lbp-daemon/telegram"),
                bot_type: "telegram".into(),
                job_type: "telegram.message".into(),
                task_chain_id: None,
            }]
        })
        .unwrap_or_default();
    let bot_poller = if bot_specs.is_empty() {
        None
    } else {
        let bot_source = Arc::new(KvBotSource::new(store.clone(), bot_specs));
        let fetchers = lbp_daemon::empty_fetcher_registry();
        Some(Arc::new(lbp_botpoller::BotPoller::new(
            store.clone(),
            bot_source,
            fetchers,
        )))
    };

    let state = Arc::new(AppState {
        store: store.clone(),
        reconciler: reconciler.clone(),
        cache: cache.clone(),
        dispatch,
        resolver,
        providers: RwLock::new(Arc::new(ProviderAdapter::build(&[], &[], &[]))),
        chat,
        bot_poller: bot_poller.clone(),
        bus,
    });
    state.refresh_providers().await.context("initial provider refresh")?;

    let cancel = CancellationToken::new();
    let breaker_threshold = config.breaker_failure_threshold;
    let breaker_open = Duration::from_secs(config.breaker_open_secs);

    let mut tasks = Vec::new();

    {
        let (runner, _trigger) = lbp_runner::PeriodicRunner::new(
            Duration::from_secs(config.reconcile_interval_secs),
            breaker_threshold,
            breaker_open,
        );
        let state = state.clone();
        tasks.push(tokio::spawn(runner.run(
            cancel.clone(),
            move |_c| {
                let state = state.clone();
                async move {
                    state.reconciler.run_backend_cycle().await?;
                    state.reconciler.run_download_cycle().await?;
                    state.refresh_providers().await
                }
            },
            |err| error!(code = ?err.code, message = %err.message, "reconcile cycle failed"),
        )));
    }

    {
        let (runner, _trigger) = lbp_runner::PeriodicRunner::new(
            Duration::from_secs(config.cache_refresh_interval_secs),
            breaker_threshold,
            breaker_open,
        );
        let cache = cache.clone();
        tasks.push(tokio::spawn(runner.run(
            cancel.clone(),
            move |_c| {
                let cache = cache.clone();
                async move {
                    cache.process_tick().await?;
                    Ok(())
                }
            },
            |err| error!(code = ?err.code, message = %err.message, "cache refresh failed"),
        )));
    }

    {
        let (runner, _trigger) = lbp_runner::PeriodicRunner::new(
            Duration::from_secs(config.reconcile_interval_secs),
            breaker_threshold,
            breaker_open,
        );
        let queue = queue.clone();
        tasks.push(tokio::spawn(runner.run(
            cancel.clone(),
            move |_c| {
                let queue = queue.clone();
                async move {
                    let recovered = queue.recover_expired_leases(chrono::Utc::now()).await?;
                    if recovered > 0 {
                        info!(recovered, "recovered expired leases");
                    }
                    Ok(())
                }
            },
            |err| error!(code = ?err.code, message = %err.message, "lease sweep failed"),
        )));
    }

    if let Some(bot_poller) = bot_poller {
        let (runner, _trigger) = lbp_runner::PeriodicRunner::new(
            Duration::from_secs(config.bot_poll_interval_secs),
            breaker_threshold,
            breaker_open,
        );
        tasks.push(tokio::spawn(runner.run(
            cancel.clone(),
            move |_c| {
                let bot_poller = bot_poller.clone();
                async move {
                    let outcomes = bot_poller.run_cycle().await?;
                    for outcome in outcomes {
                        if let lbp_botpoller::BotOutcome::Failed { bot_id, error } = outcome {
                            warn!(%bot_id, code = ?error.code, "bot poll failed");
                        }
                    }
                    Ok(())
                }
            },
            |err| error!(code = ?err.code, message = %err.message, "bot poll cycle failed"),
        )));
    }

    let app = health::build_app(state);
    let listener = tokio::net::TcpListener::bind(&args.bind)
        .await
        .with_context(|| format!("bind {}", args.bind))?;
    info!(bind = %args.bind, "lbp-daemon listening");

    let serve_cancel = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            serve_cancel.cancel();
        })
        .await
        .context("serve")?;

    cancel.cancel();
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}
