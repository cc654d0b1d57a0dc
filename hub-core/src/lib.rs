//! Library surface for the hub: the Connection Hub, Call Mediator, Metrics
//! Store, Mining Scheduler, Media Proxy, and their supporting pieces
//! (config, JWT verification, the store abstraction). `main.rs` is a thin
//! bootstrap over [`run`].

pub mod binding;
pub mod config;
pub mod decrypt;
pub mod error;
pub mod hub;
pub mod http;
pub mod jwt;
pub mod keystream;
pub mod media_proxy;
pub mod mediator;
pub mod metrics;
pub mod mining;
pub mod store;

use std::sync::Arc;

use anyhow::Result;

use config::Config;
use store::sqlite::SqliteStore;

/// Wires every component together and runs until the process is killed.
/// Broken out from `main.rs` so integration tests can construct the same
/// pieces (store, hub, mediator) against a fresh `:memory:` or temp-file
/// database without going through `main`.
pub async fn run(config: Arc<Config>) -> Result<()> {
    let store = Arc::new(SqliteStore::open(&config.db_path)?);
    let agents: Arc<dyn store::AgentRepository> = store.clone();
    let ledger: Arc<dyn store::LedgerRepository> = store.clone();

    let binding = Arc::new(binding::BindingStore::new());
    let jwt = Arc::new(jwt::JwtVerifier::new(&config.jwt_secret));
    let metrics = Arc::new(metrics::MetricsStore::new(config.metrics_reservoir_size, config.metrics_ring_capacity));

    let agent_hub = hub::Hub::new(config.clone(), agents.clone(), binding.clone());
    let registry = agent_hub.registry();

    let mediator = Arc::new(mediator::Mediator::new(registry.clone(), ledger.clone()));
    let media_client = media_proxy::build_client()?;

    let app_state = Arc::new(http::AppState {
        config: config.clone(),
        jwt,
        mediator,
        metrics: metrics.clone(),
        binding,
        agents: agents.clone(),
        registry,
        media_client,
    });

    tokio::spawn(metrics::sampler::run(metrics, now_unix));
    tokio::spawn(mining::run_accrual(agents.clone(), ledger.clone(), now_unix));
    tokio::spawn(mining::run_pruning(ledger.clone()));

    let ws_hub = agent_hub.clone();
    tokio::spawn(async move {
        if let Err(e) = ws_hub.run().await {
            tracing::error!(error = %e, "agent websocket hub exited");
        }
    });

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(addr = %config.listen_addr, "http surface listening");
    axum::serve(listener, http::router(app_state)).await?;

    Ok(())
}

fn now_unix() -> i64 {
    chrono::Utc::now().timestamp()
}
