// =============================================================================
// aurora-news-trader — Main Entry Point
// =============================================================================
//
// Wires the news -> entity -> signal -> risk -> execution -> PnL pipeline
// as a set of `run_stream_worker` tasks sharing one `EventBus`, plus the
// timer-driven `PositionSyncStage` and the orchestrator HTTP API. Backend
// selection (`BUS_BACKEND=memory|redis`) mirrors the source's dev/prod
// split: memory for local runs and tests, Redis Streams + Postgres in
// production.
// =============================================================================

mod api;
mod bus;
mod config;
mod dedup;
mod exchange;
mod replay;
mod stages;
mod state_store;
mod types;
mod worker;

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::rest::OrchestratorState;
use crate::api::store::{MemoryOrchestratorStore, OrchestratorStore, RedisOrchestratorStore};
use crate::bus::{EventBus, InMemoryEventBus, RedisEventBus};
use crate::config::{AppSettings, BusBackend};
use crate::dedup::{DedupStore, MemoryDedupStore, RedisDedupStore};
use crate::exchange::build_exchange_adapter;
use crate::replay::{MemoryReplayStore, RedisReplayStore, ReplayEngine, ReplayStore};
use crate::stages::entity::EntityStage;
use crate::stages::execution::ExecutionStage;
use crate::stages::ingest::IngestStage;
use crate::stages::llm_signal::LlmSignalStage;
use crate::stages::monitoring::{MonitoringKind, MonitoringStage, TelegramNotifier};
use crate::stages::persistence::{PersistenceKind, PersistenceStage};
use crate::stages::portfolio::PortfolioStage;
use crate::stages::position_pnl::PositionPnlStage;
use crate::stages::position_sync::PositionSyncStage;
use crate::stages::risk::RiskStage;
use crate::stages::signal_fusion::SignalFusionStage;
use crate::stages::universe::UniverseStage;
use crate::state_store::{MemoryTradingStateStore, RedisTradingStateStore, TradingStateStore};
use crate::types::streams;
use crate::worker::{run_stream_worker, StageHandler, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    let settings = Arc::new(AppSettings::from_env());

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(settings.log_level.clone())),
        )
        .init();

    info!(env = %settings.env, bus_backend = ?settings.bus_backend, "aurora-news-trader starting up");

    let bus: Arc<dyn EventBus> = match settings.bus_backend {
        BusBackend::Memory => Arc::new(InMemoryEventBus::new()),
        BusBackend::Redis => Arc::new(RedisEventBus::new(&settings.redis_url)?),
    };

    let trading_state_store: Arc<dyn TradingStateStore> = match settings.bus_backend {
        BusBackend::Memory => Arc::new(MemoryTradingStateStore::new()),
        BusBackend::Redis => Arc::new(RedisTradingStateStore::new(&settings.redis_url)?),
    };

    let orchestrator_store: Arc<dyn OrchestratorStore> = match settings.bus_backend {
        BusBackend::Memory => Arc::new(MemoryOrchestratorStore::new()),
        BusBackend::Redis => Arc::new(RedisOrchestratorStore::new(&settings.redis_url)?),
    };

    let replay_store: Arc<dyn ReplayStore> = match settings.bus_backend {
        BusBackend::Memory => Arc::new(MemoryReplayStore::new()),
        BusBackend::Redis => Arc::new(RedisReplayStore::new(&settings.redis_url)?),
    };

    let dedup_store: Arc<dyn DedupStore> = match settings.bus_backend {
        BusBackend::Memory => Arc::new(MemoryDedupStore::new()),
        BusBackend::Redis => Arc::new(RedisDedupStore::new(&settings.redis_url, "dedup")?),
    };

    let pg_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&settings.postgres_dsn)
        .await?;

    let exchange_adapter = build_exchange_adapter(&settings)?;
    let replay = ReplayEngine::new(bus.clone(), replay_store);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = Vec::new();

    let mut spawn_worker = |source_stream: &str, handler: Arc<dyn StageHandler>| {
        let bus = bus.clone();
        let config = WorkerConfig::new(source_stream);
        let shutdown_rx = shutdown_rx.clone();
        workers.push(tokio::spawn(run_stream_worker(bus, config, handler, shutdown_rx)));
    };

    spawn_worker(streams::NEWS_RAW, Arc::new(EntityStage::new(settings.clone())));
    spawn_worker(streams::NEWS_ENTITY, Arc::new(LlmSignalStage::new(settings.clone())));
    spawn_worker(streams::SIGNAL_RAW, Arc::new(SignalFusionStage::new(settings.clone())));
    spawn_worker(streams::SIGNAL_TRADEABLE, Arc::new(UniverseStage::new(settings.clone())));
    spawn_worker(streams::SIGNAL_UNIVERSE, Arc::new(PortfolioStage::new(settings.clone())));
    spawn_worker(
        streams::ORDER_INTENT,
        Arc::new(RiskStage::new(settings.clone(), trading_state_store.clone())),
    );
    let execution_stage = Arc::new(ExecutionStage::new(exchange_adapter.clone()));
    spawn_worker(streams::ORDER_APPROVED, execution_stage.clone());
    spawn_worker(streams::EXECUTION_REPORT, Arc::new(PositionPnlStage::new()));

    spawn_worker(
        streams::NEWS_RAW,
        Arc::new(PersistenceStage::new(pg_pool.clone(), PersistenceKind::News)),
    );
    spawn_worker(
        streams::ORDER_INTENT,
        Arc::new(PersistenceStage::new(pg_pool.clone(), PersistenceKind::OrderIntent)),
    );
    spawn_worker(
        streams::ORDER_REJECTED,
        Arc::new(PersistenceStage::new(pg_pool.clone(), PersistenceKind::RiskDecision)),
    );
    spawn_worker(
        streams::EXECUTION_REPORT,
        Arc::new(PersistenceStage::new(pg_pool.clone(), PersistenceKind::ExecutionReport)),
    );
    spawn_worker(
        streams::PNL_SNAPSHOT,
        Arc::new(PersistenceStage::new(pg_pool, PersistenceKind::PnlSnapshot)),
    );

    let notifier = Arc::new(TelegramNotifier::new(&settings));
    spawn_worker(
        streams::NEWS_RAW,
        Arc::new(MonitoringStage::new(notifier.clone(), MonitoringKind::News)),
    );
    spawn_worker(
        streams::ORDER_REJECTED,
        Arc::new(MonitoringStage::new(notifier.clone(), MonitoringKind::Rejected)),
    );
    spawn_worker(
        streams::EXECUTION_REPORT,
        Arc::new(MonitoringStage::new(notifier.clone(), MonitoringKind::Execution)),
    );
    spawn_worker(
        streams::RISK_ALERT,
        Arc::new(MonitoringStage::new(notifier, MonitoringKind::RiskAlert)),
    );

    workers.push(tokio::spawn(execution_stage.run_adapter_stream(
        settings.clone(),
        bus.clone(),
        shutdown_rx.clone(),
    )));

    let position_sync = Arc::new(PositionSyncStage::new(
        settings.clone(),
        exchange_adapter,
        trading_state_store,
        bus.clone(),
    ));
    workers.push(tokio::spawn(position_sync.run(shutdown_rx.clone())));

    let ingest = Arc::new(IngestStage::new(settings.clone(), bus.clone(), dedup_store));
    workers.push(tokio::spawn(
        ingest.run(settings.ingest_interval_sec, shutdown_rx.clone()),
    ));

    let api_state = Arc::new(OrchestratorState {
        settings: settings.clone(),
        bus,
        store: orchestrator_store,
        replay,
    });
    let app = api::rest::router(api_state);
    let listener = tokio::net::TcpListener::bind(&settings.admin_bind_addr).await?;
    info!(addr = %settings.admin_bind_addr, "orchestrator API listening");

    let mut shutdown_rx_for_server = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx_for_server.changed().await;
            })
            .await;
        if let Err(err) = result {
            error!(error = %err, "orchestrator API server exited with error");
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received, stopping workers");
    let _ = shutdown_tx.send(true);

    for worker in workers {
        if let Err(err) = worker.await {
            warn!(error = %err, "worker task panicked during shutdown");
        }
    }
    let _ = server.await;

    info!("aurora-news-trader stopped");
    Ok(())
}
