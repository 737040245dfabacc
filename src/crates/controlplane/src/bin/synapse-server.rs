//! Synapse server binary
//!
//! Standalone control plane server: wires the durable log, the event bus,
//! the graph driver, the materializer, the worker pool, the router and
//! the HTTP surface, then serves until shutdown. Every dependency is
//! fail-open; a missing graph or provider degrades the service instead of
//! stopping it.

use controlplane::api::{create_router, AppState};
use controlplane::config::AppConfig;
use controlplane::flags::FlagStore;
use controlplane::gml::{Materializer, Replayer};
use controlplane::housekeeping;
use controlplane::pipeline::ChatPipeline;
use controlplane::ratelimit::RateLimiter;
use controlplane::router::InferenceRouter;
use controlplane::telemetry::{TelemetryHandles, TelemetryRegistry};
use controlplane::workers::{DeadLetter, QueueName, WorkItem, WorkerPool};
use events::{EventBus, EventDraft, EventKind, EventLog};
use graphstore::{DedupeStore, GraphDriver, NodeLabel, RelationSpec, SqliteKv, UpsertSpec};
use llm::remote::RemoteProviderConfig;
use llm::{DeterministicProvider, HttpChatProvider};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tooling::env::get_env;

/// Components seeded into the graph at startup
const SEED_COMPONENTS: [&str; 12] = [
    "chat_cp",
    "router",
    "rate_limiter",
    "gml",
    "event_bus",
    "worker_pool",
    "graph_driver",
    "policy_engine",
    "voice_bridge",
    "config",
    "control_room",
    "telemetry",
];

/// Component dependency edges seeded alongside the nodes
const COMPONENT_DEPENDENCIES: [(&str, &str); 8] = [
    ("chat_cp", "rate_limiter"),
    ("chat_cp", "router"),
    ("chat_cp", "policy_engine"),
    ("chat_cp", "event_bus"),
    ("router", "graph_driver"),
    ("gml", "event_bus"),
    ("gml", "graph_driver"),
    ("worker_pool", "event_bus"),
];

/// Flags gating components, seeded as `GATED_BY` edges
const COMPONENT_GATES: [(&str, &str); 3] = [
    ("gml", "materializer_enabled"),
    ("worker_pool", "async_enabled"),
    ("router", "router_enabled"),
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tooling::logging::init();

    let config = AppConfig::from_env();
    tracing::info!("Events directory: {}", config.events_dir.display());
    tracing::info!("Database URL: {}", config.database_url);

    // Durable log and bus. The log is the source replay is served from,
    // so it must exist before anything can publish.
    let log = Arc::new(EventLog::new(&config.events_dir)?);
    let bus = Arc::new(EventBus::new(log.clone()));

    // Graph driver. A broken database URL falls back to an in-memory
    // store so the request path stays up.
    let driver = match GraphDriver::connect(&config.database_url).await {
        Ok(driver) => Arc::new(driver),
        Err(e) => {
            tracing::warn!("Graph store unavailable ({}), using in-memory store", e);
            Arc::new(GraphDriver::connect("sqlite::memory:").await?)
        }
    };
    let dedupe = DedupeStore::new(driver.pool().clone());
    let kv = SqliteKv::new(driver.pool().clone());

    // Feature flags: environment first, then graph overlay.
    let flags = Arc::new(FlagStore::new());
    flags.load_env();
    flags.load_graph(&driver).await;

    let limiter = Arc::new(RateLimiter::new(kv));

    // Router and providers. The deterministic local provider is always
    // registered; remote providers come from the environment.
    let router = Arc::new(InferenceRouter::new(
        driver.clone(),
        flags.clone(),
        bus.clone(),
        config.provider_timeout,
        config.max_fallbacks,
    ));
    router.register(Arc::new(DeterministicProvider::new()));
    if let Ok(Some(api_key)) = get_env("OPENAI_API_KEY") {
        let base_url = get_env("OPENAI_BASE_URL")
            .ok()
            .flatten()
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string());
        let model = get_env("OPENAI_MODEL")
            .ok()
            .flatten()
            .unwrap_or_else(|| "gpt-4o-mini".to_string());
        let provider = HttpChatProvider::new(
            RemoteProviderConfig::new("openai", base_url, model)
                .with_api_key(api_key)
                .with_cost_units(3.0),
        )?;
        router.register(Arc::new(provider));
        tracing::info!("Registered remote provider: openai");
    }

    seed_graph(&driver, &flags, &router, &config).await;

    // Materializer: the single bus subscriber projecting into the graph.
    let materializer = Arc::new(Materializer::new(driver.clone(), dedupe.clone(), flags.clone()));
    let subscription = bus.subscribe("gml", 4096);
    tokio::spawn(materializer.clone().run(subscription));

    bus.publish(EventDraft::new(EventKind::ComponentSeen).with_payload(json!({
        "component_id": "chat_cp",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "ok",
    })));

    // Worker pool with housekeeping jobs.
    let deadletter = Arc::new(DeadLetter::new(&config.deadletter_dir)?);
    let workers = WorkerPool::new(bus.clone(), flags.clone(), config.clone(), deadletter);
    workers.spawn_heartbeats();
    register_housekeeping(&workers, driver.clone(), dedupe, config.approval_ttl);
    spawn_housekeeping_schedule(workers.clone());

    // The chat pipeline.
    let pipeline = Arc::new(ChatPipeline::new(
        bus.clone(),
        limiter.clone(),
        router.clone(),
        flags.clone(),
        config.clone(),
    ));

    let handles = TelemetryHandles {
        registry: Arc::new(TelemetryRegistry::new()),
        bus: bus.clone(),
        driver,
        gml: materializer.clone(),
        workers,
        limiter,
        router,
        flags,
        config: config.clone(),
    };
    let replayer = Arc::new(Replayer::new(log, materializer));

    let app = create_router(AppState {
        pipeline,
        handles,
        replayer,
    });

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("Starting synapse server on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Synapse server shut down gracefully");
    Ok(())
}

/// Seed the bootstrap nodes: components, providers, flags and the
/// retention policy. Best-effort; a down graph only logs.
async fn seed_graph(
    driver: &GraphDriver,
    flags: &FlagStore,
    router: &InferenceRouter,
    config: &AppConfig,
) {
    for component in SEED_COMPONENTS {
        let mut spec = UpsertSpec::new(NodeLabel::Component, component).with_props(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "status": "unknown",
        }));
        for (src, dst) in COMPONENT_DEPENDENCIES {
            if src == component {
                spec = spec.with_relation(RelationSpec::new(
                    (NodeLabel::Component, src),
                    "DEPENDS_ON",
                    (NodeLabel::Component, dst),
                ));
            }
        }
        for (src, flag) in COMPONENT_GATES {
            if src == component {
                spec = spec.with_relation(RelationSpec::new(
                    (NodeLabel::Component, src),
                    "GATED_BY",
                    (NodeLabel::FeatureFlag, flag),
                ));
            }
        }
        if let Err(e) = driver.upsert(&spec).await {
            tracing::warn!("Component seed skipped ({}): {}", component, e);
            return;
        }
    }

    for provider_id in router.provider_ids() {
        let spec = UpsertSpec::new(NodeLabel::Provider, &provider_id)
            .with_props(json!({"kind": "chat"}));
        if let Err(e) = driver.upsert(&spec).await {
            tracing::warn!("Provider seed skipped ({}): {}", provider_id, e);
        }
    }

    for (name, value) in flags.all() {
        let spec = UpsertSpec::new(NodeLabel::FeatureFlag, &name)
            .with_props(json!({"value": value}));
        if let Err(e) = driver.upsert(&spec).await {
            tracing::warn!("Flag seed skipped ({}): {}", name, e);
        }
    }

    if let Err(e) = housekeeping::seed_retention_policy(driver, config.artifact_max_age_days).await
    {
        tracing::warn!("Retention policy seed skipped: {}", e);
    }
}

/// Register the housekeeping handlers on the pool.
fn register_housekeeping(
    workers: &Arc<WorkerPool>,
    driver: Arc<GraphDriver>,
    dedupe: DedupeStore,
    approval_ttl: Duration,
) {
    {
        let driver = driver.clone();
        workers.register_handler(
            "retention_sweep",
            Arc::new(move |_payload| {
                let driver = driver.clone();
                Box::pin(async move {
                    let archived = housekeeping::retention_sweep(&driver)
                        .await
                        .map_err(|e| e.to_string())?;
                    Ok(json!({"archived": archived}))
                })
            }),
        );
    }

    {
        let driver = driver.clone();
        workers.register_handler(
            "approval_expiry",
            Arc::new(move |_payload| {
                let driver = driver.clone();
                Box::pin(async move {
                    let expired = housekeeping::expire_stale_approvals(&driver, approval_ttl)
                        .await
                        .map_err(|e| e.to_string())?;
                    Ok(json!({"expired": expired}))
                })
            }),
        );
    }

    workers.register_handler(
        "dedupe_prune",
        Arc::new(move |_payload| {
            let dedupe = dedupe.clone();
            Box::pin(async move {
                let pruned = housekeeping::prune_dedupe(&dedupe)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(json!({"pruned": pruned}))
            })
        }),
    );
}

/// Dispatch the housekeeping jobs once an hour.
fn spawn_housekeeping_schedule(workers: Arc<WorkerPool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(3600));
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for kind in ["retention_sweep", "approval_expiry", "dedupe_prune"] {
                workers
                    .dispatch(WorkItem::new(QueueName::Housekeeping, kind, json!({})))
                    .await;
            }
        }
    });
}

/// Signal for graceful shutdown (Ctrl-C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL-C signal handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received CTRL-C signal, shutting down");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM signal, shutting down");
        }
    }
}
