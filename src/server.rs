//! Server assembly: wires the store, capability registry, inference
//! gateway, and orchestrator into shared state, builds the router, and
//! runs the HTTP server with graceful shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use crate::api::{self, AppState, SharedState};
use crate::capability::{CapabilityRegistry, register_builtins};
use crate::config::Config;
use crate::evaluator::Evaluator;
use crate::events::EventBus;
use crate::gateway::{InferenceGateway, InferenceProvider, OpenAiCompatProvider, ScriptedProvider};
use crate::orchestrator::{EngineConfig, Orchestrator};
use crate::planner::Planner;
use crate::replanner::Replanner;
use crate::store::{Store, StoreHandle};

/// Assemble shared application state from a config and an opened store.
pub fn build_state(config: &Config, store: Store) -> SharedState {
    let store = StoreHandle::new(store);

    let mut registry = CapabilityRegistry::new(config.capability_timeout);
    register_builtins(&mut registry);
    let registry = Arc::new(registry);

    let providers: Vec<Arc<dyn InferenceProvider>> = if config.providers.is_empty() {
        tracing::warn!("no inference providers configured; using the offline scripted provider");
        vec![Arc::new(ScriptedProvider::canned())]
    } else {
        config
            .providers
            .iter()
            .map(|spec| {
                Arc::new(OpenAiCompatProvider::new(
                    &spec.name,
                    &spec.base_url,
                    &spec.model,
                    spec.api_key.clone(),
                )) as Arc<dyn InferenceProvider>
            })
            .collect()
    };

    let gateway = Arc::new(InferenceGateway::new(
        providers,
        config.inference_timeout,
        store.clone(),
    ));
    let planner = Arc::new(Planner::new(gateway.clone(), config.planner_attempts));
    let evaluator = Arc::new(Evaluator::new(gateway.clone(), config.pass_threshold));
    let replanner = Replanner::new(planner.clone());
    let events = Arc::new(EventBus::new());

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        planner,
        evaluator,
        replanner,
        registry,
        events.clone(),
        EngineConfig {
            max_concurrency: config.max_concurrency,
            max_replans: config.max_replans,
            default_max_retries: config.default_max_retries,
        },
    ));

    Arc::new(AppState {
        store,
        orchestrator,
        events,
        heartbeat_interval: config.heartbeat_interval,
    })
}

/// Build the full application router.
pub fn build_router(state: SharedState) -> Router {
    api::api_router().with_state(state)
}

/// Start the server: open the store, run the crash recovery sweep, bind,
/// and serve until ctrl-c.
pub async fn start_server(config: Config, dev_mode: bool) -> Result<()> {
    if let Some(parent) = config.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let store = Store::open(&config.db_path).context("Failed to open store")?;
    let swept = store
        .recover_interrupted_steps()
        .context("Failed to recover interrupted steps")?;
    if swept > 0 {
        tracing::warn!(swept, "marked interrupted steps as failed on startup");
    }

    let state = build_state(&config, store);
    let mut app = build_router(state);

    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "waypoint serving");
    println!("Waypoint running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        tracing::error!("failed to install ctrl-c handler");
        return;
    }
    println!("\nShutting down...");
}
