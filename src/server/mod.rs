//! HTTP server setup and component wiring.

pub mod handlers;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    routing::{get, post},
    Router,
};
use reqwest::Client;
use sqlx::SqlitePool;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::cost::CostEstimator;
use crate::dispatch::Dispatcher;
use crate::feedback;
use crate::geo::GeoRouter;
use crate::health::{self, HealthMonitor};
use crate::predict::PredictiveRouter;
use crate::transport::{HttpTransport, ProviderEndpoint, ProviderTransport};
use crate::weights::WeightManager;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub health: Arc<HealthMonitor>,
    pub weights: Arc<WeightManager>,
    pub predictor: Arc<PredictiveRouter>,
    pub geo: Arc<GeoRouter>,
    pub cost: Arc<CostEstimator>,
    pub config: Arc<Config>,
}

/// Wire every component from config and a transport.
///
/// Also spawns the feedback consumer task. The probe loop is spawned
/// separately by [`run_server`] so tests can exercise the state without
/// background probing.
pub fn build_state(
    config: Config,
    transport: Arc<dyn ProviderTransport>,
    pool: Option<SqlitePool>,
) -> AppState {
    let provider_names: Vec<String> = config.providers.iter().map(|p| p.name.clone()).collect();
    let endpoints = ProviderEndpoint::from_config(&config.providers);

    let health = Arc::new(HealthMonitor::new(&provider_names, config.health.clone()));
    let weights = Arc::new(WeightManager::new(&config.providers, config.weights.clone()));
    let predictor = Arc::new(PredictiveRouter::new(config.prediction.clone()));
    let geo = Arc::new(GeoRouter::new(&config.providers, config.geo.clone()));
    let cost = Arc::new(CostEstimator::new(config.cost.clone()));

    let (feedback_tx, feedback_rx) = feedback::channel();
    let _feedback_task = feedback::spawn_feedback_loop(
        feedback_rx,
        health.clone(),
        weights.clone(),
        predictor.clone(),
        geo.clone(),
        cost.clone(),
    );

    let dispatcher = Arc::new(Dispatcher::new(
        config.routing.clone(),
        endpoints,
        transport,
        health.clone(),
        weights.clone(),
        predictor.clone(),
        geo.clone(),
        cost.clone(),
        feedback_tx,
        pool,
        config.logging.log_decisions,
    ));

    AppState {
        dispatcher,
        health,
        weights,
        predictor,
        geo,
        cost,
        config: Arc::new(config),
    }
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Dispatch entry point
        .route("/v1/route", post(handlers::route))
        // Dashboard surfaces
        .route(
            "/dashboard/advanced-routing",
            get(handlers::advanced_routing),
        )
        .route(
            "/dashboard/predictive-routing",
            get(handlers::predictive_routing),
        )
        .route(
            "/v1/weight-management/stats",
            get(handlers::weight_management_stats),
        )
        .route("/v1/geo-routing/stats", get(handlers::geo_routing_stats))
        .route(
            "/cost-optimization/stats",
            get(handlers::cost_optimization_stats),
        )
        // Operational endpoints
        .route("/health", get(handlers::health))
        .route("/providers", get(handlers::list_providers))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Run the HTTP server until the process exits.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();

    let pool = match &config.database {
        Some(db) => {
            let pool = crate::storage::init_pool(&db.path).await?;
            tracing::info!(path = %db.path, "decision log database ready");
            Some(pool)
        }
        None => None,
    };

    // One client serves both dispatch and probes; per-attempt deadlines are
    // enforced by the dispatcher, this is the outer safety net.
    let http_client = Client::builder()
        .timeout(Duration::from_secs(120))
        .connect_timeout(Duration::from_secs(10))
        .build()?;
    let transport: Arc<dyn ProviderTransport> = Arc::new(HttpTransport::new(http_client));

    let endpoints = ProviderEndpoint::from_config(&config.providers);
    let state = build_state(config, transport.clone(), pool);

    tokio::spawn(health::run_probe_loop(
        state.health.clone(),
        state.weights.clone(),
        transport,
        endpoints,
    ));

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "Starting polyroute server");

    axum::serve(listener, app).await?;

    Ok(())
}
