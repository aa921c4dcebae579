//! HTTP API server for the reservation and fulfillment engine.
//!
//! Thin JSON endpoints over the inventory ledger, the order-payment
//! saga, the limited-resource issuer and the admission queue, with
//! structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;
pub mod state;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post};
use common::{EventPublisher, LoggingEventPublisher};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use error::StartupError;
use state::{AppState, Backends};

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        // inventory
        .route("/inventory", post(routes::inventory::initialize))
        .route("/inventory/add", post(routes::inventory::add))
        .route("/inventory/{id}", get(routes::inventory::get))
        .route("/inventory/{id}/movements", get(routes::inventory::movements))
        // orders and payments
        .route("/orders", post(routes::orders::create))
        .route("/orders/{number}", get(routes::orders::get))
        .route("/orders/{number}/cancel", post(routes::orders::cancel))
        .route("/payments", post(routes::orders::pay))
        // coupons and time deals
        .route("/coupons", post(routes::issuer::create_coupon))
        .route("/coupons/grants", get(routes::issuer::my_grants))
        .route("/coupons/{id}", get(routes::issuer::get_coupon))
        .route("/coupons/{id}/issue", post(routes::issuer::issue_coupon))
        .route("/timedeals", post(routes::issuer::create_deal))
        .route("/timedeals/{id}", get(routes::issuer::get_deal))
        .route("/timedeals/{id}/start", post(routes::issuer::start_deal))
        .route("/timedeals/{id}/purchase", post(routes::issuer::purchase))
        // admission queue; `{key}` is the event type or an entry token
        .route("/queue/{key}/{id}/activate", post(routes::queue::activate))
        .route("/queue/{key}/{id}/deactivate", post(routes::queue::deactivate))
        .route("/queue/{key}/{id}/enter", post(routes::queue::enter))
        .route("/queue/status/{token}", get(routes::queue::status))
        .route("/queue/subscribe/{token}", get(routes::queue::subscribe))
        .route("/queue/{key}/complete", post(routes::queue::complete))
        .route("/queue/{key}", delete(routes::queue::leave))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Creates an in-memory application state that logs its outbound events.
pub fn create_default_state(config: &Config) -> Arc<AppState> {
    let events: Arc<dyn EventPublisher> = Arc::new(LoggingEventPublisher);
    Arc::new(AppState::new(Backends::in_memory(config, events), config))
}

/// Creates the application state, connecting to Postgres and Redis when
/// `config` names them.
pub async fn create_state(config: &Config) -> Result<Arc<AppState>, StartupError> {
    let events: Arc<dyn EventPublisher> = Arc::new(LoggingEventPublisher);
    let backends = Backends::connect(config, events).await?;
    Ok(Arc::new(AppState::new(backends, config)))
}
