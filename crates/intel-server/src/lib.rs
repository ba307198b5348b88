pub mod error;
pub mod routes;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use intel_core::orchestrator::Orchestrator;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the axum Router with all control routes and middleware.
/// Used by `serve()` and available for integration testing.
pub fn build_router(orchestrator: Orchestrator) -> Router {
    let app_state = state::AppState::new(orchestrator);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Events (SSE)
        .route("/events", get(routes::events::sse_events))
        // Catalog
        .route("/modules", get(routes::modules::list_catalog))
        // Entities
        .route(
            "/entities/{id}",
            get(routes::entities::get_entity).put(routes::entities::put_entity),
        )
        .route(
            "/entities/{id}/modules",
            get(routes::modules::list_entity_modules),
        )
        .route(
            "/entities/{id}/modules/run-all",
            post(routes::modules::run_all),
        )
        .route(
            "/entities/{id}/modules/{module}/run",
            post(routes::modules::run_module),
        )
        .route(
            "/entities/{id}/modules/{module}/status",
            get(routes::modules::get_module_status),
        )
        .route(
            "/entities/{id}/modules/{module}/data",
            get(routes::modules::get_module_data),
        )
        // Runs
        .route("/runs/current", get(routes::runs::get_current_run))
        .route("/runs/current/stop", post(routes::runs::stop_current_run))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(app_state)
}

/// Bind `0.0.0.0:<port>` and serve until the process is stopped.
pub async fn serve(orchestrator: Orchestrator, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    serve_on(orchestrator, listener).await
}

/// Serve on a pre-bound listener, so the caller can read the actual port
/// first (useful with port 0).
pub async fn serve_on(
    orchestrator: Orchestrator,
    listener: tokio::net::TcpListener,
) -> anyhow::Result<()> {
    let actual_port = listener.local_addr()?.port();
    let app = build_router(orchestrator);

    tracing::info!("intel control server listening on http://localhost:{actual_port}");

    axum::serve(listener, app).await?;
    Ok(())
}
