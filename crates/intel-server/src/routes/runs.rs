use axum::extract::State;
use axum::Json;
use tracing::info;

use crate::state::AppState;

/// GET /runs/current: tracker snapshot with `elapsed_seconds`.
pub async fn get_current_run(State(app): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!(app.orchestrator.snapshot()))
}

/// POST /runs/current/stop: cancel the active run. Succeeds when idle.
pub async fn stop_current_run(State(app): State<AppState>) -> Json<serde_json::Value> {
    let stopped = app.orchestrator.stop();
    if stopped {
        info!("active run stopped via API");
    }
    let snapshot = app.orchestrator.snapshot();
    Json(serde_json::json!({
        "ok": true,
        "stopped": stopped,
        "run_id": snapshot.run_id,
        "active": snapshot.active,
    }))
}
