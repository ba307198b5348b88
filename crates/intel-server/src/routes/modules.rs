use axum::extract::{Path, State};
use axum::Json;
use intel_core::orchestrator::RunRequest;
use intel_core::registry::ModuleId;

use crate::error::AppError;
use crate::state::AppState;

/// GET /modules: the fixed catalog, in execution order.
pub async fn list_catalog(State(app): State<AppState>) -> Json<serde_json::Value> {
    let config = app.orchestrator.config();
    let list: Vec<serde_json::Value> = ModuleId::ALL
        .into_iter()
        .map(|m| {
            let d = m.descriptor();
            serde_json::json!({
                "id": d.id,
                "phase": d.phase,
                "title": d.title,
                "timeout_secs": config.timeout_for(m).as_secs(),
            })
        })
        .collect();
    Json(serde_json::json!(list))
}

/// GET /entities/{id}/modules: every registered module, `pending` when never run.
pub async fn list_entity_modules(
    State(app): State<AppState>,
    Path(entity_id): Path<u64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let records = app.orchestrator.statuses(entity_id).await?;
    Ok(Json(serde_json::json!({
        "entity_id": entity_id,
        "modules": records,
    })))
}

/// GET /entities/{id}/modules/{module}/status
pub async fn get_module_status(
    State(app): State<AppState>,
    Path((entity_id, module)): Path<(u64, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let module: ModuleId = module.parse()?;
    let record = app.orchestrator.status(entity_id, module).await?;
    Ok(Json(serde_json::json!({
        "entity_id": entity_id,
        "module": record.module,
        "status": record.status,
        "error_message": record.error_message,
        "last_completed_at": record.last_completed_at,
        "updated_at": record.updated_at,
    })))
}

/// GET /entities/{id}/modules/{module}/data: the stored result payload.
pub async fn get_module_data(
    State(app): State<AppState>,
    Path((entity_id, module)): Path<(u64, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let module: ModuleId = module.parse()?;
    let record = app.orchestrator.status(entity_id, module).await?;
    Ok(Json(serde_json::json!({
        "entity_id": entity_id,
        "module": record.module,
        "status": record.status,
        "result": record.result,
        "last_completed_at": record.last_completed_at,
    })))
}

/// POST /entities/{id}/modules/{module}/run: start a single-module run.
///
/// Returns as soon as the module is marked running; poll the status route
/// for the outcome.
pub async fn run_module(
    State(app): State<AppState>,
    Path((entity_id, module)): Path<(u64, String)>,
) -> Result<Json<serde_json::Value>, AppError> {
    let started = app.orchestrator.start_module(entity_id, &module).await?;
    Ok(Json(serde_json::to_value(&started.ack)?))
}

/// POST /entities/{id}/modules/run-all: start the three-phase run.
pub async fn run_all(
    State(app): State<AppState>,
    Path(entity_id): Path<u64>,
) -> Result<Json<serde_json::Value>, AppError> {
    let started = app.orchestrator.start(entity_id, RunRequest::All).await?;
    Ok(Json(serde_json::to_value(&started.ack)?))
}
