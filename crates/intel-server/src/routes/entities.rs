use axum::extract::{Path, State};
use axum::Json;
use intel_core::entity::EntityDescriptor;
use serde::Deserialize;

use crate::error::AppError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct PutEntityBody {
    pub name: String,
    #[serde(default)]
    pub short_name: Option<String>,
}

/// PUT /entities/{id}: register or update the descriptor executors receive.
pub async fn put_entity(
    State(app): State<AppState>,
    Path(entity_id): Path<u64>,
    Json(body): Json<PutEntityBody>,
) -> Result<Json<EntityDescriptor>, AppError> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(AppError::bad_request("name must not be empty"));
    }
    let short_name = body
        .short_name
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty());

    let entity = EntityDescriptor::new(entity_id, name, short_name);
    app.orchestrator.put_entity(entity.clone()).await?;
    Ok(Json(entity))
}

/// GET /entities/{id}
pub async fn get_entity(
    State(app): State<AppState>,
    Path(entity_id): Path<u64>,
) -> Result<Json<EntityDescriptor>, AppError> {
    Ok(Json(app.orchestrator.entity(entity_id).await?))
}
