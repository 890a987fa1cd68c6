//! Handlers for creating and importing server definitions.

use axum::extract::State;
use axum::response::Json;
use serde_json::{Value, json};

use crate::AppState;
use crate::db::models::servers::{Server, ServerDefinition};
use crate::errors::Result;

pub async fn create(
    State(state): State<AppState>,
    Json(definition): Json<ServerDefinition>,
) -> Result<Json<Server>> {
    let server = state.registry.upsert(&state.db, &definition).await?;
    Ok(Json(server))
}

/// Bulk-import a JSON array of server definitions. Individual failures are
/// reported in the summary rather than aborting the batch.
pub async fn import(
    State(state): State<AppState>,
    Json(definitions): Json<Vec<ServerDefinition>>,
) -> Result<Json<Value>> {
    let mut imported = 0usize;
    let mut errors: Vec<String> = Vec::new();

    for definition in &definitions {
        match state.registry.upsert(&state.db, definition).await {
            Ok(_) => imported += 1,
            Err(e) => {
                tracing::error!(name = %definition.name, error = %e, "Failed to import server");
                errors.push(format!("{}: {e}", definition.name));
            }
        }
    }

    Ok(Json(json!({
        "status": "SUCCESS",
        "importSummary": { "imported": imported, "failed": errors.len(), "errors": errors },
    })))
}
