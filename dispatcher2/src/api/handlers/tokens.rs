//! API token management handlers.

use axum::Extension;
use axum::extract::State;
use axum::response::Json;
use serde_json::{Value, json};

use crate::AppState;
use crate::auth::CurrentUser;
use crate::db::handlers::Tokens;
use crate::errors::Result;

pub async fn get_token(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
) -> Result<Json<Value>> {
    let mut conn = state.db.acquire().await.map_err(crate::db::errors::DbError::from)?;
    let token = Tokens::new(&mut conn).get_active_token(user_id).await?;
    Ok(Json(json!({ "token": token.unwrap_or_default() })))
}

pub async fn generate_token(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
) -> Result<Json<Value>> {
    let mut conn = state.db.acquire().await.map_err(crate::db::errors::DbError::from)?;
    let token = Tokens::new(&mut conn).generate_token(user_id).await?;
    Ok(Json(json!({ "token": token })))
}

pub async fn delete_tokens(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
) -> Result<Json<Value>> {
    let mut conn = state.db.acquire().await.map_err(crate::db::errors::DbError::from)?;
    Tokens::new(&mut conn).delete_inactive_tokens(user_id).await?;
    Ok(Json(json!({ "status": "inactive tokens for user deleted" })))
}
