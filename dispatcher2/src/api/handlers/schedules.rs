//! CRUD handlers for schedules.

use axum::extract::{Path, State};
use axum::response::Json;
use serde_json::{Value, json};

use crate::AppState;
use crate::db::handlers::Schedules;
use crate::db::models::schedules::{Schedule, ScheduleCreateDBRequest};
use crate::errors::{Error, Result};
use crate::types::ScheduleId;

pub async fn list(State(state): State<AppState>) -> Result<Json<Vec<Schedule>>> {
    let mut conn = state.db.acquire().await.map_err(crate::db::errors::DbError::from)?;
    let schedules = Schedules::new(&mut conn).list().await?;
    Ok(Json(schedules))
}

pub async fn create(
    State(state): State<AppState>,
    Json(request): Json<ScheduleCreateDBRequest>,
) -> Result<Json<Schedule>> {
    let mut conn = state.db.acquire().await.map_err(crate::db::errors::DbError::from)?;
    let schedule = Schedules::new(&mut conn).create(&request).await?;
    Ok(Json(schedule))
}

pub async fn get(
    State(state): State<AppState>,
    Path(id): Path<ScheduleId>,
) -> Result<Json<Schedule>> {
    let mut conn = state.db.acquire().await.map_err(crate::db::errors::DbError::from)?;
    let schedule = Schedules::new(&mut conn)
        .get(id)
        .await?
        .ok_or_else(|| Error::NotFound {
            resource: "Schedule".to_string(),
            id: id.to_string(),
        })?;
    Ok(Json(schedule))
}

pub async fn update(
    State(state): State<AppState>,
    Path(id): Path<ScheduleId>,
    Json(request): Json<ScheduleCreateDBRequest>,
) -> Result<Json<Schedule>> {
    let mut conn = state.db.acquire().await.map_err(crate::db::errors::DbError::from)?;
    let schedule = Schedules::new(&mut conn)
        .update(id, &request)
        .await?
        .ok_or_else(|| Error::NotFound {
            resource: "Schedule".to_string(),
            id: id.to_string(),
        })?;
    Ok(Json(schedule))
}

pub async fn delete(
    State(state): State<AppState>,
    Path(id): Path<ScheduleId>,
) -> Result<Json<Value>> {
    let mut conn = state.db.acquire().await.map_err(crate::db::errors::DbError::from)?;
    let deleted = Schedules::new(&mut conn).delete(id).await?;
    if !deleted {
        return Err(Error::NotFound {
            resource: "Schedule".to_string(),
            id: id.to_string(),
        });
    }
    Ok(Json(json!({ "status": "deleted" })))
}
