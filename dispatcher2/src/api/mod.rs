//! HTTP API surface.
//!
//! Every route lives under `/api` behind the authentication middleware in
//! [`crate::auth`].

pub mod handlers;
pub mod query;

use axum::{
    Router, middleware,
    routing::{delete, get, post},
};

use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/queue", post(handlers::queue::enqueue).get(handlers::queue::list))
        .route(
            "/api/queue/{uid}",
            get(handlers::queue::get_request).delete(handlers::queue::delete_request),
        )
        .route(
            "/api/schedules",
            get(handlers::schedules::list).post(handlers::schedules::create),
        )
        .route(
            "/api/schedules/{id}",
            get(handlers::schedules::get)
                .put(handlers::schedules::update)
                .delete(handlers::schedules::delete),
        )
        .route("/api/servers", post(handlers::servers::create))
        .route("/api/importServers", post(handlers::servers::import))
        .route("/api/getToken", get(handlers::tokens::get_token))
        .route("/api/generateToken", get(handlers::tokens::generate_token))
        .route("/api/deleteTokens", delete(handlers::tokens::delete_tokens))
        .layer(middleware::from_fn_with_state(state.clone(), crate::auth::require_auth))
        .with_state(state)
}
