//! Authentication middleware for the enqueue API.
//!
//! Two credential forms are accepted on the `Authorization` header:
//! `Basic user:pass` (verified against the users table with pgcrypto) and
//! `Token <hex>` / `ApiToken <hex>` (verified against `user_apitoken`).

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use base64::Engine;

use crate::AppState;
use crate::db::handlers::Tokens;
use crate::errors::{Error, Result};
use crate::types::UserId;

/// The authenticated caller, inserted into request extensions.
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser(pub UserId);

pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    let header = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .ok_or(Error::Unauthenticated { message: None })?
        .to_string();

    let user_id = authenticate(&state, &header).await?;
    request.extensions_mut().insert(CurrentUser(user_id));
    Ok(next.run(request).await)
}

async fn authenticate(state: &AppState, header: &str) -> Result<UserId> {
    let mut conn = state
        .db
        .acquire()
        .await
        .map_err(crate::db::errors::DbError::from)?;
    let mut tokens = Tokens::new(&mut conn);

    if let Some(encoded) = header.strip_prefix("Basic ") {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|_| Error::Unauthenticated { message: None })?;
        let decoded = String::from_utf8(decoded).map_err(|_| Error::Unauthenticated { message: None })?;
        let (username, password) = decoded
            .split_once(':')
            .ok_or(Error::Unauthenticated { message: None })?;

        return tokens
            .verify_basic(username, password)
            .await?
            .ok_or(Error::Unauthenticated {
                message: Some("Invalid username or password".to_string()),
            });
    }

    let token = header
        .strip_prefix("Token ")
        .or_else(|| header.strip_prefix("ApiToken "));
    if let Some(token) = token {
        return tokens
            .verify_token(token.trim())
            .await?
            .ok_or(Error::Unauthenticated {
                message: Some("Invalid or inactive token".to_string()),
            });
    }

    Err(Error::Unauthenticated { message: None })
}
