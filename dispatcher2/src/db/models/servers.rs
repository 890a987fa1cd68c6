//! Database models for destination servers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;

use crate::types::ServerId;

/// How the destination authenticates calls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMethod {
    #[default]
    Basic,
    Token,
}

impl AuthMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::Basic => "Basic",
            AuthMethod::Token => "Token",
        }
    }

    pub fn parse(s: &str) -> Self {
        // anything unrecognized falls back to Basic, as the source did
        match s {
            "Token" => AuthMethod::Token,
            _ => AuthMethod::Basic,
        }
    }
}

/// A destination descriptor row.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Server {
    pub id: ServerId,
    pub uid: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub username: String,
    #[serde(skip_serializing)]
    pub password: String,
    #[serde(skip_serializing)]
    pub auth_token: String,
    pub auth_method: String,
    pub url: String,
    pub http_method: String,
    pub url_params: Json<HashMap<String, serde_json::Value>>,
    pub use_ssl: bool,
    pub use_async: bool,
    pub parse_responses: bool,
    pub allow_callbacks: bool,
    pub allow_copies: bool,
    pub suspended: bool,
    pub start_submission_period: i32,
    pub end_submission_period: i32,
    pub cc_urls: Vec<String>,
    pub callback_url: String,
    pub xml_response_xpath: String,
    pub json_response_xpath: String,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Server {
    pub fn auth_method(&self) -> AuthMethod {
        AuthMethod::parse(&self.auth_method)
    }
}

/// A server definition as supplied by the API or a JSON file in the
/// server-definitions directory. Missing fields take the table defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerDefinition {
    pub uid: Option<String>,
    pub name: String,
    pub username: String,
    pub password: String,
    pub auth_token: String,
    pub auth_method: String,
    pub url: String,
    pub http_method: String,
    pub url_params: HashMap<String, serde_json::Value>,
    pub use_ssl: bool,
    pub use_async: bool,
    pub parse_responses: bool,
    pub allow_callbacks: bool,
    pub allow_copies: bool,
    pub suspended: bool,
    pub start_submission_period: Option<i32>,
    pub end_submission_period: Option<i32>,
    pub cc_urls: Vec<String>,
    pub callback_url: String,
}
