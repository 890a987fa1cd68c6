//! HTTP client for destination servers.
//!
//! Two call styles share one wrapper: [`DestinationClient::submit`] delivers a
//! queued payload to the server's configured URL, and the `*_resource`
//! methods address the server's API (used by the async-job poller). TLS peer
//! verification follows the `server.verify_ssl` config; it defaults to off
//! for deployments fronted by private CAs.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::Context;
use base64::Engine;
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderValue};

use crate::db::models::requests::LeasedRequest;
use crate::db::models::servers::{AuthMethod, Server};

/// A fully read response: status code plus body bytes as text.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        self.status / 100 == 2
    }
}

/// Append query parameters to a URL, preserving an existing `?`.
pub fn add_params_to_url(url: &str, params: &HashMap<String, serde_json::Value>) -> String {
    if params.is_empty() {
        return url.to_string();
    }
    let mut out = String::from(url);
    if !out.ends_with('?') {
        out.push(if out.contains('?') { '&' } else { '?' });
    }
    let mut pairs: Vec<(String, String)> = params
        .iter()
        .map(|(k, v)| {
            let value = match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), value)
        })
        .collect();
    pairs.sort();
    let encoded: String = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(pairs)
        .finish();
    out.push_str(&encoded);
    out
}

/// Derive the API base from a server URL: strip everything from `/api/`
/// onward and re-append `/api`.
pub fn base_api_url(server_url: &str) -> anyhow::Result<String> {
    match server_url.find("/api/") {
        Some(pos) => Ok(format!("{}/api", &server_url[..pos])),
        None => anyhow::bail!("URL doesn't contain /api/ part: {server_url}"),
    }
}

pub struct DestinationClient {
    http: reqwest::Client,
    server: Server,
}

impl DestinationClient {
    pub fn new(server: Server, verify_ssl: bool, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify_ssl)
            .timeout(timeout)
            .build()
            .context("failed to build destination HTTP client")?;
        Ok(Self { http, server })
    }

    fn auth_header(&self) -> anyhow::Result<HeaderValue> {
        let value = match self.server.auth_method() {
            AuthMethod::Basic => {
                let credentials = format!("{}:{}", self.server.username, self.server.password);
                format!(
                    "Basic {}",
                    base64::engine::general_purpose::STANDARD.encode(credentials)
                )
            }
            AuthMethod::Token => format!("ApiToken {}", self.server.auth_token),
        };
        let mut header = HeaderValue::from_str(&value).context("invalid auth header")?;
        header.set_sensitive(true);
        Ok(header)
    }

    /// Deliver a queued payload to the server's configured URL.
    ///
    /// JSON-family bodies are decoded and re-encoded so a destination never
    /// sees a payload this process could not itself parse; other content
    /// types pass through untouched. When `body_is_query_param` is set and
    /// the body is a flat JSON object, its fields are sent as query
    /// parameters instead of a payload.
    pub async fn submit(&self, request: &LeasedRequest) -> anyhow::Result<HttpResponse> {
        let mut dest_url = self.server.url.clone();
        if request.url_suffix.len() > 1 {
            dest_url.push_str(&request.url_suffix);
        }

        let mut body = request.body.clone();
        if is_json_family(&request.content_type) {
            let value: serde_json::Value = serde_json::from_str(&request.body)
                .context("request body is not valid JSON")?;
            body = serde_json::to_string(&value)?;
        }

        let mut params = self.server.url_params.0.clone();
        if request.body_is_query_param {
            if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(&request.body) {
                params.extend(map);
                body = String::new();
            }
        }
        let complete_url = add_params_to_url(&dest_url, &params);

        let method = Method::from_bytes(self.server.http_method.as_bytes())
            .unwrap_or(Method::POST);

        let mut headers = HeaderMap::new();
        headers.insert(reqwest::header::AUTHORIZATION, self.auth_header()?);
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_str(&request.content_type)
                .unwrap_or(HeaderValue::from_static("application/json")),
        );

        tracing::info!(
            request_id = request.id,
            server_id = self.server.id,
            url = %complete_url,
            "Sending request to destination server"
        );

        let response = self
            .http
            .request(method, &complete_url)
            .headers(headers)
            .body(body)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(HttpResponse { status, body })
    }

    async fn api_request(
        &self,
        method: Method,
        resource: &str,
        body: Option<serde_json::Value>,
    ) -> anyhow::Result<HttpResponse> {
        let base = base_api_url(&self.server.url)?;
        let url = format!("{base}/{resource}");

        let mut builder = self
            .http
            .request(method, &url)
            .header(reqwest::header::AUTHORIZATION, self.auth_header()?)
            .header(reqwest::header::ACCEPT, "application/json")
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(HttpResponse { status, body })
    }

    pub async fn get_resource(&self, resource: &str) -> anyhow::Result<HttpResponse> {
        self.api_request(Method::GET, resource, None).await
    }

    pub async fn post_resource(
        &self,
        resource: &str,
        body: serde_json::Value,
    ) -> anyhow::Result<HttpResponse> {
        self.api_request(Method::POST, resource, Some(body)).await
    }

    pub async fn put_resource(
        &self,
        resource: &str,
        body: serde_json::Value,
    ) -> anyhow::Result<HttpResponse> {
        self.api_request(Method::PUT, resource, Some(body)).await
    }

    pub async fn patch_resource(
        &self,
        resource: &str,
        body: serde_json::Value,
    ) -> anyhow::Result<HttpResponse> {
        self.api_request(Method::PATCH, resource, Some(body)).await
    }

    pub async fn delete_resource(&self, resource: &str) -> anyhow::Result<HttpResponse> {
        self.api_request(Method::DELETE, resource, None).await
    }
}

pub fn is_json_family(content_type: &str) -> bool {
    matches!(
        content_type,
        "application/json" | "application/json-patch+json" | "application/geo+json"
    )
}

#[cfg(test)]
mod live_tests {
    use super::*;
    use axum::extract::RawQuery;
    use axum::http::HeaderMap;
    use axum::response::Json;
    use axum::routing::{get, post};
    use axum::Router;
    use chrono::Utc;
    use serde_json::{Value, json};

    use crate::db::models::requests::{CcStatusMap, LeasedRequest, RequestStatus};
    use crate::db::models::servers::Server;

    async fn spawn_app(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn test_server(url: String) -> Server {
        Server {
            id: 2,
            uid: "B0000000001".to_string(),
            name: "dhis2".to_string(),
            username: "admin".to_string(),
            password: "district".to_string(),
            auth_token: String::new(),
            auth_method: "Basic".to_string(),
            url,
            http_method: "POST".to_string(),
            url_params: sqlx::types::Json(HashMap::new()),
            use_ssl: false,
            use_async: false,
            parse_responses: true,
            allow_callbacks: false,
            allow_copies: false,
            suspended: false,
            start_submission_period: 0,
            end_submission_period: 24,
            cc_urls: Vec::new(),
            callback_url: String::new(),
            xml_response_xpath: String::new(),
            json_response_xpath: String::new(),
            created: Utc::now(),
            updated: Utc::now(),
        }
    }

    fn test_request(body: &str) -> LeasedRequest {
        LeasedRequest {
            id: 1,
            depends_on: None,
            source: 1,
            destination: 2,
            cc_servers: Vec::new(),
            cc_servers_status: sqlx::types::Json(CcStatusMap::new()),
            body: body.to_string(),
            retries: 0,
            in_submission_period: true,
            content_type: "application/json".to_string(),
            object_type: String::new(),
            body_is_query_param: false,
            submissionid: String::new(),
            url_suffix: String::new(),
            suspended: false,
            status: RequestStatus::Ready,
            statuscode: String::new(),
            errors: String::new(),
            response: String::new(),
        }
    }

    #[tokio::test]
    async fn submit_posts_normalized_body_with_basic_auth() {
        let router = Router::new().route(
            "/api/dataValueSets",
            post(|headers: HeaderMap, body: String| async move {
                Json(json!({
                    "auth": headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or(""),
                    "content_type": headers
                        .get("content-type")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or(""),
                    "body": body,
                }))
            }),
        );
        let base = spawn_app(router).await;

        let server = test_server(format!("{base}/api/dataValueSets"));
        let client =
            DestinationClient::new(server, true, Duration::from_secs(5)).unwrap();

        let request = test_request(r#"{"x": 1}"#);
        let response = client.submit(&request).await.unwrap();
        assert_eq!(response.status, 200);

        let echo: Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(echo["auth"], json!("Basic YWRtaW46ZGlzdHJpY3Q="));
        assert_eq!(echo["content_type"], json!("application/json"));
        // JSON bodies are re-encoded before sending
        assert_eq!(echo["body"], json!(r#"{"x":1}"#));
    }

    #[tokio::test]
    async fn submit_appends_suffix_and_server_params() {
        let router = Router::new().route(
            "/api/dataValueSets",
            post(|RawQuery(query): RawQuery| async move {
                Json(json!({ "query": query.unwrap_or_default() }))
            }),
        );
        let base = spawn_app(router).await;

        let mut server = test_server(format!("{base}/api"));
        server.url_params.0.insert("dryRun".to_string(), json!("true"));
        let client =
            DestinationClient::new(server, true, Duration::from_secs(5)).unwrap();

        let mut request = test_request(r#"{"x": 1}"#);
        request.url_suffix = "/dataValueSets".to_string();
        let response = client.submit(&request).await.unwrap();
        assert_eq!(response.status, 200);

        let echo: Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(echo["query"], json!("dryRun=true"));
    }

    #[tokio::test]
    async fn submit_with_token_auth_uses_apitoken_scheme() {
        let router = Router::new().route(
            "/api/dataValueSets",
            post(|headers: HeaderMap| async move {
                Json(json!({
                    "auth": headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or(""),
                }))
            }),
        );
        let base = spawn_app(router).await;

        let mut server = test_server(format!("{base}/api/dataValueSets"));
        server.auth_method = "Token".to_string();
        server.auth_token = "d2pat-secret".to_string();
        let client =
            DestinationClient::new(server, true, Duration::from_secs(5)).unwrap();

        let response = client.submit(&test_request("{}")).await.unwrap();
        let echo: Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(echo["auth"], json!("ApiToken d2pat-secret"));
    }

    #[tokio::test]
    async fn get_resource_addresses_the_api_base() {
        let router = Router::new().route(
            "/api/system/tasks/DATAVALUE_IMPORT/job-1",
            get(|| async { Json(json!([{ "completed": true, "message": "done" }])) }),
        );
        let base = spawn_app(router).await;

        // the configured URL points at an import endpoint; resources are
        // addressed from its /api base
        let server = test_server(format!("{base}/api/dataValueSets"));
        let client =
            DestinationClient::new(server, true, Duration::from_secs(5)).unwrap();

        let response = client
            .get_resource("system/tasks/DATAVALUE_IMPORT/job-1")
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert!(response.body.contains("\"completed\":true"));
    }

    #[tokio::test]
    async fn transport_failure_surfaces_as_error() {
        // nothing listens on this port
        let server = test_server("http://127.0.0.1:1/api/dataValueSets".to_string());
        let client =
            DestinationClient::new(server, true, Duration::from_secs(1)).unwrap();
        assert!(client.submit(&test_request("{}")).await.is_err());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn base_url_strips_api_path() {
        assert_eq!(
            base_api_url("https://play.dhis2.org/api/dataValueSets").unwrap(),
            "https://play.dhis2.org/api"
        );
        assert!(base_api_url("https://example.org/dataValueSets").is_err());
    }

    #[test]
    fn params_appended_preserving_question_mark() {
        let mut params = HashMap::new();
        params.insert("orgUnitIdScheme".to_string(), json!("CODE"));

        assert_eq!(
            add_params_to_url("http://h/api/dataValueSets", &params),
            "http://h/api/dataValueSets?orgUnitIdScheme=CODE"
        );
        assert_eq!(
            add_params_to_url("http://h/api/dataValueSets?", &params),
            "http://h/api/dataValueSets?orgUnitIdScheme=CODE"
        );
        assert_eq!(
            add_params_to_url("http://h/api/dataValueSets?async=true", &params),
            "http://h/api/dataValueSets?async=true&orgUnitIdScheme=CODE"
        );
    }

    #[test]
    fn no_params_leaves_url_alone() {
        assert_eq!(
            add_params_to_url("http://h/api/x", &HashMap::new()),
            "http://h/api/x"
        );
    }

    #[test]
    fn non_string_params_are_rendered() {
        let mut params = HashMap::new();
        params.insert("dryRun".to_string(), json!(true));
        assert_eq!(
            add_params_to_url("http://h/x", &params),
            "http://h/x?dryRun=true"
        );
    }

    #[test]
    fn json_family_detection() {
        assert!(is_json_family("application/json"));
        assert!(is_json_family("application/geo+json"));
        assert!(!is_json_family("application/xml"));
        assert!(!is_json_family("text/plain"));
    }
}
