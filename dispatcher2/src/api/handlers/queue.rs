//! Handlers for the queue API: enqueue, list, fetch and delete requests.

use axum::extract::{Path, Query, RawQuery, State};
use axum::http::HeaderMap;
use axum::response::Json;
use chrono::{Datelike, Utc};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::AppState;
use crate::api::query::{self, FieldSelection};
use crate::db::handlers::Requests;
use crate::db::handlers::requests::{FilterClause, OrderClause};
use crate::db::models::requests::{Request, RequestCreateDBRequest};
use crate::db::models::servers::Server;
use crate::dispatch::client::is_json_family;
use crate::errors::{Error, Result};
use crate::types;

/// Query parameters of `POST /api/queue`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct QueueParams {
    pub source: Option<String>,
    pub destination: Option<String>,
    #[serde(rename = "dependsOn")]
    pub depends_on: Option<i64>,
    pub year: Option<String>,
    pub week: Option<String>,
    pub month: Option<String>,
    pub period: Option<String>,
    pub facility: Option<String>,
    pub district: Option<String>,
    pub msisdn: Option<String>,
    #[serde(rename = "rawMsg")]
    pub raw_msg: Option<String>,
    #[serde(rename = "reportType")]
    pub report_type: Option<String>,
    #[serde(rename = "objectType")]
    pub object_type: Option<String>,
    #[serde(alias = "msgid")]
    pub submission_id: Option<String>,
    pub batchid: Option<String>,
    pub cc_servers: Option<String>,
    pub extras: Option<String>,
    #[serde(rename = "urlSuffix")]
    pub url_suffix: Option<String>,
    #[serde(rename = "isQueryParams")]
    pub is_query_params: Option<String>,
}

pub async fn enqueue(
    State(state): State<AppState>,
    Query(params): Query<QueueParams>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<Value>> {
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
        .unwrap_or_else(|| "application/json".to_string());

    let source_name = params.source.as_deref().unwrap_or("localhost");
    let source = state
        .registry
        .id_by_name(source_name)
        .await
        .ok_or_else(|| Error::BadRequest {
            message: format!("Source server {source_name} not found!"),
        })?;

    let destination_name = params.destination.as_deref().unwrap_or("");
    let destination = state
        .registry
        .id_by_name(destination_name)
        .await
        .ok_or_else(|| Error::BadRequest {
            message: format!("Destination server {destination_name} not found!"),
        })?;

    // JSON-family payloads are normalised (decoded and re-encoded) before
    // being stored; anything else goes in raw
    let body = if is_json_family(&content_type) {
        let value: Value = serde_json::from_str(&body).map_err(|e| Error::BadRequest {
            message: format!("Error reading request body: {e}"),
        })?;
        serde_json::to_string(&value).map_err(anyhow::Error::from)?
    } else {
        body
    };

    let cc_servers = match params.cc_servers.as_deref() {
        Some(names) => state.registry.resolve_names(names).await,
        None => Vec::new(),
    };

    let now = Utc::now();
    let iso_week = now.iso_week();

    let create = RequestCreateDBRequest {
        uid: types::generate_uid(),
        batchid: params.batchid.unwrap_or_else(types::generate_uid),
        source,
        destination,
        depends_on: params.depends_on,
        cc_servers,
        content_type,
        body,
        body_is_query_param: params.is_query_params.as_deref() == Some("true"),
        url_suffix: params.url_suffix.unwrap_or_default(),
        object_type: params.object_type.unwrap_or_default(),
        report_type: params.report_type.unwrap_or_default(),
        period: params.period.unwrap_or_default(),
        week: params.week.unwrap_or_else(|| iso_week.week().to_string()),
        month: params.month.unwrap_or_else(|| now.month().to_string()),
        year: params.year.unwrap_or_else(|| iso_week.year().to_string()),
        msisdn: params.msisdn.unwrap_or_default(),
        raw_msg: params.raw_msg.unwrap_or_default(),
        facility: params.facility.unwrap_or_default(),
        district: params.district.unwrap_or_default(),
        extras: params.extras.unwrap_or_default(),
        submissionid: params.submission_id.unwrap_or_default(),
    };

    let mut conn = state.db.acquire().await.map_err(crate::db::errors::DbError::from)?;
    let row = Requests::new(&mut conn).create(&create).await?;

    tracing::info!(uid = %row.uid, destination = row.destination, "Message queued");

    let mut value = serde_json::to_value(&row).map_err(anyhow::Error::from)?;
    if let Value::Object(map) = &mut value {
        map.insert("message".to_string(), json!("Message queued"));
    }
    Ok(Json(value))
}

/// Parsed `GET /api/queue` parameters. `filter` and `order` repeat, which is
/// why this comes from the raw query string rather than a typed extractor.
#[derive(Debug, Default)]
struct ListQuery {
    filters: Vec<FilterClause>,
    orders: Vec<OrderClause>,
    selection: FieldSelection,
    page: i64,
    page_size: i64,
    paging: bool,
}

fn parse_list_query(raw: Option<&str>) -> Result<ListQuery> {
    let mut query = ListQuery {
        page: 1,
        page_size: 50,
        paging: true,
        ..Default::default()
    };

    for (key, value) in url::form_urlencoded::parse(raw.unwrap_or("").as_bytes()) {
        match key.as_ref() {
            "filter" => query.filters.push(query::parse_filter(&value)?),
            "order" => query.orders.push(query::parse_order(&value)?),
            "fields" => query.selection = query::parse_fields(&value),
            "page" => {
                query.page = value.parse().map_err(|_| Error::BadRequest {
                    message: format!("invalid page '{value}'"),
                })?;
            }
            "pageSize" => {
                query.page_size = value.parse().map_err(|_| Error::BadRequest {
                    message: format!("invalid pageSize '{value}'"),
                })?;
            }
            "paging" => query.paging = value != "false",
            _ => {}
        }
    }

    if query.page < 1 || query.page_size < 1 {
        return Err(Error::BadRequest {
            message: "page and pageSize must be positive".to_string(),
        });
    }

    Ok(query)
}

pub async fn list(State(state): State<AppState>, RawQuery(raw): RawQuery) -> Result<Json<Value>> {
    let query = parse_list_query(raw.as_deref())?;

    let (limit, offset) = if query.paging {
        (query.page_size, (query.page - 1) * query.page_size)
    } else {
        (100_000, 0)
    };

    let rows = {
        let mut conn = state.db.acquire().await.map_err(crate::db::errors::DbError::from)?;
        Requests::new(&mut conn)
            .list(&query.filters, &query.orders, limit, offset)
            .await?
    };

    let mut requests = Vec::with_capacity(rows.len());
    for row in &rows {
        requests.push(render_request(&state, row, &query.selection).await?);
    }

    Ok(Json(json!({
        "pager": { "page": query.page, "pageSize": query.page_size, "paging": query.paging },
        "requests": requests,
    })))
}

pub async fn get_request(
    State(state): State<AppState>,
    Path(uid): Path<String>,
    RawQuery(raw): RawQuery,
) -> Result<Json<Value>> {
    let query = parse_list_query(raw.as_deref())?;

    let row = {
        let mut conn = state.db.acquire().await.map_err(crate::db::errors::DbError::from)?;
        Requests::new(&mut conn).get_by_uid(&uid).await?
    }
    .ok_or_else(|| Error::NotFound {
        resource: "Request".to_string(),
        id: uid.clone(),
    })?;

    Ok(Json(render_request(&state, &row, &query.selection).await?))
}

pub async fn delete_request(
    State(state): State<AppState>,
    Path(uid): Path<String>,
) -> Result<Json<Value>> {
    let deleted = {
        let mut conn = state.db.acquire().await.map_err(crate::db::errors::DbError::from)?;
        Requests::new(&mut conn).delete_by_uid(&uid).await?
    };

    if !deleted {
        return Err(Error::NotFound {
            resource: "Request".to_string(),
            id: uid,
        });
    }
    Ok(Json(json!({ "status": "deleted" })))
}

/// Serialize a row through the field selection, expanding any requested
/// relationships into server objects.
async fn render_request(
    state: &AppState,
    row: &Request,
    selection: &FieldSelection,
) -> Result<Value> {
    let value = serde_json::to_value(row).map_err(anyhow::Error::from)?;
    let mut value = query::project(value, selection);

    if let Value::Object(map) = &mut value {
        for (relation, subfields) in &selection.relationships {
            let expanded = match relation.as_str() {
                "source" => server_value(state.registry.get_by_id(row.source).await, subfields),
                "destination" => {
                    server_value(state.registry.get_by_id(row.destination).await, subfields)
                }
                "cc_servers" => {
                    let mut servers = Vec::new();
                    for id in &row.cc_servers {
                        servers.push(server_value(state.registry.get_by_id(*id).await, subfields));
                    }
                    Value::Array(servers)
                }
                _ => Value::Null,
            };
            map.insert(relation.clone(), expanded);
        }
    }

    Ok(value)
}

fn server_value(server: Option<Server>, subfields: &[String]) -> Value {
    let Some(server) = server else {
        return Value::Null;
    };
    // Server's Serialize impl already withholds credentials
    let mut value = serde_json::to_value(&server).unwrap_or(Value::Null);
    if !subfields.is_empty() {
        if let Value::Object(map) = &mut value {
            map.retain(|key, _| subfields.iter().any(|f| f == key));
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_query_defaults() {
        let query = parse_list_query(None).unwrap();
        assert_eq!(query.page, 1);
        assert_eq!(query.page_size, 50);
        assert!(query.paging);
        assert!(query.filters.is_empty());
    }

    #[test]
    fn list_query_parses_repeated_params() {
        let query = parse_list_query(Some(
            "filter=status:EQ:failed&filter=retries:GT:2&order=created:desc&page=3&pageSize=20",
        ))
        .unwrap();
        assert_eq!(query.filters.len(), 2);
        assert_eq!(query.orders.len(), 1);
        assert_eq!(query.page, 3);
        assert_eq!(query.page_size, 20);
    }

    #[test]
    fn list_query_rejects_bad_values() {
        assert!(parse_list_query(Some("page=zero")).is_err());
        assert!(parse_list_query(Some("page=0")).is_err());
        assert!(parse_list_query(Some("filter=bad")).is_err());
    }

    #[test]
    fn paging_false_disables_limit_checking() {
        let query = parse_list_query(Some("paging=false")).unwrap();
        assert!(!query.paging);
    }
}
