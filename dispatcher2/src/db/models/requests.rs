//! Database models for queued requests.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sqlx::FromRow;
use sqlx::postgres::{PgTypeInfo, Postgres};
use sqlx::types::Json;

use crate::types::{RequestId, ServerId};

/// Lifecycle status of a request. `ready` rows are dispatchable; `failed` is
/// non-terminal and eligible for the retry sweeper until the budget runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Ready,
    Completed,
    Failed,
    Expired,
    Canceled,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Ready => "ready",
            RequestStatus::Completed => "completed",
            RequestStatus::Failed => "failed",
            RequestStatus::Expired => "expired",
            RequestStatus::Canceled => "canceled",
        }
    }

    /// Terminal statuses are never re-admitted by the sweeper.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Expired | RequestStatus::Canceled
        )
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(RequestStatus::Ready),
            "completed" => Ok(RequestStatus::Completed),
            "failed" => Ok(RequestStatus::Failed),
            "expired" => Ok(RequestStatus::Expired),
            "canceled" => Ok(RequestStatus::Canceled),
            other => Err(format!("unknown request status: {other}")),
        }
    }
}

// Stored as TEXT; decode/encode by hand so the runtime query API can use the
// enum directly in row structs and binds.
impl sqlx::Type<Postgres> for RequestStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<Postgres>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, Postgres> for RequestStatus {
    fn decode(
        value: sqlx::postgres::PgValueRef<'r>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let s = <&str as sqlx::Decode<Postgres>>::decode(value)?;
        Ok(s.parse()?)
    }
}

impl<'q> sqlx::Encode<'q, Postgres> for RequestStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<Postgres>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Per-CC-server sub-state tracked inside `requests.cc_servers_status`.
///
/// Legacy rows carry float `retries` values written by an older serializer;
/// they are coalesced to integers on read and always written back as
/// integers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CcServerStatus {
    #[serde(deserialize_with = "int_or_legacy_float")]
    pub retries: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RequestStatus>,
    #[serde(rename = "statusCode", skip_serializing_if = "String::is_empty")]
    pub status_code: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub response: String,
    pub errors: String,
}

/// Mapping from CC server id (as a JSON object key) to its sub-state.
pub type CcStatusMap = HashMap<String, CcServerStatus>;

fn int_or_legacy_float<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let n = serde_json::Number::deserialize(deserializer)?;
    if let Some(i) = n.as_i64() {
        Ok(i)
    } else if let Some(f) = n.as_f64() {
        Ok(f as i64)
    } else {
        Err(serde::de::Error::custom(format!(
            "retries is not representable as an integer: {n}"
        )))
    }
}

/// A full request row.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Request {
    #[serde(skip_serializing)]
    pub id: RequestId,
    pub uid: String,
    pub batchid: String,
    pub source: ServerId,
    pub destination: ServerId,
    pub depends_on: Option<RequestId>,
    pub cc_servers: Vec<ServerId>,
    pub cc_servers_status: Json<CcStatusMap>,
    pub content_type: String,
    pub body: String,
    pub body_is_query_param: bool,
    pub url_suffix: String,
    pub object_type: String,
    pub report_type: String,
    pub period: String,
    pub week: String,
    pub month: String,
    pub year: String,
    pub msisdn: String,
    pub raw_msg: String,
    pub facility: String,
    pub district: String,
    pub extras: String,
    pub submissionid: String,
    pub status: RequestStatus,
    pub statuscode: String,
    pub errors: String,
    pub response: String,
    pub retries: i32,
    pub suspended: bool,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

/// Database request for inserting a new queued request. Server names from the
/// enqueue API have already been resolved to ids by the caller.
#[derive(Debug, Clone, Default)]
pub struct RequestCreateDBRequest {
    pub uid: String,
    pub batchid: String,
    pub source: ServerId,
    pub destination: ServerId,
    pub depends_on: Option<RequestId>,
    pub cc_servers: Vec<ServerId>,
    pub content_type: String,
    pub body: String,
    pub body_is_query_param: bool,
    pub url_suffix: String,
    pub object_type: String,
    pub report_type: String,
    pub period: String,
    pub week: String,
    pub month: String,
    pub year: String,
    pub msisdn: String,
    pub raw_msg: String,
    pub facility: String,
    pub district: String,
    pub extras: String,
    pub submissionid: String,
}

/// The consumer's working view of a leased row. `in_submission_period` is
/// evaluated by the database at lease time so its clock is authoritative.
#[derive(Debug, Clone, FromRow)]
pub struct LeasedRequest {
    pub id: RequestId,
    pub depends_on: Option<RequestId>,
    pub source: ServerId,
    pub destination: ServerId,
    pub cc_servers: Vec<ServerId>,
    pub cc_servers_status: Json<CcStatusMap>,
    pub body: String,
    pub retries: i32,
    pub in_submission_period: bool,
    pub content_type: String,
    pub object_type: String,
    pub body_is_query_param: bool,
    pub submissionid: String,
    pub url_suffix: String,
    pub suspended: bool,
    pub status: RequestStatus,
    pub statuscode: String,
    pub errors: String,
    pub response: String,
}

impl LeasedRequest {
    pub fn has_dependency(&self) -> bool {
        self.depends_on.is_some()
    }

    /// Sub-state for a CC server, creating the default entry on first touch.
    pub fn cc_status_entry(&mut self, server: ServerId) -> &mut CcServerStatus {
        self.cc_servers_status
            .0
            .entry(server.to_string())
            .or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            RequestStatus::Ready,
            RequestStatus::Completed,
            RequestStatus::Failed,
            RequestStatus::Expired,
            RequestStatus::Canceled,
        ] {
            assert_eq!(status.as_str().parse::<RequestStatus>().unwrap(), status);
        }
        assert!("pending".parse::<RequestStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(RequestStatus::Completed.is_terminal());
        assert!(RequestStatus::Expired.is_terminal());
        assert!(RequestStatus::Canceled.is_terminal());
        assert!(!RequestStatus::Ready.is_terminal());
        assert!(!RequestStatus::Failed.is_terminal());
    }

    #[test]
    fn cc_status_tolerates_legacy_float_retries() {
        let legacy: CcServerStatus =
            serde_json::from_str(r#"{"retries": 2.0, "status": "failed", "statusCode": "500"}"#)
                .unwrap();
        assert_eq!(legacy.retries, 2);
        assert_eq!(legacy.status, Some(RequestStatus::Failed));

        // and always serializes back as an integer
        let out = serde_json::to_value(&legacy).unwrap();
        assert_eq!(out["retries"], serde_json::json!(2));
    }

    #[test]
    fn cc_status_defaults_for_missing_fields() {
        let fresh: CcServerStatus = serde_json::from_str("{}").unwrap();
        assert_eq!(fresh.retries, 0);
        assert_eq!(fresh.status, None);
        assert!(fresh.errors.is_empty());
    }

    #[test]
    fn cc_entry_created_on_first_touch() {
        let mut leased = LeasedRequest {
            id: 1,
            depends_on: None,
            source: 1,
            destination: 2,
            cc_servers: vec![3],
            cc_servers_status: Json(CcStatusMap::new()),
            body: String::new(),
            retries: 0,
            in_submission_period: true,
            content_type: "application/json".into(),
            object_type: String::new(),
            body_is_query_param: false,
            submissionid: String::new(),
            url_suffix: String::new(),
            suspended: false,
            status: RequestStatus::Ready,
            statuscode: String::new(),
            errors: String::new(),
            response: String::new(),
        };

        leased.cc_status_entry(3).retries += 1;
        assert_eq!(leased.cc_servers_status.0["3"].retries, 1);
    }
}
