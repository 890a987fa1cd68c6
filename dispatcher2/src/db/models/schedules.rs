//! Database models for time-triggered schedules.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::postgres::{PgTypeInfo, Postgres};

use crate::types::{RequestId, ScheduleId, ServerId, UserId};

/// Lifecycle status of a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleStatus {
    Ready,
    Completed,
    Expired,
}

impl ScheduleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScheduleStatus::Ready => "ready",
            ScheduleStatus::Completed => "completed",
            ScheduleStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for ScheduleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScheduleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ready" => Ok(ScheduleStatus::Ready),
            "completed" => Ok(ScheduleStatus::Completed),
            "expired" => Ok(ScheduleStatus::Expired),
            other => Err(format!("unknown schedule status: {other}")),
        }
    }
}

impl sqlx::Type<Postgres> for ScheduleStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<Postgres>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, Postgres> for ScheduleStatus {
    fn decode(
        value: sqlx::postgres::PgValueRef<'r>,
    ) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let s = <&str as sqlx::Decode<Postgres>>::decode(value)?;
        Ok(s.parse()?)
    }
}

impl<'q> sqlx::Encode<'q, Postgres> for ScheduleStatus {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<Postgres>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// What a schedule does when due. Only the async-job check is behaviourally
/// defined; the others are reserved and handled as logged no-ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedType {
    Dhis2AsyncJobCheck,
    Url,
    Sms,
    ContactPush,
    Command,
    Unknown,
}

impl SchedType {
    pub fn parse(s: &str) -> Self {
        match s {
            "dhis2_async_job_check" => SchedType::Dhis2AsyncJobCheck,
            "url" => SchedType::Url,
            "sms" => SchedType::Sms,
            "contact_push" => SchedType::ContactPush,
            "command" => SchedType::Command,
            _ => SchedType::Unknown,
        }
    }
}

/// A schedule row.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Schedule {
    pub id: ScheduleId,
    pub sched_type: String,
    pub params: serde_json::Value,
    pub sched_content: String,
    pub sched_url: String,
    pub command: String,
    pub command_args: String,
    pub repeat: String,
    pub repeat_interval: i32,
    pub cron_expression: String,
    pub first_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub status: ScheduleStatus,
    pub is_active: bool,
    pub request_id: Option<RequestId>,
    pub server_id: Option<ServerId>,
    pub server_in_cc: bool,
    pub async_job_type: String,
    pub async_jobid: String,
    pub created_by: Option<UserId>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl Schedule {
    pub fn sched_type(&self) -> SchedType {
        SchedType::parse(&self.sched_type)
    }
}

/// Database request for inserting a schedule.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleCreateDBRequest {
    pub sched_type: String,
    pub params: serde_json::Value,
    pub sched_content: String,
    pub sched_url: String,
    pub command: String,
    pub command_args: String,
    pub repeat: String,
    pub repeat_interval: i32,
    pub cron_expression: String,
    pub first_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub request_id: Option<RequestId>,
    pub server_id: Option<ServerId>,
    pub server_in_cc: bool,
    pub async_job_type: String,
    pub async_jobid: String,
    pub created_by: Option<UserId>,
}

impl Default for ScheduleCreateDBRequest {
    fn default() -> Self {
        Self {
            sched_type: "url".to_string(),
            params: serde_json::json!({}),
            sched_content: String::new(),
            sched_url: String::new(),
            command: String::new(),
            command_args: String::new(),
            repeat: String::new(),
            repeat_interval: 0,
            cron_expression: String::new(),
            first_run_at: None,
            next_run_at: None,
            is_active: true,
            request_id: None,
            server_id: None,
            server_in_cc: false,
            async_job_type: String::new(),
            async_jobid: String::new(),
            created_by: None,
        }
    }
}

impl ScheduleCreateDBRequest {
    /// The schedule the request consumer inserts after a successful async
    /// send: poll the remote job every `check_interval` seconds.
    pub fn async_job_check(
        request_id: RequestId,
        server_id: ServerId,
        server_in_cc: bool,
        job_type: &str,
        job_id: &str,
        check_interval: i64,
    ) -> Self {
        Self {
            sched_type: "dhis2_async_job_check".to_string(),
            repeat: "interval".to_string(),
            repeat_interval: check_interval as i32,
            next_run_at: Some(Utc::now() + chrono::Duration::seconds(check_interval)),
            is_active: true,
            request_id: Some(request_id),
            server_id: Some(server_id),
            server_in_cc,
            async_job_type: job_type.to_string(),
            async_jobid: job_id.to_string(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sched_type_parses_known_and_unknown() {
        assert_eq!(
            SchedType::parse("dhis2_async_job_check"),
            SchedType::Dhis2AsyncJobCheck
        );
        assert_eq!(SchedType::parse("sms"), SchedType::Sms);
        assert_eq!(SchedType::parse("mystery"), SchedType::Unknown);
    }

    #[test]
    fn async_job_check_schedule_shape() {
        let req = ScheduleCreateDBRequest::async_job_check(7, 3, true, "DATAVALUE_IMPORT", "job-1", 30);
        assert_eq!(req.sched_type, "dhis2_async_job_check");
        assert_eq!(req.repeat, "interval");
        assert_eq!(req.repeat_interval, 30);
        assert_eq!(req.request_id, Some(7));
        assert_eq!(req.server_id, Some(3));
        assert!(req.server_in_cc);
        assert!(req.next_run_at.unwrap() > Utc::now());
    }
}
