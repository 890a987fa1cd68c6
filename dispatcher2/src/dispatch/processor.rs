//! The per-target dispatch state machine.
//!
//! [`process_request`] runs one (request, target) pair inside the caller's
//! transaction: evaluate the gating predicates, send, classify the response,
//! and transcribe the outcome into the row (primary fields) or the per-CC
//! sub-state. Every failure is written to the row and committed by the
//! caller; nothing here propagates a send failure as an error.

use std::time::Duration;

use sqlx::PgConnection;

use crate::db::errors::Result;
use crate::db::handlers::{Requests, Schedules};
use crate::db::models::requests::{LeasedRequest, RequestStatus};
use crate::db::models::schedules::ScheduleCreateDBRequest;
use crate::db::models::servers::Server;
use crate::dispatch::client::{DestinationClient, HttpResponse};
use crate::dispatch::dhis2::{AsyncJobAccepted, ImportSummary};

/// Engine knobs shared by consumers and the sweeper.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub max_retries: i32,
    pub job_check_interval: i64,
    pub verify_ssl: bool,
    pub request_timeout: Duration,
}

/// What a single send attempt amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// 2xx from a synchronous destination with a parsable import summary
    Completed { status_code: u16, summary: String },
    /// 2xx from an asynchronous destination; the remote job must be polled
    AsyncAccepted {
        status_code: u16,
        job_type: String,
        job_id: String,
    },
    /// 2xx but the body shape was unrecognised (ERROR03, retryable)
    DecodeFailed { status_code: u16 },
    /// non-2xx rejection; the raw body is kept for the operator
    Rejected { status_code: u16, body: String },
    /// transport-level failure (ERROR02, retryable)
    Unreachable,
}

/// Classify a send attempt by HTTP status class and destination kind.
pub fn classify_response(use_async: bool, result: anyhow::Result<HttpResponse>) -> Outcome {
    let response = match result {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to send request");
            return Outcome::Unreachable;
        }
    };

    if !response.is_success() {
        return Outcome::Rejected {
            status_code: response.status,
            body: response.body,
        };
    }

    if use_async {
        match serde_json::from_str::<AsyncJobAccepted>(&response.body) {
            Ok(accepted) if !accepted.response.id.is_empty() => Outcome::AsyncAccepted {
                status_code: response.status,
                job_type: accepted.response.job_type,
                job_id: accepted.response.id,
            },
            _ => Outcome::DecodeFailed {
                status_code: response.status,
            },
        }
    } else {
        match serde_json::from_str::<ImportSummary>(&response.body) {
            Ok(summary) => Outcome::Completed {
                status_code: response.status,
                summary: summary.summary_line(),
            },
            Err(_) => Outcome::DecodeFailed {
                status_code: response.status,
            },
        }
    }
}

/// Dispatch one request to one target. `server_in_cc` selects which state the
/// outcome lands in; `skip_check` (retry sweep only) bypasses the gate.
pub async fn process_request(
    db: &mut PgConnection,
    req: &mut LeasedRequest,
    destination: &Server,
    server_in_cc: bool,
    skip_check: bool,
    ctx: &DispatchContext,
) -> Result<()> {
    let can_send = if skip_check {
        true
    } else if server_in_cc {
        can_send_cc(db, req, destination, ctx).await?
    } else {
        can_send_primary(db, req, destination, ctx).await?
    };

    if !can_send {
        tracing::info!(
            request_id = req.id,
            server_id = destination.id,
            server_in_cc,
            skip_check,
            "Cannot process request now"
        );
        return Ok(());
    }

    let result = match DestinationClient::new(
        destination.clone(),
        ctx.verify_ssl,
        ctx.request_timeout,
    ) {
        Ok(client) => client.submit(req).await,
        Err(e) => Err(e),
    };

    let outcome = classify_response(destination.use_async, result);
    apply_outcome(db, req, destination, server_in_cc, outcome, ctx).await
}

/// Gate for the primary destination. Terminal transitions (expiry, cancel,
/// empty body) are persisted here before refusing.
async fn can_send_primary(
    db: &mut PgConnection,
    req: &mut LeasedRequest,
    destination: &Server,
    ctx: &DispatchContext,
) -> Result<bool> {
    if let Some(depends_on) = req.depends_on {
        if !Requests::new(db).dependency_completed(depends_on).await? {
            tracing::info!(request_id = req.id, depends_on, "Dependency incomplete");
            return Ok(false);
        }
    }

    if req.retries > ctx.max_retries {
        req.status = RequestStatus::Expired;
        Requests::new(db).update_status(req.id, RequestStatus::Expired).await?;
        tracing::info!(request_id = req.id, retries = req.retries, "Max retries exceeded");
        return Ok(false);
    }

    if destination.suspended {
        tracing::info!(server_id = destination.id, name = %destination.name, "Destination server is suspended");
        return Ok(false);
    }

    if !req.in_submission_period {
        tracing::info!(server_id = destination.id, name = %destination.name, "Destination server out of submission period");
        return Ok(false);
    }

    if req.suspended {
        req.errors = "Blacklisted".to_string();
        req.statuscode = "ERROR7".to_string();
        req.retries += 1;
        req.status = RequestStatus::Canceled;
        Requests::new(db).update_request(req).await?;
        tracing::info!(request_id = req.id, "Request blacklisted");
        return Ok(false);
    }

    if req.body.trim().is_empty() {
        // NOTE: retries is deliberately not incremented here; the row stays
        // failed and sweepable until the body is populated externally.
        req.status = RequestStatus::Failed;
        req.statuscode = "ERROR1".to_string();
        req.errors = "Request has empty body".to_string();
        Requests::new(db).update_request(req).await?;
        tracing::info!(request_id = req.id, "Request has empty body");
        return Ok(false);
    }

    Ok(true)
}

/// Gate for a CC target: the same predicates, but every state mutation lands
/// in the per-CC sub-state only.
async fn can_send_cc(
    db: &mut PgConnection,
    req: &mut LeasedRequest,
    cc_server: &Server,
    ctx: &DispatchContext,
) -> Result<bool> {
    if let Some(depends_on) = req.depends_on {
        if !Requests::new(db).dependency_completed(depends_on).await? {
            return Ok(false);
        }
    }

    // never send to a CC server that is also the primary destination
    if cc_server.id == req.destination {
        return Ok(false);
    }

    if req.cc_status_entry(cc_server.id).retries > ctx.max_retries as i64 {
        req.cc_status_entry(cc_server.id).status = Some(RequestStatus::Expired);
        Requests::new(db).update_cc_status(req).await?;
        return Ok(false);
    }

    if !Requests::new(db).in_submission_period(cc_server.id).await? {
        tracing::info!(server_id = cc_server.id, name = %cc_server.name, "CC server out of submission period");
        return Ok(false);
    }

    if cc_server.suspended {
        tracing::info!(server_id = cc_server.id, name = %cc_server.name, "CC server is suspended");
        return Ok(false);
    }

    if req.suspended {
        let entry = req.cc_status_entry(cc_server.id);
        entry.errors = "Blacklisted".to_string();
        entry.status_code = "ERROR7".to_string();
        entry.retries += 1;
        entry.status = Some(RequestStatus::Canceled);
        Requests::new(db).update_cc_status(req).await?;
        tracing::info!(request_id = req.id, cc_server = cc_server.id, "Request blacklisted for CC server");
        return Ok(false);
    }

    if req.body.trim().is_empty() {
        let entry = req.cc_status_entry(cc_server.id);
        entry.status = Some(RequestStatus::Failed);
        entry.status_code = "ERROR1".to_string();
        entry.errors = "Request has empty body".to_string();
        Requests::new(db).update_cc_status(req).await?;
        tracing::info!(request_id = req.id, cc_server = cc_server.id, "Request has empty body");
        return Ok(false);
    }

    Ok(true)
}

/// Transcribe a classified outcome into the row. An accepted async job also
/// inserts the poll schedule; the `completed` it writes is provisional until
/// the schedule consumer confirms the remote job.
async fn apply_outcome(
    db: &mut PgConnection,
    req: &mut LeasedRequest,
    destination: &Server,
    server_in_cc: bool,
    outcome: Outcome,
    ctx: &DispatchContext,
) -> Result<()> {
    if let Outcome::AsyncAccepted { job_type, job_id, .. } = &outcome {
        let schedule = ScheduleCreateDBRequest::async_job_check(
            req.id,
            destination.id,
            server_in_cc,
            job_type,
            job_id,
            ctx.job_check_interval,
        );
        let created = Schedules::new(db).create(&schedule).await?;
        tracing::info!(
            schedule_id = created.id,
            request_id = req.id,
            job_id = %job_id,
            "Created async job schedule"
        );
    }

    if server_in_cc {
        let entry = req.cc_status_entry(destination.id);
        entry.retries += 1;
        match &outcome {
            Outcome::Completed { status_code, summary } => {
                entry.status = Some(RequestStatus::Completed);
                entry.status_code = status_code.to_string();
                entry.errors = summary.clone();
            }
            Outcome::AsyncAccepted { status_code, .. } => {
                entry.status = Some(RequestStatus::Completed);
                entry.status_code = status_code.to_string();
                entry.errors = "Async job sent to server".to_string();
            }
            Outcome::DecodeFailed { .. } => {
                entry.status = Some(RequestStatus::Failed);
                entry.status_code = "ERROR03".to_string();
                entry.errors = "Failed to decode import summary".to_string();
            }
            Outcome::Rejected { status_code, body } => {
                entry.status = Some(RequestStatus::Failed);
                entry.status_code = status_code.to_string();
                entry.errors = "request might have conflicts".to_string();
                entry.response = body.clone();
            }
            Outcome::Unreachable => {
                entry.status = Some(RequestStatus::Failed);
                entry.status_code = "ERROR02".to_string();
                entry.errors = "Server possibly unreachable".to_string();
            }
        }
        Requests::new(db).update_cc_status(req).await?;
    } else {
        req.retries += 1;
        match &outcome {
            Outcome::Completed { status_code, summary } => {
                req.status = RequestStatus::Completed;
                req.statuscode = status_code.to_string();
                req.errors = summary.clone();
            }
            Outcome::AsyncAccepted { status_code, .. } => {
                req.status = RequestStatus::Completed;
                req.statuscode = status_code.to_string();
                req.errors = "Async job sent to server".to_string();
            }
            Outcome::DecodeFailed { status_code } => {
                req.status = RequestStatus::Failed;
                req.statuscode = "ERROR03".to_string();
                req.errors = "Failed to decode import summary".to_string();
                tracing::error!(request_id = req.id, status_code, "Failed to decode import summary");
            }
            Outcome::Rejected { status_code, body } => {
                req.status = RequestStatus::Failed;
                req.statuscode = status_code.to_string();
                req.errors = "request might have conflicts".to_string();
                req.response = body.clone();
            }
            Outcome::Unreachable => {
                req.status = RequestStatus::Failed;
                req.statuscode = "ERROR02".to_string();
                req.errors = "Server possibly unreachable".to_string();
            }
        }
        Requests::new(db).update_request(req).await?;
    }

    match &outcome {
        Outcome::Completed { status_code, .. } | Outcome::AsyncAccepted { status_code, .. } => {
            tracing::info!(
                request_id = req.id,
                server_id = destination.id,
                status_code,
                server_in_cc,
                "Request completed successfully"
            );
        }
        Outcome::Rejected { status_code, .. } => {
            tracing::warn!(
                request_id = req.id,
                server_id = destination.id,
                status_code,
                server_in_cc,
                "A non 200 response"
            );
        }
        _ => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ok(status: u16, body: &str) -> anyhow::Result<HttpResponse> {
        Ok(HttpResponse {
            status,
            body: body.to_string(),
        })
    }

    #[test]
    fn sync_success_parses_summary() {
        let outcome = classify_response(
            false,
            ok(200, r#"{"response":{"stats":{"created":2,"updated":1,"total":3}}}"#),
        );
        assert_eq!(
            outcome,
            Outcome::Completed {
                status_code: 200,
                summary: "Created: 2, Updated: 1".to_string()
            }
        );
    }

    #[test]
    fn sync_success_with_garbage_body_is_decode_failure() {
        let outcome = classify_response(false, ok(200, "<html>not json</html>"));
        assert_eq!(outcome, Outcome::DecodeFailed { status_code: 200 });
    }

    #[test]
    fn async_success_extracts_job_reference() {
        let outcome = classify_response(
            true,
            ok(
                200,
                r#"{"status":"OK","response":{"id":"job-1","jobType":"DATAVALUE_IMPORT"}}"#,
            ),
        );
        assert_eq!(
            outcome,
            Outcome::AsyncAccepted {
                status_code: 200,
                job_type: "DATAVALUE_IMPORT".to_string(),
                job_id: "job-1".to_string()
            }
        );
    }

    #[test]
    fn async_success_without_job_id_is_decode_failure() {
        let outcome = classify_response(true, ok(200, r#"{"status":"OK"}"#));
        assert_eq!(outcome, Outcome::DecodeFailed { status_code: 200 });
    }

    #[test]
    fn rejection_keeps_raw_body() {
        let outcome = classify_response(false, ok(500, "conflict detail"));
        assert_eq!(
            outcome,
            Outcome::Rejected {
                status_code: 500,
                body: "conflict detail".to_string()
            }
        );
    }

    #[test]
    fn transport_error_is_unreachable() {
        let outcome = classify_response(false, Err(anyhow::anyhow!("connection refused")));
        assert_eq!(outcome, Outcome::Unreachable);
    }
}
