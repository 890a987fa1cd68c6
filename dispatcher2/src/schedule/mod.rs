//! Schedule processing: a second producer/consumer pipeline, structurally a
//! mirror of the request one, over the `schedules` table.
//!
//! The one behaviourally defined type is `dhis2_async_job_check`: poll the
//! destination for the status of a remote import job and, once it terminates,
//! rewrite the originating request (or its CC sub-state) with the final
//! counts. `url`, `sms`, `contact_push` and `command` are reserved no-ops.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::{PgConnection, PgPool};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::db::handlers::{Requests, Schedules};
use crate::db::models::requests::RequestStatus;
use crate::db::models::schedules::{SchedType, Schedule, ScheduleStatus};
use crate::dispatch::client::DestinationClient;
use crate::dispatch::dhis2::{AsyncJobImportSummary, AsyncJobStatus};
use crate::dispatch::processor::DispatchContext;
use crate::dispatch::producer::InFlight;
use crate::registry::ServerRegistry;
use crate::types::ScheduleId;

const PER_SCHEDULE_DELAY: Duration = Duration::from_secs(1);

pub async fn produce_schedules(
    pool: PgPool,
    jobs: mpsc::Sender<ScheduleId>,
    in_flight: InFlight,
    interval: Duration,
    shutdown: CancellationToken,
) {
    tracing::info!("Schedule producer starting");

    loop {
        let ids = match pool.acquire().await {
            Ok(mut conn) => match Schedules::new(&mut conn).due_ids().await {
                Ok(ids) => ids,
                Err(e) => {
                    tracing::error!(error = %e, "Error fetching due schedules");
                    Vec::new()
                }
            },
            Err(e) => {
                tracing::error!(error = %e, "Schedule producer failed to acquire a connection");
                Vec::new()
            }
        };

        let mut produced = 0usize;
        for id in ids {
            if in_flight.lock().await.contains(&id) {
                continue;
            }
            tokio::select! {
                sent = jobs.send(id) => {
                    if sent.is_err() {
                        tracing::info!("Schedule channel closed, producer stopping");
                        return;
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("Schedule producer stopping");
                    return;
                }
            }
            in_flight.lock().await.insert(id);
            produced += 1;
        }

        if produced > 0 {
            tracing::info!(schedules_produced = produced, "Schedules produced");
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.cancelled() => {
                tracing::info!("Schedule producer stopping");
                return;
            }
        }
    }
}

pub fn start_schedule_consumers(
    pool: PgPool,
    registry: ServerRegistry,
    ctx: DispatchContext,
    jobs: mpsc::Receiver<ScheduleId>,
    in_flight: InFlight,
    workers: usize,
) -> JoinSet<()> {
    let jobs = Arc::new(Mutex::new(jobs));
    let mut set = JoinSet::new();

    for worker in 1..=workers {
        let pool = pool.clone();
        let registry = registry.clone();
        let ctx = ctx.clone();
        let jobs = jobs.clone();
        let in_flight = in_flight.clone();

        set.spawn(async move {
            tracing::info!(worker, "Schedule consumer starting");
            loop {
                let id = { jobs.lock().await.recv().await };
                let Some(id) = id else {
                    tracing::info!(worker, "Schedule channel closed, consumer stopping");
                    return;
                };

                if let Err(e) = process_schedule(&pool, &registry, &ctx, id).await {
                    tracing::error!(worker, schedule_id = id, error = %e, "Failed to process schedule");
                }

                let remaining = {
                    let mut in_flight = in_flight.lock().await;
                    in_flight.remove(&id);
                    in_flight.len()
                };
                tracing::info!(worker, schedule_id = id, in_flight = remaining, "Consumer done with schedule");

                tokio::time::sleep(PER_SCHEDULE_DELAY).await;
            }
        });
    }

    set
}

/// Process one due schedule inside its own transaction. A handler error
/// rolls the transaction back; the schedule stays ready and is retried on
/// the next producer tick.
async fn process_schedule(
    pool: &PgPool,
    registry: &ServerRegistry,
    ctx: &DispatchContext,
    id: ScheduleId,
) -> anyhow::Result<()> {
    tracing::info!(schedule_id = id, "Processing schedule");

    let mut tx = pool.begin().await?;
    let Some(schedule) = Schedules::new(&mut tx).get(id).await? else {
        tracing::warn!(schedule_id = id, "Schedule disappeared before processing");
        return Ok(());
    };

    match schedule.sched_type() {
        SchedType::Dhis2AsyncJobCheck => {
            check_async_job(&mut tx, registry, ctx, &schedule).await?;
        }
        SchedType::Url => tracing::info!(schedule_id = id, "Handling URL schedule"),
        SchedType::Sms => tracing::info!(schedule_id = id, "Handling SMS schedule"),
        SchedType::ContactPush => {
            tracing::info!(schedule_id = id, "Handling contact push schedule");
        }
        SchedType::Command => tracing::info!(schedule_id = id, "Handling command schedule"),
        SchedType::Unknown => {
            tracing::info!(schedule_id = id, sched_type = %schedule.sched_type, "Unknown schedule");
        }
    }

    tx.commit().await?;
    Ok(())
}

/// What a poll of the remote task list amounted to.
#[derive(Debug, Clone, PartialEq)]
pub enum PollDecision {
    /// The task list was empty: the job is unknown to the server.
    JobUnknown,
    /// The job exists but has not completed; poll again later.
    StillRunning,
    /// At least one task entry reports completion; fetch the summary.
    Finished,
}

pub fn decide_poll(statuses: &[AsyncJobStatus]) -> PollDecision {
    if statuses.is_empty() {
        PollDecision::JobUnknown
    } else if statuses.iter().any(|s| s.completed) {
        PollDecision::Finished
    } else {
        PollDecision::StillRunning
    }
}

async fn check_async_job(
    tx: &mut PgConnection,
    registry: &ServerRegistry,
    ctx: &DispatchContext,
    schedule: &Schedule,
) -> anyhow::Result<()> {
    let (Some(server_id), Some(request_id)) = (schedule.server_id, schedule.request_id) else {
        tracing::warn!(schedule_id = schedule.id, "Async job schedule has no server or request link");
        Schedules::new(tx).update_status(schedule.id, ScheduleStatus::Expired).await?;
        return Ok(());
    };

    let Some(server) = registry.get_by_id(server_id).await else {
        // server may reappear on a config reload; keep the schedule armed
        tracing::warn!(schedule_id = schedule.id, server_id, "Server not in registry, re-arming schedule");
        re_arm(tx, schedule).await?;
        return Ok(());
    };

    let client = DestinationClient::new(server, ctx.verify_ssl, ctx.request_timeout)?;

    let tasks_resource = format!(
        "system/tasks/{}/{}",
        schedule.async_job_type, schedule.async_jobid
    );
    let response = client.get_resource(&tasks_resource).await?;
    let statuses: Vec<AsyncJobStatus> = serde_json::from_str(&response.body)
        .map_err(|e| anyhow::anyhow!("failed to decode task status list: {e}"))?;

    match decide_poll(&statuses) {
        PollDecision::JobUnknown => {
            tracing::warn!(
                schedule_id = schedule.id,
                job_id = %schedule.async_jobid,
                "Async job unknown to server, expiring schedule"
            );
            Schedules::new(tx).update_status(schedule.id, ScheduleStatus::Expired).await?;
        }
        PollDecision::StillRunning => {
            tracing::info!(
                schedule_id = schedule.id,
                job_id = %schedule.async_jobid,
                "Async job still running"
            );
            re_arm(tx, schedule).await?;
        }
        PollDecision::Finished => {
            let summary_resource = format!(
                "system/taskSummaries/{}/{}",
                schedule.async_job_type, schedule.async_jobid
            );
            let response = client.get_resource(&summary_resource).await?;
            let summary: AsyncJobImportSummary = serde_json::from_str(&response.body)
                .map_err(|e| anyhow::anyhow!("failed to decode task summary: {e}"))?;
            let summary_line = summary.summary_line();

            tracing::info!(
                schedule_id = schedule.id,
                request_id,
                summary = %summary_line,
                "Async job finished, updating originating request"
            );

            let Some(mut req) = Requests::new(tx).lease(request_id).await? else {
                // leased elsewhere right now; try again on the next tick
                tracing::debug!(request_id, "Originating request locked, re-arming schedule");
                re_arm(tx, schedule).await?;
                return Ok(());
            };

            if schedule.server_in_cc {
                let entry = req.cc_status_entry(server_id);
                entry.status = Some(RequestStatus::Completed);
                entry.errors = summary_line;
                Requests::new(tx).update_cc_status(&req).await?;
            } else {
                req.status = RequestStatus::Completed;
                req.errors = summary_line;
                Requests::new(tx).update_request(&req).await?;
            }

            Schedules::new(tx).update_status(schedule.id, ScheduleStatus::Completed).await?;
        }
    }

    Ok(())
}

async fn re_arm(tx: &mut PgConnection, schedule: &Schedule) -> anyhow::Result<()> {
    let interval = i64::from(schedule.repeat_interval.max(1));
    let next_run_at = Utc::now() + chrono::Duration::seconds(interval);
    Schedules::new(tx)
        .update_run_details(schedule.id, ScheduleStatus::Ready, next_run_at)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(completed: bool) -> AsyncJobStatus {
        AsyncJobStatus {
            completed,
            ..Default::default()
        }
    }

    #[test]
    fn empty_task_list_means_job_unknown() {
        assert_eq!(decide_poll(&[]), PollDecision::JobUnknown);
    }

    #[test]
    fn running_job_is_polled_again() {
        assert_eq!(
            decide_poll(&[status(false), status(false)]),
            PollDecision::StillRunning
        );
    }

    #[test]
    fn any_completed_entry_finishes_the_poll() {
        assert_eq!(
            decide_poll(&[status(false), status(true)]),
            PollDecision::Finished
        );
    }
}
