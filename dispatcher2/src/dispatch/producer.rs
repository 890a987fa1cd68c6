//! Request producer: periodically scans the store for dispatchable rows and
//! streams their ids onto the in-process channel.
//!
//! The in-flight set is a best-effort de-dup on top of the row lock: even if
//! a crash re-publishes an id, the `FOR UPDATE NOWAIT` lease serialises the
//! actual work.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::db::handlers::Requests;
use crate::types::RequestId;

/// Ids currently published but not yet committed by a consumer. Shared
/// between one producer and its consumer pool.
pub type InFlight = Arc<Mutex<HashSet<i64>>>;

pub async fn produce_requests(
    pool: PgPool,
    jobs: mpsc::Sender<RequestId>,
    in_flight: InFlight,
    interval: Duration,
    shutdown: CancellationToken,
) {
    tracing::info!("Request producer starting");

    loop {
        let ids = match pool.acquire().await {
            Ok(mut conn) => match Requests::new(&mut conn).list_dispatchable().await {
                Ok(ids) => ids,
                Err(e) => {
                    tracing::error!(error = %e, "Error reading ready requests");
                    Vec::new()
                }
            },
            Err(e) => {
                tracing::error!(error = %e, "Producer failed to acquire a connection");
                Vec::new()
            }
        };

        let mut produced = 0usize;
        for id in ids {
            if in_flight.lock().await.contains(&id) {
                tracing::debug!(request_id = id, "Request already in dynamic queue");
                continue;
            }
            // blocks when consumers are saturated; that backpressure is the
            // pacing mechanism
            tokio::select! {
                sent = jobs.send(id) => {
                    if sent.is_err() {
                        tracing::info!("Request channel closed, producer stopping");
                        return;
                    }
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("Request producer stopping");
                    return;
                }
            }
            in_flight.lock().await.insert(id);
            produced += 1;
        }

        if produced > 0 {
            tracing::info!(requests_added = produced, "Fetched requests");
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.cancelled() => {
                tracing::info!("Request producer stopping");
                return;
            }
        }
    }
}
