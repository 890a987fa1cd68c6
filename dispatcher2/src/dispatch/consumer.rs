//! Request consumer pool.
//!
//! Each worker takes an id off the shared channel, leases the row with
//! `FOR UPDATE NOWAIT`, dispatches to the destination and fans out to every
//! CC server, then commits. All state written during the lease lands in the
//! same transaction; a worker that loses the lock race simply abandons the
//! id.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;

use crate::db::handlers::Requests;
use crate::dispatch::processor::{DispatchContext, process_request};
use crate::dispatch::producer::InFlight;
use crate::registry::ServerRegistry;
use crate::types::RequestId;

/// Delay after each leased row, bounded politeness toward downstream.
const PER_REQUEST_DELAY: Duration = Duration::from_secs(1);

pub fn start_consumers(
    pool: PgPool,
    registry: ServerRegistry,
    ctx: DispatchContext,
    jobs: mpsc::Receiver<RequestId>,
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
            tracing::info!(worker, "Request consumer starting");
            loop {
                let id = { jobs.lock().await.recv().await };
                let Some(id) = id else {
                    tracing::info!(worker, "Request channel closed, consumer stopping");
                    return;
                };

                tracing::info!(worker, request_id = id, "Handling request");
                if let Err(e) = consume_one(&pool, &registry, &ctx, id).await {
                    tracing::error!(worker, request_id = id, error = %e, "Failed to process request");
                }

                let remaining = {
                    let mut in_flight = in_flight.lock().await;
                    in_flight.remove(&id);
                    in_flight.len()
                };
                tracing::info!(worker, request_id = id, in_flight = remaining, "Consumer done with request");

                tokio::time::sleep(PER_REQUEST_DELAY).await;
            }
        });
    }

    set
}

async fn consume_one(
    pool: &PgPool,
    registry: &ServerRegistry,
    ctx: &DispatchContext,
    id: RequestId,
) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;

    let Some(mut req) = Requests::new(&mut tx).lease(id).await? else {
        tracing::debug!(request_id = id, "Row locked or gone, abandoning");
        return Ok(());
    };

    if let Some(destination) = registry.get_by_id(req.destination).await {
        process_request(&mut tx, &mut req, &destination, false, false, ctx).await?;
    } else {
        tracing::warn!(request_id = id, server_id = req.destination, "Destination server not in registry");
    }

    for cc_id in req.cc_servers.clone() {
        match registry.get_by_id(cc_id).await {
            Some(cc_server) => {
                process_request(&mut tx, &mut req, &cc_server, true, false, ctx).await?;
            }
            None => {
                tracing::warn!(request_id = id, server_id = cc_id, "CC server not in registry");
            }
        }
    }

    tx.commit().await?;
    Ok(())
}
