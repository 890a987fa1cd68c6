//! Retry sweeper: the cron-driven pass that re-admits failed primaries and
//! incomplete CC fan-outs, bypassing the gating predicates but honouring the
//! retry budgets.

use sqlx::PgPool;

use crate::db::handlers::Requests;
use crate::db::models::requests::RequestStatus;
use crate::dispatch::processor::{DispatchContext, process_request};
use crate::registry::ServerRegistry;
use crate::types::RequestId;

pub async fn sweep_incomplete_requests(
    pool: &PgPool,
    registry: &ServerRegistry,
    ctx: &DispatchContext,
) -> anyhow::Result<()> {
    tracing::info!("Starting to process incomplete requests");

    let ids = {
        let mut conn = pool.acquire().await?;
        Requests::new(&mut conn).list_incomplete_for_retry().await?
    };

    for id in ids {
        if let Err(e) = sweep_one(pool, registry, ctx, id).await {
            tracing::error!(request_id = id, error = %e, "Failed to retry incomplete request");
        }
    }

    tracing::info!("Finished processing incomplete requests");
    Ok(())
}

async fn sweep_one(
    pool: &PgPool,
    registry: &ServerRegistry,
    ctx: &DispatchContext,
    id: RequestId,
) -> anyhow::Result<()> {
    let mut tx = pool.begin().await?;

    let Some(mut req) = Requests::new(&mut tx).lease(id).await? else {
        tracing::debug!(request_id = id, "Row locked, skipping this sweep");
        return Ok(());
    };

    tracing::info!(request_id = id, "Handling incomplete request");

    // failed primary: re-send while budget remains, expire once exhausted
    if req.status == RequestStatus::Failed {
        if let Some(destination) = registry.get_by_id(req.destination).await {
            if req.retries <= ctx.max_retries {
                process_request(&mut tx, &mut req, &destination, false, true, ctx).await?;
            } else {
                req.status = RequestStatus::Expired;
                Requests::new(&mut tx).update_status(req.id, RequestStatus::Expired).await?;
            }
        } else {
            tracing::warn!(request_id = id, server_id = req.destination, "Destination server not in registry");
        }
    }

    // incomplete CC fan-out: entries that failed or were never attempted,
    // each gated by its own retry budget
    for cc_id in req.cc_servers.clone() {
        if cc_id == req.destination {
            continue;
        }
        let entry = req.cc_status_entry(cc_id).clone();
        let incomplete = entry.status.is_none() || entry.status == Some(RequestStatus::Failed);
        if !incomplete {
            continue;
        }

        let Some(cc_server) = registry.get_by_id(cc_id).await else {
            tracing::warn!(request_id = id, server_id = cc_id, "CC server not in registry");
            continue;
        };

        if entry.retries <= ctx.max_retries as i64 {
            process_request(&mut tx, &mut req, &cc_server, true, true, ctx).await?;
        } else {
            req.cc_status_entry(cc_id).status = Some(RequestStatus::Expired);
            Requests::new(&mut tx).update_cc_status(&req).await?;
        }
    }

    tx.commit().await?;
    Ok(())
}
