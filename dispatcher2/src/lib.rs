//! # dispatcher2: a durable at-least-once HTTP request dispatcher
//!
//! `dispatcher2` accepts HTTP payloads from producer applications, queues them
//! durably in PostgreSQL against a named destination server, and forwards
//! each payload to that destination plus zero or more carbon-copy servers. It
//! honours per-destination submission windows, bounded retry budgets,
//! inter-request dependencies, and tracks long-running asynchronous imports
//! on the destination via a follow-up polling schedule.
//!
//! ## Architecture
//!
//! The HTTP layer is [Axum](https://github.com/tokio-rs/axum); all state
//! lives in PostgreSQL. Two producer/consumer pipelines run alongside the
//! server:
//!
//! - the **request pipeline** scans for dispatchable rows, leases each with
//!   `SELECT ... FOR UPDATE NOWAIT`, sends to the destination, fans out to CC
//!   servers, and transcribes the outcome into the row;
//! - the **schedule pipeline** mirrors it over the `schedules` table and
//!   polls destinations for the fate of asynchronous import jobs.
//!
//! A cron-driven retry sweeper re-admits failed rows and incomplete CC
//! fan-outs, bypassing the gating predicates but honouring retry budgets.
//!
//! Delivery is at-least-once: destinations must tolerate duplicates. The
//! only cross-request ordering honoured is the explicit `depends_on` gate.
//!
//! ## Quick Start
//!
//! ```no_run
//! use clap::Parser;
//! use dispatcher2::{Application, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let args = dispatcher2::config::Args::parse();
//!     let config = Config::load(&args)?;
//!     dispatcher2::telemetry::init_telemetry()?;
//!
//!     let app = Application::new(config, &args).await?;
//!     app.serve(async {
//!         tokio::signal::ctrl_c().await.expect("Failed to listen for Ctrl+C");
//!     })
//!     .await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod auth;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod errors;
pub mod registry;
pub mod schedule;
pub mod telemetry;
pub mod types;

use std::time::Duration;

use anyhow::Context;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, instrument};

pub use config::Config;
use dispatch::DispatchContext;
use registry::ServerRegistry;

/// Application state shared across request handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Config,
    pub registry: ServerRegistry,
}

/// Get the dispatcher2 database migrator
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// The assembled application: HTTP listener plus background pipelines.
pub struct Application {
    state: AppState,
    listener: TcpListener,
    shutdown_token: CancellationToken,
    background: Vec<JoinSet<()>>,
    sweeper: Option<JobScheduler>,
}

impl Application {
    #[instrument(skip_all)]
    pub async fn new(config: Config, args: &config::Args) -> anyhow::Result<Self> {
        // init-time fatals: bad timezone, unreachable DB, failed migration
        let timezone = config.timezone();
        info!(timezone = %timezone, "Using timezone");

        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .connect(&config.database.uri)
            .await
            .context("failed to connect to database")?;

        migrator().run(&pool).await.context("failed to run migrations")?;

        let registry = ServerRegistry::new();
        registry.load_all(&pool).await?;

        let shutdown_token = CancellationToken::new();
        let mut background: Vec<JoinSet<()>> = Vec::new();

        let state = AppState {
            db: pool.clone(),
            config: config.clone(),
            registry: registry.clone(),
        };

        // server definition files: load now, then watch for changes
        if let Some(dir) = config.server.servers_directory.clone() {
            registry.load_definitions_dir(&pool, &dir).await?;
            let mut watcher_set = JoinSet::new();
            watcher_set.spawn(registry::watch_definitions_dir(
                registry.clone(),
                pool.clone(),
                dir,
                shutdown_token.clone(),
            ));
            background.push(watcher_set);
        }

        let ctx = DispatchContext {
            max_retries: config.server.max_retries,
            job_check_interval: config.server.dhis2_job_status_check_interval,
            verify_ssl: config.server.verify_ssl,
            request_timeout: Duration::from_secs(config.server.request_timeout),
        };
        let tick = Duration::from_secs(config.server.request_process_interval);
        let workers = config.server.max_concurrent;

        let mut sweeper = None;
        if !args.skip_request_processing {
            let (jobs_tx, jobs_rx) = mpsc::channel(workers * 2);
            let in_flight: dispatch::InFlight = Default::default();

            let mut producer_set = JoinSet::new();
            producer_set.spawn(dispatch::producer::produce_requests(
                pool.clone(),
                jobs_tx,
                in_flight.clone(),
                tick,
                shutdown_token.clone(),
            ));
            background.push(producer_set);

            background.push(dispatch::consumer::start_consumers(
                pool.clone(),
                registry.clone(),
                ctx.clone(),
                jobs_rx,
                in_flight,
                workers,
            ));

            sweeper = Some(
                start_retry_sweeper(
                    &config.server.retry_cron_expression,
                    pool.clone(),
                    registry.clone(),
                    ctx.clone(),
                )
                .await?,
            );
        }

        if !args.skip_schedule_processing {
            let (jobs_tx, jobs_rx) = mpsc::channel(workers * 2);
            let in_flight: dispatch::InFlight = Default::default();

            let mut producer_set = JoinSet::new();
            producer_set.spawn(schedule::produce_schedules(
                pool.clone(),
                jobs_tx,
                in_flight.clone(),
                tick,
                shutdown_token.clone(),
            ));
            background.push(producer_set);

            background.push(schedule::start_schedule_consumers(
                pool.clone(),
                registry.clone(),
                ctx.clone(),
                jobs_rx,
                in_flight,
                workers,
            ));
        }

        let listener = TcpListener::bind(config.bind_address())
            .await
            .with_context(|| format!("failed to bind {}", config.bind_address()))?;
        info!(address = %config.bind_address(), "Listening");

        Ok(Self {
            state,
            listener,
            shutdown_token,
            background,
            sweeper,
        })
    }

    /// Serve until the shutdown future resolves, then drain: stop the
    /// producers, let consumers finish in-flight leases, stop the sweeper.
    pub async fn serve(
        mut self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let router = api::router(self.state.clone()).layer(TraceLayer::new_for_http());

        let token = self.shutdown_token.clone();
        tokio::spawn(async move {
            shutdown.await;
            token.cancel();
        });

        let graceful = {
            let token = self.shutdown_token.clone();
            async move { token.cancelled().await }
        };

        axum::serve(self.listener, router)
            .with_graceful_shutdown(graceful)
            .await?;

        info!("HTTP server stopped, draining background workers");
        for mut set in self.background.drain(..) {
            while set.join_next().await.is_some() {}
        }
        if let Some(mut sweeper) = self.sweeper.take() {
            if let Err(e) = sweeper.shutdown().await {
                tracing::warn!(error = %e, "Failed to shut down retry sweeper");
            }
        }
        info!("Shutdown complete");
        Ok(())
    }
}

/// Wire the retry sweeper onto its cron expression. A malformed expression
/// is an init-time fatal.
async fn start_retry_sweeper(
    cron_expression: &str,
    pool: PgPool,
    registry: ServerRegistry,
    ctx: DispatchContext,
) -> anyhow::Result<JobScheduler> {
    info!(retry_cron_expression = cron_expression, "Request retry cron expression");

    let mut scheduler = JobScheduler::new()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create retry scheduler: {e}"))?;

    let job = Job::new_async(cron_expression, move |_uuid, _lock| {
        let pool = pool.clone();
        let registry = registry.clone();
        let ctx = ctx.clone();
        Box::pin(async move {
            if let Err(e) = dispatch::sweeper::sweep_incomplete_requests(&pool, &registry, &ctx).await {
                tracing::error!(error = %e, "Retry sweep failed");
            }
        })
    })
    .map_err(|e| anyhow::anyhow!("invalid retry cron expression: {e}"))?;

    scheduler
        .add(job)
        .await
        .map_err(|e| anyhow::anyhow!("failed to schedule retry sweep: {e}"))?;
    scheduler
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("failed to start retry scheduler: {e}"))?;

    Ok(scheduler)
}
