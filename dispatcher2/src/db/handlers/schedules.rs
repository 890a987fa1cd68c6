//! Database repository for schedules.

use chrono::{DateTime, Utc};
use sqlx::PgConnection;
use tracing::instrument;

use crate::db::errors::Result;
use crate::db::models::schedules::{Schedule, ScheduleCreateDBRequest, ScheduleStatus};
use crate::types::ScheduleId;

pub struct Schedules<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Schedules<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(sched_type = %request.sched_type), err)]
    pub async fn create(&mut self, request: &ScheduleCreateDBRequest) -> Result<Schedule> {
        let row = sqlx::query_as::<_, Schedule>(
            r#"
            INSERT INTO schedules
                (sched_type, params, sched_content, sched_url, command, command_args, repeat,
                 repeat_interval, cron_expression, first_run_at, next_run_at, is_active,
                 request_id, server_id, server_in_cc, async_job_type, async_jobid, created_by)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, COALESCE($11, NOW()), $12, $13, $14,
                    $15, $16, $17, $18)
            RETURNING *
            "#,
        )
        .bind(&request.sched_type)
        .bind(&request.params)
        .bind(&request.sched_content)
        .bind(&request.sched_url)
        .bind(&request.command)
        .bind(&request.command_args)
        .bind(&request.repeat)
        .bind(request.repeat_interval)
        .bind(&request.cron_expression)
        .bind(request.first_run_at)
        .bind(request.next_run_at)
        .bind(request.is_active)
        .bind(request.request_id)
        .bind(request.server_id)
        .bind(request.server_in_cc)
        .bind(&request.async_job_type)
        .bind(&request.async_jobid)
        .bind(request.created_by)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(row)
    }

    pub async fn get(&mut self, id: ScheduleId) -> Result<Option<Schedule>> {
        let row = sqlx::query_as::<_, Schedule>("SELECT * FROM schedules WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(row)
    }

    pub async fn list(&mut self) -> Result<Vec<Schedule>> {
        let rows = sqlx::query_as::<_, Schedule>("SELECT * FROM schedules ORDER BY id")
            .fetch_all(&mut *self.db)
            .await?;
        Ok(rows)
    }

    /// Replace the mutable columns of a schedule from an API update.
    pub async fn update(
        &mut self,
        id: ScheduleId,
        request: &ScheduleCreateDBRequest,
    ) -> Result<Option<Schedule>> {
        let row = sqlx::query_as::<_, Schedule>(
            r#"
            UPDATE schedules
            SET sched_type = $2, params = $3, sched_content = $4, sched_url = $5, command = $6,
                command_args = $7, repeat = $8, repeat_interval = $9, cron_expression = $10,
                first_run_at = $11, next_run_at = COALESCE($12, next_run_at),
                is_active = $13, updated = NOW()
            WHERE id = $1
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&request.sched_type)
        .bind(&request.params)
        .bind(&request.sched_content)
        .bind(&request.sched_url)
        .bind(&request.command)
        .bind(&request.command_args)
        .bind(&request.repeat)
        .bind(request.repeat_interval)
        .bind(&request.cron_expression)
        .bind(request.first_run_at)
        .bind(request.next_run_at)
        .bind(request.is_active)
        .fetch_optional(&mut *self.db)
        .await?;
        Ok(row)
    }

    pub async fn delete(&mut self, id: ScheduleId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM schedules WHERE id = $1")
            .bind(id)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Ids of schedules that are due: active, ready and past `next_run_at`.
    pub async fn due_ids(&mut self) -> Result<Vec<ScheduleId>> {
        let ids = sqlx::query_scalar::<_, ScheduleId>(
            r#"
            SELECT id FROM schedules
            WHERE next_run_at <= NOW() AND is_active = TRUE AND status = 'ready'
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&mut *self.db)
        .await?;
        Ok(ids)
    }

    /// Re-arm the schedule: record the run and push `next_run_at` forward.
    pub async fn update_run_details(
        &mut self,
        id: ScheduleId,
        status: ScheduleStatus,
        next_run_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE schedules
            SET (status, next_run_at, last_run_at, updated) = ($2, $3, NOW(), NOW())
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .bind(next_run_at)
        .execute(&mut *self.db)
        .await?;
        Ok(())
    }

    /// Terminal transition: completed or expired, recording the run.
    pub async fn update_status(&mut self, id: ScheduleId, status: ScheduleStatus) -> Result<()> {
        sqlx::query(
            "UPDATE schedules SET (status, last_run_at, updated) = ($2, NOW(), NOW()) WHERE id = $1",
        )
        .bind(id)
        .bind(status)
        .execute(&mut *self.db)
        .await?;
        Ok(())
    }
}
