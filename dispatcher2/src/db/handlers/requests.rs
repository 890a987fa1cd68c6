//! Database repository for queued requests.

use sqlx::{PgConnection, Postgres, QueryBuilder};
use tracing::instrument;

use crate::db::errors::{DbError, Result};
use crate::db::models::requests::{LeasedRequest, Request, RequestCreateDBRequest, RequestStatus};
use crate::types::{RequestId, ServerId};

/// Fields that the list API may filter and order on.
pub const REQUEST_FIELDS: &[&str] = &[
    "uid",
    "batchid",
    "source",
    "destination",
    "depends_on",
    "content_type",
    "object_type",
    "report_type",
    "period",
    "week",
    "month",
    "year",
    "msisdn",
    "facility",
    "district",
    "submissionid",
    "status",
    "statuscode",
    "errors",
    "retries",
    "suspended",
    "created",
    "updated",
];

/// A single `field:OP:value` filter from the list API. The field has already
/// been checked against [`REQUEST_FIELDS`].
#[derive(Debug, Clone, PartialEq)]
pub struct FilterClause {
    pub field: &'static str,
    pub op: FilterOp,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Like,
    ILike,
    In,
}

impl FilterOp {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "EQ" => Some(FilterOp::Eq),
            "NE" => Some(FilterOp::Ne),
            "LT" => Some(FilterOp::Lt),
            "LE" => Some(FilterOp::Le),
            "GT" => Some(FilterOp::Gt),
            "GE" => Some(FilterOp::Ge),
            "LIKE" => Some(FilterOp::Like),
            "ILIKE" => Some(FilterOp::ILike),
            "IN" => Some(FilterOp::In),
            _ => None,
        }
    }

    fn sql(&self) -> &'static str {
        match self {
            FilterOp::Eq => "=",
            FilterOp::Ne => "<>",
            FilterOp::Lt => "<",
            FilterOp::Le => "<=",
            FilterOp::Gt => ">",
            FilterOp::Ge => ">=",
            FilterOp::Like => "LIKE",
            FilterOp::ILike => "ILIKE",
            FilterOp::In => "= ANY",
        }
    }
}

/// A single `field:direction` ordering from the list API. The `i` variants
/// order case-insensitively.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderClause {
    pub field: &'static str,
    pub descending: bool,
    pub case_insensitive: bool,
}

pub struct Requests<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Requests<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    #[instrument(skip(self, request), fields(uid = %request.uid), err)]
    pub async fn create(&mut self, request: &RequestCreateDBRequest) -> Result<Request> {
        let row = sqlx::query_as::<_, Request>(
            r#"
            INSERT INTO requests
                (uid, batchid, source, destination, depends_on, cc_servers, content_type, body,
                 body_is_query_param, url_suffix, object_type, report_type, period, week, month,
                 year, msisdn, raw_msg, facility, district, extras, submissionid)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19, $20, $21, $22)
            RETURNING *
            "#,
        )
        .bind(&request.uid)
        .bind(&request.batchid)
        .bind(request.source)
        .bind(request.destination)
        .bind(request.depends_on)
        .bind(&request.cc_servers)
        .bind(&request.content_type)
        .bind(&request.body)
        .bind(request.body_is_query_param)
        .bind(&request.url_suffix)
        .bind(&request.object_type)
        .bind(&request.report_type)
        .bind(&request.period)
        .bind(&request.week)
        .bind(&request.month)
        .bind(&request.year)
        .bind(&request.msisdn)
        .bind(&request.raw_msg)
        .bind(&request.facility)
        .bind(&request.district)
        .bind(&request.extras)
        .bind(&request.submissionid)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(row)
    }

    pub async fn get_by_uid(&mut self, uid: &str) -> Result<Option<Request>> {
        let row = sqlx::query_as::<_, Request>("SELECT * FROM requests WHERE uid = $1")
            .bind(uid)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(row)
    }

    pub async fn delete_by_uid(&mut self, uid: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM requests WHERE uid = $1")
            .bind(uid)
            .execute(&mut *self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// List requests with the parsed filter/order clauses from the queue API.
    /// All comparisons are performed on the text form of the column so one
    /// code path serves every whitelisted field.
    pub async fn list(
        &mut self,
        filters: &[FilterClause],
        orders: &[OrderClause],
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Request>> {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new("SELECT * FROM requests WHERE 1=1");

        for filter in filters {
            qb.push(" AND ")
                .push(filter.field)
                .push("::text ")
                .push(filter.op.sql());
            if filter.op == FilterOp::In {
                let values: Vec<String> =
                    filter.value.split(',').map(|v| v.trim().to_string()).collect();
                qb.push("(").push_bind(values).push(")");
            } else {
                qb.push(" ").push_bind(filter.value.clone());
            }
        }

        if orders.is_empty() {
            qb.push(" ORDER BY created DESC");
        } else {
            qb.push(" ORDER BY ");
            for (i, order) in orders.iter().enumerate() {
                if i > 0 {
                    qb.push(", ");
                }
                if order.case_insensitive {
                    qb.push("lower(").push(order.field).push("::text)");
                } else {
                    qb.push(order.field);
                }
                qb.push(if order.descending { " DESC" } else { " ASC" });
            }
        }

        qb.push(" LIMIT ").push_bind(limit);
        qb.push(" OFFSET ").push_bind(offset);

        let rows = qb.build_query_as::<Request>().fetch_all(&mut *self.db).await?;
        Ok(rows)
    }

    /// Ids of rows that are ready and whose dependency gate passes, ordered so
    /// depended-upon work surfaces first.
    pub async fn list_dispatchable(&mut self) -> Result<Vec<RequestId>> {
        let ids = sqlx::query_scalar::<_, RequestId>(
            r#"
            SELECT id FROM requests
            WHERE status = 'ready' AND status_of_dependence(id) IN ('completed', '')
            ORDER BY depends_on DESC, created
            LIMIT 100000
            "#,
        )
        .fetch_all(&mut *self.db)
        .await?;
        Ok(ids)
    }

    /// Ids of rows the retry sweeper should revisit: failed primaries plus
    /// rows whose CC fan-out is incomplete.
    pub async fn list_incomplete_for_retry(&mut self) -> Result<Vec<RequestId>> {
        let ids = sqlx::query_scalar::<_, RequestId>(
            r#"
            SELECT id FROM requests
            WHERE ((status IN ('completed', 'failed')
                    AND failed_cc_servers(cc_servers, cc_servers_status) <> '{}')
                   OR status = 'failed')
              AND suspended = FALSE AND status <> 'expired'
            ORDER BY depends_on DESC
            "#,
        )
        .fetch_all(&mut *self.db)
        .await?;
        Ok(ids)
    }

    /// Lease a row for exclusive processing inside the caller's transaction.
    /// Returns `None` when another worker holds the row (the id resurfaces on
    /// the next producer tick) or the row is gone.
    #[instrument(skip(self), err)]
    pub async fn lease(&mut self, id: RequestId) -> Result<Option<LeasedRequest>> {
        let row = sqlx::query_as::<_, LeasedRequest>(
            r#"
            SELECT id, depends_on, source, destination, cc_servers, cc_servers_status, body,
                   retries, in_submission_period(destination) AS in_submission_period,
                   content_type, object_type, body_is_query_param, submissionid, url_suffix,
                   suspended, status, statuscode, errors, response
            FROM requests
            WHERE id = $1
            FOR UPDATE NOWAIT
            "#,
        )
        .bind(id)
        .fetch_optional(&mut *self.db)
        .await;

        match row {
            Ok(row) => Ok(row),
            Err(e) => match DbError::from(e) {
                DbError::LockNotAvailable => Ok(None),
                other => Err(other),
            },
        }
    }

    /// Whether the dependency of a request is completed. Used when the gate is
    /// evaluated mid-transaction rather than by the producer query.
    pub async fn dependency_completed(&mut self, depends_on: RequestId) -> Result<bool> {
        let completed = sqlx::query_scalar::<_, bool>(
            "SELECT status = 'completed' FROM requests WHERE id = $1",
        )
        .bind(depends_on)
        .fetch_optional(&mut *self.db)
        .await?;
        Ok(completed.unwrap_or(false))
    }

    /// Write the outcome fields of a leased row.
    pub async fn update_request(&mut self, row: &LeasedRequest) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE requests
            SET (status, statuscode, errors, retries, response, updated)
                = ($2, $3, $4, $5, $6, CURRENT_TIMESTAMP)
            WHERE id = $1
            "#,
        )
        .bind(row.id)
        .bind(row.status)
        .bind(&row.statuscode)
        .bind(&row.errors)
        .bind(row.retries)
        .bind(&row.response)
        .execute(&mut *self.db)
        .await?;
        Ok(())
    }

    /// Write only the status of a row.
    pub async fn update_status(&mut self, id: RequestId, status: RequestStatus) -> Result<()> {
        sqlx::query("UPDATE requests SET (status, updated) = ($2, CURRENT_TIMESTAMP) WHERE id = $1")
            .bind(id)
            .bind(status)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }

    /// Write only the CC fan-out sub-states of a leased row.
    pub async fn update_cc_status(&mut self, row: &LeasedRequest) -> Result<()> {
        sqlx::query("UPDATE requests SET cc_servers_status = $2 WHERE id = $1")
            .bind(row.id)
            .bind(&row.cc_servers_status)
            .execute(&mut *self.db)
            .await?;
        Ok(())
    }

    /// Evaluate a server's submission window on the database clock.
    pub async fn in_submission_period(&mut self, server_id: ServerId) -> Result<bool> {
        let open = sqlx::query_scalar::<_, bool>("SELECT in_submission_period($1)")
            .bind(server_id)
            .fetch_one(&mut *self.db)
            .await?;
        Ok(open)
    }
}
