//! Database repository for destination servers.

use sqlx::PgConnection;
use tracing::instrument;

use crate::db::errors::Result;
use crate::db::models::servers::{Server, ServerDefinition};
use crate::types::{self, ServerId};

pub struct Servers<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Servers<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    pub async fn load_all(&mut self) -> Result<Vec<Server>> {
        let rows = sqlx::query_as::<_, Server>("SELECT * FROM servers ORDER BY id")
            .fetch_all(&mut *self.db)
            .await?;
        Ok(rows)
    }

    pub async fn get_by_id(&mut self, id: ServerId) -> Result<Option<Server>> {
        let row = sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(row)
    }

    pub async fn get_by_name(&mut self, name: &str) -> Result<Option<Server>> {
        let row = sqlx::query_as::<_, Server>("SELECT * FROM servers WHERE name = $1")
            .bind(name)
            .fetch_optional(&mut *self.db)
            .await?;
        Ok(row)
    }

    /// Create the server when the name is new; otherwise update every mutable
    /// column, keeping the existing uid. A caller-supplied uid that fails the
    /// 11-char alphanumeric pattern is replaced with a fresh one.
    #[instrument(skip(self, def), fields(name = %def.name), err)]
    pub async fn upsert(&mut self, def: &ServerDefinition) -> Result<Server> {
        let uid = match def.uid.as_deref() {
            Some(uid) if types::is_valid_uid(uid) => uid.to_string(),
            _ => types::generate_uid(),
        };

        let row = sqlx::query_as::<_, Server>(
            r#"
            INSERT INTO servers
                (uid, name, username, password, auth_token, auth_method, url, http_method,
                 url_params, use_ssl, use_async, parse_responses, allow_callbacks, allow_copies,
                 suspended, start_submission_period, end_submission_period, cc_urls, callback_url)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17,
                    $18, $19)
            ON CONFLICT (name) DO UPDATE SET
                username = EXCLUDED.username,
                password = EXCLUDED.password,
                auth_token = EXCLUDED.auth_token,
                auth_method = EXCLUDED.auth_method,
                url = EXCLUDED.url,
                http_method = EXCLUDED.http_method,
                url_params = EXCLUDED.url_params,
                use_ssl = EXCLUDED.use_ssl,
                use_async = EXCLUDED.use_async,
                parse_responses = EXCLUDED.parse_responses,
                allow_callbacks = EXCLUDED.allow_callbacks,
                allow_copies = EXCLUDED.allow_copies,
                suspended = EXCLUDED.suspended,
                start_submission_period = EXCLUDED.start_submission_period,
                end_submission_period = EXCLUDED.end_submission_period,
                cc_urls = EXCLUDED.cc_urls,
                callback_url = EXCLUDED.callback_url,
                updated = NOW()
            RETURNING *
            "#,
        )
        .bind(&uid)
        .bind(&def.name)
        .bind(&def.username)
        .bind(&def.password)
        .bind(&def.auth_token)
        .bind(if def.auth_method.is_empty() { "Basic" } else { &def.auth_method })
        .bind(&def.url)
        .bind(if def.http_method.is_empty() { "POST" } else { &def.http_method })
        .bind(sqlx::types::Json(&def.url_params))
        .bind(def.use_ssl)
        .bind(def.use_async)
        .bind(def.parse_responses)
        .bind(def.allow_callbacks)
        .bind(def.allow_copies)
        .bind(def.suspended)
        .bind(def.start_submission_period.unwrap_or(0))
        .bind(def.end_submission_period.unwrap_or(24))
        .bind(&def.cc_urls)
        .bind(&def.callback_url)
        .fetch_one(&mut *self.db)
        .await?;

        Ok(row)
    }
}
