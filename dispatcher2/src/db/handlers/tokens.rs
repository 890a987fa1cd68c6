//! Database repository for users and their API tokens.
//!
//! Password verification happens inside Postgres with pgcrypto's `crypt`, so
//! hashes never leave the database.

use rand::Rng;
use sqlx::PgConnection;

use crate::db::errors::Result;
use crate::types::UserId;

const TOKEN_BYTES: usize = 20;

pub struct Tokens<'c> {
    db: &'c mut PgConnection,
}

impl<'c> Tokens<'c> {
    pub fn new(db: &'c mut PgConnection) -> Self {
        Self { db }
    }

    /// Verify Basic credentials against the users table. Returns the user id
    /// when the username exists, is active, and the password matches.
    pub async fn verify_basic(&mut self, username: &str, password: &str) -> Result<Option<UserId>> {
        let id = sqlx::query_scalar::<_, UserId>(
            r#"
            SELECT id FROM users
            WHERE username = $1 AND is_active = TRUE AND password = crypt($2, password)
            "#,
        )
        .bind(username)
        .bind(password)
        .fetch_optional(&mut *self.db)
        .await?;
        Ok(id)
    }

    /// Verify an API token. Returns the owning user id when the token exists
    /// and is active.
    pub async fn verify_token(&mut self, token: &str) -> Result<Option<UserId>> {
        let id = sqlx::query_scalar::<_, UserId>(
            "SELECT user_id FROM user_apitoken WHERE token = $1 AND is_active = TRUE",
        )
        .bind(token)
        .fetch_optional(&mut *self.db)
        .await?;
        Ok(id)
    }

    pub async fn get_active_token(&mut self, user_id: UserId) -> Result<Option<String>> {
        let token = sqlx::query_scalar::<_, String>(
            "SELECT token FROM user_apitoken WHERE user_id = $1 AND is_active = TRUE ORDER BY created DESC LIMIT 1",
        )
        .bind(user_id)
        .fetch_optional(&mut *self.db)
        .await?;
        Ok(token)
    }

    /// Deactivate the user's existing tokens and issue a fresh one.
    pub async fn generate_token(&mut self, user_id: UserId) -> Result<String> {
        sqlx::query("UPDATE user_apitoken SET is_active = FALSE WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *self.db)
            .await?;

        let token = new_token();
        sqlx::query("INSERT INTO user_apitoken (user_id, token) VALUES ($1, $2)")
            .bind(user_id)
            .bind(&token)
            .execute(&mut *self.db)
            .await?;
        Ok(token)
    }

    pub async fn delete_inactive_tokens(&mut self, user_id: UserId) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM user_apitoken WHERE is_active = FALSE AND user_id = $1")
                .bind(user_id)
                .execute(&mut *self.db)
                .await?;
        Ok(result.rows_affected())
    }
}

fn new_token() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; TOKEN_BYTES] = rng.r#gen();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_hex_and_unique() {
        let a = new_token();
        let b = new_token();
        assert_eq!(a.len(), TOKEN_BYTES * 2);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
