use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use super::{
    ConversationDirectory, DirectoryError, InactiveUser, InactiveUserStore, UserDirectory, UserProfile,
};
use crate::UserId;

/// Directory backed by the shared Postgres database.
#[derive(Debug, Clone)]
pub struct PgDirectory {
    pool: PgPool,
}

impl PgDirectory {
    pub async fn connect(db_url: &str) -> Result<Self, DirectoryError> {
        let pool = PgPoolOptions::new().max_connections(8).connect(db_url).await?;
        let dir = Self { pool };
        dir.init_db().await?;
        Ok(dir)
    }

    async fn init_db(&self) -> Result<(), DirectoryError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
              id TEXT PRIMARY KEY,
              first_name TEXT NOT NULL,
              last_name TEXT NOT NULL,
              avatar TEXT,
              email TEXT NOT NULL,
              is_admin BOOLEAN NOT NULL DEFAULT FALSE,
              last_active TIMESTAMPTZ NOT NULL DEFAULT NOW(),
              last_notification_sent TIMESTAMPTZ
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conversation_participants (
              conversation_id TEXT NOT NULL,
              user_id TEXT NOT NULL,
              PRIMARY KEY (conversation_id, user_id)
            );
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl UserDirectory for PgDirectory {
    async fn find_user(&self, user_id: &str) -> Result<Option<UserProfile>, DirectoryError> {
        let row: Option<(String, String, String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT id, first_name, last_name, avatar
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, first_name, last_name, avatar)| UserProfile {
            id,
            first_name,
            last_name,
            avatar,
        }))
    }
}

#[async_trait]
impl ConversationDirectory for PgDirectory {
    async fn is_participant(&self, conversation_id: &str, user_id: &str) -> Result<bool, DirectoryError> {
        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
              SELECT 1 FROM conversation_participants
              WHERE conversation_id = $1 AND user_id = $2
            )
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }
}

#[async_trait]
impl InactiveUserStore for PgDirectory {
    async fn find_inactive(
        &self,
        inactive_before: DateTime<Utc>,
        notified_before: DateTime<Utc>,
    ) -> Result<Vec<InactiveUser>, DirectoryError> {
        let rows: Vec<(String, String, String, String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT id, email, first_name, last_name, last_active
            FROM users
            WHERE last_active < $1
              AND (last_notification_sent IS NULL OR last_notification_sent < $2)
              AND NOT is_admin
            ORDER BY last_active, id
            "#,
        )
        .bind(inactive_before)
        .bind(notified_before)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, email, first_name, last_name, last_active)| InactiveUser {
                id,
                email,
                first_name,
                last_name,
                last_active,
            })
            .collect())
    }

    async fn mark_notified(&self, user_ids: &[UserId], at: DateTime<Utc>) -> Result<(), DirectoryError> {
        sqlx::query("UPDATE users SET last_notification_sent = $1 WHERE id = ANY($2)")
            .bind(at)
            .bind(user_ids)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
