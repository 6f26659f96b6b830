//! Allow-list: which chat users may provision a container, and on which plan.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// One allow-list entry.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AllowedUser {
    /// Opaque numeric ID from the chat platform.
    pub user_id: i64,
    pub username: Option<String>,
    pub plan_id: String,
    pub added_by: Option<i64>,
    pub added_at: String,
}

/// Repository for allow-list persistence.
#[derive(Debug, Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Add or update an allow-list entry.
    pub async fn allow(
        &self,
        user_id: i64,
        plan_id: &str,
        username: Option<&str>,
        added_by: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO allowed_users (user_id, username, plan_id, added_by, added_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(user_id) DO UPDATE SET
                username = excluded.username,
                plan_id = excluded.plan_id,
                added_by = excluded.added_by
            "#,
        )
        .bind(user_id)
        .bind(username)
        .bind(plan_id)
        .bind(added_by)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .context("adding allowed user")?;
        Ok(())
    }

    /// Remove an entry. Does not touch any container the user still owns.
    pub async fn remove(&self, user_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM allowed_users WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("removing allowed user")?;
        Ok(())
    }

    pub async fn get(&self, user_id: i64) -> Result<Option<AllowedUser>> {
        let user = sqlx::query_as::<_, AllowedUser>(
            "SELECT user_id, username, plan_id, added_by, added_at FROM allowed_users WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching allowed user")?;
        Ok(user)
    }

    pub async fn list(&self) -> Result<Vec<AllowedUser>> {
        let users = sqlx::query_as::<_, AllowedUser>(
            "SELECT user_id, username, plan_id, added_by, added_at FROM allowed_users ORDER BY added_at DESC",
        )
        .fetch_all(&self.pool)
        .await
        .context("listing allowed users")?;
        Ok(users)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn allow_remove_roundtrip() {
        let db = Database::in_memory().await.unwrap();
        let repo = UserRepository::new(db.pool().clone());

        assert!(repo.get(42).await.unwrap().is_none());

        repo.allow(42, "basic", Some("alice"), Some(1)).await.unwrap();
        let user = repo.get(42).await.unwrap().unwrap();
        assert_eq!(user.plan_id, "basic");
        assert_eq!(user.username.as_deref(), Some("alice"));

        // Re-allowing updates the plan in place.
        repo.allow(42, "gpu", Some("alice"), Some(1)).await.unwrap();
        let user = repo.get(42).await.unwrap().unwrap();
        assert_eq!(user.plan_id, "gpu");
        assert_eq!(repo.list().await.unwrap().len(), 1);

        repo.remove(42).await.unwrap();
        assert!(repo.get(42).await.unwrap().is_none());
        // Removing an absent entry is a no-op.
        repo.remove(42).await.unwrap();
    }
}
