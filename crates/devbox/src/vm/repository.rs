//! Container record persistence.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use super::models::{ContainerRecord, VmState};

/// All container columns for SELECT queries.
const CONTAINER_COLUMNS: &str = r#"
    user_id, engine_id, name, state, plan_id, ram_limit, cpu_threads, gpu,
    ssh_port, ssh_user, ssh_password, created_at
"#;

/// Repository for container records.
#[derive(Debug, Clone)]
pub struct VmRepository {
    pool: SqlitePool,
}

impl VmRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a new record. Fails if the user already has one; the
    /// PRIMARY KEY on `user_id` backs the one-container-per-user invariant
    /// even if callers race past the in-memory lock.
    pub async fn insert(&self, record: &ContainerRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO containers (
                user_id, engine_id, name, state, plan_id, ram_limit, cpu_threads, gpu,
                ssh_port, ssh_user, ssh_password, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.user_id)
        .bind(&record.engine_id)
        .bind(&record.name)
        .bind(record.state.to_string())
        .bind(&record.plan_id)
        .bind(&record.ram_limit)
        .bind(record.cpu_threads)
        .bind(record.gpu)
        .bind(record.ssh_port)
        .bind(&record.ssh_user)
        .bind(&record.ssh_password)
        .bind(&record.created_at)
        .execute(&self.pool)
        .await
        .context("inserting container record")?;
        Ok(())
    }

    pub async fn get(&self, user_id: i64) -> Result<Option<ContainerRecord>> {
        let query = format!("SELECT {CONTAINER_COLUMNS} FROM containers WHERE user_id = ?");
        let record = sqlx::query_as::<_, ContainerRecord>(&query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .context("fetching container record")?;
        Ok(record)
    }

    pub async fn list(&self) -> Result<Vec<ContainerRecord>> {
        let query = format!("SELECT {CONTAINER_COLUMNS} FROM containers ORDER BY created_at");
        let records = sqlx::query_as::<_, ContainerRecord>(&query)
            .fetch_all(&self.pool)
            .await
            .context("listing container records")?;
        Ok(records)
    }

    pub async fn update_state(&self, user_id: i64, state: VmState) -> Result<()> {
        sqlx::query("UPDATE containers SET state = ? WHERE user_id = ?")
            .bind(state.to_string())
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("updating container state")?;
        Ok(())
    }

    /// Record the outcome of a successful engine create.
    pub async fn mark_started(
        &self,
        user_id: i64,
        engine_id: &str,
        ssh_port: Option<i64>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE containers SET engine_id = ?, ssh_port = ?, state = ? WHERE user_id = ?",
        )
        .bind(engine_id)
        .bind(ssh_port)
        .bind(VmState::Running.to_string())
        .bind(user_id)
        .execute(&self.pool)
        .await
        .context("marking container started")?;
        Ok(())
    }

    pub async fn delete(&self, user_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM containers WHERE user_id = ?")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .context("deleting container record")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use chrono::Utc;

    fn record(user_id: i64) -> ContainerRecord {
        ContainerRecord {
            user_id,
            engine_id: None,
            name: format!("devbox-user-{user_id}"),
            state: VmState::Creating,
            plan_id: "basic".to_string(),
            ram_limit: "2g".to_string(),
            cpu_threads: 2,
            gpu: false,
            ssh_port: None,
            ssh_user: "devuser".to_string(),
            ssh_password: "secret".to_string(),
            created_at: Utc::now().to_rfc3339(),
        }
    }

    #[tokio::test]
    async fn insert_is_unique_per_user() {
        let db = Database::in_memory().await.unwrap();
        let repo = VmRepository::new(db.pool().clone());

        repo.insert(&record(7)).await.unwrap();
        // Second insert for the same user violates the primary key.
        assert!(repo.insert(&record(7)).await.is_err());
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lifecycle_updates_roundtrip() {
        let db = Database::in_memory().await.unwrap();
        let repo = VmRepository::new(db.pool().clone());

        repo.insert(&record(7)).await.unwrap();
        repo.mark_started(7, "abc123", Some(49155)).await.unwrap();

        let row = repo.get(7).await.unwrap().unwrap();
        assert_eq!(row.state, VmState::Running);
        assert_eq!(row.engine_id.as_deref(), Some("abc123"));
        assert_eq!(row.ssh_port, Some(49155));

        repo.update_state(7, VmState::Stopped).await.unwrap();
        assert_eq!(repo.get(7).await.unwrap().unwrap().state, VmState::Stopped);

        repo.delete(7).await.unwrap();
        assert!(repo.get(7).await.unwrap().is_none());
        // Deleting an absent row is a no-op.
        repo.delete(7).await.unwrap();
    }
}
