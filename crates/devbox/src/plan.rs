//! Plan registry: named bundles of RAM/CPU/GPU limits.
//!
//! Plans are snapshotted onto the container record at creation time, so
//! editing a plan never changes limits of containers that already exist.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A resource plan.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: String,
    /// RAM limit in human units, e.g. "2g" or "512m".
    pub ram_limit: String,
    /// CPU thread count.
    pub cpu_threads: i64,
    /// Whether containers on this plan may get GPU passthrough.
    pub gpu: bool,
}

/// Parse a human RAM unit ("512m", "2g", "1024k", plain bytes) into bytes.
pub fn parse_ram(value: &str) -> Result<u64> {
    let value = value.trim().to_lowercase();
    let (digits, multiplier) = match value.chars().last() {
        Some('k') => (&value[..value.len() - 1], 1024u64),
        Some('m') => (&value[..value.len() - 1], 1024 * 1024),
        Some('g') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        Some(c) if c.is_ascii_digit() => (value.as_str(), 1),
        _ => anyhow::bail!("invalid RAM value: {value}"),
    };
    let base: u64 = digits
        .parse()
        .with_context(|| format!("invalid RAM value: {value}"))?;
    base.checked_mul(multiplier)
        .with_context(|| format!("RAM value overflows: {value}"))
}

/// Repository for plan persistence.
#[derive(Debug, Clone)]
pub struct PlanRepository {
    pool: SqlitePool,
}

impl PlanRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, id: &str) -> Result<Option<Plan>> {
        let plan = sqlx::query_as::<_, Plan>(
            "SELECT id, ram_limit, cpu_threads, gpu FROM plans WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching plan")?;
        Ok(plan)
    }

    pub async fn list(&self) -> Result<Vec<Plan>> {
        let plans = sqlx::query_as::<_, Plan>(
            "SELECT id, ram_limit, cpu_threads, gpu FROM plans ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("listing plans")?;
        Ok(plans)
    }

    /// Insert or replace a plan. Running containers are unaffected.
    pub async fn upsert(&self, plan: &Plan) -> Result<()> {
        parse_ram(&plan.ram_limit)?;
        sqlx::query(
            r#"
            INSERT INTO plans (id, ram_limit, cpu_threads, gpu)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                ram_limit = excluded.ram_limit,
                cpu_threads = excluded.cpu_threads,
                gpu = excluded.gpu
            "#,
        )
        .bind(&plan.id)
        .bind(&plan.ram_limit)
        .bind(plan.cpu_threads)
        .bind(plan.gpu)
        .execute(&self.pool)
        .await
        .context("upserting plan")?;
        Ok(())
    }
}
