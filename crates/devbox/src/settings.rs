//! Global configuration singleton: maintenance gate and default resources.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

use crate::plan::parse_ram;

/// The single global settings row.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GlobalSettings {
    /// When set, no create/start may succeed and running containers are
    /// stopped as part of enabling it.
    pub maintenance: bool,
    pub default_ram: String,
    pub default_cpu: i64,
    pub default_gpu: bool,
}

/// Repository for the settings singleton.
#[derive(Debug, Clone)]
pub struct SettingsRepository {
    pool: SqlitePool,
}

impl SettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self) -> Result<GlobalSettings> {
        let settings = sqlx::query_as::<_, GlobalSettings>(
            "SELECT maintenance, default_ram, default_cpu, default_gpu FROM settings WHERE id = 1",
        )
        .fetch_one(&self.pool)
        .await
        .context("fetching global settings")?;
        Ok(settings)
    }

    pub async fn set_maintenance(&self, on: bool) -> Result<()> {
        sqlx::query("UPDATE settings SET maintenance = ? WHERE id = 1")
            .bind(on)
            .execute(&self.pool)
            .await
            .context("updating maintenance flag")?;
        Ok(())
    }

    pub async fn set_default_ram(&self, value: &str) -> Result<()> {
        parse_ram(value)?;
        sqlx::query("UPDATE settings SET default_ram = ? WHERE id = 1")
            .bind(value)
            .execute(&self.pool)
            .await
            .context("updating default RAM")?;
        Ok(())
    }

    pub async fn set_default_cpu(&self, threads: i64) -> Result<()> {
        anyhow::ensure!(threads >= 1, "cpu thread count must be at least 1");
        sqlx::query("UPDATE settings SET default_cpu = ? WHERE id = 1")
            .bind(threads)
            .execute(&self.pool)
            .await
            .context("updating default CPU")?;
        Ok(())
    }

    pub async fn set_default_gpu(&self, on: bool) -> Result<()> {
        sqlx::query("UPDATE settings SET default_gpu = ? WHERE id = 1")
            .bind(on)
            .execute(&self.pool)
            .await
            .context("updating default GPU flag")?;
        Ok(())
    }
}
