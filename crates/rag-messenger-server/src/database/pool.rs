use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tracing::info;

use crate::config::DatabaseConfig;

/// Shared Postgres pool for the conversation store and vector search.
#[derive(Clone)]
pub struct DbPool {
    pool: PgPool,
}

impl DbPool {
    /// Connects and checks the connection with `SELECT 1`.
    pub async fn new(config: &DatabaseConfig) -> Result<Self> {
        let options = PgConnectOptions::from_str(&config.url).context("invalid database.url")?;
        let target = format!(
            "{}:{}/{}",
            options.get_host(),
            options.get_port(),
            options.get_database().unwrap_or("postgres")
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.pool_max_size.max(1))
            .acquire_timeout(Duration::from_secs(config.pool_timeout_seconds))
            .connect_with(options)
            .await
            .with_context(|| format!("cannot connect to {target}"))?;
        sqlx::query("SELECT 1").execute(&pool).await?;

        info!(%target, max_connections = config.pool_max_size, "Database pool ready");
        Ok(Self { pool })
    }

    pub fn inner(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn malformed_url_is_rejected_before_connecting() {
        let config = DatabaseConfig {
            url: "not a postgres url".into(),
            pool_max_size: 2,
            pool_timeout_seconds: 1,
        };
        let err = DbPool::new(&config).await.err().unwrap();
        assert!(err.to_string().contains("database.url"));
    }
}
