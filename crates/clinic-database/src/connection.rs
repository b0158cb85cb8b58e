//! 数据库连接管理

use std::time::Duration;

use clinic_core::{ClinicError, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// 连接池参数
#[derive(Debug, Clone)]
pub struct PoolOptions {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

/// 数据库连接池
#[derive(Clone)]
pub struct DatabasePool {
    pool: PgPool,
}

impl DatabasePool {
    pub async fn connect(options: &PoolOptions) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(options.max_connections)
            .min_connections(options.min_connections)
            .acquire_timeout(Duration::from_secs(options.connect_timeout_secs))
            .connect(&options.url)
            .await
            .map_err(|e| ClinicError::Database(format!("No se pudo conectar a la base de datos: {}", e)))?;

        tracing::info!(max_connections = options.max_connections, "Database pool created");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
