/// PostgreSQL connection pools
///
/// The application pool backs sessions and the knowledge base and owns the
/// migrations. The query pool runs generated SQL and may point at a
/// different, read-only role.

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

use crate::errors::RentqlError;

/// Connect the application pool. If run_migrations is true, pending
/// migrations are applied before returning.
pub async fn connect(database_url: &str, run_migrations: bool) -> Result<PgPool, RentqlError> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .idle_timeout(Duration::from_secs(300))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
        .map_err(|e| RentqlError::Storage(format!("Failed to connect to database: {}", e)))?;

    if run_migrations {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| RentqlError::Storage(format!("Migration failed: {}", e)))?;
    }

    Ok(pool)
}

/// Connect the pool used to execute generated SQL. Kept small: every
/// checkout holds a read-only transaction for at most one statement timeout.
pub async fn connect_query_pool(database_url: &str) -> Result<PgPool, RentqlError> {
    PgPoolOptions::new()
        .max_connections(4)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(300))
        .connect(database_url)
        .await
        .map_err(|e| RentqlError::Storage(format!("Failed to connect query database: {}", e)))
}
