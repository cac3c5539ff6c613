use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

/// Opens the pool and fails fast when Postgres is unreachable.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(3))
        .test_before_acquire(true)
        .connect(database_url)
        .await?;

    tracing::debug!(max_connections, "License database pool opened");
    Ok(pool)
}

/// Applies `migrations/` (licenses, activations, admin users, challenges,
/// audit logs).
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}
