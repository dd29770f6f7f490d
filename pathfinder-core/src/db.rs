use crate::config::DatabaseConfig;
use crate::error::PathfinderError;
use sqlx::{postgres::PgPoolOptions, PgPool};

/// Schema migrations embedded from `pathfinder-core/migrations`.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub async fn create_pool(config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(&config.url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    MIGRATOR.run(pool).await?;
    tracing::info!(
        migrations = MIGRATOR.iter().count(),
        "Database schema is up to date"
    );
    Ok(())
}

/// Connect and, when `migrate` is set, bring the schema up to date.
pub async fn connect(config: &DatabaseConfig, migrate: bool) -> Result<PgPool, PathfinderError> {
    let pool = create_pool(config).await?;
    if migrate {
        run_migrations(&pool).await?;
    }
    Ok(pool)
}

pub async fn health_check(pool: &PgPool) -> Result<String, sqlx::Error> {
    let row: (String,) = sqlx::query_as("SELECT version()").fetch_one(pool).await?;
    Ok(row.0)
}
