pub mod context;
pub mod directory;
pub mod migrations;
pub mod patches;
pub mod provision;
pub mod router;
pub mod schema;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

pub async fn create_pool(database_url: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run the shared-schema migrations embedded in ./migrations/
pub async fn run_shared_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
