// Library exports for binary tools and tests
pub mod config;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;

use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Config;
use crate::db::directory::TenantDirectory;
use crate::db::router::SchemaRouter;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub router: SchemaRouter,
    pub directory: TenantDirectory,
    pub config: Arc<Config>,
}
