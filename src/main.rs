use std::sync::Arc;

use axum::{
    http::{header, HeaderValue, Method},
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use parceldesk_api::config::Config;
use parceldesk_api::db;
use parceldesk_api::db::directory::TenantDirectory;
use parceldesk_api::db::migrations::MigrationOrchestrator;
use parceldesk_api::db::patches::SchemaPatchApplier;
use parceldesk_api::db::router::SchemaRouter;
use parceldesk_api::middleware::tenant::require_tenant;
use parceldesk_api::routes;
use parceldesk_api::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let config = Arc::new(config);

    let pool = db::create_pool(&config.database_url).await?;
    db::run_shared_migrations(&pool).await?;
    info!("Database connected and shared-schema migrations applied");

    let router = SchemaRouter::new(pool.clone());
    let directory = TenantDirectory::new(pool.clone());

    // Startup sweep: bring every tenant schema up to date, then re-run the
    // idempotent patch set. Partial failure does not block startup; affected
    // tenants fail their own requests until an operator remediates.
    let cancel = CancellationToken::new();

    let orchestrator = MigrationOrchestrator::new(
        router.clone(),
        directory.clone(),
        config.migration_concurrency,
    );
    let report = orchestrator.run_all(&cancel).await?;
    if report.all_succeeded() {
        info!("Tenant migrations applied for {} tenants", report.succeeded.len());
    } else {
        warn!(
            "Tenant migrations: {} succeeded, {} failed: {:?}",
            report.succeeded.len(),
            report.failed.len(),
            report.failed
        );
    }

    let applier = SchemaPatchApplier::new(
        router.clone(),
        directory.clone(),
        config.migration_concurrency,
    );
    let report = applier.run_all(&cancel).await?;
    if !report.all_succeeded() {
        warn!(
            "Schema patches: {} succeeded, {} failed: {:?}",
            report.succeeded.len(),
            report.failed.len(),
            report.failed
        );
    }

    let state = AppState {
        db: pool,
        router,
        directory,
        config: config.clone(),
    };

    // CORS: allow the app base domain and its subdomains (tenant subdomains).
    // In development (localhost), all origins are allowed.
    let base_url = config.app_base_url.clone();
    let cors_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let o = match origin.to_str() {
            Ok(s) => s,
            Err(_) => return false,
        };
        if o.starts_with("http://localhost") || o.starts_with("http://127.0.0.1") {
            return true;
        }
        if o == base_url {
            return true;
        }
        if let Some(idx) = base_url.find("://") {
            let after_scheme = &base_url[idx + 3..];
            let domain = after_scheme.split('/').next().unwrap_or(after_scheme);
            let domain_clean = domain.split(':').next().unwrap_or(domain);
            if o.contains(&format!(".{domain_clean}")) {
                return true;
            }
        }
        false
    });

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(AllowHeaders::list([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::HeaderName::from_static("x-tenant"),
            header::HeaderName::from_static("x-operator-key"),
        ]))
        .allow_origin(cors_origin);

    let app = Router::new()
        .route("/health", get(routes::health::health_check))
        .route("/signup", post(routes::signup::signup))
        .route("/tenant/ping", get(routes::tenant::ping))
        // Operator
        .route("/ops/migrations/run", post(routes::ops::run_migrations))
        .route("/ops/patches/run", post(routes::ops::run_patches))
        .layer(axum_middleware::from_fn(require_tenant))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("parceldesk API listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
