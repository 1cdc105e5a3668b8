use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::{
    db::migrations::MigrationOrchestrator,
    db::patches::SchemaPatchApplier,
    middleware::operator::OperatorAuth,
    AppState,
};

/// Run the tenant migration sweep on demand. Always returns the full
/// BatchReport; the operator decides whether partial failure is acceptable.
pub async fn run_migrations(
    State(state): State<AppState>,
    _auth: OperatorAuth,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let orchestrator = MigrationOrchestrator::new(
        state.router.clone(),
        state.directory.clone(),
        state.config.migration_concurrency,
    );

    let report = orchestrator
        .run_all(&CancellationToken::new())
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        })?;

    Ok(Json(json!({
        "all_succeeded": report.all_succeeded(),
        "report": report,
    })))
}

/// Run the schema patch sweep on demand.
pub async fn run_patches(
    State(state): State<AppState>,
    _auth: OperatorAuth,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let applier = SchemaPatchApplier::new(
        state.router.clone(),
        state.directory.clone(),
        state.config.migration_concurrency,
    );

    let report = applier
        .run_all(&CancellationToken::new())
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
        })?;

    Ok(Json(json!({
        "all_succeeded": report.all_succeeded(),
        "report": report,
    })))
}
