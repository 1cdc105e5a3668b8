use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::{
    db::context::ContextCell,
    error::TenancyError,
    middleware::tenant::ResolvedTenant,
    AppState,
};

/// Tenant-scoped liveness: proves the whole routing path for this request's
/// tenant — context resolved, session opened, schema directive confirmed.
pub async fn ping(
    State(state): State<AppState>,
    ResolvedTenant(ctx): ResolvedTenant,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    let cell = ContextCell::new();
    cell.set(ctx)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))))?;

    let session = state.router.open_session(&cell).await.map_err(|e| match e {
        TenancyError::SchemaNotFound(_) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "Tenant schema not provisioned yet" })),
        ),
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": other.to_string() })),
        ),
    })?;

    // The session already confirmed the directive on checkout; its pinned
    // schema is authoritative for this unit of work.
    Ok(Json(json!({
        "tenant": cell.current().map(|c| c.slug().to_string()).unwrap_or_default(),
        "schema": session.schema().as_str(),
    })))
}
