use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::AppState;

/// Liveness probe: confirms the shared schema is reachable and reports how
/// far its migration history has advanced. Per-tenant schema state is the
/// batch runners' concern, not the health check's.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let applied: Result<i64, sqlx::Error> =
        sqlx::query_scalar("SELECT COUNT(*) FROM public._sqlx_migrations")
            .fetch_one(&state.db)
            .await;

    match applied {
        Ok(count) => (
            StatusCode::OK,
            Json(json!({
                "status": "ok",
                "service": "parceldesk-api",
                "db": "connected",
                "shared_migrations_applied": count,
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "error",
                "service": "parceldesk-api",
                "db": e.to_string(),
            })),
        ),
    }
}
