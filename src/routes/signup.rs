use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::{
    db::provision::TenantProvisioner,
    db::schema::is_valid_slug,
    models::tenant::SignupRequest,
    AppState,
};

const RESERVED_SLUGS: &[&str] = &[
    "www", "api", "app", "admin", "ops", "login", "signup", "register",
    "support", "billing", "status", "about", "contact", "docs",
];

pub async fn signup(
    State(state): State<AppState>,
    Json(body): Json<SignupRequest>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    let slug = body.slug.to_lowercase();

    if !is_valid_slug(&slug) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Slug must be 2-63 characters (lowercase letters, digits, hyphens), not starting or ending with a hyphen." })),
        ));
    }

    if RESERVED_SLUGS.contains(&slug.as_str()) {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "This slug is reserved." })),
        ));
    }

    if !body.email.contains('@') {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Invalid email address." })),
        ));
    }

    if body.password.len() < 8 {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Password must be at least 8 characters." })),
        ));
    }

    if body.company_name.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Company name is required." })),
        ));
    }

    // 1. Register the tenant (pending until provisioning completes)
    let tenant_result = sqlx::query_as::<_, (uuid::Uuid, String)>(
        "INSERT INTO public.tenants (slug, name, status)
         VALUES ($1, $2, 'pending')
         RETURNING id, slug",
    )
    .bind(&slug)
    .bind(body.company_name.trim())
    .fetch_one(&state.db)
    .await;

    let (tenant_id, created_slug) = match tenant_result {
        Ok(row) => row,
        Err(e) => {
            let msg = e.to_string();
            if msg.contains("unique") || msg.contains("duplicate") || msg.contains("already exists") {
                return Err((
                    StatusCode::CONFLICT,
                    Json(json!({ "error": "This slug is already taken." })),
                ));
            }
            return Err((StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": msg }))));
        }
    };

    // 2. Provision the tenant schema (idempotent; safe to re-run if this fails)
    let password_hash = bcrypt::hash(&body.password, 12)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))))?;

    let provisioner = TenantProvisioner::new(state.router.clone());
    provisioner
        .provision(
            tenant_id,
            &created_slug,
            &body.email,
            &password_hash,
            body.company_name.trim(),
        )
        .await
        .map_err(|e| {
            let step = e.provision_step().map(|s| s.to_string());
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": format!("Provisioning failed: {e}"),
                    "failed_step": step,
                })),
            )
        })?;

    // 3. Activate
    sqlx::query("UPDATE public.tenants SET status = 'active', updated_at = NOW() WHERE id = $1")
        .bind(tenant_id)
        .execute(&state.db)
        .await
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": e.to_string() }))))?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "id": tenant_id,
            "slug": created_slug,
            "name": body.company_name.trim(),
        })),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_slugs_are_valid_slugs() {
        // Reserved entries must be shapes users could otherwise claim
        for slug in RESERVED_SLUGS {
            assert!(is_valid_slug(slug), "{slug} would be rejected anyway");
        }
    }
}
