use axum::{
    extract::FromRequestParts,
    extract::Request,
    http::{request::Parts, StatusCode},
    middleware::Next,
    response::Response,
    Json,
};
use serde_json::{json, Value};

use crate::db::context::TenantContext;
use crate::db::schema::is_valid_slug;
use crate::error::TenancyError;
use crate::models::tenant::TenantStatus;
use crate::AppState;

/// Resolves the tenant for one request: reads the slug from the `X-Tenant`
/// header or first subdomain, checks the registry, and yields the immutable
/// TenantContext the rest of the request uses. This is the only way tenant
/// scoping enters a request.
#[derive(Debug, Clone)]
pub struct ResolvedTenant(pub TenantContext);

impl FromRequestParts<AppState> for ResolvedTenant {
    type Rejection = (StatusCode, Json<Value>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let slug = extract_slug(parts)?;

        let tenant = state.directory.resolve(&slug).await.map_err(|e| match e {
            TenancyError::TenantNotFound(_) => {
                (StatusCode::NOT_FOUND, Json(json!({ "error": "Tenant not found" })))
            }
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "Database error" })),
            ),
        })?;

        match tenant.status {
            TenantStatus::Suspended => Err((
                StatusCode::FORBIDDEN,
                Json(json!({ "error": "Account is suspended" })),
            )),
            TenantStatus::Deactivated => Err((
                StatusCode::GONE,
                Json(json!({ "error": "Account is deactivated" })),
            )),
            TenantStatus::Pending | TenantStatus::Active => {
                let ctx = TenantContext::new(tenant.id, &tenant.slug).map_err(|_| {
                    (
                        StatusCode::INTERNAL_SERVER_ERROR,
                        Json(json!({ "error": "Invalid tenant registry entry" })),
                    )
                })?;
                Ok(ResolvedTenant(ctx))
            }
        }
    }
}

fn extract_slug(parts: &Parts) -> Result<String, (StatusCode, Json<Value>)> {
    // 1. X-Tenant header
    if let Some(tenant) = parts
        .headers
        .get("X-Tenant")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_lowercase())
        .filter(|s| !s.is_empty())
    {
        if !is_valid_slug(&tenant) {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "Invalid tenant identifier" })),
            ));
        }
        return Ok(tenant);
    }

    // 2. Subdomain from Host header
    if let Some(host) = parts.headers.get("Host").and_then(|v| v.to_str().ok()) {
        if let Some(subdomain) = subdomain_of(host) {
            if !is_valid_slug(&subdomain) {
                return Err((
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "error": "Invalid tenant identifier" })),
                ));
            }
            return Ok(subdomain);
        }
    }

    Err((
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": "Missing X-Tenant header" })),
    ))
}

/// First subdomain of a host with at least three labels, excluding the
/// `www`/`api` entry points.
fn subdomain_of(host: &str) -> Option<String> {
    let domain = host.split(':').next().unwrap_or(host);
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() >= 3 {
        let subdomain = labels[0].to_lowercase();
        if subdomain != "www" && subdomain != "api" {
            return Some(subdomain);
        }
    }
    None
}

/// Middleware that ensures a tenant identifier is present on tenant-scoped
/// routes before any handler runs.
pub async fn require_tenant(request: Request, next: Next) -> Result<Response, StatusCode> {
    let path = request.uri().path();
    if path.starts_with("/ops") || path.starts_with("/health") || path.starts_with("/signup") {
        return Ok(next.run(request).await);
    }

    let has_tenant = request.headers().contains_key("X-Tenant");
    if !has_tenant {
        let host = request
            .headers()
            .get("Host")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if subdomain_of(host).is_none() {
            return Err(StatusCode::BAD_REQUEST);
        }
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subdomain_extraction() {
        assert_eq!(subdomain_of("acme.parceldesk.io"), Some("acme".to_string()));
        assert_eq!(subdomain_of("ACME.parceldesk.io:8080"), Some("acme".to_string()));
        assert_eq!(subdomain_of("www.parceldesk.io"), None);
        assert_eq!(subdomain_of("api.parceldesk.io"), None);
        assert_eq!(subdomain_of("parceldesk.io"), None);
        assert_eq!(subdomain_of("localhost:8080"), None);
    }
}
