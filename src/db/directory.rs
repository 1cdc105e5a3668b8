use sqlx::PgPool;
use uuid::Uuid;

use crate::db::schema::SchemaName;
use crate::error::TenancyError;
use crate::models::tenant::{Tenant, TenantStatus};

/// A tenant as seen by the batch runners: just enough to build a context.
#[derive(Debug, Clone)]
pub struct TenantRef {
    pub id: Uuid,
    pub slug: String,
    pub schema: SchemaName,
}

/// Read-only view of the tenant registry in the shared schema.
#[derive(Clone)]
pub struct TenantDirectory {
    pool: PgPool,
}

impl TenantDirectory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Tenants eligible for migration and patch sweeps. Eligibility is
    /// `TenantStatus::is_eligible` — the single definition, not a SQL literal.
    pub async fn list_eligible_tenants(&self) -> Result<Vec<TenantRef>, TenancyError> {
        let rows: Vec<(Uuid, String, TenantStatus)> =
            sqlx::query_as("SELECT id, slug, status FROM public.tenants ORDER BY slug")
                .fetch_all(&self.pool)
                .await?;

        rows.into_iter()
            .filter(|(_, _, status)| status.is_eligible())
            .map(|(id, slug, _)| {
                let schema = SchemaName::for_slug(&slug)?;
                Ok(TenantRef { id, slug, schema })
            })
            .collect()
    }

    /// Resolve a tenant by slug or id. A miss is `TenantNotFound` — fatal for
    /// the unit of work, not retryable without correcting the identifier.
    pub async fn resolve(&self, slug_or_id: &str) -> Result<Tenant, TenancyError> {
        let tenant: Option<Tenant> = if let Ok(id) = Uuid::parse_str(slug_or_id) {
            sqlx::query_as("SELECT * FROM public.tenants WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
        } else {
            sqlx::query_as("SELECT * FROM public.tenants WHERE slug = $1")
                .bind(slug_or_id.to_lowercase())
                .fetch_optional(&self.pool)
                .await?
        };

        tenant.ok_or_else(|| TenancyError::TenantNotFound(slug_or_id.to_string()))
    }
}
