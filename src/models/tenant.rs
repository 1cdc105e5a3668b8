use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "tenant_status", rename_all = "snake_case")]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Pending,
    Active,
    Suspended,
    Deactivated,
}

impl TenantStatus {
    /// Eligible for migration/patch sweeps. Suspended and deactivated tenants
    /// are skipped; their schemas are left as-is.
    pub fn is_eligible(&self) -> bool {
        matches!(self, TenantStatus::Pending | TenantStatus::Active)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Tenant {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub status: TenantStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct SignupRequest {
    pub slug: String,
    pub company_name: String,
    pub email: String,
    pub password: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eligibility() {
        assert!(TenantStatus::Pending.is_eligible());
        assert!(TenantStatus::Active.is_eligible());
        assert!(!TenantStatus::Suspended.is_eligible());
        assert!(!TenantStatus::Deactivated.is_eligible());
    }
}
