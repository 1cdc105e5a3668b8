use thiserror::Error;
use uuid::Uuid;

use crate::db::provision::ProvisionStep;

/// Errors raised by the tenancy core.
///
/// Unit-of-work errors (`TenantNotFound`, `SchemaNotFound`, `ContextMisuse`,
/// `InvalidSlug`) surface directly to the caller of that unit of work — there
/// is no fallback to another schema. Batch errors (`MigrationApply`,
/// `PatchApply`) are recorded per tenant and never abort sibling tenants.
#[derive(Debug, Error)]
pub enum TenancyError {
    #[error("tenant not found: {0}")]
    TenantNotFound(String),

    /// The tenant row exists but its schema does not — the tenant needs
    /// provisioning, this is not a transient fault.
    #[error("schema \"{0}\" does not exist")]
    SchemaNotFound(String),

    /// A programming defect (context set twice, or tenant-scoped access with
    /// no context). Fails the unit of work loudly; never retried or swallowed.
    #[error("tenant context misuse: {0}")]
    ContextMisuse(&'static str),

    #[error("invalid tenant slug: {0:?}")]
    InvalidSlug(String),

    #[error("migration {version} ({name}) failed for tenant {tenant}: {source}")]
    MigrationApply {
        tenant: Uuid,
        version: i64,
        name: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("patch {patch} failed for tenant {tenant}: {source}")]
    PatchApply {
        tenant: Uuid,
        patch: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("provisioning failed at step {step}: {source}")]
    Provision {
        step: ProvisionStep,
        #[source]
        source: Box<TenancyError>,
    },

    #[error(transparent)]
    Db(#[from] sqlx::Error),
}

impl TenancyError {
    /// Which provisioning step failed, if this is a provisioning error.
    pub fn provision_step(&self) -> Option<ProvisionStep> {
        match self {
            TenancyError::Provision { step, .. } => Some(*step),
            _ => None,
        }
    }
}
