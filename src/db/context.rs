use std::sync::OnceLock;

use uuid::Uuid;

use crate::db::schema::SchemaName;
use crate::error::TenancyError;

/// The tenant a unit of work is scoped to.
///
/// Immutable once built, owned by exactly one unit of work (one request, one
/// job, one migration pass for one tenant) and discarded at its end. Never
/// cached or shared across concurrent units of work — each one re-resolves
/// its context from the tenant identifier it carries.
#[derive(Debug, Clone)]
pub struct TenantContext {
    tenant_id: Uuid,
    slug: String,
    schema: SchemaName,
}

impl TenantContext {
    pub fn new(tenant_id: Uuid, slug: &str) -> Result<Self, TenancyError> {
        let schema = SchemaName::for_slug(slug)?;
        Ok(Self {
            tenant_id,
            slug: slug.to_lowercase(),
            schema,
        })
    }

    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn schema(&self) -> &SchemaName {
        &self.schema
    }
}

/// Set-once holder for the tenant context of one unit of work.
///
/// Setting it twice, or reading it before it was set, is a programming defect
/// (it would mean context bleed between requests) and fails with
/// `ContextMisuse` rather than silently overwriting or defaulting.
#[derive(Debug, Default)]
pub struct ContextCell {
    slot: OnceLock<TenantContext>,
}

impl ContextCell {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called exactly once per unit of work, before the first tenant-scoped
    /// data access.
    pub fn set(&self, ctx: TenantContext) -> Result<(), TenancyError> {
        self.slot.set(ctx).map_err(|_| {
            TenancyError::ContextMisuse("set called twice within one unit of work")
        })
    }

    pub fn current(&self) -> Result<&TenantContext, TenancyError> {
        self.slot
            .get()
            .ok_or(TenancyError::ContextMisuse("tenant-scoped access with no tenant context set"))
    }

    pub fn is_set(&self) -> bool {
        self.slot.get().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_derives_schema() {
        let id = Uuid::new_v4();
        let ctx = TenantContext::new(id, "acme").unwrap();
        assert_eq!(ctx.tenant_id(), id);
        assert_eq!(ctx.slug(), "acme");
        assert_eq!(ctx.schema().as_str(), "tenant_acme");
    }

    #[test]
    fn test_cell_read_before_set_is_misuse() {
        let cell = ContextCell::new();
        assert!(!cell.is_set());
        assert!(matches!(cell.current(), Err(TenancyError::ContextMisuse(_))));
    }

    #[test]
    fn test_cell_set_once() {
        let cell = ContextCell::new();
        let ctx = TenantContext::new(Uuid::new_v4(), "acme").unwrap();
        cell.set(ctx).unwrap();
        assert_eq!(cell.current().unwrap().slug(), "acme");

        // Second set must fail loudly, and must not overwrite
        let other = TenantContext::new(Uuid::new_v4(), "globex").unwrap();
        assert!(matches!(cell.set(other), Err(TenancyError::ContextMisuse(_))));
        assert_eq!(cell.current().unwrap().slug(), "acme");
    }
}
