use crate::error::TenancyError;

/// The fixed schema holding cross-tenant data (tenant registry, platform
/// entities). Never derived from request input.
pub const SHARED_SCHEMA: &str = "public";

/// Validates that a slug only contains lowercase ASCII letters, digits and hyphens,
/// does not start or end with a hyphen, and is between 2 and 63 characters.
/// This prevents SQL injection via the tenant name used in format!() schema DDL.
pub fn is_valid_slug(s: &str) -> bool {
    let len = s.len();
    len >= 2
        && len <= 63
        && s.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

/// A validated PostgreSQL schema identifier.
///
/// All schema-name quoting lives here: migration and patch SQL never
/// interpolates a raw slug. Constructed only from a validated slug
/// (`tenant_<slug>` with hyphens folded to underscores) or as the shared
/// schema, so the rendered identifier is always `[a-z0-9_]+`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemaName(String);

impl SchemaName {
    /// Schema name for a tenant slug. Immutable once assigned: the same slug
    /// always maps to the same schema.
    pub fn for_slug(slug: &str) -> Result<Self, TenancyError> {
        let slug = slug.to_lowercase();
        if !is_valid_slug(&slug) {
            return Err(TenancyError::InvalidSlug(slug));
        }
        Ok(Self(format!("tenant_{}", slug.replace('-', "_"))))
    }

    pub fn shared() -> Self {
        Self(SHARED_SCHEMA.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Quoted identifier, e.g. `"tenant_acme"`.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }

    /// Schema-qualified object name, e.g. `"tenant_acme"."orders"`.
    pub fn qualify(&self, object: &str) -> String {
        format!("\"{}\".\"{}\"", self.0, object)
    }
}

impl std::fmt::Display for SchemaName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_slugs() {
        assert!(is_valid_slug("acme"));
        assert!(is_valid_slug("acme-express"));
        assert!(is_valid_slug("a1"));
        assert!(!is_valid_slug("a"));
        assert!(!is_valid_slug("-acme"));
        assert!(!is_valid_slug("acme-"));
        assert!(!is_valid_slug("Acme"));
        assert!(!is_valid_slug("acme_express"));
        assert!(!is_valid_slug("acme;drop"));
        assert!(!is_valid_slug(""));
    }

    #[test]
    fn test_schema_name_derivation() {
        let schema = SchemaName::for_slug("acme-express").unwrap();
        assert_eq!(schema.as_str(), "tenant_acme_express");
        // Same slug always maps to the same schema
        assert_eq!(schema, SchemaName::for_slug("ACME-Express").unwrap());
    }

    #[test]
    fn test_schema_name_rejects_injection() {
        assert!(SchemaName::for_slug("x\"; DROP SCHEMA public; --").is_err());
        assert!(SchemaName::for_slug("").is_err());
    }

    #[test]
    fn test_quoting() {
        let schema = SchemaName::for_slug("globex").unwrap();
        assert_eq!(schema.quoted(), "\"tenant_globex\"");
        assert_eq!(schema.qualify("orders"), "\"tenant_globex\".\"orders\"");
        assert_eq!(SchemaName::shared().as_str(), "public");
    }
}
