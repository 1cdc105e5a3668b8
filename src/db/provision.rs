use sqlx::PgConnection;
use uuid::Uuid;

use crate::db::context::TenantContext;
use crate::db::directory::TenantRef;
use crate::db::migrations;
use crate::db::router::{assert_schema, SchemaRouter};
use crate::db::schema::SchemaName;
use crate::error::TenancyError;

/// Default roles seeded into every new tenant schema, with their permission
/// sets. Fixed platform data, not user data; `owner` is the
/// highest-privilege role and is assigned to the tenant's first user.
pub const DEFAULT_ROLES: &[(&str, &[&str])] = &[
    (
        "owner",
        &[
            "orders:read",
            "orders:write",
            "shipments:read",
            "shipments:write",
            "users:manage",
            "settings:manage",
            "billing:manage",
        ],
    ),
    (
        "manager",
        &[
            "orders:read",
            "orders:write",
            "shipments:read",
            "shipments:write",
            "users:manage",
        ],
    ),
    (
        "operator",
        &["orders:read", "orders:write", "shipments:read"],
    ),
    ("viewer", &["orders:read", "shipments:read"]),
];

pub const OWNER_ROLE: &str = "owner";

/// The provisioning step that was in flight when a failure occurred.
/// Steps run in this order; each is individually idempotent, so a crashed
/// provisioning run is safely re-invoked from the top.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionStep {
    CreateSchema,
    RunMigrations,
    SeedRoles,
    CreateOwner,
    CreateSettings,
}

impl std::fmt::Display for ProvisionStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProvisionStep::CreateSchema => "create_schema",
            ProvisionStep::RunMigrations => "run_migrations",
            ProvisionStep::SeedRoles => "seed_roles",
            ProvisionStep::CreateOwner => "create_owner",
            ProvisionStep::CreateSettings => "create_settings",
        };
        f.write_str(s)
    }
}

/// First-time setup of a brand-new tenant schema: namespace, full migration
/// set, default roles, owner user, default settings.
#[derive(Clone)]
pub struct TenantProvisioner {
    router: SchemaRouter,
}

impl TenantProvisioner {
    pub fn new(router: SchemaRouter) -> Self {
        Self { router }
    }

    pub async fn provision(
        &self,
        tenant_id: Uuid,
        slug: &str,
        owner_email: &str,
        owner_password_hash: &str,
        company_name: &str,
    ) -> Result<(), TenancyError> {
        let ctx = TenantContext::new(tenant_id, slug)?;
        let schema = ctx.schema();
        let mut conn = self.router.pool().acquire().await?;

        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", schema.quoted()))
            .execute(&mut *conn)
            .await
            .map_err(|e| step_failed(ProvisionStep::CreateSchema, e.into()))?;
        assert_schema(&mut conn, schema, true)
            .await
            .map_err(|e| step_failed(ProvisionStep::CreateSchema, e))?;

        let tenant = TenantRef {
            id: tenant_id,
            slug: ctx.slug().to_string(),
            schema: schema.clone(),
        };
        migrations::apply_pending(&mut conn, &tenant, schema)
            .await
            .map_err(|e| step_failed(ProvisionStep::RunMigrations, e))?;

        seed_roles(&mut conn, schema)
            .await
            .map_err(|e| step_failed(ProvisionStep::SeedRoles, e))?;

        create_owner(&mut conn, schema, owner_email, owner_password_hash)
            .await
            .map_err(|e| step_failed(ProvisionStep::CreateOwner, e))?;

        create_settings(&mut conn, schema, company_name)
            .await
            .map_err(|e| step_failed(ProvisionStep::CreateSettings, e))?;

        tracing::info!("Provisioned tenant schema: {}", schema);
        Ok(())
    }
}

fn step_failed(step: ProvisionStep, source: TenancyError) -> TenancyError {
    TenancyError::Provision {
        step,
        source: Box::new(source),
    }
}

async fn seed_roles(conn: &mut PgConnection, schema: &SchemaName) -> Result<(), TenancyError> {
    for (role, permissions) in DEFAULT_ROLES {
        sqlx::query(&format!(
            "INSERT INTO {} (name) VALUES ($1) ON CONFLICT (name) DO NOTHING",
            schema.qualify("roles")
        ))
        .bind(role)
        .execute(&mut *conn)
        .await?;

        let role_id: Uuid = sqlx::query_scalar(&format!(
            "SELECT id FROM {} WHERE name = $1",
            schema.qualify("roles")
        ))
        .bind(role)
        .fetch_one(&mut *conn)
        .await?;

        for permission in *permissions {
            sqlx::query(&format!(
                "INSERT INTO {} (role_id, permission) VALUES ($1, $2) ON CONFLICT DO NOTHING",
                schema.qualify("role_permissions")
            ))
            .bind(role_id)
            .bind(permission)
            .execute(&mut *conn)
            .await?;
        }
    }
    Ok(())
}

async fn create_owner(
    conn: &mut PgConnection,
    schema: &SchemaName,
    email: &str,
    password_hash: &str,
) -> Result<(), TenancyError> {
    let role_id: Uuid = sqlx::query_scalar(&format!(
        "SELECT id FROM {} WHERE name = $1",
        schema.qualify("roles")
    ))
    .bind(OWNER_ROLE)
    .fetch_one(&mut *conn)
    .await?;

    sqlx::query(&format!(
        "INSERT INTO {} (email, password_hash, role_id) VALUES ($1, $2, $3)
         ON CONFLICT (email) DO NOTHING",
        schema.qualify("users")
    ))
    .bind(email)
    .bind(password_hash)
    .bind(role_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn create_settings(
    conn: &mut PgConnection,
    schema: &SchemaName,
    company_name: &str,
) -> Result<(), TenancyError> {
    let exists: bool = sqlx::query_scalar(&format!(
        "SELECT EXISTS(SELECT 1 FROM {})",
        schema.qualify("tenant_settings")
    ))
    .fetch_one(&mut *conn)
    .await?;
    if exists {
        return Ok(());
    }

    sqlx::query(&format!(
        "INSERT INTO {} (company_name) VALUES ($1)",
        schema.qualify("tenant_settings")
    ))
    .bind(company_name)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_names_are_unique() {
        let mut names: Vec<&str> = DEFAULT_ROLES.iter().map(|(name, _)| *name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), DEFAULT_ROLES.len());
    }

    #[test]
    fn test_owner_is_highest_privilege() {
        let owner = DEFAULT_ROLES
            .iter()
            .find(|(name, _)| *name == OWNER_ROLE)
            .map(|(_, perms)| *perms)
            .expect("owner role must be seeded");

        for (name, perms) in DEFAULT_ROLES {
            for permission in *perms {
                assert!(
                    owner.contains(permission),
                    "owner is missing {} granted to {}",
                    permission,
                    name
                );
            }
        }
    }

    #[test]
    fn test_step_display() {
        assert_eq!(ProvisionStep::CreateSchema.to_string(), "create_schema");
        assert_eq!(ProvisionStep::CreateSettings.to_string(), "create_settings");
    }
}
