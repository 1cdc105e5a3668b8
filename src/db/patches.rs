use std::sync::Arc;

use sqlx::{Connection, PgConnection};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::db::context::TenantContext;
use crate::db::directory::{TenantDirectory, TenantRef};
use crate::db::migrations::{acquire_or_cancelled, collect_report, BatchReport};
use crate::db::router::SchemaRouter;
use crate::db::schema::SchemaName;
use crate::error::TenancyError;

/// A named, idempotent structural fix applied outside the migration sequence.
///
/// `check_sql` takes the schema name as `$1` and returns a boolean: has this
/// patch already landed in that schema? The statements themselves are guarded
/// DDL (ADD COLUMN IF NOT EXISTS and friends), so re-running a patch against
/// a schema that already has it is a no-op, never an error. Safe to re-run
/// unconditionally on every startup.
pub struct SchemaPatch {
    pub id: &'static str,
    check_sql: &'static str,
    statements: fn(&SchemaName) -> Vec<String>,
}

impl SchemaPatch {
    pub fn statements(&self, schema: &SchemaName) -> Vec<String> {
        (self.statements)(schema)
    }

    pub fn check_sql(&self) -> &'static str {
        self.check_sql
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    Applied,
    AlreadyApplied,
}

pub fn patch_set() -> &'static [SchemaPatch] {
    &PATCHES
}

static PATCHES: [SchemaPatch; 2] = [
    SchemaPatch {
        id: "orders_external_ref",
        check_sql: "SELECT EXISTS(SELECT 1 FROM information_schema.columns \
                    WHERE table_schema = $1 AND table_name = 'orders' AND column_name = 'external_ref')",
        statements: orders_external_ref,
    },
    SchemaPatch {
        id: "shipments_delivered_at",
        check_sql: "SELECT EXISTS(SELECT 1 FROM information_schema.columns \
                    WHERE table_schema = $1 AND table_name = 'shipments' AND column_name = 'delivered_at')",
        statements: shipments_delivered_at,
    },
];

fn orders_external_ref(schema: &SchemaName) -> Vec<String> {
    vec![
        format!(
            r#"ALTER TABLE {} ADD COLUMN IF NOT EXISTS external_ref VARCHAR(64)"#,
            schema.qualify("orders")
        ),
        format!(
            r#"CREATE INDEX IF NOT EXISTS orders_external_ref_idx ON {}(external_ref)"#,
            schema.qualify("orders")
        ),
    ]
}

fn shipments_delivered_at(schema: &SchemaName) -> Vec<String> {
    vec![format!(
        r#"ALTER TABLE {} ADD COLUMN IF NOT EXISTS delivered_at TIMESTAMPTZ"#,
        schema.qualify("shipments")
    )]
}

/// Applies the patch set across all eligible tenant schemas with the same
/// continue-on-failure policy as the migration orchestrator.
#[derive(Clone)]
pub struct SchemaPatchApplier {
    router: SchemaRouter,
    directory: TenantDirectory,
    concurrency: usize,
}

impl SchemaPatchApplier {
    pub fn new(router: SchemaRouter, directory: TenantDirectory, concurrency: usize) -> Self {
        Self {
            router,
            directory,
            concurrency: concurrency.max(1),
        }
    }

    /// Apply a single patch to a single tenant schema.
    pub async fn apply_patch(
        &self,
        patch: &SchemaPatch,
        tenant: &TenantRef,
    ) -> Result<PatchOutcome, TenancyError> {
        let ctx = TenantContext::new(tenant.id, &tenant.slug)?;
        let mut session = self.router.open_session_for(&ctx).await?;
        apply_on(session.conn(), patch, tenant, ctx.schema()).await
    }

    /// Apply every patch to every eligible tenant.
    pub async fn run_all(&self, cancel: &CancellationToken) -> Result<BatchReport, TenancyError> {
        let tenants = self.directory.list_eligible_tenants().await?;
        tracing::info!("Running schema patches for {} tenants", tenants.len());

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::new();

        for tenant in tenants {
            // Same launch discipline as the migration sweep: cancellation
            // stops new tenants, in-flight ones finish.
            let Some(permit) = acquire_or_cancelled(&semaphore, cancel).await else {
                tracing::info!("Cancellation requested, not starting remaining tenants");
                break;
            };
            let applier = self.clone();
            let task_tenant = tenant.clone();
            handles.push((
                tenant,
                tokio::spawn(async move {
                    let _permit = permit;
                    applier.patch_tenant(&task_tenant).await
                }),
            ));
        }

        Ok(collect_report("patches", handles).await)
    }

    /// Run the whole patch set against one tenant, sequentially. Returns the
    /// number of patches newly applied.
    async fn patch_tenant(&self, tenant: &TenantRef) -> Result<usize, TenancyError> {
        let ctx = TenantContext::new(tenant.id, &tenant.slug)?;
        let mut session = self.router.open_session_for(&ctx).await?;

        let mut count = 0;
        for patch in patch_set() {
            if apply_on(session.conn(), patch, tenant, ctx.schema()).await? == PatchOutcome::Applied
            {
                count += 1;
            }
        }
        Ok(count)
    }
}

async fn apply_on(
    conn: &mut PgConnection,
    patch: &SchemaPatch,
    tenant: &TenantRef,
    schema: &SchemaName,
) -> Result<PatchOutcome, TenancyError> {
    let already: bool = sqlx::query_scalar(patch.check_sql)
        .bind(schema.as_str())
        .fetch_one(&mut *conn)
        .await?;
    if already {
        return Ok(PatchOutcome::AlreadyApplied);
    }

    let mut tx = conn.begin().await?;
    for statement in patch.statements(schema) {
        // Executing the &str directly is the same unprepared simple-query
        // path as sqlx::raw_sql, but its future passes the Send check that
        // raw_sql's trips over (rustc "not general enough" in spawned tasks).
        sqlx::Executor::execute(&mut *tx, statement.as_str())
            .await
            .map_err(|source| TenancyError::PatchApply {
                tenant: tenant.id,
                patch: patch.id,
                source,
            })?;
    }
    tx.commit().await?;

    Ok(PatchOutcome::Applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_patch_ids_are_unique() {
        let mut ids: Vec<&str> = PATCHES.iter().map(|p| p.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), PATCHES.len());
    }

    #[test]
    fn test_checks_bind_the_schema() {
        for patch in patch_set() {
            assert!(
                patch.check_sql().contains("$1"),
                "{} check does not bind the schema name",
                patch.id
            );
        }
    }

    #[test]
    fn test_statements_are_guarded_and_qualified() {
        let schema = SchemaName::for_slug("acme").unwrap();
        for patch in patch_set() {
            for statement in patch.statements(&schema) {
                assert!(
                    statement.contains("IF NOT EXISTS"),
                    "{} statement is not idempotent: {}",
                    patch.id,
                    statement
                );
                assert!(
                    statement.contains("\"tenant_acme\"."),
                    "{} statement is not schema-qualified: {}",
                    patch.id,
                    statement
                );
            }
        }
    }
}
