use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use sqlx::{Connection, PgConnection};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::context::TenantContext;
use crate::db::directory::{TenantDirectory, TenantRef};
use crate::db::router::{assert_schema, SchemaRouter};
use crate::db::schema::SchemaName;
use crate::error::TenancyError;

/// One ordered, versioned structural change to a tenant schema.
///
/// Versions form a fixed total order; a schema's applied set is always a
/// prefix of this list. Statements are rendered against a validated
/// `SchemaName` so every table reference is schema-qualified — nothing relies
/// on search_path resolution inside migration SQL.
pub struct TenantMigration {
    pub version: i64,
    pub name: &'static str,
    statements: fn(&SchemaName) -> Vec<String>,
}

impl TenantMigration {
    pub fn statements(&self, schema: &SchemaName) -> Vec<String> {
        (self.statements)(schema)
    }
}

/// The shared migration set applied to every tenant schema, in order.
pub fn migration_set() -> &'static [TenantMigration] {
    &MIGRATIONS
}

static MIGRATIONS: [TenantMigration; 5] = [
    TenantMigration {
        version: 1,
        name: "create_roles_and_users",
        statements: roles_and_users,
    },
    TenantMigration {
        version: 2,
        name: "create_tenant_settings",
        statements: tenant_settings,
    },
    TenantMigration {
        version: 3,
        name: "create_orders",
        statements: orders,
    },
    TenantMigration {
        version: 4,
        name: "create_shipments",
        statements: shipments,
    },
    TenantMigration {
        version: 5,
        name: "add_order_channel",
        statements: order_channel,
    },
];

fn roles_and_users(schema: &SchemaName) -> Vec<String> {
    vec![
        format!(
            r#"CREATE TABLE IF NOT EXISTS {} (
                id         UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                name       VARCHAR(64) UNIQUE NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )"#,
            schema.qualify("roles")
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS {role_permissions} (
                role_id    UUID NOT NULL REFERENCES {roles}(id) ON DELETE CASCADE,
                permission VARCHAR(64) NOT NULL,
                PRIMARY KEY (role_id, permission)
            )"#,
            role_permissions = schema.qualify("role_permissions"),
            roles = schema.qualify("roles"),
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS {users} (
                id            UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                email         VARCHAR(255) UNIQUE NOT NULL,
                password_hash TEXT NOT NULL,
                role_id       UUID NOT NULL REFERENCES {roles}(id),
                is_active     BOOLEAN NOT NULL DEFAULT TRUE,
                created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )"#,
            users = schema.qualify("users"),
            roles = schema.qualify("roles"),
        ),
    ]
}

fn tenant_settings(schema: &SchemaName) -> Vec<String> {
    vec![format!(
        r#"CREATE TABLE IF NOT EXISTS {} (
            id           UUID PRIMARY KEY DEFAULT gen_random_uuid(),
            company_name VARCHAR(255) NOT NULL,
            timezone     VARCHAR(64) NOT NULL DEFAULT 'UTC',
            locale       VARCHAR(8) NOT NULL DEFAULT 'en',
            created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at   TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )"#,
        schema.qualify("tenant_settings")
    )]
}

fn orders(schema: &SchemaName) -> Vec<String> {
    vec![
        format!(
            r#"CREATE TABLE IF NOT EXISTS {orders} (
                id            UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                reference     VARCHAR(64) UNIQUE NOT NULL,
                status        VARCHAR(32) NOT NULL DEFAULT 'created',
                customer_name VARCHAR(255) NOT NULL,
                created_by    UUID REFERENCES {users}(id),
                created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )"#,
            orders = schema.qualify("orders"),
            users = schema.qualify("users"),
        ),
        format!(
            r#"CREATE INDEX IF NOT EXISTS orders_status_idx ON {}(status)"#,
            schema.qualify("orders")
        ),
    ]
}

fn shipments(schema: &SchemaName) -> Vec<String> {
    vec![
        format!(
            r#"CREATE TABLE IF NOT EXISTS {shipments} (
                id         UUID PRIMARY KEY DEFAULT gen_random_uuid(),
                order_id   UUID NOT NULL REFERENCES {orders}(id) ON DELETE CASCADE,
                courier    VARCHAR(64) NOT NULL,
                awb        VARCHAR(64),
                status     VARCHAR(32) NOT NULL DEFAULT 'pending',
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )"#,
            shipments = schema.qualify("shipments"),
            orders = schema.qualify("orders"),
        ),
        format!(
            r#"CREATE INDEX IF NOT EXISTS shipments_order_idx ON {}(order_id)"#,
            schema.qualify("shipments")
        ),
    ]
}

fn order_channel(schema: &SchemaName) -> Vec<String> {
    vec![format!(
        r#"ALTER TABLE {} ADD COLUMN IF NOT EXISTS channel VARCHAR(32) NOT NULL DEFAULT 'manual'"#,
        schema.qualify("orders")
    )]
}

/// Migrations not yet applied, in version order.
pub fn pending_migrations(applied: &HashSet<i64>) -> Vec<&'static TenantMigration> {
    MIGRATIONS
        .iter()
        .filter(|m| !applied.contains(&m.version))
        .collect()
}

/// Outcome of one sweep across all eligible tenants. Fully populated even if
/// every tenant failed; the operator decides whether partial failure is
/// acceptable.
#[derive(Debug, Default, Serialize)]
pub struct BatchReport {
    pub succeeded: Vec<Uuid>,
    pub failed: Vec<FailedTenant>,
}

#[derive(Debug, Serialize)]
pub struct FailedTenant {
    pub tenant_id: Uuid,
    pub slug: String,
    pub error: String,
}

impl BatchReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn record_success(&mut self, tenant: &TenantRef) {
        self.succeeded.push(tenant.id);
    }

    pub fn record_failure(&mut self, tenant: &TenantRef, error: &TenancyError) {
        self.failed.push(FailedTenant {
            tenant_id: tenant.id,
            slug: tenant.slug.clone(),
            error: error.to_string(),
        });
    }
}

/// Applies the shared migration set to every eligible tenant schema.
///
/// Cross-tenant iterations run with bounded parallelism; within one tenant
/// migrations apply strictly in order on a single connection. One tenant's
/// failure is recorded and never aborts the batch; retry after a recorded
/// failure is a deliberate operator action (re-invoke `run_all`).
#[derive(Clone)]
pub struct MigrationOrchestrator {
    router: SchemaRouter,
    directory: TenantDirectory,
    concurrency: usize,
}

impl MigrationOrchestrator {
    pub fn new(router: SchemaRouter, directory: TenantDirectory, concurrency: usize) -> Self {
        Self {
            router,
            directory,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn run_all(&self, cancel: &CancellationToken) -> Result<BatchReport, TenancyError> {
        let tenants = self.directory.list_eligible_tenants().await?;
        tracing::info!("Running tenant migrations for {} tenants", tenants.len());

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::new();

        for tenant in tenants {
            // Cancellation stops launching new tenant iterations, including
            // while queued for a permit; in-flight ones finish so no schema
            // is left mid-migration.
            let Some(permit) = acquire_or_cancelled(&semaphore, cancel).await else {
                tracing::info!("Cancellation requested, not starting remaining tenants");
                break;
            };
            let orchestrator = self.clone();
            let task_tenant = tenant.clone();
            handles.push((
                tenant,
                tokio::spawn(async move {
                    let _permit = permit;
                    orchestrator.migrate_tenant(&task_tenant).await
                }),
            ));
        }

        Ok(collect_report("migrations", handles).await)
    }

    /// Bring one tenant schema up to date. Returns the number of migrations
    /// newly applied (zero on an already-current schema).
    pub async fn migrate_tenant(&self, tenant: &TenantRef) -> Result<usize, TenancyError> {
        let ctx = TenantContext::new(tenant.id, &tenant.slug)?;
        let mut conn = self.router.pool().acquire().await?;

        sqlx::query(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            ctx.schema().quoted()
        ))
        .execute(&mut *conn)
        .await?;

        // The schema directive and the migration statements share this one
        // connection; an unqualified reference in migration SQL can never
        // land in another schema.
        assert_schema(&mut conn, ctx.schema(), true).await?;

        apply_pending(&mut conn, tenant, ctx.schema()).await
    }
}

/// Wait for a worker permit, giving up promptly if the batch is cancelled.
pub(crate) async fn acquire_or_cancelled(
    semaphore: &Arc<Semaphore>,
    cancel: &CancellationToken,
) -> Option<OwnedSemaphorePermit> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        permit = semaphore.clone().acquire_owned() => permit.ok(),
    }
}

/// Drain the launched tenant tasks into a report. Every launched tenant ends
/// up in exactly one bucket: a task that panicked or was aborted is recorded
/// as a failure for its tenant, never dropped.
pub(crate) async fn collect_report(
    what: &'static str,
    handles: Vec<(TenantRef, JoinHandle<Result<usize, TenancyError>>)>,
) -> BatchReport {
    let mut report = BatchReport::default();
    for (tenant, handle) in handles {
        match handle.await {
            Ok(Ok(applied)) => {
                if applied > 0 {
                    tracing::info!("Applied {} {} to schema {}", applied, what, tenant.schema);
                }
                report.record_success(&tenant);
            }
            Ok(Err(e)) => {
                tracing::error!("Failed {} for tenant {}: {}", what, tenant.slug, e);
                report.record_failure(&tenant, &e);
            }
            Err(join_err) => {
                tracing::error!(
                    "Worker for tenant {} did not complete: {}",
                    tenant.slug,
                    join_err
                );
                report.failed.push(FailedTenant {
                    tenant_id: tenant.id,
                    slug: tenant.slug.clone(),
                    error: format!("worker did not complete: {join_err}"),
                });
            }
        }
    }
    report
}

/// Apply all pending migrations for one schema on one connection.
pub(crate) async fn apply_pending(
    conn: &mut PgConnection,
    tenant: &TenantRef,
    schema: &SchemaName,
) -> Result<usize, TenancyError> {
    ensure_ledger(conn, schema).await?;

    let applied: Vec<i64> = sqlx::query_scalar(&format!(
        "SELECT version FROM {} ORDER BY version",
        schema.qualify("_tenant_migrations")
    ))
    .fetch_all(&mut *conn)
    .await?;
    let applied: HashSet<i64> = applied.into_iter().collect();

    let mut count = 0;
    for migration in pending_migrations(&applied) {
        apply_one(conn, tenant, schema, migration).await?;
        count += 1;
    }
    Ok(count)
}

async fn ensure_ledger(conn: &mut PgConnection, schema: &SchemaName) -> Result<(), TenancyError> {
    sqlx::query(&format!(
        r#"CREATE TABLE IF NOT EXISTS {} (
            version    BIGINT PRIMARY KEY,
            name       TEXT NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )"#,
        schema.qualify("_tenant_migrations")
    ))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn apply_one(
    conn: &mut PgConnection,
    tenant: &TenantRef,
    schema: &SchemaName,
    migration: &TenantMigration,
) -> Result<(), TenancyError> {
    let mut tx = conn.begin().await?;

    // Applied-state check inside the transaction keeps re-runs safe against a
    // schema that already advanced past this version.
    let already: bool = sqlx::query_scalar(&format!(
        "SELECT EXISTS(SELECT 1 FROM {} WHERE version = $1)",
        schema.qualify("_tenant_migrations")
    ))
    .bind(migration.version)
    .fetch_one(&mut *tx)
    .await?;
    if already {
        return Ok(());
    }

    for statement in migration.statements(schema) {
        // Executing the &str directly is the same unprepared simple-query
        // path as sqlx::raw_sql, but its future passes the Send check that
        // raw_sql's trips over (rustc "not general enough" in spawned tasks).
        sqlx::Executor::execute(&mut *tx, statement.as_str())
            .await
            .map_err(|source| TenancyError::MigrationApply {
                tenant: tenant.id,
                version: migration.version,
                name: migration.name,
                source,
            })?;
    }

    sqlx::query(&format!(
        "INSERT INTO {} (version, name) VALUES ($1, $2)",
        schema.qualify("_tenant_migrations")
    ))
    .bind(migration.version)
    .bind(migration.name)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migration_set_is_totally_ordered() {
        let versions: Vec<i64> = MIGRATIONS.iter().map(|m| m.version).collect();
        let mut sorted = versions.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(versions, sorted, "versions must be unique and ascending");
    }

    #[test]
    fn test_pending_is_ordered_suffix_healing() {
        // acme has {1,2}, globex has {1}: both end up with the full set
        let acme: HashSet<i64> = [1, 2].into_iter().collect();
        let globex: HashSet<i64> = [1].into_iter().collect();

        let acme_pending: Vec<i64> = pending_migrations(&acme).iter().map(|m| m.version).collect();
        let globex_pending: Vec<i64> =
            pending_migrations(&globex).iter().map(|m| m.version).collect();

        assert_eq!(acme_pending, vec![3, 4, 5]);
        assert_eq!(globex_pending, vec![2, 3, 4, 5]);
    }

    #[test]
    fn test_nothing_pending_when_current() {
        let applied: HashSet<i64> = MIGRATIONS.iter().map(|m| m.version).collect();
        assert!(pending_migrations(&applied).is_empty());
    }

    #[test]
    fn test_statements_are_schema_qualified() {
        let schema = SchemaName::for_slug("acme").unwrap();
        for migration in migration_set() {
            let statements = migration.statements(&schema);
            assert!(!statements.is_empty(), "{} has no statements", migration.name);
            for statement in &statements {
                assert!(
                    statement.contains("\"tenant_acme\"."),
                    "{} statement is not schema-qualified: {}",
                    migration.name,
                    statement
                );
            }
        }
    }

    #[test]
    fn test_batch_report_accounting() {
        let tenant = TenantRef {
            id: Uuid::new_v4(),
            slug: "acme".into(),
            schema: SchemaName::for_slug("acme").unwrap(),
        };
        let other = TenantRef {
            id: Uuid::new_v4(),
            slug: "globex".into(),
            schema: SchemaName::for_slug("globex").unwrap(),
        };

        let mut report = BatchReport::default();
        report.record_success(&tenant);
        report.record_failure(&other, &TenancyError::SchemaNotFound("tenant_globex".into()));

        assert!(!report.all_succeeded());
        assert_eq!(report.succeeded, vec![tenant.id]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].slug, "globex");

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["succeeded"].as_array().unwrap().len(), 1);
        assert!(json["failed"][0]["error"]
            .as_str()
            .unwrap()
            .contains("tenant_globex"));
    }

    #[tokio::test]
    async fn test_collect_report_records_panicked_workers() {
        let acme = TenantRef {
            id: Uuid::new_v4(),
            slug: "acme".into(),
            schema: SchemaName::for_slug("acme").unwrap(),
        };
        let globex = TenantRef {
            id: Uuid::new_v4(),
            slug: "globex".into(),
            schema: SchemaName::for_slug("globex").unwrap(),
        };

        let handles = vec![
            (
                acme.clone(),
                tokio::spawn(async { Ok::<usize, TenancyError>(2) }),
            ),
            (globex.clone(), tokio::spawn(async { panic!("boom") })),
        ];

        let report = collect_report("migrations", handles).await;

        // Every launched tenant lands in exactly one bucket
        assert_eq!(report.succeeded, vec![acme.id]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].tenant_id, globex.id);
        assert!(report.failed[0].error.contains("did not complete"));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_permit_wait() {
        let semaphore = Arc::new(Semaphore::new(1));
        let held = semaphore.clone().acquire_owned().await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();

        // With no permit available, only cancellation can unblock this
        let got = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            acquire_or_cancelled(&semaphore, &cancel),
        )
        .await
        .expect("cancellation was not observed while waiting for a permit");
        assert!(got.is_none());
        drop(held);
    }

    #[tokio::test]
    async fn test_permit_granted_when_not_cancelled() {
        let semaphore = Arc::new(Semaphore::new(1));
        let cancel = CancellationToken::new();
        let got = acquire_or_cancelled(&semaphore, &cancel).await;
        assert!(got.is_some());
    }
}
