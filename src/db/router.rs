use sqlx::pool::PoolConnection;
use sqlx::{PgConnection, PgPool, Postgres};

use crate::db::context::{ContextCell, TenantContext};
use crate::db::schema::SchemaName;
use crate::error::TenancyError;

/// A pooled connection pinned to exactly one schema for its lifetime.
///
/// Every query issued through the session resolves against the schema it was
/// routed to; dropping it releases the connection back to the shared pool.
#[derive(Debug)]
pub struct SchemaSession {
    conn: PoolConnection<Postgres>,
    schema: SchemaName,
}

impl SchemaSession {
    pub fn schema(&self) -> &SchemaName {
        &self.schema
    }

    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.conn
    }
}

/// Hands out schema-scoped sessions from one shared connection pool.
///
/// The pool is schema-agnostic: a checked-out connection may carry the
/// search_path of whichever tenant used it last. The router therefore
/// re-asserts the schema directive on every checkout and confirms it took
/// effect before the session is handed to the caller.
#[derive(Clone)]
pub struct SchemaRouter {
    pool: PgPool,
}

impl SchemaRouter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Session for the tenant held by `cell`. Opening a session with no
    /// context set fails with `ContextMisuse` — never a default schema.
    pub async fn open_session(&self, cell: &ContextCell) -> Result<SchemaSession, TenancyError> {
        self.open_session_for(cell.current()?).await
    }

    /// Session for an explicit tenant context. `SchemaNotFound` means the
    /// tenant has not been provisioned yet, distinct from transient failures.
    pub async fn open_session_for(
        &self,
        ctx: &TenantContext,
    ) -> Result<SchemaSession, TenancyError> {
        let mut conn = self.pool.acquire().await?;
        assert_schema(&mut conn, ctx.schema(), true).await?;
        Ok(SchemaSession {
            conn,
            schema: ctx.schema().clone(),
        })
    }

    /// Session bound to the shared schema (tenant registry, platform
    /// entities). Takes no tenant context and is always available.
    pub async fn open_shared_session(&self) -> Result<SchemaSession, TenancyError> {
        let mut conn = self.pool.acquire().await?;
        let shared = SchemaName::shared();
        assert_schema(&mut conn, &shared, false).await?;
        Ok(SchemaSession {
            conn,
            schema: shared,
        })
    }
}

/// Issue and confirm the active-schema directive on `conn`.
///
/// Called on every checkout; pool state is never trusted. With `must_exist`,
/// a missing schema is reported as `SchemaNotFound` before any directive is
/// issued.
pub(crate) async fn assert_schema(
    conn: &mut PgConnection,
    schema: &SchemaName,
    must_exist: bool,
) -> Result<(), TenancyError> {
    if must_exist {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM information_schema.schemata WHERE schema_name = $1)",
        )
        .bind(schema.as_str())
        .fetch_one(&mut *conn)
        .await?;
        if !exists {
            return Err(TenancyError::SchemaNotFound(schema.as_str().to_string()));
        }
    }

    sqlx::query(&format!("SET search_path TO {}", schema.quoted()))
        .execute(&mut *conn)
        .await?;

    // Confirm before handing the connection back: current_schema() is NULL if
    // the search_path resolved to nothing.
    let active: Option<String> = sqlx::query_scalar("SELECT current_schema()")
        .fetch_one(&mut *conn)
        .await?;
    if active.as_deref() != Some(schema.as_str()) {
        return Err(TenancyError::SchemaNotFound(schema.as_str().to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::context::ContextCell;

    #[tokio::test]
    async fn test_open_session_without_context_is_misuse() {
        // A lazy pool never connects unless a query runs; the misuse check
        // fires before any connection is acquired.
        let pool = PgPool::connect_lazy("postgres://localhost/unused").unwrap();
        let router = SchemaRouter::new(pool);
        let cell = ContextCell::new();

        let err = router.open_session(&cell).await.unwrap_err();
        assert!(matches!(err, TenancyError::ContextMisuse(_)));
    }
}
