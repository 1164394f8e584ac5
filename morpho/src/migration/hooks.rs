//! Write-path interception for tables under migration.
//!
//! The application keeps writing the original table; after each DML
//! statement it hands the fully-bound SQL to the registry inside the same
//! transaction. When a migration is in progress for that table the hook
//! re-executes the statement against the shadow table, so original and
//! shadow commit (or roll back) together. Hooks fail closed: any error
//! propagates and takes the application write down with it.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;

use sqlx::MySqlConnection;

use super::{active_shadow_table, MigrationRegistry};
use crate::error::Result;

const AFTER_CREATE_DONE: &str = "after_create_done";

/// One application DML statement, as executed against the original table.
///
/// `sql` must be fully bound (no placeholders) so it can be replayed
/// verbatim against the shadow. The settings bag carries per-statement
/// markers; the create hook uses it to guard against re-entry.
pub struct Statement {
    pub table: String,
    pub sql: String,
    settings: HashSet<String>,
}

impl Statement {
    pub fn new(table: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            sql: sql.into(),
            settings: HashSet::new(),
        }
    }

    pub fn set(&mut self, key: impl Into<String>) {
        self.settings.insert(key.into());
    }

    pub fn is_set(&self, key: &str) -> bool {
        self.settings.contains(key)
    }
}

/// User callback attached to a migration, invoked after the double-write.
pub trait StatementHook: Send + Sync {
    fn call<'a>(
        &'a self,
        conn: &'a mut MySqlConnection,
        stmt: &'a Statement,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;
}

impl<F> StatementHook for F
where
    F: for<'a> Fn(
            &'a mut MySqlConnection,
            &'a Statement,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>
        + Send
        + Sync,
{
    fn call<'a>(
        &'a self,
        conn: &'a mut MySqlConnection,
        stmt: &'a Statement,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>> {
        self(conn, stmt)
    }
}

impl MigrationRegistry {
    /// Mirrors an insert to the shadow table, once per statement.
    pub async fn after_create(
        &self,
        conn: &mut MySqlConnection,
        stmt: &mut Statement,
    ) -> Result<()> {
        let Some(migration) = self.get(&stmt.table) else {
            return Ok(());
        };
        let Some(shadow) = active_shadow_table(conn, &stmt.table).await? else {
            return Ok(());
        };

        if stmt.is_set(AFTER_CREATE_DONE) {
            return Ok(());
        }

        let sql = stmt.sql.replacen(&stmt.table, &shadow, 1);
        migration.db.execute_on(conn, &sql).await?;
        stmt.set(AFTER_CREATE_DONE);

        if let Some(hook) = &migration.after_create {
            hook.call(conn, stmt).await?;
        }

        Ok(())
    }

    /// Mirrors an update to the shadow table.
    pub async fn after_update(
        &self,
        conn: &mut MySqlConnection,
        stmt: &mut Statement,
    ) -> Result<()> {
        let Some(migration) = self.get(&stmt.table) else {
            return Ok(());
        };
        let Some(shadow) = active_shadow_table(conn, &stmt.table).await? else {
            return Ok(());
        };

        let sql = stmt.sql.replacen(&stmt.table, &shadow, 1);
        migration.db.execute_on(conn, &sql).await?;

        if let Some(hook) = &migration.after_update {
            hook.call(conn, stmt).await?;
        }

        Ok(())
    }

    /// Mirrors a delete to the shadow table.
    pub async fn after_delete(
        &self,
        conn: &mut MySqlConnection,
        stmt: &mut Statement,
    ) -> Result<()> {
        let Some(migration) = self.get(&stmt.table) else {
            return Ok(());
        };
        let Some(shadow) = active_shadow_table(conn, &stmt.table).await? else {
            return Ok(());
        };

        let sql = stmt.sql.replacen(&stmt.table, &shadow, 1);
        migration.db.execute_on(conn, &sql).await?;

        if let Some(hook) = &migration.after_delete {
            hook.call(conn, stmt).await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statement_marker_guards_reentry() {
        let mut stmt = Statement::new("device", "INSERT INTO device (name) VALUES ('a')");
        assert!(!stmt.is_set(AFTER_CREATE_DONE));

        stmt.set(AFTER_CREATE_DONE);
        assert!(stmt.is_set(AFTER_CREATE_DONE));
    }

    #[test]
    fn statement_sql_targets_shadow_after_substitution() {
        let stmt = Statement::new("device", "UPDATE device SET name = 'b' WHERE id = 3");
        let sql = stmt.sql.replacen(&stmt.table, "device_1730000000000", 1);
        assert_eq!(
            sql,
            "UPDATE device_1730000000000 SET name = 'b' WHERE id = 3"
        );
    }
}
