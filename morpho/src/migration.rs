//! Online migration of a live table.
//!
//! [`Migration::start`] first attempts the user's `ALTER` with MySQL
//! online-DDL hints appended (`ALGORITHM=INPLACE, LOCK=NONE`). When the
//! server rejects that, it falls back to a shadow-table copy: a structural
//! clone of the table is created with the `ALTER` applied, application
//! writes are mirrored to it through the [`hooks`] while a background task
//! copies historical rows in batches, and once the copy catches up the
//! shadow is swapped into place with an atomic `RENAME TABLE`.
//!
//! Every control-plane transition (a new start, each copy batch, the final
//! cutover) serializes on a `FOR UPDATE` lock over the migration log, so
//! concurrent starts and racing copy workers are safe.
//!
//! ```rust,ignore
//! let registry = MigrationRegistry::new();
//! let migration = MigrationBuilder::new(
//!     "device",
//!     "alter table device modify column name varchar(50)",
//! )
//! .register(&db, &registry);
//!
//! migration.start().await?;
//! ```

pub mod hooks;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use sqlx::{MySqlConnection, Row};
use tokio::time::sleep;

use crate::error::{Error, Result};
use crate::pool::Db;
use crate::schema;

pub use hooks::{Statement, StatementHook};

const BACKFILL_BATCH: i64 = 200;
const BACKFILL_PAUSE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationStatus {
    NotStarted = 0,
    InProgress = 1,
    Completed = 2,
}

/// One row of `gorm_migration_log`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MigrationLogRow {
    pub id: i64,
    pub old_table_name: String,
    pub new_table_name: String,
    pub old_table_backup_name: Option<String>,
    pub start_id: i64,
    pub end_id: i64,
    pub total_records: i64,
    pub completed_records: i64,
    pub status: i32,
    pub created_at: i64,
}

/// Descriptor of one table under (or about to be under) migration.
///
/// Built by [`MigrationBuilder`] and stored in a [`MigrationRegistry`] so
/// the double-write hooks can find it by table name.
pub struct Migration {
    db: Db,
    table: String,
    alter_sql: String,
    after_create: Option<Box<dyn StatementHook>>,
    after_update: Option<Box<dyn StatementHook>>,
    after_delete: Option<Box<dyn StatementHook>>,
}

pub struct MigrationBuilder {
    table: String,
    alter_sql: String,
    after_create: Option<Box<dyn StatementHook>>,
    after_update: Option<Box<dyn StatementHook>>,
    after_delete: Option<Box<dyn StatementHook>>,
}

impl MigrationBuilder {
    pub fn new(table: impl Into<String>, alter_sql: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            alter_sql: alter_sql.into(),
            after_create: None,
            after_update: None,
            after_delete: None,
        }
    }

    /// Callback invoked after a create has been mirrored to the shadow.
    pub fn after_create(mut self, hook: impl StatementHook + 'static) -> Self {
        self.after_create = Some(Box::new(hook));

        self
    }

    /// Callback invoked after an update has been mirrored to the shadow.
    pub fn after_update(mut self, hook: impl StatementHook + 'static) -> Self {
        self.after_update = Some(Box::new(hook));

        self
    }

    /// Callback invoked after a delete has been mirrored to the shadow.
    pub fn after_delete(mut self, hook: impl StatementHook + 'static) -> Self {
        self.after_delete = Some(Box::new(hook));

        self
    }

    /// Finalizes the descriptor and registers it for hook lookup.
    pub fn register(self, db: &Db, registry: &MigrationRegistry) -> Arc<Migration> {
        let migration = Arc::new(Migration {
            db: db.clone(),
            table: self.table,
            alter_sql: self.alter_sql,
            after_create: self.after_create,
            after_update: self.after_update,
            after_delete: self.after_delete,
        });

        registry.insert(migration.clone());

        migration
    }
}

/// Process-wide lookup from table name to its migration descriptor.
///
/// Written during startup wiring, read from the write-path hooks. Pass it
/// explicitly to whatever layer intercepts writes.
#[derive(Clone, Default)]
pub struct MigrationRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<Migration>>>>,
}

impl MigrationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, table: &str) -> Option<Arc<Migration>> {
        self.inner.read().get(table).cloned()
    }

    fn insert(&self, migration: Arc<Migration>) {
        self.inner
            .write()
            .insert(migration.table.clone(), migration);
    }
}

impl Migration {
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Starts the migration.
    ///
    /// Idempotent with respect to concurrent invocations on the same table:
    /// when an earlier attempt is still in progress this logs a warning,
    /// relaunches the catch-up worker for it and returns without error.
    #[tracing::instrument(skip_all, fields(table = %self.table))]
    pub async fn start(&self) -> Result<()> {
        schema::ensure_migration_log(self.db.writer()).await?;

        if self.alter_sql.is_empty() {
            return Err(Error::EmptyAlterSql);
        }

        // Online DDL first; the server errors when the statement cannot run
        // in place and only then is the shadow copy worth its cost.
        let hinted = inplace_alter_sql(&self.table, &self.alter_sql);
        if self.db.execute(&hinted).await.is_ok() {
            return Ok(());
        }

        let mut tx = self.db.writer().begin().await?;

        sqlx::query("SELECT id FROM gorm_migration_log FOR UPDATE")
            .execute(&mut *tx)
            .await?;

        let active: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM gorm_migration_log WHERE old_table_name = ? AND status = ?",
        )
        .bind(&self.table)
        .bind(MigrationStatus::InProgress as i32)
        .fetch_one(&mut *tx)
        .await?;

        if active > 0 {
            tracing::warn!("wait old migration process completed");
            tx.commit().await?;
            self.spawn_backfill();

            return Ok(());
        }

        let original_ddl = show_create_table(&mut tx, &self.table).await?;

        let shadow = format!("{}_{}", self.table, Utc::now().timestamp_millis());
        let create_sql = original_ddl.replacen(&self.table, &shadow, 1);
        if let Err(err) = self.db.execute_on(&mut tx, &create_sql).await {
            tracing::error!(error = %err, "create new table failed");

            return Err(Error::CreateShadowTable);
        }

        let shadow_alter = self.alter_sql.replacen(&self.table, &shadow, 1);
        if let Err(err) = self.db.execute_on(&mut tx, &shadow_alter).await {
            tracing::error!(error = %err, "alter on new table failed");
            let _ = self
                .db
                .execute_on(&mut tx, &format!("DROP TABLE IF EXISTS `{shadow}`"))
                .await;

            return Err(Error::ShadowAlter);
        }

        // The alter may turn out to be a structural no-op once normalized by
        // the server; a full table copy would buy nothing.
        let shadow_ddl = show_create_table(&mut tx, &shadow).await?;
        if shadow_ddl.replacen(&shadow, &self.table, 1) == original_ddl {
            let _ = self
                .db
                .execute_on(&mut tx, &format!("DROP TABLE IF EXISTS `{shadow}`"))
                .await;

            return Err(Error::NoChange);
        }

        let end_id: Option<i64> =
            sqlx::query_scalar(&format!("SELECT MAX(id) FROM `{}`", self.table))
                .fetch_one(&mut *tx)
                .await?;
        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM `{}`", self.table))
            .fetch_one(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO gorm_migration_log \
             (old_table_name, new_table_name, start_id, end_id, total_records, \
              completed_records, status, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.table)
        .bind(&shadow)
        .bind(0_i64)
        .bind(end_id.unwrap_or_default())
        .bind(total)
        .bind(0_i64)
        .bind(MigrationStatus::InProgress as i32)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        self.spawn_backfill();

        Ok(())
    }

    fn spawn_backfill(&self) {
        let db = self.db.clone();
        let table = self.table.clone();

        tokio::spawn(async move {
            loop {
                match backfill_step(&db, &table).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(err) => {
                        tracing::error!(table = %table, error = %err, "history copy failed");
                        break;
                    }
                }

                sleep(BACKFILL_PAUSE).await;
            }
        });
    }
}

/// Runs one catch-up iteration; `Ok(false)` means the migration is finished
/// (or was never active) and the worker can stop.
async fn backfill_step(db: &Db, table: &str) -> Result<bool> {
    {
        let mut conn = db.writer().acquire().await?;
        if active_shadow_table(&mut conn, table).await?.is_none() {
            return Ok(false);
        }
    }

    let mut tx = db.writer().begin().await?;

    sqlx::query("SELECT id FROM gorm_migration_log FOR UPDATE")
        .execute(&mut *tx)
        .await?;

    let detail: Option<MigrationLogRow> = sqlx::query_as(
        "SELECT * FROM gorm_migration_log \
         WHERE old_table_name = ? AND status = ? ORDER BY id DESC LIMIT 1",
    )
    .bind(table)
    .bind(MigrationStatus::InProgress as i32)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(detail) = detail else {
        tx.commit().await?;

        return Ok(false);
    };

    let ids: Vec<i64> = sqlx::query_scalar(&format!(
        "SELECT id FROM `{table}` WHERE id >= ? AND id <= ? ORDER BY id ASC LIMIT {BACKFILL_BATCH}"
    ))
    .bind(detail.start_id)
    .bind(detail.end_id)
    .fetch_all(&mut *tx)
    .await?;

    let batch_max = ids.last().copied();
    if let Some(batch_max) = batch_max.filter(|_| detail.start_id != detail.end_id) {
        let columns = table_columns(&mut tx, table).await?;
        let column_list = columns
            .iter()
            .map(|c| format!("`{c}`"))
            .collect::<Vec<_>>()
            .join(", ");

        // No-op upsert keeps the copy idempotent against rows the
        // double-write hooks already inserted.
        let copied = sqlx::query(&format!(
            "INSERT INTO `{shadow}` ({column_list}) \
             SELECT {column_list} FROM `{table}` WHERE id >= ? AND id <= ? \
             ON DUPLICATE KEY UPDATE id = id",
            shadow = detail.new_table_name,
        ))
        .bind(detail.start_id)
        .bind(batch_max)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        sqlx::query(
            "UPDATE gorm_migration_log \
             SET start_id = ?, completed_records = completed_records + ? WHERE id = ?",
        )
        .bind(batch_max)
        .bind(copied as i64)
        .bind(detail.id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        return Ok(true);
    }

    // Window drained: flip the status, remember where the original went and
    // swap the tables in one atomic rename.
    sqlx::query("UPDATE gorm_migration_log SET status = ? WHERE id = ?")
        .bind(MigrationStatus::Completed as i32)
        .bind(detail.id)
        .execute(&mut *tx)
        .await?;

    let backup = format!("{table}_old_{}", Utc::now().timestamp_millis());
    sqlx::query("UPDATE gorm_migration_log SET old_table_backup_name = ? WHERE id = ?")
        .bind(&backup)
        .bind(detail.id)
        .execute(&mut *tx)
        .await?;

    let rename = format!(
        "RENAME TABLE `{table}` TO `{backup}`, `{shadow}` TO `{table}`",
        shadow = detail.new_table_name,
    );
    db.execute_on(&mut tx, &rename).await?;

    tx.commit().await?;

    tracing::info!(table = %table, backup = %backup, "migration completed, tables switched");

    Ok(true)
}

/// Newest in-progress shadow table for `table`, if any.
///
/// Tolerates the log table not existing yet: hooks can run before any
/// migration was ever started on this database.
pub(crate) async fn active_shadow_table(
    conn: &mut MySqlConnection,
    table: &str,
) -> Result<Option<String>> {
    let res = sqlx::query_scalar::<_, String>(
        "SELECT new_table_name FROM gorm_migration_log \
         WHERE old_table_name = ? AND status = ? ORDER BY id DESC LIMIT 1",
    )
    .bind(table)
    .bind(MigrationStatus::InProgress as i32)
    .fetch_optional(conn)
    .await;

    match res {
        Ok(shadow) => Ok(shadow),
        Err(sqlx::Error::Database(err)) if err.code().as_deref() == Some("42S02") => Ok(None),
        Err(err) => Err(err.into()),
    }
}

async fn show_create_table(conn: &mut MySqlConnection, table: &str) -> Result<String> {
    let row = sqlx::query(&format!("SHOW CREATE TABLE `{table}`"))
        .fetch_one(conn)
        .await
        .map_err(|_| Error::ShowCreateTable(table.to_owned()))?;

    Ok(row.try_get("Create Table")?)
}

async fn table_columns(conn: &mut MySqlConnection, table: &str) -> Result<Vec<String>> {
    let columns = sqlx::query_scalar::<_, String>(
        "SELECT COLUMN_NAME FROM information_schema.COLUMNS \
         WHERE TABLE_SCHEMA = DATABASE() AND TABLE_NAME = ? ORDER BY ORDINAL_POSITION",
    )
    .bind(table)
    .fetch_all(conn)
    .await?;

    Ok(columns)
}

/// Appends or injects the MySQL online-DDL hints into the user's `ALTER`.
///
/// `ALTER … PARTITION BY …` needs the hints before the `PARTITION BY`
/// clause when the statement also reshapes columns, and after the table
/// name otherwise; everything else takes them appended.
fn inplace_alter_sql(table: &str, alter_sql: &str) -> String {
    let alter = alter_sql.trim_end().trim_end_matches(';');
    let lower = alter.to_lowercase();

    if lower.contains("partition by") {
        if ["add", "drop", "modify", "change"]
            .iter()
            .any(|kw| lower.contains(kw))
        {
            alter
                .replacen("partition by", ",ALGORITHM=INPLACE, LOCK=NONE partition by", 1)
                .replacen("PARTITION BY", ",ALGORITHM=INPLACE, LOCK=NONE PARTITION BY", 1)
        } else {
            alter.replacen(table, &format!("{table} ALGORITHM=INPLACE, LOCK=NONE"), 1)
        }
    } else {
        format!("{alter},ALGORITHM=INPLACE,LOCK=NONE;")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_alter_gets_hints_appended() {
        let sql = inplace_alter_sql("metrics", "alter table metrics modify column c1 varchar(10);");
        assert_eq!(
            sql,
            "alter table metrics modify column c1 varchar(10),ALGORITHM=INPLACE,LOCK=NONE;"
        );
    }

    #[test]
    fn partition_alter_with_column_changes_injects_before_partition_by() {
        let sql = inplace_alter_sql(
            "metrics",
            "alter table metrics drop primary key, add primary key(id, created_at) PARTITION BY RANGE (created_at) (PARTITION p20250101 VALUES LESS THAN (UNIX_TIMESTAMP('2025-01-01')))",
        );
        assert!(
            sql.contains(",ALGORITHM=INPLACE, LOCK=NONE PARTITION BY RANGE"),
            "{sql}"
        );
        assert!(!sql.ends_with("LOCK=NONE;"), "{sql}");
    }

    #[test]
    fn partition_only_alter_hints_after_table_name() {
        let sql = inplace_alter_sql(
            "metrics",
            "alter table metrics partition by range (pk) (partition p1 values less than (10))",
        );
        assert!(
            sql.starts_with("alter table metrics ALGORITHM=INPLACE, LOCK=NONE partition by"),
            "{sql}"
        );
    }

    #[test]
    fn shadow_name_substitution_replaces_first_occurrence_only() {
        let ddl = "CREATE TABLE `metrics` (`id` int, KEY `metrics_idx` (`id`))";
        let replaced = ddl.replacen("metrics", "metrics_123", 1);
        assert_eq!(
            replaced,
            "CREATE TABLE `metrics_123` (`id` int, KEY `metrics_idx` (`id`))"
        );
    }
}
