//! Bookkeeping tables the toolkit maintains for itself.
//!
//! `gorm_migration_log` tracks one row per shadow-table migration attempt,
//! `version_log` records applied upgrade versions and named once-only
//! sub-steps. Both are created lazily with `CREATE TABLE IF NOT EXISTS`.

use sea_query::{ColumnDef, Iden, Index, MysqlQueryBuilder, Table, TableCreateStatement};
use sqlx::MySqlPool;

use crate::error::Result;

#[derive(Iden, Clone, Copy)]
pub enum MigrationLog {
    #[iden = "gorm_migration_log"]
    Table,
    Id,
    OldTableName,
    NewTableName,
    OldTableBackupName,
    StartId,
    EndId,
    TotalRecords,
    CompletedRecords,
    Status,
    CreatedAt,
}

#[derive(Iden, Clone, Copy)]
pub enum VersionLog {
    Table,
    Id,
    Version,
    MigrationName,
    CreatedAt,
}

fn migration_log_table() -> TableCreateStatement {
    Table::create()
        .table(MigrationLog::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(MigrationLog::Id)
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key(),
        )
        .col(
            ColumnDef::new(MigrationLog::OldTableName)
                .string()
                .string_len(100)
                .not_null(),
        )
        .col(
            ColumnDef::new(MigrationLog::NewTableName)
                .string()
                .string_len(100)
                .not_null(),
        )
        .col(
            ColumnDef::new(MigrationLog::OldTableBackupName)
                .string()
                .string_len(100)
                .null(),
        )
        .col(
            ColumnDef::new(MigrationLog::StartId)
                .big_integer()
                .not_null()
                .default(0),
        )
        .col(
            ColumnDef::new(MigrationLog::EndId)
                .big_integer()
                .not_null()
                .default(0),
        )
        .col(
            ColumnDef::new(MigrationLog::TotalRecords)
                .big_integer()
                .not_null()
                .default(0),
        )
        .col(
            ColumnDef::new(MigrationLog::CompletedRecords)
                .big_integer()
                .not_null()
                .default(0),
        )
        .col(
            ColumnDef::new(MigrationLog::Status)
                .integer()
                .not_null()
                .default(0),
        )
        .col(
            ColumnDef::new(MigrationLog::CreatedAt)
                .big_integer()
                .not_null()
                .default(0),
        )
        .to_owned()
}

fn version_log_table() -> TableCreateStatement {
    Table::create()
        .table(VersionLog::Table)
        .if_not_exists()
        .col(
            ColumnDef::new(VersionLog::Id)
                .big_integer()
                .not_null()
                .auto_increment()
                .primary_key(),
        )
        .col(ColumnDef::new(VersionLog::Version).big_integer().not_null())
        .col(
            ColumnDef::new(VersionLog::MigrationName)
                .string()
                .string_len(50)
                .not_null()
                .default(""),
        )
        .col(
            ColumnDef::new(VersionLog::CreatedAt)
                .big_integer()
                .not_null()
                .default(0),
        )
        .index(
            Index::create()
                .unique()
                .name("uk_migration")
                .col(VersionLog::Version)
                .col(VersionLog::MigrationName),
        )
        .to_owned()
}

pub(crate) async fn ensure_migration_log(pool: &MySqlPool) -> Result<()> {
    let statement = migration_log_table().to_string(MysqlQueryBuilder);
    sqlx::query(&statement).execute(pool).await?;

    Ok(())
}

pub(crate) async fn ensure_version_log(pool: &MySqlPool) -> Result<()> {
    let statement = version_log_table().to_string(MysqlQueryBuilder);
    sqlx::query(&statement).execute(pool).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_log_renders_expected_table_name() {
        let sql = migration_log_table().to_string(MysqlQueryBuilder);
        assert!(sql.contains("`gorm_migration_log`"), "{sql}");
        assert!(sql.contains("IF NOT EXISTS"), "{sql}");
        assert!(sql.contains("`old_table_backup_name`"), "{sql}");
    }

    #[test]
    fn version_log_has_unique_guard_index() {
        let sql = version_log_table().to_string(MysqlQueryBuilder);
        assert!(sql.contains("`version_log`"), "{sql}");
        assert!(sql.contains("`uk_migration`"), "{sql}");
        assert!(sql.contains("`migration_name`"), "{sql}");
    }
}
