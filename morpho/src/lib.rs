//! Online schema evolution for MySQL-family databases.
//!
//! This crate lets an application change the schema of a live,
//! continuously-written table with minimal disruption, keep time-range
//! partitions rolling forward, and drive ordered schema upgrades, all on
//! top of a plain [`sqlx`] MySQL pool.
//!
//! # Components
//!
//! - [`Migration`] / [`MigrationBuilder`] / [`MigrationRegistry`]: online
//!   table migration. Tries the user's `ALTER` with online-DDL hints first;
//!   when the server refuses, builds a shadow table, mirrors application
//!   writes to it through the registry hooks and copies history in the
//!   background, then swaps the tables with an atomic rename.
//! - [`PartitionManager`]: provisions `p<YYYYMMDD>` range partitions up to
//!   three units (day, month or year) ahead and drops partitions older than
//!   the retention window, on a periodic tick.
//! - [`VersionController`]: applies registered upgrade steps in version
//!   order past the recorded high-water mark; [`migrate_once`] guards named
//!   sub-steps so they run at most once per database.
//! - [`Db`] / [`Config`]: connection factory with unbounded connect retry,
//!   read replicas behind a random policy, and statement tracing via
//!   [`SqlLogger`].
//!
//! # Quick start
//!
//! ```rust,ignore
//! use morpho::{Config, Db, MigrationBuilder, MigrationRegistry};
//!
//! let db = Db::connect(Config {
//!     username: "root".into(),
//!     password: "secret".into(),
//!     addrs: vec!["127.0.0.1:3306".into()],
//!     database: "app".into(),
//!     ..Default::default()
//! })
//! .await?;
//!
//! let registry = MigrationRegistry::new();
//! let migration = MigrationBuilder::new(
//!     "device",
//!     "alter table device modify column name varchar(50)",
//! )
//! .register(&db, &registry);
//!
//! migration.start().await?;
//! ```
//!
//! While a migration is in progress the application reports each write it
//! performed, inside the same transaction:
//!
//! ```rust,ignore
//! use morpho::Statement;
//!
//! let mut tx = db.writer().begin().await?;
//! sqlx::query("INSERT INTO device (name) VALUES ('sensor-1')")
//!     .execute(&mut *tx)
//!     .await?;
//!
//! let mut stmt = Statement::new("device", "INSERT INTO device (name) VALUES ('sensor-1')");
//! registry.after_create(&mut tx, &mut stmt).await?;
//! tx.commit().await?;
//! ```
//!
//! # Tables
//!
//! Two bookkeeping tables are created on demand: `gorm_migration_log`
//! (one row per shadow-table migration attempt, tracking the copy window
//! and status) and `version_log` (applied upgrade versions and named
//! once-only sub-steps). Migration target tables must have an integer
//! primary key named `id`.

mod config;
mod error;
pub mod migration;
pub mod partition;
mod pool;
mod schema;
mod trace;
pub mod version;

pub use config::Config;
pub use error::{Error, Result};
pub use migration::{
    Migration, MigrationBuilder, MigrationLogRow, MigrationRegistry, MigrationStatus, Statement,
    StatementHook,
};
pub use partition::{PartitionManager, PartitionUnit, PartitionWorker};
pub use pool::Db;
pub use schema::{MigrationLog, VersionLog};
pub use trace::{LogLevel, SqlLogger};
pub use version::{migrate_once, Install, UpgradeStep, VersionController};
