//! Versioned schema upgrades with once-only guards.
//!
//! Upgrade steps are registered explicitly with their integer version and
//! applied in ascending order past the recorded high-water mark. A fresh
//! database (empty `version_log`) runs the install routine instead, which
//! creates the newest schema directly; every registered version is then
//! recorded as applied.
//!
//! ```rust,ignore
//! VersionController::new(&db)
//!     .install(CreateSchema)
//!     .step(AddDeviceIndex)      // version 1
//!     .step(SplitAddressColumn)  // version 2
//!     .upgrade()
//!     .await?;
//! ```
//!
//! Inside a step, [`migrate_once`] guards named sub-steps that must never
//! run twice, claiming a `(version, name)` row under the table's unique
//! constraint before executing the user function.

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{Error, Result};
use crate::pool::Db;
use crate::schema;

/// One schema upgrade, applied when the database is below its version.
#[async_trait]
pub trait UpgradeStep: Send + Sync {
    fn version(&self) -> i64;

    async fn run(&self, db: &Db) -> anyhow::Result<()>;
}

/// Fresh-database installation: creates the newest schema in one go.
#[async_trait]
pub trait Install: Send + Sync {
    async fn run(&self, db: &Db) -> anyhow::Result<()>;
}

pub struct VersionController {
    db: Db,
    steps: Vec<Box<dyn UpgradeStep>>,
    install: Option<Box<dyn Install>>,
}

impl VersionController {
    pub fn new(db: &Db) -> Self {
        Self {
            db: db.clone(),
            steps: Vec::new(),
            install: None,
        }
    }

    pub fn step(mut self, step: impl UpgradeStep + 'static) -> Self {
        self.steps.push(Box::new(step));

        self
    }

    pub fn install(mut self, install: impl Install + 'static) -> Self {
        self.install = Some(Box::new(install));

        self
    }

    /// Applies every registered step beyond the recorded high-water mark.
    ///
    /// A step failure aborts the run and leaves its version uncommitted, so
    /// the next `upgrade` retries from there.
    #[tracing::instrument(skip_all)]
    pub async fn upgrade(&self) -> Result<()> {
        schema::ensure_version_log(self.db.writer()).await?;

        let mut ordered: Vec<&dyn UpgradeStep> = self.steps.iter().map(|step| &**step).collect();
        ordered.sort_by_key(|step| step.version());

        for pair in ordered.windows(2) {
            if pair[0].version() == pair[1].version() {
                return Err(Error::DuplicateVersion(pair[0].version()));
            }
        }

        let mark: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM version_log")
            .fetch_one(self.db.writer())
            .await?;
        let mark = mark.unwrap_or(0);

        if mark == 0 && !ordered.is_empty() {
            if let Some(install) = &self.install {
                tracing::info!("empty version log, running install");
                install.run(&self.db).await?;

                for step in &ordered {
                    self.record_version(step.version()).await?;
                }

                return Ok(());
            }
        }

        for step in &ordered {
            if step.version() <= mark {
                continue;
            }

            tracing::info!(version = step.version(), "applying upgrade step");
            step.run(&self.db).await?;
            self.record_version(step.version()).await?;
        }

        Ok(())
    }

    async fn record_version(&self, version: i64) -> Result<()> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM version_log WHERE version = ? AND migration_name = ''",
        )
        .bind(version)
        .fetch_one(self.db.writer())
        .await?;

        if count > 0 {
            return Ok(());
        }

        sqlx::query(
            "INSERT INTO version_log (version, migration_name, created_at) VALUES (?, '', ?)",
        )
        .bind(version)
        .bind(Utc::now().timestamp())
        .execute(self.db.writer())
        .await?;

        Ok(())
    }
}

/// Runs `f` at most once per database for the given `(version, name)` pair.
///
/// The `version_log` row is inserted first, inside the transaction, so the
/// unique constraint arbitrates concurrent callers; when `f` fails the
/// transaction rolls back and no row survives. A pair that already ran
/// yields [`Error::AlreadyApplied`], a skip signal rather than a failure.
pub async fn migrate_once<F, Fut>(db: &Db, version: i64, name: &str, f: F) -> Result<()>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = anyhow::Result<()>>,
{
    schema::ensure_version_log(db.writer()).await?;

    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM version_log WHERE version = ? AND migration_name = ?",
    )
    .bind(version)
    .bind(name)
    .fetch_one(db.writer())
    .await?;

    if count > 0 {
        return Err(Error::AlreadyApplied(name.to_owned()));
    }

    let mut tx = db.writer().begin().await?;

    let inserted = sqlx::query(
        "INSERT INTO version_log (version, migration_name, created_at) VALUES (?, ?, ?)",
    )
    .bind(version)
    .bind(name)
    .bind(Utc::now().timestamp())
    .execute(&mut *tx)
    .await?
    .rows_affected();

    if inserted < 1 {
        return Err(Error::VersionLogInsert(version));
    }

    f().await?;

    tx.commit().await?;

    Ok(())
}
