//! Time-range partition maintenance for MySQL tables.
//!
//! Works against tables partitioned `BY RANGE` on a unix-timestamp column,
//! with partitions named `p<YYYYMMDD>` bounded by
//! `UNIX_TIMESTAMP('<YYYY-MM-DD>')`. The manager keeps the next three units
//! (day, month or year) provisioned ahead of the write frontier and drops
//! partitions that fell out of the retention window.
//!
//! ```rust,ignore
//! let worker = PartitionManager::new(&db, "telemetry", "device_metrics")
//!     .unit(PartitionUnit::Month)
//!     .retention_months(6)
//!     .start();
//!
//! // on application shutdown
//! worker.shutdown().await?;
//! ```

use std::time::Duration;

use chrono::{Datelike, Days, Months, NaiveDate, Utc};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, timeout, Instant};

use crate::error::Result;
use crate::pool::Db;

const MIN_CRON_DURATION: Duration = Duration::from_secs(10);
const TICK_TIMEOUT: Duration = Duration::from_secs(30);

/// How far one partition stretches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionUnit {
    Day,
    Month,
    Year,
}

pub struct PartitionManager {
    db: Db,
    database: String,
    table: String,
    unit: PartitionUnit,
    retention_months: u32,
    cron_duration: Duration,
}

impl PartitionManager {
    pub fn new(db: &Db, database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            db: db.clone(),
            database: database.into(),
            table: table.into(),
            unit: PartitionUnit::Month,
            retention_months: 0,
            cron_duration: Duration::from_secs(3600),
        }
    }

    pub fn unit(mut self, unit: PartitionUnit) -> Self {
        self.unit = unit;

        self
    }

    /// Months of history to keep; 0 disables expiry.
    pub fn retention_months(mut self, months: u32) -> Self {
        self.retention_months = months;

        self
    }

    /// Maintenance interval, floored to 10 seconds.
    pub fn cron_duration(mut self, duration: Duration) -> Self {
        self.cron_duration = duration.max(MIN_CRON_DURATION);

        self
    }

    /// All partition names currently defined for the table.
    pub async fn list(&self) -> Result<Vec<String>> {
        let partitions = sqlx::query_scalar::<_, String>(
            "SELECT PARTITION_NAME FROM information_schema.PARTITIONS \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND PARTITION_NAME IS NOT NULL",
        )
        .bind(&self.database)
        .bind(&self.table)
        .fetch_all(self.db.reader())
        .await?;

        Ok(partitions)
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.list().await?.iter().any(|p| p == name))
    }

    /// Creates the partitions for the next three units after `today`,
    /// skipping any that already exist.
    pub async fn provision(&self, today: NaiveDate) -> Result<()> {
        let existing = self.list().await?;

        for boundary in unit_boundaries(self.unit, today) {
            let name = partition_name(boundary);
            if existing.iter().any(|p| p == &name) {
                continue;
            }

            let sql = format!(
                "ALTER TABLE `{}` ADD PARTITION (PARTITION {} VALUES LESS THAN (UNIX_TIMESTAMP('{}')))",
                self.table,
                name,
                boundary.format("%Y-%m-%d"),
            );
            self.db.execute(&sql).await?;

            tracing::info!(table = %self.table, partition = %name, "partition added");
        }

        Ok(())
    }

    /// Drops every `p<digits>` partition older than the retention cutoff.
    ///
    /// A failed drop is logged and the sweep moves on; the partition gets
    /// another chance on the next tick.
    pub async fn drop_expired(&self, today: NaiveDate) -> Result<()> {
        let Some(cutoff) = expiry_cutoff(today, self.retention_months) else {
            return Ok(());
        };

        for partition in self.list().await? {
            let Some(num) = partition
                .strip_prefix('p')
                .and_then(|digits| digits.parse::<u32>().ok())
            else {
                continue;
            };

            if num < cutoff {
                let sql = format!("ALTER TABLE `{}` DROP PARTITION {partition}", self.table);
                if let Err(err) = self.db.execute(&sql).await {
                    tracing::error!(
                        table = %self.table,
                        partition = %partition,
                        error = %err,
                        "drop partition failed"
                    );
                } else {
                    tracing::info!(table = %self.table, partition = %partition, "partition dropped");
                }
            }
        }

        Ok(())
    }

    async fn tick(&self, today: NaiveDate) -> Result<()> {
        self.provision(today).await?;
        self.drop_expired(today).await
    }

    /// Spawns the maintenance worker.
    ///
    /// The first tick fires immediately and provisions ahead of "now";
    /// every subsequent tick re-provisions and sweeps expired partitions.
    /// Each tick is bounded by a 30 second deadline.
    pub fn start(self) -> PartitionWorker {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let task_handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now(), self.cron_duration);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => {
                        tracing::info!(table = %self.table, "partition manager received shutdown signal");
                        break;
                    }
                    _ = interval.tick() => {
                        let today = Utc::now().date_naive();
                        match timeout(TICK_TIMEOUT, self.tick(today)).await {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => {
                                tracing::error!(table = %self.table, error = %err, "partition maintenance failed");
                            }
                            Err(_) => {
                                tracing::error!(table = %self.table, "partition maintenance timed out");
                            }
                        }
                    }
                }
            }
        });

        PartitionWorker {
            task_handle,
            shutdown_tx,
        }
    }
}

/// Handle to a running partition maintenance worker.
pub struct PartitionWorker {
    task_handle: JoinHandle<()>,
    shutdown_tx: oneshot::Sender<()>,
}

impl PartitionWorker {
    /// Signals the worker to stop and waits for the current tick to finish.
    pub async fn shutdown(self) -> std::result::Result<(), tokio::task::JoinError> {
        let _ = self.shutdown_tx.send(());

        self.task_handle.await
    }
}

/// Start dates of the next three units strictly after `today`.
fn unit_boundaries(unit: PartitionUnit, today: NaiveDate) -> Vec<NaiveDate> {
    (1..=3)
        .filter_map(|offset| unit_start_after(unit, today, offset))
        .collect()
}

fn unit_start_after(unit: PartitionUnit, today: NaiveDate, offset: u32) -> Option<NaiveDate> {
    match unit {
        PartitionUnit::Day => today.checked_add_days(Days::new(u64::from(offset))),
        PartitionUnit::Month => today
            .with_day(1)?
            .checked_add_months(Months::new(offset)),
        PartitionUnit::Year => NaiveDate::from_ymd_opt(today.year() + offset as i32, 1, 1),
    }
}

fn partition_name(boundary: NaiveDate) -> String {
    format!("p{}", boundary.format("%Y%m%d"))
}

/// `YYYYMMDD` integer below which partitions are expired, or `None` when
/// retention is disabled.
fn expiry_cutoff(today: NaiveDate, retention_months: u32) -> Option<u32> {
    if retention_months == 0 {
        return None;
    }

    let earliest = today
        .with_day(1)?
        .checked_sub_months(Months::new(retention_months - 1))?;

    earliest.format("%Y%m%d").to_string().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn month_boundaries_from_mid_month() {
        let boundaries = unit_boundaries(PartitionUnit::Month, date(2025, 1, 15));
        let names: Vec<_> = boundaries.into_iter().map(partition_name).collect();
        assert_eq!(names, ["p20250201", "p20250301", "p20250401"]);
    }

    #[test]
    fn day_boundaries_cross_month_end() {
        let boundaries = unit_boundaries(PartitionUnit::Day, date(2024, 12, 30));
        let names: Vec<_> = boundaries.into_iter().map(partition_name).collect();
        assert_eq!(names, ["p20241231", "p20250101", "p20250102"]);
    }

    #[test]
    fn year_boundaries_start_january_first() {
        let boundaries = unit_boundaries(PartitionUnit::Year, date(2025, 6, 1));
        let names: Vec<_> = boundaries.into_iter().map(partition_name).collect();
        assert_eq!(names, ["p20260101", "p20270101", "p20280101"]);
    }

    #[test]
    fn cutoff_keeps_retention_window() {
        assert_eq!(expiry_cutoff(date(2025, 1, 15), 3), Some(20241101));
        assert_eq!(expiry_cutoff(date(2025, 3, 1), 1), Some(20250301));
        assert_eq!(expiry_cutoff(date(2025, 1, 15), 0), None);
    }

    #[test]
    fn boundary_dates_format_as_sql_date() {
        assert_eq!(
            date(2025, 2, 1).format("%Y-%m-%d").to_string(),
            "2025-02-01"
        );
    }
}
