//! Statement tracing for everything the toolkit executes.
//!
//! Two renderings share one categorization: local debug mode prints
//! colorized lines to the console with the issuing file:line, production
//! mode emits structured [`tracing`] events. A statement is categorized as
//! an error, as slow (elapsed above the configured threshold) or as plain
//! info.

use std::panic::Location;
use std::time::Duration;

use colored::Colorize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Silent,
    Error,
    Warn,
    Info,
}

#[derive(Debug, Clone)]
pub struct SqlLogger {
    pub level: LogLevel,
    pub slow_threshold: Duration,
    /// Suppress `RowNotFound`: an empty lookup is rarely worth an error line.
    pub ignore_not_found: bool,
    pub colorful: bool,
}

impl Default for SqlLogger {
    fn default() -> Self {
        Self {
            level: LogLevel::Error,
            slow_threshold: Duration::from_secs(1),
            ignore_not_found: true,
            colorful: false,
        }
    }
}

impl SqlLogger {
    /// Console logger used when the `debug` config flag is on.
    pub fn local_debug() -> Self {
        Self {
            level: LogLevel::Info,
            colorful: true,
            ..Self::default()
        }
    }

    /// Categorizes one executed statement and renders it.
    ///
    /// `rows` is the affected-row count when the driver reported one; `None`
    /// renders as `-`.
    pub fn trace(
        &self,
        location: &'static Location<'static>,
        elapsed: Duration,
        sql: &str,
        rows: Option<u64>,
        err: Option<&sqlx::Error>,
    ) {
        if self.level == LogLevel::Silent {
            return;
        }

        let sql = strip_escapes(sql);
        let rows = rows.map_or_else(|| "-".to_owned(), |r| r.to_string());
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;

        let reportable_err = err.filter(|e| {
            !(self.ignore_not_found && matches!(**e, sqlx::Error::RowNotFound))
        });

        if let Some(err) = reportable_err.filter(|_| self.level >= LogLevel::Error) {
            if self.colorful {
                println!(
                    "{} {}\n{} {} {}",
                    format!("{}:{}", location.file(), location.line()).red().bold(),
                    err.to_string().magenta().bold(),
                    format!("[{elapsed_ms:.3}ms]").yellow(),
                    format!("[rows:{rows}]").blue().bold(),
                    sql,
                );
            } else {
                tracing::error!(
                    error = %err,
                    line = %location,
                    elapsed_ms,
                    rows = %rows,
                    sql = %sql,
                    "sql error"
                );
            }
        } else if !self.slow_threshold.is_zero()
            && elapsed > self.slow_threshold
            && self.level >= LogLevel::Warn
        {
            if self.colorful {
                println!(
                    "{} {}\n{} {} {}",
                    format!("{}:{}", location.file(), location.line()).green(),
                    format!("SLOW SQL >= {:?}", self.slow_threshold).yellow(),
                    format!("[{elapsed_ms:.3}ms]").red().bold(),
                    format!("[rows:{rows}]").yellow(),
                    sql.magenta(),
                );
            } else {
                tracing::warn!(
                    slow = %format!("SLOW SQL >= {:?}", self.slow_threshold),
                    line = %location,
                    elapsed_ms,
                    rows = %rows,
                    sql = %sql,
                    "sql warn"
                );
            }
        } else if self.level >= LogLevel::Info {
            if self.colorful {
                println!(
                    "{}\n{} {} {}",
                    format!("{}:{}", location.file(), location.line()).green(),
                    format!("[{elapsed_ms:.3}ms]").yellow(),
                    format!("[rows:{rows}]").blue().bold(),
                    sql,
                );
            } else {
                tracing::info!(
                    line = %location,
                    elapsed_ms,
                    rows = %rows,
                    sql = %sql,
                    "sql info"
                );
            }
        }
    }
}

fn strip_escapes(sql: &str) -> String {
    sql.replace(['\r', '\n', '\t'], "")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_escapes_removes_control_characters() {
        let sql = "SELECT *\n\tFROM t\r\nWHERE id = 1";
        assert_eq!(strip_escapes(sql), "SELECT *FROM tWHERE id = 1");
    }

    #[test]
    fn levels_order_silent_to_info() {
        assert!(LogLevel::Silent < LogLevel::Error);
        assert!(LogLevel::Error < LogLevel::Warn);
        assert!(LogLevel::Warn < LogLevel::Info);
    }
}
