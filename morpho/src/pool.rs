//! Connection factory and the shared database handle.
//!
//! [`Db`] wraps a writer pool plus optional read replicas. The first address
//! of [`Config::addrs`] is the primary; reads are spread over the remaining
//! addresses with a random policy. Connecting retries transient failures
//! indefinitely with exponential backoff, logging every attempt.

use std::future::Future;
use std::panic::Location;
use std::sync::Arc;
use std::time::{Duration, Instant};

use backon::{ExponentialBuilder, Retryable};
use rand::Rng;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlQueryResult};
use sqlx::MySqlConnection;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::trace::SqlLogger;

#[derive(Debug, Clone)]
pub struct Db {
    writer: MySqlPool,
    replicas: Arc<Vec<MySqlPool>>,
    logger: Arc<SqlLogger>,
}

impl Db {
    /// Opens the writer pool and one pool per replica address.
    pub async fn connect(config: Config) -> Result<Self> {
        let mut config = config;
        if config.charset.is_empty() {
            config.charset = "utf8mb4".to_owned();
        }
        if config.max_idle_conns == 0 {
            config.max_idle_conns = 2;
        }

        let logger = if config.debug {
            SqlLogger::local_debug()
        } else {
            SqlLogger::default()
        };

        if config.addrs.is_empty() {
            return Err(Error::EmptyAddrs);
        }

        let mut pools = Vec::with_capacity(config.addrs.len());
        for addr in &config.addrs {
            let options = connect_options(&config, addr)?;
            pools.push(connect_pool(&config, options).await?);
        }

        let mut pools = pools.into_iter();
        let writer = pools.next().ok_or(Error::EmptyAddrs)?;

        Ok(Self {
            writer,
            replicas: Arc::new(pools.collect()),
            logger: Arc::new(logger),
        })
    }

    /// The primary pool; every write and all control-plane work goes here.
    pub fn writer(&self) -> &MySqlPool {
        &self.writer
    }

    /// A replica pool picked at random, or the writer when none exist.
    pub fn reader(&self) -> &MySqlPool {
        if self.replicas.is_empty() {
            return &self.writer;
        }

        let index = rand::thread_rng().gen_range(0..self.replicas.len());
        &self.replicas[index]
    }

    pub fn logger(&self) -> &SqlLogger {
        &self.logger
    }

    /// Executes `sql` on the writer pool, feeding the statement tracer.
    #[track_caller]
    pub fn execute<'a>(
        &'a self,
        sql: &'a str,
    ) -> impl Future<Output = Result<MySqlQueryResult>> + 'a {
        let location = Location::caller();

        async move {
            let started = Instant::now();
            let res = sqlx::query(sql).execute(&self.writer).await;
            self.logger.trace(
                location,
                started.elapsed(),
                sql,
                res.as_ref().ok().map(|r| r.rows_affected()),
                res.as_ref().err(),
            );

            Ok(res?)
        }
    }

    /// Executes `sql` on an already-acquired connection or open transaction,
    /// feeding the statement tracer.
    #[track_caller]
    pub fn execute_on<'a>(
        &'a self,
        conn: &'a mut MySqlConnection,
        sql: &'a str,
    ) -> impl Future<Output = Result<MySqlQueryResult>> + 'a {
        let location = Location::caller();

        async move {
            let started = Instant::now();
            let res = sqlx::query(sql).execute(&mut *conn).await;
            self.logger.trace(
                location,
                started.elapsed(),
                sql,
                res.as_ref().ok().map(|r| r.rows_affected()),
                res.as_ref().err(),
            );

            Ok(res?)
        }
    }
}

fn connect_options(config: &Config, addr: &str) -> Result<MySqlConnectOptions> {
    let (host, port) = match addr.split_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| Error::InvalidAddr(addr.to_owned()))?;
            (host, port)
        }
        None => (addr, 3306),
    };

    Ok(MySqlConnectOptions::new()
        .host(host)
        .port(port)
        .username(&config.username)
        .password(&config.password)
        .database(&config.database)
        .charset(&config.charset))
}

fn pool_options(config: &Config) -> MySqlPoolOptions {
    let mut options = MySqlPoolOptions::new()
        .min_connections(config.max_idle_conns)
        .acquire_timeout(Duration::from_secs(5));

    if config.max_open_conns > 0 {
        options = options.max_connections(config.max_open_conns);
    }
    if config.max_lifetime > 0 {
        options = options.max_lifetime(Duration::from_secs(config.max_lifetime));
    }
    if config.max_idle_time > 0 {
        options = options.idle_timeout(Duration::from_secs(config.max_idle_time));
    }

    options
}

async fn connect_pool(config: &Config, options: MySqlConnectOptions) -> Result<MySqlPool> {
    let pool_options = pool_options(config);

    let pool = (|| {
        let pool_options = pool_options.clone();
        let options = options.clone();
        async move { pool_options.connect_with(options).await }
    })
    .retry(ExponentialBuilder::default().without_max_times())
    .sleep(tokio::time::sleep)
    .notify(|err: &sqlx::Error, dur: Duration| {
        tracing::error!(error = %err, duration = ?dur, "mysql connection failed, retry...");
    })
    .await?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_parsing_defaults_the_port() {
        let config = Config {
            username: "root".into(),
            charset: "utf8mb4".into(),
            ..Default::default()
        };

        assert!(connect_options(&config, "127.0.0.1:13306").is_ok());
        assert!(connect_options(&config, "db.internal").is_ok());
        assert!(matches!(
            connect_options(&config, "db.internal:not-a-port"),
            Err(Error::InvalidAddr(_))
        ));
    }
}
