use serde::Deserialize;

/// Connection settings for a MySQL server group.
///
/// The first entry of `addrs` is the primary and receives every write; any
/// remaining entries are read replicas picked by a random policy. Zero values
/// keep the driver defaults, except `max_idle_conns` which falls back to 2.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub username: String,
    pub password: String,
    /// `host:port` addresses; `addrs[0]` is the primary, the rest replicas.
    pub addrs: Vec<String>,
    pub database: String,
    /// Connection character set, `utf8mb4` when empty.
    pub charset: String,
    /// Local debug mode: colorized statement tracing on the console.
    pub debug: bool,
    pub max_open_conns: u32,
    /// Maximum connection lifetime in seconds.
    pub max_lifetime: u64,
    /// Idle connections kept in the pool, 2 when unspecified.
    pub max_idle_conns: u32,
    /// Maximum idle time in seconds before a connection is reaped.
    pub max_idle_time: u64,
}
