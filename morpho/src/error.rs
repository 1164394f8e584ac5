#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("sqlx `{0}`")]
    Sqlx(#[from] sqlx::Error),

    #[error("no database address configured")]
    EmptyAddrs,

    #[error("invalid database address `{0}`")]
    InvalidAddr(String),

    #[error("no alter sql to exec")]
    EmptyAlterSql,

    #[error("show create table {0} failed")]
    ShowCreateTable(String),

    #[error("create new table failed")]
    CreateShadowTable,

    #[error("new table alter failed")]
    ShadowAlter,

    #[error("there is no need to migrate")]
    NoChange,

    #[error("duplicate upgrade step for version {0}")]
    DuplicateVersion(i64),

    #[error("insert version log failed for version {0}")]
    VersionLogInsert(i64),

    #[error("migration `{0}` already applied")]
    AlreadyApplied(String),

    #[error("{0}")]
    Any(#[from] anyhow::Error),
}

impl Error {
    /// Whether this is the once-guard skip sentinel rather than a real failure.
    pub fn is_already_applied(&self) -> bool {
        matches!(self, Error::AlreadyApplied(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
