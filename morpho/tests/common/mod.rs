use morpho::{Config, Db};
use sqlx::migrate::MigrateDatabase;
use sqlx::MySql;

const HOST: &str = "localhost:3306";

pub fn database_name(key: &str) -> String {
    format!("morpho_{key}")
}

/// Drops and recreates a dedicated database for one test, then connects.
pub async fn create_db(key: &str) -> anyhow::Result<Db> {
    let database = database_name(key);
    let url = format!("mysql://root:root@{HOST}/{database}");

    let _ = MySql::drop_database(&url).await;
    MySql::create_database(&url).await?;

    let db = Db::connect(Config {
        username: "root".into(),
        password: "root".into(),
        addrs: vec![HOST.into()],
        database,
        ..Default::default()
    })
    .await?;

    Ok(db)
}
