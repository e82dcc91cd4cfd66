use std::time::Duration;

use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use webssh2_common::{Webssh2Config, Webssh2Error};
use webssh2_db_migrations::migrate_database;

/// Opens (creating if necessary) the embedded host-key store and brings
/// the schema up to date.
pub async fn connect_to_db(config: &Webssh2Config) -> Result<DatabaseConnection, Webssh2Error> {
    let mut abs_path = config.paths_relative_to.clone();
    abs_path.push(&config.store.host_key_verification.server_store.db_path);

    if let Some(parent) = abs_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let path = abs_path
        .to_str()
        .ok_or_else(|| Webssh2Error::Config("host key db path is not valid UTF-8".into()))?;
    let url = format!("sqlite://{path}?mode=rwc");

    connect_to_db_url(&url).await
}

pub async fn connect_to_db_url(url: &str) -> Result<DatabaseConnection, Webssh2Error> {
    let mut opt = ConnectOptions::new(url.to_owned());
    opt.max_connections(10)
        .connect_timeout(Duration::from_secs(8))
        .sqlx_logging(false);

    let connection = Database::connect(opt)
        .await
        .map_err(|e| Webssh2Error::Database(e.to_string()))?;

    migrate_database(&connection)
        .await
        .map_err(|e| Webssh2Error::Database(e.to_string()))?;
    Ok(connection)
}
