use crate::settings;
use anyhow::{Context, Result};
use deadpool::managed::{Manager, Metrics, Object, Pool, RecycleError, RecycleResult};
use std::str::FromStr;
use std::sync::Arc;
use tokio_postgres::{Client, Config, NoTls};
use tracing::{error, info};

const SETUP_SQL_SCRIPT: &str = include_str!("../assets/setup.sql");

pub type ConnectionPool = Pool<ConnectionManager>;
pub type ConnectionGuard = Object<ConnectionManager>;

/// Connect to a PostgreSQL database, driving the connection on its own task.
pub async fn connect(conn_string: &str) -> std::result::Result<Client, tokio_postgres::Error> {
    let config = Config::from_str(conn_string)?;
    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            error!("Database connection error: {}", e);
        }
    });
    Ok(client)
}

pub struct ConnectionManager {
    pub conn_string: String,
}

impl Manager for ConnectionManager {
    type Type = Client;
    type Error = tokio_postgres::Error;

    async fn create(&self) -> std::result::Result<Client, Self::Error> {
        connect(&self.conn_string).await
    }

    async fn recycle(&self, client: &mut Client, _: &Metrics) -> RecycleResult<Self::Error> {
        client.simple_query("SELECT 1").await.map(|_| ()).map_err(|e| {
            error!("Failed to recycle connection into the pool: {}", e);
            RecycleError::Backend(e)
        })
    }
}

/// Initialize the operational database.
///
/// Bootstraps the schema when it does not exist yet and returns the
/// connection pool used by the service.
pub async fn init() -> Result<Arc<ConnectionPool>> {
    let conn_string = settings::get_db_connection_string();
    let client = connect(&conn_string).await.context("Unable to connect to the operational database.")?;
    client.batch_execute(SETUP_SQL_SCRIPT).await.context("Unable to initialize the operational schema.")?;
    info!("Operational database ready.");

    match ConnectionPool::builder(ConnectionManager { conn_string }).build() {
        Ok(pool) => Ok(Arc::new(pool)),
        Err(e) => Err(anyhow::Error::from(e)).context("Unable to create the operational database connection pool."),
    }
}
