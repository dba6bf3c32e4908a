use crate::settings;
use anyhow::{Context, Result};
use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tokio::sync::Mutex;
use tracing::info;

/// The process-wide bus connection, owned by the application lifetime.
///
/// Channels are scoped: one is opened per logical operation and closed with
/// it. The connection itself is re-established lazily when it goes away.
static MQ_CONNECTION: Mutex<Option<Connection>> = Mutex::const_new(None);

/// Open a channel on the process-wide connection.
pub async fn create_channel() -> Result<Channel> {
    let mut connection = MQ_CONNECTION.lock().await;
    match connection.as_ref() {
        Some(existing) if existing.status().connected() => {}
        _ => {
            info!("Connecting to the message bus.");
            let new_connection =
                Connection::connect(&settings::get_mq_connection_string(), ConnectionProperties::default())
                    .await
                    .context("Unable to connect to the message bus.")?;
            *connection = Some(new_connection);
        }
    }
    match connection.as_ref() {
        Some(connection) => {
            connection.create_channel().await.context("Unable to open a channel on the message bus.")
        }
        None => unreachable!("the bus connection was just established"),
    }
}

/// Publish a UTF-8 JSON body on a direct exchange.
///
/// The exchange is declared on first use; the channel lives only for this
/// publication.
pub async fn publish(exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
    let channel = create_channel().await?;
    channel
        .exchange_declare(exchange, ExchangeKind::Direct, ExchangeDeclareOptions::default(), FieldTable::default())
        .await?;
    channel
        .basic_publish(exchange, routing_key, BasicPublishOptions::default(), body, BasicProperties::default())
        .await?
        .await?;
    channel.close(200, "Normal shutdown").await.ok();
    Ok(())
}
