use crate::models::{PublishOutcome, PublishRequest, PublishStatus};
use crate::resources::queries;
use crate::server::state::ServerState;
use crate::{materialize, mq, settings, Result};
use anyhow::{anyhow, bail, Context};
use drivers::ClickHouseHttp;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicRejectOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::ExchangeKind;
use std::time::Duration;
use tracing::{error, info, warn};

/// Delay before the consumer loop is restarted after a connection failure.
const RESTART_BACKOFF: Duration = Duration::from_millis(500);

/// Page size used to drain a materialized result table.
const READ_PAGE_SIZE: i64 = 1000;

type ResultRow = serde_json::Map<String, serde_json::Value>;

/// Supervise the publish consumer for the lifetime of the process.
///
/// The consumer loop is restarted indefinitely with a small backoff; a lost
/// bus connection only costs the requests delivered while it was down.
pub fn spawn_publish_worker(state: ServerState) {
    tokio::spawn(async move {
        loop {
            if let Err(e) = run_consumer(&state).await {
                warn!("Publish consumer stopped: {:#}", e);
            }
            tokio::time::sleep(RESTART_BACKOFF).await;
        }
    });
}

async fn run_consumer(state: &ServerState) -> Result<()> {
    let channel = mq::create_channel().await?;
    let exchange = settings::get_publish_exchange();
    channel
        .exchange_declare(&exchange, ExchangeKind::Direct, ExchangeDeclareOptions::default(), FieldTable::default())
        .await?;

    let request_queue = settings::get_publish_request_queue();
    channel.queue_declare(&request_queue, QueueDeclareOptions::default(), FieldTable::default()).await?;
    channel.queue_bind(&request_queue, &exchange, "task", QueueBindOptions::default(), FieldTable::default()).await?;

    // Outcomes go out on the same exchange under the result binding.
    let result_queue = settings::get_publish_result_queue();
    channel.queue_declare(&result_queue, QueueDeclareOptions::default(), FieldTable::default()).await?;
    channel.queue_bind(&result_queue, &exchange, "result", QueueBindOptions::default(), FieldTable::default()).await?;

    info!("Publish worker consuming from {}", request_queue);
    let mut consumer = channel
        .basic_consume(&request_queue, "publish_worker", BasicConsumeOptions::default(), FieldTable::default())
        .await?;
    while let Some(delivery) = consumer.next().await {
        let delivery = delivery?;
        match handle_publish_request(state, &delivery.data).await {
            Ok(()) => delivery.ack(BasicAckOptions::default()).await?,
            // At-most-once: a failed request is never requeued.
            Err(e) => {
                error!("Publish request failed: {:#}", e);
                delivery.reject(BasicRejectOptions { requeue: false }).await?;
            }
        }
    }
    Ok(())
}

async fn handle_publish_request(state: &ServerState, body: &[u8]) -> Result<()> {
    let request: PublishRequest = serde_json::from_slice(body).context("Malformed publish request.")?;
    let result = publish_result_set(state, &request).await;
    let status = match &result {
        Ok(()) => PublishStatus::Published,
        Err(e) => {
            error!("Failed to publish {} as {}: {:#}", request.guid, request.publish_name, e);
            PublishStatus::Error
        }
    };
    let outcome = PublishOutcome { guid: request.guid.clone(), status };
    if let Err(e) = mq::publish(&settings::get_publish_exchange(), "result", &serde_json::to_vec(&outcome)?).await {
        error!("Failed to publish the outcome for {}: {:#}", request.guid, e);
    }
    result
}

async fn publish_result_set(state: &ServerState, request: &PublishRequest) -> Result<()> {
    validate_publish_name(&request.publish_name)?;

    let conn = state.get_db_connection().await?;
    let query = queries::get_by_guid(&*conn, &request.guid)
        .await?
        .ok_or_else(|| anyhow!("Query {} does not exist.", request.guid))?;
    if query.identity_id != request.identity_id {
        bail!("Query {} is not visible to identity {}.", request.guid, request.identity_id);
    }
    let table = query
        .destinations
        .iter()
        .find(|dest| dest.dest_type == "table")
        .and_then(|dest| dest.path.clone())
        .ok_or_else(|| anyhow!("Query {} has no materialized table destination.", request.guid))?;

    let mut rows: Vec<ResultRow> = Vec::new();
    let mut offset = 0i64;
    loop {
        let page = materialize::table::read_result_page(&table, READ_PAGE_SIZE, offset).await?;
        let page_len = page.len() as i64;
        rows.extend(page);
        if page_len < READ_PAGE_SIZE {
            break;
        }
        offset += page_len;
    }

    let analytics = ClickHouseHttp::new(&settings::get_clickhouse_connection_string())?;
    let database = analytics.database().unwrap_or("default").to_string();
    create_publish_table(&analytics, &database, &request.publish_name, &rows).await?;

    let body = jsoneachrow_body(rows)?;
    analytics
        .run_with_body(&format!("INSERT INTO `{database}`.`{}` FORMAT JSONEachRow", request.publish_name), body)
        .await?;
    Ok(())
}

/// Create (or replace) the publish table with a schema inferred by the
/// analytics store itself from a two-row JSON probe.
async fn create_publish_table(
    analytics: &ClickHouseHttp,
    database: &str,
    publish_name: &str,
    rows: &[ResultRow],
) -> Result<()> {
    let probe: Vec<String> =
        rows.iter().take(2).map(serde_json::to_string).collect::<std::result::Result<_, _>>()?;
    if probe.is_empty() {
        bail!("Cannot infer a schema from an empty result set.");
    }
    let described = analytics
        .run("DESC format(JSONEachRow, {probe:String}) FORMAT TSV", &[("param_probe", &probe.join("\n"))])
        .await?;
    let schema = parse_probe_schema(&described);
    if schema.is_empty() {
        bail!("The analytics store returned an empty schema for the probe.");
    }
    let ddl = format!(
        "CREATE OR REPLACE TABLE `{database}`.`{publish_name}` (id UInt64, {}) ENGINE MergeTree() ORDER BY id",
        schema.join(",")
    );
    analytics.run(&ddl, &[]).await?;
    Ok(())
}

/// Check whether a publish table exists in the analytics store.
pub async fn publish_table_exists(publish_name: &str) -> Result<bool> {
    validate_publish_name(publish_name)?;
    let analytics = ClickHouseHttp::new(&settings::get_clickhouse_connection_string())?;
    let database = analytics.database().unwrap_or("default").to_string();
    let body = analytics
        .run(
            "EXISTS TABLE {db:Identifier}.{table:Identifier} FORMAT TSV",
            &[("param_db", database.as_str()), ("param_table", publish_name)],
        )
        .await?;
    Ok(body.trim() == "1")
}

/// `name type` pairs as reported by `DESC format(...)`.
fn parse_probe_schema(described: &str) -> Vec<String> {
    described
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let mut fields = line.split('\t');
            let name = fields.next().unwrap_or_default();
            let type_ = fields.next().unwrap_or_default();
            format!("{name} {type_}")
        })
        .collect()
}

/// One JSON document per line, each row numbered with a generated `id`.
fn jsoneachrow_body(rows: Vec<ResultRow>) -> Result<String> {
    let mut body = String::new();
    for (i, mut row) in rows.into_iter().enumerate() {
        row.insert("id".to_string(), serde_json::Value::from(i as u64 + 1));
        body.push_str(&serde_json::to_string(&row)?);
        body.push('\n');
    }
    Ok(body)
}

/// The publish name lands inside DDL, so it is restricted to identifier
/// characters instead of being escaped.
fn validate_publish_name(name: &str) -> Result<()> {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        bail!("Invalid publish name: {name}");
    }
    Ok(())
}
