use crate::materialize::{MaterializeError, MaterializedDestination, Materializer};
use crate::models::QueryExecution;
use crate::{db, settings, Result};
use drivers::staging::{self, RecordValue, StagingError};
use futures::future::BoxFuture;
use rand::Rng;
use std::path::Path;
use tokio_postgres::Transaction;
use tracing::info;

/// Ordering column added to every result table; pagination is deterministic
/// because it is a strictly increasing sequence.
pub const ORDER_KEY: &str = "__dwh_seq__";

const INSERT_BATCH_SIZE: usize = 100;

const SECRET_LEN: usize = 8;
// No quoting characters: the secret is embedded in a CREATE USER statement.
const SECRET_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+-=/,.";

/// Materializes a staging file into a `results_<id>` table of the results
/// store, readable by a per-query user with a generated secret.
pub struct TableMaterializer;

impl Materializer for TableMaterializer {
    fn materialize<'a>(
        &'a self,
        query: &'a QueryExecution,
        staging_path: &'a Path,
    ) -> BoxFuture<'a, std::result::Result<MaterializedDestination, MaterializeError>> {
        Box::pin(async move {
            let mut reader = staging::open(staging_path).await?;
            let (names, types) = reader.read_header().await?;
            if names.iter().any(|name| name == ORDER_KEY) {
                return Err(MaterializeError::ReservedColumnName(ORDER_KEY.to_string()));
            }

            let table_name = format!("results_{}", query.id);
            let user = format!("sdwh_run_{}", query.id);
            let secret = generate_secret();

            let mut client =
                db::connect(&settings::get_db_connection_string_results()).await.map_err(backend_error)?;

            // One transaction for the table, the grant and the inserts: a
            // failure mid-stream leaves no partial result visible.
            let tx = client.transaction().await.map_err(backend_error)?;

            let ddl = compose_ddl(&table_name, &names, &types);
            info!("DDL for query {}: {}", query.guid, ddl);
            tx.batch_execute(&ddl).await.map_err(backend_error)?;
            tx.batch_execute(&format!(
                "CREATE USER {} WITH PASSWORD '{}'; GRANT SELECT ON {} TO {};",
                quote_ident(&user),
                secret,
                quote_ident(&table_name),
                quote_ident(&user),
            ))
            .await
            .map_err(backend_error)?;

            let mut batch: Vec<Vec<RecordValue>> = Vec::with_capacity(INSERT_BATCH_SIZE);
            loop {
                match reader.read_record().await {
                    Ok(row) => {
                        if row.len() != names.len() {
                            return Err(MaterializeError::Backend(format!(
                                "staged row carries {} values for {} columns",
                                row.len(),
                                names.len()
                            )));
                        }
                        batch.push(row);
                        if batch.len() == INSERT_BATCH_SIZE {
                            insert_many(&tx, &table_name, &names, &batch).await?;
                            batch.clear();
                        }
                    }
                    Err(StagingError::Eof) => break,
                    Err(e) => return Err(e.into()),
                }
            }
            if !batch.is_empty() {
                insert_many(&tx, &table_name, &names, &batch).await?;
            }
            tx.commit().await.map_err(backend_error)?;

            let access_creds = serde_json::json!({ "user": user, "pass": secret }).to_string();
            Ok(MaterializedDestination { path: table_name, access_creds })
        })
    }
}

/// Read one page of a materialized result table.
///
/// Rows come back as column-named mappings ordered by the sequence column,
/// which is stripped from the output. No authorization happens here.
pub async fn read_result_page(
    table_name: &str,
    limit: i64,
    offset: i64,
) -> Result<Vec<serde_json::Map<String, serde_json::Value>>> {
    let client = db::connect(&settings::get_db_connection_string_results()).await?;
    let sql = format!(
        "SELECT * FROM {} ORDER BY {} LIMIT $1 OFFSET $2",
        quote_ident(table_name),
        quote_ident(ORDER_KEY)
    );
    let rows = client.query(sql.as_str(), &[&limit, &offset]).await?;

    let mut result = Vec::with_capacity(rows.len());
    for row in &rows {
        let values = drivers::postgres::value::record_from_row(row)?;
        let mut item = serde_json::Map::new();
        for (column, value) in row.columns().iter().zip(values.iter()) {
            if column.name() == ORDER_KEY {
                continue;
            }
            item.insert(column.name().to_string(), record_value_to_json(value));
        }
        result.push(item);
    }
    Ok(result)
}

/// Drop the result tables behind the given destination paths.
///
/// A single statement over the comma-joined identifier list; an empty list
/// is a no-op. The per-query roles are left in place.
pub async fn delete_query_execs(paths: &[String]) -> Result<()> {
    if paths.is_empty() {
        return Ok(());
    }
    let client = db::connect(&settings::get_db_connection_string_results()).await?;
    let tables: Vec<String> = paths.iter().map(|path| quote_ident(path)).collect();
    client.batch_execute(&format!("DROP TABLE IF EXISTS {}", tables.join(","))).await?;
    Ok(())
}

fn compose_ddl(table_name: &str, names: &[String], types: &[String]) -> String {
    let mut fields = vec![format!("{} BIGSERIAL PRIMARY KEY", quote_ident(ORDER_KEY))];
    for (i, name) in names.iter().enumerate() {
        let type_ = types.get(i).map(String::as_str).unwrap_or("text");
        fields.push(format!("{} {} NULL", quote_ident(name), type_));
    }
    format!("CREATE TABLE IF NOT EXISTS {} ({})", quote_ident(table_name), fields.join(","))
}

async fn insert_many(
    tx: &Transaction<'_>,
    table_name: &str,
    names: &[String],
    records: &[Vec<RecordValue>],
) -> std::result::Result<(), MaterializeError> {
    let columns: Vec<String> = names.iter().map(|name| quote_ident(name)).collect();
    let mut values = Vec::with_capacity(records.len());
    for record in records {
        let row: Vec<String> = record.iter().map(sql_literal).collect();
        values.push(format!("({})", row.join(",")));
    }
    let sql =
        format!("INSERT INTO {} ({}) VALUES {}", quote_ident(table_name), columns.join(","), values.join(","));
    tx.batch_execute(&sql).await.map_err(backend_error)?;
    Ok(())
}

fn backend_error(e: tokio_postgres::Error) -> MaterializeError {
    match e.as_db_error() {
        Some(db_error) => MaterializeError::Backend(db_error.message().to_string()),
        None => MaterializeError::Backend(e.to_string()),
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Render a staged value as a SQL literal; the column type drives the cast.
fn sql_literal(value: &RecordValue) -> String {
    match value {
        RecordValue::Null => "NULL".to_string(),
        RecordValue::Bool(true) => "TRUE".to_string(),
        RecordValue::Bool(false) => "FALSE".to_string(),
        RecordValue::Int(v) => v.to_string(),
        RecordValue::UInt(v) => v.to_string(),
        RecordValue::Float(v) if v.is_nan() => "'NaN'".to_string(),
        RecordValue::Float(v) if v.is_infinite() && *v > 0.0 => "'Infinity'".to_string(),
        RecordValue::Float(v) if v.is_infinite() => "'-Infinity'".to_string(),
        RecordValue::Float(v) => v.to_string(),
        // The literal string "None" denotes NULL, a convention the staged
        // result sets inherit from their producers.
        RecordValue::Text(s) if s == "None" => "NULL".to_string(),
        RecordValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
        RecordValue::Bytes(b) => format!("'\\x{}'", hex::encode(b)),
        RecordValue::Timestamp(ts) => format!("'{}'", ts.format("%Y-%m-%d %H:%M:%S%.6f+00")),
    }
}

fn generate_secret() -> String {
    let mut rng = rand::thread_rng();
    (0..SECRET_LEN).map(|_| SECRET_CHARSET[rng.gen_range(0..SECRET_CHARSET.len())] as char).collect()
}

fn record_value_to_json(value: &RecordValue) -> serde_json::Value {
    match value {
        RecordValue::Null => serde_json::Value::Null,
        RecordValue::Bool(v) => (*v).into(),
        RecordValue::Int(v) => (*v).into(),
        RecordValue::UInt(v) => (*v).into(),
        RecordValue::Float(v) => {
            serde_json::Number::from_f64(*v).map(serde_json::Value::Number).unwrap_or(serde_json::Value::Null)
        }
        RecordValue::Text(s) => s.clone().into(),
        RecordValue::Bytes(b) => hex::encode(b).into(),
        RecordValue::Timestamp(ts) => ts.to_rfc3339().into(),
    }
}
