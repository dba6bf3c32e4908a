use crate::staging::RecordValue;
use crate::{Error, Result};
use tokio_postgres::Row;
use tracing::warn;

/// Convert one row into a staging record, column-aligned with the headers.
pub fn record_from_row(row: &Row) -> Result<Vec<RecordValue>> {
    (0..row.columns().len()).map(|idx| record_value(row, idx)).collect()
}

/// Decode a single column into a staging primitive.
///
/// Types outside the primitive set carried by the staging stream cannot be
/// represented; they decode to null with a warning so a run does not fail on
/// an exotic column.
fn record_value(row: &Row, idx: usize) -> Result<RecordValue> {
    let column = &row.columns()[idx];
    let value = match column.type_().name() {
        "bool" => row.try_get::<_, Option<bool>>(idx).map_err(decode_error)?.map(RecordValue::Bool),
        "int2" => row.try_get::<_, Option<i16>>(idx).map_err(decode_error)?.map(|v| RecordValue::Int(v as i64)),
        "int4" => row.try_get::<_, Option<i32>>(idx).map_err(decode_error)?.map(|v| RecordValue::Int(v as i64)),
        "int8" => row.try_get::<_, Option<i64>>(idx).map_err(decode_error)?.map(RecordValue::Int),
        "oid" => row.try_get::<_, Option<u32>>(idx).map_err(decode_error)?.map(|v| RecordValue::UInt(v as u64)),
        "float4" => row.try_get::<_, Option<f32>>(idx).map_err(decode_error)?.map(|v| RecordValue::Float(v as f64)),
        "float8" => row.try_get::<_, Option<f64>>(idx).map_err(decode_error)?.map(RecordValue::Float),
        "text" | "varchar" | "bpchar" | "name" | "unknown" => {
            row.try_get::<_, Option<String>>(idx).map_err(decode_error)?.map(RecordValue::Text)
        }
        "bytea" => row.try_get::<_, Option<Vec<u8>>>(idx).map_err(decode_error)?.map(RecordValue::Bytes),
        // Timestamps without timezone are treated as UTC.
        "timestamp" => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
            .map_err(decode_error)?
            .map(|v| RecordValue::Timestamp(v.and_utc())),
        "timestamptz" => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
            .map_err(decode_error)?
            .map(RecordValue::Timestamp),
        "date" => row
            .try_get::<_, Option<chrono::NaiveDate>>(idx)
            .map_err(decode_error)?
            .map(|v| RecordValue::Text(v.to_string())),
        other => {
            warn!("Column `{}` has unsupported type `{}`, staging null.", column.name(), other);
            None
        }
    };
    Ok(value.unwrap_or(RecordValue::Null))
}

fn decode_error(e: tokio_postgres::Error) -> Error {
    Error::SqlExecution(format!("failed to decode a result column: {e}"))
}
