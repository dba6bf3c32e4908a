use chrono::{DateTime, Utc};
use rmpv::Value;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

/// Number of bytes used by the big-endian length prefix of each record.
const LEN_SIZE: usize = 8;

/// MessagePack extension type carrying a UTC timestamp.
const TIMESTAMP_EXT_TYPE: i8 = -1;

pub type StagingResult<T> = std::result::Result<T, StagingError>;

#[derive(Debug, thiserror::Error)]
pub enum StagingError {
    /// The length prefix of the next record is absent: the stream is over.
    #[error("end of staging stream")]
    Eof,

    /// The stream ended in the middle of a record.
    #[error("truncated staging record (expected {expected} bytes, got {got})")]
    Truncated { expected: usize, got: usize },

    /// The record payload is not a well-formed list of primitive values.
    #[error("malformed staging record: {0}")]
    Codec(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A single primitive value of a staged row.
///
/// Rows have no compile-time schema: the stream carries the column names and
/// the backend-reported type display strings once (records 0 and 1), then one
/// value list per data row.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    /// Always UTC; naive timestamps are treated as UTC on encode.
    Timestamp(DateTime<Utc>),
}

impl RecordValue {
    fn into_value(self) -> Value {
        match self {
            RecordValue::Null => Value::Nil,
            RecordValue::Bool(v) => Value::Boolean(v),
            RecordValue::Int(v) => Value::from(v),
            RecordValue::UInt(v) => Value::from(v),
            RecordValue::Float(v) => Value::F64(v),
            RecordValue::Text(v) => Value::from(v),
            RecordValue::Bytes(v) => Value::Binary(v),
            RecordValue::Timestamp(ts) => Value::Ext(TIMESTAMP_EXT_TYPE, encode_timestamp(&ts)),
        }
    }

    fn try_from_value(value: Value) -> StagingResult<Self> {
        match value {
            Value::Nil => Ok(RecordValue::Null),
            Value::Boolean(v) => Ok(RecordValue::Bool(v)),
            Value::Integer(v) => match v.as_i64() {
                Some(i) => Ok(RecordValue::Int(i)),
                None => v
                    .as_u64()
                    .map(RecordValue::UInt)
                    .ok_or_else(|| StagingError::Codec(format!("integer out of range: {v}"))),
            },
            Value::F32(v) => Ok(RecordValue::Float(v as f64)),
            Value::F64(v) => Ok(RecordValue::Float(v)),
            Value::String(v) => {
                let repr = format!("{v}");
                v.into_str().map(RecordValue::Text).ok_or(StagingError::Codec(repr))
            }
            Value::Binary(v) => Ok(RecordValue::Bytes(v)),
            Value::Ext(TIMESTAMP_EXT_TYPE, data) => decode_timestamp(&data).map(RecordValue::Timestamp),
            other => Err(StagingError::Codec(format!("unsupported value in record: {other}"))),
        }
    }
}

/// Encode a timestamp using the smallest MessagePack timestamp layout that fits.
fn encode_timestamp(ts: &DateTime<Utc>) -> Vec<u8> {
    let sec = ts.timestamp();
    let nsec = ts.timestamp_subsec_nanos();
    if nsec == 0 && (0..=u32::MAX as i64).contains(&sec) {
        (sec as u32).to_be_bytes().to_vec()
    } else if (0..1i64 << 34).contains(&sec) {
        (((nsec as u64) << 34) | sec as u64).to_be_bytes().to_vec()
    } else {
        let mut buf = Vec::with_capacity(12);
        buf.extend_from_slice(&nsec.to_be_bytes());
        buf.extend_from_slice(&sec.to_be_bytes());
        buf
    }
}

fn decode_timestamp(data: &[u8]) -> StagingResult<DateTime<Utc>> {
    let (sec, nsec) = match data.len() {
        4 => (u32::from_be_bytes(data.try_into().unwrap()) as i64, 0u32),
        8 => {
            let packed = u64::from_be_bytes(data.try_into().unwrap());
            ((packed & ((1 << 34) - 1)) as i64, (packed >> 34) as u32)
        }
        12 => (
            i64::from_be_bytes(data[4..].try_into().unwrap()),
            u32::from_be_bytes(data[..4].try_into().unwrap()),
        ),
        n => return Err(StagingError::Codec(format!("invalid timestamp payload of {n} bytes"))),
    };
    DateTime::from_timestamp(sec, nsec)
        .ok_or_else(|| StagingError::Codec(format!("timestamp out of range: {sec}s {nsec}ns")))
}

/// Writes length-prefixed MessagePack records to the staging file.
///
/// The first two records are expected to be the column headers (names, then
/// type display strings); the codec itself does not enforce it.
pub struct StagingWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> StagingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_header(&mut self, names: &[String], types: &[String]) -> StagingResult<()> {
        self.write_record(names.iter().map(|n| RecordValue::Text(n.clone())).collect()).await?;
        self.write_record(types.iter().map(|t| RecordValue::Text(t.clone())).collect()).await
    }

    pub async fn write_record(&mut self, values: Vec<RecordValue>) -> StagingResult<()> {
        let record = Value::Array(values.into_iter().map(RecordValue::into_value).collect());
        let mut payload = Vec::new();
        rmpv::encode::write_value(&mut payload, &record).map_err(|e| StagingError::Codec(e.to_string()))?;
        self.inner.write_all(&(payload.len() as u64).to_be_bytes()).await?;
        self.inner.write_all(&payload).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> StagingResult<()> {
        self.inner.flush().await?;
        Ok(())
    }
}

/// Reads a staging file from the start; there is no seek index.
pub struct StagingReader<R> {
    inner: R,
}

impl<R: AsyncRead + Unpin> StagingReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the two header records.
    ///
    /// Fails if either record holds anything but text values.
    pub async fn read_header(&mut self) -> StagingResult<(Vec<String>, Vec<String>)> {
        let names = self.read_text_record().await?;
        let types = self.read_text_record().await?;
        Ok((names, types))
    }

    async fn read_text_record(&mut self) -> StagingResult<Vec<String>> {
        self.read_record()
            .await?
            .into_iter()
            .map(|value| match value {
                RecordValue::Text(text) => Ok(text),
                other => Err(StagingError::Codec(format!("expected a text header value, got {other:?}"))),
            })
            .collect()
    }

    /// Read the next record.
    ///
    /// Returns [StagingError::Eof] when the stream ends cleanly before the
    /// length prefix; a stream ending anywhere else is a hard error.
    pub async fn read_record(&mut self) -> StagingResult<Vec<RecordValue>> {
        let mut len_buf = [0u8; LEN_SIZE];
        self.read_up_to(&mut len_buf, true).await?;
        let len = u64::from_be_bytes(len_buf) as usize;

        let mut payload = vec![0u8; len];
        self.read_up_to(&mut payload, false).await?;

        let record =
            rmpv::decode::read_value(&mut payload.as_slice()).map_err(|e| StagingError::Codec(e.to_string()))?;
        match record {
            Value::Array(values) => values.into_iter().map(RecordValue::try_from_value).collect(),
            other => Err(StagingError::Codec(format!("expected an array record, got {other}"))),
        }
    }

    /// Fill `buf`, reporting a clean end of stream as `Eof` only when nothing
    /// was read and `eof_ok` is set (i.e. between records).
    async fn read_up_to(&mut self, buf: &mut [u8], eof_ok: bool) -> StagingResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.inner.read(&mut buf[filled..]).await?;
            if n == 0 {
                if filled == 0 && eof_ok {
                    return Err(StagingError::Eof);
                }
                return Err(StagingError::Truncated { expected: buf.len(), got: filled });
            }
            filled += n;
        }
        Ok(())
    }
}

/// Create a staging file, truncating any previous content.
pub async fn create(path: impl AsRef<Path>) -> StagingResult<StagingWriter<BufWriter<File>>> {
    let file = File::create(path).await?;
    Ok(StagingWriter::new(BufWriter::new(file)))
}

/// Open a staging file for reading from the start.
pub async fn open(path: impl AsRef<Path>) -> StagingResult<StagingReader<BufReader<File>>> {
    let file = File::open(path).await?;
    Ok(StagingReader::new(BufReader::new(file)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Cursor;

    fn sample_rows() -> Vec<Vec<RecordValue>> {
        vec![
            vec![
                RecordValue::Int(1),
                RecordValue::Text("hello".to_string()),
                RecordValue::Float(2.5),
                RecordValue::Bool(true),
            ],
            vec![
                RecordValue::Null,
                RecordValue::Text(String::new()),
                RecordValue::Float(-0.0),
                RecordValue::Bool(false),
            ],
            vec![
                RecordValue::UInt(u64::MAX),
                RecordValue::Bytes(vec![0, 1, 2, 255]),
                RecordValue::Int(i64::MIN),
                RecordValue::Null,
            ],
        ]
    }

    async fn write_stream(rows: &[Vec<RecordValue>]) -> Vec<u8> {
        let mut writer = StagingWriter::new(Vec::new());
        writer
            .write_header(
                &["a".to_string(), "b".to_string(), "c".to_string(), "d".to_string()],
                &["int8".to_string(), "text".to_string(), "float8".to_string(), "bool".to_string()],
            )
            .await
            .unwrap();
        for row in rows {
            writer.write_record(row.clone()).await.unwrap();
        }
        writer.flush().await.unwrap();
        writer.inner
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let rows = sample_rows();
        let bytes = write_stream(&rows).await;

        let mut reader = StagingReader::new(Cursor::new(bytes));
        let (names, types) = reader.read_header().await.unwrap();
        assert_eq!(names, vec!["a", "b", "c", "d"]);
        assert_eq!(types, vec!["int8", "text", "float8", "bool"]);

        for expected in &rows {
            assert_eq!(&reader.read_record().await.unwrap(), expected);
        }
        assert!(matches!(reader.read_record().await, Err(StagingError::Eof)));
        // Eof is sticky: the stream is restartable only from the start.
        assert!(matches!(reader.read_record().await, Err(StagingError::Eof)));
    }

    #[tokio::test]
    async fn test_timestamp_layouts() {
        let timestamps = vec![
            // 4-byte layout: whole seconds after the epoch.
            Utc.with_ymd_and_hms(2024, 9, 14, 15, 16, 23).unwrap(),
            // 8-byte layout: sub-second precision.
            Utc.with_ymd_and_hms(2024, 9, 14, 15, 16, 23).unwrap() + chrono::Duration::nanoseconds(630_794_000),
            // 12-byte layout: before the epoch.
            Utc.with_ymd_and_hms(1969, 12, 31, 23, 59, 59).unwrap(),
        ];
        for ts in timestamps {
            let mut writer = StagingWriter::new(Vec::new());
            writer.write_record(vec![RecordValue::Timestamp(ts)]).await.unwrap();
            let mut reader = StagingReader::new(Cursor::new(writer.inner));
            assert_eq!(reader.read_record().await.unwrap(), vec![RecordValue::Timestamp(ts)]);
        }
    }

    #[tokio::test]
    async fn test_truncated_length_prefix() {
        let bytes = write_stream(&sample_rows()).await;
        let mut reader = StagingReader::new(Cursor::new(bytes[..bytes.len() - 3].to_vec()));
        loop {
            match reader.read_record().await {
                Ok(_) => {}
                Err(StagingError::Truncated { .. }) => break,
                Err(other) => panic!("expected a truncation error, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_truncated_payload() {
        let mut writer = StagingWriter::new(Vec::new());
        writer.write_record(vec![RecordValue::Text("truncate me".to_string())]).await.unwrap();
        let mut bytes = writer.inner;
        bytes.truncate(LEN_SIZE + 2);
        let mut reader = StagingReader::new(Cursor::new(bytes));
        assert!(matches!(reader.read_record().await, Err(StagingError::Truncated { .. })));
    }

    #[tokio::test]
    async fn test_header_rejects_non_text() {
        let mut writer = StagingWriter::new(Vec::new());
        writer.write_record(vec![RecordValue::Int(42)]).await.unwrap();
        writer.write_record(vec![RecordValue::Text("int8".to_string())]).await.unwrap();
        let mut reader = StagingReader::new(Cursor::new(writer.inner));
        assert!(matches!(reader.read_header().await, Err(StagingError::Codec(_))));
    }

    #[tokio::test]
    async fn test_file_backed_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.bin");
        let mut writer = create(&path).await.unwrap();
        writer.write_header(&["n".to_string()], &["int4".to_string()]).await.unwrap();
        writer.write_record(vec![RecordValue::Int(7)]).await.unwrap();
        writer.flush().await.unwrap();

        let mut reader = open(&path).await.unwrap();
        let (names, _) = reader.read_header().await.unwrap();
        assert_eq!(names, vec!["n"]);
        assert_eq!(reader.read_record().await.unwrap(), vec![RecordValue::Int(7)]);
        assert!(matches!(reader.read_record().await, Err(StagingError::Eof)));
    }
}
