use serde::{Deserialize, Serialize};

/// The status of a query execution.
///
/// `Created` is set on insert; the lifecycle engine moves the run to
/// `Running` and then to exactly one terminal status. Once terminal, the
/// status never changes again.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Created,
    Running,
    Done,
    Cancelled,
    Error,
}

impl QueryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Created => "created",
            QueryStatus::Running => "running",
            QueryStatus::Done => "done",
            QueryStatus::Cancelled => "cancelled",
            QueryStatus::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, QueryStatus::Done | QueryStatus::Cancelled | QueryStatus::Error)
    }
}

impl TryFrom<&str> for QueryStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, String> {
        match value {
            "created" => Ok(QueryStatus::Created),
            "running" => Ok(QueryStatus::Running),
            "done" => Ok(QueryStatus::Done),
            "cancelled" => Ok(QueryStatus::Cancelled),
            "error" => Ok(QueryStatus::Error),
            other => Err(format!("unknown query status: {other}")),
        }
    }
}

/// The status of a single result destination of a run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueryDestinationStatus {
    Declared,
    Uploaded,
    Error,
    Deleted,
}

impl QueryDestinationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryDestinationStatus::Declared => "declared",
            QueryDestinationStatus::Uploaded => "uploaded",
            QueryDestinationStatus::Error => "error",
            QueryDestinationStatus::Deleted => "deleted",
        }
    }
}

impl TryFrom<&str> for QueryDestinationStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, String> {
        match value {
            "declared" => Ok(QueryDestinationStatus::Declared),
            "uploaded" => Ok(QueryDestinationStatus::Uploaded),
            "error" => Ok(QueryDestinationStatus::Error),
            "deleted" => Ok(QueryDestinationStatus::Deleted),
            other => Err(format!("unknown destination status: {other}")),
        }
    }
}

/// One query execution: a submitted statement, its source, and its status.
#[derive(Debug, Clone)]
pub struct QueryExecution {
    pub id: i64,

    /// The externally meaningful identifier: the cancel and lookup key.
    pub guid: String,

    pub query: String,

    /// The source connection string, encrypted at rest.
    pub source_conn: String,

    /// The owning principal; runs are only visible to it and to superusers.
    pub identity_id: String,

    pub status: QueryStatus,
    pub error_description: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,

    /// The declared destinations, in insertion order.
    pub destinations: Vec<QueryDestination>,
}

/// One declared result sink of a run.
#[derive(Debug, Clone)]
pub struct QueryDestination {
    pub id: i64,
    pub query_id: i64,

    /// Tag selecting a materializer (currently only `table`).
    pub dest_type: String,

    pub status: QueryDestinationStatus,

    /// The destination locator; for `table`, the result table name.
    pub path: Option<String>,

    /// Opaque JSON carrying the per-query read-only credentials.
    pub access_creds: Option<String>,

    pub error_description: Option<String>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// A query submission.
#[derive(Debug, Clone, Deserialize)]
pub struct QueryIn {
    #[serde(default = "default_guid")]
    pub guid: String,

    /// The submitting control plane's own correlation id for this run.
    ///
    /// Accepted for contract compatibility and echoed in the logs; the
    /// record itself is keyed by `guid`, which is also the cancel and
    /// lookup key.
    #[serde(default)]
    pub run_guid: Option<String>,

    pub query: String,

    /// The source connection string; encrypted before it is persisted.
    pub conn_string: String,

    pub result_destinations: Vec<String>,
    pub identity_id: String,
}

fn default_guid() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// The immediate response to a submission; execution continues in the
/// background.
#[derive(Debug, Clone, Serialize)]
pub struct QueryOut {
    pub id: i64,
    pub guid: String,
}

/// The externally visible state of a run.
#[derive(Debug, Clone, Serialize)]
pub struct QueryExecutionOut {
    pub status: QueryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub result_destinations: Vec<QueryDestinationOut>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryDestinationOut {
    #[serde(rename = "type")]
    pub dest_type: String,
    pub status: QueryDestinationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creds: Option<serde_json::Value>,
}

impl From<&QueryDestination> for QueryDestinationOut {
    fn from(dest: &QueryDestination) -> Self {
        QueryDestinationOut {
            dest_type: dest.dest_type.clone(),
            status: dest.status,
            error: dest.error_description.clone(),
            path: dest.path.clone(),
            creds: dest.access_creds.as_deref().and_then(|creds| serde_json::from_str(creds).ok()),
        }
    }
}

impl From<&QueryExecution> for QueryExecutionOut {
    fn from(query: &QueryExecution) -> Self {
        QueryExecutionOut {
            status: query.status,
            error: query.error_description.clone(),
            result_destinations: query.destinations.iter().map(QueryDestinationOut::from).collect(),
        }
    }
}
