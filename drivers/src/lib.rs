pub mod clickhouse;
pub mod postgres;
pub mod runner;
pub mod staging;

pub use clickhouse::ClickHouseHttp;
pub use runner::{QueryRunner, QueryRunnerFactory};

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by a query runner.
///
/// The lifecycle engine branches on the kind: `Cancelled` triggers the
/// cancellation race resolution, `NotRunning` is reported back to the caller
/// of a terminate request, everything else fails the run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The backend rejected or aborted the statement.
    #[error("SQL execution failed: {0}")]
    SqlExecution(String),

    /// The execution was cancelled through the backend's own cancel API.
    #[error("query execution was cancelled")]
    Cancelled,

    /// No live execution carrying the application tag was found.
    #[error("query is not in the running state")]
    NotRunning,

    /// The connection string scheme has no registered runner.
    #[error("unsupported connection string scheme: {0}")]
    UnsupportedScheme(String),

    #[error(transparent)]
    Staging(#[from] staging::StagingError),
}
