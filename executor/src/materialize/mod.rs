use crate::models::QueryExecution;
use futures::future::BoxFuture;
use std::path::Path;

pub mod table;

/// The durable output of a materializer.
pub struct MaterializedDestination {
    /// The destination locator persisted on the destination row.
    pub path: String,

    /// JSON-encoded credentials giving read access to exactly this result.
    pub access_creds: String,
}

#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    /// The result set uses a column name the materializer needs for itself.
    #[error("the column name `{0}` is reserved")]
    ReservedColumnName(String),

    #[error("results store error: {0}")]
    Backend(String),

    #[error(transparent)]
    Staging(#[from] drivers::staging::StagingError),
}

/// Consumes a staging file and produces a durable destination.
///
/// A materializer must not be invoked twice for one run: inserts are not
/// idempotent.
pub trait Materializer: Send + Sync {
    fn materialize<'a>(
        &'a self,
        query: &'a QueryExecution,
        staging_path: &'a Path,
    ) -> BoxFuture<'a, Result<MaterializedDestination, MaterializeError>>;
}

/// Look up the materializer registered for a destination tag.
///
/// Unknown tags return `None`; the engine logs and skips them without
/// failing the run.
pub fn for_dest_type(dest_type: &str) -> Option<&'static dyn Materializer> {
    match dest_type {
        "table" => Some(&table::TableMaterializer),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry() {
        assert!(for_dest_type("table").is_some());
        assert!(for_dest_type("s3").is_none());
        assert!(for_dest_type("").is_none());
    }
}
