pub mod publications;
pub mod queries;

// Re-export the models.
pub use publications::{PublishOutcome, PublishRequest, PublishStatus};
pub use queries::{QueryDestination, QueryDestinationStatus, QueryExecution, QueryStatus};
