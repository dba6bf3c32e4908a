use serde::{Deserialize, Serialize};

/// A publish request consumed from the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    /// The guid of the run whose materialized result is published.
    pub guid: String,

    /// The operator-chosen analytics table name.
    pub publish_name: String,

    pub identity_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PublishStatus {
    Published,
    Error,
}

/// The outcome published back on the result binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishOutcome {
    pub guid: String,
    pub status: PublishStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_serialization() {
        let outcome = PublishOutcome { guid: "g1".to_string(), status: PublishStatus::Published };
        assert_eq!(serde_json::to_string(&outcome).unwrap(), r#"{"guid":"g1","status":"published"}"#);
    }
}
