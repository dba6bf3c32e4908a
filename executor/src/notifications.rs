use crate::models::{QueryExecution, QueryStatus};
use crate::{mq, settings};
use serde::Serialize;
use tracing::error;

/// The terminal-state event published for a run.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub guid: String,
    pub run_id: i64,
    pub status: QueryStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_description: Option<String>,
}

impl From<&QueryExecution> for Notification {
    fn from(query: &QueryExecution) -> Self {
        Notification {
            guid: query.guid.clone(),
            run_id: query.id,
            status: query.status,
            error_description: query.error_description.clone(),
        }
    }
}

/// Publish a terminal-state event on the execution exchange.
///
/// Always called after the status transaction committed. A failed
/// publication never rolls back the terminal state: it is logged and
/// dropped, the caller moves on.
pub async fn send_notification(query: &QueryExecution) {
    let notification = Notification::from(query);
    let body = match serde_json::to_vec(&notification) {
        Ok(body) => body,
        Err(e) => {
            error!("Failed to serialize the notification for query {}: {}", query.guid, e);
            return;
        }
    };
    if let Err(e) = mq::publish(&settings::get_exchange_execute(), "result", &body).await {
        error!("Failed to publish the notification for query {}: {:#}", query.guid, e);
    }
}
