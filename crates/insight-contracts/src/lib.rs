use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Key attribute of the query table.
pub const QUERY_KEY: &str = "query_id";
/// Key attribute of the customer table (the CRM record id).
pub const CUSTOMER_KEY: &str = "Id";

/// Customer rows are whatever the CRM returned; no schema is enforced.
pub type CustomerRecord = Map<String, Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryStatus {
    Queued,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct QueryRecord {
    pub query_id: String,
    pub prompt: String,
    pub status: QueryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl QueryRecord {
    pub fn queued(query_id: &str, prompt: &str) -> Self {
        Self {
            query_id: query_id.to_string(),
            prompt: prompt.to_string(),
            status: QueryStatus::Queued,
            response: None,
            error: None,
        }
    }

    pub fn completed(query_id: &str, prompt: &str, response: String) -> Self {
        Self {
            response: Some(response),
            status: QueryStatus::Completed,
            ..Self::queued(query_id, prompt)
        }
    }

    pub fn failed(query_id: &str, prompt: &str, error: String) -> Self {
        Self {
            error: Some(error),
            status: QueryStatus::Failed,
            ..Self::queued(query_id, prompt)
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntakeRequest {
    #[serde(default)]
    pub prompt: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct IntakeAccepted {
    pub query_id: String,
    pub status: QueryStatus,
}

/// Queue message body produced by intake and consumed by the worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkMessage {
    pub query_id: String,
    pub prompt: String,
}

/// Batch envelope in the shape queue triggers deliver (`{"Records": [...]}`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueEvent {
    #[serde(rename = "Records", default)]
    pub records: Vec<QueueEventRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEventRecord {
    #[serde(rename = "messageId", default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
    pub body: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct WorkerReport {
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncSummary {
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ErrorResponse {
    pub error: ErrorBody,
}
