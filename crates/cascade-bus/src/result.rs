//! Structured result messages published by workers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Outcome of one handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultStatus {
    Success,
    Failure,
}

/// Result payload published back onto the sequence after a handler runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultMsg {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: ResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
}

impl ResultMsg {
    /// Successful result, finished now.
    #[must_use]
    pub fn success(started_at: DateTime<Utc>, response: Option<serde_json::Value>) -> Self {
        Self {
            started_at,
            finished_at: Utc::now(),
            status: ResultStatus::Success,
            error: None,
            response,
        }
    }

    /// Failed result, finished now.
    #[must_use]
    pub fn failure(started_at: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            started_at,
            finished_at: Utc::now(),
            status: ResultStatus::Failure,
            error: Some(error.into()),
            response: None,
        }
    }
}
