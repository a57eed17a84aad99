//! Usage/cost accounting records.

use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

/// Maximum characters preserved from request/response bodies in a record.
pub const PREVIEW_LIMIT: usize = 500;

/// Lifecycle of a usage record. A record is created `Running` and moves to
/// exactly one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageStatus {
    Running,
    Completed,
    Failed,
}

/// Accounting row for one call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: String,
    pub user: String,
    pub client: String,
    pub model: String,
    pub started_at: SystemTime,
    pub completed_at: Option<SystemTime>,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub cost: f64,
    pub status: UsageStatus,
    pub input_preview: String,
    pub output_preview: String,
    pub error: Option<String>,
}

impl UsageRecord {
    /// Open a record in `Running` state at call start.
    pub fn start(
        client: impl Into<String>,
        model: impl Into<String>,
        user: impl Into<String>,
        input: &str,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user: user.into(),
            client: client.into(),
            model: model.into(),
            started_at: SystemTime::now(),
            completed_at: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            total_tokens: 0,
            cost: 0.0,
            status: UsageStatus::Running,
            input_preview: truncate_chars(input, PREVIEW_LIMIT),
            output_preview: String::new(),
            error: None,
        }
    }

    /// Finalize to `Completed`. The total is always derived, never taken
    /// from the backend, so `total == prompt + completion` holds.
    pub fn complete(&mut self, prompt_tokens: u32, completion_tokens: u32, cost: f64, output: &str) {
        debug_assert_eq!(self.status, UsageStatus::Running);
        self.prompt_tokens = prompt_tokens;
        self.completion_tokens = completion_tokens;
        self.total_tokens = prompt_tokens + completion_tokens;
        self.cost = cost;
        self.output_preview = truncate_chars(output, PREVIEW_LIMIT);
        self.completed_at = Some(SystemTime::now());
        self.status = UsageStatus::Completed;
    }

    /// Finalize to `Failed` with the downstream error message.
    pub fn fail(&mut self, error: impl Into<String>) {
        debug_assert_eq!(self.status, UsageStatus::Running);
        self.error = Some(error.into());
        self.completed_at = Some(SystemTime::now());
        self.status = UsageStatus::Failed;
    }

    pub fn is_terminal(&self) -> bool {
        self.status != UsageStatus::Running
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.completed_at
            .and_then(|end| end.duration_since(self.started_at).ok())
    }
}

/// Truncate on a char boundary, keeping at most `max` characters.
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}
