//! Receipt model — the durable write-once record of a task closure.

use crate::task::TaskMeta;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Terminal outcome of a task close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Done,
    Blocked,
    Failed,
    Skipped,
    NeedsReview,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Done => "done",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::NeedsReview => "needs_review",
        };
        write!(f, "{s}")
    }
}

/// A durable record written exactly once per `(agent, id)` close.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Receipt {
    pub task_id: String,
    pub agent: String,
    pub outcome: Outcome,
    pub note: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
    pub closed_at: DateTime<Utc>,
    pub task: TaskMeta,
    #[serde(default)]
    pub receipt_extra: HashMap<String, serde_json::Value>,
}

/// A hex git sha must be at least 6 characters of `[0-9a-f]`.
pub fn looks_like_git_sha(candidate: &str) -> bool {
    candidate.len() >= 6 && candidate.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plausible_shas() {
        assert!(looks_like_git_sha("abc123"));
        assert!(looks_like_git_sha("deadbeefdeadbeef"));
    }

    #[test]
    fn rejects_short_or_non_hex() {
        assert!(!looks_like_git_sha("abc12"));
        assert!(!looks_like_git_sha("zzzzzz"));
    }
}
