//! The worker output contract: the shape an engine turn's final JSON
//! message must validate against before a task can be closed.

use crate::receipt::Outcome;
use crate::task::Signals;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OutputError {
    #[error("output is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("missing required key `{0}`")]
    MissingKey(&'static str),
    #[error("forbidden marker `{marker}` found in new diff lines")]
    ForbiddenMarker { marker: &'static str },
}

/// A single follow-up task synthesized from a worker output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUp {
    pub to: Vec<String>,
    pub title: String,
    pub body: String,
    pub signals: Signals,
}

/// `review.evidence`: where the review turn wrote its findings and which
/// sections that artifact actually contains.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewEvidence {
    pub artifact_path: String,
    #[serde(default)]
    pub sections_present: Vec<String>,
}

/// Review sub-object (spec §4.7 step 4 / §6): present unless the task's
/// kind has no review gate, in which case the whole `review` key is
/// `null`. A non-null review is the output of a dedicated built-in review
/// turn (`method: "built_in_review"`), not the main task turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub ran: bool,
    #[serde(default)]
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_commit_sha: Option<String>,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub reviewed_commits: Vec<String>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub findings_count: u32,
    pub verdict: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<ReviewEvidence>,
}

const REVIEW_REQUIRED_KEYS: &[&str] = &[
    "ran",
    "method",
    "targetCommitSha",
    "scope",
    "reviewedCommits",
    "summary",
    "findingsCount",
    "verdict",
    "evidence",
];

/// Parse and validate a review turn's final message against the review
/// sub-contract. Separate from [`parse_worker_output`] because a review
/// turn's JSON *is* the `review` object, not a full worker output envelope.
pub fn parse_review_output(raw: &str) -> Result<Review, OutputError> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let object = value.as_object().ok_or(OutputError::MissingKey("ran"))?;
    for key in REVIEW_REQUIRED_KEYS {
        if !object.contains_key(*key) {
            return Err(OutputError::MissingKey(key));
        }
    }
    Ok(serde_json::from_value(value)?)
}

/// Top-level worker output contract (spec §6). Every listed key must be
/// present in the raw JSON (use `""`/`[]`/`null` to fill), which is why
/// deserialization does not apply field defaults for most of them — a
/// missing key is itself a validation failure, not a value to default in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerOutput {
    pub outcome: Outcome,
    pub note: String,
    pub commit_sha: Option<String>,
    pub plan_markdown: String,
    pub files_to_change: Vec<String>,
    pub tests_to_run: Vec<String>,
    pub artifacts: Vec<String>,
    pub risk_notes: String,
    pub rollback_plan: String,
    pub follow_ups: Vec<FollowUp>,
    pub review: Option<Review>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_review: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autopilot_control: Option<serde_json::Value>,
    /// Always serialized as `null`: the worker, not the engine, fills
    /// `receiptExtra.runtimeGuard` after the gate chain runs.
    #[serde(default)]
    pub runtime_guard: Option<serde_json::Value>,
}

const REQUIRED_KEYS: &[&str] = &[
    "outcome",
    "note",
    "commitSha",
    "planMarkdown",
    "filesToChange",
    "testsToRun",
    "artifacts",
    "riskNotes",
    "rollbackPlan",
    "followUps",
    "review",
    "runtimeGuard",
];

const FORBIDDEN_MARKERS: &[&str] = &["catch {}", "catch (e) {}", "eslint-disable"];

/// Lines `diff_text` (a unified `git diff`) actually added, i.e. lines
/// prefixed `+` excluding the `+++ b/path` file header. Forbidden markers
/// are only a violation when the task's own diff introduces them; a marker
/// already present on a removed or context line predates this task.
fn added_lines(diff_text: &str) -> String {
    diff_text
        .lines()
        .filter(|line| line.starts_with('+') && !line.starts_with("+++"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Parse and validate the engine's final message text against the worker
/// output contract. `diff_text` is the task's `git diff` text; only its
/// added lines are scanned for forbidden empty-catch/lint-disable markers.
pub fn parse_worker_output(raw: &str, diff_text: &str) -> Result<WorkerOutput, OutputError> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let object = value.as_object().ok_or(OutputError::MissingKey("outcome"))?;
    for key in REQUIRED_KEYS {
        if !object.contains_key(*key) {
            return Err(OutputError::MissingKey(key));
        }
    }
    let added = added_lines(diff_text);
    for marker in FORBIDDEN_MARKERS {
        if added.contains(marker) {
            return Err(OutputError::ForbiddenMarker { marker });
        }
    }
    let output: WorkerOutput = serde_json::from_value(value)?;
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> serde_json::Value {
        serde_json::json!({
            "outcome": "done",
            "note": "shipped it",
            "commitSha": "abc1234",
            "planMarkdown": "",
            "filesToChange": [],
            "testsToRun": [],
            "artifacts": [],
            "riskNotes": "",
            "rollbackPlan": "",
            "followUps": [],
            "review": { "ran": true, "verdict": "pass", "reviewArtifactPath": null, "notes": "" },
            "runtimeGuard": null,
        })
    }

    #[test]
    fn accepts_well_formed_output() {
        let raw = sample_json().to_string();
        let parsed = parse_worker_output(&raw, "no markers here").unwrap();
        assert_eq!(parsed.outcome, Outcome::Done);
    }

    #[test]
    fn rejects_missing_key() {
        let mut value = sample_json();
        value.as_object_mut().unwrap().remove("rollbackPlan");
        let err = parse_worker_output(&value.to_string(), "").unwrap_err();
        assert!(matches!(err, OutputError::MissingKey("rollbackPlan")));
    }

    #[test]
    fn rejects_forbidden_diff_marker() {
        let raw = sample_json().to_string();
        let err = parse_worker_output(&raw, "+  } catch (e) {}").unwrap_err();
        assert!(matches!(err, OutputError::ForbiddenMarker { .. }));
    }

    #[test]
    fn ignores_forbidden_marker_on_removed_or_context_lines() {
        let raw = sample_json().to_string();
        let diff = "--- a/src/lib.rs\n+++ b/src/lib.rs\n-  } catch (e) {}\n   let x = 1;\n+  let y = 2;\n";
        assert!(parse_worker_output(&raw, diff).is_ok());
    }
}
