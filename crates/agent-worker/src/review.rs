//! PR-scope review commit resolution (spec §4.7 step 4): when a review
//! gate's scope is `"pr"`, the ordered list of commits to review comes
//! from `gh pr view`, in the same subprocess-wrapper style the teacher's
//! `git_commit_changes`/`git_diff` helpers use.

use std::path::Path;
use std::process::Command;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("failed to invoke gh: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("gh pr view exited non-zero: {0}")]
    NonZeroExit(String),
    #[error("gh pr view produced unparseable JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Resolve the ordered list of commit shas for `pr_number` via
/// `gh pr view <n> --json commits`, oldest first.
pub fn resolve_pr_commits(workdir: &Path, pr_number: u64) -> Result<Vec<String>, ReviewError> {
    let output = Command::new("gh")
        .args(["pr", "view", &pr_number.to_string(), "--json", "commits"])
        .current_dir(workdir)
        .output()
        .map_err(ReviewError::Spawn)?;

    if !output.status.success() {
        return Err(ReviewError::NonZeroExit(String::from_utf8_lossy(&output.stderr).to_string()));
    }

    let value: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    let commits = value
        .get("commits")
        .and_then(|c| c.as_array())
        .cloned()
        .unwrap_or_default();
    let shas = commits
        .iter()
        .filter_map(|c| c.get("oid").and_then(|o| o.as_str()).map(str::to_string))
        .collect();
    Ok(shas)
}

/// The scope a review turn runs against: a single commit, or the ordered
/// commit list of a PR (every commit in the list must be reviewed per
/// spec §4.7 step 4).
#[derive(Debug, Clone)]
pub enum ReviewScope {
    Commit(String),
    Pr { number: u64, commits: Vec<String> },
}

impl ReviewScope {
    /// The commits a review turn must walk through, in order.
    pub fn commits(&self) -> Vec<String> {
        match self {
            Self::Commit(sha) => vec![sha.clone()],
            Self::Pr { commits, .. } => commits.clone(),
        }
    }

    /// The final commit a passing review's `targetCommitSha` must match.
    pub fn target_commit_sha(&self) -> Option<String> {
        self.commits().last().cloned()
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Commit(_) => "commit",
            Self::Pr { .. } => "pr",
        }
    }
}

const REVIEW_OUTPUT_CONTRACT: &str = r#"## Output contract

Respond with exactly one JSON object (no prose, no code fence) containing
every one of: ran, method, targetCommitSha, scope, reviewedCommits, summary,
findingsCount, verdict, evidence. method must be "built_in_review". scope
must be "commit" or "pr". verdict must be one of pass, changes_requested,
block. evidence must be an object shaped
{"artifactPath": <repo-relative path the findings were written to>,
"sectionsPresent": [<section names actually present in that artifact>]}."#;

/// Build the prompt for one built-in review turn against a single commit
/// (spec §4.7 step 4). `retry_patch` carries the prior attempt's schema
/// error on a second try, mirroring the main turn's retry-patch shape.
pub fn build_review_prompt(commit_sha: &str, scope: &ReviewScope, retry_patch: Option<&str>) -> String {
    let mut text = String::from("# Built-in review\n\n");
    match scope {
        ReviewScope::Pr { number, .. } => {
            text.push_str(&format!("Review commit `{commit_sha}` (part of PR #{number}).\n\n"))
        }
        ReviewScope::Commit(_) => text.push_str(&format!("Review commit `{commit_sha}`.\n\n")),
    }
    text.push_str(REVIEW_OUTPUT_CONTRACT);
    if let Some(patch) = retry_patch {
        text.push_str(&format!(
            "\n\n## RETRY REQUIREMENT\n\nYour previous response did not validate against the review contract: {patch}\n\nRespond again with the complete JSON object, every required key present."
        ));
    }
    text
}
