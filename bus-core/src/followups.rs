//! Follow-up dispatcher (C8): turns the `followUps[]` array of a validated
//! worker output into delivered packets, applying the EXECUTE branch-naming
//! convention and the blocked-outcome suppression rule.

use crate::output::FollowUp;
use crate::receipt::Outcome;
use crate::roster::{Roster, AUTOPILOT};
use crate::store::{BusError, BusStore};
use crate::task::{GitReferences, References, SignalKind, TaskMeta};
use serde::{Deserialize, Serialize};
use tracing::info;

/// What happened to the follow-ups attached to one closed task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowUpOutcome {
    pub dispatched: Vec<String>,
    pub follow_ups_suppressed: bool,
    pub suppressed_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

fn work_branch(agent: &str, root_id: &str, variant: &str) -> String {
    format!("wip/{agent}/{root_id}/{variant}")
}

fn integration_branch(root_id: &str) -> String {
    format!("slice/{root_id}")
}

/// Dispatch every `followUps[i]` from a parent task's worker output.
///
/// `parent_agent` is the agent that closed `parent_task`; `parent_outcome`
/// governs suppression: a non-autopilot agent closing `blocked` may only
/// forward STATUS follow-ups, everything else is dropped and recorded.
pub fn dispatch_follow_ups(
    store: &BusStore,
    roster: &Roster,
    parent_agent: &str,
    parent_task: &TaskMeta,
    parent_outcome: Outcome,
    follow_ups: &[FollowUp],
) -> Result<FollowUpOutcome, BusError> {
    let mut outcome = FollowUpOutcome::default();
    if follow_ups.is_empty() {
        return Ok(outcome);
    }

    let is_autopilot = roster.is_autopilot(parent_agent);
    let root_id = parent_task
        .signals
        .root_id
        .clone()
        .unwrap_or_else(|| parent_task.id.clone());

    let blocked_and_restricted = parent_outcome == Outcome::Blocked && !is_autopilot;
    let mut suppressed = 0u32;

    for (idx, follow_up) in follow_ups.iter().enumerate() {
        let is_status = follow_up.signals.kind == SignalKind::Status;
        if blocked_and_restricted && !is_status {
            suppressed += 1;
            continue;
        }

        let variant = format!("{idx}");
        let mut references = References::default();
        if follow_up.signals.kind == SignalKind::Execute {
            references.git = Some(GitReferences {
                base_sha: parent_task
                    .references
                    .git
                    .as_ref()
                    .and_then(|g| g.base_sha.clone()),
                work_branch: Some(work_branch(parent_agent, &root_id, &variant)),
                integration_branch: Some(integration_branch(&root_id)),
            });
            references.integration = parent_task.references.integration.clone();
        }

        let mut signals = follow_up.signals.clone();
        if signals.root_id.is_none() {
            signals.root_id = Some(root_id.clone());
        }
        if signals.parent_id.is_none() {
            signals.parent_id = Some(parent_task.id.clone());
        }

        let id = format!("{}-followup-{idx}", parent_task.id);
        let meta = TaskMeta {
            id: id.clone(),
            to: follow_up.to.clone(),
            from: parent_agent.to_string(),
            priority: parent_task.priority,
            title: follow_up.title.clone(),
            signals,
            references,
        };

        store.deliver(roster, meta, follow_up.body.clone())?;
        outcome.dispatched.push(id);
    }

    if suppressed > 0 {
        outcome.follow_ups_suppressed = true;
        outcome.suppressed_count = suppressed;
        outcome.reason = Some("blocked_outcome_non_autopilot".to_string());
        info!(
            parent_agent,
            task_id = %parent_task.id,
            suppressed,
            "suppressed non-STATUS follow-ups for blocked outcome"
        );
    }

    Ok(outcome)
}
