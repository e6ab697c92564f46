//! The orchestrator worker (C9). Structurally distinct from the generic
//! engine-driven loop in `worker.rs`: it never touches an `EngineDriver`,
//! it only transforms and forwards packets it receives in its own inbox.
//! Grounded on the teacher's `beads_bridge.rs` issue-state-transition
//! functions (`update_status`/`close`: a pure function of "what arrived"
//! to "what gets written next" against an external state store) rather
//! than the engine-turn loop `main()` drives for ordinary agents.

use crate::worker::WorkerLock;
use bus_core::receipt::Outcome;
use bus_core::roster::Roster;
use bus_core::store::{BusError, BusStore};
use bus_core::task::{Priority, References, SignalKind, Signals, TaskMeta, TaskPacket, TaskState};
use std::collections::HashMap;
use std::path::Path;
use std::time::{Duration, SystemTime};
use thiserror::Error;

/// Self-remediation digests (an `ORCHESTRATOR_UPDATE` whose own follow-up
/// closed non-`done`, producing another `ORCHESTRATOR_UPDATE`) forward at
/// most this many times before the orchestrator drops the cycle silently.
/// Open Question (spec §9) resolved: the source treats this as a small
/// fixed cap rather than an unbounded retry; 3 matches the gate-chain's own
/// "don't let a cycle run forever" posture elsewhere in this crate.
const SELF_REMEDIATE_DEPTH_CAP: u32 = 3;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Worker(#[from] crate::worker::WorkerError),
}

pub struct OrchestratorRuntime {
    pub agent: String,
    pub store: BusStore,
    pub roster: Roster,
}

impl OrchestratorRuntime {
    pub fn new(agent: impl Into<String>, store: BusStore, roster: Roster) -> Self {
        Self { agent: agent.into(), store, roster }
    }
}

fn pick_next(store: &BusStore, agent: &str) -> Option<String> {
    let dir = store.inbox_dir(agent, TaskState::New);
    let entries = std::fs::read_dir(&dir).ok()?;
    let mut candidates: Vec<(Priority, SystemTime, String)> = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|s| s.to_str()) else { continue };
        let Ok(text) = std::fs::read_to_string(&path) else { continue };
        let Ok(packet) = bus_core::frontmatter::parse(&text) else { continue };
        let mtime = std::fs::metadata(&path)
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        candidates.push((packet.meta.priority, mtime, id.to_string()));
    }
    candidates.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
    candidates.into_iter().next().map(|(_, _, id)| id)
}

/// Claim and fully dispose of the next packet in `runtime.agent`'s inbox.
/// Returns `Ok(false)` when the inbox is empty.
pub fn run_once(runtime: &mut OrchestratorRuntime) -> Result<bool, OrchestratorError> {
    let Some(id) = pick_next(&runtime.store, &runtime.agent) else {
        return Ok(false);
    };
    let packet = runtime.store.claim(&runtime.agent, &id)?;

    match packet.meta.signals.kind {
        SignalKind::TaskComplete => handle_task_complete(runtime, &packet)?,
        SignalKind::ReviewActionRequired => handle_review_action_required(runtime, &packet)?,
        _ => {
            tracing::warn!(task_id = %id, kind = %packet.meta.signals.kind, "orchestrator has no transform for this signal kind; closing as skipped");
        }
    }

    runtime.store.close(
        &runtime.roster,
        &runtime.agent,
        &id,
        Outcome::Done,
        "forwarded".to_string(),
        None,
        HashMap::new(),
        None,
    )?;
    Ok(true)
}

/// `TASK_COMPLETE` → `ORCHESTRATOR_UPDATE`: always to chat, and to
/// autopilot too when the digest is actionable (the source was an
/// EXECUTE-done-with-commit, which needs a review decision, or the source
/// did not close `done` at all). Self-remediation cycles are capped.
fn handle_task_complete(runtime: &OrchestratorRuntime, packet: &TaskPacket) -> Result<(), OrchestratorError> {
    let meta = &packet.meta;
    let source_kind = meta.signals.source_kind.clone().unwrap_or_default();
    let receipt_outcome = meta
        .references
        .extra
        .get("receiptOutcome")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let commit_sha = meta.references.extra.get("commitSha").and_then(|v| v.as_str()).map(str::to_string);
    let completed_task_id = meta
        .references
        .extra
        .get("completedTaskId")
        .and_then(|v| v.as_str())
        .unwrap_or(&meta.id)
        .to_string();

    let execute_kind = SignalKind::Execute.to_string();
    let orchestrator_update_kind = SignalKind::OrchestratorUpdate.to_string();
    let review_required = source_kind == execute_kind && receipt_outcome == "done" && commit_sha.is_some();
    let actionable = review_required || receipt_outcome != "done";

    let mut depth = meta.references.orchestrator_self_remediate_depth.unwrap_or(0);
    if source_kind == orchestrator_update_kind && receipt_outcome != "done" {
        if depth >= SELF_REMEDIATE_DEPTH_CAP {
            tracing::info!(task_id = %meta.id, depth, "self-remediation depth cap reached; dropping cycle");
            return Ok(());
        }
        depth += 1;
    }

    let mut targets = vec!["chat".to_string()];
    if actionable && runtime.roster.contains("autopilot") {
        targets.push("autopilot".to_string());
    }

    let mut signals = Signals::new(SignalKind::OrchestratorUpdate);
    signals.root_id = meta.signals.root_id.clone().or_else(|| Some(meta.id.clone()));
    signals.source_kind = Some(source_kind.clone());
    signals.review_required = Some(review_required);
    signals.notify_orchestrator = Some(false);

    let mut references = References { completed_task_kind: meta.references.completed_task_kind.clone(), ..Default::default() };
    references.extra.insert("completedTaskId".to_string(), serde_json::Value::String(completed_task_id.clone()));
    references.extra.insert("receiptOutcome".to_string(), serde_json::Value::String(receipt_outcome.clone()));
    if let Some(sha) = &commit_sha {
        references.extra.insert("commitSha".to_string(), serde_json::Value::String(sha.clone()));
    }
    references.orchestrator_self_remediate_depth = Some(depth);

    let digest_meta = TaskMeta {
        id: format!("{}-update", meta.id),
        to: targets,
        from: runtime.agent.clone(),
        priority: meta.priority,
        title: format!("ORCHESTRATOR_UPDATE: {}", meta.title),
        signals,
        references,
    };
    let body = format!(
        "Source task `{completed_task_id}` (`{source_kind}`) closed with outcome `{receipt_outcome}`.\n"
    );
    runtime.store.deliver(&runtime.roster, digest_meta, body)?;
    Ok(())
}

/// `REVIEW_ACTION_REQUIRED` → forwarded to autopilot only, coalesced by
/// `rootId`: a second packet sharing the same root while the first
/// forwarded digest is still pending (`new`/`seen`) is folded into it
/// rather than delivered as a second packet.
fn handle_review_action_required(runtime: &OrchestratorRuntime, packet: &TaskPacket) -> Result<(), OrchestratorError> {
    if !runtime.roster.contains("autopilot") {
        return Ok(());
    }
    let meta = &packet.meta;
    let root_id = meta.signals.root_id.clone().unwrap_or_else(|| meta.id.clone());
    let coalesced_id = format!("review-action-{root_id}");

    let already_pending = matches!(
        runtime.store.open("autopilot", &coalesced_id, false),
        Ok(opened) if matches!(opened.state, TaskState::New | TaskState::Seen)
    );

    if already_pending {
        let note = format!("Also applies to source task `{}`.", meta.id);
        runtime.store.update("autopilot", &coalesced_id, Some(&note), None, None)?;
        return Ok(());
    }

    let mut signals = Signals::new(SignalKind::ReviewActionRequired);
    signals.root_id = Some(root_id.clone());
    signals.notify_orchestrator = Some(false);
    let digest_meta = TaskMeta {
        id: coalesced_id,
        to: vec!["autopilot".to_string()],
        from: runtime.agent.clone(),
        priority: meta.priority,
        title: format!("Review action required for root `{root_id}`"),
        signals,
        references: References { git: meta.references.git.clone(), ..Default::default() },
    };
    let body = format!("Source tasks:\n- `{}`\n", meta.id);
    runtime.store.deliver(&runtime.roster, digest_meta, body)?;
    Ok(())
}

/// Acquire the orchestrator's own worker lock and poll-claim-process in a
/// loop, exactly like `worker::run_loop` but without an engine driver to
/// manage.
pub async fn run_loop(mut runtime: OrchestratorRuntime, once: bool, poll_interval: Duration) -> Result<(), OrchestratorError> {
    let state_dir = runtime.store.state_dir();
    let lock = match WorkerLock::acquire(&state_dir, &runtime.agent)? {
        Some(lock) => lock,
        None => {
            tracing::info!(agent = %runtime.agent, "already running; exiting duplicate orchestrator");
            return Ok(());
        }
    };

    let shutdown = tokio_util::sync::CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                    Ok(s) => s,
                    Err(_) => return,
                };
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
            }
            shutdown.cancel();
        });
    }

    loop {
        if shutdown.is_cancelled() {
            break;
        }
        let processed = run_once(&mut runtime)?;
        if once {
            break;
        }
        if !processed {
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.cancelled() => break,
            }
        }
    }

    drop(lock);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bus_core::roster::{AgentProfile, AgentRole};
    use std::collections::HashMap as StdHashMap;

    fn roster_with(autopilot: bool) -> Roster {
        let mut agents = StdHashMap::new();
        agents.insert(
            "orchestrator".to_string(),
            AgentProfile { role: AgentRole::Orchestrator, workdir: "/tmp".into(), skills: vec![], branch: None },
        );
        agents.insert(
            "chat".to_string(),
            AgentProfile { role: AgentRole::Chat, workdir: "/tmp".into(), skills: vec![], branch: None },
        );
        if autopilot {
            agents.insert(
                "autopilot".to_string(),
                AgentProfile { role: AgentRole::Autopilot, workdir: "/tmp".into(), skills: vec![], branch: None },
            );
        }
        agents.insert(
            "backend".to_string(),
            AgentProfile { role: AgentRole::Worker, workdir: "/tmp".into(), skills: vec![], branch: None },
        );
        Roster::from_parts(agents)
    }

    fn task_complete_meta(id: &str, source_kind: &str, outcome: &str, commit_sha: Option<&str>) -> TaskMeta {
        let mut signals = Signals::new(SignalKind::TaskComplete);
        signals.root_id = Some("root1".to_string());
        signals.source_kind = Some(source_kind.to_string());
        let mut references = References::default();
        references.completed_task_kind = Some(source_kind.to_string());
        references.extra.insert("completedTaskId".to_string(), serde_json::Value::String("src1".to_string()));
        references.extra.insert("receiptOutcome".to_string(), serde_json::Value::String(outcome.to_string()));
        if let Some(sha) = commit_sha {
            references.extra.insert("commitSha".to_string(), serde_json::Value::String(sha.to_string()));
        }
        TaskMeta {
            id: id.to_string(),
            to: vec!["orchestrator".to_string()],
            from: "backend".to_string(),
            priority: Priority::P2,
            title: "TASK_COMPLETE: do it".to_string(),
            signals,
            references,
        }
    }

    #[test]
    fn execute_done_with_commit_is_forwarded_to_chat_and_autopilot() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BusStore::new(tmp.path());
        let roster = roster_with(true);
        store.ensure(&roster).unwrap();
        store
            .deliver(&roster, task_complete_meta("t1-complete-backend", "Execute", "done", Some("a".repeat(40).as_str())), "note".into())
            .unwrap();

        let mut runtime = OrchestratorRuntime::new("orchestrator", store.clone(), roster);
        assert!(run_once(&mut runtime).unwrap());

        assert!(store.inbox_dir("chat", TaskState::New).join("t1-complete-backend-update.md").exists());
        assert!(store.inbox_dir("autopilot", TaskState::New).join("t1-complete-backend-update.md").exists());
    }

    #[test]
    fn non_execute_done_is_forwarded_to_chat_only() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BusStore::new(tmp.path());
        let roster = roster_with(true);
        store.ensure(&roster).unwrap();
        store
            .deliver(&roster, task_complete_meta("t1-complete-backend", "UserRequest", "done", None), "note".into())
            .unwrap();

        let mut runtime = OrchestratorRuntime::new("orchestrator", store.clone(), roster);
        assert!(run_once(&mut runtime).unwrap());

        assert!(store.inbox_dir("chat", TaskState::New).join("t1-complete-backend-update.md").exists());
        assert!(!store.inbox_dir("autopilot", TaskState::New).join("t1-complete-backend-update.md").exists());
    }

    #[test]
    fn review_action_required_packets_sharing_a_root_are_coalesced() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BusStore::new(tmp.path());
        let roster = roster_with(true);
        store.ensure(&roster).unwrap();

        let mut make_meta = |id: &str| {
            let mut signals = Signals::new(SignalKind::ReviewActionRequired);
            signals.root_id = Some("rootA".to_string());
            TaskMeta {
                id: id.to_string(),
                to: vec!["orchestrator".to_string()],
                from: "backend".to_string(),
                priority: Priority::P1,
                title: "needs review".to_string(),
                signals,
                references: References::default(),
            }
        };
        store.deliver(&roster, make_meta("rar1"), "first".into()).unwrap();
        store.deliver(&roster, make_meta("rar2"), "second".into()).unwrap();

        let mut runtime = OrchestratorRuntime::new("orchestrator", store.clone(), roster);
        assert!(run_once(&mut runtime).unwrap());
        assert!(run_once(&mut runtime).unwrap());

        let autopilot_new = store.inbox_dir("autopilot", TaskState::New);
        let entries: Vec<_> = std::fs::read_dir(&autopilot_new).unwrap().collect();
        assert_eq!(entries.len(), 1, "duplicate rootId packets must coalesce into one");

        let rendered = std::fs::read_to_string(autopilot_new.join("review-action-rootA.md")).unwrap();
        assert!(rendered.contains("rar1"));
        assert!(rendered.contains("rar2"));
    }

    #[test]
    fn run_once_returns_false_when_inbox_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BusStore::new(tmp.path());
        let roster = roster_with(true);
        store.ensure(&roster).unwrap();
        let mut runtime = OrchestratorRuntime::new("orchestrator", store, roster);
        assert!(!run_once(&mut runtime).unwrap());
    }
}
