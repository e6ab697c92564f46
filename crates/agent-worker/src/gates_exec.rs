//! Concrete gate executors (C7): the ordered chain's git/process/filesystem
//! steps. Each struct captures what it needs at chain-construction time
//! (timeouts, config toggles, a `BusStore` handle) so it implements
//! `bus_core::gates::Gate`'s minimal `&self` signature.

use bus_core::consult::{ConsultMode, ConsultRequest, ConsultResponse, ConsultVerdict};
use bus_core::gates::{Gate, GateContext, GateOutcome, GateRecord};
use bus_core::roster::Roster;
use bus_core::store::BusStore;
use bus_core::task::{Priority, SignalKind, TaskMeta, TaskState};
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

fn run_git(workdir: &std::path::Path, args: &[&str]) -> std::io::Result<std::process::Output> {
    Command::new("git").args(args).current_dir(workdir).output()
}

/// Gate 1: EXECUTE-kind git preflight. Creates/syncs `workBranch` from
/// `baseSha`, blocks on a dirty tree unless `auto_clean`.
pub struct GitPreflightGate {
    pub auto_clean: bool,
    pub enforce: bool,
}

impl Gate for GitPreflightGate {
    fn name(&self) -> &'static str {
        "git_preflight"
    }

    fn applies(&self, ctx: &GateContext) -> bool {
        ctx.signal_kind == "EXECUTE"
    }

    fn run(&self, ctx: &GateContext) -> GateRecord {
        let Some(git) = &ctx.git else {
            if self.enforce {
                return GateRecord::blocked(
                    true,
                    "missing_git_references",
                    vec!["EXECUTE task has no references.git in enforce mode".into()],
                );
            }
            return GateRecord::skipped(false);
        };

        match run_git(&ctx.workdir, &["rev-parse", "--is-inside-work-tree"]) {
            Ok(out) if out.status.success() => {}
            _ => return GateRecord::blocked(true, "not_a_git_repo", vec!["workdir is not a git repository".into()]),
        }

        let status = match run_git(&ctx.workdir, &["status", "--porcelain"]) {
            Ok(out) => out,
            Err(e) => return GateRecord::blocked(true, "git_status_failed", vec![e.to_string()]),
        };
        if !status.stdout.is_empty() {
            if self.auto_clean {
                let _ = run_git(&ctx.workdir, &["reset", "--hard"]);
                let _ = run_git(&ctx.workdir, &["clean", "-fd"]);
            } else {
                return GateRecord::blocked(
                    true,
                    "dirty_worktree",
                    vec!["worktree has uncommitted changes and auto-clean is disabled".into()],
                );
            }
        }

        if let Some(work_branch) = &git.work_branch {
            let base = git.base_sha.as_deref().unwrap_or("HEAD");
            let result = run_git(&ctx.workdir, &["checkout", "-B", work_branch, base]);
            match result {
                Ok(out) if out.status.success() => {}
                Ok(out) => {
                    return GateRecord::blocked(
                        true,
                        "branch_sync_failed",
                        vec![String::from_utf8_lossy(&out.stderr).to_string()],
                    )
                }
                Err(e) => return GateRecord::blocked(true, "branch_sync_failed", vec![e.to_string()]),
            }
        }

        GateRecord::pass(true)
    }
}

/// Gate shared shape for the two consult-barrier steps (pre-exec,
/// post-review). Dispatches an `OPUS_CONSULT_REQUEST` and blocks waiting
/// for the matching response, via the bus itself (consult agent's reply
/// lands back in this agent's inbox).
pub struct ConsultBarrierGate {
    pub name: &'static str,
    pub enabled: bool,
    pub advisory: bool,
    pub timeout: Duration,
    pub store: Arc<BusStore>,
    pub roster: Roster,
    pub consult_agent: String,
    pub mode: ConsultMode,
}

impl Gate for ConsultBarrierGate {
    fn name(&self) -> &'static str {
        self.name
    }

    fn applies(&self, _ctx: &GateContext) -> bool {
        self.enabled
    }

    fn run(&self, ctx: &GateContext) -> GateRecord {
        let consult_id = format!("{}-{}", ctx.task_id, self.name);
        let request = ConsultRequest {
            version: "v1".into(),
            consult_id: consult_id.clone(),
            round: 1,
            max_rounds: 1,
            mode: self.mode,
            autopilot_hypothesis: format!("task {} is ready to proceed past {}", ctx.task_id, self.name),
            task_context: format!("agent={} signalKind={} taskId={}", ctx.agent, ctx.signal_kind, ctx.task_id),
            prior_round_summary: None,
            questions: Vec::new(),
        };
        let mut meta = TaskMeta {
            id: format!("{consult_id}-request"),
            to: vec![self.consult_agent.clone()],
            from: ctx.agent.clone(),
            priority: Priority::P1,
            title: format!("Opus consult request for {}", ctx.task_id),
            signals: bus_core::task::Signals::new(SignalKind::OpusConsultRequest),
            references: Default::default(),
        };
        meta.signals.root_id = ctx.root_id.clone();
        meta.references.opus = Some(serde_json::to_value(&request).expect("ConsultRequest always serializes"));
        if let Err(e) = self.store.deliver(
            &self.roster,
            meta,
            format!("Consult request for task `{}`.", ctx.task_id),
        ) {
            let reason = "opus_consult_dispatch_failed";
            if self.advisory {
                warn!(gate = self.name, error = %e, "consult request dispatch failed, proceeding in advisory mode");
                return GateRecord::warn(false, reason);
            }
            return GateRecord::blocked(true, reason, vec![e.to_string()]);
        }

        let deadline = std::time::Instant::now() + self.timeout;
        loop {
            let new_dir = self.store.inbox_dir(&ctx.agent, TaskState::New);
            if let Ok(entries) = std::fs::read_dir(&new_dir) {
                for entry in entries.flatten() {
                    let path = entry.path();
                    if path.extension().and_then(|e| e.to_str()) != Some("md") {
                        continue;
                    }
                    let Ok(text) = std::fs::read_to_string(&path) else { continue };
                    let Ok(packet) = bus_core::frontmatter::parse(&text) else { continue };
                    if packet.meta.signals.kind != SignalKind::OpusConsultResponse {
                        continue;
                    }
                    let Some(opus) = &packet.meta.references.opus else { continue };
                    if opus.get("consultId").and_then(|v| v.as_str()) != Some(consult_id.as_str()) {
                        continue;
                    }
                    let response: ConsultResponse = match serde_json::from_value(opus.clone()) {
                        Ok(r) => r,
                        Err(e) => {
                            return GateRecord::blocked(
                                true,
                                "opus_consult_response_unparseable",
                                vec![e.to_string()],
                            );
                        }
                    };
                    if let Err(e) = bus_core::consult::validate_consult_response(&response) {
                        return GateRecord::blocked(true, "opus_consult_response_invalid", vec![e.to_string()]);
                    }
                    return match response.verdict {
                        ConsultVerdict::Block => {
                            GateRecord::blocked(true, "opus_consult_block", vec![response.rationale.clone()])
                        }
                        ConsultVerdict::Warn => GateRecord::warn(true, "opus_consult_warn"),
                        ConsultVerdict::Pass => GateRecord::pass(true),
                    };
                }
            }
            if std::time::Instant::now() >= deadline {
                let reason = "opus_consult_response_timeout";
                if self.advisory {
                    warn!(gate = self.name, "consult response timed out, proceeding in advisory mode");
                    return GateRecord::warn(false, reason);
                }
                return GateRecord::blocked(true, reason, vec!["no matching OPUS_CONSULT_RESPONSE arrived in time".into()]);
            }
            std::thread::sleep(Duration::from_millis(250));
        }
    }
}

/// Gate 4: review, required for EXECUTE completions with a non-empty
/// `commitSha`. The actual review turn is run by the worker loop before
/// this gate executes; this gate only validates that a review record is
/// present and passing.
pub struct ReviewGate {
    pub review_ran: bool,
    pub review_verdict: Option<String>,
    pub review_target_commit_sha: Option<String>,
}

impl Gate for ReviewGate {
    fn name(&self) -> &'static str {
        "review"
    }

    fn applies(&self, ctx: &GateContext) -> bool {
        ctx.signal_kind == "EXECUTE" && ctx.commit_sha.is_some()
    }

    fn run(&self, ctx: &GateContext) -> GateRecord {
        if !self.review_ran {
            return GateRecord::blocked(true, "review_not_ran", vec!["review.ran was false or missing".into()]);
        }
        if self.review_target_commit_sha.is_some() && self.review_target_commit_sha != ctx.commit_sha {
            return GateRecord::blocked(
                true,
                "review_target_mismatch",
                vec![format!(
                    "review.targetCommitSha ({:?}) did not match the completed commit ({:?})",
                    self.review_target_commit_sha, ctx.commit_sha
                )],
            );
        }
        match self.review_verdict.as_deref() {
            Some("pass") | Some("changes_requested") => GateRecord::pass(true),
            Some(other) => GateRecord::blocked(true, "review_block", vec![format!("review verdict: {other}")]),
            None => GateRecord::blocked(true, "review_missing_verdict", vec![]),
        }
    }
}

/// Gate 5: code-quality. The external script's pass/fail plus the model's
/// own `qualityReview` block must both be present and clean.
pub struct CodeQualityGate {
    pub enabled: bool,
    pub script_passed: bool,
    pub quality_review_present: bool,
}

impl Gate for CodeQualityGate {
    fn name(&self) -> &'static str {
        "code_quality"
    }

    fn applies(&self, _ctx: &GateContext) -> bool {
        self.enabled
    }

    fn run(&self, _ctx: &GateContext) -> GateRecord {
        if !self.script_passed {
            return GateRecord::blocked(true, "quality_script_failed", vec![]);
        }
        if !self.quality_review_present {
            return GateRecord::blocked(
                true,
                "quality_review_missing",
                vec!["script pass alone is insufficient; qualityReview block was absent".into()],
            );
        }
        GateRecord::pass(true)
    }
}

/// Gate 6: skill-evidence. `testsToRun[]` must include the required
/// commands and `artifacts[]` must reference a log file that exists.
pub struct SkillEvidenceGate {
    pub enabled: bool,
    pub required_commands: Vec<String>,
    pub tests_to_run: Vec<String>,
    pub artifact_paths: Vec<std::path::PathBuf>,
}

impl Gate for SkillEvidenceGate {
    fn name(&self) -> &'static str {
        "skill_evidence"
    }

    fn applies(&self, _ctx: &GateContext) -> bool {
        self.enabled
    }

    fn run(&self, _ctx: &GateContext) -> GateRecord {
        let mut errors = Vec::new();
        for required in &self.required_commands {
            if !self.tests_to_run.iter().any(|t| t.contains(required.as_str())) {
                errors.push(format!("testsToRun is missing required command `{required}`"));
            }
        }
        if self.artifact_paths.is_empty() {
            errors.push("artifacts[] did not reference any log file".into());
        } else {
            for path in &self.artifact_paths {
                if !path.exists() {
                    errors.push(format!("referenced artifact log does not exist: {}", path.display()));
                }
            }
        }
        if errors.is_empty() {
            GateRecord::pass(true)
        } else {
            GateRecord::blocked(true, "skill_evidence_missing", errors)
        }
    }
}

/// Gate 7: observer-drain. Before a ready closure, every sibling digest
/// packet for the same `rootId` must already be out of `new/`/`seen/`.
pub struct ObserverDrainGate {
    pub enabled: bool,
    pub store: Arc<BusStore>,
}

impl Gate for ObserverDrainGate {
    fn name(&self) -> &'static str {
        "observer_drain"
    }

    fn applies(&self, ctx: &GateContext) -> bool {
        self.enabled && ctx.root_id.is_some()
    }

    fn run(&self, ctx: &GateContext) -> GateRecord {
        let Some(root_id) = &ctx.root_id else {
            return GateRecord::pass(false);
        };
        let mut pending = Vec::new();
        for state in [TaskState::New, TaskState::Seen] {
            let dir = self.store.inbox_dir(&ctx.agent, state);
            let Ok(entries) = std::fs::read_dir(&dir) else { continue };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("md") {
                    continue;
                }
                if path.file_stem().and_then(|s| s.to_str()) == Some(ctx.task_id.as_str()) {
                    continue;
                }
                let Ok(text) = std::fs::read_to_string(&path) else { continue };
                let Ok(packet) = bus_core::frontmatter::parse(&text) else { continue };
                if packet.meta.signals.root_id.as_deref() == Some(root_id.as_str()) {
                    pending.push(packet.meta.id);
                }
            }
        }
        if pending.is_empty() {
            GateRecord::pass(true)
        } else {
            GateRecord::blocked(true, "pending_sibling_digests", pending)
        }
    }
}

/// Gate 8: delegate. Spec §2 names "delegate" as one of this chain's six
/// policies but the detailed step list in §4.7 never describes it; resolved
/// here (see DESIGN.md) as: when enabled and the worker output's
/// `autopilotControl` names a delegate target, a follow-up addressed to that
/// agent must actually have been dispatched.
pub struct DelegateGate {
    pub enabled: bool,
    pub declared_delegate: Option<String>,
    pub follow_up_targets: Vec<String>,
}

impl Gate for DelegateGate {
    fn name(&self) -> &'static str {
        "delegate"
    }

    fn applies(&self, _ctx: &GateContext) -> bool {
        self.enabled && self.declared_delegate.is_some()
    }

    fn run(&self, _ctx: &GateContext) -> GateRecord {
        let Some(target) = &self.declared_delegate else {
            return GateRecord::pass(false);
        };
        if self.follow_up_targets.iter().any(|t| t == target) {
            GateRecord::pass(true)
        } else {
            GateRecord::blocked(
                true,
                "delegate_target_missing",
                vec![format!("autopilotControl declared delegate `{target}` but no follow-up was dispatched to it")],
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bus_core::gates::GateContext;

    fn ctx(signal_kind: &str) -> GateContext {
        GateContext {
            agent: "backend".into(),
            task_id: "t1".into(),
            root_id: Some("r1".into()),
            signal_kind: signal_kind.into(),
            commit_sha: None,
            workdir: std::path::PathBuf::from("."),
            git: None,
        }
    }

    fn roster_with(agents: &[&str]) -> Roster {
        let mut m = std::collections::HashMap::new();
        for name in agents {
            m.insert(
                name.to_string(),
                bus_core::roster::AgentProfile {
                    role: bus_core::roster::AgentRole::Worker,
                    workdir: "x".into(),
                    skills: vec![],
                    branch: None,
                },
            );
        }
        Roster::from_parts(m)
    }

    fn consult_gate(store: &Arc<BusStore>, roster: &Roster, advisory: bool, timeout: Duration) -> ConsultBarrierGate {
        ConsultBarrierGate {
            name: "opus_consult_pre_exec",
            enabled: true,
            advisory,
            timeout,
            store: store.clone(),
            roster: roster.clone(),
            consult_agent: "opus".into(),
            mode: ConsultMode::PreExec,
        }
    }

    fn deliver_response(store: &Arc<BusStore>, roster: &Roster, consult_id: &str, response: &ConsultResponse) {
        let mut meta = TaskMeta {
            id: format!("{consult_id}-response"),
            to: vec!["backend".into()],
            from: "opus".into(),
            priority: Priority::P1,
            title: "Opus consult response".into(),
            signals: bus_core::task::Signals::new(SignalKind::OpusConsultResponse),
            references: Default::default(),
        };
        meta.references.opus = Some(serde_json::to_value(response).unwrap());
        store.deliver(roster, meta, "response body".into()).unwrap();
    }

    fn base_response(consult_id: &str, verdict: ConsultVerdict) -> ConsultResponse {
        ConsultResponse {
            version: "v1".into(),
            consult_id: consult_id.into(),
            round: 1,
            r#final: true,
            verdict,
            rationale: "looks fine".into(),
            suggested_plan: vec![],
            required_questions: vec![],
            required_actions: if verdict == ConsultVerdict::Block {
                vec!["fix it".into()]
            } else {
                vec![]
            },
            retry_prompt_patch: None,
            unresolved_critical_questions: vec![],
            reason_code: "opus_consult_pass".into(),
        }
    }

    #[test]
    fn consult_barrier_gate_delivers_a_request_packet_before_polling() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(BusStore::new(tmp.path()));
        let roster = roster_with(&["backend", "opus"]);
        store.ensure(&roster).unwrap();
        let gate = consult_gate(&store, &roster, false, Duration::from_millis(50));

        let result = gate.run(&ctx("EXECUTE"));
        assert!(result.is_block());
        assert_eq!(result.reason_code.as_deref(), Some("opus_consult_response_timeout"));

        let opus_new = store.inbox_dir("opus", TaskState::New);
        let entries: Vec<_> = std::fs::read_dir(&opus_new).unwrap().flatten().collect();
        assert_eq!(entries.len(), 1, "consult request was never delivered to the consult agent");
        let text = std::fs::read_to_string(entries[0].path()).unwrap();
        let packet = bus_core::frontmatter::parse(&text).unwrap();
        assert_eq!(packet.meta.signals.kind, SignalKind::OpusConsultRequest);
        let opus_payload = packet.meta.references.opus.unwrap();
        assert_eq!(opus_payload.get("consultId").and_then(|v| v.as_str()), Some("t1-opus_consult_pre_exec"));
    }

    #[test]
    fn consult_barrier_gate_passes_on_pass_verdict() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(BusStore::new(tmp.path()));
        let roster = roster_with(&["backend", "opus"]);
        store.ensure(&roster).unwrap();
        let gate = consult_gate(&store, &roster, false, Duration::from_secs(5));
        let consult_id = "t1-opus_consult_pre_exec";
        deliver_response(&store, &roster, consult_id, &base_response(consult_id, ConsultVerdict::Pass));
        assert!(!gate.run(&ctx("EXECUTE")).is_block());
    }

    #[test]
    fn consult_barrier_gate_blocks_on_block_verdict() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(BusStore::new(tmp.path()));
        let roster = roster_with(&["backend", "opus"]);
        store.ensure(&roster).unwrap();
        let gate = consult_gate(&store, &roster, false, Duration::from_secs(5));
        let consult_id = "t1-opus_consult_pre_exec";
        deliver_response(&store, &roster, consult_id, &base_response(consult_id, ConsultVerdict::Block));
        let record = gate.run(&ctx("EXECUTE"));
        assert!(record.is_block());
        assert_eq!(record.reason_code.as_deref(), Some("opus_consult_block"));
    }

    #[test]
    fn consult_barrier_gate_blocks_on_schema_invalid_response() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(BusStore::new(tmp.path()));
        let roster = roster_with(&["backend", "opus"]);
        store.ensure(&roster).unwrap();
        let gate = consult_gate(&store, &roster, false, Duration::from_secs(5));
        let consult_id = "t1-opus_consult_pre_exec";
        // verdict=block with an empty required_actions list fails validate_consult_response.
        let mut response = base_response(consult_id, ConsultVerdict::Block);
        response.required_actions.clear();
        deliver_response(&store, &roster, consult_id, &response);
        let record = gate.run(&ctx("EXECUTE"));
        assert!(record.is_block());
        assert_eq!(record.reason_code.as_deref(), Some("opus_consult_response_invalid"));
    }

    #[test]
    fn review_gate_skips_without_commit_sha() {
        let gate = ReviewGate {
            review_ran: false,
            review_verdict: None,
            review_target_commit_sha: None,
        };
        assert!(!gate.applies(&ctx("EXECUTE")));
    }

    #[test]
    fn review_gate_blocks_on_missing_review() {
        let gate = ReviewGate {
            review_ran: false,
            review_verdict: None,
            review_target_commit_sha: None,
        };
        let mut c = ctx("EXECUTE");
        c.commit_sha = Some("abc1234".into());
        assert!(gate.applies(&c));
        assert!(gate.run(&c).is_block());
    }

    #[test]
    fn review_gate_blocks_when_target_commit_sha_does_not_match() {
        let gate = ReviewGate {
            review_ran: true,
            review_verdict: Some("pass".into()),
            review_target_commit_sha: Some("deadbeef".into()),
        };
        let mut c = ctx("EXECUTE");
        c.commit_sha = Some("abc1234".into());
        assert!(gate.run(&c).is_block());
    }

    #[test]
    fn review_gate_passes_when_target_commit_sha_matches() {
        let gate = ReviewGate {
            review_ran: true,
            review_verdict: Some("pass".into()),
            review_target_commit_sha: Some("abc1234".into()),
        };
        let mut c = ctx("EXECUTE");
        c.commit_sha = Some("abc1234".into());
        assert!(!gate.run(&c).is_block());
    }

    #[test]
    fn code_quality_gate_requires_quality_review_block() {
        let gate = CodeQualityGate {
            enabled: true,
            script_passed: true,
            quality_review_present: false,
        };
        assert!(gate.run(&ctx("EXECUTE")).is_block());
    }

    #[test]
    fn skill_evidence_gate_checks_required_commands_and_artifacts() {
        let tmp = tempfile::tempdir().unwrap();
        let log = tmp.path().join("debrief.log");
        std::fs::write(&log, "ok").unwrap();
        let gate = SkillEvidenceGate {
            enabled: true,
            required_commands: vec!["debrief".into()],
            tests_to_run: vec!["run debrief".into()],
            artifact_paths: vec![log],
        };
        assert!(!gate.run(&ctx("EXECUTE")).is_block());
    }

    #[test]
    fn observer_drain_gate_blocks_on_pending_sibling() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Arc::new(BusStore::new(tmp.path()));
        let roster = bus_core::roster::Roster::from_parts({
            let mut m = std::collections::HashMap::new();
            m.insert(
                "backend".to_string(),
                bus_core::roster::AgentProfile {
                    role: bus_core::roster::AgentRole::Worker,
                    workdir: "x".into(),
                    skills: vec![],
                    branch: None,
                },
            );
            m
        });
        store.ensure(&roster).unwrap();

        let mut sibling = bus_core::task::TaskMeta {
            id: "sibling".into(),
            to: vec!["backend".into()],
            from: "orchestrator".into(),
            priority: bus_core::task::Priority::P2,
            title: "digest".into(),
            signals: bus_core::task::Signals::new(bus_core::task::SignalKind::OrchestratorUpdate),
            references: Default::default(),
        };
        sibling.signals.root_id = Some("r1".into());
        store.deliver(&roster, sibling, "digest body".into()).unwrap();

        let gate = ObserverDrainGate {
            enabled: true,
            store: store.clone(),
        };
        let record = gate.run(&ctx("EXECUTE"));
        assert!(record.is_block());
    }

    #[test]
    fn delegate_gate_blocks_when_declared_target_was_never_dispatched() {
        let gate = DelegateGate {
            enabled: true,
            declared_delegate: Some("reviewer".into()),
            follow_up_targets: vec!["chat".into()],
        };
        assert!(gate.applies(&ctx("EXECUTE")));
        assert!(gate.run(&ctx("EXECUTE")).is_block());
    }

    #[test]
    fn delegate_gate_passes_when_target_was_dispatched() {
        let gate = DelegateGate {
            enabled: true,
            declared_delegate: Some("reviewer".into()),
            follow_up_targets: vec!["reviewer".into(), "chat".into()],
        };
        assert!(!gate.run(&ctx("EXECUTE")).is_block());
    }

    #[test]
    fn delegate_gate_does_not_apply_without_a_declared_target() {
        let gate = DelegateGate {
            enabled: true,
            declared_delegate: None,
            follow_up_targets: vec![],
        };
        assert!(!gate.applies(&ctx("EXECUTE")));
    }
}
