//! The generic engine-driven worker loop (C6): claim one task, run it
//! through zero or more engine turns (restarting on a mid-turn task-update
//! interrupt, retrying once on a schema-invalid output), run the gate
//! chain, dispatch follow-ups, and close. Grounded on the teacher's
//! `main()` outer loop shape in `swarm-agents/main.rs` (resolve config →
//! pick highest-priority open work → process it fully → record the
//! outcome → loop) generalized from "claim a beads issue" to "claim a bus
//! packet".

use crate::engine::app_server::AppServerEngine;
use crate::engine::exec::ExecEngine;
use crate::engine::{EngineDriver, EngineError, ThreadScope, TurnOpts};
use crate::gates_exec::{
    CodeQualityGate, ConsultBarrierGate, DelegateGate, GitPreflightGate, ObserverDrainGate,
    ReviewGate, SkillEvidenceGate,
};
use crate::prompt_build::{build_segments, OpenTaskSummary};
use crate::telemetry;
use crate::watcher::Watcher;
use bus_core::config::{EngineKind, GateMode, WorkerConfig};
use bus_core::followups::dispatch_follow_ups;
use bus_core::gates::{Gate, GateContext, run_chain};
use bus_core::limiter::{acquire_slot, read_cooldown};
use bus_core::output::parse_worker_output;
use bus_core::paths::expand_template;
use bus_core::pins::{PinScope, PinTable, RootSessionRecord};
use bus_core::prompt::WarmStartState;
use bus_core::receipt::Outcome;
use bus_core::roster::Roster;
use bus_core::store::{BusError, BusStore};
use bus_core::task::{Priority, SignalKind, TaskState};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::Instrument;

const ENGINE_DOMAIN: &str = "engine";
const MAX_TASK_UPDATE_RESTARTS: u32 = 8;
/// Exit code the engine's own guard-bin uses for a blocked protected
/// action (push to a protected branch, `gh pr merge`). Matches spec §6/§7.
const GUARDRAIL_EXIT_CODE: i32 = 49;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Limiter(#[from] bus_core::limiter::LimiterError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Output(#[from] bus_core::output::OutputError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("engine turn task panicked or was cancelled")]
    EngineTaskJoin,
    #[error("task-update restart bound exceeded for this turn")]
    RestartBoundExceeded,
    #[error("guard-bin blocked a protected action")]
    GuardrailBlock,
}

/// Per-process worker state held across claim/process/close cycles: the
/// (possibly persisted) engine driver, the app-server thread pin table, and
/// warm-start fingerprints. One of these lives for the lifetime of a single
/// `--agent` worker process.
pub struct WorkerRuntime {
    pub agent: String,
    pub store: BusStore,
    pub roster: Roster,
    pub config: WorkerConfig,
    pub engine_bin: PathBuf,
    engine: Option<Box<dyn EngineDriver + Send>>,
    pins: PinTable,
    warm_start: WarmStartState,
}

impl WorkerRuntime {
    pub fn new(
        agent: impl Into<String>,
        store: BusStore,
        roster: Roster,
        config: WorkerConfig,
        engine_bin: PathBuf,
    ) -> Result<Self, WorkerError> {
        let agent = agent.into();
        let state_dir = store.state_dir();
        std::fs::create_dir_all(&state_dir)?;
        let pins = PinTable::load(&state_dir, &agent)?;
        Ok(Self {
            agent,
            store,
            roster,
            config,
            engine_bin,
            engine: None,
            pins,
            warm_start: WarmStartState::new(),
        })
    }

    /// Reuse the stashed engine (app-server with persistence enabled), else
    /// build a fresh one. `ExecEngine` is cheap and stateless between turns
    /// so a fresh instance is built whenever none is stashed.
    fn take_or_build_engine(&mut self) -> Result<Box<dyn EngineDriver + Send>, WorkerError> {
        if matches!(self.config.engine, EngineKind::AppServer) && self.config.app_server_persist {
            if let Some(engine) = self.engine.take() {
                return Ok(engine);
            }
        }
        match self.config.engine {
            EngineKind::Exec => Ok(Box::new(ExecEngine::new(self.engine_bin.clone()))),
            EngineKind::AppServer => {
                Ok(Box::new(AppServerEngine::spawn(&self.engine_bin).map_err(WorkerError::Engine)?))
            }
        }
    }

    fn stash_engine(&mut self, engine: Box<dyn EngineDriver + Send>) {
        if matches!(self.config.engine, EngineKind::AppServer) && self.config.app_server_persist {
            self.engine = Some(engine);
        }
    }

    fn build_turn_opts(
        &self,
        scope: ThreadScope,
        workdir: PathBuf,
        resume_thread_id: Option<String>,
        is_review: bool,
    ) -> TurnOpts {
        let sandbox_policy = if self.roster.is_autopilot(&self.agent) {
            "dangerFullAccess"
        } else {
            "workspace-write"
        }
        .to_string();
        TurnOpts {
            scope,
            timeout: self.config.engine_exec_timeout,
            is_review,
            workdir,
            resume_thread_id,
            sandbox_policy,
            add_dirs: Vec::new(),
            config: Vec::new(),
        }
    }

    /// Expand the agent's roster workdir template against `REPO_ROOT` /
    /// `AGENTIC_WORKTREES_DIR`, falling back to the current directory when
    /// neither is set.
    fn resolve_workdir(&self) -> PathBuf {
        let template = self
            .roster
            .agent(&self.agent)
            .map(|p| p.workdir.clone())
            .unwrap_or_default();
        let repo_root = std::env::var("REPO_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| std::env::current_dir().unwrap_or_default());
        let worktrees_dir = std::env::var("AGENTIC_WORKTREES_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| repo_root.join(".worktrees"));
        expand_template(&template, &repo_root, &worktrees_dir)
    }

    /// Resolve each declared skill name to its checklist body, read from
    /// `<bus_root>/skills/<name>.md` when present.
    fn load_skill_bodies(&self, names: &[String]) -> Vec<(String, String)> {
        let skills_dir = self.store.root().join("skills");
        names
            .iter()
            .map(|name| {
                let path = skills_dir.join(format!("{name}.md"));
                let body = std::fs::read_to_string(&path)
                    .unwrap_or_else(|_| format!("Follow the `{name}` skill checklist."));
                (name.clone(), body)
            })
            .collect()
    }

    /// Record a completed turn's thread id against its pin scope, rotating
    /// (clearing) the pin once `autopilot_session_rotate_turns` is reached.
    fn record_turn_pin(&mut self, scope: &ThreadScope, thread_id: Option<String>) {
        let Some(thread_id) = thread_id else { return };
        let Some(pin_scope) = to_pin_scope(scope) else { return };
        let mut record = self
            .pins
            .get(&pin_scope)
            .cloned()
            .unwrap_or_else(|| RootSessionRecord::new(thread_id.clone()));
        record.thread_id = thread_id;
        record.record_turn();
        if self.config.autopilot_session_rotate_turns > 0
            && record.turn_count >= self.config.autopilot_session_rotate_turns
        {
            self.pins.clear(&pin_scope);
        } else {
            self.pins.set(pin_scope, record);
        }
        let _ = self.pins.save();
    }
}

fn to_pin_scope(scope: &ThreadScope) -> Option<PinScope> {
    match scope {
        ThreadScope::None => None,
        ThreadScope::Global => Some(PinScope::Global),
        ThreadScope::Root(root_id) => Some(PinScope::Root { root_id: root_id.clone() }),
    }
}

fn thread_scope(agent: &str, roster: &Roster, root_id: Option<&str>) -> ThreadScope {
    if roster.is_autopilot(agent) {
        match root_id {
            Some(r) => ThreadScope::Root(r.to_string()),
            None => ThreadScope::Global,
        }
    } else {
        ThreadScope::None
    }
}

/// Render a `SignalKind` the way it appears on the wire (`SCREAMING_SNAKE_CASE`)
/// rather than its `Display`/`Debug` form, since gate toggles and gate
/// `applies()` checks match against the serialized form.
fn signal_kind_str(kind: SignalKind) -> String {
    serde_json::to_value(kind)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

/// Pick the oldest, highest-priority packet in `agent`'s `new/` dir without
/// claiming it.
/// Highest-priority, oldest-first open packet in `agent`'s inbox, skipping
/// any id in `excluded` — ids already known to have lost a claim race this
/// cycle, so a retry after `AlreadyClaimed`/`NotFound` advances to the next
/// candidate instead of spinning on the same packet.
fn pick_next_excluding(store: &BusStore, agent: &str, excluded: &std::collections::HashSet<String>) -> Option<String> {
    let dir = store.inbox_dir(agent, TaskState::New);
    let entries = std::fs::read_dir(&dir).ok()?;
    let mut candidates: Vec<(Priority, SystemTime, String)> = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("md") {
            continue;
        }
        let Some(id) = path.file_stem().and_then(|s| s.to_str()) else { continue };
        if excluded.contains(id) {
            continue;
        }
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

/// Every other packet still open (`new`/`seen`) in `agent`'s inbox, for the
/// prompt's "other open tasks" digest.
fn list_open_tasks(store: &BusStore, agent: &str, exclude_id: &str) -> Vec<OpenTaskSummary> {
    let mut out = Vec::new();
    for state in [TaskState::New, TaskState::Seen] {
        let dir = store.inbox_dir(agent, state);
        let Ok(entries) = std::fs::read_dir(&dir) else { continue };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            if id == exclude_id {
                continue;
            }
            if let Ok(text) = std::fs::read_to_string(&path) {
                if let Ok(packet) = bus_core::frontmatter::parse(&text) {
                    out.push(OpenTaskSummary { id: id.to_string(), title: packet.meta.title });
                }
            }
        }
    }
    out
}

/// Runs the built-in review turn(s) the review gate requires for an EXECUTE
/// completion with a non-empty `commitSha` (spec §4.7 step 4). Commit scope
/// runs one turn; PR scope resolves its ordered commit list via `gh pr view`
/// (`review.rs`) and runs one turn per commit, so every commit in the PR is
/// reviewed. Each turn is validated against the review sub-contract with one
/// retry on schema miss, matching the main turn's retry-patch shape.
async fn run_review_turns(
    runtime: &mut WorkerRuntime,
    workdir: &Path,
    thread_scope: ThreadScope,
    commit_sha: &str,
    review_target: Option<&serde_json::Value>,
) -> Result<bus_core::output::Review, WorkerError> {
    use crate::review::{build_review_prompt, resolve_pr_commits, ReviewScope};

    let review_scope = match review_target.and_then(|v| v.get("scope")).and_then(|v| v.as_str()) {
        Some("pr") => {
            let pr_number = review_target
                .and_then(|v| v.get("prNumber"))
                .and_then(|v| v.as_u64())
                .unwrap_or(0);
            let commits = resolve_pr_commits(workdir, pr_number).unwrap_or_else(|e| {
                tracing::warn!(error = %e, "gh pr view failed; falling back to single-commit review scope");
                vec![commit_sha.to_string()]
            });
            ReviewScope::Pr { number: pr_number, commits }
        }
        _ => ReviewScope::Commit(commit_sha.to_string()),
    };

    let mut reviewed_commits = Vec::new();
    let mut findings_total: u32 = 0;
    let mut summaries = Vec::new();
    let mut last_verdict = None;
    let mut last_evidence = None;

    for commit in review_scope.commits() {
        let mut retry_patch: Option<String> = None;
        let review = loop {
            let prompt = build_review_prompt(&commit, &review_scope, retry_patch.as_deref());
            let opts = runtime.build_turn_opts(thread_scope.clone(), workdir.to_path_buf(), None, true);
            let mut engine = runtime.take_or_build_engine()?;
            let joined = tokio::task::spawn_blocking(move || {
                let result = engine.run_turn(&prompt, &opts);
                (engine, result)
            })
            .await
            .map_err(|_| WorkerError::EngineTaskJoin)?;
            let (engine, turn_res) = joined;
            runtime.stash_engine(engine);
            match turn_res {
                Ok(turn_result) => match bus_core::output::parse_review_output(&turn_result.final_message) {
                    Ok(review) => break review,
                    Err(e) if retry_patch.is_none() => {
                        retry_patch = Some(e.to_string());
                        continue;
                    }
                    Err(e) => return Err(WorkerError::Output(e)),
                },
                Err(e) => return Err(WorkerError::Engine(e)),
            }
        };
        findings_total += review.findings_count;
        if !review.summary.is_empty() {
            summaries.push(review.summary.clone());
        }
        last_verdict = review.verdict.clone();
        last_evidence = review.evidence.clone();
        reviewed_commits.push(commit);
    }

    Ok(bus_core::output::Review {
        ran: true,
        method: "built_in_review".to_string(),
        target_commit_sha: review_scope.target_commit_sha(),
        scope: review_scope.label().to_string(),
        reviewed_commits,
        summary: summaries.join("\n"),
        findings_count: findings_total,
        verdict: last_verdict,
        evidence: last_evidence,
    })
}

/// Best-effort `git diff HEAD` text for the forbidden-marker scan; empty
/// when `workdir` isn't a git repository (a no-op diff, not an error).
fn capture_diff(workdir: &Path) -> String {
    Command::new("git")
        .args(["diff", "HEAD"])
        .current_dir(workdir)
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).to_string())
        .unwrap_or_default()
}

/// Run `AGENTIC_CODE_QUALITY_SCRIPT` in `workdir` if configured; absent a
/// script, the gate relies solely on `qualityReview` being present.
fn run_code_quality_script(workdir: &Path) -> bool {
    match std::env::var("AGENTIC_CODE_QUALITY_SCRIPT") {
        Ok(script) if !script.is_empty() => Command::new("sh")
            .arg("-c")
            .arg(&script)
            .current_dir(workdir)
            .status()
            .map(|s| s.success())
            .unwrap_or(false),
        _ => true,
    }
}

/// Whether `err` is a lost-claim-race outcome rather than a real failure:
/// another worker (or a concurrent run of this same one in tests) won the
/// rename onto the same packet between `pick_next_excluding` and `claim`.
/// Expected under contention and never fatal to the loop.
fn is_claim_race(err: &WorkerError) -> bool {
    matches!(
        err,
        WorkerError::Bus(BusError::AlreadyClaimed { .. }) | WorkerError::Bus(BusError::NotFound { .. })
    )
}

/// Acquire the engine-domain limiter slot, pick up the next task in
/// `runtime.agent`'s inbox, process it end to end, and close it. Returns
/// `Ok(false)` when there was nothing to do (empty inbox or an active
/// cooldown) rather than an error. A lost claim race on the chosen packet
/// (`is_claim_race`) is retried against the next candidate rather than
/// surfaced as an error.
pub async fn run_once(runtime: &mut WorkerRuntime) -> Result<bool, WorkerError> {
    let state_dir = runtime.store.state_dir();

    if read_cooldown(&state_dir, ENGINE_DOMAIN)?.is_some() {
        return Ok(false);
    }

    let mut excluded: std::collections::HashSet<String> = std::collections::HashSet::new();
    loop {
        let Some(id) = pick_next_excluding(&runtime.store, &runtime.agent, &excluded) else {
            return Ok(false);
        };

        let lease = acquire_slot(
            &state_dir,
            ENGINE_DOMAIN,
            &runtime.agent,
            runtime.config.engine_global_max_inflight,
            Duration::from_secs(600),
        )?;

        let span = telemetry::loop_span(&runtime.agent, &id);
        let started = std::time::Instant::now();
        let result = process_claimed_task(runtime, &id).instrument(span.clone()).await;

        if let Err(e) = &result {
            if is_claim_race(e) {
                drop(lease);
                excluded.insert(id);
                continue;
            }
        }

        telemetry::record_loop_result(
            &span,
            if result.is_ok() { "done" } else { "error" },
            started.elapsed().as_millis() as u64,
        );

        drop(lease);
        return result.map(|_| true);
    }
}

async fn process_claimed_task(runtime: &mut WorkerRuntime, id: &str) -> Result<(), WorkerError> {
    let agent = runtime.agent.clone();
    runtime.store.claim(&agent, id)?;

    let skills_names = runtime
        .roster
        .agent(&agent)
        .map(|p| p.skills.clone())
        .unwrap_or_default();
    let skills = runtime.load_skill_bodies(&skills_names);
    let workdir = runtime.resolve_workdir();

    let restart_count = Arc::new(AtomicU32::new(0));
    let mut schema_retry_patch: Option<String> = None;
    let mut schema_attempts: u32 = 0;
    let mut scope = ThreadScope::None;

    let (mut output, final_packet) = loop {
        let current = runtime.store.open(&agent, id, false)?.packet;
        scope = thread_scope(&agent, &runtime.roster, current.meta.signals.root_id.as_deref());
        let open_tasks = list_open_tasks(&runtime.store, &agent, id);
        let segments = build_segments(&agent, &skills, &current, &open_tasks, schema_retry_patch.as_deref());
        let prompt = runtime.warm_start.render(&segments);

        let in_progress_path = runtime.store.inbox_dir(&agent, TaskState::InProgress).join(format!("{id}.md"));
        let baseline = std::fs::metadata(&in_progress_path).and_then(|m| m.modified())?;
        let (watcher, turn_token) = Watcher::spawn(
            in_progress_path,
            baseline,
            runtime.config.task_update_poll,
            MAX_TASK_UPDATE_RESTARTS,
            restart_count.clone(),
        );

        let resume_thread_id = to_pin_scope(&scope)
            .as_ref()
            .and_then(|s| runtime.pins.get(s))
            .map(|r| r.thread_id.clone());
        let opts = runtime.build_turn_opts(scope.clone(), workdir.clone(), resume_thread_id, false);

        let mut engine = runtime.take_or_build_engine()?;
        let interrupt_handle = engine.interrupt_handle();
        let watch_guard = tokio::spawn({
            let turn_token = turn_token.clone();
            async move {
                turn_token.cancelled().await;
                interrupt_handle.fire();
            }
        });

        let joined = tokio::task::spawn_blocking(move || {
            let result = engine.run_turn(&prompt, &opts);
            (engine, result)
        })
        .await
        .map_err(|_| WorkerError::EngineTaskJoin)?;
        let (engine, turn_res) = joined;
        watch_guard.abort();
        watcher.stop().await;

        match turn_res {
            Ok(turn_result) => {
                runtime.record_turn_pin(&scope, turn_result.thread_id.clone());
                runtime.stash_engine(engine);
                let diff = capture_diff(&workdir);
                match parse_worker_output(&turn_result.final_message, &diff) {
                    Ok(parsed) => break (parsed, current),
                    Err(e) => {
                        schema_attempts += 1;
                        if schema_attempts > 1 {
                            return Err(WorkerError::Output(e));
                        }
                        schema_retry_patch = Some(e.to_string());
                        continue;
                    }
                }
            }
            Err(EngineError::Interrupted) => {
                runtime.stash_engine(engine);
                if restart_count.load(Ordering::SeqCst) > MAX_TASK_UPDATE_RESTARTS {
                    return Err(WorkerError::RestartBoundExceeded);
                }
                continue;
            }
            Err(EngineError::Crashed(Some(GUARDRAIL_EXIT_CODE))) => {
                runtime.stash_engine(engine);
                runtime.store.close(
                    &runtime.roster,
                    &agent,
                    id,
                    Outcome::Blocked,
                    "blocked by guard-bin: protected action rejected".to_string(),
                    None,
                    HashMap::new(),
                    None,
                )?;
                return Err(WorkerError::GuardrailBlock);
            }
            Err(other) => return Err(WorkerError::Engine(other)),
        }
    };
    let kind_str = signal_kind_str(final_packet.meta.signals.kind);

    let review_required = kind_str == "EXECUTE" && output.commit_sha.is_some();
    let review_already_ran = output.review.as_ref().map(|r| r.ran).unwrap_or(false);
    if review_required && !review_already_ran {
        let commit_sha = output.commit_sha.clone().expect("checked above");
        let review_target = final_packet
            .meta
            .references
            .review_target
            .clone()
            .or_else(|| final_packet.meta.signals.review_target.clone());
        match run_review_turns(runtime, &workdir, scope.clone(), &commit_sha, review_target.as_ref()).await {
            Ok(review) => output.review = Some(review),
            Err(e) => {
                tracing::warn!(error = %e, "built-in review turn did not complete; review gate will block on the missing review");
            }
        }
    }

    let store_arc = Arc::new(runtime.store.clone());

    let follow_up_targets: Vec<String> = output.follow_ups.iter().flat_map(|f| f.to.clone()).collect();
    let declared_delegate = output
        .autopilot_control
        .as_ref()
        .and_then(|v| v.get("delegateTo"))
        .and_then(|v| v.as_str())
        .map(str::to_string);

    let gate_ctx = GateContext {
        agent: agent.clone(),
        task_id: id.to_string(),
        root_id: final_packet.meta.signals.root_id.clone(),
        signal_kind: kind_str.clone(),
        commit_sha: output.commit_sha.clone(),
        workdir: workdir.clone(),
        git: final_packet.meta.references.git.clone(),
    };

    let gates: Vec<Box<dyn Gate>> = vec![
        Box::new(GitPreflightGate { auto_clean: true, enforce: true }),
        Box::new(ConsultBarrierGate {
            name: "opus_consult_pre_exec",
            enabled: runtime.config.opus_gate.applies_to(&kind_str),
            advisory: matches!(runtime.config.opus_consult_mode, GateMode::Advisory),
            timeout: runtime.config.opus_gate_timeout,
            store: store_arc.clone(),
            roster: runtime.roster.clone(),
            consult_agent: runtime.config.opus_consult_agent.clone(),
            mode: bus_core::consult::ConsultMode::PreExec,
        }),
        Box::new(ReviewGate {
            review_ran: output.review.as_ref().map(|r| r.ran).unwrap_or(false),
            review_verdict: output.review.as_ref().and_then(|r| r.verdict.clone()),
            review_target_commit_sha: output.review.as_ref().and_then(|r| r.target_commit_sha.clone()),
        }),
        Box::new(CodeQualityGate {
            enabled: runtime.config.code_quality_gate.applies_to(&kind_str),
            script_passed: run_code_quality_script(&workdir),
            quality_review_present: output.quality_review.is_some(),
        }),
        Box::new(SkillEvidenceGate {
            enabled: runtime.config.skillops_gate.applies_to(&kind_str),
            required_commands: skills.iter().map(|(name, _)| name.clone()).collect(),
            tests_to_run: output.tests_to_run.clone(),
            artifact_paths: output.artifacts.iter().map(|p| workdir.join(p)).collect(),
        }),
        Box::new(ObserverDrainGate {
            enabled: runtime.config.observer_drain_gate.applies_to(&kind_str),
            store: store_arc.clone(),
        }),
        Box::new(DelegateGate {
            enabled: runtime.config.delegate_gate.applies_to(&kind_str),
            declared_delegate,
            follow_up_targets,
        }),
        Box::new(ConsultBarrierGate {
            name: "opus_consult_post_review",
            enabled: runtime.config.opus_post_review.applies_to(&kind_str),
            advisory: matches!(runtime.config.opus_consult_mode, GateMode::Advisory),
            timeout: runtime.config.opus_gate_timeout,
            store: store_arc,
            roster: runtime.roster.clone(),
            consult_agent: runtime.config.opus_consult_agent.clone(),
            mode: bus_core::consult::ConsultMode::PostReview,
        }),
    ];

    let (guard, blocked_reason) = run_chain(&gates, &gate_ctx);
    let (final_outcome, final_note) = match blocked_reason {
        Some(reason) => (Outcome::Blocked, format!("{} (blocked by gate: {reason})", output.note)),
        None => (output.outcome, output.note.clone()),
    };

    let follow_up_outcome = dispatch_follow_ups(
        &runtime.store,
        &runtime.roster,
        &agent,
        &final_packet.meta,
        final_outcome,
        &output.follow_ups,
    )?;

    let mut receipt_extra: HashMap<String, serde_json::Value> = HashMap::new();
    receipt_extra.insert("runtimeGuard".to_string(), serde_json::to_value(&guard)?);
    receipt_extra.insert("followUps".to_string(), serde_json::to_value(&follow_up_outcome)?);
    if let Some(review) = &output.review {
        receipt_extra.insert("review".to_string(), serde_json::to_value(review)?);
    }

    runtime.store.close(
        &runtime.roster,
        &agent,
        id,
        final_outcome,
        final_note,
        output.commit_sha.clone(),
        receipt_extra,
        None,
    )?;

    Ok(())
}

/// A cross-process exclusive lock so at most one worker process serves a
/// given agent at a time. A conflicting second process observes
/// `Ok(None)` and is expected to exit 0 without touching anything else.
pub(crate) struct WorkerLock {
    path: PathBuf,
}

impl WorkerLock {
    pub(crate) fn acquire(state_dir: &Path, agent: &str) -> Result<Option<Self>, WorkerError> {
        let dir = state_dir.join("worker-locks");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{agent}.lock.json"));
        match std::fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(mut file) => {
                use std::io::Write;
                let payload = serde_json::json!({"pid": std::process::id()});
                file.write_all(payload.to_string().as_bytes())?;
                Ok(Some(Self { path }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if let Ok(text) = std::fs::read_to_string(&path) {
                    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&text) {
                        if let Some(pid) = value.get("pid").and_then(|p| p.as_u64()) {
                            if !pid_is_alive(pid as u32) {
                                let _ = std::fs::remove_file(&path);
                                return Self::acquire(state_dir, agent);
                            }
                        }
                    }
                }
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for WorkerLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

fn pid_is_alive(pid: u32) -> bool {
    // SAFETY: signal 0 performs no action beyond an existence/permission check.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Run `runtime` to completion: acquire the per-agent worker lock (exiting
/// silently if another process already holds it), install SIGINT/SIGTERM
/// handlers that release the lock on shutdown, then poll-claim-process in a
/// loop until `once` is set or a shutdown signal arrives.
pub async fn run_loop(mut runtime: WorkerRuntime, once: bool, poll_interval: Duration) -> Result<(), WorkerError> {
    let state_dir = runtime.store.state_dir();
    let lock = match WorkerLock::acquire(&state_dir, &runtime.agent)? {
        Some(lock) => lock,
        None => {
            tracing::info!(agent = %runtime.agent, "already running; exiting duplicate worker");
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
        let processed = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            result = run_once(&mut runtime) => result?,
        };
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
