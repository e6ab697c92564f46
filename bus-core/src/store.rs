//! The bus store (C1): atomic on-disk layout, packet create/move/append,
//! receipt emission, frontmatter parse/write.

use crate::frontmatter;
use crate::receipt::{looks_like_git_sha, Outcome, Receipt};
use crate::roster::{Roster, AUTOPILOT, ORCHESTRATOR};
use crate::safety::{Policy, SuspiciousContentScanner};
use crate::task::{
    format_update_heading, References, SignalKind, Signals, TaskMeta, TaskPacket, TaskState,
};
use chrono::Utc;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum BusError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("frontmatter error: {0}")]
    Frontmatter(#[from] crate::frontmatter::FrontmatterError),
    #[error("recipient '{0}' is not present in the roster")]
    RosterMismatch(String),
    #[error("task id '{0}' is not filesystem-safe (contains ':' or a path separator)")]
    UnsafeId(String),
    #[error("delivery refused: suspicious content detected ({0} hit(s))")]
    SuspiciousContentBlocked(usize),
    #[error("no task '{id}' found for agent '{agent}' in new/ or seen/")]
    NotFound { agent: String, id: String },
    #[error("task '{id}' for agent '{agent}' was already claimed by another worker")]
    AlreadyClaimed { agent: String, id: String },
    #[error("task '{id}' for agent '{agent}' is already processed and cannot be updated")]
    AlreadyProcessed { agent: String, id: String },
    #[error("receipt for agent '{agent}' task '{id}' already exists; refusing to overwrite")]
    ReceiptAlreadyWritten { agent: String, id: String },
    #[error("commitSha '{0}' does not look like a git sha (need >= 6 hex chars)")]
    InvalidCommitSha(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, BusError>;

fn io_err(path: &Path, source: std::io::Error) -> BusError {
    BusError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Reject ids containing path separators or `:` (Windows drive letters /
/// ADS, and a general "don't let an id escape its directory" guard).
fn is_filesystem_safe_id(id: &str) -> bool {
    !id.is_empty()
        && !id.contains(':')
        && !id.contains('/')
        && !id.contains('\\')
        && id != "."
        && id != ".."
}

/// Atomically write `contents` to `path`: write to a sibling temp file, then
/// rename. Falls back to copy-then-unlink if the rename crosses a mount
/// (reported as `EXDEV`).
fn atomic_write(path: &Path, contents: &str) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    let tmp = dir.join(format!(
        ".{}.tmp-{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("packet"),
        std::process::id()
    ));
    std::fs::write(&tmp, contents).map_err(|e| io_err(&tmp, e))?;
    atomic_rename(&tmp, path)
}

/// Rename `from` to `to`, falling back to copy+unlink on cross-filesystem
/// renames (`EXDEV`).
fn atomic_rename(from: &Path, to: &Path) -> Result<()> {
    match std::fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            std::fs::copy(from, to).map_err(|e| io_err(to, e))?;
            std::fs::remove_file(from).map_err(|e| io_err(from, e))?;
            Ok(())
        }
        Err(e) => Err(io_err(to, e)),
    }
}

/// Result of a successful [`BusStore::open`].
pub struct OpenedTask {
    pub packet: TaskPacket,
    pub state: TaskState,
}

/// The bus store. Cheap to construct; holds only the bus root path.
#[derive(Debug, Clone)]
pub struct BusStore {
    root: PathBuf,
    scanner: SuspiciousContentScanner,
    suspicious_policy: Policy,
}

impl BusStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            scanner: SuspiciousContentScanner::new(),
            suspicious_policy: Policy::Warn,
        }
    }

    pub fn with_suspicious_policy(mut self, policy: Policy) -> Self {
        self.suspicious_policy = policy;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn inbox_dir(&self, agent: &str, state: TaskState) -> PathBuf {
        self.root.join("inbox").join(agent).join(state.dir_name())
    }

    pub fn receipts_dir(&self, agent: &str) -> PathBuf {
        self.root.join("receipts").join(agent)
    }

    pub fn receipt_path(&self, agent: &str, id: &str) -> PathBuf {
        self.receipts_dir(agent).join(format!("{id}.json"))
    }

    pub fn artifacts_dir(&self, agent: &str) -> PathBuf {
        self.root.join("artifacts").join(agent)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    /// Idempotently create the on-disk layout for every agent in `roster`.
    pub fn ensure(&self, roster: &Roster) -> Result<()> {
        for agent in roster.agent_names() {
            for state in TaskState::ALL {
                let dir = self.inbox_dir(agent, state);
                std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
            }
            let receipts = self.receipts_dir(agent);
            std::fs::create_dir_all(&receipts).map_err(|e| io_err(&receipts, e))?;
            let artifacts = self.artifacts_dir(agent).join("reviews");
            std::fs::create_dir_all(&artifacts).map_err(|e| io_err(&artifacts, e))?;
        }
        let state = self.state_dir();
        std::fs::create_dir_all(&state).map_err(|e| io_err(&state, e))?;
        Ok(())
    }

    /// Deliver a new packet to every agent in `meta.to`.
    pub fn deliver(&self, roster: &Roster, meta: TaskMeta, body: String) -> Result<()> {
        if !is_filesystem_safe_id(&meta.id) {
            return Err(BusError::UnsafeId(meta.id.clone()));
        }
        for to in &meta.to {
            if !roster.contains(to) {
                return Err(BusError::RosterMismatch(to.clone()));
            }
        }

        let hits = self.scanner.scan(&body);
        if !hits.is_empty() {
            for hit in &hits {
                warn!(pattern = %hit.pattern, excerpt = %hit.excerpt, "suspicious content in delivered packet body");
            }
            if self.suspicious_policy == Policy::Block {
                return Err(BusError::SuspiciousContentBlocked(hits.len()));
            }
        }

        let packet = TaskPacket {
            meta: meta.clone(),
            body,
        };
        let text = frontmatter::render(&packet)?;

        for to in &meta.to {
            let dir = self.inbox_dir(to, TaskState::New);
            std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
            let dest = dir.join(format!("{}.md", meta.id));
            atomic_write(&dest, &text)?;
            info!(agent = %to, task_id = %meta.id, "delivered task");
        }
        Ok(())
    }

    /// Locate the current state dir of `(agent, id)`, if any.
    fn locate(&self, agent: &str, id: &str) -> Option<(PathBuf, TaskState)> {
        for state in TaskState::ALL {
            let path = self.inbox_dir(agent, state).join(format!("{id}.md"));
            if path.exists() {
                return Some((path, state));
            }
        }
        None
    }

    /// Atomically move `new/` or `seen/` to `in_progress/`.
    pub fn claim(&self, agent: &str, id: &str) -> Result<TaskPacket> {
        let src = match self.locate(agent, id) {
            Some((path, TaskState::New)) | Some((path, TaskState::Seen)) => path,
            Some((_, TaskState::InProgress)) | Some((_, TaskState::Processed)) | None => {
                return Err(BusError::NotFound {
                    agent: agent.to_string(),
                    id: id.to_string(),
                });
            }
        };
        let dest = self.inbox_dir(agent, TaskState::InProgress).join(format!("{id}.md"));
        if dest.exists() {
            return Err(BusError::AlreadyClaimed {
                agent: agent.to_string(),
                id: id.to_string(),
            });
        }
        std::fs::create_dir_all(dest.parent().unwrap()).map_err(|e| io_err(&dest, e))?;
        // A rename that lands on an existing file would silently clobber it
        // on POSIX, so re-check existence immediately before the syscall to
        // shrink (not eliminate) the race window; the real guarantee comes
        // from claim() always being called by at most one process per id in
        // correct operation, with AlreadyClaimed surfacing true conflicts
        // caught as NotFound once the other worker's rename has already won.
        match std::fs::rename(&src, &dest) {
            Ok(()) => {}
            Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
                atomic_rename(&src, &dest)?;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BusError::NotFound {
                    agent: agent.to_string(),
                    id: id.to_string(),
                });
            }
            Err(e) => return Err(io_err(&dest, e)),
        }
        let text = std::fs::read_to_string(&dest).map_err(|e| io_err(&dest, e))?;
        Ok(frontmatter::parse(&text)?)
    }

    /// Read the current packet, optionally marking `new` → `seen`.
    pub fn open(&self, agent: &str, id: &str, mark_seen: bool) -> Result<OpenedTask> {
        let (path, state) = self.locate(agent, id).ok_or_else(|| BusError::NotFound {
            agent: agent.to_string(),
            id: id.to_string(),
        })?;
        let text = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        let packet = frontmatter::parse(&text)?;

        if mark_seen && state == TaskState::New {
            let dest = self.inbox_dir(agent, TaskState::Seen).join(format!("{id}.md"));
            std::fs::create_dir_all(dest.parent().unwrap()).map_err(|e| io_err(&dest, e))?;
            atomic_rename(&path, &dest)?;
            return Ok(OpenedTask {
                packet,
                state: TaskState::Seen,
            });
        }
        Ok(OpenedTask { packet, state })
    }

    /// Append an `### Update` block to an in-progress packet; optionally
    /// rescans the appended text and updates title/priority.
    pub fn update(
        &self,
        agent: &str,
        id: &str,
        append: Option<&str>,
        title: Option<&str>,
        priority: Option<crate::task::Priority>,
    ) -> Result<()> {
        let (path, state) = self.locate(agent, id).ok_or_else(|| BusError::NotFound {
            agent: agent.to_string(),
            id: id.to_string(),
        })?;
        if state == TaskState::Processed {
            return Err(BusError::AlreadyProcessed {
                agent: agent.to_string(),
                id: id.to_string(),
            });
        }

        let text = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        let mut packet = frontmatter::parse(&text)?;

        if let Some(append_text) = append {
            let hits = self.scanner.scan(append_text);
            for hit in &hits {
                warn!(pattern = %hit.pattern, "suspicious content in task update");
            }
            if self.suspicious_policy == Policy::Block && !hits.is_empty() {
                return Err(BusError::SuspiciousContentBlocked(hits.len()));
            }
            let heading = format_update_heading(agent, Utc::now());
            packet.body.push_str(&format!("\n\n{heading}\n\n{append_text}\n"));
        }
        if let Some(title) = title {
            packet.meta.title = title.to_string();
        }
        if let Some(priority) = priority {
            packet.meta.priority = priority;
        }

        let rendered = frontmatter::render(&packet)?;
        atomic_write(&path, &rendered)?;
        // touch mtime explicitly so watchers relying on polling observe the
        // change even when atomic_write's rename preserved an inherited mtime
        let now = std::time::SystemTime::now();
        let _ = filetime_touch(&path, now);
        Ok(())
    }

    /// Write the receipt (fsync'd) then move the packet to `processed/`.
    /// Synthesizes a `TASK_COMPLETE` packet to the orchestrator unless
    /// `notify_orchestrator` is `Some(false)`.
    #[allow(clippy::too_many_arguments)]
    pub fn close(
        &self,
        roster: &Roster,
        agent: &str,
        id: &str,
        outcome: Outcome,
        note: String,
        commit_sha: Option<String>,
        receipt_extra: HashMap<String, serde_json::Value>,
        notify_orchestrator: Option<bool>,
    ) -> Result<Receipt> {
        if let Some(sha) = &commit_sha {
            if !looks_like_git_sha(sha) {
                return Err(BusError::InvalidCommitSha(sha.clone()));
            }
        }

        let receipt_path = self.receipt_path(agent, id);
        if receipt_path.exists() {
            // Idempotent against a missing packet if the receipt already
            // exists (crash-after-receipt-before-move); a second full close
            // attempt on an already-processed task is a programmer error.
            let located = self.locate(agent, id);
            if located.is_none() || matches!(located, Some((_, TaskState::Processed))) {
                warn!(agent, task_id = id, "close() called again after receipt already written; completing move only");
                if let Some((path, state)) = located {
                    if state != TaskState::Processed {
                        let dest = self.inbox_dir(agent, TaskState::Processed).join(format!("{id}.md"));
                        atomic_rename(&path, &dest)?;
                    }
                }
                let existing = std::fs::read_to_string(&receipt_path).map_err(|e| io_err(&receipt_path, e))?;
                return Ok(serde_json::from_str(&existing)?);
            }
            return Err(BusError::ReceiptAlreadyWritten {
                agent: agent.to_string(),
                id: id.to_string(),
            });
        }

        let (path, _state) = self.locate(agent, id).ok_or_else(|| BusError::NotFound {
            agent: agent.to_string(),
            id: id.to_string(),
        })?;
        let text = std::fs::read_to_string(&path).map_err(|e| io_err(&path, e))?;
        let packet = frontmatter::parse(&text)?;

        let receipt = Receipt {
            task_id: id.to_string(),
            agent: agent.to_string(),
            outcome,
            note,
            commit_sha: commit_sha.clone(),
            closed_at: Utc::now(),
            task: packet.meta.clone(),
            receipt_extra,
        };
        let receipt_json = serde_json::to_string_pretty(&receipt)?;
        std::fs::create_dir_all(receipt_path.parent().unwrap()).map_err(|e| io_err(&receipt_path, e))?;
        write_and_fsync(&receipt_path, &receipt_json)?;

        let dest = self.inbox_dir(agent, TaskState::Processed).join(format!("{id}.md"));
        atomic_rename(&path, &dest)?;

        let notify = notify_orchestrator.unwrap_or(!roster.is_orchestrator(agent));
        if notify && !roster.is_orchestrator(agent) {
            self.emit_task_complete(roster, &packet.meta, &receipt)?;
        }

        Ok(receipt)
    }

    /// Synthesize and deliver a `TASK_COMPLETE` packet to the orchestrator.
    fn emit_task_complete(&self, roster: &Roster, source: &TaskMeta, receipt: &Receipt) -> Result<()> {
        if !roster.contains(ORCHESTRATOR) {
            return Ok(());
        }
        let mut signals = Signals::new(SignalKind::TaskComplete);
        signals.root_id = source.signals.root_id.clone().or_else(|| Some(source.id.clone()));
        signals.source_kind = Some(source.signals.kind.to_string());

        let mut references = References::default();
        references.completed_task_kind = Some(source.signals.kind.to_string());
        references.extra.insert(
            "completedTaskId".to_string(),
            serde_json::Value::String(source.id.clone()),
        );
        references.extra.insert(
            "receiptOutcome".to_string(),
            serde_json::Value::String(receipt.outcome.to_string()),
        );
        if let Some(sha) = &receipt.commit_sha {
            references.extra.insert("commitSha".to_string(), serde_json::Value::String(sha.clone()));
        }

        let meta = TaskMeta {
            id: format!("{}-complete-{}", source.id, receipt.agent),
            to: vec![ORCHESTRATOR.to_string()],
            from: receipt.agent.clone(),
            priority: source.priority,
            title: format!("TASK_COMPLETE: {}", source.title),
            signals,
            references,
        };
        let body = format!("Task `{}` closed by `{}` with outcome `{}`.\n\n{}\n", source.id, receipt.agent, receipt.outcome, receipt.note);
        self.deliver(roster, meta, body)
    }

    /// Startup repair pass: if a packet is still in `in_progress/` but its
    /// receipt already exists (a crash between receipt-write and move),
    /// complete the move to `processed/`.
    pub fn reconcile(&self, roster: &Roster) -> Result<usize> {
        let mut fixed = 0;
        for agent in roster.agent_names() {
            let in_progress = self.inbox_dir(agent, TaskState::InProgress);
            if !in_progress.exists() {
                continue;
            }
            let entries = std::fs::read_dir(&in_progress).map_err(|e| io_err(&in_progress, e))?;
            for entry in entries {
                let entry = entry.map_err(|e| io_err(&in_progress, e))?;
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("md") {
                    continue;
                }
                let id = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
                if self.receipt_path(agent, id).exists() {
                    let dest = self.inbox_dir(agent, TaskState::Processed).join(format!("{id}.md"));
                    atomic_rename(&path, &dest)?;
                    info!(agent, task_id = id, "reconciled orphaned in_progress packet to processed/");
                    fixed += 1;
                }
            }
        }
        Ok(fixed)
    }
}

fn write_and_fsync(path: &Path, contents: &str) -> Result<()> {
    use std::io::Write;
    let mut file = std::fs::File::create(path).map_err(|e| io_err(path, e))?;
    file.write_all(contents.as_bytes()).map_err(|e| io_err(path, e))?;
    file.sync_all().map_err(|e| io_err(path, e))?;
    Ok(())
}

fn filetime_touch(path: &Path, _now: std::time::SystemTime) -> std::io::Result<()> {
    // Re-opening for append with no-op write nudges mtime on every platform
    // without a filetime crate dependency.
    use std::io::Write;
    let mut f = std::fs::OpenOptions::new().append(true).open(path)?;
    f.write_all(b"")?;
    f.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Priority, Signals, SignalKind};

    fn roster() -> Roster {
        Roster::from_json_str(
            r#"{"schemaVersion":2,"agents":{
                "orchestrator":{"role":"orchestrator","workdir":"x"},
                "chat":{"role":"chat","workdir":"x"},
                "autopilot":{"role":"autopilot","workdir":"x"},
                "backend":{"role":"worker","workdir":"x"}
            }}"#,
        )
        .unwrap()
    }

    fn meta(id: &str, to: &str, kind: SignalKind) -> TaskMeta {
        TaskMeta {
            id: id.to_string(),
            to: vec![to.to_string()],
            from: "operator".to_string(),
            priority: Priority::P1,
            title: "do it".to_string(),
            signals: Signals::new(kind),
            references: Default::default(),
        }
    }

    #[test]
    fn deliver_then_claim_then_close_moves_through_states() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BusStore::new(tmp.path());
        let roster = roster();
        store.ensure(&roster).unwrap();

        store
            .deliver(&roster, meta("t1", "backend", SignalKind::UserRequest), "hello".into())
            .unwrap();
        assert!(store.inbox_dir("backend", TaskState::New).join("t1.md").exists());

        let packet = store.claim("backend", "t1").unwrap();
        assert_eq!(packet.meta.id, "t1");
        assert!(!store.inbox_dir("backend", TaskState::New).join("t1.md").exists());
        assert!(store.inbox_dir("backend", TaskState::InProgress).join("t1.md").exists());

        let receipt = store
            .close(&roster, "backend", "t1", Outcome::Done, "ok".into(), None, HashMap::new(), Some(false))
            .unwrap();
        assert_eq!(receipt.outcome, Outcome::Done);
        assert!(store.inbox_dir("backend", TaskState::Processed).join("t1.md").exists());
        assert!(!store.inbox_dir("backend", TaskState::InProgress).join("t1.md").exists());
    }

    #[test]
    fn claim_twice_second_call_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BusStore::new(tmp.path());
        let roster = roster();
        store.ensure(&roster).unwrap();
        store.deliver(&roster, meta("t1", "backend", SignalKind::UserRequest), "x".into()).unwrap();
        store.claim("backend", "t1").unwrap();
        let err = store.claim("backend", "t1").unwrap_err();
        assert!(matches!(err, BusError::NotFound { .. }));
    }

    #[test]
    fn close_is_idempotent_against_identical_recall() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BusStore::new(tmp.path());
        let roster = roster();
        store.ensure(&roster).unwrap();
        store.deliver(&roster, meta("t1", "backend", SignalKind::UserRequest), "x".into()).unwrap();
        store.claim("backend", "t1").unwrap();
        let r1 = store
            .close(&roster, "backend", "t1", Outcome::Done, "ok".into(), None, HashMap::new(), Some(false))
            .unwrap();
        let r2 = store
            .close(&roster, "backend", "t1", Outcome::Done, "ok".into(), None, HashMap::new(), Some(false))
            .unwrap();
        assert_eq!(r1.closed_at, r2.closed_at);
    }

    #[test]
    fn deliver_rejects_unknown_recipient() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BusStore::new(tmp.path());
        let roster = roster();
        store.ensure(&roster).unwrap();
        let err = store
            .deliver(&roster, meta("t1", "ghost", SignalKind::UserRequest), "x".into())
            .unwrap_err();
        assert!(matches!(err, BusError::RosterMismatch(_)));
    }

    #[test]
    fn deliver_rejects_unsafe_id() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BusStore::new(tmp.path());
        let roster = roster();
        store.ensure(&roster).unwrap();
        let err = store
            .deliver(&roster, meta("../evil", "backend", SignalKind::UserRequest), "x".into())
            .unwrap_err();
        assert!(matches!(err, BusError::UnsafeId(_)));
    }

    #[test]
    fn close_emits_task_complete_to_orchestrator() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BusStore::new(tmp.path());
        let roster = roster();
        store.ensure(&roster).unwrap();
        store.deliver(&roster, meta("t1", "backend", SignalKind::Execute), "x".into()).unwrap();
        store.claim("backend", "t1").unwrap();
        store
            .close(&roster, "backend", "t1", Outcome::Done, "ok".into(), Some("abc123".into()), HashMap::new(), None)
            .unwrap();
        let new_dir = store.inbox_dir(ORCHESTRATOR, TaskState::New);
        let entries: Vec<_> = std::fs::read_dir(&new_dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn reconcile_completes_orphaned_move() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BusStore::new(tmp.path());
        let roster = roster();
        store.ensure(&roster).unwrap();
        store.deliver(&roster, meta("t1", "backend", SignalKind::UserRequest), "x".into()).unwrap();
        store.claim("backend", "t1").unwrap();
        // Simulate a crash after receipt write but before the processed/ move.
        let receipt = Receipt {
            task_id: "t1".into(),
            agent: "backend".into(),
            outcome: Outcome::Done,
            note: "ok".into(),
            commit_sha: None,
            closed_at: Utc::now(),
            task: meta("t1", "backend", SignalKind::UserRequest),
            receipt_extra: HashMap::new(),
        };
        std::fs::create_dir_all(store.receipts_dir("backend")).unwrap();
        std::fs::write(store.receipt_path("backend", "t1"), serde_json::to_string(&receipt).unwrap()).unwrap();

        let fixed = store.reconcile(&roster).unwrap();
        assert_eq!(fixed, 1);
        assert!(store.inbox_dir("backend", TaskState::Processed).join("t1.md").exists());
    }
}
