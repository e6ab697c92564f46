//! Engine driver abstraction (C4): the worker loop talks to one of two
//! interchangeable backends through this trait — a single-shot "exec"
//! subprocess or a persistent JSON-RPC-over-stdio "app-server" — without
//! knowing which.

pub mod app_server;
pub mod exec;

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine subprocess failed to start: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine subprocess crashed (exit {0:?})")]
    Crashed(Option<i32>),
    #[error("engine turn timed out after {0:?}")]
    Timeout(Duration),
    #[error("engine protocol desync: {0}")]
    ProtocolDesync(String),
    #[error("engine rate-limited: retry after {retry_after_ms:?}ms")]
    RateLimited { retry_after_ms: Option<i64> },
    #[error("io error talking to engine: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error in engine protocol: {0}")]
    Json(#[from] serde_json::Error),
    #[error("turn was interrupted by a task update")]
    Interrupted,
}

/// Which pinned thread (if any) a turn should run on.
#[derive(Debug, Clone)]
pub enum ThreadScope {
    /// No pinning: every turn is independent.
    None,
    /// Pinned to the agent's single default thread.
    Global,
    /// Pinned to one thread per root task chain.
    Root(String),
}

/// Parameters for a single engine turn.
#[derive(Debug, Clone)]
pub struct TurnOpts {
    pub scope: ThreadScope,
    pub timeout: Duration,
    /// `review/start` instead of `turn/start`, for the review gate.
    pub is_review: bool,
    /// repo-relative working directory the engine should operate in.
    pub workdir: std::path::PathBuf,
    /// A previously captured thread id to resume, when persisted-resume is
    /// enabled and one is on record for this scope (spec §4.4). `ExecEngine`
    /// passes it as `--resume`; `AppServerEngine` uses `thread/resume`
    /// instead (its own `resume_thread_id` setter), so this field is inert
    /// there.
    pub resume_thread_id: Option<String>,
    /// autopilot runs `dangerFullAccess`, workers run `workspace-write`.
    pub sandbox_policy: String,
    /// extra `--add-dir` roots beyond `workdir`.
    pub add_dirs: Vec<std::path::PathBuf>,
    /// `--config key=value` pairs passed through verbatim.
    pub config: Vec<(String, String)>,
}

/// A streamed delta from the engine while a turn is running, surfaced so
/// the worker loop can feed a task-update watcher or progress log.
#[derive(Debug, Clone)]
pub struct TurnDelta {
    pub text: String,
}

/// The terminal result of a turn: the last agent message text (parsed
/// downstream as the worker output contract) plus bookkeeping.
#[derive(Debug, Clone)]
pub struct TurnResult {
    pub final_message: String,
    pub thread_id: Option<String>,
}

/// Structured shape of an engine's app-server request envelope, reused by
/// both drivers for rate-limit/desync text parsing (exec reads it off
/// stderr/stdout; app-server off JSON-RPC errors).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineDiagnostic {
    pub message: String,
    #[serde(default)]
    pub retry_after_ms: Option<i64>,
}

/// A clonable, lock-free handle for interrupting whatever turn an engine
/// driver currently has in flight, from a thread other than the one
/// blocked inside `run_turn`. `run_turn` takes `&mut self`, so a watcher
/// reacting to a task-file update cannot call `interrupt(&mut self)`
/// without racing the in-progress borrow.
///
/// Carries two independent signals because the two drivers have different
/// process lifetimes: `ExecEngine` spawns a fresh, single-turn child, so
/// killing its pid directly is safe and immediate; `AppServerEngine`'s
/// child outlives any one turn, so it only sets a cooperative flag that
/// `run_streamed_turn`'s polling loop checks each tick, leaving the
/// process itself alone.
#[derive(Debug, Clone)]
pub struct InterruptHandle {
    pid: Arc<AtomicI64>,
    requested: Arc<std::sync::atomic::AtomicBool>,
}

impl InterruptHandle {
    pub fn new() -> Self {
        Self {
            pid: Arc::new(AtomicI64::new(0)),
            requested: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    pub fn set_pid(&self, pid: u32) {
        self.pid.store(pid as i64, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.pid.store(0, Ordering::SeqCst);
        self.requested.store(false, Ordering::SeqCst);
    }

    /// Request interruption: sets the cooperative flag, and if a pid is
    /// currently recorded, also sends it SIGTERM.
    pub fn fire(&self) {
        self.requested.store(true, Ordering::SeqCst);
        let pid = self.pid.load(Ordering::SeqCst);
        if pid > 0 {
            // SAFETY: kill(2) with a plain pid_t and SIGTERM is the
            // standard best-effort "ask this process to stop" signal.
            unsafe {
                libc::kill(pid as libc::pid_t, libc::SIGTERM);
            }
        }
    }

    /// Consume a pending cooperative interrupt request, if any.
    pub fn take_requested(&self) -> bool {
        self.requested.swap(false, Ordering::SeqCst)
    }
}

impl Default for InterruptHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives one turn of the engine to completion, or fails with a retryable
/// or terminal `EngineError`.
pub trait EngineDriver {
    fn run_turn(&mut self, prompt: &str, opts: &TurnOpts) -> Result<TurnResult, EngineError>;

    /// Best-effort interrupt of an in-flight turn (task-update watcher).
    fn interrupt(&mut self) -> Result<(), EngineError>;

    /// A handle that can kill the current turn's subprocess from another
    /// thread without needing `&mut self`. Stable for the driver's
    /// lifetime; cloning it is cheap.
    fn interrupt_handle(&self) -> InterruptHandle;
}
