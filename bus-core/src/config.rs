//! Typed aggregation of the environment toggles enumerated in spec §6.
//!
//! Resolved once at worker startup and never re-read mid-run: a worker that
//! wants to pick up a changed toggle restarts, matching the teacher's
//! `SwarmConfig` (CLI flags layered over env vars, both read exactly once).

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    Exec,
    AppServer,
}

impl EngineKind {
    fn from_env_str(s: &str) -> Self {
        match s {
            "app-server" => Self::AppServer,
            _ => Self::Exec,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineHomeMode {
    Agent,
    Shared,
}

impl EngineHomeMode {
    fn from_env_str(s: &str) -> Self {
        match s {
            "shared" => Self::Shared,
            _ => Self::Agent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMode {
    Gate,
    Advisory,
}

impl GateMode {
    fn from_env_str(s: &str) -> Self {
        match s {
            "advisory" => Self::Advisory,
            _ => Self::Gate,
        }
    }
}

/// One `AGENTIC_*_GATE` toggle plus its optional `*_GATE_KINDS` restriction.
#[derive(Debug, Clone)]
pub struct GateToggle {
    pub enabled: bool,
    /// When non-empty, the gate only applies to packets whose
    /// `signals.kind` is in this list.
    pub restrict_to_kinds: Vec<String>,
}

impl GateToggle {
    fn from_env(enabled_var: &str, kinds_var: &str) -> Self {
        let enabled = env_bool(enabled_var, false);
        let restrict_to_kinds = std::env::var(kinds_var)
            .ok()
            .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();
        Self {
            enabled,
            restrict_to_kinds,
        }
    }

    pub fn applies_to(&self, kind: &str) -> bool {
        self.enabled && (self.restrict_to_kinds.is_empty() || self.restrict_to_kinds.iter().any(|k| k == kind))
    }
}

fn env_bool(var: &str, default: bool) -> bool {
    match std::env::var(var) {
        Ok(v) => matches!(v.as_str(), "1" | "true" | "TRUE" | "yes"),
        Err(_) => default,
    }
}

fn env_u64(var: &str, default: u64) -> u64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

/// All environment-configurable worker behavior, resolved once.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub engine: EngineKind,
    pub engine_home_mode: EngineHomeMode,
    pub app_server_persist: bool,
    pub app_server_resume_persisted: bool,
    /// 0 disables session rotation.
    pub autopilot_session_rotate_turns: u32,

    pub opus_gate: GateToggle,
    pub opus_post_review: GateToggle,
    pub delegate_gate: GateToggle,
    pub observer_drain_gate: GateToggle,
    pub code_quality_gate: GateToggle,
    pub skillops_gate: GateToggle,
    pub opus_consult_mode: GateMode,
    /// Agent the consult barrier gates address `OPUS_CONSULT_REQUEST`
    /// packets to.
    pub opus_consult_agent: String,

    pub engine_global_max_inflight: u32,
    pub engine_exec_timeout: Duration,
    pub engine_retry_base_ms: u64,
    pub engine_retry_max_ms: u64,
    pub engine_retry_jitter_ms: u64,
    pub engine_rate_limit_min: Duration,
    pub task_update_poll: Duration,
    pub opus_gate_timeout: Duration,

    pub commit_verify_remotes: Vec<String>,
}

impl WorkerConfig {
    /// Resolve every toggle from `std::env`, applying the spec's defaults
    /// when a variable is absent or unparseable.
    pub fn from_env() -> Self {
        Self {
            engine: std::env::var("AGENTIC_ENGINE")
                .map(|v| EngineKind::from_env_str(&v))
                .unwrap_or(EngineKind::Exec),
            engine_home_mode: std::env::var("AGENTIC_ENGINE_HOME_MODE")
                .map(|v| EngineHomeMode::from_env_str(&v))
                .unwrap_or(EngineHomeMode::Agent),
            app_server_persist: env_bool("AGENTIC_APP_SERVER_PERSIST", false),
            app_server_resume_persisted: env_bool("AGENTIC_APP_SERVER_RESUME_PERSISTED", false),
            autopilot_session_rotate_turns: env_u64("AGENTIC_AUTOPILOT_SESSION_ROTATE_TURNS", 0) as u32,

            opus_gate: GateToggle::from_env("AGENTIC_OPUS_GATE", "AGENTIC_OPUS_GATE_KINDS"),
            opus_post_review: GateToggle::from_env(
                "AGENTIC_OPUS_POST_REVIEW",
                "AGENTIC_OPUS_POST_REVIEW_GATE_KINDS",
            ),
            delegate_gate: GateToggle::from_env("AGENTIC_DELEGATE_GATE", "AGENTIC_DELEGATE_GATE_KINDS"),
            observer_drain_gate: GateToggle::from_env(
                "AGENTIC_OBSERVER_DRAIN_GATE",
                "AGENTIC_OBSERVER_DRAIN_GATE_KINDS",
            ),
            code_quality_gate: GateToggle::from_env(
                "AGENTIC_CODE_QUALITY_GATE",
                "AGENTIC_CODE_QUALITY_GATE_KINDS",
            ),
            skillops_gate: GateToggle::from_env("AGENTIC_SKILLOPS_GATE", "AGENTIC_SKILLOPS_GATE_KINDS"),
            opus_consult_mode: std::env::var("OPUS_CONSULT_MODE")
                .map(|v| GateMode::from_env_str(&v))
                .unwrap_or(GateMode::Gate),
            opus_consult_agent: std::env::var("OPUS_CONSULT_AGENT").unwrap_or_else(|_| "opus".to_string()),

            engine_global_max_inflight: env_u64("ENGINE_GLOBAL_MAX_INFLIGHT", 4) as u32,
            engine_exec_timeout: Duration::from_millis(env_u64("ENGINE_EXEC_TIMEOUT_MS", 600_000)),
            engine_retry_base_ms: env_u64("ENGINE_RETRY_BASE_MS", 250),
            engine_retry_max_ms: env_u64("ENGINE_RETRY_MAX_MS", 30_000),
            engine_retry_jitter_ms: env_u64("ENGINE_RETRY_JITTER_MS", 250),
            engine_rate_limit_min: Duration::from_millis(env_u64("ENGINE_RATE_LIMIT_MIN_MS", 0)),
            task_update_poll: Duration::from_millis(env_u64("TASK_UPDATE_POLL_MS", 2_000)),
            opus_gate_timeout: Duration::from_millis(env_u64("OPUS_GATE_TIMEOUT_MS", 180_000)),

            commit_verify_remotes: std::env::var("COMMIT_VERIFY_REMOTES")
                .ok()
                .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_else(|| vec!["origin".to_string()]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment-variable tests must not interleave with other tests in
    // this process; serialize via a dedicated lock.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_when_unset() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::remove_var("AGENTIC_ENGINE");
        let cfg = WorkerConfig::from_env();
        assert_eq!(cfg.engine, EngineKind::Exec);
        assert_eq!(cfg.task_update_poll, Duration::from_millis(2_000));
        assert_eq!(cfg.commit_verify_remotes, vec!["origin".to_string()]);
    }

    #[test]
    fn reads_engine_kind_from_env() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("AGENTIC_ENGINE", "app-server");
        let cfg = WorkerConfig::from_env();
        assert_eq!(cfg.engine, EngineKind::AppServer);
        std::env::remove_var("AGENTIC_ENGINE");
    }

    #[test]
    fn gate_kinds_restriction_parses() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("AGENTIC_OPUS_GATE", "1");
        std::env::set_var("AGENTIC_OPUS_GATE_KINDS", "EXECUTE, REVIEW_ACTION_REQUIRED");
        let cfg = WorkerConfig::from_env();
        assert!(cfg.opus_gate.applies_to("EXECUTE"));
        assert!(!cfg.opus_gate.applies_to("STATUS"));
        std::env::remove_var("AGENTIC_OPUS_GATE");
        std::env::remove_var("AGENTIC_OPUS_GATE_KINDS");
    }
}
