//! Isolated engine home directories (spec §4.4): each agent gets its own
//! `state/engine-home/<agent>` so credential and history state never
//! leaks across agents, plus one-shot repair when the engine reports a
//! rollout-index desync against that home. Grounded on the bus store's
//! own move-aside-and-retry idiom in `BusStore::reconcile`.

use bus_core::config::EngineHomeMode;
use std::path::{Path, PathBuf};
use tracing::warn;

/// Substring the engine is documented to emit on stderr when its rollout
/// index has fallen out of sync with the home directory's on-disk state.
const DESYNC_MARKER: &str = "rollout index desync";

/// Resolve the home directory an engine subprocess should use for `agent`,
/// per `AGENTIC_ENGINE_HOME_MODE`: one per agent, or a single shared home.
pub fn home_dir(state_dir: &Path, agent: &str, mode: EngineHomeMode) -> PathBuf {
    let base = state_dir.join("engine-home");
    match mode {
        EngineHomeMode::Agent => base.join(agent),
        EngineHomeMode::Shared => base.join("shared"),
    }
}

pub fn ensure(home: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(home)
}

/// Scans `stderr` for the desync marker. Returns `true` exactly once per
/// process for a given home: the caller passes `already_repaired` so a
/// second desync after the one-shot repair is treated as a terminal
/// engine error instead of looping forever.
pub fn is_desync(stderr: &str) -> bool {
    stderr.to_lowercase().contains(DESYNC_MARKER)
}

/// Move `home` aside to `<home>.desync-<unix_ts>` and recreate an empty
/// directory at the original path. `unix_ts` is passed in by the caller
/// (worker processes may not call `SystemTime::now()` inside code paths
/// this module's tests exercise deterministically).
pub fn repair(home: &Path, unix_ts: i64) -> std::io::Result<PathBuf> {
    let moved_aside = home.with_extension(format!("desync-{unix_ts}"));
    if home.exists() {
        std::fs::rename(home, &moved_aside)?;
        warn!(home = %home.display(), moved_to = %moved_aside.display(), "engine home moved aside after rollout-index desync");
    }
    std::fs::create_dir_all(home)?;
    Ok(moved_aside)
}

/// Build the `GIT_CONFIG_COUNT`/`GIT_CONFIG_KEY_n`/`GIT_CONFIG_VALUE_n`
/// environment overrides that point the engine's git invocations at the
/// bus's own credential store instead of whatever is on the ambient
/// machine (spec §4.4). Returned as a list so callers can `cmd.envs(...)`
/// it directly.
pub fn credential_helper_env(bus_root: &Path) -> Vec<(String, String)> {
    let credentials_path = bus_root.join("state").join(".git-credentials");
    vec![
        ("GIT_CONFIG_COUNT".to_string(), "1".to_string()),
        ("GIT_CONFIG_KEY_0".to_string(), "credential.helper".to_string()),
        (
            "GIT_CONFIG_VALUE_0".to_string(),
            format!("store --file={}", credentials_path.display()),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_mode_namespaces_per_agent() {
        let tmp = tempfile::tempdir().unwrap();
        let a = home_dir(tmp.path(), "backend", EngineHomeMode::Agent);
        let b = home_dir(tmp.path(), "frontend", EngineHomeMode::Agent);
        assert_ne!(a, b);
        assert!(a.ends_with("engine-home/backend"));
    }

    #[test]
    fn shared_mode_collapses_to_one_home() {
        let tmp = tempfile::tempdir().unwrap();
        let a = home_dir(tmp.path(), "backend", EngineHomeMode::Shared);
        let b = home_dir(tmp.path(), "frontend", EngineHomeMode::Shared);
        assert_eq!(a, b);
    }

    #[test]
    fn detects_desync_marker_case_insensitively() {
        assert!(is_desync("error: Rollout Index Desync at offset 12"));
        assert!(!is_desync("some unrelated crash"));
    }

    #[test]
    fn repair_moves_aside_and_recreates_empty_home() {
        let tmp = tempfile::tempdir().unwrap();
        let home = tmp.path().join("engine-home").join("backend");
        std::fs::create_dir_all(&home).unwrap();
        std::fs::write(home.join("rollout.bin"), b"stale").unwrap();

        let moved = repair(&home, 1_700_000_000).unwrap();
        assert!(moved.join("rollout.bin").exists());
        assert!(home.exists());
        assert_eq!(std::fs::read_dir(&home).unwrap().count(), 0);
    }

    #[test]
    fn credential_helper_env_points_at_bus_state() {
        let env = credential_helper_env(Path::new("/bus"));
        assert!(env
            .iter()
            .any(|(k, v)| k == "GIT_CONFIG_VALUE_0" && v.contains("/bus/state/.git-credentials")));
    }
}
