//! Cross-process limiter (C3): file-lease global semaphore slots plus
//! cooldown files, namespaced per `domain` so engine and consult
//! concurrency never share slots.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum LimiterError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

type Result<T> = std::result::Result<T, LimiterError>;

fn io_err(path: &Path, source: std::io::Error) -> LimiterError {
    LimiterError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SlotFile {
    #[serde(rename = "acquiredAt")]
    acquired_at: DateTime<Utc>,
    pid: u32,
    name: String,
}

/// Check whether `pid` is alive on this host via `kill(pid, 0)`.
/// Advisory only; cross-host use is unsupported (spec §4.3).
fn pid_is_alive(pid: u32) -> bool {
    // SAFETY: kill with signal 0 performs no action, only existence/permission
    // checks, and is the POSIX-sanctioned way to probe liveness.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// A held slot. Dropping it releases the slot (best-effort, silent on
/// ENOENT), so a panicking holder still frees its slot.
pub struct Lease {
    path: PathBuf,
    released: bool,
}

impl Lease {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match std::fs::remove_file(&self.path) {
            Ok(()) | Err(_) => {}
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

fn semaphore_dir(state_dir: &Path, domain: &str) -> PathBuf {
    state_dir.join(format!("{domain}-semaphore"))
}

/// Reclaim slots held by dead or stale holders, then attempt to acquire a
/// free slot in `[0, max_slots)`. Loops with bounded jittered backoff until
/// a slot is won; callers impose their own timeouts.
pub fn acquire_slot(
    state_dir: &Path,
    domain: &str,
    name: &str,
    max_slots: u32,
    stale: Duration,
) -> Result<Lease> {
    let dir = semaphore_dir(state_dir, domain);
    std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;

    let mut attempt: u32 = 0;
    loop {
        reclaim_stale(&dir, stale)?;

        for k in 0..max_slots {
            let path = dir.join(format!("slot-{k}.json"));
            let slot = SlotFile {
                acquired_at: Utc::now(),
                pid: std::process::id(),
                name: name.to_string(),
            };
            let contents = serde_json::to_string(&slot)?;
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(mut file) => {
                    use std::io::Write;
                    file.write_all(contents.as_bytes()).map_err(|e| io_err(&path, e))?;
                    debug!(domain, slot = k, name, "acquired limiter slot");
                    return Ok(Lease {
                        path,
                        released: false,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(io_err(&path, e)),
            }
        }

        let base_ms: u64 = 25;
        let cap_ms: u64 = 500;
        let backoff = (base_ms.saturating_mul(1u64 << attempt.min(6))).min(cap_ms);
        let jitter = rand::thread_rng().gen_range(0..=backoff / 2 + 1);
        std::thread::sleep(Duration::from_millis(backoff + jitter));
        attempt = attempt.saturating_add(1);
    }
}

fn reclaim_stale(dir: &Path, stale: Duration) -> Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(io_err(dir, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => continue,
        };
        let slot: SlotFile = match serde_json::from_str(&contents) {
            Ok(s) => s,
            Err(_) => continue,
        };
        let age = Utc::now().signed_duration_since(slot.acquired_at);
        let too_old = age.to_std().map(|d| d > stale).unwrap_or(false);
        if !pid_is_alive(slot.pid) || too_old {
            match std::fs::remove_file(&path) {
                Ok(()) => warn!(path = %path.display(), pid = slot.pid, "reclaimed stale limiter slot"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                // EBUSY-equivalent on a concurrent unlink race: treat as still held.
                Err(_) => {}
            }
        }
    }
    Ok(())
}

/// A cooldown deadline expressing "no worker in this domain may invoke the
/// engine again before `retry_at`".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cooldown {
    #[serde(rename = "retryAtMs")]
    pub retry_at_ms: i64,
    pub reason: String,
    #[serde(rename = "sourceAgent")]
    pub source_agent: String,
    #[serde(default, rename = "taskId")]
    pub task_id: Option<String>,
}

fn cooldown_path(state_dir: &Path, domain: &str) -> PathBuf {
    state_dir.join(format!("{domain}-cooldown.json"))
}

pub fn write_cooldown(
    state_dir: &Path,
    domain: &str,
    retry_at_ms: i64,
    reason: &str,
    source_agent: &str,
    task_id: Option<&str>,
) -> Result<()> {
    let cooldown = Cooldown {
        retry_at_ms,
        reason: reason.to_string(),
        source_agent: source_agent.to_string(),
        task_id: task_id.map(str::to_string),
    };
    let path = cooldown_path(state_dir, domain);
    let dir = path.parent().unwrap();
    std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    let tmp = dir.join(format!(".{domain}-cooldown.tmp-{}", std::process::id()));
    std::fs::write(&tmp, serde_json::to_string(&cooldown)?).map_err(|e| io_err(&tmp, e))?;
    std::fs::rename(&tmp, &path).map_err(|e| io_err(&path, e))?;
    Ok(())
}

/// Read the active cooldown for `domain`, treating an expired one as absent.
pub fn read_cooldown(state_dir: &Path, domain: &str) -> Result<Option<Cooldown>> {
    let path = cooldown_path(state_dir, domain);
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_err(&path, e)),
    };
    let cooldown: Cooldown = serde_json::from_str(&contents)?;
    let now_ms = Utc::now().timestamp_millis();
    if cooldown.retry_at_ms <= now_ms {
        return Ok(None);
    }
    Ok(Some(cooldown))
}

/// Recognize `"try again in <N>ms"`, `"try again in <N>s"`, and
/// `"Retry-After: <N>"` (seconds). Returns `None` on no match.
pub fn parse_retry_after_ms(text: &str) -> Option<i64> {
    use regex::Regex;
    if let Ok(re) = Regex::new(r"(?i)try again in\s+(\d+)\s*ms") {
        if let Some(caps) = re.captures(text) {
            return caps[1].parse::<i64>().ok();
        }
    }
    if let Ok(re) = Regex::new(r"(?i)try again in\s+(\d+)\s*s\b") {
        if let Some(caps) = re.captures(text) {
            return caps[1].parse::<i64>().ok().map(|s| s * 1000);
        }
    }
    if let Ok(re) = Regex::new(r"(?i)retry-after:\s*(\d+)") {
        if let Some(caps) = re.captures(text) {
            return caps[1].parse::<i64>().ok().map(|s| s * 1000);
        }
    }
    None
}

/// Exponential backoff schedule: `base * 2^attempt + jitter`, capped.
pub fn exponential_backoff_ms(base_ms: u64, cap_ms: u64, jitter_ms: u64, attempt: u32) -> u64 {
    let raw = base_ms.saturating_mul(1u64 << attempt.min(20));
    let capped = raw.min(cap_ms);
    let jitter = if jitter_ms == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=jitter_ms)
    };
    capped.saturating_add(jitter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_slot_caps_concurrent_leases() {
        let tmp = tempfile::tempdir().unwrap();
        let state = tmp.path();
        let l1 = acquire_slot(state, "engine", "a", 2, Duration::from_secs(60)).unwrap();
        let l2 = acquire_slot(state, "engine", "b", 2, Duration::from_secs(60)).unwrap();
        let dir = semaphore_dir(state, "engine");
        let count = std::fs::read_dir(&dir).unwrap().count();
        assert_eq!(count, 2);
        drop(l1);
        let count = std::fs::read_dir(&dir).unwrap().count();
        assert_eq!(count, 1);
        drop(l2);
        let count = std::fs::read_dir(&dir).unwrap().count();
        assert_eq!(count, 0);
    }

    #[test]
    fn stale_slot_is_reclaimed() {
        let tmp = tempfile::tempdir().unwrap();
        let state = tmp.path();
        let dir = semaphore_dir(state, "engine");
        std::fs::create_dir_all(&dir).unwrap();
        let stale_slot = SlotFile {
            acquired_at: Utc::now() - chrono::Duration::seconds(120),
            pid: 999_999, // exceedingly unlikely to be a live pid
            name: "dead".into(),
        };
        std::fs::write(dir.join("slot-0.json"), serde_json::to_string(&stale_slot).unwrap()).unwrap();
        let lease = acquire_slot(state, "engine", "fresh", 1, Duration::from_millis(10)).unwrap();
        assert_eq!(lease.path(), dir.join("slot-0.json"));
    }

    #[test]
    fn cooldown_round_trips_and_expires() {
        let tmp = tempfile::tempdir().unwrap();
        let future = Utc::now().timestamp_millis() + 60_000;
        write_cooldown(tmp.path(), "engine", future, "rate_limited", "backend", Some("t1")).unwrap();
        let read = read_cooldown(tmp.path(), "engine").unwrap();
        assert!(read.is_some());

        let past = Utc::now().timestamp_millis() - 1;
        write_cooldown(tmp.path(), "engine", past, "rate_limited", "backend", None).unwrap();
        let read = read_cooldown(tmp.path(), "engine").unwrap();
        assert!(read.is_none());
    }

    #[test]
    fn parses_known_retry_after_shapes() {
        assert_eq!(parse_retry_after_ms("please try again in 1500ms"), Some(1500));
        assert_eq!(parse_retry_after_ms("please try again in 3s"), Some(3000));
        assert_eq!(parse_retry_after_ms("Retry-After: 10"), Some(10_000));
        assert_eq!(parse_retry_after_ms("no timing info here"), None);
    }
}
