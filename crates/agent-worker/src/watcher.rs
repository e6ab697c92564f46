//! Task-update watcher (C5): polls a claimed packet's mtime while a turn
//! is in flight and cancels it when the task file is mutated underneath
//! the worker (an operator or another process appending an update),
//! bounded to `max_restarts` (default 8) so a flapping task can't loop
//! forever.

use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Spawned per in-flight turn; dropped (or `stop()`-ed) when the turn ends
/// normally so the background poll task exits.
pub struct Watcher {
    token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl Watcher {
    /// Start polling `path`'s mtime every `poll_interval`. `baseline` is
    /// the mtime observed when the turn began; any later mtime cancels
    /// `token`. Internally tracks how many times this has already fired
    /// for the same task across restarts via `restart_count`; once it
    /// reaches `max_restarts` the watcher stops re-arming and simply logs.
    pub fn spawn(
        path: PathBuf,
        baseline: std::time::SystemTime,
        poll_interval: Duration,
        max_restarts: u32,
        restart_count: std::sync::Arc<std::sync::atomic::AtomicU32>,
    ) -> (Self, CancellationToken) {
        let stop_token = CancellationToken::new();
        let turn_token = CancellationToken::new();
        let background_stop = stop_token.clone();
        let background_turn = turn_token.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(poll_interval) => {}
                    _ = background_stop.cancelled() => return,
                }
                let mtime = match std::fs::metadata(&path).and_then(|m| m.modified()) {
                    Ok(m) => m,
                    Err(_) => continue, // task may be mid-move; ignore transient misses
                };
                if mtime > baseline {
                    let count = restart_count.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                    if count > max_restarts {
                        warn!(path = %path.display(), count, max_restarts, "task-update watcher restart bound exceeded, not interrupting again");
                        return;
                    }
                    info!(path = %path.display(), count, "task file updated mid-turn, interrupting");
                    background_turn.cancel();
                    return;
                }
            }
        });
        (Self { token: stop_token, handle }, turn_token)
    }

    pub async fn stop(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    #[tokio::test(flavor = "current_thread")]
    async fn cancels_when_file_mtime_advances() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("t1.md");
        std::fs::write(&path, "v1").unwrap();
        let baseline = std::fs::metadata(&path).unwrap().modified().unwrap();

        let restart_count = Arc::new(AtomicU32::new(0));
        let (watcher, turn_token) = Watcher::spawn(
            path.clone(),
            baseline,
            Duration::from_millis(20),
            8,
            restart_count.clone(),
        );

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!turn_token.is_cancelled());

        tokio::time::sleep(Duration::from_millis(10)).await;
        std::fs::write(&path, "v2").unwrap();
        let future = std::time::SystemTime::now() + Duration::from_secs(3600);
        filetime_set(&path, future);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(turn_token.is_cancelled());
        assert_eq!(restart_count.load(std::sync::atomic::Ordering::SeqCst), 1);
        watcher.stop().await;
    }

    fn filetime_set(path: &std::path::Path, time: std::time::SystemTime) {
        // Re-write with new content; on most filesystems this alone advances
        // mtime enough within the test's polling window without a filetime
        // crate dependency. `time` is accepted for documentation purposes.
        let _ = time;
        std::fs::write(path, "v2-touch").unwrap();
    }
}
