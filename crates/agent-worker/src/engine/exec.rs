//! The single-shot "exec" engine driver (spec §4.4): each turn spawns a
//! fresh `<bin> exec [--resume <threadId>] [-o <outPath>] [--sandbox
//! <policy>] [--add-dir <path>]... [--config k=v]... < prompt-on-stdin`,
//! timing the child out at `opts.timeout` via a watchdog thread. The
//! engine writes its final message to `-o` rather than stdout, and emits a
//! `session id: <id>` marker on stderr that is captured as the thread id.

use super::{EngineDiagnostic, EngineDriver, EngineError, InterruptHandle, ThreadScope, TurnOpts, TurnResult};
use bus_core::limiter::parse_retry_after_ms;
use std::io::Write;
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

fn parse_session_id(stderr: &str) -> Option<String> {
    stderr.lines().find_map(|line| {
        let rest = line.trim().strip_prefix("session id:")?;
        let id = rest.trim();
        (!id.is_empty()).then(|| id.to_string())
    })
}

/// Invokes `engine_bin` as a one-shot child process per turn. No
/// persistent process state is kept between turns: `ThreadScope` only
/// decides whether `opts.resume_thread_id` is forwarded as `--resume`,
/// since the exec engine has no server-side thread to pin to.
pub struct ExecEngine {
    bin: std::path::PathBuf,
    extra_env: Vec<(String, String)>,
    interrupt_handle: InterruptHandle,
}

impl ExecEngine {
    pub fn new(bin: impl Into<std::path::PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            extra_env: Vec::new(),
            interrupt_handle: InterruptHandle::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.push((key.into(), value.into()));
        self
    }
}

impl EngineDriver for ExecEngine {
    fn run_turn(&mut self, prompt: &str, opts: &TurnOpts) -> Result<TurnResult, EngineError> {
        let out_path = std::env::temp_dir().join(format!(
            "agent-worker-exec-{}-{}.json",
            std::process::id(),
            opts.workdir.file_name().and_then(|n| n.to_str()).unwrap_or("turn")
        ));

        let mut cmd = Command::new(&self.bin);
        cmd.arg("exec");
        if !matches!(opts.scope, ThreadScope::None) {
            if let Some(resume) = &opts.resume_thread_id {
                cmd.arg("--resume").arg(resume);
            }
        }
        cmd.arg("-o").arg(&out_path);
        cmd.arg("--sandbox").arg(&opts.sandbox_policy);
        for dir in &opts.add_dirs {
            cmd.arg("--add-dir").arg(dir);
        }
        for (k, v) in &opts.config {
            cmd.arg("--config").arg(format!("{k}={v}"));
        }
        if opts.is_review {
            cmd.arg("--mode").arg("review");
        }
        cmd.current_dir(&opts.workdir);
        for (k, v) in &self.extra_env {
            cmd.env(k, v);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(EngineError::Spawn)?;
        self.interrupt_handle.set_pid(child.id());
        {
            let mut stdin = child.stdin.take().expect("stdin was piped");
            stdin.write_all(prompt.as_bytes())?;
        }

        let (tx, rx) = mpsc::channel();
        let timeout = opts.timeout;
        let stdout = child.stdout.take().expect("stdout was piped");
        let stderr = child.stderr.take().expect("stderr was piped");
        std::thread::spawn(move || {
            use std::io::Read;
            let mut out = String::new();
            let mut out_reader = stdout;
            let _ = out_reader.read_to_string(&mut out);
            let mut err = String::new();
            let mut err_reader = stderr;
            let _ = err_reader.read_to_string(&mut err);
            let _ = tx.send((out, err));
        });

        let deadline = Instant::now() + timeout;
        let result = loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    let (_stdout, stderr) = rx.recv_timeout(Duration::from_secs(5)).unwrap_or_default();
                    let thread_id = parse_session_id(&stderr);
                    if !status.success() {
                        if let Some(retry_after_ms) = parse_retry_after_ms(&stderr) {
                            break Err(EngineError::RateLimited {
                                retry_after_ms: Some(retry_after_ms),
                            });
                        }
                        #[cfg(unix)]
                        {
                            use std::os::unix::process::ExitStatusExt;
                            if status.signal() == Some(libc::SIGTERM) {
                                break Err(EngineError::Interrupted);
                            }
                        }
                        warn!(code = ?status.code(), stderr = %stderr, "exec engine exited non-zero");
                        break Err(EngineError::Crashed(status.code()));
                    }
                    let final_message = std::fs::read_to_string(&out_path).unwrap_or_default();
                    let _ = std::fs::remove_file(&out_path);
                    debug!(bytes = final_message.len(), thread_id = ?thread_id, "exec engine turn complete");
                    break Ok(TurnResult {
                        final_message,
                        thread_id,
                    });
                }
                Ok(None) => {
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        let _ = std::fs::remove_file(&out_path);
                        break Err(EngineError::Timeout(timeout));
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => break Err(EngineError::Io(e)),
            }
        };
        self.interrupt_handle.clear();
        result
    }

    fn interrupt(&mut self) -> Result<(), EngineError> {
        self.interrupt_handle.fire();
        Ok(())
    }

    fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt_handle.clone()
    }
}

/// Parse an engine diagnostic line (`{"message": "...", "retryAfterMs": N}`)
/// off stderr, used by callers that want structured rather than regex-based
/// rate-limit detection when the engine emits JSON diagnostics.
pub fn parse_diagnostic_line(line: &str) -> Option<EngineDiagnostic> {
    serde_json::from_str(line).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_fake_engine(dir: &std::path::Path, script: &str) -> std::path::PathBuf {
        let path = dir.join("fake-engine.sh");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(script.as_bytes()).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        path
    }

    fn base_opts(workdir: std::path::PathBuf, timeout: Duration) -> TurnOpts {
        TurnOpts {
            scope: ThreadScope::None,
            timeout,
            is_review: false,
            workdir,
            resume_thread_id: None,
            sandbox_policy: "workspace-write".into(),
            add_dirs: Vec::new(),
            config: Vec::new(),
        }
    }

    /// Every fake script below locates its `-o` argument with this shared
    /// shell snippet, then writes the turn's final message there.
    const FIND_OUT: &str = r#"
out=""
while [ $# -gt 0 ]; do
  case "$1" in
    -o) out="$2"; shift 2 ;;
    *) shift ;;
  esac
done
"#;

    #[test]
    fn successful_turn_writes_out_path_and_echoes_stdin() {
        let tmp = tempfile::tempdir().unwrap();
        let script = format!("#!/bin/sh\n{FIND_OUT}\ninput=$(cat)\nprintf '%s' \"$input\" > \"$out\"\n");
        let bin = write_fake_engine(tmp.path(), &script);
        let mut engine = ExecEngine::new(bin);
        let opts = base_opts(tmp.path().to_path_buf(), Duration::from_secs(5));
        let result = engine.run_turn("hello engine", &opts).unwrap();
        assert_eq!(result.final_message, "hello engine");
    }

    #[test]
    fn captures_session_id_from_stderr() {
        let tmp = tempfile::tempdir().unwrap();
        let script = format!(
            "#!/bin/sh\n{FIND_OUT}\ncat >/dev/null\nprintf 'ok' > \"$out\"\necho 'session id: th-abc123' >&2\n"
        );
        let bin = write_fake_engine(tmp.path(), &script);
        let mut engine = ExecEngine::new(bin);
        let opts = base_opts(tmp.path().to_path_buf(), Duration::from_secs(5));
        let result = engine.run_turn("x", &opts).unwrap();
        assert_eq!(result.thread_id.as_deref(), Some("th-abc123"));
    }

    #[test]
    fn nonzero_exit_is_crashed() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = write_fake_engine(tmp.path(), "#!/bin/sh\ncat >/dev/null\nexit 3\n");
        let mut engine = ExecEngine::new(bin);
        let opts = base_opts(tmp.path().to_path_buf(), Duration::from_secs(5));
        let err = engine.run_turn("x", &opts).unwrap_err();
        assert!(matches!(err, EngineError::Crashed(Some(3))));
    }

    #[test]
    fn rate_limit_message_on_stderr_is_recognized() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = write_fake_engine(
            tmp.path(),
            "#!/bin/sh\ncat >/dev/null\necho 'please try again in 2000ms' >&2\nexit 1\n",
        );
        let mut engine = ExecEngine::new(bin);
        let opts = base_opts(tmp.path().to_path_buf(), Duration::from_secs(5));
        let err = engine.run_turn("x", &opts).unwrap_err();
        match err {
            EngineError::RateLimited { retry_after_ms } => assert_eq!(retry_after_ms, Some(2000)),
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[test]
    fn timeout_kills_child() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = write_fake_engine(tmp.path(), "#!/bin/sh\ncat >/dev/null\nsleep 5\n");
        let mut engine = ExecEngine::new(bin);
        let opts = base_opts(tmp.path().to_path_buf(), Duration::from_millis(200));
        let err = engine.run_turn("x", &opts).unwrap_err();
        assert!(matches!(err, EngineError::Timeout(_)));
    }

    #[test]
    fn interrupt_handle_kills_in_flight_turn_from_another_thread() {
        let tmp = tempfile::tempdir().unwrap();
        let bin = write_fake_engine(tmp.path(), "#!/bin/sh\ncat >/dev/null\nsleep 5\n");
        let mut engine = ExecEngine::new(bin);
        let handle = engine.interrupt_handle();
        let opts = base_opts(tmp.path().to_path_buf(), Duration::from_secs(30));
        let killer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            handle.fire();
        });
        let err = engine.run_turn("x", &opts).unwrap_err();
        killer.join().unwrap();
        assert!(matches!(err, EngineError::Interrupted));
    }
}
