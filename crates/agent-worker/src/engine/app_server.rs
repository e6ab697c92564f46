//! The persistent "app-server" engine driver: one long-lived subprocess per
//! worker, spoken to over newline-delimited JSON-RPC on stdio (spec §4.4,
//! §6). `initialize`/`initialized` run once per process; `thread/start` or
//! `thread/resume` once per pinned thread; `turn/start`/`review/start` once
//! per turn, streaming `item/agentMessage/delta` notifications that are
//! concatenated into the turn's final message when `turn/completed` lands.

use super::{EngineDriver, EngineError, InterruptHandle, ThreadScope, TurnOpts, TurnResult};
use serde_json::{json, Value};
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

enum Line {
    Text(String),
    Eof,
}

pub struct AppServerEngine {
    child: Child,
    stdin: ChildStdin,
    lines: Receiver<Line>,
    next_id: u64,
    initialized: bool,
    thread_id: Option<String>,
    /// Set by the caller before a turn when persisted-resume is enabled and
    /// a prior thread id is known for this scope.
    resume_thread_id: Option<String>,
    interrupt_handle: InterruptHandle,
}

impl AppServerEngine {
    pub fn spawn(bin: impl AsRef<std::path::Path>) -> Result<Self, EngineError> {
        let mut cmd = Command::new(bin.as_ref());
        cmd.arg("--app-server");
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        let mut child = cmd.spawn().map_err(EngineError::Spawn)?;
        let stdin = child.stdin.take().expect("stdin was piped");
        let stdout = child.stdout.take().expect("stdout was piped");

        let (tx, rx) = mpsc::channel();
        std::thread::spawn(move || {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                match line {
                    Ok(text) => {
                        if tx.send(Line::Text(text)).is_err() {
                            break;
                        }
                    }
                    Err(_) => break,
                }
            }
            let _ = tx.send(Line::Eof);
        });

        Ok(Self {
            child,
            stdin,
            lines: rx,
            next_id: 1,
            initialized: false,
            thread_id: None,
            resume_thread_id: None,
            interrupt_handle: InterruptHandle::new(),
        })
    }

    pub fn set_resume_thread_id(&mut self, thread_id: Option<String>) {
        self.resume_thread_id = thread_id;
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    fn write_line(&mut self, value: &Value) -> Result<(), EngineError> {
        let mut text = serde_json::to_string(value)?;
        text.push('\n');
        self.stdin.write_all(text.as_bytes())?;
        self.stdin.flush()?;
        Ok(())
    }

    fn next_request_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Send a request and block (up to `timeout`) for its matching
    /// `{id, result}`/`{id, error}` response, logging any notification
    /// lines observed in the meantime (unknown methods are ignored per
    /// spec, known ones are handled by the caller via `recv_until`).
    fn request(&mut self, method: &str, params: Value, timeout: Duration) -> Result<Value, EngineError> {
        let id = self.next_request_id();
        self.write_line(&json!({"id": id, "method": method, "params": params}))?;
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(EngineError::Timeout(timeout));
            }
            match self.lines.recv_timeout(remaining.min(Duration::from_millis(500))) {
                Ok(Line::Text(text)) => {
                    let value: Value = match serde_json::from_str(&text) {
                        Ok(v) => v,
                        Err(_) => {
                            debug!(line = %text, "non-JSON line from app-server, ignoring");
                            continue;
                        }
                    };
                    if value.get("id").and_then(Value::as_u64) == Some(id) {
                        if let Some(error) = value.get("error") {
                            return Err(EngineError::ProtocolDesync(error.to_string()));
                        }
                        return Ok(value.get("result").cloned().unwrap_or(Value::Null));
                    }
                    // A notification or a stale response; ignored here.
                }
                Ok(Line::Eof) => return Err(EngineError::Crashed(self.child.try_wait().ok().flatten().and_then(|s| s.code()))),
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(EngineError::Crashed(self.child.try_wait().ok().flatten().and_then(|s| s.code())))
                }
            }
        }
    }

    fn ensure_initialized(&mut self, timeout: Duration) -> Result<(), EngineError> {
        if self.initialized {
            return Ok(());
        }
        self.request("initialize", json!({"protocolVersion": "v1"}), timeout)?;
        self.write_line(&json!({"method": "initialized", "params": {}}))?;
        self.initialized = true;
        Ok(())
    }

    /// Run the turn-start/review-start call and drain notifications until
    /// `turn/completed` arrives, accumulating streamed message deltas.
    fn run_streamed_turn(&mut self, method: &str, params: Value, timeout: Duration) -> Result<String, EngineError> {
        let id = self.next_request_id();
        self.write_line(&json!({"id": id, "method": method, "params": params}))?;

        let deadline = Instant::now() + timeout;
        let mut buffer = String::new();
        let mut completed_message: Option<String> = None;

        loop {
            if self.interrupt_handle.take_requested() {
                let _ = self.request("turn/interrupt", json!({}), Duration::from_secs(5));
                return Err(EngineError::Interrupted);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(EngineError::Timeout(timeout));
            }
            match self.lines.recv_timeout(remaining.min(Duration::from_millis(500))) {
                Ok(Line::Text(text)) => {
                    let value: Value = match serde_json::from_str(&text) {
                        Ok(v) => v,
                        Err(_) => continue,
                    };
                    if value.get("id").and_then(Value::as_u64) == Some(id) {
                        if let Some(error) = value.get("error") {
                            return Err(EngineError::ProtocolDesync(error.to_string()));
                        }
                        continue;
                    }
                    let Some(notif_method) = value.get("method").and_then(Value::as_str) else {
                        continue;
                    };
                    match notif_method {
                        "item/agentMessage/delta" => {
                            if let Some(delta) = value.pointer("/params/delta").and_then(Value::as_str) {
                                buffer.push_str(delta);
                            }
                        }
                        "item/completed" => {
                            if let Some(text) = value.pointer("/params/text").and_then(Value::as_str) {
                                completed_message = Some(text.to_string());
                            }
                        }
                        "turn/completed" => {
                            if let Some(thread_id) = value.pointer("/params/threadId").and_then(Value::as_str) {
                                self.thread_id = Some(thread_id.to_string());
                            }
                            return Ok(completed_message.unwrap_or(buffer));
                        }
                        "turn/started" => {}
                        other => debug!(method = other, "ignoring unknown app-server notification"),
                    }
                }
                Ok(Line::Eof) => return Err(EngineError::Crashed(self.child.try_wait().ok().flatten().and_then(|s| s.code()))),
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    return Err(EngineError::Crashed(self.child.try_wait().ok().flatten().and_then(|s| s.code())))
                }
            }
        }
    }
}

impl EngineDriver for AppServerEngine {
    fn run_turn(&mut self, prompt: &str, opts: &TurnOpts) -> Result<TurnResult, EngineError> {
        self.ensure_initialized(opts.timeout)?;

        match &opts.scope {
            ThreadScope::None => {}
            ThreadScope::Global | ThreadScope::Root(_) => {
                if self.thread_id.is_none() {
                    if let Some(resume_id) = self.resume_thread_id.take() {
                        let result = self.request("thread/resume", json!({"threadId": resume_id}), opts.timeout)?;
                        self.thread_id = result
                            .get("threadId")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .or(Some(resume_id));
                    } else {
                        let result = self.request("thread/start", json!({}), opts.timeout)?;
                        self.thread_id = result.get("threadId").and_then(Value::as_str).map(str::to_string);
                    }
                }
            }
        }

        let method = if opts.is_review { "review/start" } else { "turn/start" };
        let params = json!({
            "threadId": self.thread_id,
            "prompt": prompt,
            "workdir": opts.workdir.display().to_string(),
            "sandboxPolicy": opts.sandbox_policy,
        });
        let final_message = self.run_streamed_turn(method, params, opts.timeout)?;

        Ok(TurnResult {
            final_message,
            thread_id: self.thread_id.clone(),
        })
    }

    fn interrupt(&mut self) -> Result<(), EngineError> {
        self.interrupt_handle.fire();
        let _ = self.request("turn/interrupt", json!({}), Duration::from_secs(5));
        Ok(())
    }

    fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt_handle.clone()
    }
}

impl Drop for AppServerEngine {
    fn drop(&mut self) {
        if let Ok(None) = self.child.try_wait() {
            warn!("killing app-server child on drop");
            let _ = self.child.kill();
        }
    }
}
