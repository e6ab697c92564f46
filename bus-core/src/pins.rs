//! Thread-pin bookkeeping for the app-server engine driver: which
//! `thread_id` a root (or the global/no-root default) is currently bound
//! to, and how many turns have been taken on it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// A single pinned session: the app-server thread id plus a turn counter
/// used to decide when a thread should be retired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootSessionRecord {
    #[serde(rename = "threadId")]
    pub thread_id: String,
    #[serde(rename = "turnCount")]
    pub turn_count: u32,
}

impl RootSessionRecord {
    pub fn new(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: thread_id.into(),
            turn_count: 0,
        }
    }

    pub fn record_turn(&mut self) {
        self.turn_count = self.turn_count.saturating_add(1);
    }
}

/// Scope a pin lives in: the agent's single global default-thread pin, or
/// one pin per `rootId` for task chains that should stay on one thread.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PinScope {
    Global,
    Root { root_id: String },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PinFile {
    #[serde(default)]
    global: Option<RootSessionRecord>,
    #[serde(default)]
    roots: HashMap<String, RootSessionRecord>,
}

/// Persists an agent's pin table to `<state_dir>/<agent>-pins.json`, so a
/// restarted worker process resumes the same app-server threads instead of
/// starting fresh ones.
pub struct PinTable {
    path: PathBuf,
    file: PinFile,
}

impl PinTable {
    pub fn load(state_dir: &Path, agent: &str) -> std::io::Result<Self> {
        let path = state_dir.join(format!("{agent}-pins.json"));
        let file = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => PinFile::default(),
            Err(e) => return Err(e),
        };
        Ok(Self { path, file })
    }

    pub fn get(&self, scope: &PinScope) -> Option<&RootSessionRecord> {
        match scope {
            PinScope::Global => self.file.global.as_ref(),
            PinScope::Root { root_id } => self.file.roots.get(root_id),
        }
    }

    pub fn set(&mut self, scope: PinScope, record: RootSessionRecord) {
        match scope {
            PinScope::Global => self.file.global = Some(record),
            PinScope::Root { root_id } => {
                self.file.roots.insert(root_id, record);
            }
        }
    }

    pub fn clear(&mut self, scope: &PinScope) {
        match scope {
            PinScope::Global => self.file.global = None,
            PinScope::Root { root_id } => {
                self.file.roots.remove(root_id);
            }
        }
    }

    pub fn save(&self) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&self.file)
            .expect("pin table is always serializable");
        let tmp = self
            .path
            .with_extension(format!("tmp-{}", std::process::id()));
        std::fs::write(&tmp, contents)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_global_and_root_pins() {
        let tmp = tempfile::tempdir().unwrap();
        let mut table = PinTable::load(tmp.path(), "backend").unwrap();
        table.set(PinScope::Global, RootSessionRecord::new("thread-global"));
        table.set(
            PinScope::Root {
                root_id: "r1".into(),
            },
            RootSessionRecord::new("thread-r1"),
        );
        table.save().unwrap();

        let reloaded = PinTable::load(tmp.path(), "backend").unwrap();
        assert_eq!(reloaded.get(&PinScope::Global).unwrap().thread_id, "thread-global");
        assert_eq!(
            reloaded
                .get(&PinScope::Root {
                    root_id: "r1".into()
                })
                .unwrap()
                .thread_id,
            "thread-r1"
        );
    }

    #[test]
    fn clear_removes_pin() {
        let tmp = tempfile::tempdir().unwrap();
        let mut table = PinTable::load(tmp.path(), "backend").unwrap();
        let scope = PinScope::Root {
            root_id: "r1".into(),
        };
        table.set(scope.clone(), RootSessionRecord::new("thread-r1"));
        table.clear(&scope);
        assert!(table.get(&scope).is_none());
    }
}
