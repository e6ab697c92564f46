//! Roster loading — agent names, roles, workdir templates, skills.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Reserved roles with special routing semantics (§3).
pub const ORCHESTRATOR: &str = "orchestrator";
pub const CHAT: &str = "chat";
pub const AUTOPILOT: &str = "autopilot";

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("failed to read roster file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse roster JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unsupported roster schemaVersion {found}, require >= {required}")]
    SchemaVersion { found: u32, required: u32 },
    #[error("duplicate agent name in roster: {0}")]
    DuplicateAgent(String),
    #[error("roster is missing the reserved agent '{0}'")]
    MissingReservedAgent(&'static str),
}

/// An agent's logical role. Non-reserved agents are `Worker`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Orchestrator,
    Chat,
    Autopilot,
    Worker,
}

/// One entry in the roster document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentProfile {
    pub role: AgentRole,
    pub workdir: String,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RosterDocument {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    agents: HashMap<String, AgentProfile>,
}

/// Minimum supported `schemaVersion`.
pub const MIN_SCHEMA_VERSION: u32 = 2;

/// Scan the `agents` object's top-level keys in source order and return the
/// first one that repeats. Deliberately textual (not a full JSON parse of
/// key order) because `serde_json::Value`'s map also collapses duplicates.
fn first_duplicate_agent_key(text: &str) -> Option<String> {
    let start = text.find("\"agents\"")?;
    let brace_start = text[start..].find('{')? + start;
    let mut depth = 0i32;
    let mut seen = std::collections::HashSet::new();
    let bytes = text.as_bytes();
    let mut i = brace_start;
    let mut in_string = false;
    let mut escape = false;
    let mut pending_key: Option<String> = None;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if in_string {
            if escape {
                escape = false;
            } else if c == '\\' {
                escape = true;
            } else if c == '"' {
                in_string = false;
            }
            i += 1;
            continue;
        }
        match c {
            '"' => {
                in_string = true;
                if depth == 1 {
                    let key_start = i + 1;
                    if let Some(end_rel) = text[key_start..].find('"') {
                        pending_key = Some(text[key_start..key_start + end_rel].to_string());
                    }
                }
            }
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            ':' if depth == 1 => {
                if let Some(key) = pending_key.take() {
                    if !seen.insert(key.clone()) {
                        return Some(key);
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Resolved roster: immutable once loaded for the lifetime of a process.
#[derive(Debug, Clone)]
pub struct Roster {
    agents: HashMap<String, AgentProfile>,
}

impl Roster {
    /// Load and validate `ROSTER.json` from `path`.
    pub fn load(path: &Path) -> Result<Self, RosterError> {
        let text = std::fs::read_to_string(path).map_err(|source| RosterError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&text)
    }

    /// Parse and validate a roster from a JSON string (also used in tests).
    pub fn from_json_str(text: &str) -> Result<Self, RosterError> {
        // serde_json silently keeps the last value on a duplicate object key,
        // so duplicate-name detection must scan the raw keys in source order
        // before the lossy map is built.
        if let Some(dup) = first_duplicate_agent_key(text) {
            return Err(RosterError::DuplicateAgent(dup));
        }

        let doc: RosterDocument = serde_json::from_str(text)?;
        if doc.schema_version < MIN_SCHEMA_VERSION {
            return Err(RosterError::SchemaVersion {
                found: doc.schema_version,
                required: MIN_SCHEMA_VERSION,
            });
        }
        for reserved in [ORCHESTRATOR, CHAT, AUTOPILOT] {
            if !doc.agents.contains_key(reserved) {
                return Err(RosterError::MissingReservedAgent(match reserved {
                    ORCHESTRATOR => "orchestrator",
                    CHAT => "chat",
                    _ => "autopilot",
                }));
            }
        }
        Ok(Self {
            agents: doc.agents,
        })
    }

    /// Build a roster directly from an agent map, bypassing file/schema
    /// validation. Used by test fixtures across the workspace.
    pub fn from_parts(agents: HashMap<String, AgentProfile>) -> Self {
        Self { agents }
    }

    pub fn agent(&self, name: &str) -> Option<&AgentProfile> {
        self.agents.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    pub fn agent_names(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(String::as_str)
    }

    pub fn is_autopilot(&self, name: &str) -> bool {
        name == AUTOPILOT
    }

    pub fn is_orchestrator(&self, name: &str) -> bool {
        name == ORCHESTRATOR
    }
}
