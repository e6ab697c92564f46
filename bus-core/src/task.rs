//! Task packet types — the markdown-plus-frontmatter message that moves
//! through the bus.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Ordinal priority tag carried on every packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    P1,
    P2,
    P3,
}

impl Default for Priority {
    fn default() -> Self {
        Self::P2
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::P1 => write!(f, "P1"),
            Self::P2 => write!(f, "P2"),
            Self::P3 => write!(f, "P3"),
        }
    }
}

/// Closed set of signal kinds. Modelled as a tagged enum rather than a bare
/// string per REDESIGN FLAGS (§9): the orchestrator/autopilot cycle is data,
/// not types, but the *kind* of message flowing through it is a fixed
/// vocabulary and should fail to deserialize on typos rather than silently
/// falling through a string match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    UserRequest,
    Execute,
    Status,
    ReviewActionRequired,
    OrchestratorUpdate,
    TaskComplete,
    OpusConsultRequest,
    OpusConsultResponse,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// The `signals` record of a task packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signals {
    pub kind: SignalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smoke: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_target: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_orchestrator: Option<bool>,
}

impl Signals {
    pub fn new(kind: SignalKind) -> Self {
        Self {
            kind,
            phase: None,
            root_id: None,
            parent_id: None,
            smoke: None,
            source_kind: None,
            review_required: None,
            review_target: None,
            notify_orchestrator: None,
        }
    }
}

/// Git lineage carried in `references.git`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GitReferences {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_sha: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration_branch: Option<String>,
}

/// Free-form `references` mapping. Conventional keys (`git`, `opus`,
/// `reviewTarget`, `completedTaskKind`, `integration`) are surfaced as typed
/// accessors; anything else round-trips through the backing map untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct References {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git: Option<GitReferences>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opus: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_target: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_task_kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestrator_self_remediate_depth: Option<u32>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// The single-line JSON frontmatter header of a task packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMeta {
    pub id: String,
    pub to: Vec<String>,
    pub from: String,
    #[serde(default)]
    pub priority: Priority,
    pub title: String,
    pub signals: Signals,
    #[serde(default)]
    pub references: References,
}

/// A parsed packet: frontmatter plus markdown body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskPacket {
    pub meta: TaskMeta,
    pub body: String,
}

/// The directory a packet currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    New,
    Seen,
    InProgress,
    Processed,
}

impl TaskState {
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Seen => "seen",
            Self::InProgress => "in_progress",
            Self::Processed => "processed",
        }
    }

    pub const ALL: [TaskState; 4] = [Self::New, Self::Seen, Self::InProgress, Self::Processed];
}

/// An `### Update (<iso-timestamp>) from <agent>` block appended to an
/// in-progress packet body.
pub fn format_update_heading(agent: &str, at: DateTime<Utc>) -> String {
    format!("### Update ({}) from {}", at.to_rfc3339(), agent)
}
