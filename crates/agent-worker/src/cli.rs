//! CLI surface (spec §6 + supplemental `bus-admin` tooling). The worker's
//! own flags (`--agent`, `--bus-root`, `--roster`, `--once`, `--poll-ms`,
//! `--engine-bin`) are specified bit-exact; the `bus-admin` subcommand
//! family (`deliver`/`ps`/`cat`/`tail`) is this crate's own operator
//! tooling layered on top, in the teacher's `clap::Parser` derive style
//! (`coordination::main::Args`).

use bus_core::roster::Roster;
use bus_core::store::BusStore;
use bus_core::task::{Priority, SignalKind, Signals, TaskMeta, TaskState};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Bus(#[from] bus_core::store::BusError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Frontmatter(#[from] bus_core::frontmatter::FrontmatterError),
    #[error("unknown signal kind `{0}`")]
    UnknownKind(String),
}

/// Top-level CLI: a bare invocation runs the worker loop using the flags
/// below; `bus-admin <subcommand>` runs one operator tool instead and
/// exits without touching the worker lock.
#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Agent name this worker process serves. Required unless a
    /// `bus-admin` subcommand is given.
    #[arg(long)]
    pub agent: Option<String>,

    #[arg(long)]
    pub bus_root: Option<PathBuf>,

    #[arg(long)]
    pub roster: Option<PathBuf>,

    #[arg(long, default_value_t = false)]
    pub once: bool,

    #[arg(long, default_value_t = 200)]
    pub poll_ms: u64,

    #[arg(long)]
    pub engine_bin: Option<PathBuf>,

    #[command(subcommand)]
    pub admin: Option<AdminCommand>,
}

#[derive(Debug, Subcommand)]
pub enum AdminCommand {
    /// Deliver a new packet directly onto the bus, bypassing any agent.
    Deliver {
        #[arg(long)]
        to: Vec<String>,
        #[arg(long)]
        from: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        kind: String,
        #[arg(long)]
        id: String,
        #[arg(long, value_enum, default_value_t = CliPriority::P2)]
        priority: CliPriority,
        /// Body text, or `-` to read from stdin.
        #[arg(long, default_value = "-")]
        body: String,
    },
    /// List every packet id in an agent's inbox, grouped by state.
    Ps {
        #[arg(long)]
        agent: String,
    },
    /// Print one packet's current frontmatter and body.
    Cat {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        id: String,
    },
    /// Poll a packet's body for new `### Update` blocks.
    Tail {
        #[arg(long)]
        agent: String,
        #[arg(long)]
        id: String,
        #[arg(long, default_value_t = 10)]
        max_polls: u32,
        #[arg(long, default_value_t = 500)]
        poll_ms: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum CliPriority {
    P1,
    P2,
    P3,
}

impl From<CliPriority> for Priority {
    fn from(value: CliPriority) -> Self {
        match value {
            CliPriority::P1 => Priority::P1,
            CliPriority::P2 => Priority::P2,
            CliPriority::P3 => Priority::P3,
        }
    }
}

fn parse_kind(kind: &str) -> Result<SignalKind, CliError> {
    match kind {
        "USER_REQUEST" => Ok(SignalKind::UserRequest),
        "EXECUTE" => Ok(SignalKind::Execute),
        "STATUS" => Ok(SignalKind::Status),
        "REVIEW_ACTION_REQUIRED" => Ok(SignalKind::ReviewActionRequired),
        "ORCHESTRATOR_UPDATE" => Ok(SignalKind::OrchestratorUpdate),
        "TASK_COMPLETE" => Ok(SignalKind::TaskComplete),
        "OPUS_CONSULT_REQUEST" => Ok(SignalKind::OpusConsultRequest),
        "OPUS_CONSULT_RESPONSE" => Ok(SignalKind::OpusConsultResponse),
        other => Err(CliError::UnknownKind(other.to_string())),
    }
}

pub fn run_deliver(
    store: &BusStore,
    roster: &Roster,
    to: Vec<String>,
    from: String,
    title: String,
    kind: &str,
    id: String,
    priority: CliPriority,
    body: String,
) -> Result<(), CliError> {
    let meta = TaskMeta {
        id,
        to,
        from,
        priority: priority.into(),
        title,
        signals: Signals::new(parse_kind(kind)?),
        references: Default::default(),
    };
    store.deliver(roster, meta, body)?;
    Ok(())
}

/// One line per packet currently in any of `agent`'s inbox state dirs.
pub fn run_ps(store: &BusStore, agent: &str) -> Result<Vec<(TaskState, String)>, CliError> {
    let mut listing = Vec::new();
    for state in TaskState::ALL {
        let dir = store.inbox_dir(agent, state);
        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("md") {
                if let Some(id) = path.file_stem().and_then(|s| s.to_str()) {
                    listing.push((state, id.to_string()));
                }
            }
        }
    }
    Ok(listing)
}

/// Render a packet's current frontmatter + body as a single string.
pub fn run_cat(store: &BusStore, agent: &str, id: &str) -> Result<String, CliError> {
    let opened = store.open(agent, id, false)?;
    Ok(bus_core::frontmatter::render(&opened.packet)?)
}

/// Poll an in-flight packet's body for up to `max_polls` iterations,
/// returning every distinct body snapshot observed (the first entry is
/// the body at call time). A caller wiring this to a live CLI wraps this
/// in its own sleep between polls; kept as plain snapshots here so the
/// function is deterministic to test without a background clock.
pub fn collect_tail_snapshots(
    store: &BusStore,
    agent: &str,
    id: &str,
    max_polls: u32,
    mut sleep: impl FnMut(),
) -> Result<Vec<String>, CliError> {
    let mut snapshots = Vec::new();
    let mut last = None;
    for _ in 0..max_polls.max(1) {
        let opened = store.open(agent, id, false)?;
        if last.as_ref() != Some(&opened.packet.body) {
            snapshots.push(opened.packet.body.clone());
            last = Some(opened.packet.body);
        }
        sleep();
    }
    Ok(snapshots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn roster() -> Roster {
        let mut agents = HashMap::new();
        agents.insert(
            "orchestrator".to_string(),
            bus_core::roster::AgentProfile {
                role: bus_core::roster::AgentRole::Orchestrator,
                workdir: "/tmp".into(),
                skills: vec![],
                branch: None,
            },
        );
        agents.insert(
            "chat".to_string(),
            bus_core::roster::AgentProfile {
                role: bus_core::roster::AgentRole::Chat,
                workdir: "/tmp".into(),
                skills: vec![],
                branch: None,
            },
        );
        agents.insert(
            "autopilot".to_string(),
            bus_core::roster::AgentProfile {
                role: bus_core::roster::AgentRole::Autopilot,
                workdir: "/tmp".into(),
                skills: vec![],
                branch: None,
            },
        );
        agents.insert(
            "backend".to_string(),
            bus_core::roster::AgentProfile {
                role: bus_core::roster::AgentRole::Worker,
                workdir: "/tmp".into(),
                skills: vec![],
                branch: None,
            },
        );
        Roster::from_parts(agents)
    }

    #[test]
    fn deliver_then_ps_shows_it_in_new() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BusStore::new(tmp.path());
        let roster = roster();
        store.ensure(&roster).unwrap();

        run_deliver(
            &store,
            &roster,
            vec!["backend".into()],
            "operator".into(),
            "do it".into(),
            "USER_REQUEST",
            "t1".into(),
            CliPriority::P1,
            "hello".into(),
        )
        .unwrap();

        let listing = run_ps(&store, "backend").unwrap();
        assert_eq!(listing, vec![(TaskState::New, "t1".to_string())]);
    }

    #[test]
    fn cat_renders_current_packet() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BusStore::new(tmp.path());
        let roster = roster();
        store.ensure(&roster).unwrap();
        run_deliver(
            &store,
            &roster,
            vec!["backend".into()],
            "operator".into(),
            "do it".into(),
            "USER_REQUEST",
            "t1".into(),
            CliPriority::P1,
            "hello".into(),
        )
        .unwrap();

        let rendered = run_cat(&store, "backend", "t1").unwrap();
        assert!(rendered.contains("hello"));
        assert!(rendered.starts_with("---\n"));
    }

    #[test]
    fn tail_collects_distinct_body_snapshots() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BusStore::new(tmp.path());
        let roster = roster();
        store.ensure(&roster).unwrap();
        run_deliver(
            &store,
            &roster,
            vec!["backend".into()],
            "operator".into(),
            "do it".into(),
            "USER_REQUEST",
            "t1".into(),
            CliPriority::P1,
            "hello".into(),
        )
        .unwrap();
        store.claim("backend", "t1").unwrap();

        let mut polls = 0u32;
        let snapshots = collect_tail_snapshots(&store, "backend", "t1", 3, || {
            polls += 1;
            if polls == 1 {
                store.update("backend", "t1", Some("an update"), None, None).unwrap();
            }
        })
        .unwrap();
        assert_eq!(snapshots.len(), 2);
        assert!(snapshots[1].contains("an update"));
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = BusStore::new(tmp.path());
        let roster = roster();
        store.ensure(&roster).unwrap();
        let err = run_deliver(
            &store,
            &roster,
            vec!["backend".into()],
            "operator".into(),
            "do it".into(),
            "NOT_A_KIND",
            "t1".into(),
            CliPriority::P1,
            "hello".into(),
        )
        .unwrap_err();
        assert!(matches!(err, CliError::UnknownKind(_)));
    }
}
