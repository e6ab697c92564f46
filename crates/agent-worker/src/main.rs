//! Binary entry point: parse the CLI (spec §6), resolve the bus root and
//! roster, then either run one `bus-admin` operator command or start the
//! worker/orchestrator loop for `--agent`. Grounded on the teacher's
//! `swarm-agents/main.rs` startup shape (`tracing_subscriber` init → load
//! config → reconcile/health-check → run the loop), translated from a
//! single always-the-same-role binary into one binary that plays the
//! orchestrator role or a generic worker role depending on `--agent`.

use agent_worker::cli::{collect_tail_snapshots, run_cat, run_deliver, run_ps, AdminCommand, Cli};
use agent_worker::orchestrator::OrchestratorRuntime;
use agent_worker::run_loop;
use agent_worker::worker::{WorkerError, WorkerRuntime};
use bus_core::config::WorkerConfig;
use bus_core::paths::resolve_bus_root;
use bus_core::roster::{Roster, ORCHESTRATOR};
use bus_core::store::BusStore;
use bus_core::task::TaskState;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

/// Guardrail-block exit code (spec §6): a protected action (push to a
/// protected branch, a merge) was blocked by the engine's own guard-bin,
/// not by this worker's own gate chain.
const EXIT_GUARDRAIL_BLOCK: u8 = 49;

#[tokio::main]
async fn main() -> ExitCode {
    agent_worker::telemetry::init();
    match run().await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!(error = %err, "agent-worker exited with a fatal error");
            eprintln!("agent-worker: {err}");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let repo_root = std::env::current_dir().ok();
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let bus_root = resolve_bus_root(cli.bus_root.as_deref(), repo_root.as_deref(), home.as_deref())
        .ok_or_else(|| anyhow::anyhow!("could not resolve a bus root; pass --bus-root explicitly"))?;

    let roster_path = cli
        .roster
        .clone()
        .or_else(|| repo_root.as_ref().map(|r| r.join("roster.json")))
        .ok_or_else(|| anyhow::anyhow!("could not resolve a roster path; pass --roster explicitly"))?;
    let roster = Roster::load(&roster_path)?;

    let store = BusStore::new(&bus_root);
    store.ensure(&roster)?;
    let reconciled = store.reconcile(&roster)?;
    if reconciled > 0 {
        tracing::info!(count = reconciled, "reconciled orphaned in_progress packets on startup");
    }

    if let Some(admin) = cli.admin {
        return run_admin(&store, &roster, admin);
    }

    let agent = cli
        .agent
        .clone()
        .ok_or_else(|| anyhow::anyhow!("--agent is required unless a bus-admin subcommand is given"))?;
    if !roster.contains(&agent) {
        anyhow::bail!("agent `{agent}` is not present in the roster at {}", roster_path.display());
    }

    let poll_interval = Duration::from_millis(cli.poll_ms);

    if agent == ORCHESTRATOR {
        let runtime = OrchestratorRuntime::new(agent, store, roster);
        agent_worker::orchestrator::run_loop(runtime, cli.once, poll_interval).await?;
        return Ok(ExitCode::SUCCESS);
    }

    let config = WorkerConfig::from_env();
    let engine_bin = cli.engine_bin.unwrap_or_else(|| PathBuf::from("codex"));
    let runtime = WorkerRuntime::new(agent, store, roster, config, engine_bin)?;
    match run_loop(runtime, cli.once, poll_interval).await {
        Ok(()) => Ok(ExitCode::SUCCESS),
        Err(WorkerError::GuardrailBlock) => Ok(ExitCode::from(EXIT_GUARDRAIL_BLOCK)),
        Err(other) => Err(other.into()),
    }
}

fn run_admin(store: &BusStore, roster: &Roster, admin: AdminCommand) -> anyhow::Result<ExitCode> {
    match admin {
        AdminCommand::Deliver { to, from, title, kind, id, priority, body } => {
            let body = if body == "-" {
                use std::io::Read;
                let mut buf = String::new();
                std::io::stdin().read_to_string(&mut buf)?;
                buf
            } else {
                body
            };
            run_deliver(store, roster, to, from, title, &kind, id, priority, body)?;
            Ok(ExitCode::SUCCESS)
        }
        AdminCommand::Ps { agent } => {
            for (state, id) in run_ps(store, &agent)? {
                println!("{:<12} {id}", state_label(state));
            }
            Ok(ExitCode::SUCCESS)
        }
        AdminCommand::Cat { agent, id } => {
            print!("{}", run_cat(store, &agent, &id)?);
            Ok(ExitCode::SUCCESS)
        }
        AdminCommand::Tail { agent, id, max_polls, poll_ms } => {
            let sleep_duration = Duration::from_millis(poll_ms);
            let snapshots = collect_tail_snapshots(store, &agent, &id, max_polls, || {
                std::thread::sleep(sleep_duration);
            })?;
            for snapshot in snapshots {
                println!("{snapshot}\n---");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn state_label(state: TaskState) -> &'static str {
    match state {
        TaskState::New => "new",
        TaskState::Seen => "seen",
        TaskState::InProgress => "in_progress",
        TaskState::Processed => "processed",
    }
}
