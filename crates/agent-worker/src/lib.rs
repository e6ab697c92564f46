//! Per-agent worker process library: the generic engine-driven worker
//! loop (`worker`), the structurally distinct orchestrator loop
//! (`orchestrator`), engine drivers (`engine`), the gate chain
//! (`gates_exec`), and the supporting ambient stack (CLI, telemetry,
//! prompt assembly, engine-home isolation, review-scope resolution,
//! task-update watcher).

pub mod cli;
pub mod engine;
pub mod engine_home;
pub mod gates_exec;
pub mod orchestrator;
pub mod prompt_build;
pub mod review;
pub mod telemetry;
pub mod watcher;
pub mod worker;

pub use engine::{EngineDriver, EngineError, ThreadScope, TurnOpts, TurnResult};
pub use worker::{run_once, run_loop, WorkerError};
