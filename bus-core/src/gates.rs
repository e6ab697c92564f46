//! Gate-chain primitives (C7): the shared trait and bookkeeping types the
//! ordered, short-circuit-on-block chain is built from. Concrete gates
//! (git preflight, consult barrier, review, code-quality, skill-evidence,
//! observer-drain) shell out to git/gh or inspect process state, so they
//! live in `agent-worker`; this crate only defines the contract they
//! implement and the record format they write into a receipt.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What a gate decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome {
    Pass,
    Warn,
    Blocked,
    Skipped,
}

/// The `{required, executed, status, reasonCode, errors[]}` shape recorded
/// under `receiptExtra.runtimeGuard.<gateName>` for every gate in the
/// chain, run or not.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateRecord {
    pub required: bool,
    pub executed: bool,
    pub status: GateOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
    #[serde(default)]
    pub errors: Vec<String>,
}

impl GateRecord {
    pub fn skipped(required: bool) -> Self {
        Self {
            required,
            executed: false,
            status: GateOutcome::Skipped,
            reason_code: None,
            errors: Vec::new(),
        }
    }

    pub fn pass(required: bool) -> Self {
        Self {
            required,
            executed: true,
            status: GateOutcome::Pass,
            reason_code: None,
            errors: Vec::new(),
        }
    }

    pub fn warn(required: bool, reason_code: impl Into<String>) -> Self {
        Self {
            required,
            executed: true,
            status: GateOutcome::Warn,
            reason_code: Some(reason_code.into()),
            errors: Vec::new(),
        }
    }

    pub fn blocked(required: bool, reason_code: impl Into<String>, errors: Vec<String>) -> Self {
        Self {
            required,
            executed: true,
            status: GateOutcome::Blocked,
            reason_code: Some(reason_code.into()),
            errors,
        }
    }

    pub fn is_block(&self) -> bool {
        self.status == GateOutcome::Blocked
    }
}

/// Accumulates every gate's record in chain order, for serialization into
/// `receiptExtra.runtimeGuard`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeGuard {
    #[serde(flatten)]
    pub gates: BTreeMap<String, GateRecord>,
}

impl RuntimeGuard {
    pub fn record(&mut self, gate_name: impl Into<String>, record: GateRecord) {
        self.gates.insert(gate_name.into(), record);
    }

    pub fn any_blocked(&self) -> Option<(&str, &GateRecord)> {
        self.gates
            .iter()
            .find(|(_, r)| r.is_block())
            .map(|(name, r)| (name.as_str(), r))
    }
}

/// Information a gate needs to make its decision. Carries the task-scoped
/// data every gate in the chain might consult; concrete gate
/// implementations in `agent-worker` additionally hold the process/bus
/// handles (git workdir, `BusStore`, consult timeouts) they need, set at
/// chain-construction time rather than threaded through this struct.
#[derive(Debug, Clone)]
pub struct GateContext {
    pub agent: String,
    pub task_id: String,
    pub root_id: Option<String>,
    pub signal_kind: String,
    pub commit_sha: Option<String>,
    pub workdir: std::path::PathBuf,
    pub git: Option<crate::task::GitReferences>,
}

/// A single step in the ordered gate chain.
pub trait Gate {
    /// Stable name used as the key under `receiptExtra.runtimeGuard`.
    fn name(&self) -> &'static str;

    /// Whether this gate applies at all to `ctx` (e.g. git preflight only
    /// applies to EXECUTE-kind tasks). A gate that doesn't apply records
    /// `GateRecord::skipped`.
    fn applies(&self, ctx: &GateContext) -> bool;

    fn run(&self, ctx: &GateContext) -> GateRecord;
}

/// Run an ordered chain of gates, short-circuiting on the first block.
/// Returns the accumulated `RuntimeGuard` and, if present, the reason code
/// of the gate that blocked.
pub fn run_chain(gates: &[Box<dyn Gate>], ctx: &GateContext) -> (RuntimeGuard, Option<String>) {
    let mut guard = RuntimeGuard::default();
    for gate in gates {
        if !gate.applies(ctx) {
            guard.record(gate.name(), GateRecord::skipped(false));
            continue;
        }
        let record = gate.run(ctx);
        let blocked = record.is_block();
        let reason = record.reason_code.clone();
        guard.record(gate.name(), record);
        if blocked {
            return (guard, reason);
        }
    }
    (guard, None)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct AlwaysPass;
    impl Gate for AlwaysPass {
        fn name(&self) -> &'static str {
            "always_pass"
        }
        fn applies(&self, _ctx: &GateContext) -> bool {
            true
        }
        fn run(&self, _ctx: &GateContext) -> GateRecord {
            GateRecord::pass(true)
        }
    }

    struct AlwaysBlock;
    impl Gate for AlwaysBlock {
        fn name(&self) -> &'static str {
            "always_block"
        }
        fn applies(&self, _ctx: &GateContext) -> bool {
            true
        }
        fn run(&self, _ctx: &GateContext) -> GateRecord {
            GateRecord::blocked(true, "forced_block", vec!["nope".into()])
        }
    }

    struct NeverReached;
    impl Gate for NeverReached {
        fn name(&self) -> &'static str {
            "never_reached"
        }
        fn applies(&self, _ctx: &GateContext) -> bool {
            panic!("should short-circuit before this gate is asked whether it applies");
        }
        fn run(&self, _ctx: &GateContext) -> GateRecord {
            unreachable!()
        }
    }

    fn ctx() -> GateContext {
        GateContext {
            agent: "backend".into(),
            task_id: "t1".into(),
            root_id: Some("r1".into()),
            signal_kind: "EXECUTE".into(),
            commit_sha: None,
            workdir: std::path::PathBuf::from("."),
            git: None,
        }
    }

    #[test]
    fn chain_short_circuits_on_block() {
        let gates: Vec<Box<dyn Gate>> = vec![Box::new(AlwaysPass), Box::new(AlwaysBlock), Box::new(NeverReached)];
        let (guard, reason) = run_chain(&gates, &ctx());
        assert_eq!(reason.as_deref(), Some("forced_block"));
        assert!(guard.any_blocked().is_some());
        assert_eq!(guard.gates.len(), 2);
    }

    #[test]
    fn chain_records_full_pass() {
        let gates: Vec<Box<dyn Gate>> = vec![Box::new(AlwaysPass), Box::new(AlwaysPass)];
        let (guard, reason) = run_chain(&gates, &ctx());
        assert!(reason.is_none());
        assert!(guard.any_blocked().is_none());
    }
}
