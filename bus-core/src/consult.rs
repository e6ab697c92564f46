//! Consult barrier packet shapes and schema validation (spec §4.2/§6): the
//! `OPUS_CONSULT_REQUEST`/`OPUS_CONSULT_RESPONSE` payloads carried in
//! `references.opus`, and the rules a response must satisfy before it can
//! be forwarded to an autopilot inbox.

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsultMode {
    PreExec,
    PostReview,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsultVerdict {
    Pass,
    Warn,
    Block,
}

/// `references.opus` payload on an `OPUS_CONSULT_REQUEST` packet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsultRequest {
    pub version: String,
    pub consult_id: String,
    pub round: u32,
    pub max_rounds: u32,
    pub mode: ConsultMode,
    pub autopilot_hypothesis: String,
    pub task_context: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prior_round_summary: Option<String>,
    pub questions: Vec<String>,
}

/// `references.opus` payload on the matching `OPUS_CONSULT_RESPONSE`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsultResponse {
    pub version: String,
    pub consult_id: String,
    pub round: u32,
    pub r#final: bool,
    pub verdict: ConsultVerdict,
    pub rationale: String,
    #[serde(default)]
    pub suggested_plan: Vec<String>,
    #[serde(default)]
    pub required_questions: Vec<String>,
    #[serde(default)]
    pub required_actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_prompt_patch: Option<String>,
    #[serde(default)]
    pub unresolved_critical_questions: Vec<String>,
    pub reason_code: String,
}

pub const REASON_CODE_ITERATE: &str = "opus_consult_iterate";
pub const REASON_CODE_PASS: &str = "opus_consult_pass";
pub const REASON_CODE_BLOCK: &str = "opus_consult_block";
pub const REASON_CODE_WARN: &str = "opus_consult_warn";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConsultSchemaError {
    #[error("verdict=block requires final=true")]
    BlockRequiresFinal,
    #[error("verdict=block requires a non-empty required_actions list")]
    BlockRequiresActions,
    #[error("reasonCode={REASON_CODE_ITERATE} requires final=false")]
    IterateRequiresNonFinal,
    #[error("reasonCode={REASON_CODE_ITERATE} requires at least one required or unresolved question")]
    IterateRequiresOpenQuestion,
    #[error("final=false requires reasonCode={REASON_CODE_ITERATE}")]
    NonFinalRequiresIterateReason,
}

/// Validate the cross-field schema rules from spec §6. A response that
/// fails this check must never be forwarded to an autopilot inbox.
pub fn validate_consult_response(response: &ConsultResponse) -> Result<(), ConsultSchemaError> {
    if response.verdict == ConsultVerdict::Block {
        if !response.r#final {
            return Err(ConsultSchemaError::BlockRequiresFinal);
        }
        if response.required_actions.is_empty() {
            return Err(ConsultSchemaError::BlockRequiresActions);
        }
    }

    if response.reason_code == REASON_CODE_ITERATE {
        if response.r#final {
            return Err(ConsultSchemaError::IterateRequiresNonFinal);
        }
        if response.required_questions.is_empty() && response.unresolved_critical_questions.is_empty() {
            return Err(ConsultSchemaError::IterateRequiresOpenQuestion);
        }
    }

    if !response.r#final && response.reason_code != REASON_CODE_ITERATE {
        return Err(ConsultSchemaError::NonFinalRequiresIterateReason);
    }

    Ok(())
}
