//! Wires `bus_core::prompt`'s segment/warm-start types to the actual
//! per-task prompt text (spec §4.4): a deterministic identity/lineage
//! header, a skills block that can be elided on warm starts, the task
//! body, and a fixed output-contract footer. Grounded on the teacher's
//! `prompts.rs` section-assembly idiom (`format_task_prompt` builds a
//! prompt out of named `## Section` blocks pushed onto a `String` in a
//! fixed order); this module does the same thing but keeps each section
//! as its own `PromptSegment` instead of flattening straight to text, so
//! the warm-start elision in `WarmStartState::render` has something to
//! elide.

use bus_core::prompt::PromptSegment;
use bus_core::task::TaskPacket;

/// One line item in the "what else is open for this agent right now"
/// digest included in every prompt's lineage section.
pub struct OpenTaskSummary {
    pub id: String,
    pub title: String,
}

/// Assemble the ordered segment list for one turn. `retry_patch` carries
/// the "RETRY REQUIREMENT" text appended after a schema-invalid first
/// attempt (spec §4.6 step 5); `None` on a fresh turn.
pub fn build_segments(
    agent: &str,
    skills: &[(String, String)],
    packet: &TaskPacket,
    open_tasks: &[OpenTaskSummary],
    retry_patch: Option<&str>,
) -> Vec<PromptSegment> {
    let mut segments = Vec::new();

    segments.push(identity_segment(agent));
    segments.push(lineage_segment(packet, open_tasks));
    if !skills.is_empty() {
        segments.push(skills_segment(skills));
    }
    segments.push(task_body_segment(packet));
    if let Some(patch) = retry_patch {
        segments.push(PromptSegment::new("retry_patch", retry_patch_text(patch)));
    }
    segments.push(output_contract_segment());

    segments
}

fn identity_segment(agent: &str) -> PromptSegment {
    PromptSegment::new(
        "identity",
        format!("# Agent: {agent}\n\nYou are the `{agent}` worker on the agent bus. Respond only with the JSON output contract described at the end of this prompt."),
    )
    .warm_startable()
}

fn lineage_segment(packet: &TaskPacket, open_tasks: &[OpenTaskSummary]) -> PromptSegment {
    let mut text = String::new();
    text.push_str(&format!("## Task `{}`\n\n", packet.meta.id));
    text.push_str(&format!("- from: {}\n", packet.meta.from));
    text.push_str(&format!("- kind: {}\n", packet.meta.signals.kind));
    if let Some(root_id) = &packet.meta.signals.root_id {
        text.push_str(&format!("- rootId: {root_id}\n"));
    }
    if let Some(parent_id) = &packet.meta.signals.parent_id {
        text.push_str(&format!("- parentId: {parent_id}\n"));
    }
    if !open_tasks.is_empty() {
        text.push_str("\n## Other open tasks in your inbox\n");
        for open in open_tasks {
            text.push_str(&format!("- `{}`: {}\n", open.id, open.title));
        }
    }
    PromptSegment::new("lineage", text)
}

fn skills_segment(skills: &[(String, String)]) -> PromptSegment {
    let mut text = String::from("## Skills\n\n");
    for (name, body) in skills {
        text.push_str(&format!("### ${name}\n\n{body}\n\n"));
    }
    PromptSegment::new("skills", text).warm_startable()
}

fn task_body_segment(packet: &TaskPacket) -> PromptSegment {
    PromptSegment::new("task_body", format!("## Request\n\n{}", packet.body))
}

fn retry_patch_text(patch: &str) -> String {
    format!(
        "## RETRY REQUIREMENT\n\nYour previous response did not validate against the output contract: {patch}\n\nRespond again with the complete JSON object, every required key present."
    )
}

const OUTPUT_CONTRACT: &str = r#"## Output contract

Respond with exactly one JSON object (no prose, no code fence) containing
every one of these top-level keys: outcome, note, commitSha, planMarkdown,
filesToChange, testsToRun, artifacts, riskNotes, rollbackPlan, followUps,
review, runtimeGuard. Use "", [], or null to fill a key that does not apply;
set runtimeGuard to null always. outcome must be one of done, blocked,
failed, skipped, needs_review."#;

fn output_contract_segment() -> PromptSegment {
    PromptSegment::new("output_contract", OUTPUT_CONTRACT).warm_startable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bus_core::task::{Priority, References, Signals, SignalKind, TaskMeta};

    fn packet() -> TaskPacket {
        TaskPacket {
            meta: TaskMeta {
                id: "t1".into(),
                to: vec!["backend".into()],
                from: "operator".into(),
                priority: Priority::P1,
                title: "do it".into(),
                signals: Signals::new(SignalKind::Execute),
                references: References::default(),
            },
            body: "please implement the thing".into(),
        }
    }

    #[test]
    fn includes_task_body_and_output_contract() {
        let segments = build_segments("backend", &[], &packet(), &[], None);
        let names: Vec<_> = segments.iter().map(|s| s.name.as_str()).collect();
        assert!(names.contains(&"task_body"));
        assert!(names.contains(&"output_contract"));
        assert!(names.contains(&"lineage"));
        assert!(!names.contains(&"skills"));
    }

    #[test]
    fn retry_patch_is_appended_only_when_present() {
        let with_patch = build_segments("backend", &[], &packet(), &[], Some("missing rollbackPlan"));
        assert!(with_patch.iter().any(|s| s.name == "retry_patch"));
        let without_patch = build_segments("backend", &[], &packet(), &[], None);
        assert!(!without_patch.iter().any(|s| s.name == "retry_patch"));
    }

    #[test]
    fn skills_segment_present_when_skills_given() {
        let skills = vec![("debrief".to_string(), "run the debrief checklist".to_string())];
        let segments = build_segments("backend", &skills, &packet(), &[], None);
        assert!(segments.iter().any(|s| s.name == "skills" && s.text.contains("$debrief")));
    }
}
