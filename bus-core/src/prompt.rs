//! Prompt assembly as an ordered pipeline of segments (§9 REDESIGN FLAGS):
//! rather than a single formatted string, a turn's prompt is built from
//! named segments so a warm-started turn can elide segments whose content
//! fingerprint is unchanged from the last turn on the same thread.

use std::collections::HashMap;

/// A single named, orderable chunk of prompt text.
#[derive(Debug, Clone)]
pub struct PromptSegment {
    pub name: String,
    pub text: String,
    /// Segments marked `warm_startable` may be elided on a resumed turn
    /// when their fingerprint matches what was last sent on this thread
    /// (e.g. the roster summary, skill index — stable, expensive, and
    /// already in the engine's context from the prior turn).
    pub warm_startable: bool,
}

impl PromptSegment {
    pub fn new(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
            warm_startable: false,
        }
    }

    pub fn warm_startable(mut self) -> Self {
        self.warm_startable = true;
        self
    }

    pub fn fingerprint(&self) -> String {
        blake3::hash(self.text.as_bytes()).to_hex().to_string()
    }
}

/// Tracks the last-sent fingerprint of each warm-startable segment name for
/// one pinned thread, so repeated turns can skip re-sending unchanged
/// context.
#[derive(Debug, Clone, Default)]
pub struct WarmStartState {
    last_fingerprints: HashMap<String, String>,
}

impl WarmStartState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assemble the final prompt text from `segments`, eliding any
    /// warm-startable segment whose fingerprint matches what this thread
    /// was last sent, and recording fingerprints for the next call.
    pub fn render(&mut self, segments: &[PromptSegment]) -> String {
        let mut rendered = Vec::with_capacity(segments.len());
        for segment in segments {
            let fingerprint = segment.fingerprint();
            if segment.warm_startable {
                if self.last_fingerprints.get(&segment.name) == Some(&fingerprint) {
                    self.last_fingerprints.insert(segment.name.clone(), fingerprint);
                    continue;
                }
                self.last_fingerprints.insert(segment.name.clone(), fingerprint);
            }
            rendered.push(segment.text.as_str());
        }
        rendered.join("\n\n")
    }

    pub fn reset(&mut self) {
        self.last_fingerprints.clear();
    }
}
