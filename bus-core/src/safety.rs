//! Suspicious-content scanning for delivered/updated packet bodies.
//!
//! Grounded on the teacher's instinct (`shell_safety`-style destructive
//! command detection) applied here to the bus's own "is this body trying to
//! smuggle a destructive command to an agent" concern rather than to a
//! sandboxed tool call.

use regex::RegexSet;

/// What to do when suspicious content is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Record the hit but let delivery proceed.
    Warn,
    /// Refuse delivery entirely.
    Block,
}

/// A single matched pattern, for logging/receipt purposes.
#[derive(Debug, Clone)]
pub struct SuspiciousHit {
    pub pattern: String,
    pub excerpt: String,
}

#[derive(Debug, Clone)]
pub struct SuspiciousContentScanner {
    set: RegexSet,
    patterns: Vec<String>,
}

impl SuspiciousContentScanner {
    pub fn new() -> Self {
        let patterns = vec![
            r"rm\s+-rf\s+/(\s|$)".to_string(),
            r"rm\s+-rf\s+~".to_string(),
            r"mkfs\.",
            r":\(\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:".to_string(),
            r"curl[^\n]*\|\s*(sh|bash)\b".to_string(),
            r"wget[^\n]*\|\s*(sh|bash)\b".to_string(),
            r">\s*/dev/sd[a-z]".to_string(),
            r"dd\s+if=.*of=/dev/".to_string(),
        ]
        .into_iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>();
        let set = RegexSet::new(&patterns).expect("suspicious-content patterns must compile");
        Self { set, patterns }
    }

    pub fn scan(&self, body: &str) -> Vec<SuspiciousHit> {
        self.set
            .matches(body)
            .into_iter()
            .map(|idx| SuspiciousHit {
                pattern: self.patterns[idx].clone(),
                excerpt: excerpt_around(body, &self.patterns[idx]),
            })
            .collect()
    }
}

impl Default for SuspiciousContentScanner {
    fn default() -> Self {
        Self::new()
    }
}

fn excerpt_around(body: &str, pattern: &str) -> String {
    if let Ok(re) = regex::Regex::new(pattern) {
        if let Some(m) = re.find(body) {
            let start = m.start().saturating_sub(20);
            let end = (m.end() + 20).min(body.len());
            return body[start..end].to_string();
        }
    }
    String::new()
}
