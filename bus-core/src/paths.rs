//! Bus root resolution and workdir template expansion.

use std::path::{Path, PathBuf};

/// Resolve the bus root directory.
///
/// Order: explicit flag → `VALUA_AGENT_BUS_DIR` env → `<repo_root>/bus` →
/// `<home>/.agentic-cockpit/bus`. The first candidate that already exists
/// wins; otherwise the first candidate whose parent directory exists (so it
/// can be created) wins.
pub fn resolve_bus_root(
    explicit: Option<&Path>,
    repo_root: Option<&Path>,
    home: Option<&Path>,
) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = Vec::new();
    if let Some(p) = explicit {
        candidates.push(p.to_path_buf());
    }
    if let Ok(env) = std::env::var("VALUA_AGENT_BUS_DIR") {
        if !env.is_empty() {
            candidates.push(PathBuf::from(env));
        }
    }
    if let Some(root) = repo_root {
        candidates.push(root.join("bus"));
    }
    if let Some(home) = home {
        candidates.push(home.join(".agentic-cockpit").join("bus"));
    }

    if candidates.is_empty() {
        return None;
    }

    for c in &candidates {
        if c.exists() {
            return Some(c.clone());
        }
    }
    // None exist yet: pick the first candidate whose parent exists (or has
    // no parent, i.e. a root path) so `ensure()` can create it.
    for c in &candidates {
        match c.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                if parent.exists() {
                    return Some(c.clone());
                }
            }
            _ => return Some(c.clone()),
        }
    }
    candidates.into_iter().next()
}

/// Expand `$REPO_ROOT` and `$AGENTIC_WORKTREES_DIR` in a workdir template.
pub fn expand_template(template: &str, repo_root: &Path, worktrees_dir: &Path) -> PathBuf {
    let expanded = template
        .replace("$REPO_ROOT", &repo_root.display().to_string())
        .replace("$AGENTIC_WORKTREES_DIR", &worktrees_dir.display().to_string());
    PathBuf::from(expanded)
}
