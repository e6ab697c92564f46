//! Single-line-JSON frontmatter codec shared by task packets.
//!
//! Format: the first four bytes of a packet are `---\n`; the next `---\n`
//! closes the header. Between them is exactly one JSON object on one
//! logical line. Any deviation is a [`FrontmatterError`].

use crate::task::{TaskMeta, TaskPacket};
use thiserror::Error;

const DELIM: &str = "---";

#[derive(Debug, Error)]
pub enum FrontmatterError {
    #[error("packet does not start with a `---` delimiter")]
    MissingOpenDelimiter,
    #[error("packet is missing the closing `---` delimiter")]
    MissingCloseDelimiter,
    #[error("frontmatter header must be exactly one line of JSON, found {0} lines")]
    MultilineHeader(usize),
    #[error("frontmatter JSON is invalid: {0}")]
    InvalidJson(#[from] serde_json::Error),
}

/// Parse a packet file's full text into a [`TaskPacket`].
pub fn parse(text: &str) -> Result<TaskPacket, FrontmatterError> {
    let mut lines = text.splitn(2, '\n');
    let first = lines.next().unwrap_or("");
    if first.trim_end_matches('\r') != DELIM {
        return Err(FrontmatterError::MissingOpenDelimiter);
    }
    let rest = lines.next().unwrap_or("");

    // Find the closing delimiter line.
    let mut header_lines = Vec::new();
    let mut body_start = None;
    for (idx, line) in rest.split('\n').enumerate() {
        if line.trim_end_matches('\r') == DELIM {
            body_start = Some(idx + 1);
            break;
        }
        header_lines.push(line);
    }
    let body_start = body_start.ok_or(FrontmatterError::MissingCloseDelimiter)?;
    if header_lines.len() != 1 {
        return Err(FrontmatterError::MultilineHeader(header_lines.len()));
    }

    let meta: TaskMeta = serde_json::from_str(header_lines[0])?;
    let body = rest
        .split('\n')
        .skip(body_start)
        .collect::<Vec<_>>()
        .join("\n");
    Ok(TaskPacket { meta, body })
}

/// Serialize a [`TaskPacket`] back to packet text.
pub fn render(packet: &TaskPacket) -> Result<String, FrontmatterError> {
    let header = serde_json::to_string(&packet.meta)?;
    Ok(format!("{DELIM}\n{header}\n{DELIM}\n{}", packet.body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Signals, SignalKind};

    fn sample() -> TaskPacket {
        TaskPacket {
            meta: TaskMeta {
                id: "t1".into(),
                to: vec!["backend".into()],
                from: "operator".into(),
                priority: Default::default(),
                title: "do the thing".into(),
                signals: Signals::new(SignalKind::UserRequest),
                references: Default::default(),
            },
            body: "Please do the thing.\n".into(),
        }
    }

    #[test]
    fn round_trips() {
        let packet = sample();
        let text = render(&packet).unwrap();
        let parsed = parse(&text).unwrap();
        assert_eq!(parsed.meta.id, packet.meta.id);
        assert_eq!(parsed.body, packet.body);
    }

    #[test]
    fn rejects_missing_open_delimiter() {
        let err = parse("hello\n---\n{}\n---\nbody").unwrap_err();
        assert!(matches!(err, FrontmatterError::MissingOpenDelimiter));
    }

    #[test]
    fn rejects_missing_close_delimiter() {
        let err = parse("---\n{}\nno closing delimiter here").unwrap_err();
        assert!(matches!(err, FrontmatterError::MissingCloseDelimiter));
    }

    #[test]
    fn rejects_multiline_header() {
        let err = parse("---\n{}\n{}\n---\nbody").unwrap_err();
        assert!(matches!(err, FrontmatterError::MultilineHeader(2)));
    }

    #[test]
    fn rejects_invalid_json() {
        let err = parse("---\nnot json\n---\nbody").unwrap_err();
        assert!(matches!(err, FrontmatterError::InvalidJson(_)));
    }
}
