//! Classification of client frames and shaping of terminal output.
//!
//! A frame from the browser is either the reserved heartbeat byte, a JSON
//! control envelope, or raw terminal data. Classification never mutates the
//! frame before deciding; a malformed or unrecognized envelope downgrades to
//! raw data rather than failing the session.

use serde::Deserialize;
use std::borrow::Cow;

/// Reserved single-byte client heartbeat. Discarded on receipt and never
/// counted as user activity.
pub const HEARTBEAT: &str = "\u{0}";

/// Payloads at or below this size with no embedded newline are written to
/// remote stdin as a single write.
const DIRECT_WRITE_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
struct ControlEnvelope {
    #[serde(rename = "type")]
    kind: String,
    cols: Option<u16>,
    rows: Option<u16>,
}

/// One unit of client input after classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientInput {
    Heartbeat,
    Resize { cols: u16, rows: u16 },
    Data(String),
}

/// Classify a client text frame.
pub fn classify(text: &str) -> ClientInput {
    if text == HEARTBEAT {
        return ClientInput::Heartbeat;
    }
    if let Ok(envelope) = serde_json::from_str::<ControlEnvelope>(text) {
        if envelope.kind == "resize" {
            if let (Some(cols), Some(rows)) = (envelope.cols, envelope.rows) {
                return ClientInput::Resize { cols, rows };
            }
        }
        // Parsed but unrecognized: fall through to raw data.
    }
    ClientInput::Data(text.to_string())
}

/// Rewrite bare `\n` (not already preceded by `\r`) to `\r\n` so the
/// browser terminal renders remote Unix line endings correctly.
pub fn normalize_output(data: &str) -> Cow<'_, str> {
    let needs_fix = data.as_bytes().iter().enumerate().any(|(i, &b)| {
        b == b'\n' && (i == 0 || data.as_bytes()[i - 1] != b'\r')
    });
    if !needs_fix {
        return Cow::Borrowed(data);
    }
    let mut out = String::with_capacity(data.len() + 8);
    let mut prev = '\0';
    for c in data.chars() {
        if c == '\n' && prev != '\r' {
            out.push('\r');
        }
        out.push(c);
        prev = c;
    }
    Cow::Owned(out)
}

/// Stdin write plan for one raw data frame.
///
/// Short single-line input goes through as-is. Long or multi-line input
/// (bulk paste) is split on line boundaries with an explicit newline write
/// between lines and none after the last, which sidesteps remote shells'
/// quirks around large multi-line stdin bursts.
pub fn stdin_writes(data: &str) -> Vec<String> {
    if data.len() <= DIRECT_WRITE_LIMIT && !data.contains('\n') {
        return vec![data.to_string()];
    }
    let lines: Vec<&str> = data.lines().collect();
    let mut writes = Vec::with_capacity(lines.len() * 2);
    for (i, line) in lines.iter().enumerate() {
        writes.push((*line).to_string());
        if i + 1 < lines.len() {
            writes.push("\n".to_string());
        }
    }
    writes
}
