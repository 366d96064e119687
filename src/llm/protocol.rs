//! Newline-delimited JSON stream protocol spoken with a provider CLI
//! child process (§4.6, §6).

use serde::{Deserialize, Serialize};

/// Outbound frame written to the child process's stdin.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    User { content: String, session_id: Option<String> },
}

/// Inbound frame read from the child process's stdout.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    Result {
        content: String,
        cost_usd: Option<f64>,
        duration_ms: Option<u64>,
        session_id: Option<String>,
    },
    /// Anything the CLI emits that isn't a terminal result (progress,
    /// partial tokens); the session reader skips these.
    #[serde(other)]
    Other,
}

pub fn encode(frame: &OutboundFrame) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(frame)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line(line: &str) -> Option<InboundFrame> {
    serde_json::from_str(line.trim()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_frame_round_trips() {
        let raw = r#"{"type":"result","content":"done","cost_usd":0.02,"duration_ms":150,"session_id":"s1"}"#;
        match decode_line(raw).unwrap() {
            InboundFrame::Result { content, cost_usd, .. } => {
                assert_eq!(content, "done");
                assert_eq!(cost_usd, Some(0.02));
            }
            InboundFrame::Other => panic!("expected Result frame"),
        }
    }

    #[test]
    fn unknown_frame_types_decode_as_other() {
        let raw = r#"{"type":"progress","tokens":3}"#;
        assert!(matches!(decode_line(raw), Some(InboundFrame::Other)));
    }
}
