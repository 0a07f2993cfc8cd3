use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// Header that opens every push frame line.
pub const FRAME_PREFIX: &str = "data: ";

/// Frame terminator (the blank line after the payload).
pub const FRAME_TERMINATOR: &str = "\n\n";

/// One event on a push-framed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum StreamEvent {
    Start {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        job_id: Option<JobId>,
    },
    Output {
        data: String,
    },
    Complete {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exit_code: Option<i32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration: Option<f64>,
    },
    Error {
        message: String,
    },
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Complete { .. } | Self::Error { .. })
    }
}

/// Encode an event as `data: <json>\n\n`.
///
/// JSON string escaping guarantees the payload never contains a raw newline,
/// so the blank line is an unambiguous frame boundary.
pub fn encode_frame(event: &StreamEvent) -> String {
    let json = serde_json::to_string(event).unwrap_or_else(|e| {
        serde_json::json!({"type": "error", "message": format!("Failed to encode event: {}", e)})
            .to_string()
    });
    format!("{}{}{}", FRAME_PREFIX, json, FRAME_TERMINATOR)
}
