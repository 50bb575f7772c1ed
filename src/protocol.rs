//! Wire protocol spoken with the sandbox terminal proxy.
//!
//! Every frame is a single newline-free JSON object tagged by its `type`
//! field. Client frames carry the auth token, keystrokes and resize
//! requests; server frames carry handshake acknowledgements, terminal output
//! and status notifications.
//!
//! Decoding never fails: anything that is not a recognised server frame is
//! handed back as [`Inbound::Raw`] so it can be shown to the user verbatim.

use serde::{Deserialize, Serialize};

/// Client → Server frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First frame after the transport opens.
    Auth { token: String },
    /// Keystrokes typed by the operator.
    Input { data: String },
    /// New terminal geometry.
    Resize { cols: u16, rows: u16 },
}

impl ClientMessage {
    /// Encode this frame as a JSON text frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Server → Client frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    AuthSuccess,
    Connected,
    Output {
        data: String,
    },
    Error {
        #[serde(default)]
        message: String,
    },
    Disconnected,
}

/// Result of decoding one inbound text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Message(ServerMessage),
    /// Payload that did not parse as a server frame; shown as-is.
    Raw(String),
}

/// Decode an inbound text frame, degrading to [`Inbound::Raw`] on any
/// parse failure.
pub fn decode(text: &str) -> Inbound {
    match serde_json::from_str::<ServerMessage>(text) {
        Ok(msg) => Inbound::Message(msg),
        Err(e) => {
            tracing::debug!(error = %e, len = text.len(), "undecodable frame, passing through raw");
            Inbound::Raw(text.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_frame_wire_format() {
        let msg = ClientMessage::Auth {
            token: "tok123".to_string(),
        };
        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({"type": "auth", "token": "tok123"}));
    }

    #[test]
    fn input_frame_wire_format() {
        let msg = ClientMessage::Input {
            data: "ls\n".to_string(),
        };
        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(json, serde_json::json!({"type": "input", "data": "ls\n"}));
    }

    #[test]
    fn resize_frame_wire_format() {
        let msg = ClientMessage::Resize { cols: 120, rows: 40 };
        let json: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "resize", "cols": 120, "rows": 40})
        );
    }

    #[test]
    fn encoded_frames_contain_no_newlines() {
        let msg = ClientMessage::Input {
            data: "line one\nline two\r\n".to_string(),
        };
        let encoded = msg.encode().unwrap();
        assert!(!encoded.contains('\n'));
        assert!(!encoded.contains('\r'));
    }

    #[test]
    fn decode_handshake_frames() {
        assert_eq!(
            decode(r#"{"type":"auth_success"}"#),
            Inbound::Message(ServerMessage::AuthSuccess)
        );
        assert_eq!(
            decode(r#"{"type":"connected"}"#),
            Inbound::Message(ServerMessage::Connected)
        );
        assert_eq!(
            decode(r#"{"type":"disconnected"}"#),
            Inbound::Message(ServerMessage::Disconnected)
        );
    }

    #[test]
    fn decode_output_frame() {
        assert_eq!(
            decode(r#"{"type":"output","data":"$ "}"#),
            Inbound::Message(ServerMessage::Output {
                data: "$ ".to_string()
            })
        );
    }

    #[test]
    fn decode_error_frame_without_message() {
        assert_eq!(
            decode(r#"{"type":"error"}"#),
            Inbound::Message(ServerMessage::Error {
                message: String::new()
            })
        );
    }

    #[test]
    fn decode_ignores_unknown_fields() {
        assert_eq!(
            decode(r#"{"type":"connected","session":"foo","ts":1}"#),
            Inbound::Message(ServerMessage::Connected)
        );
    }

    #[test]
    fn non_json_passes_through_raw() {
        assert_eq!(
            decode("plain text \x1b[31mred\x1b[0m"),
            Inbound::Raw("plain text \x1b[31mred\x1b[0m".to_string())
        );
    }

    #[test]
    fn unknown_type_passes_through_raw() {
        let text = r#"{"type":"telemetry","cpu":3}"#;
        assert_eq!(decode(text), Inbound::Raw(text.to_string()));
    }

    #[test]
    fn wrong_shape_passes_through_raw() {
        // Valid JSON, but not an object.
        assert_eq!(decode("42"), Inbound::Raw("42".to_string()));
        // Output frame missing its data field.
        let text = r#"{"type":"output"}"#;
        assert_eq!(decode(text), Inbound::Raw(text.to_string()));
    }

    #[test]
    fn client_frames_are_not_server_frames() {
        let text = r#"{"type":"auth","token":"x"}"#;
        assert_eq!(decode(text), Inbound::Raw(text.to_string()));
    }
}
