//! The `v1/socket` wire protocol: JSON text frames shaped as
//! `{"event": <name>, "payload": <body>}` in both directions.
//!
//! Inbound frames are parsed in two steps - envelope first, then the
//! per-event payload schema - so an unknown event can be skipped without
//! tearing the session down, while a malformed payload for a known event
//! surfaces as a validation error.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use webssh2_common::Webssh2Error;

#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    payload: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatePayload {
    pub host: Option<String>,
    pub port: Option<Value>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub passphrase: Option<String>,
    pub term: Option<String>,
    pub cols: Option<Value>,
    pub rows: Option<Value>,
    #[serde(default)]
    pub keyboard_interactive: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyboardInteractiveResponsePayload {
    pub responses: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminalPayload {
    pub term: Option<String>,
    pub rows: Option<Value>,
    pub cols: Option<Value>,
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResizePayload {
    pub rows: Value,
    pub cols: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecPayload {
    pub command: String,
    #[serde(default)]
    pub pty: bool,
    pub term: Option<String>,
    pub cols: Option<Value>,
    pub rows: Option<Value>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResponsePayload {
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub inputs: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpPathPayload {
    pub path: String,
    /// Transfer ids are server-generated; clients must not supply one.
    pub transfer_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpUploadStartPayload {
    pub remote_path: String,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: Option<String>,
    #[serde(default)]
    pub overwrite: bool,
    pub transfer_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpUploadChunkPayload {
    pub transfer_id: Uuid,
    pub seq: u64,
    /// Base64-encoded bytes.
    pub data: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpTransferIdPayload {
    pub transfer_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpDownloadStartPayload {
    pub remote_path: String,
    pub transfer_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum ClientMessage {
    Data(String),
    Resize(ResizePayload),
    Terminal(TerminalPayload),
    Control(String),
    Authenticate(AuthenticatePayload),
    KeyboardInteractiveResponse(KeyboardInteractiveResponsePayload),
    Exec(ExecPayload),
    PromptResponse(PromptResponsePayload),
    SftpList(SftpPathPayload),
    SftpStat(SftpPathPayload),
    SftpMkdir(SftpPathPayload),
    SftpDelete(SftpPathPayload),
    SftpUploadStart(SftpUploadStartPayload),
    SftpUploadChunk(SftpUploadChunkPayload),
    SftpUploadCancel(SftpTransferIdPayload),
    SftpDownloadStart(SftpDownloadStartPayload),
    SftpDownloadCancel(SftpTransferIdPayload),
}

#[derive(Debug, Clone)]
pub enum ParsedMessage {
    Known(ClientMessage),
    /// Event name outside the protocol; skipped, never fatal.
    Unknown(String),
}

fn payload<T: serde::de::DeserializeOwned>(event: &str, value: Value) -> Result<T, Webssh2Error> {
    serde_json::from_value(value)
        .map_err(|e| Webssh2Error::Validation(format!("malformed `{event}` payload: {e}")))
}

pub fn parse_client_message(text: &str) -> Result<ParsedMessage, Webssh2Error> {
    let envelope: Envelope = serde_json::from_str(text)
        .map_err(|e| Webssh2Error::Validation(format!("malformed message frame: {e}")))?;
    let event = envelope.event.as_str();
    let body = envelope.payload;

    let message = match event {
        "data" => ClientMessage::Data(payload(event, body)?),
        "resize" => ClientMessage::Resize(payload(event, body)?),
        "terminal" => ClientMessage::Terminal(payload(event, body)?),
        "control" => ClientMessage::Control(payload(event, body)?),
        "authenticate" => ClientMessage::Authenticate(payload(event, body)?),
        "authentication:keyboard-interactive" => {
            ClientMessage::KeyboardInteractiveResponse(payload(event, body)?)
        }
        "exec" => ClientMessage::Exec(payload(event, body)?),
        "prompt-response" => ClientMessage::PromptResponse(payload(event, body)?),
        "sftp-list" => ClientMessage::SftpList(payload(event, body)?),
        "sftp-stat" => ClientMessage::SftpStat(payload(event, body)?),
        "sftp-mkdir" => ClientMessage::SftpMkdir(payload(event, body)?),
        "sftp-delete" => ClientMessage::SftpDelete(payload(event, body)?),
        "sftp-upload-start" => ClientMessage::SftpUploadStart(payload(event, body)?),
        "sftp-upload-chunk" => ClientMessage::SftpUploadChunk(payload(event, body)?),
        "sftp-upload-cancel" => ClientMessage::SftpUploadCancel(payload(event, body)?),
        "sftp-download-start" => ClientMessage::SftpDownloadStart(payload(event, body)?),
        "sftp-download-cancel" => ClientMessage::SftpDownloadCancel(payload(event, body)?),
        _ => return Ok(ParsedMessage::Unknown(envelope.event)),
    };
    Ok(ParsedMessage::Known(message))
}

pub const CONTROL_ACTIONS: &[&str] = &[
    "reauth",
    "replayCredentials",
    "clear-credentials",
    "disconnect",
];

#[derive(Debug, Clone, Serialize)]
pub struct KiPromptPayload {
    pub prompt: String,
    pub echo: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "action")]
pub enum AuthenticationPayload {
    #[serde(rename = "request_auth")]
    RequestAuth,
    #[serde(rename = "auth_result")]
    AuthResult {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    #[serde(rename = "keyboard-interactive")]
    KeyboardInteractive {
        name: String,
        instructions: String,
        prompts: Vec<KiPromptPayload>,
    },
    #[serde(rename = "reauth")]
    Reauth,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionsPayload {
    pub allow_replay: bool,
    pub allow_reconnect: bool,
    pub allow_reauth: bool,
    pub auto_log: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptInput {
    pub label: String,
    pub echo: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptPayload {
    pub id: String,
    pub severity: String,
    pub title: String,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<PromptInput>,
    pub actions: Vec<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionErrorPayload {
    pub message: String,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpDirectoryPayload {
    pub path: String,
    pub entries: Value,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpOperationResultPayload {
    pub operation: String,
    pub path: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpProgressPayload {
    pub transfer_id: Uuid,
    pub bytes: u64,
    pub total: u64,
}

/// Server → client frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "payload")]
pub enum ServerMessage {
    #[serde(rename = "data")]
    Data(String),
    #[serde(rename = "authentication")]
    Authentication(AuthenticationPayload),
    #[serde(rename = "authFailure")]
    AuthFailure {
        error: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        method: Option<String>,
    },
    #[serde(rename = "permissions")]
    Permissions(PermissionsPayload),
    #[serde(rename = "updateUI")]
    UpdateUi {
        element: String,
        value: String,
    },
    #[serde(rename = "getTerminal")]
    GetTerminal(bool),
    #[serde(rename = "exec-data")]
    ExecData {
        #[serde(rename = "type")]
        stream: String,
        data: String,
    },
    #[serde(rename = "exec-exit")]
    ExecExit {
        code: Option<u32>,
        signal: Option<String>,
    },
    #[serde(rename = "ssherror")]
    SshError(String),
    #[serde(rename = "sftp-status")]
    SftpStatus {
        #[serde(rename = "transferId")]
        transfer_id: Uuid,
        status: String,
    },
    #[serde(rename = "sftp-directory")]
    SftpDirectory(SftpDirectoryPayload),
    #[serde(rename = "sftp-stat-result")]
    SftpStatResult(Value),
    #[serde(rename = "sftp-operation-result")]
    SftpOperationResult(SftpOperationResultPayload),
    #[serde(rename = "sftp-upload-ready")]
    SftpUploadReady {
        #[serde(rename = "transferId")]
        transfer_id: Uuid,
        #[serde(rename = "chunkSize")]
        chunk_size: usize,
    },
    #[serde(rename = "sftp-upload-ack")]
    SftpUploadAck {
        #[serde(rename = "transferId")]
        transfer_id: Uuid,
        seq: u64,
    },
    #[serde(rename = "sftp-download-ready")]
    SftpDownloadReady {
        #[serde(rename = "transferId")]
        transfer_id: Uuid,
        size: u64,
        #[serde(rename = "mimeType")]
        mime_type: String,
    },
    #[serde(rename = "sftp-download-chunk")]
    SftpDownloadChunk {
        #[serde(rename = "transferId")]
        transfer_id: Uuid,
        seq: u64,
        data: String,
    },
    #[serde(rename = "sftp-progress")]
    SftpProgress(SftpProgressPayload),
    #[serde(rename = "sftp-complete")]
    SftpComplete {
        #[serde(rename = "transferId")]
        transfer_id: Uuid,
        bytes: u64,
    },
    #[serde(rename = "sftp-error")]
    SftpError {
        #[serde(rename = "transferId", skip_serializing_if = "Option::is_none")]
        transfer_id: Option<Uuid>,
        message: String,
    },
    #[serde(rename = "prompt")]
    Prompt(PromptPayload),
    #[serde(rename = "connection-error")]
    ConnectionError(ConnectionErrorPayload),
}

impl ServerMessage {
    pub fn to_frame(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"event":"ssherror","payload":"internal serialization error"}"#.to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_data_frame() {
        let parsed = parse_client_message(r#"{"event":"data","payload":"ls -la\n"}"#).unwrap();
        match parsed {
            ParsedMessage::Known(ClientMessage::Data(data)) => assert_eq!(data, "ls -la\n"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_event_is_not_an_error() {
        let parsed = parse_client_message(r#"{"event":"made-up","payload":{}}"#).unwrap();
        assert!(matches!(parsed, ParsedMessage::Unknown(name) if name == "made-up"));
    }

    #[test]
    fn test_malformed_frame_is_validation_error() {
        assert!(parse_client_message("not json").is_err());
        // Known event with an unusable payload shape.
        assert!(parse_client_message(r#"{"event":"exec","payload":{"no_command":1}}"#).is_err());
    }

    #[test]
    fn test_resize_payload_keeps_raw_values() {
        let parsed =
            parse_client_message(r#"{"event":"resize","payload":{"rows":"NaN","cols":"oops"}}"#)
                .unwrap();
        match parsed {
            ParsedMessage::Known(ClientMessage::Resize(resize)) => {
                assert_eq!(resize.rows, json!("NaN"));
                assert_eq!(resize.cols, json!("oops"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_authenticate_payload_camel_case() {
        let parsed = parse_client_message(
            r#"{"event":"authenticate","payload":{"host":"h","port":22,"username":"u","privateKey":"k"}}"#,
        )
        .unwrap();
        match parsed {
            ParsedMessage::Known(ClientMessage::Authenticate(auth)) => {
                assert_eq!(auth.private_key.as_deref(), Some("k"));
                assert!(!auth.keyboard_interactive);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_upload_start_rejects_nothing_but_carries_client_transfer_id() {
        let parsed = parse_client_message(
            r#"{"event":"sftp-upload-start","payload":{"remotePath":"/tmp","fileName":"a.txt","fileSize":10,"transferId":"sneaky"}}"#,
        )
        .unwrap();
        match parsed {
            ParsedMessage::Known(ClientMessage::SftpUploadStart(start)) => {
                // The adapter silently drops requests that try to pick
                // their own transfer id; the schema only carries it.
                assert_eq!(start.transfer_id.as_deref(), Some("sneaky"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_server_message_frames() {
        let frame = ServerMessage::Authentication(AuthenticationPayload::AuthResult {
            success: false,
            message: Some("Invalid credentials".into()),
        })
        .to_frame();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], "authentication");
        assert_eq!(value["payload"]["action"], "auth_result");
        assert_eq!(value["payload"]["success"], false);

        let frame = ServerMessage::ExecData {
            stream: "stdout".into(),
            data: "hi\n".into(),
        }
        .to_frame();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], "exec-data");
        assert_eq!(value["payload"]["type"], "stdout");

        let frame = ServerMessage::AuthFailure {
            error: "auth_method_disabled".into(),
            method: Some("password".into()),
        }
        .to_frame();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["event"], "authFailure");
        assert_eq!(value["payload"]["method"], "password");
    }

    #[test]
    fn test_control_actions_catalog() {
        assert!(CONTROL_ACTIONS.contains(&"reauth"));
        assert!(CONTROL_ACTIONS.contains(&"replayCredentials"));
        assert!(!CONTROL_ACTIONS.contains(&"self-destruct"));
    }
}
