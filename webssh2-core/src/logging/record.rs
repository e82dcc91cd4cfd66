use chrono::{DateTime, Utc};
use serde::Serialize;
use webssh2_common::LogLevel;

use super::LogError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogProtocol {
    Ssh,
    Sftp,
    Scp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSubsystem {
    Shell,
    Sftp,
    Scp,
    Exec,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Success,
    Failure,
}

/// Contextual fields of a structured record. Every field is optional;
/// present values must pass [`LogContext::validate`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LogContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<LogProtocol>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subsystem: Option<LogSubsystem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<LogStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_out: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audit_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retention_tag: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
}

const MAX_ID_LEN: usize = 128;
const MAX_TEXT_LEN: usize = 1024;

fn check_id(field: &'static str, value: &Option<String>) -> Result<(), LogError> {
    if let Some(value) = value {
        if value.is_empty() || value.len() > MAX_ID_LEN {
            return Err(LogError::InvalidContext {
                field,
                reason: format!("length {} outside [1, {MAX_ID_LEN}]", value.len()),
            });
        }
        if value.chars().any(char::is_control) {
            return Err(LogError::InvalidContext {
                field,
                reason: "contains control characters".into(),
            });
        }
    }
    Ok(())
}

fn check_text(field: &'static str, value: &Option<String>, max: usize) -> Result<(), LogError> {
    if let Some(value) = value {
        if value.len() > max {
            return Err(LogError::InvalidContext {
                field,
                reason: format!("longer than {max} characters"),
            });
        }
    }
    Ok(())
}

fn check_port(field: &'static str, value: Option<u16>) -> Result<(), LogError> {
    if value == Some(0) {
        return Err(LogError::InvalidContext {
            field,
            reason: "port 0 is not addressable".into(),
        });
    }
    Ok(())
}

impl LogContext {
    pub fn validate(&self) -> Result<(), LogError> {
        check_id("session_id", &self.session_id)?;
        check_id("request_id", &self.request_id)?;
        check_id("connection_id", &self.connection_id)?;
        check_id("audit_id", &self.audit_id)?;
        check_id("retention_tag", &self.retention_tag)?;
        check_text("username", &self.username, 256)?;
        check_text("user_agent", &self.user_agent, MAX_TEXT_LEN)?;
        check_text("reason", &self.reason, MAX_TEXT_LEN)?;
        check_text("target_host", &self.target_host, 253)?;
        check_port("client_port", self.client_port)?;
        check_port("target_port", self.target_port)?;

        if let Some(ip) = &self.client_ip {
            if ip.parse::<std::net::IpAddr>().is_err() {
                return Err(LogError::InvalidContext {
                    field: "client_ip",
                    reason: format!("not an IP address: {ip}"),
                });
            }
        }
        if let Some(code) = &self.error_code {
            if code.is_empty()
                || code.len() > 64
                || !code
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            {
                return Err(LogError::InvalidContext {
                    field: "error_code",
                    reason: "must match [a-z0-9_]{1,64}".into(),
                });
            }
        }
        Ok(())
    }
}

/// One structured log entry, as accepted by the pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct LogRecord {
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(flatten)]
    pub context: LogContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_details: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

impl LogRecord {
    pub fn new(level: LogLevel, event: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            level,
            event: event.into(),
            message: None,
            context: LogContext::default(),
            details: None,
            error_details: None,
            extra: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn to_json(&self) -> Result<String, LogError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_context_passes() {
        let context = LogContext {
            session_id: Some("abc-123".into()),
            client_ip: Some("10.0.0.1".into()),
            client_port: Some(51234),
            status: Some(LogStatus::Success),
            ..Default::default()
        };
        assert!(context.validate().is_ok());
    }

    #[test]
    fn test_invalid_ip_names_field() {
        let context = LogContext {
            client_ip: Some("not-an-ip".into()),
            ..Default::default()
        };
        let err = context.validate().unwrap_err();
        match err {
            LogError::InvalidContext { field, .. } => assert_eq!(field, "client_ip"),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_error_code_charset() {
        let mut context = LogContext::default();
        context.error_code = Some("auth_method_disabled".into());
        assert!(context.validate().is_ok());
        context.error_code = Some("Not Valid!".into());
        assert!(matches!(
            context.validate(),
            Err(LogError::InvalidContext {
                field: "error_code",
                ..
            })
        ));
    }

    #[test]
    fn test_control_chars_rejected() {
        let context = LogContext {
            session_id: Some("abc\n123".into()),
            ..Default::default()
        };
        assert!(context.validate().is_err());
    }

    #[test]
    fn test_json_shape() {
        let mut record = LogRecord::new(LogLevel::Info, "session_start").with_message("hello");
        record.context.username = Some("alice".into());
        let json = record.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["level"], "info");
        assert_eq!(value["event"], "session_start");
        assert_eq!(value["username"], "alice");
        assert!(value.get("client_ip").is_none());
    }
}
