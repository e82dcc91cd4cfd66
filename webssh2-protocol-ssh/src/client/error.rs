use std::error::Error;

use webssh2_common::validation::sanitize_hostname;
use webssh2_common::Webssh2Error;

#[derive(thiserror::Error, Debug)]
pub enum SshClientError {
    #[error("mpsc error")]
    MpscError,
    #[error("russh error: {0}")]
    Russh(#[from] russh::Error),
    #[error("sftp error: {0}")]
    Sftp(#[from] russh_sftp::client::error::Error),
    #[error(transparent)]
    Webssh2(#[from] Webssh2Error),
    #[error(transparent)]
    Other(Box<dyn Error + Send + Sync>),
}

impl SshClientError {
    pub fn other<E: Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Other(Box::new(err))
    }
}

/// Errors raised while establishing the upstream connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("could not resolve address for {host}")]
    Resolve { host: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Ssh(#[from] russh::Error),

    #[error(transparent)]
    Key(#[from] russh::keys::Error),

    #[error("host key mismatch")]
    HostKeyMismatch {
        algorithm: String,
        received_key: String,
        known_key: String,
    },

    #[error("host key rejected")]
    HostKeyRejected,

    #[error("handshake timed out")]
    Timeout,

    #[error("authentication failed")]
    Authentication,

    #[error("aborted")]
    Aborted,

    #[error("internal error")]
    Internal,
}

/// The four client-facing classes of upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    Network,
    Timeout,
    Auth,
    Unknown,
}

impl ConnectionErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionErrorKind::Network => "network",
            ConnectionErrorKind::Timeout => "timeout",
            ConnectionErrorKind::Auth => "auth",
            ConnectionErrorKind::Unknown => "unknown",
        }
    }
}

/// A connection error normalized for the client: classified kind, a
/// human-readable message, and the numeric-style code when one applies.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifiedError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub code: Option<&'static str>,
}

fn dns_enhanced_message(host: &str) -> String {
    let host = sanitize_hostname(host);
    format!(
        "DNS resolution failed for '{host}'. If the gateway runs inside Docker, \
         the container may be using Docker's internal DNS - verify the hostname \
         resolves from inside the container."
    )
}

/// Normalizes and classifies an upstream error. The message falls back
/// through code and error name when nothing better is available, per the
/// adapter's surfacing rules.
pub fn classify(error: &ConnectionError) -> ClassifiedError {
    match error {
        ConnectionError::Resolve { host } => ClassifiedError {
            kind: ConnectionErrorKind::Network,
            message: dns_enhanced_message(host),
            code: Some("ENOTFOUND"),
        },
        ConnectionError::Io(io) => classify_io(io),
        ConnectionError::Timeout => ClassifiedError {
            kind: ConnectionErrorKind::Timeout,
            message: "SSH handshake timed out".into(),
            code: Some("ETIMEDOUT"),
        },
        ConnectionError::Authentication => ClassifiedError {
            kind: ConnectionErrorKind::Auth,
            message: "SSH authentication failed".into(),
            code: None,
        },
        ConnectionError::HostKeyMismatch { algorithm, .. } => ClassifiedError {
            kind: ConnectionErrorKind::Auth,
            message: format!("Host key verification failed: {algorithm} key changed"),
            code: Some("HOST_KEY_MISMATCH"),
        },
        ConnectionError::HostKeyRejected => ClassifiedError {
            kind: ConnectionErrorKind::Auth,
            message: "Host key rejected".into(),
            code: Some("HOST_KEY_REJECTED"),
        },
        ConnectionError::Ssh(inner) => classify_by_message(&normalize_message(inner)),
        ConnectionError::Key(inner) => ClassifiedError {
            kind: ConnectionErrorKind::Auth,
            message: normalize_message(inner),
            code: None,
        },
        ConnectionError::Aborted => ClassifiedError {
            kind: ConnectionErrorKind::Unknown,
            message: "Connection aborted".into(),
            code: None,
        },
        ConnectionError::Internal => ClassifiedError {
            kind: ConnectionErrorKind::Unknown,
            message: "Internal error".into(),
            code: None,
        },
    }
}

fn classify_io(io: &std::io::Error) -> ClassifiedError {
    use std::io::ErrorKind;
    let (kind, code) = match io.kind() {
        ErrorKind::ConnectionRefused => (ConnectionErrorKind::Network, Some("ECONNREFUSED")),
        ErrorKind::TimedOut => (ConnectionErrorKind::Timeout, Some("ETIMEDOUT")),
        ErrorKind::ConnectionReset => (ConnectionErrorKind::Timeout, Some("ECONNRESET")),
        ErrorKind::NotFound => (ConnectionErrorKind::Network, Some("ENOTFOUND")),
        _ => {
            let message = io.to_string().to_lowercase();
            if message.contains("unreachable") {
                (ConnectionErrorKind::Network, Some("ENETUNREACH"))
            } else if message.contains("timed out") || message.contains("etimedout") {
                (ConnectionErrorKind::Timeout, Some("ETIMEDOUT"))
            } else {
                (ConnectionErrorKind::Unknown, None)
            }
        }
    };
    ClassifiedError {
        kind,
        message: normalize_message(io),
        code,
    }
}

fn classify_by_message(message: &str) -> ClassifiedError {
    let lower = message.to_lowercase();
    let kind = if lower.contains("enotfound")
        || lower.contains("econnrefused")
        || lower.contains("unreachable")
    {
        ConnectionErrorKind::Network
    } else if lower.contains("timeout") || lower.contains("etimedout") || lower.contains("reset") {
        ConnectionErrorKind::Timeout
    } else if lower.contains("auth") {
        ConnectionErrorKind::Auth
    } else {
        ConnectionErrorKind::Unknown
    };
    ClassifiedError {
        kind,
        message: message.to_string(),
        code: None,
    }
}

/// Message normalization: a display message if there is one, else the
/// debug rendering (the "error name").
fn normalize_message<E: std::fmt::Display + std::fmt::Debug>(error: &E) -> String {
    let message = error.to_string();
    if message.trim().is_empty() {
        format!("{error:?}")
    } else {
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns_failure_enhanced() {
        let error = ConnectionError::Resolve {
            host: "bad.example".into(),
        };
        let classified = classify(&error);
        assert_eq!(classified.kind, ConnectionErrorKind::Network);
        assert_eq!(classified.code, Some("ENOTFOUND"));
        assert!(classified
            .message
            .contains("DNS resolution failed for 'bad.example'"));
        assert!(classified.message.contains("Docker"));
    }

    #[test]
    fn test_dns_hostname_sanitized() {
        let error = ConnectionError::Resolve {
            host: "bad.example;rm -rf /".into(),
        };
        let classified = classify(&error);
        assert!(classified.message.contains("'bad.examplerm-rf'"));
        assert!(!classified.message.contains(';'));
    }

    #[test]
    fn test_refused_is_network() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused");
        let classified = classify(&ConnectionError::Io(io));
        assert_eq!(classified.kind, ConnectionErrorKind::Network);
        assert_eq!(classified.code, Some("ECONNREFUSED"));
    }

    #[test]
    fn test_reset_and_timeout_are_timeout() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
        assert_eq!(
            classify(&ConnectionError::Io(io)).kind,
            ConnectionErrorKind::Timeout
        );
        assert_eq!(
            classify(&ConnectionError::Timeout).kind,
            ConnectionErrorKind::Timeout
        );
    }

    #[test]
    fn test_auth_rejection() {
        let classified = classify(&ConnectionError::Authentication);
        assert_eq!(classified.kind, ConnectionErrorKind::Auth);
    }

    #[test]
    fn test_message_fallbacks() {
        let classified = classify_by_message("Connection reset by peer");
        assert_eq!(classified.kind, ConnectionErrorKind::Timeout);
        let classified = classify_by_message("some unclassifiable thing");
        assert_eq!(classified.kind, ConnectionErrorKind::Unknown);
        let classified = classify_by_message("host unreachable via gateway");
        assert_eq!(classified.kind, ConnectionErrorKind::Network);
    }
}
