use std::error::Error;

use poem::error::ResponseError;

use crate::auth::AuthMethod;

/// Error taxonomy shared across the gateway. Every variant maps to one of
/// the [`ErrorKind`] classes that decide how an error surfaces to the
/// client (see the socket adapter) and which HTTP status it produces.
#[derive(thiserror::Error, Debug)]
pub enum Webssh2Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("authentication failed: {reason}")]
    Auth {
        reason: String,
        method: Option<AuthMethod>,
    },

    #[error("auth method disabled: {0}")]
    AuthMethodDisabled(AuthMethod),

    #[error("authentication already in progress")]
    AuthInProgress,

    #[error("network error: {0}")]
    Network(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("log transport backpressure: queue full at {0} entries")]
    TransportBackpressure(usize),

    #[error("database error: {0}")]
    Database(String),

    #[error("session not found")]
    SessionNotFound,

    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),

    #[error("deserialization failed: {0}")]
    DeserializeJson(#[from] serde_json::Error),

    #[error(transparent)]
    Other(Box<dyn Error + Send + Sync>),
}

/// Coarse classification used for surfacing decisions (§ error handling):
/// which outbound event carries the error and whether the socket survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Validation,
    Auth,
    Network,
    Timeout,
    Ssh,
    Transport,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Config => "config",
            ErrorKind::Validation => "validation",
            ErrorKind::Auth => "auth",
            ErrorKind::Network => "network",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Ssh => "ssh",
            ErrorKind::Transport => "transport",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl Webssh2Error {
    pub fn other<E: Error + Send + Sync + 'static>(err: E) -> Self {
        Self::Other(Box::new(err))
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) => ErrorKind::Config,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Auth { .. } | Self::AuthMethodDisabled(_) | Self::AuthInProgress => {
                ErrorKind::Auth
            }
            Self::Network(_) => ErrorKind::Network,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Ssh(_) => ErrorKind::Ssh,
            Self::TransportBackpressure(_) => ErrorKind::Transport,
            Self::Database(_) | Self::SessionNotFound => ErrorKind::Unknown,
            Self::Io(_) => ErrorKind::Network,
            Self::DeserializeJson(_) => ErrorKind::Validation,
            Self::Other(_) => ErrorKind::Unknown,
        }
    }

    /// Stable machine-readable code for errors that have one. Errors
    /// without a code render as a generic message over HTTP.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            Self::Config(_) => Some("config_error"),
            Self::Validation(_) => Some("validation_failed"),
            Self::Auth { .. } => Some("auth_failed"),
            Self::AuthMethodDisabled(_) => Some("auth_method_disabled"),
            Self::AuthInProgress => Some("auth_in_progress"),
            Self::Network(_) => Some("network_error"),
            Self::Timeout(_) => Some("timeout"),
            Self::Ssh(_) => Some("ssh_error"),
            Self::TransportBackpressure(_) => Some("transport_backpressure"),
            _ => None,
        }
    }
}

impl ResponseError for Webssh2Error {
    fn status(&self) -> poem::http::StatusCode {
        match self.kind() {
            ErrorKind::Validation => poem::http::StatusCode::BAD_REQUEST,
            ErrorKind::Auth => poem::http::StatusCode::UNAUTHORIZED,
            _ => poem::http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
