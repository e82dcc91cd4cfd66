use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;
use webssh2_common::auth::AuthMethod;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthStatus {
    #[default]
    Pending,
    Authenticated,
    Failed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AuthState {
    pub status: AuthStatus,
    /// `None` until an attempt names one ("none" in the wire shape).
    pub method: Option<AuthMethod>,
    pub username: Option<String>,
    pub error_message: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
    Closed,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub connection_id: Option<Uuid>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub error_message: Option<String>,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TerminalState {
    pub term: Option<String>,
    pub rows: u32,
    pub cols: u32,
    pub environment: BTreeMap<String, String>,
    pub cwd: Option<String>,
}

impl Default for TerminalState {
    fn default() -> Self {
        Self {
            term: None,
            rows: 24,
            cols: 80,
            environment: BTreeMap::new(),
            cwd: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ClientInfo {
    pub ip: Option<String>,
    pub port: Option<u16>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionMetadata {
    pub client: ClientInfo,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for SessionMetadata {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            client: ClientInfo::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Full observable state of one session. Snapshots handed out by the
/// store are immutable; every change goes through `dispatch`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionState {
    pub auth: AuthState,
    pub connection: ConnectionState,
    pub terminal: TerminalState,
    pub metadata: SessionMetadata,
}
