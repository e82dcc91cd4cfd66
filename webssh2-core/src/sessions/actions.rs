use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;
use webssh2_common::auth::AuthMethod;

/// Every state transition a session can undergo. Reducers are pure, so
/// actions that record a time carry it explicitly.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionAction {
    AuthSuccess {
        method: AuthMethod,
        username: String,
        at: DateTime<Utc>,
    },
    AuthFailure {
        error: String,
        at: DateTime<Utc>,
    },
    AuthLogout,

    ConnectionStart {
        host: String,
        port: u16,
    },
    ConnectionEstablished {
        connection_id: Uuid,
        at: DateTime<Utc>,
    },
    ConnectionError {
        error: String,
    },
    ConnectionClosed,

    TerminalInit {
        term: Option<String>,
        rows: Option<u32>,
        cols: Option<u32>,
    },
    TerminalResize {
        rows: u32,
        cols: u32,
    },
    TerminalUpdateEnv {
        environment: BTreeMap<String, String>,
    },
    TerminalSetCwd {
        cwd: String,
    },
    TerminalDestroy,

    ClientConnected {
        ip: Option<String>,
        port: Option<u16>,
        user_agent: Option<String>,
    },
}
