//! Pure per-domain reducers. Each returns `None` when the action is a
//! no-op for its domain, which is how the store detects changes; an
//! action nobody recognizes therefore cannot fail, only fall through.

use webssh2_common::consts::{MAX_TERMINAL_DIMENSION, MIN_TERMINAL_DIMENSION};
use webssh2_common::validation::env_key_storable;

use super::actions::SessionAction;
use super::state::{
    AuthState, AuthStatus, ConnectionState, ConnectionStatus, SessionMetadata, SessionState,
    TerminalState,
};

const MIN_DIMENSION: u32 = MIN_TERMINAL_DIMENSION;
const MAX_DIMENSION: u32 = MAX_TERMINAL_DIMENSION;

fn changed<T: PartialEq>(old: &T, next: T) -> Option<T> {
    if next == *old {
        None
    } else {
        Some(next)
    }
}

pub fn auth_reducer(state: &AuthState, action: &SessionAction) -> Option<AuthState> {
    let mut next = state.clone();
    match action {
        SessionAction::AuthSuccess {
            method,
            username,
            at,
        } => {
            next.status = AuthStatus::Authenticated;
            next.method = Some(*method);
            next.username = Some(username.clone());
            next.error_message = None;
            next.timestamp = Some(*at);
        }
        SessionAction::AuthFailure { error, at } => {
            next.status = AuthStatus::Failed;
            next.error_message = Some(error.clone());
            next.timestamp = Some(*at);
        }
        SessionAction::AuthLogout => {
            next.status = AuthStatus::Pending;
            next.method = None;
            next.username = None;
            next.error_message = None;
        }
        // Connection-level trouble demotes a previously authenticated
        // session back to pending.
        SessionAction::ConnectionError { .. } | SessionAction::ConnectionClosed => {
            if next.status == AuthStatus::Authenticated {
                next.status = AuthStatus::Pending;
            }
        }
        _ => return None,
    }
    changed(state, next)
}

pub fn connection_reducer(state: &ConnectionState, action: &SessionAction) -> Option<ConnectionState> {
    let mut next = state.clone();
    match action {
        SessionAction::ConnectionStart { host, port } => {
            next.status = ConnectionStatus::Connecting;
            next.host = Some(host.clone());
            next.port = Some(*port);
            next.error_message = None;
        }
        SessionAction::ConnectionEstablished { connection_id, at } => {
            next.status = ConnectionStatus::Connected;
            next.connection_id = Some(*connection_id);
            next.error_message = None;
            next.last_activity = Some(*at);
        }
        SessionAction::ConnectionError { error } => {
            next.status = ConnectionStatus::Error;
            next.connection_id = None;
            next.error_message = Some(error.clone());
        }
        SessionAction::ConnectionClosed => {
            next.status = ConnectionStatus::Closed;
            next.connection_id = None;
        }
        // Losing authentication forcibly drops the connection substate.
        SessionAction::AuthFailure { .. } | SessionAction::AuthLogout => {
            next.status = ConnectionStatus::Disconnected;
            next.connection_id = None;
        }
        _ => return None,
    }
    changed(state, next)
}

pub fn terminal_reducer(state: &TerminalState, action: &SessionAction) -> Option<TerminalState> {
    let mut next = state.clone();
    match action {
        SessionAction::TerminalInit { term, rows, cols } => {
            if let Some(term) = term {
                next.term = Some(term.clone());
            }
            if let Some(rows) = rows {
                if (MIN_DIMENSION..=MAX_DIMENSION).contains(rows) {
                    next.rows = *rows;
                }
            }
            if let Some(cols) = cols {
                if (MIN_DIMENSION..=MAX_DIMENSION).contains(cols) {
                    next.cols = *cols;
                }
            }
        }
        SessionAction::TerminalResize { rows, cols } => {
            if !(MIN_DIMENSION..=MAX_DIMENSION).contains(rows)
                || !(MIN_DIMENSION..=MAX_DIMENSION).contains(cols)
            {
                return None;
            }
            next.rows = *rows;
            next.cols = *cols;
        }
        SessionAction::TerminalUpdateEnv { environment } => {
            for (key, value) in environment {
                if env_key_storable(key) {
                    next.environment.insert(key.clone(), value.clone());
                }
            }
        }
        SessionAction::TerminalSetCwd { cwd } => {
            next.cwd = Some(cwd.clone());
        }
        SessionAction::TerminalDestroy => {
            next = TerminalState::default();
        }
        _ => return None,
    }
    changed(state, next)
}

pub fn metadata_reducer(state: &SessionMetadata, action: &SessionAction) -> Option<SessionMetadata> {
    let mut next = state.clone();
    match action {
        SessionAction::ClientConnected {
            ip,
            port,
            user_agent,
        } => {
            next.client.ip = ip.clone();
            next.client.port = *port;
            next.client.user_agent = user_agent.clone();
        }
        _ => return None,
    }
    changed(state, next)
}

/// Composition of the domain reducers. `None` means the action changed
/// nothing anywhere.
pub fn session_reducer(state: &SessionState, action: &SessionAction) -> Option<SessionState> {
    // A connection may only become `connected` on an authenticated
    // session; an establish event racing a logout is discarded.
    if matches!(action, SessionAction::ConnectionEstablished { .. })
        && state.auth.status != AuthStatus::Authenticated
    {
        return None;
    }

    let auth = auth_reducer(&state.auth, action);
    let connection = connection_reducer(&state.connection, action);
    let terminal = terminal_reducer(&state.terminal, action);
    let metadata = metadata_reducer(&state.metadata, action);

    if auth.is_none() && connection.is_none() && terminal.is_none() && metadata.is_none() {
        return None;
    }

    Some(SessionState {
        auth: auth.unwrap_or_else(|| state.auth.clone()),
        connection: connection.unwrap_or_else(|| state.connection.clone()),
        terminal: terminal.unwrap_or_else(|| state.terminal.clone()),
        metadata: metadata.unwrap_or_else(|| state.metadata.clone()),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use uuid::Uuid;
    use webssh2_common::auth::AuthMethod;

    use super::*;

    fn authenticated_state() -> SessionState {
        let mut state = SessionState::default();
        state = session_reducer(
            &state,
            &SessionAction::AuthSuccess {
                method: AuthMethod::Password,
                username: "alice".into(),
                at: Utc::now(),
            },
        )
        .unwrap();
        session_reducer(
            &state,
            &SessionAction::ConnectionEstablished {
                connection_id: Uuid::new_v4(),
                at: Utc::now(),
            },
        )
        .unwrap()
    }

    #[test]
    fn test_unrelated_action_is_identity() {
        let state = SessionState::default();
        let action = SessionAction::TerminalSetCwd {
            cwd: "/home".into(),
        };
        assert!(auth_reducer(&state.auth, &action).is_none());
        assert!(connection_reducer(&state.connection, &action).is_none());
        assert!(metadata_reducer(&state.metadata, &action).is_none());
    }

    #[test]
    fn test_reducers_pure() {
        let state = authenticated_state();
        let action = SessionAction::ConnectionError {
            error: "reset by peer".into(),
        };
        let first = session_reducer(&state, &action);
        let second = session_reducer(&state, &action);
        assert_eq!(first, second);
    }

    #[test]
    fn test_connection_error_demotes_auth() {
        let state = authenticated_state();
        let next = session_reducer(
            &state,
            &SessionAction::ConnectionError {
                error: "boom".into(),
            },
        )
        .unwrap();
        assert_eq!(next.auth.status, AuthStatus::Pending);
        assert_eq!(next.connection.status, ConnectionStatus::Error);
        assert!(next.connection.connection_id.is_none());
    }

    #[test]
    fn test_auth_failure_forces_disconnect_from_any_state() {
        let states = [
            SessionState::default(),
            authenticated_state(),
            session_reducer(
                &SessionState::default(),
                &SessionAction::ConnectionStart {
                    host: "h".into(),
                    port: 22,
                },
            )
            .unwrap(),
        ];
        for state in states {
            let action = SessionAction::AuthFailure {
                error: "denied".into(),
                at: Utc::now(),
            };
            let next = session_reducer(&state, &action).unwrap();
            assert_eq!(next.connection.status, ConnectionStatus::Disconnected);
            assert!(next.connection.connection_id.is_none());
            assert_eq!(next.auth.status, AuthStatus::Failed);
        }
    }

    #[test]
    fn test_auth_logout_forces_disconnect() {
        let state = authenticated_state();
        let next = session_reducer(&state, &SessionAction::AuthLogout).unwrap();
        assert_eq!(next.auth.status, AuthStatus::Pending);
        assert_eq!(next.connection.status, ConnectionStatus::Disconnected);
        assert!(next.connection.connection_id.is_none());
    }

    #[test]
    fn test_resize_out_of_range_is_noop() {
        let state = SessionState::default();
        assert!(terminal_reducer(
            &state.terminal,
            &SessionAction::TerminalResize {
                rows: 0,
                cols: 80
            }
        )
        .is_none());
        assert!(terminal_reducer(
            &state.terminal,
            &SessionAction::TerminalResize {
                rows: 24,
                cols: 10_000
            }
        )
        .is_none());
    }

    #[test]
    fn test_env_merge_applies_storable_keys_only() {
        let state = TerminalState::default();
        let mut env = BTreeMap::new();
        env.insert("LANG".to_string(), "C".to_string());
        env.insert("_UNDERSCORE".to_string(), "x".to_string());
        let next = terminal_reducer(
            &state,
            &SessionAction::TerminalUpdateEnv { environment: env },
        )
        .unwrap();
        assert_eq!(next.environment.get("LANG").map(String::as_str), Some("C"));
        assert!(!next.environment.contains_key("_UNDERSCORE"));
    }

    #[test]
    fn test_terminal_destroy_resets() {
        let mut state = TerminalState::default();
        state.rows = 50;
        state.term = Some("vt100".into());
        let next =
            terminal_reducer(&state, &SessionAction::TerminalDestroy).unwrap();
        assert_eq!(next, TerminalState::default());
        // Destroying an already-default terminal changes nothing.
        assert!(terminal_reducer(&next, &SessionAction::TerminalDestroy).is_none());
    }

    // Applies a few thousand pseudo-random actions and checks the core
    // invariant after every step: connected implies authenticated.
    #[test]
    fn test_connected_implies_authenticated_over_random_sequences() {
        let mut rng = StdRng::seed_from_u64(7);
        let at = Utc::now();
        for _ in 0..50 {
            let mut state = SessionState::default();
            for _ in 0..100 {
                let action = match rng.gen_range(0..8) {
                    0 => SessionAction::AuthSuccess {
                        method: AuthMethod::Password,
                        username: "u".into(),
                        at,
                    },
                    1 => SessionAction::AuthFailure {
                        error: "e".into(),
                        at,
                    },
                    2 => SessionAction::AuthLogout,
                    3 => SessionAction::ConnectionStart {
                        host: "h".into(),
                        port: 22,
                    },
                    4 => SessionAction::ConnectionEstablished {
                        connection_id: Uuid::new_v4(),
                        at,
                    },
                    5 => SessionAction::ConnectionError { error: "e".into() },
                    6 => SessionAction::ConnectionClosed,
                    _ => SessionAction::TerminalResize { rows: 24, cols: 80 },
                };
                if let Some(next) = session_reducer(&state, &action) {
                    state = next;
                }
                if state.connection.status == ConnectionStatus::Connected {
                    assert_eq!(
                        state.auth.status,
                        AuthStatus::Authenticated,
                        "connected without authentication after {action:?}"
                    );
                }
            }
        }
    }
}
