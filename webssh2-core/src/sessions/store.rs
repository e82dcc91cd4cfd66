use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, Mutex};
use tracing::*;
use webssh2_common::{SessionId, Webssh2Error};

use super::actions::SessionAction;
use super::reducers::session_reducer;
use super::state::{ClientInfo, SessionState};

struct SessionCell {
    // Serializes dispatches for one session; the stored Arc is the
    // immutable snapshot handed out by `get_state`.
    state: Mutex<Arc<SessionState>>,
}

/// Process-wide session map. All mutation funnels through [`dispatch`];
/// readers only ever see completed snapshots.
///
/// [`dispatch`]: SessionStore::dispatch
pub struct SessionStore {
    sessions: Mutex<HashMap<SessionId, Arc<SessionCell>>>,
    change_sender: broadcast::Sender<SessionId>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            change_sender: broadcast::channel(64).0,
        }
    }

    pub async fn create_session(&self, id: SessionId, client: ClientInfo) -> Arc<SessionState> {
        let now = Utc::now();
        let mut state = SessionState::default();
        state.metadata.client = client;
        state.metadata.created_at = now;
        state.metadata.updated_at = now;
        let snapshot = Arc::new(state);

        let cell = Arc::new(SessionCell {
            state: Mutex::new(snapshot.clone()),
        });
        self.sessions.lock().await.insert(id, cell);
        debug!(session=%id, "Session created");
        snapshot
    }

    /// Applies one action. Dispatches for the same session serialize on
    /// the session's cell; the returned snapshot reflects the new state.
    pub async fn dispatch(
        &self,
        id: SessionId,
        action: SessionAction,
    ) -> Result<Arc<SessionState>, Webssh2Error> {
        let cell = self
            .sessions
            .lock()
            .await
            .get(&id)
            .cloned()
            .ok_or(Webssh2Error::SessionNotFound)?;

        let mut slot = cell.state.lock().await;
        match session_reducer(&slot, &action) {
            Some(mut next) => {
                next.metadata.updated_at = Utc::now();
                let snapshot = Arc::new(next);
                *slot = snapshot.clone();
                let _ = self.change_sender.send(id);
                Ok(snapshot)
            }
            None => Ok(slot.clone()),
        }
    }

    /// Immutable snapshot of a session, if it exists.
    pub async fn get_state(&self, id: SessionId) -> Option<Arc<SessionState>> {
        let cell = self.sessions.lock().await.get(&id).cloned()?;
        let slot = cell.state.lock().await;
        Some(slot.clone())
    }

    pub async fn remove_session(&self, id: SessionId) {
        if self.sessions.lock().await.remove(&id).is_some() {
            debug!(session=%id, "Session removed");
            let _ = self.change_sender.send(id);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionId> {
        self.change_sender.subscribe()
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Drops sessions idle for longer than `max_idle`. Run periodically
    /// by the services sweeper.
    pub async fn sweep_idle(&self, max_idle: Duration) -> usize {
        let now = Utc::now();
        let mut expired = vec![];
        {
            let sessions = self.sessions.lock().await;
            for (id, cell) in sessions.iter() {
                let slot = cell.state.lock().await;
                let idle = now - slot.metadata.updated_at;
                if idle.to_std().map(|d| d > max_idle).unwrap_or(false) {
                    expired.push(*id);
                }
            }
        }
        let count = expired.len();
        for id in expired {
            info!(session=%id, "Expiring idle session");
            self.remove_session(id).await;
        }
        count
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;
    use webssh2_common::auth::AuthMethod;

    use super::super::state::{AuthStatus, ConnectionStatus};
    use super::*;

    #[tokio::test]
    async fn test_dispatch_returns_snapshots() {
        let store = SessionStore::new();
        let id = Uuid::new_v4();
        store.create_session(id, ClientInfo::default()).await;

        let before = store.get_state(id).await.unwrap();
        let after = store
            .dispatch(
                id,
                SessionAction::AuthSuccess {
                    method: AuthMethod::Password,
                    username: "alice".into(),
                    at: Utc::now(),
                },
            )
            .await
            .unwrap();

        assert_eq!(before.auth.status, AuthStatus::Pending);
        assert_eq!(after.auth.status, AuthStatus::Authenticated);
        // The old snapshot is untouched by the dispatch.
        assert_eq!(before.auth.status, AuthStatus::Pending);
    }

    #[tokio::test]
    async fn test_noop_dispatch_keeps_snapshot() {
        let store = SessionStore::new();
        let id = Uuid::new_v4();
        store.create_session(id, ClientInfo::default()).await;

        let before = store.get_state(id).await.unwrap();
        let after = store
            .dispatch(
                id,
                SessionAction::TerminalResize {
                    rows: 24,
                    cols: 80,
                },
            )
            .await
            .unwrap();
        // Default geometry resized to itself: no-op, same snapshot.
        assert!(Arc::ptr_eq(&before, &after));
    }

    #[tokio::test]
    async fn test_unknown_session() {
        let store = SessionStore::new();
        let result = store
            .dispatch(Uuid::new_v4(), SessionAction::AuthLogout)
            .await;
        assert!(matches!(result, Err(Webssh2Error::SessionNotFound)));
    }

    #[tokio::test]
    async fn test_concurrent_dispatches_serialize() {
        let store = Arc::new(SessionStore::new());
        let id = Uuid::new_v4();
        store.create_session(id, ClientInfo::default()).await;
        store
            .dispatch(
                id,
                SessionAction::AuthSuccess {
                    method: AuthMethod::Password,
                    username: "u".into(),
                    at: Utc::now(),
                },
            )
            .await
            .unwrap();

        let mut tasks = vec![];
        for i in 0..20u32 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .dispatch(
                        id,
                        SessionAction::TerminalResize {
                            rows: 10 + i,
                            cols: 80,
                        },
                    )
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let state = store.get_state(id).await.unwrap();
        assert!((10..30).contains(&state.terminal.rows));
        assert_eq!(state.auth.status, AuthStatus::Authenticated);
        assert_ne!(state.connection.status, ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_remove_session() {
        let store = SessionStore::new();
        let id = Uuid::new_v4();
        store.create_session(id, ClientInfo::default()).await;
        assert_eq!(store.session_count().await, 1);
        store.remove_session(id).await;
        assert!(store.get_state(id).await.is_none());
    }
}
