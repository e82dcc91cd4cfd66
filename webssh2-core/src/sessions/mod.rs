mod actions;
mod reducers;
mod state;
mod store;

pub use actions::SessionAction;
pub use reducers::{
    auth_reducer, connection_reducer, metadata_reducer, session_reducer, terminal_reducer,
};
pub use state::{
    AuthState, AuthStatus, ClientInfo, ConnectionState, ConnectionStatus, SessionMetadata,
    SessionState, TerminalState,
};
pub use store::SessionStore;
