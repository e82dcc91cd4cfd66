use std::sync::Arc;

use russh::client;
use russh::keys::PublicKey;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tracing::*;
use webssh2_common::{HostKeyVerificationConfig, SessionId, UnknownKeyAction};
use webssh2_core::{HostKeyCheck, HostKeyStore, SessionHostKeys};

use super::error::ConnectionError;
use super::keys::{fingerprint_of_base64, key_algorithm, key_base64, key_fingerprint};

/// Host-key trust policy handed to each connection: configuration
/// snapshot, the persistent store when the server store is in play, and
/// the owning session's in-memory decisions for the client store.
#[derive(Clone)]
pub struct HostKeyPolicy {
    pub config: HostKeyVerificationConfig,
    pub store: Option<Arc<HostKeyStore>>,
    pub session_keys: Arc<SessionHostKeys>,
}

/// What the client handler needs the session owner to decide.
#[derive(Debug)]
pub enum ClientHandlerEvent {
    HostKeyReceived {
        algorithm: String,
        fingerprint: String,
    },
    HostKeyUnknown {
        algorithm: String,
        key_base64: String,
        fingerprint: String,
        reply: oneshot::Sender<bool>,
    },
    HostKeyMismatch {
        algorithm: String,
        received_key_base64: String,
        received_fingerprint: String,
        known_key_base64: String,
        known_fingerprint: String,
        reply: oneshot::Sender<bool>,
    },
    Disconnect,
}

pub struct ClientHandler {
    pub session_id: SessionId,
    pub host: String,
    pub port: u16,
    pub policy: HostKeyPolicy,
    pub event_tx: UnboundedSender<ClientHandlerEvent>,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientHandlerError {
    #[error("connection error")]
    ConnectionError(ConnectionError),

    #[error("SSH")]
    Ssh(#[from] russh::Error),

    #[error("internal error")]
    Internal,
}

impl ClientHandler {
    async fn prompt(
        &self,
        event: ClientHandlerEvent,
        rx: oneshot::Receiver<bool>,
    ) -> Result<bool, ClientHandlerError> {
        self.event_tx
            .send(event)
            .map_err(|_| ClientHandlerError::Internal)?;
        rx.await.map_err(|_| ClientHandlerError::Internal)
    }

    /// Records an acceptance in every enabled store: the embedded table
    /// for the server store, the session cache for the client store.
    async fn remember_key(&self, key: &PublicKey) {
        if self.policy.config.client_store_enabled() {
            self.policy
                .session_keys
                .trust(&self.host, self.port, &key_algorithm(key), &key_base64(key))
                .await;
        }
        if !self.policy.config.server_store_enabled() {
            return;
        }
        let Some(store) = &self.policy.store else {
            return;
        };
        if let Err(error) = store
            .trust(
                &self.host,
                self.port,
                &key_algorithm(key),
                &key_base64(key),
                None,
            )
            .await
        {
            error!(?error, session=%self.session_id, "Failed to save host key");
        }
    }

    async fn verify_server_key(&self, key: &PublicKey) -> Result<bool, ClientHandlerError> {
        let _ = self.event_tx.send(ClientHandlerEvent::HostKeyReceived {
            algorithm: key_algorithm(key),
            fingerprint: key_fingerprint(key),
        });

        if !self.policy.config.enabled {
            return Ok(true);
        }

        let mut check = match (&self.policy.store, self.policy.config.server_store_enabled()) {
            (Some(store), true) => store
                .check(&self.host, self.port, &key_algorithm(key), &key_base64(key))
                .await
                .map_err(|error| {
                    error!(?error, session=%self.session_id, "Host key lookup failed");
                    ClientHandlerError::Internal
                })?,
            _ => HostKeyCheck::Unknown,
        };

        // Client-store overlay: a key this session's user already
        // accepted is trusted without another prompt, and a session
        // decision can fill in where the server store knows nothing.
        if self.policy.config.client_store_enabled() && check != HostKeyCheck::Trusted {
            match self
                .policy
                .session_keys
                .check(&self.host, self.port, &key_algorithm(key), &key_base64(key))
                .await
            {
                HostKeyCheck::Trusted => check = HostKeyCheck::Trusted,
                session_check @ HostKeyCheck::Mismatch { .. }
                    if check == HostKeyCheck::Unknown =>
                {
                    check = session_check;
                }
                _ => {}
            }
        }

        match check {
            HostKeyCheck::Trusted => Ok(true),
            HostKeyCheck::Mismatch { known_key } => {
                warn!(session=%self.session_id, host=%self.host, "Host key mismatch");
                match self.policy.config.unknown_key_action {
                    UnknownKeyAction::Accept => {
                        self.remember_key(key).await;
                        Ok(true)
                    }
                    UnknownKeyAction::Reject => Err(ClientHandlerError::ConnectionError(
                        ConnectionError::HostKeyMismatch {
                            algorithm: key_algorithm(key),
                            received_key: key_base64(key),
                            known_key,
                        },
                    )),
                    UnknownKeyAction::Prompt => {
                        let (tx, rx) = oneshot::channel();
                        let algorithm = key_algorithm(key);
                        let accepted = self
                            .prompt(
                                ClientHandlerEvent::HostKeyMismatch {
                                    received_key_base64: key_base64(key),
                                    received_fingerprint: key_fingerprint(key),
                                    known_fingerprint: fingerprint_of_base64(
                                        &algorithm, &known_key,
                                    ),
                                    known_key_base64: known_key,
                                    algorithm,
                                    reply: tx,
                                },
                                rx,
                            )
                            .await?;
                        if accepted {
                            // An explicitly confirmed replacement heals
                            // the stores so the next connection is clean.
                            self.remember_key(key).await;
                        }
                        Ok(accepted)
                    }
                }
            }
            HostKeyCheck::Unknown => {
                warn!(session=%self.session_id, host=%self.host, "Host key is unknown");
                match self.policy.config.unknown_key_action {
                    UnknownKeyAction::Accept => {
                        self.remember_key(key).await;
                        Ok(true)
                    }
                    UnknownKeyAction::Reject => Ok(false),
                    UnknownKeyAction::Prompt => {
                        let (tx, rx) = oneshot::channel();
                        let accepted = self
                            .prompt(
                                ClientHandlerEvent::HostKeyUnknown {
                                    algorithm: key_algorithm(key),
                                    key_base64: key_base64(key),
                                    fingerprint: key_fingerprint(key),
                                    reply: tx,
                                },
                                rx,
                            )
                            .await?;
                        if accepted {
                            self.remember_key(key).await;
                        }
                        Ok(accepted)
                    }
                }
            }
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = ClientHandlerError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        self.verify_server_key(server_public_key).await
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        let _ = self.event_tx.send(ClientHandlerEvent::Disconnect);
        debug!(session=%self.session_id, "Dropped");
    }
}
