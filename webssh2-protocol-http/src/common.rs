use std::collections::BTreeMap;

use data_encoding::HEXLOWER;
use poem::session::Session;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use webssh2_common::auth::Credentials;
use webssh2_common::Secret;

pub const PROTOCOL_NAME: &str = "webssh2";

static SEED_SESSION_KEY: &str = "seed";
static CSRF_ID_SESSION_KEY: &str = "csrf_id";

/// Credentials and UI hints planted into the HTTP session by the host
/// route, Basic auth, or the SSO entry point, consumed by the next
/// WebSocket upgrade.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeededCredentials {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub private_key: Option<String>,
    pub passphrase: Option<String>,
    pub term: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeededSession {
    pub credentials: Option<SeededCredentials>,
    pub header: Option<String>,
    pub header_background: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl SeededSession {
    /// Complete transient credentials, when the seed has enough to
    /// authenticate without asking the client.
    pub fn credentials(&self) -> Option<Credentials> {
        let seed = self.credentials.as_ref()?;
        let host = seed.host.clone()?;
        let username = seed.username.clone().filter(|u| !u.is_empty())?;
        if seed.password.is_none() && seed.private_key.is_none() {
            return None;
        }
        Some(Credentials {
            host,
            port: seed.port.unwrap_or(22),
            username,
            password: seed.password.clone().map(Secret::new),
            private_key: seed.private_key.clone().map(Secret::new),
            passphrase: seed.passphrase.clone().map(Secret::new),
            term: seed.term.clone(),
            cols: None,
            rows: None,
            keyboard_interactive: false,
        })
    }

    pub fn clear_credentials(&mut self) {
        self.credentials = None;
    }
}

pub trait SessionExt {
    fn seed_id(&self) -> String;
    fn csrf_id(&self) -> String;
}

impl SessionExt for Session {
    /// Opaque key under which this visitor's seeded state lives in the
    /// ephemeral store. The credentials themselves never enter the
    /// cookie-backed session.
    fn seed_id(&self) -> String {
        match self.get::<String>(SEED_SESSION_KEY) {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                self.set(SEED_SESSION_KEY, id.clone());
                id
            }
        }
    }

    /// Stable random identifier used to derive the CSRF token for this
    /// session.
    fn csrf_id(&self) -> String {
        match self.get::<String>(CSRF_ID_SESSION_KEY) {
            Some(id) => id,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                self.set(CSRF_ID_SESSION_KEY, id.clone());
                id
            }
        }
    }
}

/// Reads the visitor's seeded state from the ephemeral store. Expired or
/// absent entries come back as an empty seed.
pub async fn get_seeded(session: &Session, services: &webssh2_core::Services) -> SeededSession {
    let id = session.seed_id();
    services
        .ephemeral
        .get(&id)
        .await
        .and_then(|value| serde_json::from_value(value).ok())
        .unwrap_or_default()
}

pub async fn set_seeded(
    session: &Session,
    services: &webssh2_core::Services,
    seeded: SeededSession,
) {
    let id = session.seed_id();
    if let Ok(value) = serde_json::to_value(seeded) {
        services.ephemeral.put(id, value).await;
    }
}

/// Double-submit token bound to the session: sha256 over the configured
/// secret and the session's random id.
pub fn csrf_token(secret: &str, csrf_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(b":");
    hasher.update(csrf_id.as_bytes());
    HEXLOWER.encode(&hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incomplete_seed_yields_no_credentials() {
        let seeded = SeededSession::default();
        assert!(seeded.credentials().is_none());

        let seeded = SeededSession {
            credentials: Some(SeededCredentials {
                host: Some("h".into()),
                username: Some("u".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        // No password and no key: the client must authenticate.
        assert!(seeded.credentials().is_none());
    }

    #[test]
    fn test_complete_seed() {
        let seeded = SeededSession {
            credentials: Some(SeededCredentials {
                host: Some("example.net".into()),
                port: Some(2022),
                username: Some("alice".into()),
                password: Some("pw".into()),
                ..Default::default()
            }),
            ..Default::default()
        };
        let credentials = seeded.credentials().unwrap();
        assert_eq!(credentials.host, "example.net");
        assert_eq!(credentials.port, 2022);
    }

    #[test]
    fn test_csrf_token_deterministic() {
        let a = csrf_token("secret", "id-1");
        assert_eq!(a, csrf_token("secret", "id-1"));
        assert_ne!(a, csrf_token("secret", "id-2"));
        assert_ne!(a, csrf_token("other", "id-1"));
        assert_eq!(a.len(), 64);
    }
}
