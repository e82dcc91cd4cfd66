use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use sea_orm::{ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter};
use tokio::sync::Mutex;
use tracing::*;
use webssh2_common::Webssh2Error;
use webssh2_db_entities::HostKey;

/// Result of checking a presented key against the persistent store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyCheck {
    Trusted,
    /// A different key is on record for this (host, port, algorithm).
    Mismatch { known_key: String },
    Unknown,
}

/// Server-side trust store over the embedded `host_keys` table, keyed by
/// (host, port, algorithm). Records are created on user acceptance and
/// never auto-deleted.
pub struct HostKeyStore {
    db: Arc<Mutex<DatabaseConnection>>,
}

impl HostKeyStore {
    pub fn new(db: &Arc<Mutex<DatabaseConnection>>) -> Self {
        Self { db: db.clone() }
    }

    pub async fn check(
        &self,
        host: &str,
        port: u16,
        algorithm: &str,
        key_base64: &str,
    ) -> Result<HostKeyCheck, Webssh2Error> {
        let db = self.db.lock().await;
        let entry = HostKey::Entity::find()
            .filter(HostKey::Column::Host.eq(host))
            .filter(HostKey::Column::Port.eq(port as i32))
            .filter(HostKey::Column::Algorithm.eq(algorithm))
            .one(&*db)
            .await
            .map_err(|e| Webssh2Error::Database(e.to_string()))?;

        Ok(match entry {
            Some(entry) if entry.key == key_base64 => HostKeyCheck::Trusted,
            Some(entry) => HostKeyCheck::Mismatch {
                known_key: entry.key,
            },
            None => HostKeyCheck::Unknown,
        })
    }

    /// Persists an accepted key. Idempotent for an identical key; a key
    /// accepted over a mismatch replaces the stored row (rotation).
    pub async fn trust(
        &self,
        host: &str,
        port: u16,
        algorithm: &str,
        key_base64: &str,
        comment: Option<String>,
    ) -> Result<(), Webssh2Error> {
        use sea_orm::ActiveValue::Set;

        let values = HostKey::ActiveModel {
            host: Set(host.to_owned()),
            port: Set(port as i32),
            algorithm: Set(algorithm.to_owned()),
            key: Set(key_base64.to_owned()),
            added_at: Set(Utc::now()),
            comment: Set(comment),
        };

        match self.check(host, port, algorithm, key_base64).await? {
            HostKeyCheck::Trusted => Ok(()),
            HostKeyCheck::Mismatch { .. } => {
                let db = self.db.lock().await;
                values
                    .update(&*db)
                    .await
                    .map_err(|e| Webssh2Error::Database(e.to_string()))?;
                info!(%host, %port, %algorithm, "Host key replaced");
                Ok(())
            }
            HostKeyCheck::Unknown => {
                let db = self.db.lock().await;
                values
                    .insert(&*db)
                    .await
                    .map_err(|e| Webssh2Error::Database(e.to_string()))?;
                info!(%host, %port, %algorithm, "Host key trusted");
                Ok(())
            }
        }
    }
}

/// Session-scoped trust decisions for the client store: keys the user
/// accepted from the browser. Entries live exactly as long as the
/// owning session and are never written to disk.
#[derive(Default)]
pub struct SessionHostKeys {
    keys: Mutex<HashMap<(String, u16, String), String>>,
}

impl SessionHostKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn check(
        &self,
        host: &str,
        port: u16,
        algorithm: &str,
        key_base64: &str,
    ) -> HostKeyCheck {
        let keys = self.keys.lock().await;
        match keys.get(&(host.to_owned(), port, algorithm.to_owned())) {
            Some(known) if known == key_base64 => HostKeyCheck::Trusted,
            Some(known) => HostKeyCheck::Mismatch {
                known_key: known.clone(),
            },
            None => HostKeyCheck::Unknown,
        }
    }

    /// Records an acceptance, replacing any earlier decision for the
    /// same (host, port, algorithm).
    pub async fn trust(&self, host: &str, port: u16, algorithm: &str, key_base64: &str) {
        self.keys.lock().await.insert(
            (host.to_owned(), port, algorithm.to_owned()),
            key_base64.to_owned(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::connect_to_db_url;

    async fn memory_store() -> HostKeyStore {
        let db = connect_to_db_url("sqlite::memory:").await.unwrap();
        HostKeyStore::new(&Arc::new(Mutex::new(db)))
    }

    #[tokio::test]
    async fn test_insert_then_lookup_is_trusted() {
        let store = memory_store().await;
        store
            .trust("example.net", 22, "ssh-ed25519", "AAAAC3keydata", None)
            .await
            .unwrap();
        let check = store
            .check("example.net", 22, "ssh-ed25519", "AAAAC3keydata")
            .await
            .unwrap();
        assert_eq!(check, HostKeyCheck::Trusted);
    }

    #[tokio::test]
    async fn test_different_key_is_mismatch() {
        let store = memory_store().await;
        store
            .trust("example.net", 22, "ssh-ed25519", "AAAAC3keydata", None)
            .await
            .unwrap();
        let check = store
            .check("example.net", 22, "ssh-ed25519", "AAAAC3different")
            .await
            .unwrap();
        assert_eq!(
            check,
            HostKeyCheck::Mismatch {
                known_key: "AAAAC3keydata".into()
            }
        );
    }

    #[tokio::test]
    async fn test_unknown_host() {
        let store = memory_store().await;
        let check = store
            .check("other.net", 22, "ssh-ed25519", "AAAAC3keydata")
            .await
            .unwrap();
        assert_eq!(check, HostKeyCheck::Unknown);
    }

    #[tokio::test]
    async fn test_keys_scoped_per_port_and_algorithm() {
        let store = memory_store().await;
        store
            .trust("example.net", 22, "ssh-ed25519", "AAAAC3keydata", None)
            .await
            .unwrap();
        assert_eq!(
            store
                .check("example.net", 2222, "ssh-ed25519", "AAAAC3keydata")
                .await
                .unwrap(),
            HostKeyCheck::Unknown
        );
        assert_eq!(
            store
                .check("example.net", 22, "rsa-sha2-512", "AAAAC3keydata")
                .await
                .unwrap(),
            HostKeyCheck::Unknown
        );
    }

    #[tokio::test]
    async fn test_trust_replaces_rotated_key() {
        let store = memory_store().await;
        store
            .trust("example.net", 22, "ssh-ed25519", "AAAAC3oldkey", None)
            .await
            .unwrap();
        // Accepting a different key for the same (host, port, algorithm)
        // heals the store instead of erroring on the existing row.
        store
            .trust("example.net", 22, "ssh-ed25519", "AAAAC3newkey", Some("rotated".into()))
            .await
            .unwrap();
        assert_eq!(
            store
                .check("example.net", 22, "ssh-ed25519", "AAAAC3newkey")
                .await
                .unwrap(),
            HostKeyCheck::Trusted
        );
        assert_eq!(
            store
                .check("example.net", 22, "ssh-ed25519", "AAAAC3oldkey")
                .await
                .unwrap(),
            HostKeyCheck::Mismatch {
                known_key: "AAAAC3newkey".into()
            }
        );
    }

    #[tokio::test]
    async fn test_session_keys_accept_then_check() {
        let session = SessionHostKeys::new();
        assert_eq!(
            session.check("example.net", 22, "ssh-ed25519", "AAAAC3key").await,
            HostKeyCheck::Unknown
        );
        session
            .trust("example.net", 22, "ssh-ed25519", "AAAAC3key")
            .await;
        assert_eq!(
            session.check("example.net", 22, "ssh-ed25519", "AAAAC3key").await,
            HostKeyCheck::Trusted
        );
        assert_eq!(
            session
                .check("example.net", 22, "ssh-ed25519", "AAAAC3other")
                .await,
            HostKeyCheck::Mismatch {
                known_key: "AAAAC3key".into()
            }
        );
        // Scoped per (host, port, algorithm).
        assert_eq!(
            session
                .check("example.net", 2222, "ssh-ed25519", "AAAAC3key")
                .await,
            HostKeyCheck::Unknown
        );
    }

    #[tokio::test]
    async fn test_session_keys_rotation() {
        let session = SessionHostKeys::new();
        session.trust("h", 22, "ssh-ed25519", "AAAAC3old").await;
        session.trust("h", 22, "ssh-ed25519", "AAAAC3new").await;
        assert_eq!(
            session.check("h", 22, "ssh-ed25519", "AAAAC3new").await,
            HostKeyCheck::Trusted
        );
    }

    #[tokio::test]
    async fn test_trust_is_idempotent() {
        let store = memory_store().await;
        store
            .trust("example.net", 22, "ssh-ed25519", "AAAAC3keydata", None)
            .await
            .unwrap();
        store
            .trust("example.net", 22, "ssh-ed25519", "AAAAC3keydata", None)
            .await
            .unwrap();
        assert_eq!(
            store
                .check("example.net", 22, "ssh-ed25519", "AAAAC3keydata")
                .await
                .unwrap(),
            HostKeyCheck::Trusted
        );
    }

    #[tokio::test]
    async fn test_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_keys.sqlite3");
        let url = format!("sqlite://{}?mode=rwc", path.display());

        {
            let db = connect_to_db_url(&url).await.unwrap();
            let store = HostKeyStore::new(&Arc::new(Mutex::new(db)));
            store
                .trust("example.net", 22, "ssh-ed25519", "AAAAC3keydata", Some("laptop".into()))
                .await
                .unwrap();
        }

        let db = connect_to_db_url(&url).await.unwrap();
        let store = HostKeyStore::new(&Arc::new(Mutex::new(db)));
        assert_eq!(
            store
                .check("example.net", 22, "ssh-ed25519", "AAAAC3keydata")
                .await
                .unwrap(),
            HostKeyCheck::Trusted
        );
    }
}
