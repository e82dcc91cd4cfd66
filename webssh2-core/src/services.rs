use std::sync::Arc;

use once_cell::sync::Lazy;
use sea_orm::DatabaseConnection;
use std::sync::RwLock;
use tokio::sync::Mutex;
use tracing::*;
use webssh2_common::consts::{MAX_SESSION_TIMEOUT, SESSION_SWEEP_INTERVAL};
use webssh2_common::{Webssh2Config, Webssh2Error};

use crate::db::connect_to_db;
use crate::ephemeral::EphemeralStore;
use crate::eventbus::{BusMetrics, EventBus};
use crate::hostkeys::HostKeyStore;
use crate::logging::LogPipeline;
use crate::sessions::SessionStore;

/// Shared service handles, injected at startup and threaded through the
/// protocol layers.
#[derive(Clone)]
pub struct Services {
    pub config: Arc<Mutex<Webssh2Config>>,
    pub db: Arc<Mutex<DatabaseConnection>>,
    pub session_store: Arc<SessionStore>,
    pub event_bus: Arc<EventBus>,
    pub bus_metrics: Arc<BusMetrics>,
    pub log_pipeline: Arc<LogPipeline>,
    pub host_keys: Arc<HostKeyStore>,
    /// Short-lived per-visitor state (seeded credentials and the like),
    /// keyed by opaque ids handed to the HTTP session.
    pub ephemeral: Arc<EphemeralStore<serde_json::Value>>,
}

impl Services {
    pub async fn new(config: Webssh2Config) -> Result<Self, Webssh2Error> {
        let db = connect_to_db(&config).await?;
        let db = Arc::new(Mutex::new(db));

        let log_pipeline = Arc::new(LogPipeline::new(&config.store.logging)?);
        let (event_bus, bus_metrics) = EventBus::with_default_middleware();
        let event_bus = Arc::new(event_bus);
        let session_store = Arc::new(SessionStore::new());
        let host_keys = Arc::new(HostKeyStore::new(&db));

        let ephemeral = Arc::new(EphemeralStore::new(MAX_SESSION_TIMEOUT));

        tokio::spawn({
            let session_store = session_store.clone();
            let ephemeral = ephemeral.clone();
            async move {
                loop {
                    tokio::time::sleep(SESSION_SWEEP_INTERVAL).await;
                    let expired = session_store.sweep_idle(MAX_SESSION_TIMEOUT).await;
                    let swept = ephemeral.sweep().await;
                    if expired > 0 || swept > 0 {
                        debug!(expired, swept, "Expiration sweep");
                    }
                }
            }
        });

        Ok(Self {
            config: Arc::new(Mutex::new(config)),
            db,
            session_store,
            event_bus,
            bus_metrics,
            log_pipeline,
            host_keys,
            ephemeral,
        })
    }
}

static GLOBAL_SERVICES: Lazy<RwLock<Option<Services>>> = Lazy::new(|| RwLock::new(None));

/// Registers the process-wide service handles. Intended for top-level
/// wiring only; everything below `main` receives `Services` explicitly.
pub fn set_global_services(services: Services) {
    *GLOBAL_SERVICES.write().expect("services lock") = Some(services);
}

pub fn get_global_services() -> Option<Services> {
    GLOBAL_SERVICES.read().expect("services lock").clone()
}

/// Clears the global handle between tests.
pub fn reset_global_services() {
    *GLOBAL_SERVICES.write().expect("services lock") = None;
}
