mod adapter;
mod messages;
mod prompts;
mod sftp;

use poem::session::Session;
use poem::web::websocket::WebSocket;
use poem::web::Data;
use poem::{handler, IntoResponse, Request};
use serde_json::json;
use tracing::*;
use uuid::Uuid;
use webssh2_core::eventbus::{EventCategory, EventEnvelope, EventPriority};
use webssh2_core::sessions::ClientInfo;
use webssh2_core::Services;

use crate::common::get_seeded;
use adapter::SocketAdapter;

/// `GET /ssh/socket` - the v1/socket WebSocket endpoint. Each upgrade
/// owns one gateway session for its whole life.
#[handler]
pub async fn ws_handler(
    ws: WebSocket,
    request: &Request,
    session: &Session,
    Data(services): Data<&Services>,
) -> impl IntoResponse {
    let services = services.clone();
    let seeded = get_seeded(session, &services).await;
    let client = ClientInfo {
        ip: request
            .remote_addr()
            .as_socket_addr()
            .map(|addr| addr.ip().to_string()),
        port: request
            .remote_addr()
            .as_socket_addr()
            .map(|addr| addr.port()),
        user_agent: request
            .headers()
            .get(poem::http::header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned),
    };

    ws.on_upgrade(move |socket| async move {
        let session_id = Uuid::new_v4();
        services
            .session_store
            .create_session(session_id, client.clone())
            .await;
        let _ = services
            .session_store
            .dispatch(
                session_id,
                webssh2_core::sessions::SessionAction::ClientConnected {
                    ip: client.ip.clone(),
                    port: client.port,
                    user_agent: client.user_agent.clone(),
                },
            )
            .await;

        let task = tokio::spawn(SocketAdapter::run(
            services.clone(),
            session_id,
            client,
            seeded,
            socket,
        ));

        // A panicking session is logged and reclaimed without touching
        // any other session.
        if let Err(join_error) = task.await {
            if join_error.is_panic() {
                error!(
                    event = "crash_recovery",
                    session_id = %session_id,
                    reason = %join_error,
                    "Session task panicked"
                );
                services
                    .event_bus
                    .publish(
                        EventEnvelope::new(
                            EventCategory::System,
                            "crash_recovery",
                            json!({ "error": join_error.to_string() }),
                        )
                        .with_session(session_id)
                        .with_priority(EventPriority::Critical),
                    )
                    .await;
                services.session_store.remove_session(session_id).await;
            }
        }
    })
}
