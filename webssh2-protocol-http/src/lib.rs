mod api;
mod auth;
mod common;
mod error;
mod socket;

use std::net::SocketAddr;

use anyhow::Result;
use poem::listener::TcpListener;
use poem::middleware::Cors;
use poem::session::{CookieConfig, MemoryStorage, ServerSession};
use poem::{get, post, Endpoint, EndpointExt, IntoResponse, Route, Server};
use tracing::*;
use webssh2_core::Services;

pub use common::PROTOCOL_NAME;

pub struct HttpProtocolServer {
    services: Services,
}

impl HttpProtocolServer {
    pub fn new(services: &Services) -> Self {
        Self {
            services: services.clone(),
        }
    }

    pub async fn run(self, address: SocketAddr) -> Result<()> {
        let config = self.services.config.lock().await.store.clone();

        let mut cors = Cors::new();
        if !config.http.origins.iter().any(|o| o == "*:*" || o == "*") {
            for origin in &config.http.origins {
                cors = cors.allow_origin(origin.as_str());
            }
        }

        let app = Route::new()
            .at("/ssh/config", get(api::get_ssh_config))
            .at("/ssh/csrf", get(api::get_csrf_token))
            .at("/ssh/host/:host", get(api::host_route))
            .at("/ssh", post(api::sso_entry))
            .at("/ssh/socket", get(socket::ws_handler))
            .around(|ep, req| async move {
                match ep.call(req).await {
                    Ok(response) => Ok(response.into_response()),
                    Err(err) => Ok(error::error_to_response(err)),
                }
            })
            .with(cors)
            .with(ServerSession::new(
                CookieConfig::default().name(config.session.name.clone()),
                MemoryStorage::default(),
            ))
            .data(self.services.clone());

        info!(event = "server_start", "HTTP endpoint listening on {address}");
        Server::new(TcpListener::bind(address)).run(app).await?;
        Ok(())
    }
}
