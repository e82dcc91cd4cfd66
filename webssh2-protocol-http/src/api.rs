use std::collections::BTreeMap;
use std::collections::HashMap;

use poem::http::StatusCode;
use poem::session::Session;
use poem::web::{Data, Form, Json, Path, Query};
use poem::{handler, IntoResponse, Request, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::*;
use webssh2_core::Services;

use crate::auth::{extract_sso_credentials, is_trusted_proxy, parse_basic_auth};
use crate::common::{csrf_token, set_seeded, SeededCredentials, SeededSession, SessionExt};

/// `GET /ssh/config` - the auth methods the gateway will accept.
#[handler]
pub async fn get_ssh_config(Data(services): Data<&Services>) -> impl IntoResponse {
    let config = services.config.lock().await;
    let methods: Vec<String> = config
        .store
        .ssh
        .allowed_auth_methods
        .iter()
        .cloned()
        .collect();
    Json(json!({ "allowedAuthMethods": methods }))
        .with_header("Cache-Control", "no-store")
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct HostRouteQuery {
    pub port: Option<u16>,
    pub sshterm: Option<String>,
    pub header: Option<String>,
    #[serde(rename = "headerBackground")]
    pub header_background: Option<String>,
    pub env: Option<String>,
}

fn parse_env_query(raw: &str) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    for pair in raw.split(',') {
        if let Some((key, value)) = pair.split_once(':') {
            env.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    webssh2_common::validation::filter_env_pairs(&env)
}

fn basic_auth_challenge() -> Response {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header("WWW-Authenticate", "Basic realm=\"WebSSH2\"")
        .body(())
        .into_response()
}

/// `GET /ssh/host/:host` - seeds target and credentials for the next
/// WebSocket upgrade. Requires HTTP Basic auth.
#[handler]
pub async fn host_route(
    Path(host): Path<String>,
    Query(query): Query<HostRouteQuery>,
    request: &Request,
    session: &Session,
    Data(services): Data<&Services>,
) -> poem::Result<Response> {
    let Some((username, password)) = parse_basic_auth(request) else {
        return Ok(basic_auth_challenge());
    };

    let host = webssh2_common::validation::validate_host(&host)?;
    let port = match query.port {
        Some(port) if port >= 1 => port,
        Some(_) => {
            return Err(webssh2_common::Webssh2Error::Validation(
                "port outside [1, 65535]".into(),
            )
            .into())
        }
        None => services.config.lock().await.store.ssh.port,
    };

    let env = query.env.as_deref().map(parse_env_query).unwrap_or_default();

    let seeded = SeededSession {
        credentials: Some(SeededCredentials {
            host: Some(host.clone()),
            port: Some(port),
            username: Some(username),
            password: Some(password),
            private_key: None,
            passphrase: None,
            term: query.sshterm,
        }),
        header: query.header,
        header_background: query.header_background,
        env,
    };
    set_seeded(session, services, seeded).await;

    debug!(
        target_host = %webssh2_common::validation::escape_host_for_display(&host),
        target_port = port,
        "Seeded session from host route"
    );

    Ok(Json(json!({ "status": "ok", "host": host, "port": port })).into_response())
}

/// `POST /ssh` - single-sign-on entry: credentials arrive in mapped
/// headers (from a trusted proxy) or the form body.
#[handler]
pub async fn sso_entry(
    request: &Request,
    Form(form): Form<HashMap<String, String>>,
    session: &Session,
    Data(services): Data<&Services>,
) -> poem::Result<Response> {
    let config = services.config.lock().await.store.clone();
    if !config.sso.enabled {
        return Ok(StatusCode::NOT_FOUND.into_response());
    }

    let remote_ip = request
        .remote_addr()
        .as_socket_addr()
        .map(|addr| addr.ip());
    if !is_trusted_proxy(remote_ip, &config.sso) {
        warn!(
            client_ip = %remote_ip.map(|ip| ip.to_string()).unwrap_or_default(),
            "SSO request from untrusted source"
        );
        return Ok(StatusCode::FORBIDDEN.into_response());
    }

    if config.sso.csrf_protection {
        let expected = csrf_token(config.session.secret.expose_secret(), &session.csrf_id());
        if form.get("_csrf").map(String::as_str) != Some(expected.as_str()) {
            return Ok(StatusCode::FORBIDDEN.into_response());
        }
    }

    let Some(credentials) = extract_sso_credentials(request, &form, &config.sso) else {
        return Ok(StatusCode::BAD_REQUEST.into_response());
    };

    set_seeded(
        session,
        services,
        SeededSession {
            credentials: Some(credentials),
            header: None,
            header_background: None,
            env: BTreeMap::new(),
        },
    )
    .await;

    Ok(Json(json!({ "status": "ok" })).into_response())
}

/// Returns the CSRF token for the current session so an SSO page can
/// echo it back in the POST body.
#[handler]
pub async fn get_csrf_token(
    session: &Session,
    Data(services): Data<&Services>,
) -> impl IntoResponse {
    let config = services.config.lock().await;
    let token = csrf_token(
        config.store.session.secret.expose_secret(),
        &session.csrf_id(),
    );
    Json(json!({ "token": token }))
        .with_header("Cache-Control", "no-store")
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_env_query() {
        let env = parse_env_query("FOO:bar,BAZ:qux");
        assert_eq!(env.get("FOO").map(String::as_str), Some("bar"));
        assert_eq!(env.get("BAZ").map(String::as_str), Some("qux"));
    }

    #[test]
    fn test_parse_env_query_filters_invalid() {
        let env = parse_env_query("lower:x,GOOD:ok,INJ:a;b,noseparator");
        assert_eq!(env.len(), 1);
        assert!(env.contains_key("GOOD"));
    }
}
