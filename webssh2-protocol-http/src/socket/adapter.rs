//! Per-socket orchestration: owns one session id, routes client frames
//! to the SSH service and SSH events back to the client, and keeps the
//! session store as the single source of truth for observable state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use poem::web::websocket::{Message, WebSocketStream};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tracing::*;
use uuid::Uuid;
use webssh2_common::auth::{
    disallowed_auth_methods, resolve_requested_auth_methods, AuthMethod, Credentials,
};
use webssh2_common::consts::DEFAULT_PROMPT_TIMEOUT;
use webssh2_common::subnets::is_ip_in_subnets;
use webssh2_common::validation::{
    check_dimension, escape_host_for_display, filter_env_pairs, DimensionCheck,
};
use webssh2_common::{SessionId, Webssh2ConfigStore};
use webssh2_core::eventbus::{EventCategory, EventEnvelope};
use webssh2_core::sessions::{ClientInfo, SessionAction};
use webssh2_core::{Services, SessionHostKeys};
use webssh2_protocol_ssh::sftp::SftpService;
use webssh2_protocol_ssh::{
    ChannelOperation, ConnectParams, ConnectionErrorKind, ExecParams, HostKeyPolicy, PtyParams,
    RemoteSshClient, RemoteSshHandles, SshCommand, SshEvent, SshSessionState,
};

use super::messages::*;
use super::prompts::{PromptAnswer, PromptRegistry};
use super::sftp::SftpSubsystem;
use crate::common::SeededSession;

const OUTBOUND_QUEUE: usize = 256;

struct ExecState {
    exited: bool,
}

pub struct SocketAdapter {
    session_id: SessionId,
    services: Services,
    config: Webssh2ConfigStore,
    out_tx: mpsc::Sender<ServerMessage>,
    ssh: Option<RemoteSshHandles>,
    shell_channel: Option<Uuid>,
    execs: HashMap<Uuid, ExecState>,
    sftp: Option<SftpSubsystem>,
    prompts: PromptRegistry,
    pending_ki: Option<oneshot::Sender<Option<Vec<String>>>>,
    auth_in_flight: bool,
    auth_attempts: u32,
    credentials: Option<Credentials>,
    seeded: SeededSession,
    client: ClientInfo,
    /// Host keys the user accepted during this session (client store);
    /// survives reauth and reconnect attempts on the same socket.
    session_host_keys: Arc<SessionHostKeys>,
    closing: bool,
}

impl SocketAdapter {
    pub async fn run(
        services: Services,
        session_id: SessionId,
        client: ClientInfo,
        seeded: SeededSession,
        socket: WebSocketStream,
    ) {
        let config = services.config.lock().await.store.clone();
        let (mut sink, stream) = socket.split();
        let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_QUEUE);

        // Single writer: outbound frames keep publication order, and a
        // full queue is what slow-reader backpressure looks like to the
        // rest of the adapter.
        let writer = tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if sink.send(Message::text(frame.to_frame())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let mut adapter = SocketAdapter {
            session_id,
            config,
            out_tx,
            ssh: None,
            shell_channel: None,
            execs: HashMap::new(),
            sftp: None,
            prompts: PromptRegistry::new(),
            pending_ki: None,
            auth_in_flight: false,
            auth_attempts: 0,
            credentials: None,
            seeded,
            client,
            services,
            session_host_keys: Arc::new(SessionHostKeys::new()),
            closing: false,
        };

        adapter.announce().await;
        adapter.event_loop(stream).await;
        adapter.teardown().await;
        drop(adapter);
        let _ = writer.await;
    }

    async fn announce(&mut self) {
        info!(
            event = "session_start",
            session_id = %self.session_id,
            client_ip = self.client.ip.as_deref().unwrap_or(""),
            "Session started"
        );
        self.services
            .event_bus
            .publish(
                EventEnvelope::new(EventCategory::Session, "session_start", json!({}))
                    .with_session(self.session_id),
            )
            .await;

        // Credentials seeded by the HTTP layer (Basic auth, host route,
        // SSO) authenticate without a client round-trip.
        if let Some(credentials) = self.seeded.credentials() {
            self.start_auth(credentials).await;
        } else {
            self.send(ServerMessage::Authentication(
                AuthenticationPayload::RequestAuth,
            ))
            .await;
        }
    }

    async fn event_loop(&mut self, mut stream: SplitStream<WebSocketStream>) {
        let mut ssh_events: Option<RemoteSshHandles> = None;
        let mut housekeeping = tokio::time::interval(Duration::from_secs(1));

        loop {
            if self.closing {
                break;
            }
            if ssh_events.is_none() {
                ssh_events = self.ssh.take();
            }

            tokio::select! {
                message = stream.next() => {
                    match message {
                        Some(Ok(Message::Text(text))) => {
                            self.handle_frame(&text, &mut ssh_events).await;
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(error)) => {
                            debug!(session=%self.session_id, %error, "WebSocket read error");
                            break;
                        }
                    }
                }
                event = async {
                    match &mut ssh_events {
                        Some(handles) => handles.event_rx.recv().await,
                        None => std::future::pending().await,
                    }
                } => {
                    match event {
                        Some(event) => self.handle_ssh_event(event, &mut ssh_events).await,
                        None => {
                            ssh_events = None;
                        }
                    }
                }
                _ = housekeeping.tick() => {
                    let expired = self.prompts.expire_due();
                    if expired > 0 {
                        debug!(session=%self.session_id, expired, event="prompt_timeout", "Prompts expired");
                    }
                }
            }
        }

        // Put the handles back so teardown can disconnect cleanly.
        if self.ssh.is_none() {
            self.ssh = ssh_events;
        }
    }

    async fn send(&self, message: ServerMessage) {
        let _ = self.out_tx.send(message).await;
    }

    async fn ssherror(&self, message: impl Into<String>) {
        self.send(ServerMessage::SshError(message.into())).await;
    }

    fn ssh_command(&mut self, command: SshCommand, ssh_events: &mut Option<RemoteSshHandles>) {
        let target = ssh_events.as_ref().or(self.ssh.as_ref());
        if let Some(handles) = target {
            let _ = handles.command_tx.send(command);
        }
    }

    // ---- inbound -------------------------------------------------------

    async fn handle_frame(&mut self, text: &str, ssh_events: &mut Option<RemoteSshHandles>) {
        let message = match parse_client_message(text) {
            Ok(ParsedMessage::Known(message)) => message,
            Ok(ParsedMessage::Unknown(event)) => {
                debug!(session=%self.session_id, %event, "Ignoring unknown event");
                return;
            }
            Err(error) => {
                self.ssherror(error.to_string()).await;
                return;
            }
        };

        match message {
            ClientMessage::Authenticate(payload) => {
                match self.credentials_from_payload(payload) {
                    Ok(credentials) => self.start_auth(credentials).await,
                    Err(message) => {
                        self.send(ServerMessage::Authentication(
                            AuthenticationPayload::AuthResult {
                                success: false,
                                message: Some(message),
                            },
                        ))
                        .await;
                    }
                }
            }
            ClientMessage::KeyboardInteractiveResponse(payload) => {
                if let Some(reply) = self.pending_ki.take() {
                    let _ = reply.send(Some(payload.responses));
                }
            }
            ClientMessage::Terminal(payload) => {
                self.handle_terminal(payload, ssh_events).await;
            }
            ClientMessage::Resize(payload) => {
                self.handle_resize(payload, ssh_events).await;
            }
            ClientMessage::Data(data) => {
                if let Some(channel) = self.shell_channel {
                    self.ssh_command(
                        SshCommand::Channel(channel, ChannelOperation::Data(data.into())),
                        ssh_events,
                    );
                }
            }
            ClientMessage::Exec(payload) => {
                self.handle_exec(payload, ssh_events).await;
            }
            ClientMessage::Control(action) => {
                self.handle_control(&action, ssh_events).await;
            }
            ClientMessage::PromptResponse(payload) => {
                self.prompts.resolve(
                    &payload.id,
                    PromptAnswer {
                        action: payload.action,
                        inputs: payload.inputs,
                    },
                );
            }
            ClientMessage::SftpList(p) => self.handle_sftp_list(p, ssh_events).await,
            ClientMessage::SftpStat(p) => self.handle_sftp_stat(p, ssh_events).await,
            ClientMessage::SftpMkdir(p) => self.handle_sftp_op("mkdir", p, ssh_events).await,
            ClientMessage::SftpDelete(p) => self.handle_sftp_op("delete", p, ssh_events).await,
            ClientMessage::SftpUploadStart(p) => self.handle_upload_start(p, ssh_events).await,
            ClientMessage::SftpUploadChunk(p) => self.handle_upload_chunk(p).await,
            ClientMessage::SftpUploadCancel(p) => {
                if let Some(sftp) = &mut self.sftp {
                    sftp.abort_upload(p.transfer_id).await;
                    self.send(ServerMessage::SftpStatus {
                        transfer_id: p.transfer_id,
                        status: "cancelled".into(),
                    })
                    .await;
                }
            }
            ClientMessage::SftpDownloadStart(p) => self.handle_download_start(p, ssh_events).await,
            ClientMessage::SftpDownloadCancel(p) => {
                if let Some(sftp) = &mut self.sftp {
                    sftp.cancel_download(p.transfer_id);
                    self.send(ServerMessage::SftpStatus {
                        transfer_id: p.transfer_id,
                        status: "cancelled".into(),
                    })
                    .await;
                }
            }
        }
    }

    fn credentials_from_payload(&self, payload: AuthenticatePayload) -> Result<Credentials, String> {
        let seeded = self.seeded.credentials();
        let host = payload
            .host
            .or_else(|| seeded.as_ref().map(|c| c.host.clone()))
            .ok_or_else(|| "Invalid credentials".to_string())?;
        let host =
            webssh2_common::validation::validate_host(&host).map_err(|e| e.to_string())?;
        let port = match payload.port {
            Some(value) => {
                let n = value.as_u64().ok_or_else(|| "Invalid credentials".to_string())?;
                webssh2_common::validation::validate_port(n.min(u32::MAX as u64) as u32)
                    .map_err(|e| e.to_string())?
            }
            None => self.config.ssh.port,
        };
        let username = payload
            .username
            .filter(|u| !u.is_empty())
            .ok_or_else(|| "Invalid credentials".to_string())?;

        let dimension = |value: Option<serde_json::Value>| -> Option<u16> {
            value.and_then(|v| match check_dimension(&v) {
                DimensionCheck::Valid(n) => Some(n as u16),
                _ => None,
            })
        };

        Ok(Credentials {
            host,
            port,
            username,
            password: payload.password.map(webssh2_common::Secret::new),
            private_key: payload.private_key.map(webssh2_common::Secret::new),
            passphrase: payload.passphrase.map(webssh2_common::Secret::new),
            term: payload.term,
            cols: dimension(payload.cols),
            rows: dimension(payload.rows),
            keyboard_interactive: payload.keyboard_interactive,
        })
    }

    // ---- authentication ------------------------------------------------

    async fn start_auth(&mut self, credentials: Credentials) {
        if self.auth_in_flight {
            self.send(ServerMessage::AuthFailure {
                error: "auth_in_progress".into(),
                method: None,
            })
            .await;
            return;
        }

        if !credentials.has_usable_auth() {
            self.send(ServerMessage::Authentication(
                AuthenticationPayload::AuthResult {
                    success: false,
                    message: Some("Invalid credentials".into()),
                },
            ))
            .await;
            return;
        }

        let requested = resolve_requested_auth_methods(&credentials);
        let allowed = self.config.allowed_auth_methods();
        let disallowed = disallowed_auth_methods(&requested, &allowed);
        if let Some(method) = disallowed.first() {
            warn!(
                event = "auth_failure",
                session_id = %self.session_id,
                username = %credentials.username,
                error_code = "auth_method_disabled",
                reason = %format!("{method} is disabled"),
                "Auth method disabled by policy"
            );
            self.send(ServerMessage::AuthFailure {
                error: "auth_method_disabled".into(),
                method: Some(method.to_string()),
            })
            .await;
            self.closing = true;
            return;
        }

        if !self.config.ssh.allowed_subnets.is_empty()
            && !self.target_in_allowed_subnets(&credentials).await
        {
            self.send(ServerMessage::ConnectionError(ConnectionErrorPayload {
                message: format!(
                    "Host {} is not in an allowed subnet",
                    escape_host_for_display(&credentials.host)
                ),
                kind: "network".into(),
                code: Some("HOST_NOT_ALLOWED".into()),
                host: Some(credentials.host.clone()),
                port: Some(credentials.port),
                details: None,
            }))
            .await;
            self.closing = true;
            return;
        }

        info!(
            event = "auth_attempt",
            session_id = %self.session_id,
            username = %credentials.username,
            target_host = %credentials.host,
            target_port = credentials.port,
            "Authenticating"
        );

        self.auth_in_flight = true;
        let _ = self
            .services
            .session_store
            .dispatch(
                self.session_id,
                SessionAction::ConnectionStart {
                    host: credentials.host.clone(),
                    port: credentials.port,
                },
            )
            .await;

        let params = ConnectParams::from_config(credentials.clone(), &self.config.ssh);
        self.credentials = Some(credentials);

        let handles = RemoteSshClient::create(
            self.session_id,
            HostKeyPolicy {
                config: self.config.host_key_verification.clone(),
                store: Some(self.services.host_keys.clone()),
                session_keys: self.session_host_keys.clone(),
            },
        );
        let _ = handles.command_tx.send(SshCommand::Connect(Box::new(params)));
        self.ssh = Some(handles);
    }

    /// Resolves the target and checks every address against the
    /// configured allow-list.
    async fn target_in_allowed_subnets(&self, credentials: &Credentials) -> bool {
        let target = format!("{}:{}", credentials.host, credentials.port);
        match tokio::net::lookup_host(target).await {
            Ok(addrs) => {
                let subnets = &self.config.ssh.allowed_subnets;
                let mut any = false;
                for addr in addrs {
                    any = true;
                    if !is_ip_in_subnets(addr.ip(), subnets) {
                        return false;
                    }
                }
                any
            }
            Err(_) => false,
        }
    }

    async fn on_connected(&mut self) {
        self.auth_in_flight = false;
        self.auth_attempts = 0;

        let Some(credentials) = self.credentials.clone() else {
            return;
        };
        let method = resolve_requested_auth_methods(&credentials)
            .first()
            .copied()
            .unwrap_or(AuthMethod::KeyboardInteractive);

        let now = Utc::now();
        let _ = self
            .services
            .session_store
            .dispatch(
                self.session_id,
                SessionAction::AuthSuccess {
                    method,
                    username: credentials.username.clone(),
                    at: now,
                },
            )
            .await;
        let _ = self
            .services
            .session_store
            .dispatch(
                self.session_id,
                SessionAction::ConnectionEstablished {
                    connection_id: Uuid::new_v4(),
                    at: now,
                },
            )
            .await;

        info!(
            event = "auth_success",
            session_id = %self.session_id,
            username = %credentials.username,
            target_host = %credentials.host,
            status = "success",
            "Authenticated"
        );
        self.services
            .event_bus
            .publish(
                EventEnvelope::new(
                    EventCategory::Auth,
                    "auth_success",
                    json!({"username": credentials.username}),
                )
                .with_session(self.session_id),
            )
            .await;

        self.send(ServerMessage::Authentication(
            AuthenticationPayload::AuthResult {
                success: true,
                message: None,
            },
        ))
        .await;
        self.send(ServerMessage::Permissions(PermissionsPayload {
            allow_replay: self.config.options.allow_replay,
            allow_reconnect: self.config.options.allow_reconnect,
            allow_reauth: self.config.options.allow_reauth,
            auto_log: self.config.options.auto_log,
        }))
        .await;
        if let Some(header) = self.seeded.header.clone() {
            self.send(ServerMessage::UpdateUi {
                element: "header".into(),
                value: header,
            })
            .await;
        }
        if let Some(background) = self.seeded.header_background.clone() {
            self.send(ServerMessage::UpdateUi {
                element: "headerBackground".into(),
                value: background,
            })
            .await;
        }
        self.send(ServerMessage::GetTerminal(true)).await;
    }

    async fn on_connection_error(
        &mut self,
        classified: webssh2_protocol_ssh::ClassifiedError,
        ssh_events: &mut Option<RemoteSshHandles>,
    ) {
        self.auth_in_flight = false;
        *ssh_events = None;
        self.ssh = None;
        self.shell_channel = None;

        match classified.kind {
            ConnectionErrorKind::Auth => {
                self.auth_attempts += 1;
                let _ = self
                    .services
                    .session_store
                    .dispatch(
                        self.session_id,
                        SessionAction::AuthFailure {
                            error: classified.message.clone(),
                            at: Utc::now(),
                        },
                    )
                    .await;
                warn!(
                    event = "auth_failure",
                    session_id = %self.session_id,
                    status = "failure",
                    reason = %classified.message,
                    "Authentication failed"
                );
                self.send(ServerMessage::Authentication(
                    AuthenticationPayload::AuthResult {
                        success: false,
                        message: Some(classified.message),
                    },
                ))
                .await;
                if self.auth_attempts >= self.config.ssh.max_auth_attempts {
                    self.closing = true;
                } else {
                    self.send(ServerMessage::Authentication(
                        AuthenticationPayload::RequestAuth,
                    ))
                    .await;
                }
            }
            kind => {
                let _ = self
                    .services
                    .session_store
                    .dispatch(
                        self.session_id,
                        SessionAction::ConnectionError {
                            error: classified.message.clone(),
                        },
                    )
                    .await;
                error!(
                    event = "connection_error",
                    session_id = %self.session_id,
                    reason = %classified.message,
                    "Connection error"
                );
                let credentials = self.credentials.as_ref();
                self.send(ServerMessage::ConnectionError(ConnectionErrorPayload {
                    message: classified.message,
                    kind: kind.as_str().into(),
                    code: classified.code.map(str::to_owned),
                    host: credentials.map(|c| c.host.clone()),
                    port: credentials.map(|c| c.port),
                    details: None,
                }))
                .await;
                self.closing = true;
            }
        }
    }

    // ---- terminal / shell ----------------------------------------------

    async fn handle_terminal(
        &mut self,
        payload: TerminalPayload,
        ssh_events: &mut Option<RemoteSshHandles>,
    ) {
        let rows = payload.rows.as_ref().map(check_dimension);
        let cols = payload.cols.as_ref().map(check_dimension);
        if matches!(rows, Some(DimensionCheck::OutOfRange))
            || matches!(cols, Some(DimensionCheck::OutOfRange))
        {
            self.ssherror("Invalid terminal dimensions").await;
            return;
        }
        let rows = match rows {
            Some(DimensionCheck::Valid(n)) => Some(n),
            _ => None,
        };
        let cols = match cols {
            Some(DimensionCheck::Valid(n)) => Some(n),
            _ => None,
        };

        let environment = filter_env_pairs(&payload.env);
        let _ = self
            .services
            .session_store
            .dispatch(
                self.session_id,
                SessionAction::TerminalInit {
                    term: payload.term.clone(),
                    rows,
                    cols,
                },
            )
            .await;
        if !environment.is_empty() {
            let _ = self
                .services
                .session_store
                .dispatch(
                    self.session_id,
                    SessionAction::TerminalUpdateEnv { environment },
                )
                .await;
        }
        if let Some(cwd) = payload.cwd {
            let _ = self
                .services
                .session_store
                .dispatch(self.session_id, SessionAction::TerminalSetCwd { cwd })
                .await;
        }

        if self.shell_channel.is_none() && self.connected(ssh_events) {
            self.open_shell(ssh_events).await;
        }
    }

    fn connected(&self, ssh_events: &Option<RemoteSshHandles>) -> bool {
        (self.ssh.is_some() || ssh_events.is_some()) && !self.auth_in_flight
    }

    async fn open_shell(&mut self, ssh_events: &mut Option<RemoteSshHandles>) {
        let Some(state) = self.services.session_store.get_state(self.session_id).await else {
            return;
        };
        let channel_id = Uuid::new_v4();
        self.shell_channel = Some(channel_id);

        let pty = PtyParams {
            term: state
                .terminal
                .term
                .clone()
                .unwrap_or_else(|| self.config.ssh.term.clone()),
            cols: state.terminal.cols,
            rows: state.terminal.rows,
            pix_width: 0,
            pix_height: 0,
        };
        let env: Vec<(String, String)> = state
            .terminal
            .environment
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        info!(
            event = "shell_open",
            session_id = %self.session_id,
            "Opening shell"
        );
        self.ssh_command(
            SshCommand::OpenShell {
                channel_id,
                pty,
                env,
            },
            ssh_events,
        );
    }

    async fn handle_resize(
        &mut self,
        payload: ResizePayload,
        ssh_events: &mut Option<RemoteSshHandles>,
    ) {
        let rows = check_dimension(&payload.rows);
        let cols = check_dimension(&payload.cols);
        match (rows, cols) {
            (DimensionCheck::Valid(rows), DimensionCheck::Valid(cols)) => {
                let _ = self
                    .services
                    .session_store
                    .dispatch(self.session_id, SessionAction::TerminalResize { rows, cols })
                    .await;
                if let Some(channel) = self.shell_channel {
                    self.ssh_command(
                        SshCommand::Channel(channel, ChannelOperation::Resize { cols, rows }),
                        ssh_events,
                    );
                }
            }
            (DimensionCheck::NotANumber, _) | (_, DimensionCheck::NotANumber) => {
                // Garbage geometry is silently dropped.
            }
            _ => {
                self.ssherror("Invalid terminal dimensions").await;
            }
        }
    }

    async fn handle_exec(
        &mut self,
        payload: ExecPayload,
        ssh_events: &mut Option<RemoteSshHandles>,
    ) {
        if !self.connected(ssh_events) {
            self.ssherror("Not connected").await;
            return;
        }
        let channel_id = Uuid::new_v4();
        self.execs.insert(channel_id, ExecState { exited: false });

        let pty = payload.pty.then(|| {
            let dimension = |value: Option<serde_json::Value>, fallback: u32| {
                value
                    .and_then(|v| match check_dimension(&v) {
                        DimensionCheck::Valid(n) => Some(n),
                        _ => None,
                    })
                    .unwrap_or(fallback)
            };
            PtyParams {
                term: payload
                    .term
                    .clone()
                    .unwrap_or_else(|| self.config.ssh.term.clone()),
                cols: dimension(payload.cols.clone(), 80),
                rows: dimension(payload.rows.clone(), 24),
                pix_width: 0,
                pix_height: 0,
            }
        });

        let env = filter_env_pairs(&payload.env);
        info!(
            event = "exec_start",
            session_id = %self.session_id,
            subsystem = "exec",
            "Executing command"
        );
        self.ssh_command(
            SshCommand::OpenExec {
                channel_id,
                params: ExecParams {
                    command: payload.command,
                    pty,
                    env,
                },
            },
            ssh_events,
        );

        if let Some(timeout_ms) = payload.timeout_ms {
            let command_tx = ssh_events
                .as_ref()
                .or(self.ssh.as_ref())
                .map(|h| h.command_tx.clone());
            if let Some(command_tx) = command_tx {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
                    let _ = command_tx
                        .send(SshCommand::Channel(channel_id, ChannelOperation::Close));
                });
            }
        }
    }

    // ---- control actions -----------------------------------------------

    async fn handle_control(&mut self, action: &str, ssh_events: &mut Option<RemoteSshHandles>) {
        match action {
            "reauth" => {
                if !self.config.options.allow_reauth {
                    self.ssherror("Reauthentication is disabled").await;
                    return;
                }
                self.send(ServerMessage::Authentication(AuthenticationPayload::Reauth))
                    .await;
                let _ = self
                    .services
                    .session_store
                    .dispatch(self.session_id, SessionAction::AuthLogout)
                    .await;
                info!(event = "auth_logout", session_id = %self.session_id, "Reauth requested");
                self.credentials = None;
                self.shell_channel = None;
                self.sftp = None;
                self.ssh_command(SshCommand::Disconnect, ssh_events);
                *ssh_events = None;
                self.ssh = None;
                // The socket stays open for the next `authenticate`.
            }
            "replayCredentials" => {
                let password = self
                    .credentials
                    .as_ref()
                    .and_then(|c| c.password.as_ref())
                    .map(|p| p.expose_secret().clone());
                match (self.config.options.allow_replay, password, self.shell_channel) {
                    (true, Some(password), Some(channel)) => {
                        let line_ending = if self.config.options.replay_crlf {
                            "\r\n"
                        } else {
                            "\n"
                        };
                        info!(event = "replay_credentials", session_id = %self.session_id, "Replaying credentials");
                        self.ssh_command(
                            SshCommand::Channel(
                                channel,
                                ChannelOperation::Data(
                                    format!("{password}{line_ending}").into(),
                                ),
                            ),
                            ssh_events,
                        );
                    }
                    _ => {
                        self.ssherror("Credential replay is not available").await;
                    }
                }
            }
            "clear-credentials" => {
                self.credentials = None;
                self.seeded.clear_credentials();
            }
            "disconnect" => {
                self.closing = true;
            }
            other => {
                // Unknown control actions never crash the session.
                debug!(session=%self.session_id, action=%other, "Ignoring unknown control action");
            }
        }
    }

    // ---- SSH events ----------------------------------------------------

    async fn handle_ssh_event(
        &mut self,
        event: SshEvent,
        ssh_events: &mut Option<RemoteSshHandles>,
    ) {
        match event {
            SshEvent::State(SshSessionState::Connected) => {
                self.on_connected().await;
            }
            SshEvent::State(_) => {}
            SshEvent::ConnectionError(classified) => {
                self.on_connection_error(classified, ssh_events).await;
            }
            SshEvent::AlgorithmMismatch(analysis) => {
                warn!(
                    event = "algorithm_mismatch",
                    session_id = %self.session_id,
                    reason = %analysis
                        .mismatches
                        .iter()
                        .map(|m| m.suggested_env.clone())
                        .collect::<Vec<_>>()
                        .join(" "),
                    "Algorithm negotiation mismatch"
                );
                let suggestions: Vec<String> = analysis
                    .mismatches
                    .iter()
                    .map(|m| m.suggested_env.clone())
                    .collect();
                let preset = analysis.suggested_preset.map(|p| p.as_str().to_string());
                self.send(ServerMessage::SshError(format!(
                    "No compatible algorithms; try preset {} or {}",
                    preset.as_deref().unwrap_or("legacy"),
                    suggestions.join(", ")
                )))
                .await;
            }
            SshEvent::HostKeyReceived { algorithm, fingerprint } => {
                debug!(
                    session=%self.session_id,
                    %algorithm,
                    %fingerprint,
                    "Server host key received"
                );
            }
            SshEvent::HostKeyUnknown {
                algorithm,
                fingerprint,
                reply,
                ..
            } => {
                self.prompt_host_key(
                    "warning",
                    "Unknown host key",
                    format!(
                        "The host presented an unrecognized {algorithm} key with \
                         fingerprint {fingerprint}. Connect anyway?"
                    ),
                    reply,
                )
                .await;
            }
            SshEvent::HostKeyMismatch {
                algorithm,
                received_fingerprint,
                known_fingerprint,
                reply,
                ..
            } => {
                warn!(
                    event = "host_key_mismatch",
                    session_id = %self.session_id,
                    reason = %format!("{received_fingerprint} != {known_fingerprint}"),
                    "Host key mismatch"
                );
                self.prompt_host_key(
                    "error",
                    "Host key changed",
                    format!(
                        "The {algorithm} key presented by the host ({received_fingerprint}) \
                         does not match the stored key ({known_fingerprint}). This can \
                         indicate a man-in-the-middle attack. Connect anyway?"
                    ),
                    reply,
                )
                .await;
            }
            SshEvent::KeyboardInteractive {
                name,
                instructions,
                prompts,
                reply,
            } => {
                self.pending_ki = Some(reply);
                self.send(ServerMessage::Authentication(
                    AuthenticationPayload::KeyboardInteractive {
                        name,
                        instructions,
                        prompts: prompts
                            .into_iter()
                            .map(|p| KiPromptPayload {
                                prompt: p.prompt,
                                echo: p.echo,
                            })
                            .collect(),
                    },
                ))
                .await;
            }
            SshEvent::Output { channel, data } => {
                if Some(channel) == self.shell_channel {
                    self.send(ServerMessage::Data(
                        String::from_utf8_lossy(&data).into_owned(),
                    ))
                    .await;
                } else if self.execs.contains_key(&channel) {
                    self.send(ServerMessage::ExecData {
                        stream: "stdout".into(),
                        data: String::from_utf8_lossy(&data).into_owned(),
                    })
                    .await;
                }
            }
            SshEvent::ExtendedData { channel, data, .. } => {
                if self.execs.contains_key(&channel) {
                    self.send(ServerMessage::ExecData {
                        stream: "stderr".into(),
                        data: String::from_utf8_lossy(&data).into_owned(),
                    })
                    .await;
                } else if Some(channel) == self.shell_channel {
                    self.send(ServerMessage::Data(
                        String::from_utf8_lossy(&data).into_owned(),
                    ))
                    .await;
                }
            }
            SshEvent::ExitStatus { channel, code } => {
                if let Some(exec) = self.execs.get_mut(&channel) {
                    if !exec.exited {
                        exec.exited = true;
                        info!(
                            event = "exec_exit",
                            session_id = %self.session_id,
                            subsystem = "exec",
                            "Command exited"
                        );
                        self.send(ServerMessage::ExecExit {
                            code: Some(code),
                            signal: None,
                        })
                        .await;
                    }
                }
            }
            SshEvent::ExitSignal {
                channel, signal, ..
            } => {
                if let Some(exec) = self.execs.get_mut(&channel) {
                    if !exec.exited {
                        exec.exited = true;
                        self.send(ServerMessage::ExecExit {
                            code: None,
                            signal: Some(signal),
                        })
                        .await;
                    }
                }
            }
            SshEvent::Eof(_) => {}
            SshEvent::Close(channel) => {
                if Some(channel) == self.shell_channel {
                    info!(event = "shell_close", session_id = %self.session_id, "Shell closed");
                    let _ = self
                        .services
                        .session_store
                        .dispatch(self.session_id, SessionAction::ConnectionClosed)
                        .await;
                    self.closing = true;
                } else if let Some(exec) = self.execs.remove(&channel) {
                    if !exec.exited {
                        self.send(ServerMessage::ExecExit {
                            code: None,
                            signal: None,
                        })
                        .await;
                    }
                }
            }
            SshEvent::Done => {
                *ssh_events = None;
                self.ssh = None;
            }
        }
    }

    async fn prompt_host_key(
        &mut self,
        severity: &str,
        title: &str,
        message: String,
        reply: oneshot::Sender<bool>,
    ) {
        let registered = self.prompts.register(Some(DEFAULT_PROMPT_TIMEOUT));
        let (id, rx) = match registered {
            Ok(pair) => pair,
            Err(_) => {
                let _ = reply.send(false);
                return;
            }
        };
        self.send(ServerMessage::Prompt(PromptPayload {
            id,
            severity: severity.into(),
            title: title.into(),
            message,
            inputs: vec![],
            actions: vec!["confirm".into(), "dismiss".into()],
            timeout_ms: DEFAULT_PROMPT_TIMEOUT.as_millis() as u64,
        }))
        .await;

        tokio::spawn(async move {
            let accepted = matches!(rx.await, Ok(answer) if answer.action == "confirm");
            let _ = reply.send(accepted);
        });
    }

    // ---- SFTP ----------------------------------------------------------

    async fn ensure_sftp(&mut self, ssh_events: &mut Option<RemoteSshHandles>) -> bool {
        if self.sftp.is_some() {
            return true;
        }
        if !self.connected(ssh_events) {
            self.send(ServerMessage::SftpError {
                transfer_id: None,
                message: "Not connected".into(),
            })
            .await;
            return false;
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.ssh_command(SshCommand::OpenSftp { reply: reply_tx }, ssh_events);
        match reply_rx.await {
            Ok(Ok(session)) => {
                info!(event = "sftp_open", session_id = %self.session_id, subsystem = "sftp", "SFTP subsystem opened");
                self.sftp = Some(SftpSubsystem::new(
                    SftpService::new(session),
                    self.config.sftp.max_file_size,
                ));
                true
            }
            Ok(Err(error)) => {
                self.send(ServerMessage::SftpError {
                    transfer_id: None,
                    message: error.to_string(),
                })
                .await;
                false
            }
            Err(_) => {
                self.send(ServerMessage::SftpError {
                    transfer_id: None,
                    message: "SFTP subsystem unavailable".into(),
                })
                .await;
                false
            }
        }
    }

    async fn handle_sftp_list(
        &mut self,
        payload: SftpPathPayload,
        ssh_events: &mut Option<RemoteSshHandles>,
    ) {
        if !self.ensure_sftp(ssh_events).await {
            return;
        }
        let Some(sftp) = self.sftp.as_ref() else {
            return;
        };
        match sftp.service().list(&payload.path).await {
            Ok(entries) => {
                self.send(ServerMessage::SftpDirectory(SftpDirectoryPayload {
                    path: payload.path,
                    entries: serde_json::to_value(entries).unwrap_or_default(),
                }))
                .await;
            }
            Err(error) => {
                self.send(ServerMessage::SftpError {
                    transfer_id: None,
                    message: error.to_string(),
                })
                .await;
            }
        }
    }

    async fn handle_sftp_stat(
        &mut self,
        payload: SftpPathPayload,
        ssh_events: &mut Option<RemoteSshHandles>,
    ) {
        if !self.ensure_sftp(ssh_events).await {
            return;
        }
        let Some(sftp) = self.sftp.as_ref() else {
            return;
        };
        match sftp.service().stat(&payload.path).await {
            Ok(entry) => {
                self.send(ServerMessage::SftpStatResult(
                    serde_json::to_value(entry).unwrap_or_default(),
                ))
                .await;
            }
            Err(error) => {
                self.send(ServerMessage::SftpError {
                    transfer_id: None,
                    message: error.to_string(),
                })
                .await;
            }
        }
    }

    async fn handle_sftp_op(
        &mut self,
        operation: &str,
        payload: SftpPathPayload,
        ssh_events: &mut Option<RemoteSshHandles>,
    ) {
        if !self.ensure_sftp(ssh_events).await {
            return;
        }
        let Some(sftp) = self.sftp.as_ref() else {
            return;
        };
        let result = match operation {
            "mkdir" => sftp.service().mkdir(&payload.path).await,
            _ => sftp.service().remove(&payload.path).await,
        };
        let (success, message) = match result {
            Ok(()) => (true, None),
            Err(error) => (false, Some(error.to_string())),
        };
        self.send(ServerMessage::SftpOperationResult(
            SftpOperationResultPayload {
                operation: operation.into(),
                path: payload.path,
                success,
                message,
            },
        ))
        .await;
    }

    async fn handle_upload_start(
        &mut self,
        payload: SftpUploadStartPayload,
        ssh_events: &mut Option<RemoteSshHandles>,
    ) {
        if payload.transfer_id.is_some() {
            // Transfer ids are server-generated; a client supplying one
            // is silently refused.
            debug!(session=%self.session_id, "Dropping upload-start with client transfer id");
            return;
        }
        if !self.ensure_sftp(ssh_events).await {
            return;
        }
        let Some(sftp) = self.sftp.as_mut() else {
            return;
        };
        match sftp
            .begin_upload(
                &payload.remote_path,
                &payload.file_name,
                payload.file_size,
                payload.overwrite,
            )
            .await
        {
            Ok(ready) => {
                info!(
                    event = "sftp_upload",
                    session_id = %self.session_id,
                    subsystem = "sftp",
                    bytes_in = payload.file_size,
                    "Upload started"
                );
                self.send(ready).await;
            }
            Err(message) => {
                self.send(ServerMessage::SftpError {
                    transfer_id: None,
                    message,
                })
                .await;
            }
        }
    }

    async fn handle_upload_chunk(&mut self, payload: SftpUploadChunkPayload) {
        let Some(sftp) = &mut self.sftp else {
            return;
        };
        match sftp
            .upload_chunk(payload.transfer_id, payload.seq, &payload.data)
            .await
        {
            Ok(frames) => {
                for frame in frames {
                    self.send(frame).await;
                }
            }
            Err(message) => {
                self.send(ServerMessage::SftpError {
                    transfer_id: Some(payload.transfer_id),
                    message,
                })
                .await;
            }
        }
    }

    async fn handle_download_start(
        &mut self,
        payload: SftpDownloadStartPayload,
        ssh_events: &mut Option<RemoteSshHandles>,
    ) {
        if payload.transfer_id.is_some() {
            debug!(session=%self.session_id, "Dropping download-start with client transfer id");
            return;
        }
        if !self.ensure_sftp(ssh_events).await {
            return;
        }
        let out = self.out_tx.clone();
        let Some(sftp) = self.sftp.as_mut() else {
            return;
        };
        match sftp.begin_download(&payload.remote_path, out).await {
            Ok(ready) => {
                info!(
                    event = "sftp_download",
                    session_id = %self.session_id,
                    subsystem = "sftp",
                    "Download started"
                );
                self.send(ready).await;
            }
            Err(message) => {
                self.send(ServerMessage::SftpError {
                    transfer_id: None,
                    message,
                })
                .await;
            }
        }
    }

    // ---- teardown ------------------------------------------------------

    async fn teardown(&mut self) {
        if let Some(sftp) = &mut self.sftp {
            sftp.cancel_all().await;
        }
        self.sftp = None;
        self.prompts.clear();

        if let Some(handles) = &self.ssh {
            let _ = handles.command_tx.send(SshCommand::Disconnect);
        }
        self.ssh = None;

        let _ = self
            .services
            .session_store
            .dispatch(self.session_id, SessionAction::TerminalDestroy)
            .await;
        let _ = self
            .services
            .session_store
            .dispatch(self.session_id, SessionAction::ConnectionClosed)
            .await;
        self.services
            .session_store
            .remove_session(self.session_id)
            .await;

        info!(
            event = "session_end",
            session_id = %self.session_id,
            "Session ended"
        );
        self.services
            .event_bus
            .publish(
                EventEnvelope::new(EventCategory::Session, "session_end", json!({}))
                    .with_session(self.session_id),
            )
            .await;
    }
}
