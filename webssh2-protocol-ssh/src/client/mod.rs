mod channel;
mod error;
mod handler;
mod keys;

use std::collections::HashMap;
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use channel::ChannelTask;
pub use error::{ClassifiedError, ConnectionError, ConnectionErrorKind, SshClientError};
use futures::pin_mut;
pub use handler::HostKeyPolicy;
use handler::{ClientHandler, ClientHandlerError, ClientHandlerEvent};
use russh::client::{Handle, KeyboardInteractiveAuthResponse};
use russh::keys::key::PrivateKeyWithHashAlg;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::*;
use uuid::Uuid;
use webssh2_common::auth::is_encrypted_private_key;
use webssh2_common::SessionId;

use crate::algorithms::{
    preferred_for, preset_algorithms, AlgorithmAnalysis, AlgorithmCapture, AlgorithmCategory,
    AlgorithmSource,
};
use crate::common::{ConnectParams, ExecParams, KeyboardInteractivePrompt, PtyParams};

pub use self::error::classify;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SshSessionState {
    NotInitialized,
    Connecting,
    Connected,
    Disconnected,
}

/// Operations on an open channel, forwarded to its owning task.
#[derive(Clone, Debug)]
pub enum ChannelOperation {
    RequestPty(PtyParams),
    RequestEnv(String, String),
    RequestShell,
    RequestExec(String),
    Data(Bytes),
    Resize { cols: u32, rows: u32 },
    Signal(String),
    Eof,
    Close,
}

pub enum SshCommand {
    Connect(Box<ConnectParams>),
    OpenShell {
        channel_id: Uuid,
        pty: PtyParams,
        env: Vec<(String, String)>,
    },
    OpenExec {
        channel_id: Uuid,
        params: ExecParams,
    },
    OpenSftp {
        reply: oneshot::Sender<Result<russh_sftp::client::SftpSession, SshClientError>>,
    },
    Channel(Uuid, ChannelOperation),
    Disconnect,
}

#[derive(Debug)]
pub enum SshEvent {
    State(SshSessionState),
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
    KeyboardInteractive {
        name: String,
        instructions: String,
        prompts: Vec<KeyboardInteractivePrompt>,
        reply: oneshot::Sender<Option<Vec<String>>>,
    },
    Output {
        channel: Uuid,
        data: Bytes,
    },
    ExtendedData {
        channel: Uuid,
        ext: u32,
        data: Bytes,
    },
    ExitStatus {
        channel: Uuid,
        code: u32,
    },
    ExitSignal {
        channel: Uuid,
        signal: String,
        core_dumped: bool,
        error_message: String,
    },
    Eof(Uuid),
    Close(Uuid),
    ConnectionError(ClassifiedError),
    AlgorithmMismatch(AlgorithmAnalysis),
    Done,
}

enum InnerEvent {
    Command(SshCommand),
    HandlerEvent(ClientHandlerEvent),
}

pub struct RemoteSshHandles {
    pub event_rx: UnboundedReceiver<SshEvent>,
    pub command_tx: UnboundedSender<SshCommand>,
    pub abort_tx: UnboundedSender<()>,
}

/// Owner of one upstream SSH connection. Lives on its own task; the
/// socket adapter drives it through the command channel and reads typed
/// events back.
pub struct RemoteSshClient {
    session_id: SessionId,
    tx: UnboundedSender<SshEvent>,
    session: Option<Handle<ClientHandler>>,
    channel_pipes: HashMap<Uuid, UnboundedSender<ChannelOperation>>,
    pending_ops: Vec<(Uuid, ChannelOperation)>,
    state: SshSessionState,
    abort_rx: UnboundedReceiver<()>,
    inner_rx: UnboundedReceiver<InnerEvent>,
    inner_tx: UnboundedSender<InnerEvent>,
    child_tasks: Vec<JoinHandle<Result<(), SshClientError>>>,
    policy: HostKeyPolicy,
    capture: AlgorithmCapture,
}

impl RemoteSshClient {
    pub fn create(session_id: SessionId, policy: HostKeyPolicy) -> RemoteSshHandles {
        let (event_tx, event_rx) = unbounded_channel();
        let (command_tx, mut command_rx) = unbounded_channel();
        let (abort_tx, abort_rx) = unbounded_channel();
        let (inner_tx, inner_rx) = unbounded_channel();

        let this = Self {
            session_id,
            tx: event_tx,
            session: None,
            channel_pipes: HashMap::new(),
            pending_ops: vec![],
            state: SshSessionState::NotInitialized,
            abort_rx,
            inner_rx,
            inner_tx: inner_tx.clone(),
            child_tasks: vec![],
            policy,
            capture: AlgorithmCapture::new(),
        };

        tokio::spawn(
            async move {
                while let Some(command) = command_rx.recv().await {
                    if inner_tx.send(InnerEvent::Command(command)).is_err() {
                        break;
                    }
                }
            }
            .instrument(Span::current()),
        );

        let _ = this.start();

        RemoteSshHandles {
            event_rx,
            command_tx,
            abort_tx,
        }
    }

    fn start(mut self) -> JoinHandle<anyhow::Result<()>> {
        tokio::spawn(
            async move {
                let result = async {
                    loop {
                        tokio::select! {
                            Some(event) = self.inner_rx.recv() => {
                                if self.handle_inner_event(event).await? {
                                    break;
                                }
                            }
                            Some(_) = self.abort_rx.recv() => {
                                debug!(session=%self.session_id, "Abort requested");
                                self.disconnect().await;
                                break;
                            }
                        }
                    }
                    Ok::<(), anyhow::Error>(())
                }
                .await;

                if let Err(error) = result {
                    error!(session=%self.session_id, ?error, "Error in SSH command loop");
                }
                info!(session=%self.session_id, "SSH client session closed");
                Ok(())
            }
            .instrument(Span::current()),
        )
    }

    async fn handle_inner_event(&mut self, event: InnerEvent) -> anyhow::Result<bool> {
        match event {
            InnerEvent::Command(command) => self.handle_command(command).await,
            InnerEvent::HandlerEvent(event) => {
                match event {
                    ClientHandlerEvent::Disconnect => {
                        self.set_disconnected();
                        return Ok(true);
                    }
                    event => {
                        // Host-key events mid-session only occur during
                        // rekeying; relay them like during connect.
                        self.relay_handler_event(event);
                    }
                }
                Ok(false)
            }
        }
    }

    fn relay_handler_event(&mut self, event: ClientHandlerEvent) {
        let mapped = match event {
            ClientHandlerEvent::HostKeyReceived {
                algorithm,
                fingerprint,
            } => SshEvent::HostKeyReceived {
                algorithm,
                fingerprint,
            },
            ClientHandlerEvent::HostKeyUnknown {
                algorithm,
                key_base64,
                fingerprint,
                reply,
            } => SshEvent::HostKeyUnknown {
                algorithm,
                key_base64,
                fingerprint,
                reply,
            },
            ClientHandlerEvent::HostKeyMismatch {
                algorithm,
                received_key_base64,
                received_fingerprint,
                known_key_base64,
                known_fingerprint,
                reply,
            } => SshEvent::HostKeyMismatch {
                algorithm,
                received_key_base64,
                received_fingerprint,
                known_key_base64,
                known_fingerprint,
                reply,
            },
            ClientHandlerEvent::Disconnect => return,
        };
        let _ = self.tx.send(mapped);
    }

    async fn handle_command(&mut self, command: SshCommand) -> anyhow::Result<bool> {
        match command {
            SshCommand::Connect(params) => match self.connect(*params).await {
                Ok(()) => {
                    self.set_state(SshSessionState::Connected);
                    let ops = std::mem::take(&mut self.pending_ops);
                    for (id, op) in ops {
                        self.apply_channel_op(id, op).await?;
                    }
                }
                Err(error) => {
                    debug!(session=%self.session_id, %error, "Connect error");
                    if let Some(analysis) = self.capture.analyze() {
                        let _ = self.tx.send(SshEvent::AlgorithmMismatch(analysis));
                    }
                    let _ = self.tx.send(SshEvent::ConnectionError(classify(&error)));
                    self.set_disconnected();
                    return Ok(true);
                }
            },
            SshCommand::OpenShell {
                channel_id,
                pty,
                env,
            } => {
                self.open_channel(channel_id).await?;
                self.apply_channel_op(channel_id, ChannelOperation::RequestPty(pty))
                    .await?;
                for (name, value) in env {
                    self.apply_channel_op(channel_id, ChannelOperation::RequestEnv(name, value))
                        .await?;
                }
                self.apply_channel_op(channel_id, ChannelOperation::RequestShell)
                    .await?;
            }
            SshCommand::OpenExec { channel_id, params } => {
                self.open_channel(channel_id).await?;
                if let Some(pty) = params.pty {
                    self.apply_channel_op(channel_id, ChannelOperation::RequestPty(pty))
                        .await?;
                }
                for (name, value) in params.env {
                    self.apply_channel_op(channel_id, ChannelOperation::RequestEnv(name, value))
                        .await?;
                }
                self.apply_channel_op(channel_id, ChannelOperation::RequestExec(params.command))
                    .await?;
            }
            SshCommand::OpenSftp { reply } => {
                let result = self.open_sftp().await;
                let _ = reply.send(result);
            }
            SshCommand::Channel(id, op) => {
                self.apply_channel_op(id, op).await?;
            }
            SshCommand::Disconnect => {
                self.disconnect().await;
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn apply_channel_op(
        &mut self,
        channel_id: Uuid,
        op: ChannelOperation,
    ) -> anyhow::Result<()> {
        if self.state != SshSessionState::Connected {
            self.pending_ops.push((channel_id, op));
            return Ok(());
        }
        match self.channel_pipes.get(&channel_id) {
            Some(tx) => {
                if tx.send(op).is_err() {
                    self.channel_pipes.remove(&channel_id);
                }
            }
            None => debug!(channel=%channel_id, "Operation for unknown channel"),
        }
        Ok(())
    }

    async fn open_channel(&mut self, channel_id: Uuid) -> anyhow::Result<()> {
        let Some(session) = &self.session else {
            warn!(session=%self.session_id, channel=%channel_id, "Channel open before connect");
            let _ = self.tx.send(SshEvent::Close(channel_id));
            return Ok(());
        };
        let channel = session.channel_open_session().await?;

        let (tx, rx) = unbounded_channel();
        self.channel_pipes.insert(channel_id, tx);

        let task = ChannelTask::new(channel, channel_id, rx, self.tx.clone(), self.session_id);
        self.child_tasks.push(tokio::spawn(task.run()));
        Ok(())
    }

    async fn open_sftp(&mut self) -> Result<russh_sftp::client::SftpSession, SshClientError> {
        let Some(session) = &self.session else {
            return Err(SshClientError::other(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "not connected",
            )));
        };
        let channel = session.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = russh_sftp::client::SftpSession::new(channel.into_stream()).await?;
        Ok(sftp)
    }

    fn record_local_algorithms(&mut self, params: &ConnectParams) {
        let algorithms = preset_algorithms(params.preset);
        for category in AlgorithmCategory::ALL {
            self.capture.observe(
                AlgorithmSource::Client,
                category,
                &algorithms.for_category(category).join(","),
            );
        }
    }

    async fn connect(&mut self, params: ConnectParams) -> Result<(), ConnectionError> {
        let credentials = params.credentials.clone();
        let address_str = format!("{}:{}", credentials.host, credentials.port);
        let address = match address_str.to_socket_addrs() {
            Ok(mut addrs) => match addrs.next() {
                Some(address) => address,
                None => {
                    return Err(ConnectionError::Resolve {
                        host: credentials.host,
                    })
                }
            },
            Err(error) => {
                error!(session=%self.session_id, ?error, address=%address_str, "Cannot resolve target address");
                return Err(ConnectionError::Resolve {
                    host: credentials.host,
                });
            }
        };

        self.set_state(SshSessionState::Connecting);
        self.record_local_algorithms(&params);
        info!(session=%self.session_id, ?address, username=%credentials.username, "Connecting");

        let config = russh::client::Config {
            preferred: preferred_for(params.preset),
            keepalive_interval: (params.keepalive_interval_ms > 0)
                .then(|| Duration::from_millis(params.keepalive_interval_ms)),
            keepalive_max: params.keepalive_count_max as usize,
            inactivity_timeout: None,
            ..Default::default()
        };
        let config = Arc::new(config);

        let (handler_tx, mut handler_rx) = unbounded_channel();
        let handler = ClientHandler {
            session_id: self.session_id,
            host: credentials.host.clone(),
            port: credentials.port,
            policy: self.policy.clone(),
            event_tx: handler_tx,
        };

        let deadline = tokio::time::sleep(Duration::from_millis(params.ready_timeout_ms));
        tokio::pin!(deadline);

        let fut_connect = russh::client::connect(config, address, handler);
        pin_mut!(fut_connect);

        let mut session = loop {
            tokio::select! {
                Some(event) = handler_rx.recv() => {
                    self.relay_handler_event(event);
                }
                _ = &mut deadline => {
                    return Err(ConnectionError::Timeout);
                }
                Some(_) = self.abort_rx.recv() => {
                    info!(session=%self.session_id, "Abort requested");
                    return Err(ConnectionError::Aborted);
                }
                session = &mut fut_connect => {
                    match session {
                        Ok(session) => break session,
                        Err(ClientHandlerError::ConnectionError(e)) => return Err(e),
                        Err(ClientHandlerError::Ssh(e)) => return Err(ConnectionError::Ssh(e)),
                        Err(ClientHandlerError::Internal) => return Err(ConnectionError::Internal),
                    }
                }
            }
        };

        self.authenticate(&mut session, &params).await?;

        self.session = Some(session);
        info!(session=%self.session_id, ?address, "Connected");

        // Keep relaying handler events (rekey host-key checks, final
        // disconnect) for the rest of the connection's life.
        tokio::spawn({
            let inner_tx = self.inner_tx.clone();
            async move {
                while let Some(event) = handler_rx.recv().await {
                    if inner_tx.send(InnerEvent::HandlerEvent(event)).is_err() {
                        break;
                    }
                }
            }
            .instrument(Span::current())
        });

        Ok(())
    }

    async fn authenticate(
        &mut self,
        session: &mut Handle<ClientHandler>,
        params: &ConnectParams,
    ) -> Result<(), ConnectionError> {
        let credentials = &params.credentials;
        let username = credentials.username.clone();

        if let Some(key_pem) = &credentials.private_key {
            let passphrase = if is_encrypted_private_key(key_pem.expose_secret()) {
                credentials
                    .passphrase
                    .as_ref()
                    .map(|p| p.expose_secret().clone())
            } else {
                None
            };
            let key =
                russh::keys::decode_secret_key(key_pem.expose_secret(), passphrase.as_deref())?;
            let result = session
                .authenticate_publickey(
                    username.clone(),
                    PrivateKeyWithHashAlg::new(Arc::new(key), None),
                )
                .await?;
            if result.success() {
                debug!(session=%self.session_id, username=%username, "Authenticated with key");
                return Ok(());
            }
        }

        if let Some(password) = &credentials.password {
            let result = session
                .authenticate_password(username.clone(), password.expose_secret().clone())
                .await?;
            if result.success() {
                debug!(session=%self.session_id, username=%username, "Authenticated with password");
                return Ok(());
            }
        }

        // Keyboard-interactive: either requested outright or as the
        // server's fallback after a password rejection.
        if credentials.keyboard_interactive || credentials.password.is_some() {
            if self.authenticate_keyboard_interactive(session, params).await? {
                return Ok(());
            }
        }

        error!(session=%self.session_id, username=%username, "Auth rejected");
        let _ = session
            .disconnect(russh::Disconnect::ByApplication, "", "")
            .await;
        Err(ConnectionError::Authentication)
    }

    async fn authenticate_keyboard_interactive(
        &mut self,
        session: &mut Handle<ClientHandler>,
        params: &ConnectParams,
    ) -> Result<bool, ConnectionError> {
        let credentials = &params.credentials;
        let mut response = session
            .authenticate_keyboard_interactive_start(
                credentials.username.clone(),
                None::<String>,
            )
            .await?;
        let mut round = 0usize;

        loop {
            match response {
                KeyboardInteractiveAuthResponse::Success => {
                    debug!(session=%self.session_id, "Authenticated via keyboard-interactive");
                    return Ok(true);
                }
                KeyboardInteractiveAuthResponse::Failure { .. } => {
                    return Ok(false);
                }
                KeyboardInteractiveAuthResponse::InfoRequest {
                    name,
                    instructions,
                    prompts,
                } => {
                    let relayed: Vec<KeyboardInteractivePrompt> = prompts
                        .iter()
                        .map(|p| KeyboardInteractivePrompt {
                            prompt: p.prompt.clone(),
                            echo: p.echo,
                        })
                        .collect();

                    let answers = if should_auto_answer(
                        &relayed,
                        round,
                        credentials.password.is_some(),
                        params.forward_all_keyboard_interactive_prompts,
                    ) {
                        debug!(session=%self.session_id, "Auto-answering password prompt");
                        vec![credentials
                            .password
                            .as_ref()
                            .map(|p| p.expose_secret().clone())
                            .unwrap_or_default()]
                    } else {
                        let (reply_tx, reply_rx) = oneshot::channel();
                        self.tx
                            .send(SshEvent::KeyboardInteractive {
                                name,
                                instructions,
                                prompts: relayed,
                                reply: reply_tx,
                            })
                            .map_err(|_| ConnectionError::Internal)?;
                        match reply_rx.await {
                            Ok(Some(answers)) => answers,
                            _ => return Ok(false),
                        }
                    };

                    round += 1;
                    response = session
                        .authenticate_keyboard_interactive_respond(answers)
                        .await?;
                }
            }
        }
    }

    fn set_state(&mut self, state: SshSessionState) {
        self.state = state.clone();
        let _ = self.tx.send(SshEvent::State(state));
    }

    fn set_disconnected(&mut self) {
        self.session = None;
        for (id, op) in self.pending_ops.drain(..) {
            if matches!(op, ChannelOperation::RequestShell | ChannelOperation::RequestExec(_)) {
                let _ = self.tx.send(SshEvent::Close(id));
            }
        }
        self.set_state(SshSessionState::Disconnected);
        let _ = self.tx.send(SshEvent::Done);
    }

    /// Idempotent teardown.
    async fn disconnect(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session
                .disconnect(russh::Disconnect::ByApplication, "", "")
                .await;
        }
        if self.state != SshSessionState::Disconnected {
            self.set_disconnected();
        }
    }
}

/// A single echo-off prompt asking for a password in the first round is
/// answered from the cached password, unless configuration says to relay
/// every prompt.
fn should_auto_answer(
    prompts: &[KeyboardInteractivePrompt],
    round: usize,
    has_password: bool,
    forward_all: bool,
) -> bool {
    round == 0
        && !forward_all
        && has_password
        && prompts.len() == 1
        && !prompts[0].echo
        && prompts[0].prompt.to_lowercase().contains("password")
}

impl Drop for RemoteSshClient {
    fn drop(&mut self) {
        for task in self.child_tasks.drain(..) {
            task.abort();
        }
        debug!(session=%self.session_id, "Dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prompt(text: &str, echo: bool) -> KeyboardInteractivePrompt {
        KeyboardInteractivePrompt {
            prompt: text.into(),
            echo,
        }
    }

    #[test]
    fn test_auto_answer_first_password_prompt() {
        let prompts = vec![prompt("Password: ", false)];
        assert!(should_auto_answer(&prompts, 0, true, false));
    }

    #[test]
    fn test_no_auto_answer_when_forwarding_all() {
        let prompts = vec![prompt("Password: ", false)];
        assert!(!should_auto_answer(&prompts, 0, true, true));
    }

    #[test]
    fn test_no_auto_answer_without_password() {
        let prompts = vec![prompt("Password: ", false)];
        assert!(!should_auto_answer(&prompts, 0, false, false));
    }

    #[test]
    fn test_no_auto_answer_on_later_rounds() {
        let prompts = vec![prompt("Password: ", false)];
        assert!(!should_auto_answer(&prompts, 1, true, false));
    }

    #[test]
    fn test_no_auto_answer_for_otp_prompt() {
        let prompts = vec![prompt("Verification code: ", false)];
        assert!(!should_auto_answer(&prompts, 0, true, false));
    }

    #[test]
    fn test_no_auto_answer_for_echoed_or_multiple_prompts() {
        assert!(!should_auto_answer(
            &[prompt("Password: ", true)],
            0,
            true,
            false
        ));
        assert!(!should_auto_answer(
            &[prompt("Password: ", false), prompt("Token: ", false)],
            0,
            true,
            false
        ));
    }
}
