use bytes::Bytes;
use russh::client::Msg;
use russh::{Channel, Sig};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::*;
use uuid::Uuid;
use webssh2_common::SessionId;

use super::error::SshClientError;
use super::{ChannelOperation, SshEvent};
use crate::common::PtyParams;

fn signal_from_name(name: &str) -> Option<Sig> {
    Some(match name {
        "HUP" => Sig::HUP,
        "INT" => Sig::INT,
        "QUIT" => Sig::QUIT,
        "KILL" => Sig::KILL,
        "TERM" => Sig::TERM,
        "USR1" => Sig::USR1,
        "USR2" => Sig::Custom("USR2".to_string()),
        _ => return None,
    })
}

/// Owns one upstream channel: applies operations arriving from the
/// socket adapter, and forwards channel messages out as events, frame by
/// frame, without coalescing.
pub struct ChannelTask {
    channel: Channel<Msg>,
    channel_id: Uuid,
    ops_rx: UnboundedReceiver<ChannelOperation>,
    events_tx: UnboundedSender<SshEvent>,
    session_id: SessionId,
}

impl ChannelTask {
    pub fn new(
        channel: Channel<Msg>,
        channel_id: Uuid,
        ops_rx: UnboundedReceiver<ChannelOperation>,
        events_tx: UnboundedSender<SshEvent>,
        session_id: SessionId,
    ) -> Self {
        Self {
            channel,
            channel_id,
            ops_rx,
            events_tx,
            session_id,
        }
    }

    async fn apply_op(&mut self, op: ChannelOperation) -> Result<bool, SshClientError> {
        match op {
            ChannelOperation::RequestPty(PtyParams {
                term,
                cols,
                rows,
                pix_width,
                pix_height,
            }) => {
                self.channel
                    .request_pty(true, &term, cols, rows, pix_width, pix_height, &[])
                    .await?;
            }
            ChannelOperation::RequestEnv(name, value) => {
                self.channel.set_env(false, name, value).await?;
            }
            ChannelOperation::RequestShell => {
                self.channel.request_shell(true).await?;
            }
            ChannelOperation::RequestExec(command) => {
                self.channel.exec(true, command).await?;
            }
            ChannelOperation::Data(data) => {
                self.channel.data(&data[..]).await?;
            }
            ChannelOperation::Resize { cols, rows } => {
                self.channel.window_change(cols, rows, 0, 0).await?;
            }
            ChannelOperation::Signal(name) => match signal_from_name(&name) {
                Some(signal) => self.channel.signal(signal).await?,
                None => debug!(channel=%self.channel_id, %name, "Ignoring unknown signal"),
            },
            ChannelOperation::Eof => {
                self.channel.eof().await?;
            }
            ChannelOperation::Close => return Ok(true),
        }
        Ok(false)
    }

    pub async fn run(mut self) -> Result<(), SshClientError> {
        loop {
            tokio::select! {
                op = self.ops_rx.recv() => {
                    match op {
                        Some(op) => {
                            if self.apply_op(op).await? {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                msg = self.channel.wait() => {
                    match msg {
                        Some(russh::ChannelMsg::Data { data }) => {
                            let bytes: &[u8] = &data;
                            self.send(SshEvent::Output {
                                channel: self.channel_id,
                                data: Bytes::from(bytes.to_vec()),
                            })?;
                        }
                        Some(russh::ChannelMsg::ExtendedData { data, ext }) => {
                            let bytes: &[u8] = &data;
                            self.send(SshEvent::ExtendedData {
                                channel: self.channel_id,
                                ext,
                                data: Bytes::from(bytes.to_vec()),
                            })?;
                        }
                        Some(russh::ChannelMsg::ExitStatus { exit_status }) => {
                            self.send(SshEvent::ExitStatus {
                                channel: self.channel_id,
                                code: exit_status,
                            })?;
                        }
                        Some(russh::ChannelMsg::ExitSignal {
                            signal_name,
                            core_dumped,
                            error_message,
                            ..
                        }) => {
                            self.send(SshEvent::ExitSignal {
                                channel: self.channel_id,
                                signal: format!("{signal_name:?}"),
                                core_dumped,
                                error_message,
                            })?;
                        }
                        Some(russh::ChannelMsg::Eof) => {
                            self.send(SshEvent::Eof(self.channel_id))?;
                        }
                        Some(russh::ChannelMsg::Close) => {
                            self.send(SshEvent::Close(self.channel_id))?;
                        }
                        Some(russh::ChannelMsg::Success)
                        | Some(russh::ChannelMsg::WindowAdjusted { .. })
                        | Some(russh::ChannelMsg::XonXoff { .. }) => {}
                        Some(msg) => {
                            debug!(channel=%self.channel_id, ?msg, "Unhandled channel message");
                        }
                        None => {
                            self.send(SshEvent::Close(self.channel_id))?;
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn send(&self, event: SshEvent) -> Result<(), SshClientError> {
        self.events_tx
            .send(event)
            .map_err(|_| SshClientError::MpscError)
    }
}

impl Drop for ChannelTask {
    fn drop(&mut self) {
        debug!(channel=%self.channel_id, session=%self.session_id, "Channel closed");
    }
}
