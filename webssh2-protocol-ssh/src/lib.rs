pub mod algorithms;
mod client;
mod common;
pub mod sftp;

pub use client::{
    classify, ChannelOperation, ClassifiedError, ConnectionError, ConnectionErrorKind,
    HostKeyPolicy, RemoteSshClient, RemoteSshHandles, SshClientError, SshCommand, SshEvent,
    SshSessionState,
};
pub use common::{ConnectParams, ExecParams, KeyboardInteractivePrompt, PtyParams};
