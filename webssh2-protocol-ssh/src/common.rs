use std::collections::BTreeMap;

use webssh2_common::auth::Credentials;
use webssh2_common::{AlgorithmPreset, SshConfig};

/// Everything `connect` needs: the client's transient credentials plus a
/// snapshot of the server-side SSH settings.
#[derive(Debug, Clone)]
pub struct ConnectParams {
    pub credentials: Credentials,
    pub ready_timeout_ms: u64,
    pub keepalive_interval_ms: u64,
    pub keepalive_count_max: u32,
    pub preset: AlgorithmPreset,
    pub forward_all_keyboard_interactive_prompts: bool,
}

impl ConnectParams {
    pub fn from_config(credentials: Credentials, ssh: &SshConfig) -> Self {
        Self {
            credentials,
            ready_timeout_ms: ssh.ready_timeout,
            keepalive_interval_ms: ssh.keepalive_interval,
            keepalive_count_max: ssh.keepalive_count_max,
            preset: ssh.algorithms.preset,
            forward_all_keyboard_interactive_prompts: ssh
                .forward_all_keyboard_interactive_prompts,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PtyParams {
    pub term: String,
    pub cols: u32,
    pub rows: u32,
    pub pix_width: u32,
    pub pix_height: u32,
}

impl Default for PtyParams {
    fn default() -> Self {
        Self {
            term: "xterm-256color".into(),
            cols: 80,
            rows: 24,
            pix_width: 0,
            pix_height: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecParams {
    pub command: String,
    pub pty: Option<PtyParams>,
    pub env: BTreeMap<String, String>,
}

/// One prompt of a keyboard-interactive round, as relayed to the client.
#[derive(Debug, Clone)]
pub struct KeyboardInteractivePrompt {
    pub prompt: String,
    pub echo: bool,
}
