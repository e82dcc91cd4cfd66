use std::time::Duration;

/// How long the gateway waits for a client's answer to a `prompt` event.
pub const DEFAULT_PROMPT_TIMEOUT: Duration = Duration::from_millis(300_000);

/// Hard ceiling for any single prompt, regardless of configuration.
pub const MAX_PROMPT_TIMEOUT: Duration = Duration::from_millis(600_000);

/// A socket may hold at most this many unanswered prompts.
pub const MAX_PENDING_PROMPTS: usize = 10;

/// Idle session lifetime before the sweeper reclaims it.
pub const MAX_SESSION_TIMEOUT: Duration = Duration::from_millis(300_000);

/// Period of the ephemeral-store expiration sweep.
pub const SESSION_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Default cap on a single SFTP transfer.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// Chunk size offered to clients in `sftp-upload-ready` / used for reads.
pub const SFTP_CHUNK_SIZE: usize = 32 * 1024;

/// Failed `authenticate` attempts tolerated before the socket is dropped.
pub const DEFAULT_MAX_AUTH_ATTEMPTS: u32 = 2;

pub const MAX_ENV_PAIRS: usize = 50;
pub const MAX_ENV_KEY_LEN: usize = 256;
pub const MAX_ENV_VALUE_LEN: usize = 10_000;

pub const MIN_TERMINAL_DIMENSION: u32 = 1;
pub const MAX_TERMINAL_DIMENSION: u32 = 9999;

pub const MAX_HOSTNAME_LEN: usize = 253;
