/// Closed catalog of structured-log event names. Records naming an event
/// outside this list are rejected before they reach any transport.
pub const EVENT_CATALOG: &[&str] = &[
    "server_start",
    "server_stop",
    "config_loaded",
    "session_start",
    "session_end",
    "session_expired",
    "auth_attempt",
    "auth_success",
    "auth_failure",
    "auth_logout",
    "ssh_connect",
    "ssh_disconnect",
    "ssh_error",
    "handshake_complete",
    "algorithm_mismatch",
    "host_key_trusted",
    "host_key_unknown",
    "host_key_mismatch",
    "shell_open",
    "shell_close",
    "exec_start",
    "exec_exit",
    "terminal_resize",
    "replay_credentials",
    "sftp_open",
    "sftp_list",
    "sftp_stat",
    "sftp_mkdir",
    "sftp_delete",
    "sftp_upload",
    "sftp_download",
    "sftp_error",
    "prompt_shown",
    "prompt_answered",
    "prompt_timeout",
    "connection_error",
    "crash_recovery",
    "error_details",
];

pub fn is_known_event(event: &str) -> bool {
    EVENT_CATALOG.contains(&event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_membership() {
        assert!(is_known_event("session_start"));
        assert!(is_known_event("sftp_upload"));
        assert!(!is_known_event("made_up_event"));
        assert!(!is_known_event(""));
    }
}
