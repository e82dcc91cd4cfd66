use crate::{LogLevel, Secret};

pub(crate) const fn _default_true() -> bool {
    true
}

pub(crate) const fn _default_false() -> bool {
    false
}

#[inline]
pub(crate) fn _default_listen_ip() -> String {
    "0.0.0.0".to_owned()
}

pub(crate) const fn _default_listen_port() -> u16 {
    2222
}

#[inline]
pub(crate) fn _default_origins() -> Vec<String> {
    vec!["*:*".to_owned()]
}

pub(crate) const fn _default_ssh_port() -> u16 {
    22
}

#[inline]
pub(crate) fn _default_term() -> String {
    "xterm-256color".to_owned()
}

pub(crate) const fn _default_ready_timeout() -> u64 {
    20_000
}

pub(crate) const fn _default_keepalive_interval() -> u64 {
    120_000
}

pub(crate) const fn _default_keepalive_count_max() -> u32 {
    10
}

#[inline]
pub(crate) fn _default_auth_methods() -> Vec<String> {
    vec![
        "publickey".to_owned(),
        "password".to_owned(),
        "keyboard-interactive".to_owned(),
    ]
}

#[inline]
pub(crate) fn _default_empty_vec<T>() -> Vec<T> {
    vec![]
}

#[inline]
pub(crate) fn _default_host_key_db_path() -> String {
    "./data/host_keys.sqlite3".to_owned()
}

#[inline]
pub(crate) fn _default_session_name() -> String {
    "webssh2".to_owned()
}

#[inline]
pub(crate) fn _default_session_secret() -> Secret<String> {
    Secret::new(String::new())
}

#[inline]
pub(crate) fn _default_sso_username_header() -> String {
    "x-forwarded-user".to_owned()
}

#[inline]
pub(crate) fn _default_sso_password_header() -> String {
    "x-forwarded-password".to_owned()
}

#[inline]
pub(crate) fn _default_sso_session_header() -> String {
    "x-forwarded-session".to_owned()
}

pub(crate) const fn _default_log_level() -> LogLevel {
    LogLevel::Info
}

#[inline]
pub(crate) fn _default_log_namespace() -> String {
    "webssh2".to_owned()
}

pub(crate) const fn _default_sample_rate() -> f64 {
    1.0
}

#[inline]
pub(crate) fn _default_transports() -> Vec<String> {
    vec!["stdout".to_owned()]
}

#[inline]
pub(crate) fn _default_syslog_host() -> String {
    "127.0.0.1".to_owned()
}

pub(crate) const fn _default_syslog_port() -> u16 {
    514
}

#[inline]
pub(crate) fn _default_syslog_app_name() -> String {
    "webssh2".to_owned()
}

pub(crate) const fn _default_syslog_enterprise_id() -> u32 {
    32473
}

pub(crate) const fn _default_max_queue_size() -> usize {
    1000
}

pub(crate) const fn _default_max_auth_attempts() -> u32 {
    2
}

pub(crate) const fn _default_max_file_size() -> u64 {
    100 * 1024 * 1024
}
