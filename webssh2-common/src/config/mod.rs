mod defaults;

use std::fmt;
use std::path::PathBuf;

use defaults::*;
use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::auth::AuthMethod;
use crate::{Secret, Webssh2Error};

/// Accepts `["a", "b"]`, `"a,b"` and `"[\"a\", \"b\"]"` — file configs use
/// real arrays, environment overrides usually arrive as strings.
fn string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Input {
        Seq(Vec<String>),
        One(String),
    }

    Ok(match Input::deserialize(deserializer)? {
        Input::Seq(items) => items,
        Input::One(raw) => {
            let raw = raw.trim();
            if raw.starts_with('[') {
                serde_json::from_str(raw).map_err(serde::de::Error::custom)?
            } else if raw.is_empty() {
                vec![]
            } else {
                raw.split(',').map(|s| s.trim().to_string()).collect()
            }
        }
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Algorithm bundles offered to the target, ordered by decreasing
/// strictness: `strict > modern > legacy`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlgorithmPreset {
    Strict,
    #[default]
    Modern,
    Legacy,
}

impl AlgorithmPreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlgorithmPreset::Strict => "strict",
            AlgorithmPreset::Modern => "modern",
            AlgorithmPreset::Legacy => "legacy",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenConfig {
    #[serde(default = "_default_listen_ip")]
    pub ip: String,
    #[serde(default = "_default_listen_port")]
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            ip: _default_listen_ip(),
            port: _default_listen_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HttpConfig {
    #[serde(default = "_default_origins", deserialize_with = "string_or_seq")]
    pub origins: Vec<String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            origins: _default_origins(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlgorithmsConfig {
    #[serde(default)]
    pub preset: AlgorithmPreset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConfig {
    #[serde(default = "_default_ssh_port")]
    pub port: u16,

    #[serde(default = "_default_term")]
    pub term: String,

    /// Handshake deadline, in milliseconds.
    #[serde(default = "_default_ready_timeout")]
    pub ready_timeout: u64,

    #[serde(default = "_default_keepalive_interval")]
    pub keepalive_interval: u64,

    #[serde(default = "_default_keepalive_count_max")]
    pub keepalive_count_max: u32,

    #[serde(default)]
    pub algorithms: AlgorithmsConfig,

    /// CIDR v4/v6 or `10.*.*.*`-style wildcards. Empty = unrestricted.
    #[serde(default = "_default_empty_vec", deserialize_with = "string_or_seq")]
    pub allowed_subnets: Vec<String>,

    #[serde(default = "_default_auth_methods", deserialize_with = "string_or_seq")]
    pub allowed_auth_methods: Vec<String>,

    /// When false, a first-round single password prompt is auto-answered
    /// from cached credentials instead of being relayed to the browser.
    #[serde(default = "_default_false")]
    pub forward_all_keyboard_interactive_prompts: bool,

    #[serde(default = "_default_max_auth_attempts")]
    pub max_auth_attempts: u32,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            port: _default_ssh_port(),
            term: _default_term(),
            ready_timeout: _default_ready_timeout(),
            keepalive_interval: _default_keepalive_interval(),
            keepalive_count_max: _default_keepalive_count_max(),
            algorithms: <_>::default(),
            allowed_subnets: vec![],
            allowed_auth_methods: _default_auth_methods(),
            forward_all_keyboard_interactive_prompts: false,
            max_auth_attempts: _default_max_auth_attempts(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKeyMode {
    Server,
    Client,
    #[default]
    Hybrid,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnknownKeyAction {
    #[default]
    Prompt,
    Reject,
    Accept,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostKeyStoreConfig {
    #[serde(default = "_default_host_key_db_path")]
    pub db_path: String,
    /// Overrides the mode's default when set.
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl Default for HostKeyStoreConfig {
    fn default() -> Self {
        Self {
            db_path: _default_host_key_db_path(),
            enabled: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientStoreConfig {
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostKeyVerificationConfig {
    #[serde(default = "_default_false")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: HostKeyMode,
    #[serde(default)]
    pub unknown_key_action: UnknownKeyAction,
    #[serde(default)]
    pub server_store: HostKeyStoreConfig,
    #[serde(default)]
    pub client_store: ClientStoreConfig,
}

impl HostKeyVerificationConfig {
    pub fn server_store_enabled(&self) -> bool {
        self.server_store
            .enabled
            .unwrap_or(matches!(self.mode, HostKeyMode::Server | HostKeyMode::Hybrid))
    }

    pub fn client_store_enabled(&self) -> bool {
        self.client_store
            .enabled
            .unwrap_or(matches!(self.mode, HostKeyMode::Client | HostKeyMode::Hybrid))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionsConfig {
    #[serde(default = "_default_true")]
    pub challenge_button: bool,
    #[serde(default = "_default_false")]
    pub auto_log: bool,
    #[serde(default = "_default_true")]
    pub allow_reauth: bool,
    #[serde(default = "_default_true")]
    pub allow_reconnect: bool,
    #[serde(default = "_default_true")]
    pub allow_replay: bool,
    #[serde(rename = "replayCRLF", default = "_default_false")]
    pub replay_crlf: bool,
}

impl Default for OptionsConfig {
    fn default() -> Self {
        Self {
            challenge_button: true,
            auto_log: false,
            allow_reauth: true,
            allow_reconnect: true,
            allow_replay: true,
            replay_crlf: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    #[serde(default = "_default_session_secret")]
    pub secret: Secret<String>,
    #[serde(default = "_default_session_name")]
    pub name: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            secret: _default_session_secret(),
            name: _default_session_name(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SsoHeaderMapping {
    #[serde(default = "_default_sso_username_header")]
    pub username: String,
    #[serde(default = "_default_sso_password_header")]
    pub password: String,
    #[serde(default = "_default_sso_session_header")]
    pub session: String,
}

impl Default for SsoHeaderMapping {
    fn default() -> Self {
        Self {
            username: _default_sso_username_header(),
            password: _default_sso_password_header(),
            session: _default_sso_session_header(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SsoConfig {
    #[serde(default = "_default_false")]
    pub enabled: bool,
    #[serde(default = "_default_false")]
    pub csrf_protection: bool,
    #[serde(default = "_default_empty_vec", deserialize_with = "string_or_seq")]
    pub trusted_proxies: Vec<String>,
    #[serde(default)]
    pub header_mapping: SsoHeaderMapping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplingRule {
    /// Event name, or `*` for the wildcard rule.
    pub target: String,
    pub rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamplingConfig {
    #[serde(default = "_default_sample_rate")]
    pub default_sample_rate: f64,
    #[serde(default = "_default_empty_vec")]
    pub rules: Vec<SamplingRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRule {
    /// Event name, or `*` for a bucket shared across all events.
    pub target: String,
    pub limit: u32,
    pub interval_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    #[serde(default = "_default_empty_vec")]
    pub rules: Vec<RateLimitRule>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyslogFacility {
    User,
    Daemon,
    Auth,
    Syslog,
    #[default]
    Local0,
    Local1,
    Local2,
    Local3,
    Local4,
    Local5,
    Local6,
    Local7,
}

impl SyslogFacility {
    pub fn code(&self) -> u8 {
        match self {
            SyslogFacility::User => 1,
            SyslogFacility::Daemon => 3,
            SyslogFacility::Auth => 4,
            SyslogFacility::Syslog => 5,
            SyslogFacility::Local0 => 16,
            SyslogFacility::Local1 => 17,
            SyslogFacility::Local2 => 18,
            SyslogFacility::Local3 => 19,
            SyslogFacility::Local4 => 20,
            SyslogFacility::Local5 => 21,
            SyslogFacility::Local6 => 22,
            SyslogFacility::Local7 => 23,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyslogConfig {
    #[serde(default = "_default_syslog_host")]
    pub host: String,
    #[serde(default = "_default_syslog_port")]
    pub port: u16,
    #[serde(default)]
    pub facility: SyslogFacility,
    #[serde(default = "_default_syslog_app_name")]
    pub app_name: String,
    #[serde(default = "_default_syslog_enterprise_id")]
    pub enterprise_id: u32,
    /// When true the syslog MSG carries the whole JSON record instead of
    /// just the human message.
    #[serde(default = "_default_false")]
    pub include_json: bool,
}

impl Default for SyslogConfig {
    fn default() -> Self {
        Self {
            host: _default_syslog_host(),
            port: _default_syslog_port(),
            facility: <_>::default(),
            app_name: _default_syslog_app_name(),
            enterprise_id: _default_syslog_enterprise_id(),
            include_json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StdoutTransportConfig {
    #[serde(default = "_default_max_queue_size")]
    pub max_queue_size: usize,
}

impl Default for StdoutTransportConfig {
    fn default() -> Self {
        Self {
            max_queue_size: _default_max_queue_size(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    #[serde(default = "_default_log_level")]
    pub minimum_level: LogLevel,
    #[serde(default = "_default_log_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub sampling: SamplingConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default = "_default_transports", deserialize_with = "string_or_seq")]
    pub transports: Vec<String>,
    #[serde(default)]
    pub syslog: SyslogConfig,
    #[serde(default)]
    pub stdout: StdoutTransportConfig,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            minimum_level: _default_log_level(),
            namespace: _default_log_namespace(),
            sampling: <_>::default(),
            rate_limit: <_>::default(),
            transports: _default_transports(),
            syslog: <_>::default(),
            stdout: <_>::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpConfig {
    #[serde(default = "_default_max_file_size")]
    pub max_file_size: u64,
}

impl Default for SftpConfig {
    fn default() -> Self {
        Self {
            max_file_size: _default_max_file_size(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Webssh2ConfigStore {
    #[serde(default)]
    pub listen: ListenConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub ssh: SshConfig,

    #[serde(default)]
    pub host_key_verification: HostKeyVerificationConfig,

    #[serde(default)]
    pub options: OptionsConfig,

    #[serde(default)]
    pub session: SessionConfig,

    #[serde(default)]
    pub sso: SsoConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub sftp: SftpConfig,
}

#[derive(Debug, Clone)]
pub struct Webssh2Config {
    pub store: Webssh2ConfigStore,
    pub paths_relative_to: PathBuf,
}

const KNOWN_TRANSPORTS: &[&str] = &["stdout", "syslog"];

impl Webssh2ConfigStore {
    /// Canonicalizes the store in place: auth method and transport tokens
    /// are lowercased, unknown ones dropped with a warning, duplicates
    /// removed order-preserving, and sample rates clamped to `[0, 1]`.
    /// Idempotent: normalizing a normalized store changes nothing.
    pub fn normalize(&mut self) {
        let mut seen = Vec::new();
        self.ssh.allowed_auth_methods.retain_mut(|token| {
            *token = token.trim().to_ascii_lowercase();
            if AuthMethod::parse(token).is_none() {
                warn!(%token, "Ignoring unknown SSH auth method");
                return false;
            }
            if seen.contains(token) {
                return false;
            }
            seen.push(token.clone());
            true
        });

        let mut seen = Vec::new();
        self.logging.transports.retain_mut(|token| {
            *token = token.trim().to_ascii_lowercase();
            if !KNOWN_TRANSPORTS.contains(&token.as_str()) {
                warn!(%token, "Ignoring unknown log transport");
                return false;
            }
            if seen.contains(token) {
                return false;
            }
            seen.push(token.clone());
            true
        });

        self.logging.sampling.default_sample_rate =
            self.logging.sampling.default_sample_rate.clamp(0.0, 1.0);
        for rule in &mut self.logging.sampling.rules {
            rule.rate = rule.rate.clamp(0.0, 1.0);
        }
    }

    /// Startup validation. Failures here are fatal (§ error handling:
    /// `config` errors log and exit).
    pub fn validate(&self) -> Result<(), Webssh2Error> {
        if self.listen.ip.parse::<std::net::IpAddr>().is_err() {
            return Err(Webssh2Error::Config(format!(
                "listen.ip is not a valid address: {}",
                self.listen.ip
            )));
        }
        if self.ssh.allowed_auth_methods.is_empty() {
            return Err(Webssh2Error::Config(
                "ssh.allowedAuthMethods is empty after validation".into(),
            ));
        }
        if self.sso.csrf_protection && self.session.secret.expose_secret().is_empty() {
            return Err(Webssh2Error::Config(
                "sso.csrfProtection requires a non-empty session.secret".into(),
            ));
        }
        for rule in &self.logging.rate_limit.rules {
            if rule.limit == 0 || rule.interval_ms == 0 {
                return Err(Webssh2Error::Config(format!(
                    "rate limit rule for '{}' must have nonzero limit and interval",
                    rule.target
                )));
            }
        }
        Ok(())
    }

    /// The allow-list as typed methods. Call after [`Self::normalize`].
    pub fn allowed_auth_methods(&self) -> Vec<AuthMethod> {
        self.ssh
            .allowed_auth_methods
            .iter()
            .filter_map(|t| AuthMethod::parse(t))
            .collect()
    }

    /// Serialization for diagnostics with secrets blanked out.
    pub fn to_masked_json(&self) -> serde_json::Value {
        let mut value = serde_json::to_value(self).unwrap_or_default();
        if let Some(session) = value.get_mut("session") {
            if let Some(secret) = session.get_mut("secret") {
                *secret = serde_json::Value::String("***".into());
            }
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_schema() {
        let store = Webssh2ConfigStore::default();
        assert_eq!(store.listen.ip, "0.0.0.0");
        assert_eq!(store.listen.port, 2222);
        assert_eq!(store.ssh.port, 22);
        assert_eq!(store.ssh.term, "xterm-256color");
        assert_eq!(store.ssh.ready_timeout, 20_000);
        assert_eq!(store.ssh.keepalive_interval, 120_000);
        assert_eq!(store.ssh.keepalive_count_max, 10);
        assert_eq!(store.session.name, "webssh2");
        assert!(!store.host_key_verification.enabled);
        assert_eq!(store.logging.minimum_level, LogLevel::Info);
        assert_eq!(store.logging.stdout.max_queue_size, 1000);
        assert_eq!(store.sftp.max_file_size, 100 * 1024 * 1024);
    }

    #[test]
    fn test_normalize_idempotent() {
        let mut store = Webssh2ConfigStore::default();
        store.ssh.allowed_auth_methods = vec![
            "Password".into(),
            "publickey".into(),
            "password".into(),
            "telnet".into(),
        ];
        store.logging.sampling.default_sample_rate = 3.5;
        store.normalize();
        let once = store.clone();
        store.normalize();
        assert_eq!(once, store);
        assert_eq!(
            store.ssh.allowed_auth_methods,
            vec!["password".to_string(), "publickey".to_string()]
        );
        assert_eq!(store.logging.sampling.default_sample_rate, 1.0);
    }

    #[test]
    fn test_empty_auth_methods_is_config_error() {
        let mut store = Webssh2ConfigStore::default();
        store.ssh.allowed_auth_methods = vec!["kerberos".into()];
        store.normalize();
        assert!(matches!(
            store.validate(),
            Err(Webssh2Error::Config(_))
        ));
    }

    #[test]
    fn test_comma_separated_arrays() {
        let yaml = r#"{"ssh": {"allowedAuthMethods": "password, publickey"}}"#;
        let store: Webssh2ConfigStore = serde_json::from_str(yaml).unwrap();
        assert_eq!(
            store.ssh.allowed_auth_methods,
            vec!["password".to_string(), "publickey".to_string()]
        );
    }

    #[test]
    fn test_json_string_arrays() {
        let raw = r#"{"ssh": {"allowedSubnets": "[\"10.0.0.0/8\"]"}}"#;
        let store: Webssh2ConfigStore = serde_json::from_str(raw).unwrap();
        assert_eq!(store.ssh.allowed_subnets, vec!["10.0.0.0/8".to_string()]);
    }

    #[test]
    fn test_replay_crlf_key_spelling() {
        let raw = r#"{"options": {"replayCRLF": true}}"#;
        let store: Webssh2ConfigStore = serde_json::from_str(raw).unwrap();
        assert!(store.options.replay_crlf);
    }

    #[test]
    fn test_store_enabled_flags_follow_mode() {
        let mut config = HostKeyVerificationConfig::default();
        config.mode = HostKeyMode::Server;
        assert!(config.server_store_enabled());
        assert!(!config.client_store_enabled());

        config.mode = HostKeyMode::Hybrid;
        config.server_store.enabled = Some(false);
        assert!(!config.server_store_enabled());
        assert!(config.client_store_enabled());
    }

    #[test]
    fn test_masked_json_hides_secret() {
        let mut store = Webssh2ConfigStore::default();
        store.session.secret = Secret::new("supersecret".into());
        let masked = store.to_masked_json();
        assert_eq!(masked["session"]["secret"], "***");
    }

    #[test]
    fn test_preset_ordering() {
        assert!(AlgorithmPreset::Strict < AlgorithmPreset::Modern);
        assert!(AlgorithmPreset::Modern < AlgorithmPreset::Legacy);
    }
}
