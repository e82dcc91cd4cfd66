use std::path::Path;

use anyhow::{Context, Result};
use config::{Config, Environment, File};
use tracing::*;
use webssh2_common::{Webssh2Config, Webssh2ConfigStore};

/// Well-known environment overrides mapped onto nested config keys.
/// (The generic `WEBSSH2_*` source only reaches top-level keys.)
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("WEBSSH2_LISTEN_IP", "listen.ip"),
    ("WEBSSH2_LISTEN_PORT", "listen.port"),
    ("WEBSSH2_HTTP_ORIGINS", "http.origins"),
    ("WEBSSH2_SSH_PORT", "ssh.port"),
    ("WEBSSH2_SSH_TERM", "ssh.term"),
    ("WEBSSH2_SSH_READY_TIMEOUT", "ssh.readyTimeout"),
    ("WEBSSH2_SSH_KEEPALIVE_INTERVAL", "ssh.keepaliveInterval"),
    ("WEBSSH2_SSH_KEEPALIVE_COUNT_MAX", "ssh.keepaliveCountMax"),
    ("WEBSSH2_SSH_ALGORITHMS_PRESET", "ssh.algorithms.preset"),
    ("WEBSSH2_SSH_ALLOWED_SUBNETS", "ssh.allowedSubnets"),
    ("WEBSSH2_SSH_ALLOWED_AUTH_METHODS", "ssh.allowedAuthMethods"),
    ("WEBSSH2_HOST_KEY_VERIFICATION_ENABLED", "hostKeyVerification.enabled"),
    ("WEBSSH2_HOST_KEY_VERIFICATION_MODE", "hostKeyVerification.mode"),
    (
        "WEBSSH2_HOST_KEY_UNKNOWN_KEY_ACTION",
        "hostKeyVerification.unknownKeyAction",
    ),
    ("WEBSSH2_OPTIONS_ALLOW_REAUTH", "options.allowReauth"),
    ("WEBSSH2_OPTIONS_ALLOW_REPLAY", "options.allowReplay"),
    ("WEBSSH2_OPTIONS_REPLAY_CRLF", "options.replayCRLF"),
    ("WEBSSH2_SESSION_SECRET", "session.secret"),
    ("WEBSSH2_SESSION_NAME", "session.name"),
    ("WEBSSH2_SSO_ENABLED", "sso.enabled"),
    ("WEBSSH2_SSO_TRUSTED_PROXIES", "sso.trustedProxies"),
    ("WEBSSH2_LOGGING_MINIMUM_LEVEL", "logging.minimumLevel"),
    ("WEBSSH2_LOGGING_TRANSPORTS", "logging.transports"),
    ("WEBSSH2_LOGGING_SYSLOG_HOST", "logging.syslog.host"),
    ("WEBSSH2_LOGGING_SYSLOG_PORT", "logging.syslog.port"),
    ("WEBSSH2_SFTP_MAX_FILE_SIZE", "sftp.maxFileSize"),
];

/// Layered load: built-in defaults, then the YAML file (when present),
/// then environment variables.
pub fn load_config(path: &Path) -> Result<Webssh2Config> {
    let mut builder = Config::builder();

    if path.exists() {
        builder = builder.add_source(File::from(path));
    }

    builder = builder.add_source(Environment::with_prefix("WEBSSH2"));

    for (var, key) in ENV_OVERRIDES {
        if let Ok(value) = std::env::var(var) {
            builder = builder
                .set_override(*key, value)
                .with_context(|| format!("applying {var}"))?;
        }
    }

    let mut store: Webssh2ConfigStore = builder
        .build()
        .context("building configuration")?
        .try_deserialize()
        .context("parsing configuration")?;

    store.normalize();
    store.validate().map_err(anyhow::Error::from)?;

    let paths_relative_to = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| std::path::PathBuf::from("."));

    if path.exists() {
        info!("Using config: {}", path.display());
    } else {
        info!("Config file {} not found, using defaults", path.display());
    }

    Ok(Webssh2Config {
        store,
        paths_relative_to,
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_defaults_without_file() {
        let config = load_config(Path::new("/nonexistent/config.yaml")).unwrap();
        assert_eq!(config.store.listen.port, 2222);
        assert_eq!(config.store.ssh.port, 22);
    }

    #[test]
    fn test_file_overrides_defaults() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "listen:\n  port: 9000\nssh:\n  term: vt100\noptions:\n  replayCRLF: true"
        )
        .unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.store.listen.port, 9000);
        assert_eq!(config.store.ssh.term, "vt100");
        assert!(config.store.options.replay_crlf);
    }

    #[test]
    fn test_invalid_auth_methods_fatal() {
        let mut file = tempfile::Builder::new()
            .suffix(".yaml")
            .tempfile()
            .unwrap();
        writeln!(file, "ssh:\n  allowedAuthMethods: [kerberos]").unwrap();
        assert!(load_config(file.path()).is_err());
    }
}
