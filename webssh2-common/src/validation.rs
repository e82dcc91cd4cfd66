//! Inbound message validation: terminal geometry, hosts, ports, and
//! environment maps. Rejection here never tears a session down; callers
//! decide whether to surface an `ssherror` or silently drop.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::consts::{
    MAX_ENV_KEY_LEN, MAX_ENV_PAIRS, MAX_ENV_VALUE_LEN, MAX_HOSTNAME_LEN, MAX_TERMINAL_DIMENSION,
    MIN_TERMINAL_DIMENSION,
};
use crate::Webssh2Error;

/// Environment names accepted from the wire. Leading underscore allowed.
static ENV_KEY_ACCEPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z_][A-Z0-9_]*$").expect("static regex"));

/// Stricter form enforced on stored terminal state (no leading underscore).
static ENV_KEY_STORE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z][A-Z0-9_]*$").expect("static regex"));

const SHELL_METACHARACTERS: &[char] = &[';', '&', '|', '`', '$'];

/// Outcome of validating a terminal dimension received from a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimensionCheck {
    Valid(u32),
    /// Not a number at all; the message is silently ignored.
    NotANumber,
    /// Numeric but outside `[1, 9999]`; reported to the client.
    OutOfRange,
}

pub fn check_dimension(value: &serde_json::Value) -> DimensionCheck {
    let Some(n) = value.as_u64() else {
        // Also accept float encodings of whole numbers ("80.0").
        if let Some(f) = value.as_f64() {
            if f.fract() == 0.0 && f >= 0.0 {
                return check_dimension(&serde_json::Value::from(f as u64));
            }
        }
        return DimensionCheck::NotANumber;
    };
    if (MIN_TERMINAL_DIMENSION as u64..=MAX_TERMINAL_DIMENSION as u64).contains(&n) {
        DimensionCheck::Valid(n as u32)
    } else {
        DimensionCheck::OutOfRange
    }
}

pub fn validate_port(port: u32) -> Result<u16, Webssh2Error> {
    if (1..=65535).contains(&port) {
        Ok(port as u16)
    } else {
        Err(Webssh2Error::Validation(format!(
            "port {port} outside [1, 65535]"
        )))
    }
}

/// Trims and checks a target host. IP addresses pass through untouched;
/// anything else is length-capped like a DNS name.
pub fn validate_host(host: &str) -> Result<String, Webssh2Error> {
    let trimmed = host.trim();
    if trimmed.is_empty() {
        return Err(Webssh2Error::Validation("host must not be empty".into()));
    }
    if trimmed.parse::<std::net::IpAddr>().is_ok() {
        return Ok(trimmed.to_string());
    }
    if trimmed.len() > MAX_HOSTNAME_LEN {
        return Err(Webssh2Error::Validation(format!(
            "hostname longer than {MAX_HOSTNAME_LEN} characters"
        )));
    }
    Ok(trimmed.to_string())
}

/// Escapes a hostname for inclusion in log lines and client-visible error
/// text, so a hostile host string cannot smuggle markup.
pub fn escape_host_for_display(host: &str) -> String {
    let mut out = String::with_capacity(host.len());
    for c in host.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Strips everything but `[a-zA-Z0-9.-]` and caps at the DNS name limit.
/// Used when a hostname is echoed inside DNS failure diagnostics.
pub fn sanitize_hostname(host: &str) -> String {
    host.chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '.' || *c == '-')
        .take(MAX_HOSTNAME_LEN)
        .collect()
}

fn env_value_is_safe(value: &str) -> bool {
    !value.contains(SHELL_METACHARACTERS)
}

/// Filters an environment map down to acceptable pairs, applying the wire
/// regex, value metacharacter rules, length caps, and the 50-pair limit.
/// Offending pairs are dropped, not fatal.
pub fn filter_env_pairs(env: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    env.iter()
        .filter(|(key, value)| {
            ENV_KEY_ACCEPT.is_match(key)
                && key.len() <= MAX_ENV_KEY_LEN
                && value.len() <= MAX_ENV_VALUE_LEN
                && env_value_is_safe(value)
        })
        .take(MAX_ENV_PAIRS)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// The invariant enforced on stored terminal state: uppercase-led names
/// only. Applied by the terminal reducer on top of [`filter_env_pairs`].
pub fn env_key_storable(key: &str) -> bool {
    ENV_KEY_STORE.is_match(key) && key.len() <= MAX_ENV_KEY_LEN
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dimension_nan_ignored() {
        assert_eq!(check_dimension(&json!("NaN")), DimensionCheck::NotANumber);
        assert_eq!(check_dimension(&json!("oops")), DimensionCheck::NotANumber);
        assert_eq!(check_dimension(&json!(null)), DimensionCheck::NotANumber);
    }

    #[test]
    fn test_dimension_bounds() {
        assert_eq!(check_dimension(&json!(1)), DimensionCheck::Valid(1));
        assert_eq!(check_dimension(&json!(9999)), DimensionCheck::Valid(9999));
        assert_eq!(check_dimension(&json!(0)), DimensionCheck::OutOfRange);
        assert_eq!(check_dimension(&json!(10000)), DimensionCheck::OutOfRange);
        assert_eq!(check_dimension(&json!(80.0)), DimensionCheck::Valid(80));
    }

    #[test]
    fn test_port_range() {
        assert_eq!(validate_port(22).unwrap(), 22);
        assert!(validate_port(0).is_err());
        assert!(validate_port(65536).is_err());
    }

    #[test]
    fn test_host_trim_and_empty() {
        assert_eq!(validate_host("  example.net ").unwrap(), "example.net");
        assert!(validate_host("   ").is_err());
        assert_eq!(validate_host("192.168.0.1").unwrap(), "192.168.0.1");
    }

    #[test]
    fn test_escape_host() {
        assert_eq!(
            escape_host_for_display("<script>alert(1)</script>"),
            "&lt;script&gt;alert(1)&lt;/script&gt;"
        );
    }

    #[test]
    fn test_sanitize_hostname() {
        assert_eq!(sanitize_hostname("bad.example;rm -rf"), "bad.examplerm-rf");
        let long = "a".repeat(300);
        assert_eq!(sanitize_hostname(&long).len(), MAX_HOSTNAME_LEN);
    }

    #[test]
    fn test_env_filtering() {
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), "/usr/bin".to_string());
        env.insert("_PRIVATE".to_string(), "ok".to_string());
        env.insert("lower".to_string(), "dropped".to_string());
        env.insert("INJECT".to_string(), "a;rm -rf /".to_string());
        let filtered = filter_env_pairs(&env);
        assert!(filtered.contains_key("PATH"));
        assert!(filtered.contains_key("_PRIVATE"));
        assert!(!filtered.contains_key("lower"));
        assert!(!filtered.contains_key("INJECT"));
    }

    #[test]
    fn test_env_pair_cap() {
        let env: BTreeMap<_, _> = (0..60)
            .map(|i| (format!("VAR{i:03}"), "v".to_string()))
            .collect();
        assert_eq!(filter_env_pairs(&env).len(), MAX_ENV_PAIRS);
    }

    #[test]
    fn test_storable_env_key() {
        assert!(env_key_storable("TERM"));
        assert!(!env_key_storable("_TERM"));
        assert!(!env_key_storable("1TERM"));
    }
}
