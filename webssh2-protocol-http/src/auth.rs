//! HTTP-side credential providers, consulted in priority order: session
//! seed (Basic auth / host route), SSO headers or form body, and finally
//! the interactive `authenticate` message handled by the socket adapter.

use std::collections::HashMap;
use std::net::IpAddr;

use data_encoding::BASE64;
use poem::Request;
use webssh2_common::subnets::is_ip_in_subnets;
use webssh2_common::SsoConfig;

use crate::common::SeededCredentials;

/// Parses `Authorization: Basic ...` into a username/password pair.
pub fn parse_basic_auth(request: &Request) -> Option<(String, String)> {
    let header = request.headers().get(poem::http::header::AUTHORIZATION)?;
    let header = header.to_str().ok()?;
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = BASE64.decode(encoded.trim().as_bytes()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (username, password) = decoded.split_once(':')?;
    if username.is_empty() {
        return None;
    }
    Some((username.to_string(), password.to_string()))
}

/// Whether the request arrived from one of the configured SSO proxies.
pub fn is_trusted_proxy(remote_ip: Option<IpAddr>, sso: &SsoConfig) -> bool {
    if sso.trusted_proxies.is_empty() {
        return false;
    }
    match remote_ip {
        Some(ip) => is_ip_in_subnets(ip, &sso.trusted_proxies),
        None => false,
    }
}

/// Pulls SSO credentials from the mapped headers, falling back to the
/// POST body fields of the same names.
pub fn extract_sso_credentials(
    request: &Request,
    form: &HashMap<String, String>,
    sso: &SsoConfig,
) -> Option<SeededCredentials> {
    let header = |name: &str| -> Option<String> {
        request
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned)
    };

    let username = header(&sso.header_mapping.username)
        .or_else(|| form.get("username").cloned())
        .filter(|u| !u.is_empty())?;
    let password =
        header(&sso.header_mapping.password).or_else(|| form.get("password").cloned())?;

    Some(SeededCredentials {
        host: form.get("host").cloned(),
        port: form.get("port").and_then(|p| p.parse().ok()),
        username: Some(username),
        password: Some(password),
        private_key: None,
        passphrase: None,
        term: form.get("sshterm").cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn basic_request(value: &str) -> Request {
        Request::builder()
            .header(poem::http::header::AUTHORIZATION, value)
            .finish()
    }

    #[test]
    fn test_parse_basic_auth() {
        let encoded = BASE64.encode(b"alice:s3cret");
        let request = basic_request(&format!("Basic {encoded}"));
        assert_eq!(
            parse_basic_auth(&request),
            Some(("alice".to_string(), "s3cret".to_string()))
        );
    }

    #[test]
    fn test_basic_auth_rejects_garbage() {
        assert!(parse_basic_auth(&basic_request("Bearer token")).is_none());
        assert!(parse_basic_auth(&basic_request("Basic !!!notb64")).is_none());
        let no_colon = BASE64.encode(b"junk");
        assert!(parse_basic_auth(&basic_request(&format!("Basic {no_colon}"))).is_none());
        let empty_user = BASE64.encode(b":pw");
        assert!(parse_basic_auth(&basic_request(&format!("Basic {empty_user}"))).is_none());
    }

    #[test]
    fn test_trusted_proxy_requires_allow_list() {
        let mut sso = SsoConfig::default();
        assert!(!is_trusted_proxy(Some("10.0.0.1".parse().unwrap()), &sso));
        sso.trusted_proxies = vec!["10.0.0.0/8".into()];
        assert!(is_trusted_proxy(Some("10.0.0.1".parse().unwrap()), &sso));
        assert!(!is_trusted_proxy(Some("192.168.0.1".parse().unwrap()), &sso));
        assert!(!is_trusted_proxy(None, &sso));
    }

    #[test]
    fn test_sso_headers_win_over_form() {
        let sso = SsoConfig::default();
        let request = Request::builder()
            .header("x-forwarded-user", "hdr-user")
            .header("x-forwarded-password", "hdr-pass")
            .finish();
        let mut form = HashMap::new();
        form.insert("username".to_string(), "form-user".to_string());
        form.insert("host".to_string(), "target.host".to_string());

        let seeded = extract_sso_credentials(&request, &form, &sso).unwrap();
        assert_eq!(seeded.username.as_deref(), Some("hdr-user"));
        assert_eq!(seeded.password.as_deref(), Some("hdr-pass"));
        assert_eq!(seeded.host.as_deref(), Some("target.host"));
    }

    #[test]
    fn test_sso_form_fallback() {
        let sso = SsoConfig::default();
        let request = Request::builder().finish();
        let mut form = HashMap::new();
        form.insert("username".to_string(), "u".to_string());
        form.insert("password".to_string(), "p".to_string());
        let seeded = extract_sso_credentials(&request, &form, &sso).unwrap();
        assert_eq!(seeded.username.as_deref(), Some("u"));
    }
}
