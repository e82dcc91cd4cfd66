use russh::keys::{HashAlg, PublicKey};

/// Algorithm name as it appears on the wire (`ssh-ed25519`, ...).
pub fn key_algorithm(key: &PublicKey) -> String {
    key.algorithm().to_string()
}

/// The base64 body of the key, as stored in the trust store.
pub fn key_base64(key: &PublicKey) -> String {
    key.to_openssh()
        .ok()
        .and_then(|line| line.split_whitespace().nth(1).map(str::to_owned))
        .unwrap_or_default()
}

/// `SHA256:...` fingerprint shown in prompts.
pub fn key_fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}

pub fn fingerprint_of_base64(algorithm: &str, key_base64: &str) -> String {
    match format!("{algorithm} {key_base64}").parse::<PublicKey>() {
        Ok(key) => key_fingerprint(&key),
        Err(_) => format!("{algorithm} (unparsable key)"),
    }
}
