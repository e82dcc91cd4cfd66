mod observer;

use std::borrow::Cow;

use russh::{kex, Preferred};
use webssh2_common::AlgorithmPreset;

pub use observer::{AlgorithmAnalysis, AlgorithmCapture, AlgorithmSource, CategoryMismatch};

/// The five negotiated algorithm categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlgorithmCategory {
    Kex,
    ServerHostKey,
    Cipher,
    Mac,
    Compress,
}

impl AlgorithmCategory {
    pub const ALL: [AlgorithmCategory; 5] = [
        AlgorithmCategory::Kex,
        AlgorithmCategory::ServerHostKey,
        AlgorithmCategory::Cipher,
        AlgorithmCategory::Mac,
        AlgorithmCategory::Compress,
    ];

    /// Suffix used in `WEBSSH2_SSH_ALGORITHMS_*` override suggestions.
    pub fn env_suffix(&self) -> &'static str {
        match self {
            AlgorithmCategory::Kex => "KEX",
            AlgorithmCategory::ServerHostKey => "SERVER_HOST_KEY",
            AlgorithmCategory::Cipher => "CIPHER",
            AlgorithmCategory::Mac => "MAC",
            AlgorithmCategory::Compress => "COMPRESS",
        }
    }
}

/// The algorithm names a preset is willing to negotiate, per category.
pub struct PresetAlgorithms {
    pub kex: &'static [&'static str],
    pub server_host_key: &'static [&'static str],
    pub cipher: &'static [&'static str],
    pub mac: &'static [&'static str],
    pub compress: &'static [&'static str],
}

impl PresetAlgorithms {
    pub fn for_category(&self, category: AlgorithmCategory) -> &'static [&'static str] {
        match category {
            AlgorithmCategory::Kex => self.kex,
            AlgorithmCategory::ServerHostKey => self.server_host_key,
            AlgorithmCategory::Cipher => self.cipher,
            AlgorithmCategory::Mac => self.mac,
            AlgorithmCategory::Compress => self.compress,
        }
    }
}

static STRICT: PresetAlgorithms = PresetAlgorithms {
    kex: &[
        "curve25519-sha256",
        "curve25519-sha256@libssh.org",
        "diffie-hellman-group16-sha512",
    ],
    server_host_key: &["ssh-ed25519", "rsa-sha2-512", "rsa-sha2-256"],
    cipher: &[
        "chacha20-poly1305@openssh.com",
        "aes256-gcm@openssh.com",
        "aes128-gcm@openssh.com",
    ],
    mac: &["hmac-sha2-512-etm@openssh.com", "hmac-sha2-256-etm@openssh.com"],
    compress: &["none"],
};

static MODERN: PresetAlgorithms = PresetAlgorithms {
    kex: &[
        "curve25519-sha256",
        "curve25519-sha256@libssh.org",
        "ecdh-sha2-nistp256",
        "ecdh-sha2-nistp384",
        "ecdh-sha2-nistp521",
        "diffie-hellman-group16-sha512",
        "diffie-hellman-group14-sha256",
    ],
    server_host_key: &[
        "ssh-ed25519",
        "ecdsa-sha2-nistp256",
        "rsa-sha2-512",
        "rsa-sha2-256",
    ],
    cipher: &[
        "chacha20-poly1305@openssh.com",
        "aes256-gcm@openssh.com",
        "aes128-gcm@openssh.com",
        "aes256-ctr",
        "aes192-ctr",
        "aes128-ctr",
    ],
    mac: &[
        "hmac-sha2-512-etm@openssh.com",
        "hmac-sha2-256-etm@openssh.com",
        "hmac-sha2-512",
        "hmac-sha2-256",
    ],
    compress: &["none", "zlib@openssh.com"],
};

static LEGACY: PresetAlgorithms = PresetAlgorithms {
    kex: &[
        "curve25519-sha256",
        "curve25519-sha256@libssh.org",
        "ecdh-sha2-nistp256",
        "ecdh-sha2-nistp384",
        "ecdh-sha2-nistp521",
        "diffie-hellman-group16-sha512",
        "diffie-hellman-group14-sha256",
        "diffie-hellman-group14-sha1",
        "diffie-hellman-group1-sha1",
    ],
    server_host_key: &[
        "ssh-ed25519",
        "ecdsa-sha2-nistp256",
        "rsa-sha2-512",
        "rsa-sha2-256",
        "ssh-rsa",
    ],
    cipher: &[
        "chacha20-poly1305@openssh.com",
        "aes256-gcm@openssh.com",
        "aes128-gcm@openssh.com",
        "aes256-ctr",
        "aes192-ctr",
        "aes128-ctr",
        "aes256-cbc",
        "aes128-cbc",
        "3des-cbc",
    ],
    mac: &[
        "hmac-sha2-512-etm@openssh.com",
        "hmac-sha2-256-etm@openssh.com",
        "hmac-sha2-512",
        "hmac-sha2-256",
        "hmac-sha1",
    ],
    compress: &["none", "zlib@openssh.com", "zlib"],
};

pub fn preset_algorithms(preset: AlgorithmPreset) -> &'static PresetAlgorithms {
    match preset {
        AlgorithmPreset::Strict => &STRICT,
        AlgorithmPreset::Modern => &MODERN,
        AlgorithmPreset::Legacy => &LEGACY,
    }
}

/// Whether the preset could negotiate with a server offering `offered`
/// in `category` (vacuously true for empty offers).
pub fn preset_covers(
    preset: AlgorithmPreset,
    category: AlgorithmCategory,
    offered: &[String],
) -> bool {
    if offered.is_empty() {
        return true;
    }
    let ours = preset_algorithms(preset).for_category(category);
    offered.iter().any(|alg| ours.contains(&alg.as_str()))
}

/// The transport-level algorithm lists actually handed to russh. Only the
/// kex list varies by preset; the remaining categories ride on russh's
/// defaults, and legacy re-enables the old DH groups.
pub fn preferred_for(preset: AlgorithmPreset) -> Preferred {
    match preset {
        AlgorithmPreset::Strict => Preferred {
            kex: Cow::Owned(vec![
                kex::CURVE25519,
                kex::CURVE25519_PRE_RFC_8731,
                kex::DH_G16_SHA512,
                kex::EXTENSION_SUPPORT_AS_CLIENT,
            ]),
            ..Default::default()
        },
        AlgorithmPreset::Modern => Preferred::default(),
        AlgorithmPreset::Legacy => Preferred {
            kex: Cow::Owned(vec![
                kex::CURVE25519,
                kex::CURVE25519_PRE_RFC_8731,
                kex::ECDH_SHA2_NISTP256,
                kex::ECDH_SHA2_NISTP384,
                kex::ECDH_SHA2_NISTP521,
                kex::DH_G16_SHA512,
                kex::DH_G14_SHA256,
                kex::DH_G14_SHA1,
                kex::DH_G1_SHA1,
                kex::EXTENSION_SUPPORT_AS_CLIENT,
            ]),
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strict_excludes_old_dh() {
        assert!(!STRICT.kex.contains(&"diffie-hellman-group14-sha1"));
        assert!(LEGACY.kex.contains(&"diffie-hellman-group14-sha1"));
    }

    #[test]
    fn test_preset_covers() {
        let offered = vec!["diffie-hellman-group14-sha1".to_string()];
        assert!(!preset_covers(
            AlgorithmPreset::Strict,
            AlgorithmCategory::Kex,
            &offered
        ));
        assert!(!preset_covers(
            AlgorithmPreset::Modern,
            AlgorithmCategory::Kex,
            &offered
        ));
        assert!(preset_covers(
            AlgorithmPreset::Legacy,
            AlgorithmCategory::Kex,
            &offered
        ));
    }

    #[test]
    fn test_empty_offer_is_covered() {
        assert!(preset_covers(
            AlgorithmPreset::Strict,
            AlgorithmCategory::Mac,
            &[]
        ));
    }
}
