//! Captures the algorithm lists both sides announced during the SSH
//! handshake and diagnoses negotiation mismatches.
//!
//! Lines look like `Handshake: local KEX method: curve25519-sha256,...`;
//! the first line seen per (source, category) wins, later repeats are
//! ignored.

use webssh2_common::AlgorithmPreset;

use super::{preset_covers, AlgorithmCategory};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlgorithmSource {
    Client,
    Server,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlgorithmSet {
    pub kex: Vec<String>,
    pub server_host_key: Vec<String>,
    pub cipher: Vec<String>,
    pub mac: Vec<String>,
    pub compress: Vec<String>,
}

impl AlgorithmSet {
    fn slot(&mut self, category: AlgorithmCategory) -> &mut Vec<String> {
        match category {
            AlgorithmCategory::Kex => &mut self.kex,
            AlgorithmCategory::ServerHostKey => &mut self.server_host_key,
            AlgorithmCategory::Cipher => &mut self.cipher,
            AlgorithmCategory::Mac => &mut self.mac,
            AlgorithmCategory::Compress => &mut self.compress,
        }
    }

    pub fn get(&self, category: AlgorithmCategory) -> &[String] {
        match category {
            AlgorithmCategory::Kex => &self.kex,
            AlgorithmCategory::ServerHostKey => &self.server_host_key,
            AlgorithmCategory::Cipher => &self.cipher,
            AlgorithmCategory::Mac => &self.mac,
            AlgorithmCategory::Compress => &self.compress,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CategoryMismatch {
    pub category: AlgorithmCategory,
    pub client: Vec<String>,
    pub server: Vec<String>,
    /// `WEBSSH2_SSH_ALGORITHMS_<CAT>=<first server algorithm>`
    pub suggested_env: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlgorithmAnalysis {
    pub has_any_mismatch: bool,
    pub mismatches: Vec<CategoryMismatch>,
    /// Strongest preset whose lists still cover what the server offered.
    pub suggested_preset: Option<AlgorithmPreset>,
}

#[derive(Debug, Default)]
pub struct AlgorithmCapture {
    client: AlgorithmSet,
    server: AlgorithmSet,
}

fn parse_category(label: &str) -> Option<AlgorithmCategory> {
    match label {
        "KEX method" => Some(AlgorithmCategory::Kex),
        "Host key format" => Some(AlgorithmCategory::ServerHostKey),
        "C->S cipher" => Some(AlgorithmCategory::Cipher),
        "C->S MAC" => Some(AlgorithmCategory::Mac),
        "C->S compression" => Some(AlgorithmCategory::Compress),
        _ => None,
    }
}

impl AlgorithmCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one debug line. Non-handshake lines fall through untouched.
    pub fn observe_line(&mut self, line: &str) {
        let Some(rest) = line.trim().strip_prefix("Handshake: ") else {
            return;
        };
        let source = if let Some(rest) = rest.strip_prefix("local ") {
            (AlgorithmSource::Client, rest)
        } else if let Some(rest) = rest.strip_prefix("remote ") {
            (AlgorithmSource::Server, rest)
        } else {
            return;
        };
        let (source, rest) = source;
        let Some((label, csv)) = rest.split_once(':') else {
            return;
        };
        let Some(category) = parse_category(label.trim()) else {
            return;
        };
        self.observe(source, category, csv);
    }

    pub fn observe(&mut self, source: AlgorithmSource, category: AlgorithmCategory, csv: &str) {
        let set = match source {
            AlgorithmSource::Client => &mut self.client,
            AlgorithmSource::Server => &mut self.server,
        };
        let slot = set.slot(category);
        if !slot.is_empty() {
            // First occurrence wins.
            return;
        }
        *slot = csv
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }

    pub fn client(&self) -> &AlgorithmSet {
        &self.client
    }

    pub fn server(&self) -> &AlgorithmSet {
        &self.server
    }

    /// Compares what both sides offered. `None` when every category with
    /// data on both sides intersects.
    pub fn analyze(&self) -> Option<AlgorithmAnalysis> {
        let mut mismatches = vec![];
        for category in AlgorithmCategory::ALL {
            let client = self.client.get(category);
            let server = self.server.get(category);
            if client.is_empty() || server.is_empty() {
                continue;
            }
            let intersects = client.iter().any(|c| server.contains(c));
            if !intersects {
                let first_server = server.first().cloned().unwrap_or_default();
                mismatches.push(CategoryMismatch {
                    category,
                    client: client.to_vec(),
                    server: server.to_vec(),
                    suggested_env: format!(
                        "WEBSSH2_SSH_ALGORITHMS_{}={first_server}",
                        category.env_suffix()
                    ),
                });
            }
        }

        if mismatches.is_empty() {
            return None;
        }

        let suggested_preset = [
            AlgorithmPreset::Strict,
            AlgorithmPreset::Modern,
            AlgorithmPreset::Legacy,
        ]
        .into_iter()
        .find(|preset| {
            AlgorithmCategory::ALL
                .into_iter()
                .all(|category| preset_covers(*preset, category, self.server.get(category)))
        });

        Some(AlgorithmAnalysis {
            has_any_mismatch: true,
            mismatches,
            suggested_preset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_handshake_lines() {
        let mut capture = AlgorithmCapture::new();
        capture.observe_line("Handshake: local KEX method: curve25519-sha256,ecdh-sha2-nistp256");
        capture.observe_line("Handshake: remote KEX method: diffie-hellman-group14-sha1");
        capture.observe_line("Handshake: remote Host key format: ssh-rsa");
        assert_eq!(
            capture.client().kex,
            vec!["curve25519-sha256", "ecdh-sha2-nistp256"]
        );
        assert_eq!(capture.server().kex, vec!["diffie-hellman-group14-sha1"]);
        assert_eq!(capture.server().server_host_key, vec!["ssh-rsa"]);
    }

    #[test]
    fn test_first_occurrence_wins() {
        let mut capture = AlgorithmCapture::new();
        capture.observe_line("Handshake: local KEX method: curve25519-sha256");
        capture.observe_line("Handshake: local KEX method: ecdh-sha2-nistp256");
        assert_eq!(capture.client().kex, vec!["curve25519-sha256"]);
    }

    #[test]
    fn test_irrelevant_lines_ignored() {
        let mut capture = AlgorithmCapture::new();
        capture.observe_line("Connecting to example.net");
        capture.observe_line("Handshake: sideways KEX method: x");
        capture.observe_line("Handshake: local Unknown thing: y");
        assert!(capture.client().kex.is_empty());
    }

    #[test]
    fn test_kex_mismatch_suggests_legacy() {
        let mut capture = AlgorithmCapture::new();
        capture.observe_line("Handshake: local KEX method: curve25519-sha256");
        capture.observe_line("Handshake: remote KEX method: diffie-hellman-group14-sha1");

        let analysis = capture.analyze().expect("mismatch expected");
        assert!(analysis.has_any_mismatch);
        assert_eq!(analysis.mismatches.len(), 1);
        assert_eq!(
            analysis.mismatches[0].suggested_env,
            "WEBSSH2_SSH_ALGORITHMS_KEX=diffie-hellman-group14-sha1"
        );
        assert_eq!(analysis.suggested_preset, Some(AlgorithmPreset::Legacy));
    }

    #[test]
    fn test_no_mismatch_when_intersecting() {
        let mut capture = AlgorithmCapture::new();
        capture.observe_line("Handshake: local KEX method: curve25519-sha256,ecdh-sha2-nistp256");
        capture.observe_line("Handshake: remote KEX method: ecdh-sha2-nistp256");
        assert!(capture.analyze().is_none());
    }

    #[test]
    fn test_one_sided_data_is_not_a_mismatch() {
        let mut capture = AlgorithmCapture::new();
        capture.observe_line("Handshake: local KEX method: curve25519-sha256");
        assert!(capture.analyze().is_none());
    }

    #[test]
    fn test_strongest_covering_preset_wins() {
        let mut capture = AlgorithmCapture::new();
        capture.observe_line("Handshake: local C->S cipher: chacha20-poly1305@openssh.com");
        capture.observe_line("Handshake: remote C->S cipher: aes256-ctr");
        let analysis = capture.analyze().unwrap();
        // aes256-ctr is in the modern set, so there is no need to fall
        // all the way back to legacy.
        assert_eq!(analysis.suggested_preset, Some(AlgorithmPreset::Modern));
    }
}
