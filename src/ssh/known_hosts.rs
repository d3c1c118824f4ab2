//! Host key verification store
//!
//! Keeps the first fingerprint seen for each `host:port` and reports any later
//! mismatch. Persisting the store is left to the embedding application.

use std::collections::HashMap;

use parking_lot::RwLock;
use russh::keys::{HashAlg, PublicKey};
use tracing::{debug, warn};

/// Result of host key verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostKeyVerification {
    /// Key matches the recorded fingerprint
    Verified,
    /// Host not seen before (first connection)
    Unknown { fingerprint: String },
    /// Key changed from the recorded fingerprint (potential MITM)
    Changed {
        expected_fingerprint: String,
        actual_fingerprint: String,
    },
}

/// In-memory known hosts: `host:port` -> SHA256 fingerprint
#[derive(Default)]
pub struct KnownHostsStore {
    hosts: RwLock<HashMap<String, String>>,
}

impl KnownHostsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compute SHA256 fingerprint of public key
    pub fn fingerprint(key: &PublicKey) -> String {
        key.fingerprint(HashAlg::Sha256).to_string()
    }

    fn make_key(host: &str, port: u16) -> String {
        format!("{}:{}", host, port)
    }

    /// Verify a fingerprint against the recorded one
    pub fn verify_fingerprint(&self, host: &str, port: u16, fingerprint: &str) -> HostKeyVerification {
        let lookup_key = Self::make_key(host, port);
        match self.hosts.read().get(&lookup_key) {
            Some(expected) if expected == fingerprint => {
                debug!("Host key verified for {}", lookup_key);
                HostKeyVerification::Verified
            }
            Some(expected) => {
                warn!(
                    "HOST KEY CHANGED for {}! Expected {}, got {}",
                    lookup_key, expected, fingerprint
                );
                HostKeyVerification::Changed {
                    expected_fingerprint: expected.clone(),
                    actual_fingerprint: fingerprint.to_string(),
                }
            }
            None => HostKeyVerification::Unknown {
                fingerprint: fingerprint.to_string(),
            },
        }
    }

    /// Verify a host's public key
    pub fn verify(&self, host: &str, port: u16, key: &PublicKey) -> HostKeyVerification {
        self.verify_fingerprint(host, port, &Self::fingerprint(key))
    }

    /// Record a fingerprint. An existing entry is not overwritten.
    pub fn trust(&self, host: &str, port: u16, fingerprint: &str) {
        self.hosts
            .write()
            .entry(Self::make_key(host, port))
            .or_insert_with(|| fingerprint.to_string());
    }

    /// Forget a host (after the user accepted a legitimate key change)
    pub fn forget(&self, host: &str, port: u16) -> bool {
        self.hosts.write().remove(&Self::make_key(host, port)).is_some()
    }

    pub fn len(&self) -> usize {
        self.hosts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.read().is_empty()
    }
}
