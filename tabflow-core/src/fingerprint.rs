//! SHA-256 fingerprints used as cache key components.

use sha2::{Digest, Sha256};

const FIELD_SEP: u8 = 0x1f;
const RECORD_SEP: u8 = 0x1e;

/// Incremental hasher over delimited fields and records.
pub struct Fingerprinter {
    hasher: Sha256,
}

impl Fingerprinter {
    pub fn new() -> Self {
        Self {
            hasher: Sha256::new(),
        }
    }

    pub fn field(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        self.hasher.update([FIELD_SEP]);
    }

    pub fn record(&mut self) {
        self.hasher.update([RECORD_SEP]);
    }

    pub fn finish(self) -> String {
        format!("{:x}", self.hasher.finalize())
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new()
    }
}

/// Compute SHA-256 hash of arbitrary bytes.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Fingerprint of a step's declared configuration.
pub fn config_fingerprint(config: &serde_json::Value) -> String {
    hash_bytes(config.to_string().as_bytes())
}

/// Combine several fingerprints (and names) into one key.
pub fn combine(parts: &[&str]) -> String {
    let mut fp = Fingerprinter::new();
    for part in parts {
        fp.field(part.as_bytes());
    }
    fp.finish()
}
