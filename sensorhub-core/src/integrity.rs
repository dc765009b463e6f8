//! Integrity: payload checksums, file digests, per-node corruption tracking.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

/// Default number of corrupt frames before a node's channel is treated as disconnected.
pub const DEFAULT_MAX_CORRUPT_FRAMES: u32 = 3;

/// Hash arbitrary bytes. Returns 32-byte digest.
pub fn hash_bytes(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Checksum of a message payload: lowercase hex SHA-256 of its compact JSON form.
/// `serde_json::Value` keeps object keys sorted, so sender and receiver agree on the bytes.
pub fn payload_checksum(payload: &serde_json::Value) -> String {
    // Serializing a Value cannot fail: keys are always strings.
    let bytes = serde_json::to_vec(payload).unwrap_or_default();
    hex::encode(hash_bytes(&bytes))
}

/// Verify a payload against the checksum carried in the envelope.
pub fn verify_payload(payload: &serde_json::Value, checksum: &str) -> bool {
    payload_checksum(payload).eq_ignore_ascii_case(checksum)
}

/// Incremental SHA-256 over a file as it is written chunk by chunk.
#[derive(Default)]
pub struct StreamDigest {
    hasher: Sha256,
    len: u64,
}

impl StreamDigest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        self.len += bytes.len() as u64;
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Lowercase hex digest of everything fed so far.
    pub fn finish(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Counts corrupt frames per node so a single bad frame is tolerated but recurring
/// corruption tears the channel down.
#[derive(Debug, Default)]
pub struct CorruptionTracker {
    failures: HashMap<String, u32>,
}

impl CorruptionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a corrupt frame. Returns the new count for the node.
    pub fn record_failure(&mut self, device_id: &str) -> u32 {
        let count = self.failures.entry(device_id.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    /// True once the node reached `max_failures` corrupt frames.
    pub fn is_isolated(&self, device_id: &str, max_failures: u32) -> bool {
        self.failure_count(device_id) >= max_failures
    }

    pub fn failure_count(&self, device_id: &str) -> u32 {
        self.failures.get(device_id).copied().unwrap_or(0)
    }

    /// Forget past failures (fresh hello after reconnect).
    pub fn reset(&mut self, device_id: &str) {
        self.failures.remove(device_id);
    }
}
