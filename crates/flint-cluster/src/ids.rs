//! Cluster node identities.
//!
//! A node identity is 40 lowercase hexadecimal characters, generated randomly
//! when a node first starts and kept for its lifetime. Handshake entries get
//! a fresh random identity that is replaced in place once the peer's first
//! PONG reveals its real one.

use std::fmt;

use rand::Rng;

/// Length of a node identity in bytes (40 hex characters).
pub const NODE_ID_LEN: usize = 40;

const HEX_CHARS: &[u8; 16] = b"0123456789abcdef";

/// A 40-character hexadecimal cluster node identity.
///
/// Stored as raw ASCII so it can be copied directly into wire headers and
/// compared bytewise. `Ord` gives the lexicographic order used by the
/// configEpoch collision resolver and the replica-migration candidate pick.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    /// Generates a fresh random identity.
    pub fn random() -> Self {
        let mut rng = rand::rng();
        let mut buf = [0u8; NODE_ID_LEN];
        for b in buf.iter_mut() {
            *b = HEX_CHARS[rng.random_range(0..16)];
        }
        Self(buf)
    }

    /// Parses an identity from its string form.
    pub fn parse(s: &str) -> Result<Self, crate::ClusterError> {
        Self::from_raw(s.as_bytes().try_into().map_err(|_| crate::ClusterError::InvalidNodeId)?)
    }

    /// Validates and wraps raw identity bytes (e.g. from a wire header).
    pub fn from_raw(raw: [u8; NODE_ID_LEN]) -> Result<Self, crate::ClusterError> {
        if raw.iter().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()) {
            Ok(Self(raw))
        } else {
            Err(crate::ClusterError::InvalidNodeId)
        }
    }

    /// The raw 40 ASCII bytes.
    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// The identity as a string slice.
    pub fn as_str(&self) -> &str {
        // only ever constructed from validated ASCII hex
        std::str::from_utf8(&self.0).unwrap_or("")
    }

    /// First 8 characters, for log lines.
    pub fn short(&self) -> &str {
        &self.as_str()[..8]
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for NodeId {
    // short form; full ids make multi-node assertion output unreadable
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.short())
    }
}
