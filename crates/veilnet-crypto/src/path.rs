//! Overlay path identifiers

use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::constants::PATH_ID_SIZE;

/// Opaque identifier of a multi-hop overlay path.
///
/// Path ids are chosen by the path builder and are only meaningful to
/// the two routers at either end of a hop; the exit endpoint treats
/// them as lookup keys.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PathId {
    bytes: [u8; PATH_ID_SIZE],
}

impl PathId {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; PATH_ID_SIZE]) -> Self {
        Self { bytes }
    }

    /// Generate a random path id
    pub fn random() -> Self {
        let mut bytes = [0u8; PATH_ID_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; PATH_ID_SIZE] {
        &self.bytes
    }

    fn to_hex(self) -> String {
        self.bytes.iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl std::fmt::Debug for PathId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PathId({})", &self.to_hex()[..8])
    }
}

impl std::fmt::Display for PathId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_id_random_distinct() {
        let a = PathId::random();
        let b = PathId::random();
        assert_ne!(a, b);
    }

    #[test]
    fn test_path_id_display() {
        let id = PathId::from_bytes([0xab; PATH_ID_SIZE]);
        assert_eq!(id.to_string(), "ab".repeat(PATH_ID_SIZE));
    }
}
