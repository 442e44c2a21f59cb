//! Size constants for identity types

/// Size of a router identity key (Ed25519 public key)
pub const ROUTER_ID_SIZE: usize = 32;

/// Size of an Ed25519 signature
pub const SIGNATURE_SIZE: usize = 64;

/// Size of an overlay path identifier
pub const PATH_ID_SIZE: usize = 16;

/// Top-level suffix for textual router names
pub const SNODE_TLD: &str = ".snode";
