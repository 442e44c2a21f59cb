//! Veilnet Identity Primitives
//!
//! Identity types shared by every subsystem of a veilnet router:
//! - `RouterId`: a router's Ed25519 public key, with the textual
//!   `<base32>.snode` form used on the wire and in DNS
//! - `PathId`: opaque identifier of a multi-hop overlay path
//! - `RouterIdentity`: the local router's signing keypair

pub mod constants;
pub mod error;
pub mod identity;
pub mod path;

pub use constants::{PATH_ID_SIZE, ROUTER_ID_SIZE, SIGNATURE_SIZE, SNODE_TLD};
pub use error::{CryptoError, CryptoResult};
pub use identity::{RouterId, RouterIdentity, Signature};
pub use path::PathId;

/// Commonly used identity types
pub mod prelude {
    pub use crate::error::{CryptoError, CryptoResult};
    pub use crate::identity::{RouterId, RouterIdentity, Signature};
    pub use crate::path::PathId;
}
