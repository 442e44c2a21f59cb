//! Router Identity Management
//!
//! Every veilnet router is identified by its Ed25519 public key. The
//! textual form of a router identity is the base32 encoding of the key
//! followed by the `.snode` suffix; that name is what local clients
//! resolve through the exit DNS responder.

use ed25519_dalek::{
    Signature as Ed25519Sig, Signer, SigningKey, Verifier, VerifyingKey,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use zeroize::ZeroizeOnDrop;

use crate::constants::{ROUTER_ID_SIZE, SIGNATURE_SIZE, SNODE_TLD};
use crate::error::{CryptoError, CryptoResult};

/// A router's public identity key
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RouterId {
    bytes: [u8; ROUTER_ID_SIZE],
}

/// Ed25519 signature
#[derive(Clone, Copy, Serialize, Deserialize)]
pub struct Signature {
    #[serde(with = "BigArray")]
    bytes: [u8; SIGNATURE_SIZE],
}

/// The local router's signing identity
#[derive(ZeroizeOnDrop)]
pub struct RouterIdentity {
    #[zeroize(skip)]
    signing_key: SigningKey,

    /// Cached public identity
    #[zeroize(skip)]
    router_id: RouterId,
}

impl RouterId {
    /// Create a RouterId from raw key bytes
    pub fn from_bytes(bytes: [u8; ROUTER_ID_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != ROUTER_ID_SIZE {
            return Err(CryptoError::InvalidKeyLength {
                expected: ROUTER_ID_SIZE,
                actual: slice.len(),
            });
        }
        let mut bytes = [0u8; ROUTER_ID_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    /// Get raw key bytes
    pub fn as_bytes(&self) -> &[u8; ROUTER_ID_SIZE] {
        &self.bytes
    }

    /// Base32 form of the key, without the `.snode` suffix
    pub fn to_base32(&self) -> String {
        base32::encode(base32::Alphabet::Crockford, &self.bytes).to_ascii_lowercase()
    }

    /// Full textual router name, e.g. `8x4f...2q.snode`
    pub fn to_snode_name(&self) -> String {
        format!("{}{}", self.to_base32(), SNODE_TLD)
    }

    /// Parse a textual router name.
    ///
    /// Accepts both `<base32>.snode` and a bare `<base32>` string,
    /// case-insensitively. Rejects anything that does not decode to
    /// exactly [`ROUTER_ID_SIZE`] bytes.
    pub fn from_snode_name(name: &str) -> CryptoResult<Self> {
        let base = name
            .strip_suffix(SNODE_TLD)
            .or_else(|| name.strip_suffix(&SNODE_TLD.to_ascii_uppercase()))
            .unwrap_or(name);
        if base.is_empty() || base.contains('.') {
            return Err(CryptoError::InvalidRouterName(name.to_string()));
        }
        let decoded = base32::decode(base32::Alphabet::Crockford, base)
            .ok_or_else(|| CryptoError::InvalidRouterName(name.to_string()))?;
        if decoded.len() != ROUTER_ID_SIZE {
            return Err(CryptoError::InvalidRouterName(name.to_string()));
        }
        Self::try_from_slice(&decoded)
    }
}

impl std::fmt::Debug for RouterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RouterId({})", &self.to_base32()[..8])
    }
}

impl std::fmt::Display for RouterId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_snode_name())
    }
}

impl Signature {
    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; SIGNATURE_SIZE]) -> Self {
        Self { bytes }
    }

    /// Try to create from a slice
    pub fn try_from_slice(slice: &[u8]) -> CryptoResult<Self> {
        if slice.len() != SIGNATURE_SIZE {
            return Err(CryptoError::InvalidSignature);
        }
        let mut bytes = [0u8; SIGNATURE_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self { bytes })
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; SIGNATURE_SIZE] {
        &self.bytes
    }
}

impl RouterIdentity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let router_id = RouterId::from_bytes(signing_key.verifying_key().to_bytes());

        Self {
            signing_key,
            router_id,
        }
    }

    /// Restore an identity from a stored secret key
    pub fn from_secret_bytes(secret: [u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(&secret);
        let router_id = RouterId::from_bytes(signing_key.verifying_key().to_bytes());

        Self {
            signing_key,
            router_id,
        }
    }

    /// The public identity of this router
    pub fn router_id(&self) -> RouterId {
        self.router_id
    }

    /// Get the Ed25519 verifying (public) key
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> Signature {
        let sig = self.signing_key.sign(message);
        Signature {
            bytes: sig.to_bytes(),
        }
    }

    /// Export the secret key for secure storage
    pub fn export_secret(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }
}

/// Verify a signature against a router identity
pub fn verify(id: &RouterId, message: &[u8], signature: &Signature) -> CryptoResult<()> {
    let verifying_key =
        VerifyingKey::from_bytes(id.as_bytes()).map_err(|_| CryptoError::InvalidPublicKey)?;
    let sig = Ed25519Sig::from_bytes(&signature.bytes);

    verifying_key
        .verify(message, &sig)
        .map_err(|_| CryptoError::SignatureVerificationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snode_name_roundtrip() {
        let identity = RouterIdentity::generate();
        let id = identity.router_id();

        let name = id.to_snode_name();
        assert!(name.ends_with(".snode"));

        let parsed = RouterId::from_snode_name(&name).unwrap();
        assert_eq!(id, parsed);

        // bare base32 without the suffix also parses
        let bare = RouterId::from_snode_name(&id.to_base32()).unwrap();
        assert_eq!(id, bare);
    }

    #[test]
    fn test_snode_name_case_insensitive() {
        let id = RouterId::from_bytes([7u8; 32]);
        let upper = id.to_snode_name().to_ascii_uppercase();
        assert_eq!(RouterId::from_snode_name(&upper).unwrap(), id);
    }

    #[test]
    fn test_snode_name_rejects_garbage() {
        assert!(RouterId::from_snode_name("").is_err());
        assert!(RouterId::from_snode_name(".snode").is_err());
        assert!(RouterId::from_snode_name("not base32 at all!.snode").is_err());
        // valid base32, wrong length
        assert!(RouterId::from_snode_name("zzzz.snode").is_err());
        // dots inside the base part
        assert!(RouterId::from_snode_name("aa.bb.snode").is_err());
    }

    #[test]
    fn test_sign_verify() {
        let identity = RouterIdentity::generate();
        let message = b"exit session handshake";
        let signature = identity.sign(message);

        assert!(verify(&identity.router_id(), message, &signature).is_ok());
        assert!(verify(&identity.router_id(), b"other message", &signature).is_err());
    }

    #[test]
    fn test_export_restore() {
        let identity = RouterIdentity::generate();
        let secret = identity.export_secret();

        let restored = RouterIdentity::from_secret_bytes(secret);
        assert_eq!(identity.router_id(), restored.router_id());
    }
}
