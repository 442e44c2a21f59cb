//! Identity errors

use thiserror::Error;

/// Identity and signing errors
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key material has the wrong length
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Public key bytes do not form a valid key
    #[error("Invalid public key")]
    InvalidPublicKey,

    /// A textual router name could not be parsed
    #[error("Invalid router name: {0}")]
    InvalidRouterName(String),

    /// Signature bytes are malformed
    #[error("Invalid signature")]
    InvalidSignature,

    /// Signature did not verify
    #[error("Signature verification failed")]
    SignatureVerificationFailed,
}

/// Result type for identity operations
pub type CryptoResult<T> = Result<T, CryptoError>;
