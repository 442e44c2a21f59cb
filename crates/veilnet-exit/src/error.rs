//! Exit endpoint errors

use thiserror::Error;

/// Exit endpoint errors
#[derive(Debug, Error)]
pub enum ExitError {
    /// Configuration error (fatal at startup)
    #[error("Config error: {0}")]
    ConfigError(String),

    /// The configured range has no allocatable addresses
    #[error("Degenerate address range: {0}")]
    DegenerateRange(String),

    /// DNS responder error
    #[error("DNS error: {0}")]
    DnsError(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Network layer error
    #[error("Network error: {0}")]
    Network(#[from] veilnet_network::NetworkError),

    /// Identity error
    #[error("Identity error: {0}")]
    Crypto(#[from] veilnet_crypto::CryptoError),
}

/// Result type for exit operations
pub type ExitResult<T> = Result<T, ExitError>;
