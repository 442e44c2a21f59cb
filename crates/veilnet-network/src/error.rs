//! Network error types

use thiserror::Error;

/// Network layer errors
#[derive(Debug, Error)]
pub enum NetworkError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TUN device error
    #[error("TUN device error: {0}")]
    TunError(String),

    /// Invalid packet
    #[error("Invalid packet: {0}")]
    InvalidPacket(String),

    /// Malformed DNS message
    #[error("DNS decode error: {0}")]
    DnsDecode(String),

    /// Invalid CIDR range
    #[error("Invalid CIDR range: {0}")]
    InvalidRange(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Bind error
    #[error("Bind error: {0}")]
    BindError(String),

    /// Platform not supported
    #[error("Platform not supported for this operation")]
    PlatformNotSupported,
}

/// Result type for network operations
pub type NetworkResult<T> = Result<T, NetworkError>;
