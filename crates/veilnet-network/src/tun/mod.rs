//! TUN Device Abstraction
//!
//! Platform-agnostic TUN device interface. The exit endpoint only
//! talks to the trait; a "virtual" endpoint runs with no device at all.

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::{NetworkError, NetworkResult};

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::LinuxTun;

/// TUN device configuration
#[derive(Clone, Debug)]
pub struct TunConfig {
    /// Device name (e.g., "veilnet0")
    pub name: String,

    /// Device IP address (the exit gateway address)
    pub address: std::net::Ipv4Addr,

    /// Netmask prefix length
    pub netmask_bits: u8,

    /// Maximum transmission unit
    pub mtu: u16,
}

impl TunConfig {
    /// Check the configuration for values the kernel would reject
    pub fn validate(&self) -> NetworkResult<()> {
        if self.name.is_empty() || self.name == "auto" {
            return Err(NetworkError::ConfigError(format!(
                "invalid interface name: {:?}",
                self.name
            )));
        }
        if self.netmask_bits > 32 {
            return Err(NetworkError::ConfigError(format!(
                "invalid netmask bits: {}",
                self.netmask_bits
            )));
        }
        if self.mtu == 0 {
            return Err(NetworkError::ConfigError("mtu must be non-zero".into()));
        }
        Ok(())
    }

    /// Netmask in dotted form
    pub fn netmask(&self) -> std::net::Ipv4Addr {
        let mask = if self.netmask_bits == 0 {
            0
        } else {
            !0u32 << (32 - self.netmask_bits)
        };
        std::net::Ipv4Addr::from(mask)
    }
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: "veilnet0".to_string(),
            address: std::net::Ipv4Addr::new(10, 200, 0, 1),
            netmask_bits: 16,
            mtu: 1420,
        }
    }
}

/// Platform-agnostic TUN device trait
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Read one packet from the device
    async fn read(&self) -> NetworkResult<Bytes>;

    /// Write one packet to the device
    async fn write(&self, packet: &[u8]) -> NetworkResult<()>;

    /// Get device name
    fn name(&self) -> &str;

    /// Get device MTU
    fn mtu(&self) -> u16;

    /// Close the device
    async fn close(&self) -> NetworkResult<()>;
}

/// Create a TUN device for the current platform
pub async fn create_tun(config: TunConfig) -> NetworkResult<Box<dyn TunDevice>> {
    config.validate()?;

    #[cfg(target_os = "linux")]
    {
        let tun = LinuxTun::create(config).await?;
        Ok(Box::new(tun))
    }

    #[cfg(not(target_os = "linux"))]
    {
        Err(NetworkError::PlatformNotSupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_bad_names() {
        let mut config = TunConfig::default();
        config.name = String::new();
        assert!(config.validate().is_err());

        config.name = "auto".to_string();
        assert!(config.validate().is_err());

        config.name = "veilnet0".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_netmask() {
        let mut config = TunConfig::default();
        config.netmask_bits = 33;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_netmask_dotted() {
        let mut config = TunConfig::default();
        config.netmask_bits = 24;
        assert_eq!(config.netmask(), std::net::Ipv4Addr::new(255, 255, 255, 0));

        config.netmask_bits = 30;
        assert_eq!(
            config.netmask(),
            std::net::Ipv4Addr::new(255, 255, 255, 252)
        );
    }
}
