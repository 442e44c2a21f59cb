//! Linux TUN device implementation

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info};

use super::{TunConfig, TunDevice};
use crate::error::{NetworkError, NetworkResult};

/// Linux TUN device
pub struct LinuxTun {
    device: tokio::sync::Mutex<tun::AsyncDevice>,
    name: String,
    mtu: u16,
}

impl LinuxTun {
    /// Create a new Linux TUN device
    pub async fn create(config: TunConfig) -> NetworkResult<Self> {
        let mut tun_config = tun::Configuration::default();

        tun_config
            .name(&config.name)
            .address(config.address)
            .netmask(config.netmask())
            .mtu(config.mtu as i32)
            .up();

        tun_config.platform(|platform| {
            platform.packet_information(false);
        });

        let device = tun::create_as_async(&tun_config)
            .map_err(|e| NetworkError::TunError(format!("Failed to create TUN device: {}", e)))?;

        let name = config.name.clone();
        info!(
            "Created TUN device: {} with IP {}/{}",
            name, config.address, config.netmask_bits
        );

        Ok(Self {
            device: tokio::sync::Mutex::new(device),
            name,
            mtu: config.mtu,
        })
    }
}

#[async_trait]
impl TunDevice for LinuxTun {
    async fn read(&self) -> NetworkResult<Bytes> {
        let mut buf = vec![0u8; self.mtu as usize + 4];
        let mut device = self.device.lock().await;

        let n = device
            .read(&mut buf)
            .await
            .map_err(|e| NetworkError::TunError(format!("Failed to read from TUN: {}", e)))?;

        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    async fn write(&self, packet: &[u8]) -> NetworkResult<()> {
        let mut device = self.device.lock().await;

        device
            .write_all(packet)
            .await
            .map_err(|e| NetworkError::TunError(format!("Failed to write to TUN: {}", e)))?;

        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    async fn close(&self) -> NetworkResult<()> {
        // device is closed on drop
        debug!("Closing TUN device: {}", self.name);
        Ok(())
    }
}
