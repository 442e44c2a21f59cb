//! IPv4 packet parsing and rewriting
//!
//! The exit endpoint only ever needs a thin view over raw IPv4 packets:
//! read the addresses, and rewrite one of them while keeping the header
//! and transport checksums valid.

use std::net::Ipv4Addr;

use bytes::{Bytes, BytesMut};

use crate::checksum::{ipv4_header_checksum, update_checksum_addr};
use crate::error::{NetworkError, NetworkResult};

/// Minimum IPv4 header size
pub const IPV4_MIN_HEADER: usize = 20;

const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;

/// A parsed IPv4 packet backed by an owned buffer
#[derive(Debug, Clone)]
pub struct Ipv4Packet {
    data: BytesMut,
}

impl Ipv4Packet {
    /// Parse a raw buffer as IPv4.
    ///
    /// Validates version, header length and total length; the buffer is
    /// truncated to the packet's total length field.
    pub fn parse(buf: &[u8]) -> NetworkResult<Self> {
        if buf.len() < IPV4_MIN_HEADER {
            return Err(NetworkError::InvalidPacket(format!(
                "short packet: {} bytes",
                buf.len()
            )));
        }
        if buf[0] >> 4 != 4 {
            return Err(NetworkError::InvalidPacket(format!(
                "not IPv4: version {}",
                buf[0] >> 4
            )));
        }
        let ihl = ((buf[0] & 0x0F) as usize) * 4;
        if ihl < IPV4_MIN_HEADER {
            return Err(NetworkError::InvalidPacket(format!("bad IHL: {}", ihl)));
        }
        let total_len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
        if total_len < ihl || total_len > buf.len() {
            return Err(NetworkError::InvalidPacket(format!(
                "bad total length {} for {} byte buffer",
                total_len,
                buf.len()
            )));
        }

        let mut data = BytesMut::with_capacity(total_len);
        data.extend_from_slice(&buf[..total_len]);
        Ok(Self { data })
    }

    fn ihl(&self) -> usize {
        ((self.data[0] & 0x0F) as usize) * 4
    }

    /// Transport protocol number
    pub fn protocol(&self) -> u8 {
        self.data[9]
    }

    /// Source address
    pub fn src(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[12], self.data[13], self.data[14], self.data[15])
    }

    /// Destination address
    pub fn dst(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.data[16], self.data[17], self.data[18], self.data[19])
    }

    /// Packet length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// True if the packet holds no payload bytes beyond the header
    pub fn is_empty(&self) -> bool {
        self.data.len() <= self.ihl()
    }

    /// Rewrite the destination address, fixing checksums
    pub fn set_dst(&mut self, new: Ipv4Addr) {
        let old = self.dst();
        self.data[16..20].copy_from_slice(&new.octets());
        self.fix_checksums(old, new);
    }

    /// Rewrite the source address, fixing checksums
    pub fn set_src(&mut self, new: Ipv4Addr) {
        let old = self.src();
        self.data[12..16].copy_from_slice(&new.octets());
        self.fix_checksums(old, new);
    }

    /// Recompute the header checksum and incrementally patch the
    /// transport checksum for an address change (the pseudo-header
    /// covers both addresses).
    fn fix_checksums(&mut self, old: Ipv4Addr, new: Ipv4Addr) {
        let ihl = self.ihl();

        self.data[10] = 0;
        self.data[11] = 0;
        let header_csum = ipv4_header_checksum(&self.data[..ihl]);
        self.data[10..12].copy_from_slice(&header_csum.to_be_bytes());

        let csum_off = match self.protocol() {
            PROTO_TCP => ihl + 16,
            PROTO_UDP => ihl + 6,
            _ => return,
        };
        if self.data.len() < csum_off + 2 {
            return;
        }
        let old_csum = u16::from_be_bytes([self.data[csum_off], self.data[csum_off + 1]]);
        // a zero UDP checksum means "not computed"; leave it alone
        if self.protocol() == PROTO_UDP && old_csum == 0 {
            return;
        }
        let mut new_csum = update_checksum_addr(old_csum, old, new);
        if self.protocol() == PROTO_UDP && new_csum == 0 {
            new_csum = 0xFFFF;
        }
        self.data[csum_off..csum_off + 2].copy_from_slice(&new_csum.to_be_bytes());
    }

    /// Raw packet bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume into an immutable buffer
    pub fn into_bytes(self) -> Bytes {
        self.data.freeze()
    }
}
