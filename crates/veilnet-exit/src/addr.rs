//! Client address allocation
//!
//! One abstraction owns both halves of the identity mapping and the
//! activity clock used for recycling, so the inverse invariant between
//! `key -> ip` and `ip -> key` can never be broken from outside.
//!
//! Allocation walks the range once; after the range is exhausted the
//! address with the oldest packet activity is reclaimed and its
//! identity kicked. Recycling by packet activity rather than session
//! age means idle-but-established sessions are evicted before busy
//! ones.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::Ipv4Addr;

use tracing::{error, info};
use veilnet_crypto::RouterId;
use veilnet_network::IpRange;

use crate::error::{ExitError, ExitResult};
use crate::Timestamp;

/// Bidirectional identity map plus the LRU address pool
pub struct AddressMap {
    range: IpRange,
    if_addr: Ipv4Addr,
    next_addr: u32,
    highest_addr: u32,
    key_to_ip: HashMap<RouterId, Ipv4Addr>,
    ip_to_key: HashMap<Ipv4Addr, RouterId>,
    ip_activity: HashMap<Ipv4Addr, Timestamp>,
    /// Addresses returned by kicks, reusable before LRU recycling
    free_addrs: BTreeSet<u32>,
    snode_keys: HashSet<RouterId>,
}

impl AddressMap {
    /// Create an address map over a CIDR range.
    ///
    /// The range's own address is the gateway and is never handed out;
    /// a range with no other address fails here.
    pub fn new(range: IpRange) -> ExitResult<Self> {
        let if_addr = range.addr();
        let highest_addr = u32::from(range.highest());
        if highest_addr <= u32::from(if_addr) {
            return Err(ExitError::DegenerateRange(range.to_string()));
        }
        Ok(Self {
            range,
            if_addr,
            next_addr: u32::from(if_addr),
            highest_addr,
            key_to_ip: HashMap::new(),
            ip_to_key: HashMap::new(),
            ip_activity: HashMap::new(),
            free_addrs: BTreeSet::new(),
            snode_keys: HashSet::new(),
        })
    }

    /// The gateway address
    pub fn if_addr(&self) -> Ipv4Addr {
        self.if_addr
    }

    /// The full allocation range
    pub fn range(&self) -> IpRange {
        self.range
    }

    /// True if `pk` currently has an address
    pub fn has_local_mapped_addr_for(&self, pk: &RouterId) -> bool {
        self.key_to_ip.contains_key(pk)
    }

    /// Address currently mapped to `pk`
    pub fn ip_for_key(&self, pk: &RouterId) -> Option<Ipv4Addr> {
        self.key_to_ip.get(pk).copied()
    }

    /// Identity currently mapped to `ip`
    pub fn key_for_ip(&self, ip: Ipv4Addr) -> Option<RouterId> {
        self.ip_to_key.get(&ip).copied()
    }

    /// Record packet activity for an address
    pub fn mark_active(&mut self, ip: Ipv4Addr, now: Timestamp) {
        self.ip_activity.insert(ip, now);
    }

    /// Mark `pk` as a service node. Returns true when newly marked.
    pub fn mark_snode(&mut self, pk: RouterId) -> bool {
        self.snode_keys.insert(pk)
    }

    /// True if `pk` is marked as a service node
    pub fn is_snode(&self, pk: &RouterId) -> bool {
        self.snode_keys.contains(pk)
    }

    /// Get or allocate the address for an identity.
    ///
    /// Returns the address, plus the identity that was kicked to free
    /// it when the pool had to recycle. Idempotent per key: calling
    /// again without an intervening kick returns the same address.
    pub fn get_ip_for_ident(&mut self, pk: RouterId, now: Timestamp) -> (Ipv4Addr, Option<RouterId>) {
        if let Some(ip) = self.key_to_ip.get(&pk) {
            let ip = *ip;
            self.mark_active(ip, now);
            return (ip, None);
        }

        let (ip, kicked) = self.allocate();
        if let Some(prev) = self.key_to_ip.insert(pk, ip) {
            // should be unreachable after the mapped check above;
            // left as observed, not repaired
            error!("failed to map {} to {}: already mapped to {}", pk, ip, prev);
        }
        if let Some(prev) = self.ip_to_key.insert(ip, pk) {
            error!("failed to map {} to {}: already bound to {}", ip, pk, prev);
        }
        info!("mapping {} to {}", pk, ip);
        self.mark_active(ip, now);
        (ip, kicked)
    }

    /// Remove an identity's mapping and activity entry.
    ///
    /// Service-node membership is left untouched; that lifecycle is
    /// driven by session expiry, not by the pool.
    pub fn kick_ident(&mut self, pk: &RouterId) -> Option<Ipv4Addr> {
        let ip = self.key_to_ip.remove(pk)?;
        self.ip_to_key.remove(&ip);
        self.ip_activity.remove(&ip);
        self.free_addrs.insert(u32::from(ip));
        info!("kicking {} off exit", pk);
        Some(ip)
    }

    /// Number of mapped identities
    pub fn len(&self) -> usize {
        self.key_to_ip.len()
    }

    /// True when no identities are mapped
    pub fn is_empty(&self) -> bool {
        self.key_to_ip.is_empty()
    }

    /// Hand out a fresh address, recycling the least recently active
    /// one once the range is exhausted. Ties break toward the lowest
    /// address so recycling is deterministic.
    fn allocate(&mut self) -> (Ipv4Addr, Option<RouterId>) {
        if self.next_addr < self.highest_addr {
            self.next_addr += 1;
            return (Ipv4Addr::from(self.next_addr), None);
        }

        // prefer addresses handed back by earlier kicks
        let freed = self.free_addrs.iter().next().copied();
        if let Some(ip) = freed {
            self.free_addrs.remove(&ip);
            return (Ipv4Addr::from(ip), None);
        }

        let mut found: Option<(Ipv4Addr, Timestamp)> = None;
        for (&ip, &ts) in &self.ip_activity {
            let better = match found {
                None => true,
                Some((best_ip, best_ts)) => {
                    ts < best_ts || (ts == best_ts && u32::from(ip) < u32::from(best_ip))
                }
            };
            if better {
                found = Some((ip, ts));
            }
        }

        // the range is exhausted and nothing is free, so every
        // address holds a mapping with an activity entry
        let (ip, _) = found.expect("exhausted range with no activity entries");
        let kicked = self.ip_to_key.get(&ip).copied();
        if let Some(pk) = kicked {
            self.kick_ident(&pk);
            self.free_addrs.remove(&u32::from(ip));
        }
        (ip, kicked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pk(n: u8) -> RouterId {
        RouterId::from_bytes([n; 32])
    }

    fn map(cidr: &str) -> AddressMap {
        AddressMap::new(cidr.parse().unwrap()).unwrap()
    }

    #[test]
    fn test_rejects_degenerate_range() {
        assert!(AddressMap::new("10.0.0.1/32".parse().unwrap()).is_err());
        assert!(AddressMap::new("10.0.0.1/31".parse().unwrap()).is_ok());
    }

    #[test]
    fn test_sequential_allocation_skips_gateway() {
        let mut addrs = map("10.0.0.1/29");

        let (a, _) = addrs.get_ip_for_ident(pk(1), 1);
        let (b, _) = addrs.get_ip_for_ident(pk(2), 2);
        assert_eq!(a, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(b, Ipv4Addr::new(10, 0, 0, 3));
        assert_ne!(a, addrs.if_addr());
    }

    #[test]
    fn test_idempotent_per_key() {
        let mut addrs = map("10.0.0.1/24");
        let (a, _) = addrs.get_ip_for_ident(pk(1), 1);
        let (b, _) = addrs.get_ip_for_ident(pk(1), 5);
        assert_eq!(a, b);
        assert_eq!(addrs.len(), 1);
    }

    #[test]
    fn test_inverse_invariant() {
        let mut addrs = map("10.0.0.1/24");
        for n in 1..50u8 {
            addrs.get_ip_for_ident(pk(n), n as Timestamp);
        }
        for n in 1..50u8 {
            let ip = addrs.ip_for_key(&pk(n)).unwrap();
            assert_eq!(addrs.key_for_ip(ip), Some(pk(n)));
        }
    }

    #[test]
    fn test_lru_eviction_prefers_oldest_activity() {
        // /30: gateway 10.0.0.1, allocatable .2 and .3
        let mut addrs = map("10.0.0.1/30");

        let (a, _) = addrs.get_ip_for_ident(pk(1), 0);
        let (b, _) = addrs.get_ip_for_ident(pk(2), 0);
        assert_eq!(a, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(b, Ipv4Addr::new(10, 0, 0, 3));

        addrs.mark_active(a, 1);
        addrs.mark_active(b, 2);

        let (c, kicked) = addrs.get_ip_for_ident(pk(3), 3);
        assert_eq!(c, a);
        assert_eq!(kicked, Some(pk(1)));
        assert!(!addrs.has_local_mapped_addr_for(&pk(1)));
        assert_eq!(addrs.key_for_ip(c), Some(pk(3)));
    }

    #[test]
    fn test_lru_tie_breaks_toward_lowest_address() {
        let mut addrs = map("10.0.0.1/30");
        addrs.get_ip_for_ident(pk(1), 7);
        addrs.get_ip_for_ident(pk(2), 7);

        // identical timestamps: .2 is reclaimed first
        let (ip, kicked) = addrs.get_ip_for_ident(pk(3), 8);
        assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(kicked, Some(pk(1)));
    }

    #[test]
    fn test_kick_clears_activity_but_not_snode_mark() {
        let mut addrs = map("10.0.0.1/24");
        let (ip, _) = addrs.get_ip_for_ident(pk(1), 1);
        addrs.mark_snode(pk(1));

        assert_eq!(addrs.kick_ident(&pk(1)), Some(ip));
        assert!(!addrs.has_local_mapped_addr_for(&pk(1)));
        assert_eq!(addrs.key_for_ip(ip), None);
        assert!(addrs.is_snode(&pk(1)));

        // kicking again is a no-op
        assert_eq!(addrs.kick_ident(&pk(1)), None);
    }

    #[test]
    fn test_freed_address_reused_before_lru() {
        let mut addrs = map("10.0.0.1/30");
        let (a, _) = addrs.get_ip_for_ident(pk(1), 1);
        let (_b, _) = addrs.get_ip_for_ident(pk(2), 2);

        addrs.kick_ident(&pk(1));

        // the freed address comes back without evicting pk(2)
        let (c, kicked) = addrs.get_ip_for_ident(pk(3), 3);
        assert_eq!(c, a);
        assert_eq!(kicked, None);
        assert!(addrs.has_local_mapped_addr_for(&pk(2)));
    }

    #[test]
    fn test_single_client_range_recycles() {
        // /31: gateway .0, one allocatable address .1
        let mut addrs = map("10.0.0.0/31");

        let (a, none) = addrs.get_ip_for_ident(pk(1), 1);
        assert_eq!(none, None);
        let (b, kicked) = addrs.get_ip_for_ident(pk(2), 2);
        assert_eq!(a, b);
        assert_eq!(kicked, Some(pk(1)));
    }
}
