//! Exit traffic policy
//!
//! A coarse allow/deny hook over destination addresses. Rules are
//! accepted from configuration and stored; the default policy permits
//! everything, deny rules always win, and the presence of any allow
//! rule turns the baseline into deny-by-default.

use std::net::Ipv4Addr;
use std::str::FromStr;

use veilnet_network::IpRange;

use crate::error::{ExitError, ExitResult};

/// Allow/deny lists over destination ranges
#[derive(Debug, Clone, Default)]
pub struct TrafficPolicy {
    allow: Vec<IpRange>,
    deny: Vec<IpRange>,
}

impl TrafficPolicy {
    /// Parse a rule as a CIDR range, or a single address as a /32
    fn parse_rule(rule: &str) -> ExitResult<IpRange> {
        if rule.contains('/') {
            return IpRange::from_str(rule).map_err(ExitError::Network);
        }
        let addr: Ipv4Addr = rule
            .parse()
            .map_err(|_| ExitError::ConfigError(format!("bad policy rule: {}", rule)))?;
        IpRange::new(addr, 32).map_err(ExitError::Network)
    }

    /// Add a whitelist rule
    pub fn add_allow(&mut self, rule: &str) -> ExitResult<()> {
        self.allow.push(Self::parse_rule(rule)?);
        Ok(())
    }

    /// Add a blacklist rule
    pub fn add_deny(&mut self, rule: &str) -> ExitResult<()> {
        self.deny.push(Self::parse_rule(rule)?);
        Ok(())
    }

    /// Number of configured rules
    pub fn len(&self) -> usize {
        self.allow.len() + self.deny.len()
    }

    /// True when no rules are configured
    pub fn is_empty(&self) -> bool {
        self.allow.is_empty() && self.deny.is_empty()
    }

    /// Decide whether egress to `dst` is permitted
    pub fn allows(&self, dst: Ipv4Addr) -> bool {
        if self.deny.iter().any(|r| r.contains(dst)) {
            return false;
        }
        if self.allow.is_empty() {
            return true;
        }
        self.allow.iter().any(|r| r.contains(dst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_permits_everything() {
        let policy = TrafficPolicy::default();
        assert!(policy.allows(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn test_deny_wins() {
        let mut policy = TrafficPolicy::default();
        policy.add_deny("10.0.0.0/8").unwrap();
        assert!(!policy.allows(Ipv4Addr::new(10, 1, 2, 3)));
        assert!(policy.allows(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn test_allow_list_is_deny_by_default() {
        let mut policy = TrafficPolicy::default();
        policy.add_allow("1.1.1.1").unwrap();
        assert!(policy.allows(Ipv4Addr::new(1, 1, 1, 1)));
        assert!(!policy.allows(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn test_deny_beats_allow() {
        let mut policy = TrafficPolicy::default();
        policy.add_allow("1.0.0.0/8").unwrap();
        policy.add_deny("1.1.1.0/24").unwrap();
        assert!(!policy.allows(Ipv4Addr::new(1, 1, 1, 1)));
        assert!(policy.allows(Ipv4Addr::new(1, 2, 3, 4)));
    }

    #[test]
    fn test_rejects_malformed_rule() {
        let mut policy = TrafficPolicy::default();
        assert!(policy.add_allow("not-an-ip").is_err());
    }
}
