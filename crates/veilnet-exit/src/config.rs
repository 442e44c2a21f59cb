//! Exit endpoint configuration
//!
//! Options arrive as textual `key=value` pairs, the way the router's
//! config file hands them down. Unknown keys are ignored so old nodes
//! accept configs written for newer ones.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;

use tracing::info;
use veilnet_network::IpRange;

use crate::error::{ExitError, ExitResult};
use crate::policy::TrafficPolicy;
use crate::DEFAULT_INBOUND_QUEUE;

/// Default DNS port
const DNS_PORT: u16 = 53;

/// Exit endpoint configuration
#[derive(Debug, Clone)]
pub struct ExitConfig {
    /// Endpoint name, used as the log prefix
    pub name: String,
    /// TUN device name
    pub ifname: String,
    /// Gateway address and allocation range
    pub ifaddr: Option<IpRange>,
    /// Permit Internet egress
    pub permit_exit: bool,
    /// Initialize a kernel TUN device (`type = null` disables it)
    pub init_tun: bool,
    /// Address the DNS responder binds to
    pub local_dns: SocketAddr,
    /// Upstream resolvers for queries outside our authority
    pub upstream_dns: Vec<SocketAddr>,
    /// TUN device MTU
    pub mtu: u16,
    /// Capacity of the inbound Internet packet queue
    pub inbound_queue_size: usize,
    /// Allow/deny rules for egress destinations
    pub policy: TrafficPolicy,
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            name: "exit".to_string(),
            ifname: "veilnet0".to_string(),
            ifaddr: None,
            permit_exit: false,
            init_tun: true,
            local_dns: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DNS_PORT),
            upstream_dns: Vec::new(),
            mtu: 1420,
            inbound_queue_size: DEFAULT_INBOUND_QUEUE,
            policy: TrafficPolicy::default(),
        }
    }
}

impl ExitConfig {
    /// Create a config with a given endpoint name
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Apply one textual option. Unknown keys are ignored.
    pub fn set_option(&mut self, key: &str, value: &str) -> ExitResult<()> {
        match key {
            "type" => {
                if value == "null" {
                    self.init_tun = false;
                }
            }
            "exit" => {
                self.permit_exit = is_true_value(value);
            }
            "local-dns" => {
                self.local_dns = parse_resolver_addr(value)?;
                info!("{} local dns set to {}", self.name, self.local_dns);
            }
            "upstream-dns" => {
                let addr = parse_resolver_addr(value)?;
                self.upstream_dns.push(addr);
                info!("{} adding upstream dns {}", self.name, addr);
            }
            "ifaddr" => {
                let range = IpRange::from_str(value)
                    .map_err(|e| ExitError::ConfigError(format!("ifaddr: {}", e)))?;
                info!(
                    "{} set ifaddr range to {} lo={} hi={}",
                    self.name,
                    range,
                    range.addr(),
                    range.highest()
                );
                self.ifaddr = Some(range);
            }
            "ifname" => {
                self.ifname = value.to_string();
                info!("{} set ifname to {}", self.name, self.ifname);
            }
            "mtu" => {
                self.mtu = value
                    .parse()
                    .map_err(|_| ExitError::ConfigError(format!("bad mtu: {}", value)))?;
            }
            "exit-whitelist" => {
                self.policy.add_allow(value)?;
            }
            "exit-blacklist" => {
                self.policy.add_deny(value)?;
            }
            _ => {} // forward-compatible: unknown keys are ignored
        }
        Ok(())
    }
}

/// Truthy values accepted in config files
fn is_true_value(v: &str) -> bool {
    matches!(
        v.to_ascii_lowercase().as_str(),
        "true" | "yes" | "on" | "1"
    )
}

/// Parse `host` or `host:port`, defaulting to port 53
fn parse_resolver_addr(v: &str) -> ExitResult<SocketAddr> {
    if let Ok(addr) = v.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let (host, port) = match v.rsplit_once(':') {
        Some((h, p)) => (
            h,
            p.parse::<u16>()
                .map_err(|_| ExitError::ConfigError(format!("bad resolver port: {}", v)))?,
        ),
        None => (v, DNS_PORT),
    };
    let ip: IpAddr = host
        .parse()
        .map_err(|_| ExitError::ConfigError(format!("bad resolver address: {}", v)))?;
    Ok(SocketAddr::new(ip, port))
}
