//! The exit endpoint
//!
//! Ties the address map, session registry and packet pump together.
//! Every method here runs on the event-loop task; nothing blocks and
//! nothing is retried. Packets that cannot be delivered right now are
//! dropped with a warning.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tracing::{debug, info, warn};
use veilnet_crypto::{PathId, RouterId};
use veilnet_network::dns::{Message, QTYPE_A, QTYPE_PTR};
use veilnet_network::{IpRange, Ipv4Packet};

use crate::addr::AddressMap;
use crate::config::ExitConfig;
use crate::dns::is_exit_authority;
use crate::error::{ExitError, ExitResult};
use crate::link::{PathSink, RouterContext, TunSink};
use crate::policy::TrafficPolicy;
use crate::pump::{inbound_queue, InboundQueue, PacketSink};
use crate::registry::SessionRegistry;
use crate::session::{ExitSession, SnodeSession};
use crate::{Timestamp, EXIT_PAD_SIZE};

/// TTL on authoritative DNS answers
const DNS_TTL: u32 = 300;

/// The bridge between overlay paths and the local TUN interface
pub struct ExitEndpoint {
    name: String,
    permit_exit: bool,
    policy: TrafficPolicy,
    addrs: AddressMap,
    registry: SessionRegistry,
    inbound: InboundQueue,
    sink: PacketSink,
    router: Arc<dyn RouterContext>,
    links: Arc<dyn PathSink>,
    tun: Arc<dyn TunSink>,
}

impl ExitEndpoint {
    /// Build an endpoint from configuration.
    ///
    /// Fails when no `ifaddr` range is configured or the range has no
    /// allocatable address besides the gateway.
    pub fn new(
        config: &ExitConfig,
        router: Arc<dyn RouterContext>,
        links: Arc<dyn PathSink>,
        tun: Arc<dyn TunSink>,
    ) -> ExitResult<Self> {
        let range = config
            .ifaddr
            .ok_or_else(|| ExitError::ConfigError("ifaddr not configured".into()))?;
        let addrs = AddressMap::new(range)?;
        let (sink, inbound) = inbound_queue(config.inbound_queue_size);

        Ok(Self {
            name: config.name.clone(),
            permit_exit: config.permit_exit,
            policy: config.policy.clone(),
            addrs,
            registry: SessionRegistry::new(),
            inbound,
            sink,
            router,
            links,
            tun,
        })
    }

    /// Endpoint name, used as the log prefix
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The gateway address assigned to the TUN device
    pub fn if_addr(&self) -> Ipv4Addr {
        self.addrs.if_addr()
    }

    /// The full client allocation range
    pub fn our_range(&self) -> IpRange {
        self.addrs.range()
    }

    /// A producer handle for the TUN reader task
    pub fn packet_sink(&self) -> PacketSink {
        self.sink.clone()
    }

    /// Hand one raw packet from the Internet side to the pump.
    /// Callable from any task; never blocks.
    pub fn on_inet_packet(&self, buf: &[u8]) {
        self.sink.offer(buf);
    }

    /// True if `pk` currently has an address here
    pub fn has_local_mapped_addr_for(&self, pk: &RouterId) -> bool {
        self.addrs.has_local_mapped_addr_for(pk)
    }

    /// Get or allocate the address for an identity, applying the kick
    /// side-effects of LRU recycling to the session registry.
    pub fn get_ip_for_ident(&mut self, pk: RouterId) -> Ipv4Addr {
        let now = self.router.now_ms();
        let (ip, kicked) = self.addrs.get_ip_for_ident(pk, now);
        if let Some(victim) = kicked {
            let removed = self.registry.remove_all_for(&victim);
            info!(
                "{} recycled {} from {}, removed {} sessions",
                self.name, ip, victim, removed
            );
        }
        ip
    }

    /// Remove an identity's address and all its client sessions
    pub fn kick_ident(&mut self, pk: &RouterId) {
        if self.addrs.kick_ident(pk).is_some() {
            self.registry.remove_all_for(pk);
        }
    }

    /// Admit a client path requesting exit service.
    ///
    /// Refuses Internet egress when the exit is not permitted; paths
    /// that only want inbound overlay traffic are always admitted.
    pub fn allocate_new_exit(&mut self, pk: RouterId, path: PathId, want_internet: bool) -> bool {
        if want_internet && !self.permit_exit {
            return false;
        }
        let ip = self.get_ip_for_ident(pk);
        if self.router.transit_hop_previous_is_router(path, &pk) {
            // the path terminates at a service node; never build an
            // outbound snode session toward it
            self.addrs.mark_snode(pk);
        }
        let now = self.router.now_ms();
        self.registry
            .insert_exit(ExitSession::new(pk, path, !want_internet, ip, now));
        self.addrs.has_local_mapped_addr_for(&pk)
    }

    /// Find the session serving a path
    pub fn find_endpoint_by_path(&self, path: &PathId) -> Option<&ExitSession> {
        self.registry.find_by_path(path)
    }

    /// Bind a renegotiated path id to an identity. Refuses ids that
    /// are already bound; the old id must be dropped first.
    pub fn update_endpoint_path(&mut self, pk: RouterId, next: PathId) -> bool {
        self.registry.update_path(pk, next)
    }

    /// Drop a path binding (the path was torn down)
    pub fn del_endpoint_info(&mut self, path: &PathId) {
        self.registry.unbind_path(path);
    }

    /// Remove the one session matching (identity, path)
    pub fn remove_exit(&mut self, pk: &RouterId, path: PathId) -> bool {
        self.registry.remove_exit(pk, path)
    }

    /// Map a service node to an address, building the outbound session
    /// toward it the first time.
    pub fn obtain_snode_ip(&mut self, remote: RouterId) -> Ipv4Addr {
        let ip = self.get_ip_for_ident(remote);
        if self.addrs.mark_snode(remote) {
            let link = self.router.open_snode_session(remote, ip);
            self.registry.insert_snode(SnodeSession::new(remote, ip, link));
            info!("{} opened snode session with {}", self.name, remote);
        }
        ip
    }

    /// Write one overlay-decoded client packet out to the Internet.
    ///
    /// Non-IPv4 buffers and destinations barred by policy are dropped.
    pub fn queue_outbound_traffic(&mut self, buf: &[u8]) -> bool {
        let pkt = match Ipv4Packet::parse(buf) {
            Ok(pkt) => pkt,
            Err(e) => {
                debug!("{} dropping outbound packet: {}", self.name, e);
                return false;
            }
        };
        if !self.policy.allows(pkt.dst()) {
            debug!("{} egress to {} barred by policy", self.name, pkt.dst());
            return false;
        }
        self.tun.write_packet(pkt.into_bytes())
    }

    /// Hand a packet from a peer service node to the kernel, rewriting
    /// the destination to the gateway address so the host routing
    /// table accepts it.
    pub fn queue_snode_packet(&mut self, buf: &[u8], from: Ipv4Addr) -> bool {
        let mut pkt = match Ipv4Packet::parse(buf) {
            Ok(pkt) => pkt,
            Err(_) => return false,
        };
        pkt.set_dst(self.addrs.if_addr());
        let now = self.router.now_ms();
        self.addrs.mark_active(from, now);
        self.tun.write_packet(pkt.into_bytes())
    }

    /// Drain the inbound queue and flush every session.
    ///
    /// Runs once per event-loop tick, before [`Self::tick`].
    pub fn flush(&mut self) {
        let now = self.router.now_ms();
        while let Some(pkt) = self.inbound.try_pop() {
            let dst = pkt.dst();
            let Some(pk) = self.addrs.key_for_ip(dst) else {
                warn!("{} dropping packet, has no session at {}", self.name, dst);
                continue;
            };
            if self.addrs.is_snode(&pk) {
                // prefer the snode session we made; fall back to an
                // inbound session made by the other service node
                if let Some(session) = self.registry.snode_session_mut(&pk) {
                    if session.queue_upstream(&pkt, EXIT_PAD_SIZE) {
                        self.addrs.mark_active(dst, now);
                        continue;
                    }
                }
            }
            match self.registry.chosen_for_mut(&pk) {
                None => {
                    warn!(
                        "{} dropped inbound traffic for session {} as we have no working endpoints",
                        self.name, pk
                    );
                }
                Some(ep) => {
                    if ep.queue_inbound(pkt.into_bytes()) {
                        self.addrs.mark_active(dst, now);
                    } else {
                        warn!(
                            "{} dropped inbound traffic for session {} as we are overloaded",
                            self.name, pk
                        );
                    }
                }
            }
        }
        self.registry.flush_exits(self.links.as_ref());
        self.registry.flush_snodes();
    }

    /// Expire sessions, rebuild the chosen-exit view and run
    /// per-session upkeep. Always runs after [`Self::flush`].
    pub fn tick(&mut self, now: Timestamp) {
        self.registry.expire(now);
        self.registry.rebuild_chosen(now);
        self.registry.tick_sessions(now);
    }

    /// Ask every snode session to wind down
    pub fn stop(&mut self) {
        self.registry.stop_snodes();
    }

    /// True once every snode session has stopped
    pub fn should_remove(&self) -> bool {
        self.registry.snodes_stopped()
    }

    /// Whether the DNS responder should claim this query
    pub fn should_hook_dns_message(&self, msg: &Message) -> bool {
        is_exit_authority(msg, self.addrs.range())
    }

    /// Answer a claimed DNS query from the live address map.
    ///
    /// The first `A` query for an unmapped service node is what brings
    /// the outbound session to that node into existence.
    pub fn handle_hooked_dns_message(&mut self, msg: Message) -> Message {
        let Some(q) = msg.questions.first().cloned() else {
            return msg.servfail();
        };
        if q.qtype == QTYPE_PTR {
            let Some(ip) = veilnet_network::dns::decode_ptr_name(&q.qname) else {
                return msg.nxdomain();
            };
            if ip == self.addrs.if_addr() {
                let mut reply = msg.reply_to();
                let us = self.router.router_id();
                reply.push_ptr(&q.qname, &us.to_snode_name(), DNS_TTL);
                return reply;
            }
            match self.addrs.key_for_ip(ip) {
                Some(pk) if self.addrs.is_snode(&pk) => {
                    let mut reply = msg.reply_to();
                    reply.push_ptr(&q.qname, &pk.to_snode_name(), DNS_TTL);
                    reply
                }
                _ => msg.nxdomain(),
            }
        } else if q.qtype == QTYPE_A {
            let name = q.qname.trim_end_matches('.');
            let Ok(pk) = RouterId::from_snode_name(name) else {
                return msg.nxdomain();
            };
            if pk == self.router.router_id() {
                // our own name resolves to the gateway address
                let mut reply = msg.reply_to();
                reply.push_a(&q.qname, self.addrs.if_addr(), DNS_TTL);
                return reply;
            }
            if !self.addrs.is_snode(&pk) {
                let ip = self.obtain_snode_ip(pk);
                let mut reply = msg.reply_to();
                reply.push_a(&q.qname, ip, DNS_TTL);
                return reply;
            }
            match self.addrs.ip_for_key(&pk) {
                Some(ip) => {
                    let mut reply = msg.reply_to();
                    reply.push_a(&q.qname, ip, DNS_TTL);
                    reply
                }
                // marked as a snode but no mapping; should not happen
                None => msg.nxdomain(),
            }
        } else {
            msg.nxdomain()
        }
    }

    /// Packets dropped at the pump because the queue was full
    pub fn pump_drops(&self) -> u64 {
        self.inbound.dropped()
    }

    /// Number of live client sessions
    pub fn exit_count(&self) -> usize {
        self.registry.exit_count()
    }

    /// Number of live snode sessions
    pub fn snode_count(&self) -> usize {
        self.registry.snode_count()
    }
}
