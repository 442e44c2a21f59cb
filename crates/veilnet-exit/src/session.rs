//! Exit and service-node sessions
//!
//! An `ExitSession` is one client path consuming egress through this
//! endpoint; several may exist per identity while the client rebuilds
//! paths. A `SnodeSession` is the single outbound session we hold
//! toward another service node, created on demand by DNS resolution.

use std::collections::VecDeque;
use std::net::Ipv4Addr;

use bytes::Bytes;
use tracing::trace;
use veilnet_crypto::{PathId, RouterId};
use veilnet_network::Ipv4Packet;

use crate::link::{PathSink, SnodeLink};
use crate::{Timestamp, MAX_DOWNSTREAM_FRAMES, SESSION_DEAD_TIMEOUT_MS, SESSION_LIFETIME_MS};

/// A client session bound to one overlay path
pub struct ExitSession {
    remote: RouterId,
    path_id: PathId,
    /// Client only wants inbound overlay traffic, not Internet egress
    inbound_only: bool,
    ip: Ipv4Addr,
    created_at: Timestamp,
    last_active: Timestamp,
    tx_this_tick: u64,
    rx_this_tick: u64,
    tx_bytes: u64,
    rx_bytes: u64,
    downstream: VecDeque<Bytes>,
}

impl ExitSession {
    /// Create a session for a freshly admitted path
    pub fn new(
        remote: RouterId,
        path_id: PathId,
        inbound_only: bool,
        ip: Ipv4Addr,
        now: Timestamp,
    ) -> Self {
        Self {
            remote,
            path_id,
            inbound_only,
            ip,
            created_at: now,
            last_active: now,
            tx_this_tick: 0,
            rx_this_tick: 0,
            tx_bytes: 0,
            rx_bytes: 0,
            downstream: VecDeque::new(),
        }
    }

    /// The client identity
    pub fn remote(&self) -> RouterId {
        self.remote
    }

    /// The overlay path this session rides on
    pub fn path_id(&self) -> PathId {
        self.path_id
    }

    /// The address allocated to the client
    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    /// When the session was admitted
    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    /// True when the client declined Internet egress
    pub fn is_inbound_only(&self) -> bool {
        self.inbound_only
    }

    /// Total bytes queued toward the client
    pub fn tx_bytes(&self) -> u64 {
        self.tx_bytes
    }

    /// Total bytes the client has sent through us
    pub fn rx_bytes(&self) -> u64 {
        self.rx_bytes
    }

    /// Queue one Internet packet toward the client.
    ///
    /// Refuses when the downstream queue is full; the pump drops the
    /// packet and logs in that case.
    pub fn queue_inbound(&mut self, frame: Bytes) -> bool {
        if self.downstream.len() >= MAX_DOWNSTREAM_FRAMES {
            return false;
        }
        self.tx_this_tick += frame.len() as u64;
        self.tx_bytes += frame.len() as u64;
        self.downstream.push_back(frame);
        true
    }

    /// Record traffic arriving from the client over the overlay
    pub fn record_remote_activity(&mut self, now: Timestamp, bytes: usize) {
        self.last_active = now;
        self.rx_this_tick += bytes as u64;
        self.rx_bytes += bytes as u64;
    }

    /// Write queued frames to the link layer.
    ///
    /// Returns false when the link refused frames; refused frames are
    /// dropped rather than retried, matching the no-blocking rule.
    pub fn flush(&mut self, links: &dyn PathSink) -> bool {
        let mut ok = true;
        while let Some(frame) = self.downstream.pop_front() {
            if !links.send_on_path(self.path_id, frame) {
                ok = false;
            }
        }
        ok
    }

    /// No traffic from the client recently
    pub fn looks_dead(&self, now: Timestamp) -> bool {
        now.saturating_sub(self.last_active) >= SESSION_DEAD_TIMEOUT_MS
    }

    /// Hard lifetime reached
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now.saturating_sub(self.created_at) >= SESSION_LIFETIME_MS
    }

    /// Per-tick upkeep; clears the rate counters
    pub fn tick(&mut self, _now: Timestamp) {
        if self.tx_this_tick > 0 || self.rx_this_tick > 0 {
            trace!(
                "session {} on {} tx={} rx={}",
                self.remote,
                self.path_id,
                self.tx_this_tick,
                self.rx_this_tick
            );
        }
        self.tx_this_tick = 0;
        self.rx_this_tick = 0;
    }
}

/// Our outbound session to another service node
pub struct SnodeSession {
    remote: RouterId,
    /// Destination rewrite target for packets we hand to the kernel
    ip: Ipv4Addr,
    link: Box<dyn SnodeLink>,
}

impl SnodeSession {
    /// Wrap an outbound link-layer session
    pub fn new(remote: RouterId, ip: Ipv4Addr, link: Box<dyn SnodeLink>) -> Self {
        Self { remote, ip, link }
    }

    /// The peer service node
    pub fn remote(&self) -> RouterId {
        self.remote
    }

    /// The address mapped to the peer
    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    /// Queue one packet upstream to the peer
    pub fn queue_upstream(&mut self, pkt: &Ipv4Packet, pad_to: usize) -> bool {
        self.link
            .queue_upstream(Bytes::copy_from_slice(pkt.as_bytes()), pad_to)
    }

    /// Flush queued frames to the link layer
    pub fn flush(&mut self) -> bool {
        self.link.flush()
    }

    /// Session-reported expiry
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.link.is_expired(now)
    }

    /// Ask the underlying session to stop
    pub fn stop(&mut self) {
        self.link.stop();
    }

    /// True once the underlying session stopped
    pub fn is_stopped(&self) -> bool {
        self.link.is_stopped()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingSink {
        sent: AtomicUsize,
        accept: bool,
    }

    impl PathSink for CountingSink {
        fn send_on_path(&self, _path: PathId, _frame: Bytes) -> bool {
            if self.accept {
                self.sent.fetch_add(1, Ordering::Relaxed);
            }
            self.accept
        }
    }

    fn session(now: Timestamp) -> ExitSession {
        ExitSession::new(
            RouterId::from_bytes([1; 32]),
            PathId::from_bytes([2; 16]),
            false,
            Ipv4Addr::new(10, 0, 0, 2),
            now,
        )
    }

    #[test]
    fn test_queue_bounded() {
        let mut s = session(0);
        for _ in 0..MAX_DOWNSTREAM_FRAMES {
            assert!(s.queue_inbound(Bytes::from_static(b"pkt")));
        }
        assert!(!s.queue_inbound(Bytes::from_static(b"pkt")));
    }

    #[test]
    fn test_flush_drains_queue() {
        let mut s = session(0);
        s.queue_inbound(Bytes::from_static(b"a"));
        s.queue_inbound(Bytes::from_static(b"b"));

        let sink = Arc::new(CountingSink {
            sent: AtomicUsize::new(0),
            accept: true,
        });
        assert!(s.flush(&*sink));
        assert_eq!(sink.sent.load(Ordering::Relaxed), 2);

        // queue is empty afterwards
        assert!(s.flush(&*sink));
        assert_eq!(sink.sent.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_flush_reports_refused_frames() {
        let mut s = session(0);
        s.queue_inbound(Bytes::from_static(b"a"));

        let sink = CountingSink {
            sent: AtomicUsize::new(0),
            accept: false,
        };
        assert!(!s.flush(&sink));
    }

    #[test]
    fn test_liveness() {
        let mut s = session(1_000);
        assert!(!s.looks_dead(2_000));
        assert!(s.looks_dead(1_000 + SESSION_DEAD_TIMEOUT_MS));

        s.record_remote_activity(20_000, 64);
        assert!(!s.looks_dead(25_000));
        assert_eq!(s.rx_bytes(), 64);
    }

    #[test]
    fn test_expiry() {
        let s = session(0);
        assert!(!s.is_expired(SESSION_LIFETIME_MS - 1));
        assert!(s.is_expired(SESSION_LIFETIME_MS));
    }

    #[test]
    fn test_tick_resets_rates() {
        let mut s = session(0);
        s.queue_inbound(Bytes::from_static(b"abcd"));
        s.record_remote_activity(1, 10);
        s.tick(2);
        // totals survive the tick
        assert_eq!(s.tx_bytes(), 4);
        assert_eq!(s.rx_bytes(), 10);
    }
}
