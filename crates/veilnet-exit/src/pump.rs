//! Inbound Internet packet queue
//!
//! The TUN reader runs on its own task; the endpoint drains on the
//! event-loop task. The channel between them is the only cross-task
//! state in the whole subsystem: a bounded MPSC with a single
//! consumer. Enqueueing never blocks; a full queue drops the packet
//! and counts it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{trace, warn};
use veilnet_network::Ipv4Packet;

/// Producer half: parse raw TUN reads and offer them to the pump
#[derive(Clone)]
pub struct PacketSink {
    tx: mpsc::Sender<Ipv4Packet>,
    dropped: Arc<AtomicU64>,
}

/// Consumer half, drained during the endpoint's flush
pub struct InboundQueue {
    rx: mpsc::Receiver<Ipv4Packet>,
    dropped: Arc<AtomicU64>,
}

/// Create a bounded queue pair
pub fn inbound_queue(capacity: usize) -> (PacketSink, InboundQueue) {
    let (tx, rx) = mpsc::channel(capacity);
    let dropped = Arc::new(AtomicU64::new(0));
    (
        PacketSink {
            tx,
            dropped: dropped.clone(),
        },
        InboundQueue { rx, dropped },
    )
}

impl PacketSink {
    /// Offer one raw packet read from the device.
    ///
    /// Unparseable buffers are dropped silently; a full queue drops
    /// the packet with a warning. Never blocks.
    pub fn offer(&self, buf: &[u8]) {
        let pkt = match Ipv4Packet::parse(buf) {
            Ok(pkt) => pkt,
            Err(e) => {
                trace!("ignoring unparseable inet packet: {}", e);
                return;
            }
        };
        if self.tx.try_send(pkt).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("inbound packet queue full, dropping packet");
        }
    }

    /// Packets dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl InboundQueue {
    /// Take one queued packet, if any. Never blocks.
    pub fn try_pop(&mut self) -> Option<Ipv4Packet> {
        self.rx.try_recv().ok()
    }

    /// Packets dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn raw_packet(dst: Ipv4Addr) -> Vec<u8> {
        let mut pkt = vec![0u8; 28];
        pkt[0] = 0x45;
        pkt[2..4].copy_from_slice(&28u16.to_be_bytes());
        pkt[9] = 17;
        pkt[12..16].copy_from_slice(&Ipv4Addr::new(1, 2, 3, 4).octets());
        pkt[16..20].copy_from_slice(&dst.octets());
        pkt
    }

    #[tokio::test]
    async fn test_offer_and_pop() {
        let (sink, mut queue) = inbound_queue(4);
        sink.offer(&raw_packet(Ipv4Addr::new(10, 0, 0, 2)));

        let pkt = queue.try_pop().unwrap();
        assert_eq!(pkt.dst(), Ipv4Addr::new(10, 0, 0, 2));
        assert!(queue.try_pop().is_none());
    }

    #[tokio::test]
    async fn test_garbage_dropped_silently() {
        let (sink, mut queue) = inbound_queue(4);
        sink.offer(b"not an ip packet");
        assert!(queue.try_pop().is_none());
        assert_eq!(sink.dropped(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_refuses_and_counts() {
        let (sink, mut queue) = inbound_queue(2);
        for _ in 0..3 {
            sink.offer(&raw_packet(Ipv4Addr::new(10, 0, 0, 2)));
        }
        assert_eq!(sink.dropped(), 1);
        assert_eq!(queue.dropped(), 1);

        // the two oldest packets survived
        assert!(queue.try_pop().is_some());
        assert!(queue.try_pop().is_some());
        assert!(queue.try_pop().is_none());
    }
}
