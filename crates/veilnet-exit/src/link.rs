//! Collaborator seams
//!
//! The exit endpoint never talks to the link layer, path subsystem or
//! kernel directly; it goes through these capability traits. The
//! router process implements them for real, tests implement them with
//! recording stubs.

use std::net::Ipv4Addr;

use bytes::Bytes;
use veilnet_crypto::{PathId, RouterId};

use crate::Timestamp;

/// What the owning router supplies to the endpoint
pub trait RouterContext: Send + Sync {
    /// Monotonic time in milliseconds
    fn now_ms(&self) -> Timestamp;

    /// Our own identity
    fn router_id(&self) -> RouterId;

    /// Whether the previous hop of a transit path is the router `id`
    /// itself, meaning the path terminates at a service node rather
    /// than a client
    fn transit_hop_previous_is_router(&self, path: PathId, id: &RouterId) -> bool;

    /// Build an outbound link-layer session toward another service
    /// node. Connecting happens asynchronously inside the link layer;
    /// the handle queues traffic until then.
    fn open_snode_session(&self, remote: RouterId, rewrite_ip: Ipv4Addr) -> Box<dyn SnodeLink>;
}

/// Transmit seam toward overlay paths
pub trait PathSink: Send + Sync {
    /// Queue one frame for transmission on a path. Returns false when
    /// the link layer cannot take the frame right now.
    fn send_on_path(&self, path: PathId, frame: Bytes) -> bool;
}

/// An outbound link-layer session to another service node
pub trait SnodeLink: Send {
    /// Queue one packet upstream, padded to a multiple of `pad_to`
    fn queue_upstream(&mut self, frame: Bytes, pad_to: usize) -> bool;

    /// Write queued frames out. Returns false when frames were dropped.
    fn flush(&mut self) -> bool;

    /// Session-reported expiry
    fn is_expired(&self, now: Timestamp) -> bool;

    /// Ask the session to wind down
    fn stop(&mut self);

    /// True once the session has fully stopped
    fn is_stopped(&self) -> bool;
}

/// Non-blocking write seam toward the TUN device
pub trait TunSink: Send + Sync {
    /// Enqueue one packet for the kernel. Returns false when the
    /// writer is backed up and the packet was dropped.
    fn write_packet(&self, pkt: Bytes) -> bool;
}
