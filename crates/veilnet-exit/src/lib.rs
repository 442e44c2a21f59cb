//! Veilnet Exit Endpoint
//!
//! The bridge between the overlay's path-addressed packet world and a
//! kernel TUN interface. The endpoint:
//! - allocates client addresses from a configured CIDR range with LRU
//!   recycling under pressure
//! - keeps a bidirectional identity map between router keys and
//!   allocated addresses
//! - tracks exit sessions per client and peer sessions per service node
//! - pumps inbound Internet packets to the right overlay session on
//!   each event-loop tick
//! - answers `.snode` and reverse DNS queries consistently with the
//!   live address map

pub mod addr;
pub mod config;
pub mod dns;
pub mod endpoint;
pub mod error;
pub mod link;
pub mod policy;
pub mod pump;
pub mod registry;
pub mod service;
pub mod session;

pub use addr::AddressMap;
pub use config::ExitConfig;
pub use dns::{DnsHookRequest, DnsResponder};
pub use endpoint::ExitEndpoint;
pub use error::{ExitError, ExitResult};
pub use link::{PathSink, RouterContext, SnodeLink, TunSink};
pub use policy::TrafficPolicy;
pub use pump::{InboundQueue, PacketSink};
pub use registry::SessionRegistry;
pub use service::{ExitService, NullTunSink, TunWriter};
pub use session::{ExitSession, SnodeSession};

/// Milliseconds since an arbitrary monotonic origin
pub type Timestamp = u64;

/// Pad size applied to upstream service-node traffic
pub const EXIT_PAD_SIZE: usize = 512;

/// Default capacity of the inbound Internet packet queue
pub const DEFAULT_INBOUND_QUEUE: usize = 1024;

/// Session lifetime before forced expiry
pub const SESSION_LIFETIME_MS: Timestamp = 600_000;

/// A session with no traffic for this long looks dead
pub const SESSION_DEAD_TIMEOUT_MS: Timestamp = 10_000;

/// Per-session cap on queued downstream frames
pub const MAX_DOWNSTREAM_FRAMES: usize = 128;

/// Interval between endpoint flush/tick rounds
pub const TICK_INTERVAL_MS: u64 = 250;
