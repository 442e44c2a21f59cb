//! Exit DNS responder
//!
//! A recursive-style responder bound next to the TUN device. Queries
//! inside the exit's authority (reverse lookups in our range, `A`
//! lookups under `.snode`) are answered by the endpoint from its live
//! address map; everything else is relayed to an upstream resolver.
//!
//! The responder runs on its own task and owns no endpoint state:
//! claimed queries travel to the event-loop task over a channel and
//! come back through a oneshot reply slot.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};
use veilnet_crypto::SNODE_TLD;
use veilnet_network::dns::{Message, QTYPE_A, QTYPE_PTR};
use veilnet_network::IpRange;

use crate::error::{ExitError, ExitResult};

/// How long to wait for an upstream resolver
const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the endpoint to answer a claimed query
const HOOK_TIMEOUT: Duration = Duration::from_secs(2);

/// Fallback upstream when none is configured
fn default_upstream() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53)
}

/// A claimed query on its way to the endpoint's event loop
pub struct DnsHookRequest {
    pub message: Message,
    pub reply: oneshot::Sender<Message>,
}

/// Whether a query falls under the exit's authority
pub fn is_exit_authority(msg: &Message, our_range: IpRange) -> bool {
    let Some(q) = msg.questions.first() else {
        return false;
    };
    match q.qtype {
        QTYPE_PTR => veilnet_network::dns::decode_ptr_name(&q.qname)
            .map(|ip| our_range.contains(ip))
            .unwrap_or(false),
        QTYPE_A => q.qname.trim_end_matches('.').ends_with(SNODE_TLD),
        _ => false,
    }
}

/// Handle to the running responder task
pub struct DnsResponder {
    local_addr: SocketAddr,
    task: tokio::task::JoinHandle<()>,
}

impl DnsResponder {
    /// Bind and start serving.
    ///
    /// With no upstream configured, `8.8.8.8:53` is used.
    pub async fn start(
        listen: SocketAddr,
        upstreams: Vec<SocketAddr>,
        our_range: IpRange,
        hook: mpsc::Sender<DnsHookRequest>,
    ) -> ExitResult<Self> {
        let socket = UdpSocket::bind(listen)
            .await
            .map_err(|e| ExitError::DnsError(format!("bind {}: {}", listen, e)))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| ExitError::DnsError(e.to_string()))?;

        let upstreams = if upstreams.is_empty() {
            vec![default_upstream()]
        } else {
            upstreams
        };
        info!(
            "dns responder on {} forwarding to {:?}",
            local_addr, upstreams
        );

        let task = tokio::spawn(serve(Arc::new(socket), upstreams, our_range, hook));
        Ok(Self { local_addr, task })
    }

    /// The bound address (useful when listening on port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop serving
    pub fn stop(&self) {
        self.task.abort();
    }
}

async fn serve(
    socket: Arc<UdpSocket>,
    upstreams: Vec<SocketAddr>,
    our_range: IpRange,
    hook: mpsc::Sender<DnsHookRequest>,
) {
    let upstreams = Arc::new(upstreams);
    let mut buf = vec![0u8; 1500];
    loop {
        let (len, src) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                warn!("dns recv error: {}", e);
                continue;
            }
        };
        let raw = buf[..len].to_vec();
        let msg = match Message::parse(&raw) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("ignoring malformed dns query from {}: {}", src, e);
                continue;
            }
        };

        if is_exit_authority(&msg, our_range) {
            tokio::spawn(answer_hooked(socket.clone(), src, msg, hook.clone()));
        } else {
            tokio::spawn(relay_upstream(socket.clone(), src, raw, msg, upstreams.clone()));
        }
    }
}

/// Ship a claimed query to the endpoint and relay its answer
async fn answer_hooked(
    socket: Arc<UdpSocket>,
    src: SocketAddr,
    msg: Message,
    hook: mpsc::Sender<DnsHookRequest>,
) {
    let (tx, rx) = oneshot::channel();
    let request = DnsHookRequest {
        message: msg.clone(),
        reply: tx,
    };
    let reply = if hook.send(request).await.is_err() {
        msg.servfail()
    } else {
        match timeout(HOOK_TIMEOUT, rx).await {
            Ok(Ok(reply)) => reply,
            _ => msg.servfail(),
        }
    };
    if let Err(e) = socket.send_to(&reply.to_bytes(), src).await {
        warn!("dns reply to {} failed: {}", src, e);
    }
}

/// Relay a query we have no authority over to the upstream resolvers
async fn relay_upstream(
    socket: Arc<UdpSocket>,
    src: SocketAddr,
    raw: Vec<u8>,
    msg: Message,
    upstreams: Arc<Vec<SocketAddr>>,
) {
    for upstream in upstreams.iter() {
        match relay_one(&raw, *upstream).await {
            Ok(response) => {
                if let Err(e) = socket.send_to(&response, src).await {
                    warn!("dns relay reply to {} failed: {}", src, e);
                }
                return;
            }
            Err(e) => {
                debug!("upstream {} failed: {}", upstream, e);
            }
        }
    }
    warn!("all upstream resolvers failed for {}", src);
    let _ = socket.send_to(&msg.servfail().to_bytes(), src).await;
}

async fn relay_one(raw: &[u8], upstream: SocketAddr) -> ExitResult<Vec<u8>> {
    let sock = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| ExitError::DnsError(e.to_string()))?;
    sock.send_to(raw, upstream)
        .await
        .map_err(|e| ExitError::DnsError(e.to_string()))?;

    let mut buf = vec![0u8; 1500];
    let (len, _) = timeout(UPSTREAM_TIMEOUT, sock.recv_from(&mut buf))
        .await
        .map_err(|_| ExitError::DnsError("upstream timed out".into()))?
        .map_err(|e| ExitError::DnsError(e.to_string()))?;
    buf.truncate(len);
    Ok(buf)
}
