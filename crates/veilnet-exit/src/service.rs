//! Exit service wiring
//!
//! Owns the event loop that drives an [`ExitEndpoint`]: a TUN reader
//! task feeding the pump, a writer task draining toward the kernel,
//! the DNS responder, and the tick loop. All endpoint state is touched
//! from exactly one task; the other tasks only talk over channels.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use tokio::time::{interval, Duration};
use tracing::{info, warn};
use veilnet_network::tun::{create_tun, TunConfig, TunDevice};

use crate::config::ExitConfig;
use crate::dns::{DnsHookRequest, DnsResponder};
use crate::endpoint::ExitEndpoint;
use crate::error::{ExitError, ExitResult};
use crate::link::{PathSink, RouterContext, TunSink};
use crate::TICK_INTERVAL_MS;

/// Packets queued from the event loop toward the TUN writer task
const TUN_WRITE_QUEUE: usize = 512;

/// Non-blocking [`TunSink`] backed by the writer task
pub struct TunWriter {
    tx: mpsc::Sender<Bytes>,
}

impl TunSink for TunWriter {
    fn write_packet(&self, pkt: Bytes) -> bool {
        self.tx.try_send(pkt).is_ok()
    }
}

/// Sink for "virtual" endpoints running without a device; accepts and
/// discards everything
pub struct NullTunSink;

impl TunSink for NullTunSink {
    fn write_packet(&self, _pkt: Bytes) -> bool {
        true
    }
}

/// A running exit endpoint with its device and DNS plumbing
pub struct ExitService {
    endpoint: ExitEndpoint,
    router: Arc<dyn RouterContext>,
    hook_rx: mpsc::Receiver<DnsHookRequest>,
    // kept so the hook channel never closes on a virtual endpoint
    _hook_tx: mpsc::Sender<DnsHookRequest>,
    dns: Option<DnsResponder>,
    shutdown: Arc<Notify>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ExitService {
    /// Build the endpoint, bring up the TUN device and DNS responder
    /// (unless the endpoint is virtual), and wire the tasks together.
    pub async fn start(
        config: ExitConfig,
        router: Arc<dyn RouterContext>,
        links: Arc<dyn PathSink>,
    ) -> ExitResult<Self> {
        let range = config
            .ifaddr
            .ok_or_else(|| ExitError::ConfigError("ifaddr not configured".into()))?;

        let mut tasks = Vec::new();
        let (write_tx, mut write_rx) = mpsc::channel::<Bytes>(TUN_WRITE_QUEUE);

        let tun_sink: Arc<dyn TunSink> = if config.init_tun {
            Arc::new(TunWriter { tx: write_tx })
        } else {
            Arc::new(NullTunSink)
        };

        let endpoint = ExitEndpoint::new(&config, router.clone(), links, tun_sink)?;

        let (hook_tx, hook_rx) = mpsc::channel(64);
        let mut dns = None;

        if config.init_tun {
            let device: Arc<dyn TunDevice> = Arc::from(
                create_tun(TunConfig {
                    name: config.ifname.clone(),
                    address: range.addr(),
                    netmask_bits: range.netmask_bits(),
                    mtu: config.mtu,
                })
                .await?,
            );

            let reader = device.clone();
            let sink = endpoint.packet_sink();
            tasks.push(tokio::spawn(async move {
                loop {
                    match reader.read().await {
                        Ok(buf) => sink.offer(&buf),
                        Err(e) => {
                            warn!("tun read failed: {}", e);
                            break;
                        }
                    }
                }
            }));

            let writer = device.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(pkt) = write_rx.recv().await {
                    if let Err(e) = writer.write(&pkt).await {
                        warn!("tun write failed: {}", e);
                    }
                }
            }));

            dns = Some(
                DnsResponder::start(
                    config.local_dns,
                    config.upstream_dns.clone(),
                    range,
                    hook_tx.clone(),
                )
                .await?,
            );
        }

        Ok(Self {
            endpoint,
            router,
            hook_rx,
            _hook_tx: hook_tx,
            dns,
            shutdown: Arc::new(Notify::new()),
            tasks,
        })
    }

    /// Handle used to stop the service from another task
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Immutable access to the endpoint
    pub fn endpoint(&self) -> &ExitEndpoint {
        &self.endpoint
    }

    /// Mutable access to the endpoint, for admitting paths
    pub fn endpoint_mut(&mut self) -> &mut ExitEndpoint {
        &mut self.endpoint
    }

    /// Drive the endpoint until shutdown.
    ///
    /// Flush always completes before tick; DNS hooks interleave
    /// between rounds, never inside one.
    pub async fn run(mut self) -> ExitResult<()> {
        let mut ticker = interval(Duration::from_millis(TICK_INTERVAL_MS));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.endpoint.flush();
                    let now = self.router.now_ms();
                    self.endpoint.tick(now);
                }
                Some(req) = self.hook_rx.recv() => {
                    let reply = self.endpoint.handle_hooked_dns_message(req.message);
                    let _ = req.reply.send(reply);
                }
                _ = self.shutdown.notified() => {
                    info!("{} stopping", self.endpoint.name());
                    self.endpoint.stop();
                    if let Some(dns) = &self.dns {
                        dns.stop();
                    }
                    for task in &self.tasks {
                        task.abort();
                    }
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicU64, Ordering};
    use veilnet_crypto::{PathId, RouterId};
    use crate::link::SnodeLink;
    use crate::Timestamp;

    struct StubRouter {
        id: RouterId,
        start: std::time::Instant,
        opened: AtomicU64,
    }

    impl RouterContext for StubRouter {
        fn now_ms(&self) -> Timestamp {
            self.start.elapsed().as_millis() as Timestamp
        }

        fn router_id(&self) -> RouterId {
            self.id
        }

        fn transit_hop_previous_is_router(&self, _path: PathId, _id: &RouterId) -> bool {
            false
        }

        fn open_snode_session(
            &self,
            _remote: RouterId,
            _rewrite_ip: Ipv4Addr,
        ) -> Box<dyn SnodeLink> {
            self.opened.fetch_add(1, Ordering::Relaxed);
            Box::new(StubLink { stopped: false })
        }
    }

    struct StubLink {
        stopped: bool,
    }

    impl SnodeLink for StubLink {
        fn queue_upstream(&mut self, _frame: Bytes, _pad_to: usize) -> bool {
            true
        }
        fn flush(&mut self) -> bool {
            true
        }
        fn is_expired(&self, _now: Timestamp) -> bool {
            false
        }
        fn stop(&mut self) {
            self.stopped = true;
        }
        fn is_stopped(&self) -> bool {
            self.stopped
        }
    }

    struct DropSink;

    impl PathSink for DropSink {
        fn send_on_path(&self, _path: PathId, _frame: Bytes) -> bool {
            true
        }
    }

    fn virtual_config() -> ExitConfig {
        let mut config = ExitConfig::named("svc-test");
        config.set_option("ifaddr", "10.77.0.1/24").unwrap();
        config.set_option("type", "null").unwrap();
        config.set_option("exit", "true").unwrap();
        config
    }

    fn stub_router() -> Arc<StubRouter> {
        Arc::new(StubRouter {
            id: RouterId::from_bytes([3; 32]),
            start: std::time::Instant::now(),
            opened: AtomicU64::new(0),
        })
    }

    #[tokio::test]
    async fn test_virtual_service_runs_and_stops() {
        let service = ExitService::start(virtual_config(), stub_router(), Arc::new(DropSink))
            .await
            .unwrap();
        let shutdown = service.shutdown_handle();

        let handle = tokio::spawn(service.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.notify_one();

        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_virtual_service_admits_paths() {
        let mut service = ExitService::start(virtual_config(), stub_router(), Arc::new(DropSink))
            .await
            .unwrap();

        let pk = RouterId::from_bytes([8; 32]);
        let path = PathId::from_bytes([1; 16]);
        assert!(service.endpoint_mut().allocate_new_exit(pk, path, true));
        assert!(service.endpoint().has_local_mapped_addr_for(&pk));
    }

    #[tokio::test]
    async fn test_service_requires_ifaddr() {
        let config = ExitConfig::named("svc-test");
        let result = ExitService::start(config, stub_router(), Arc::new(DropSink)).await;
        assert!(result.is_err());
    }
}
