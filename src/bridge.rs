//! Bridge core: owns the TUN device and the sink table, dispatches mesh lifecycle
//! events to attach/detach, and runs the bidirectional packet-forwarding datapath.
//!
//! Grounded on the original bridge's `IPV6Transport` for startup/attach/detach/read-loop
//! sequencing, and on the teacher's `Router` (native thread plus explicit join on
//! shutdown, no daemon-thread reliance) for the concurrency shape.

use crate::addr::Addr;
use crate::config::BridgeConfig;
use crate::error::SinkError;
use crate::mesh::{MeshEvent, SinkManager};
use crate::osnet::{self, OsFacade, PacketIo, RealOsFacade};
use crate::sink::SinkEndpoint;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{error, info, warn};

const TUN_NAME: &str = "tun_wirepas";
const TUN_OWNER: &str = "wirepas";
const NEXT_HEADER_UDP: u8 = 17;
const NEXT_HEADER_ICMPV6: u8 = 58;
/// Matches the original's hardcoded `ip -6 route add ... metric 1`.
const SINK_ROUTE_METRIC: u32 = 1;

/// Sink table: indexed both by sink id (lifecycle dispatch) and by mesh address
/// (outbound datapath lookup), per the dual-index recommendation.
#[derive(Default)]
struct SinkTable {
    by_id: HashMap<String, Arc<SinkEndpoint>>,
    by_mesh_addr: HashMap<u32, Arc<SinkEndpoint>>,
}

impl SinkTable {
    fn insert(&mut self, endpoint: Arc<SinkEndpoint>) {
        self.by_mesh_addr.insert(endpoint.mesh_addr(), Arc::clone(&endpoint));
        self.by_id.insert(endpoint.sink_id().to_string(), endpoint);
    }

    fn remove(&mut self, sink_id: &str) -> Option<Arc<SinkEndpoint>> {
        let endpoint = self.by_id.remove(sink_id)?;
        self.by_mesh_addr.remove(&endpoint.mesh_addr());
        Some(endpoint)
    }

    fn get_by_id(&self, sink_id: &str) -> Option<Arc<SinkEndpoint>> {
        self.by_id.get(sink_id).cloned()
    }

    fn get_by_mesh_addr(&self, mesh_addr: u32) -> Option<Arc<SinkEndpoint>> {
        self.by_mesh_addr.get(&mesh_addr).cloned()
    }
}

/// Owns the TUN device, the sink table, and the worker threads that drive the
/// datapath.
pub struct Bridge {
    config: BridgeConfig,
    nw_prefix: Addr,
    sink_manager: Arc<dyn SinkManager>,
    os: Arc<dyn OsFacade>,
    sinks: Mutex<SinkTable>,
    tun: Arc<Mutex<Box<dyn PacketIo>>>,
    tun_reader_handle: Mutex<Option<JoinHandle<()>>>,
    running: Arc<std::sync::atomic::AtomicBool>,
    with_listeners: bool,
}

impl Bridge {
    /// Run the real startup sequence: remove any stale TUN, create and open it,
    /// discover the external prefix, install the default route, and attach every sink
    /// the mesh SDK already knows about.
    pub fn start(config: BridgeConfig, sink_manager: Arc<dyn SinkManager>) -> anyhow::Result<Arc<Self>> {
        let os: Arc<dyn OsFacade> = Arc::new(RealOsFacade);
        os.tun_destroy(TUN_NAME)?;
        let owner_uid = nix::unistd::User::from_name(TUN_OWNER)?
            .map(|user| user.uid.as_raw())
            .unwrap_or_else(|| {
                warn!(user = TUN_OWNER, "tun owner user not found, leaving tun device unowned");
                u32::MAX
            });
        let owner_uid = (owner_uid != u32::MAX).then_some(owner_uid);
        let tun = osnet::tun_open(TUN_NAME, owner_uid)?;
        os.tun_up(TUN_NAME)?;

        let nw_prefix = os.discover_external_prefix(&config.external_interface)?;
        os.route_replace(&nw_prefix, &config.external_interface)?;
        info!(prefix = %nw_prefix, interface = %config.external_interface, "external prefix discovered");

        Self::new(config, sink_manager, os, Box::new(tun), nw_prefix, true)
    }

    /// Construct a bridge over an already-discovered prefix and an already-open TUN
    /// handle. Used by [`Bridge::start`] for the real path and directly by tests with a
    /// [`crate::osnet::test_support::FakeOsFacade`] and
    /// [`crate::osnet::test_support::FakeTun`].
    pub fn new(
        config: BridgeConfig,
        sink_manager: Arc<dyn SinkManager>,
        os: Arc<dyn OsFacade>,
        tun: Box<dyn PacketIo>,
        nw_prefix: Addr,
        with_listeners: bool,
    ) -> anyhow::Result<Arc<Self>> {
        let bridge = Arc::new(Self {
            config,
            nw_prefix,
            sink_manager,
            os,
            sinks: Mutex::new(SinkTable::default()),
            tun: Arc::new(Mutex::new(tun)),
            tun_reader_handle: Mutex::new(None),
            running: Arc::new(std::sync::atomic::AtomicBool::new(true)),
            with_listeners,
        });

        for sink in bridge.sink_manager.get_sinks() {
            let sink_id = sink.sink_id().to_string();
            if let Err(e) = bridge.attach(&sink_id) {
                warn!(sink_id = %sink_id, error = %e, "initial sink attach skipped");
            }
        }

        bridge.clone().spawn_tun_reader();
        Ok(bridge)
    }

    pub fn nw_prefix(&self) -> Addr {
        self.nw_prefix
    }

    /// Attach `sink_id`: publish its network-config TLV, then either refresh it in
    /// place (already attached with the same mesh address) or build a fresh endpoint
    /// (new sink, or the mesh address changed since the last attach) and install its
    /// /96 route and host address on the TUN.
    ///
    /// Idempotent: refreshing the TLV never touches the listener, route, or address of
    /// an already-attached sink, so a repeated `SinkConnected`/`StackStarted` pair for
    /// the same sink never double-binds its UDP listener.
    pub fn attach(&self, sink_id: &str) -> Result<(), SinkError> {
        let sink = self
            .sink_manager
            .get_sink(sink_id)
            .ok_or_else(|| SinkError::Mesh {
                sink_id: sink_id.to_string(),
                detail: "unknown sink".to_string(),
            })?;

        let mesh_addr = SinkEndpoint::publish_network_config(
            &sink,
            sink_id,
            &self.nw_prefix,
            self.config.off_mesh_service.as_ref(),
        )?;

        let already = self.sinks.lock().unwrap().get_by_id(sink_id);
        if let Some(prior) = &already {
            if prior.mesh_addr() == mesh_addr {
                return Ok(());
            }
            // Mesh address changed under the same sink id: tear down the stale route,
            // address, and listener before building the replacement.
            if let Err(e) = self.os.route_del(&prior.subnet(), TUN_NAME) {
                warn!(sink_id, error = %e, "failed to remove stale sink route before reattach");
            }
            if let Err(e) = self.os.addr_del(&prior.host_addr(), TUN_NAME) {
                warn!(sink_id, error = %e, "failed to remove stale sink address before reattach");
            }
            prior.stop();
        }

        let endpoint = SinkEndpoint::build(
            sink_id.to_string(),
            sink,
            Arc::clone(&self.os),
            &self.nw_prefix,
            mesh_addr,
            self.config.external_interface.clone(),
            self.with_listeners,
        )?;

        self.os.route_add(&endpoint.subnet(), TUN_NAME, SINK_ROUTE_METRIC)?;
        self.os.addr_add(&endpoint.host_addr(), TUN_NAME)?;
        self.sinks.lock().unwrap().insert(endpoint);
        Ok(())
    }

    /// Detach `sink_id`: remove its route and address from the TUN, stop its listener,
    /// and evict it from the table. A detach for an unknown sink is a logged no-op.
    pub fn detach(&self, sink_id: &str) {
        let endpoint = self.sinks.lock().unwrap().remove(sink_id);
        let Some(endpoint) = endpoint else {
            info!(sink_id, "detach requested for sink not in table, ignoring");
            return;
        };
        if let Err(e) = self.os.route_del(&endpoint.subnet(), TUN_NAME) {
            warn!(sink_id, error = %e, "failed to remove sink route on detach");
        }
        if let Err(e) = self.os.addr_del(&endpoint.host_addr(), TUN_NAME) {
            warn!(sink_id, error = %e, "failed to remove sink address on detach");
        }
        endpoint.stop();
    }

    /// Dispatch a mesh lifecycle/data event. `sink_connected`/`stack_started` attach;
    /// `sink_disconnected`/`stack_stopped` detach; `data_received` refreshes the NDP
    /// cache and writes the payload to the TUN.
    pub fn handle_mesh_event(&self, event: MeshEvent) {
        match event {
            MeshEvent::SinkConnected { sink_id } | MeshEvent::StackStarted { sink_id } => {
                if let Err(e) = self.attach(&sink_id) {
                    warn!(sink_id = %sink_id, error = %e, "sink attach skipped");
                }
            }
            MeshEvent::SinkDisconnected { sink_id } | MeshEvent::StackStopped { sink_id } => {
                self.detach(&sink_id);
            }
            MeshEvent::DataReceived {
                sink_id,
                src,
                dst: _,
                src_ep,
                dst_ep,
                data,
            } => {
                self.handle_inbound(&sink_id, src, src_ep, dst_ep, &data);
            }
        }
    }

    fn handle_inbound(&self, sink_id: &str, src: u32, src_ep: u8, dst_ep: u8, data: &[u8]) {
        use crate::netconfig::WIREPAS_IPV6_EP;
        if src_ep != WIREPAS_IPV6_EP || dst_ep != WIREPAS_IPV6_EP {
            return;
        }
        let endpoint = self.sinks.lock().unwrap().get_by_id(sink_id);
        if let Some(endpoint) = endpoint {
            if let Err(e) = endpoint.add_ndp_entry(src) {
                warn!(sink_id, error = %e, "failed to learn ndp entry on inbound frame");
            }
        }
        if let Err(e) = self.tun.lock().unwrap().send(data) {
            error!(sink_id, error = %e, "failed to write inbound packet to TUN");
        }
    }

    fn spawn_tun_reader(self: Arc<Self>) {
        let tun = Arc::clone(&self.tun);
        let running = Arc::clone(&self.running);
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 2048];
            while running.load(std::sync::atomic::Ordering::SeqCst) {
                let read = tun.lock().unwrap().recv(&mut buf);
                match read {
                    Ok(0) => continue,
                    Ok(n) => self.handle_outbound(&buf[..n]),
                    Err(e) => {
                        error!(error = %e, "TUN read failed");
                        break;
                    }
                }
            }
        });
        *self.tun_reader_handle.lock().unwrap() = Some(handle);
    }

    /// Parse one IPv6 packet read from the TUN and forward it to the owning sink.
    fn handle_outbound(&self, packet: &[u8]) {
        if packet.len() < 40 {
            return;
        }
        let next_header = packet[6];
        if next_header != NEXT_HEADER_UDP && next_header != NEXT_HEADER_ICMPV6 {
            return;
        }
        let Ok(dst) = Addr::from_be_bytes_slice(&packet[24..40], 128) else {
            return;
        };
        if dst.is_link_local_multicast() {
            return;
        }
        let Ok(sink_addr) = dst.sink_addr() else {
            return;
        };
        let Ok(node_addr) = dst.node_addr() else {
            return;
        };

        let endpoint = self.sinks.lock().unwrap().get_by_mesh_addr(sink_addr);
        match endpoint {
            Some(endpoint) => {
                if let Err(e) = endpoint.send_data(node_addr, packet) {
                    error!(sink_addr = format!("{sink_addr:#010x}"), error = %e, "send_data failed");
                }
            }
            None => {
                warn!(sink_addr = format!("{sink_addr:#010x}"), "no sink with this mesh address, dropping packet");
            }
        }
    }

    /// Stop the TUN reader, detach every sink, and remove the TUN device.
    pub fn shutdown(&self) {
        self.running.store(false, std::sync::atomic::Ordering::SeqCst);
        let sink_ids: Vec<String> = self.sinks.lock().unwrap().by_id.keys().cloned().collect();
        for sink_id in sink_ids {
            self.detach(&sink_id);
        }
        if let Err(e) = self.os.tun_destroy(TUN_NAME) {
            warn!(error = %e, "failed to remove TUN device on shutdown");
        }
        info!("bridge shut down");
    }
}
