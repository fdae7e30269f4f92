//! Per-sink endpoint: attach (TLV publish + listener startup), the NDP-proxy cache,
//! and the wake-and-join shutdown protocol.
//!
//! Grounded directly on the original bridge's per-sink worker: a UDP listener bound to
//! the sink's host address multiplexed against a wakeup channel, an idempotent NDP-add/
//! remove cache, and a stop sequence that joins the listener before tearing down proxy
//! entries.

use crate::addr::Addr;
use crate::error::{SinkError, SinkResult};
use crate::mesh::Sink;
use crate::netconfig::{AppConfigEnvelope, NetworkConfig, WIREPAS_IPV6_EP};
use crate::osnet::OsFacade;
use nix::libc;
use std::collections::HashSet;
use std::net::{SocketAddr, SocketAddrV6};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

const UDP_INTERFACE_PORT: u16 = 6666;
const BROADCAST_NODE: u32 = 0xffff_ffff;

/// A single sink's bridge-side state: its mesh address, derived addresses, NDP-proxy
/// cache, and listener thread.
pub struct SinkEndpoint {
    sink_id: String,
    sink: Arc<dyn Sink>,
    os: Arc<dyn OsFacade>,
    external_interface: String,
    mesh_addr: u32,
    host_addr: Addr,
    subnet: Addr,
    ndp_cache: Mutex<HashSet<u32>>,
    running: Arc<AtomicBool>,
    wakeup: Mutex<Option<OwnedFd>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SinkEndpoint {
    /// Attach to `sink`: read its configuration (failing if the stack hasn't started),
    /// publish the current network config into its app-config TLV, derive its host and
    /// subnet addresses, install the broadcast NDP-proxy entry, and start the listener.
    ///
    /// `with_listener` is `true` for every real attach; tests that only need the TLV
    /// exchange and the NDP/forwarding bookkeeping pass `false` to skip binding a UDP
    /// socket to an address the test has not actually configured on any interface.
    pub fn attach(
        sink_id: String,
        sink: Arc<dyn Sink>,
        os: Arc<dyn OsFacade>,
        nw_prefix: &Addr,
        off_mesh_service: Option<&Addr>,
        external_interface: String,
        with_listener: bool,
    ) -> SinkResult<Arc<Self>> {
        let mesh_addr = Self::publish_network_config(&sink, &sink_id, nw_prefix, off_mesh_service)?;
        Self::build(sink_id, sink, os, nw_prefix, mesh_addr, external_interface, with_listener)
    }

    /// Read `sink`'s current app-config TLV, refresh its network-config record (bumping
    /// the nonce if one was already present, starting fresh at nonce 0 otherwise), and
    /// write it back. Returns the sink's mesh address.
    ///
    /// Safe to call on a sink that is already attached: it only touches the TLV, so a
    /// reattach with an unchanged mesh address can use it to refresh the config without
    /// rebuilding the endpoint or its listener.
    pub fn publish_network_config(
        sink: &Arc<dyn Sink>,
        sink_id: &str,
        nw_prefix: &Addr,
        off_mesh_service: Option<&Addr>,
    ) -> SinkResult<u32> {
        let config = sink
            .read_config()
            .map_err(|detail| SinkError::Mesh { sink_id: sink_id.to_string(), detail })?;
        if !config.started {
            return Err(SinkError::StackNotStarted(sink_id.to_string()));
        }

        let mut envelope = AppConfigEnvelope::decode(&config.app_config_data).unwrap_or_else(|e| {
            warn!(sink_id = %sink_id, error = %e, "app-config envelope unreadable, starting fresh");
            AppConfigEnvelope::empty()
        });
        let mut net_config = match envelope.network_config() {
            Some(mut existing) => {
                existing.increment_nonce();
                existing
            }
            None => NetworkConfig::fresh(),
        };
        net_config.set_prefix(nw_prefix);
        if let Some(addr) = off_mesh_service {
            net_config.set_off_mesh_service(addr);
        }
        envelope.set_network_config(&net_config);

        sink.write_config(crate::mesh::SinkConfig {
            started: config.started,
            node_address: config.node_address,
            app_config_data: envelope.encode(),
            app_config_diag: config.app_config_diag,
            app_config_seq: 0,
        })
        .map_err(|detail| SinkError::Mesh { sink_id: sink_id.to_string(), detail })?;

        Ok(config.node_address)
    }

    /// Build the endpoint around an already-published sink: derive its host and subnet
    /// addresses, install the broadcast NDP-proxy entry, and start the listener.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        sink_id: String,
        sink: Arc<dyn Sink>,
        os: Arc<dyn OsFacade>,
        nw_prefix: &Addr,
        mesh_addr: u32,
        external_interface: String,
        with_listener: bool,
    ) -> SinkResult<Arc<Self>> {
        let host_addr = Addr::from_prefix_and_sink(nw_prefix, mesh_addr)?;
        let subnet = host_addr.sink_subnet();

        let endpoint = Arc::new(Self {
            sink_id: sink_id.clone(),
            sink,
            os,
            external_interface,
            mesh_addr,
            host_addr,
            subnet,
            ndp_cache: Mutex::new(HashSet::new()),
            running: Arc::new(AtomicBool::new(true)),
            wakeup: Mutex::new(None),
            listener: Mutex::new(None),
        });

        endpoint.add_ndp_entry(BROADCAST_NODE)?;
        if with_listener {
            endpoint.clone().spawn_listener()?;
        }

        info!(sink_id = %sink_id, mesh_addr = format!("{mesh_addr:#010x}"), %host_addr, "sink attached");
        Ok(endpoint)
    }

    pub fn sink_id(&self) -> &str {
        &self.sink_id
    }

    pub fn mesh_addr(&self) -> u32 {
        self.mesh_addr
    }

    pub fn host_addr(&self) -> Addr {
        self.host_addr
    }

    pub fn subnet(&self) -> Addr {
        self.subnet
    }

    /// Idempotently install a proxy-NDP entry for `node` under this sink.
    pub fn add_ndp_entry(&self, node: u32) -> SinkResult<()> {
        let mut cache = self.ndp_cache.lock().unwrap();
        if cache.contains(&node) {
            return Ok(());
        }
        let addr = Addr::from_prefix_sink_and_node(&self.host_addr.network_prefix(), self.mesh_addr, node)?;
        self.os.ndp_proxy_add(&addr, &self.external_interface)?;
        cache.insert(node);
        debug!(sink_id = %self.sink_id, node = format!("{node:#010x}"), "ndp proxy entry added");
        Ok(())
    }

    /// Idempotently remove the proxy-NDP entry for `node`, if present.
    pub fn remove_ndp_entry(&self, node: u32) -> SinkResult<()> {
        let mut cache = self.ndp_cache.lock().unwrap();
        if !cache.remove(&node) {
            debug!(sink_id = %self.sink_id, node = format!("{node:#010x}"), "ndp proxy entry already absent");
            return Ok(());
        }
        let addr = Addr::from_prefix_sink_and_node(&self.host_addr.network_prefix(), self.mesh_addr, node)?;
        self.os.ndp_proxy_del(&addr, &self.external_interface)?;
        Ok(())
    }

    /// Forward `payload` to `node` over the mesh on the bridge's reserved endpoint.
    pub fn send_data(&self, node: u32, payload: &[u8]) -> SinkResult<()> {
        self.sink
            .send_data(node, WIREPAS_IPV6_EP, WIREPAS_IPV6_EP, 1, 0, payload, false, 0)
            .map_err(|detail| SinkError::Mesh { sink_id: self.sink_id.clone(), detail })
    }

    fn spawn_listener(self: Arc<Self>) -> SinkResult<()> {
        use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

        let (wakeup_w, wakeup_r) =
            socketpair(AddressFamily::Unix, SockType::Stream, None, SockFlag::empty())
                .map_err(|e| SinkError::Mesh {
                    sink_id: self.sink_id.clone(),
                    detail: format!("socketpair: {e}"),
                })?;
        *self.wakeup.lock().unwrap() = Some(wakeup_w);

        let socket_addr = SocketAddr::V6(SocketAddrV6::new(
            self.host_addr.bytes().into(),
            UDP_INTERFACE_PORT,
            0,
            0,
        ));
        let udp = bind_udp_freebind(socket_addr).map_err(|e| SinkError::Mesh {
            sink_id: self.sink_id.clone(),
            detail: format!("bind {socket_addr}: {e}"),
        })?;
        udp.set_nonblocking(true).ok();

        let endpoint = Arc::clone(&self);
        let handle = std::thread::spawn(move || endpoint.listen_loop(udp, wakeup_r));
        *self.listener.lock().unwrap() = Some(handle);
        Ok(())
    }

    fn listen_loop(self: Arc<Self>, udp: std::net::UdpSocket, wakeup_r: OwnedFd) {
        use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

        let mut buf = [0u8; 1500];
        loop {
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            let mut fds = [
                PollFd::new(udp.as_fd(), PollFlags::POLLIN),
                PollFd::new(wakeup_r.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(e) => {
                    warn!(sink_id = %self.sink_id, error = %e, "listener poll failed");
                    break;
                }
            }
            if fds[1].revents().map(|r| r.contains(PollFlags::POLLIN)).unwrap_or(false) {
                let mut drain = [0u8; 1];
                let _ = nix::unistd::read(wakeup_r.as_raw_fd(), &mut drain);
                continue;
            }
            if fds[0].revents().map(|r| r.contains(PollFlags::POLLIN)).unwrap_or(false) {
                if let Ok((_, SocketAddr::V6(from))) = udp.recv_from(&mut buf) {
                    let octets = from.ip().octets();
                    if let Ok(addr) = Addr::from_be_bytes_slice(&octets, 128) {
                        if let Ok(node_idx) = addr.node_addr() {
                            if let Err(e) = self.add_ndp_entry(node_idx) {
                                warn!(sink_id = %self.sink_id, error = %e, "failed to learn ndp entry");
                            }
                        }
                    }
                }
            }
        }
    }

    /// Stop the listener and remove every installed NDP-proxy entry.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(wakeup) = self.wakeup.lock().unwrap().as_ref() {
            let _ = nix::unistd::write(wakeup, &[0u8]);
        }
        if let Some(handle) = self.listener.lock().unwrap().take() {
            let _ = handle.join();
        }
        let nodes: Vec<u32> = self.ndp_cache.lock().unwrap().iter().copied().collect();
        for node in nodes {
            if let Err(e) = self.remove_ndp_entry(node) {
                warn!(sink_id = %self.sink_id, node = format!("{node:#010x}"), error = %e, "failed to remove ndp entry on stop");
            }
        }
        info!(sink_id = %self.sink_id, "sink detached");
    }
}

/// Bind a UDP socket to `addr` with `IPV6_FREEBIND` set, so the listener can start
/// before (or racing with) the netlink `addr_add` that assigns the address to the TUN
/// device, matching the attach sequence's actual ordering.
fn bind_udp_freebind(addr: SocketAddr) -> std::io::Result<std::net::UdpSocket> {
    use std::os::unix::io::FromRawFd;

    let fd = unsafe { libc::socket(libc::AF_INET6, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    const IPV6_FREEBIND: libc::c_int = 78;
    let enable: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_IPV6,
            IPV6_FREEBIND,
            &enable as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }

    let SocketAddr::V6(addr6) = addr else {
        unreachable!("sink listener always binds an IPv6 address")
    };
    let sockaddr = libc::sockaddr_in6 {
        sin6_family: libc::AF_INET6 as libc::sa_family_t,
        sin6_port: addr6.port().to_be(),
        sin6_flowinfo: 0,
        sin6_addr: libc::in6_addr {
            s6_addr: addr6.ip().octets(),
        },
        sin6_scope_id: 0,
    };
    let ret = unsafe {
        libc::bind(
            fd,
            &sockaddr as *const _ as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        let err = std::io::Error::last_os_error();
        unsafe { libc::close(fd) };
        return Err(err);
    }
    Ok(unsafe { std::net::UdpSocket::from_raw_fd(fd) })
}
