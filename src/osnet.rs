//! Operating-system networking façade: TUN device lifecycle, route/address/NDP-proxy
//! management, and external-prefix discovery via router advertisement.
//!
//! TUN creation and the rtnetlink-driven operations (link up, route, address) follow
//! the teacher's own `tun.rs`; NDP-proxy management has no rtnetlink surface worth
//! using and shells out the way the teacher's `dataplane/tun.rs` shells out for routes,
//! but always via an argv vector rather than an interpolated shell string.

use crate::addr::Addr;
use crate::error::{OsNetError, OsNetResult};
use nix::libc;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::Command;
use std::time::Duration;
use tracing::{debug, info, warn};

const IFF_TUN: libc::c_short = 0x0001;
const IFF_NO_PI: libc::c_short = 0x1000;
const TUNSETIFF: libc::c_ulong = 0x400454ca;
const TUNSETOWNER: libc::c_ulong = 0x400454cc;

#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22],
}

fn ifreq_with_name(name: &str) -> OsNetResult<IfReq> {
    let mut ifr = IfReq {
        ifr_name: [0; libc::IFNAMSIZ],
        ifr_flags: 0,
        _pad: [0; 22],
    };
    let name_bytes = name.as_bytes();
    if name_bytes.len() >= libc::IFNAMSIZ {
        return Err(OsNetError::CommandFailed {
            command: format!("tun_create {name}"),
            detail: "interface name too long".into(),
        });
    }
    for (i, &b) in name_bytes.iter().enumerate() {
        ifr.ifr_name[i] = b as libc::c_char;
    }
    Ok(ifr)
}

/// A kernel TUN device, open for blocking read/write of raw IPv6 packets.
pub struct TunDevice {
    name: String,
    file: File,
}

impl TunDevice {
    pub fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn read_packet(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.file.read(buf)
    }

    pub fn write_packet(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.file.write(buf)
    }

    pub fn try_clone(&self) -> std::io::Result<TunDevice> {
        Ok(TunDevice {
            name: self.name.clone(),
            file: self.file.try_clone()?,
        })
    }
}

/// Blocking read/write of whole IPv6 packets, abstracting over a real [`TunDevice`] so
/// the bridge core's datapath can be driven by a fake in tests.
pub trait PacketIo: Send {
    fn recv(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    fn send(&mut self, buf: &[u8]) -> std::io::Result<usize>;
}

impl PacketIo for TunDevice {
    fn recv(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.read_packet(buf)
    }

    fn send(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.write_packet(buf)
    }
}

/// Remove a stale `tun_wirepas` device left behind by a previous run, ignoring
/// "does not exist" failures.
pub fn tun_destroy(name: &str) -> OsNetResult<()> {
    let output = Command::new("ip")
        .args(["tuntap", "del", "dev", name, "mode", "tun"])
        .output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.contains("No such device") && !stderr.contains("Cannot find device") {
            return Err(OsNetError::CommandFailed {
                command: format!("ip tuntap del dev {name} mode tun"),
                detail: stderr.trim().to_string(),
            });
        }
    }
    Ok(())
}

/// Open `/dev/net/tun`, bind it to `name`, and assign it to `owner_user` if given.
pub fn tun_open(name: &str, owner_uid: Option<u32>) -> OsNetResult<TunDevice> {
    let file = OpenOptions::new().read(true).write(true).open("/dev/net/tun")?;

    let mut ifr = ifreq_with_name(name)?;
    ifr.ifr_flags = IFF_TUN | IFF_NO_PI;

    let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &ifr) };
    if ret < 0 {
        return Err(OsNetError::Ioctl {
            name: "TUNSETIFF",
            source: std::io::Error::last_os_error(),
        });
    }

    if let Some(uid) = owner_uid {
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETOWNER as _, uid as libc::c_ulong) };
        if ret < 0 {
            return Err(OsNetError::Ioctl {
                name: "TUNSETOWNER",
                source: std::io::Error::last_os_error(),
            });
        }
    }

    info!(name, "TUN device created");
    Ok(TunDevice {
        name: name.to_string(),
        file,
    })
}

async fn link_index(handle: &rtnetlink::Handle, name: &str) -> OsNetResult<u32> {
    use futures::TryStreamExt;
    let mut links = handle.link().get().match_name(name.to_string()).execute();
    match links.try_next().await {
        Ok(Some(link)) => Ok(link.header.index),
        Ok(None) => Err(OsNetError::Netlink(format!("no such link: {name}"))),
        Err(e) => Err(OsNetError::Netlink(e.to_string())),
    }
}

fn is_eexist(err: &rtnetlink::Error) -> bool {
    matches!(err, rtnetlink::Error::NetlinkError(msg) if msg.code == Some(-libc::EEXIST))
}

/// Bring `name` up via netlink, matching the teacher's own `set_up`.
pub fn tun_up(name: &str) -> OsNetResult<()> {
    run_netlink(async |handle| {
        let index = link_index(&handle, name).await?;
        handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|e| OsNetError::Netlink(e.to_string()))
    })
}

/// Install `addr` on `dev`. `EEXIST` is treated as success (idempotent re-attach).
pub fn addr_add(addr: &Addr, dev: &str) -> OsNetResult<()> {
    let ip: std::net::Ipv6Addr = addr.bytes().into();
    let prefix_len = addr.prefix_len();
    let dev = dev.to_string();
    run_netlink(async move |handle| {
        let index = link_index(&handle, &dev).await?;
        match handle.address().add(index, ip.into(), prefix_len).execute().await {
            Ok(()) => Ok(()),
            Err(e) if is_eexist(&e) => {
                warn!(%ip, dev = %dev, "address already present");
                Ok(())
            }
            Err(e) => Err(OsNetError::Netlink(e.to_string())),
        }
    })
}

pub fn addr_del(addr: &Addr, dev: &str) -> OsNetResult<()> {
    use futures::TryStreamExt;
    let ip: std::net::Ipv6Addr = addr.bytes().into();
    let prefix_len = addr.prefix_len();
    let dev = dev.to_string();
    run_netlink(async move |handle| {
        let index = link_index(&handle, &dev).await?;
        let mut addrs = handle.address().get().set_link_index_filter(index).execute();
        while let Some(msg) = addrs.try_next().await.map_err(|e| OsNetError::Netlink(e.to_string()))? {
            let matches = msg.attributes.iter().any(|attr| {
                matches!(attr, netlink_packet_route::address::AddressAttribute::Address(a)
                    if *a == std::net::IpAddr::V6(ip))
            });
            if matches && msg.header.prefix_len == prefix_len {
                handle
                    .address()
                    .del(msg)
                    .execute()
                    .await
                    .map_err(|e| OsNetError::Netlink(e.to_string()))?;
                return Ok(());
            }
        }
        debug!(%ip, dev = %dev, "address already absent");
        Ok(())
    })
}

/// Install a route for `prefix` pointing at `dev`, replacing any existing route for it.
pub fn route_replace(prefix: &Addr, dev: &str) -> OsNetResult<()> {
    route_install(prefix, dev, true, None)
}

/// Install a route for `prefix` pointing at `dev` without overwriting an existing one,
/// at the given route `metric`.
pub fn route_add(prefix: &Addr, dev: &str, metric: u32) -> OsNetResult<()> {
    route_install(prefix, dev, false, Some(metric))
}

fn route_install(prefix: &Addr, dev: &str, replace: bool, metric: Option<u32>) -> OsNetResult<()> {
    let ip: std::net::Ipv6Addr = prefix.bytes().into();
    let prefix_len = prefix.prefix_len();
    let dev = dev.to_string();
    run_netlink(async move |handle| {
        let index = link_index(&handle, &dev).await?;
        let mut request = handle
            .route()
            .add()
            .v6()
            .destination_prefix(ip, prefix_len)
            .output_interface(index);
        if let Some(metric) = metric {
            request = request.priority(metric);
        }
        let result = if replace {
            request.replace().execute().await
        } else {
            request.execute().await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) if is_eexist(&e) => {
                warn!(%ip, prefix_len, dev = %dev, "route already present");
                Ok(())
            }
            Err(e) => Err(OsNetError::Netlink(e.to_string())),
        }
    })
}

pub fn route_del(prefix: &Addr, dev: &str) -> OsNetResult<()> {
    use futures::TryStreamExt;
    let ip: std::net::Ipv6Addr = prefix.bytes().into();
    let prefix_len = prefix.prefix_len();
    let dev = dev.to_string();
    run_netlink(async move |handle| {
        let index = link_index(&handle, &dev).await?;
        let mut routes = handle.route().get(rtnetlink::IpVersion::V6).execute();
        while let Some(route) = routes.try_next().await.map_err(|e| OsNetError::Netlink(e.to_string()))? {
            let dest_matches = route
                .attributes
                .iter()
                .any(|attr| matches!(attr, netlink_packet_route::route::RouteAttribute::Destination(a)
                    if *a == std::net::IpAddr::V6(ip)));
            let out_matches = route
                .attributes
                .iter()
                .any(|attr| matches!(attr, netlink_packet_route::route::RouteAttribute::Oif(i) if *i == index));
            if dest_matches && out_matches && route.header.destination_prefix_length == prefix_len {
                handle
                    .route()
                    .del(route)
                    .execute()
                    .await
                    .map_err(|e| OsNetError::Netlink(e.to_string()))?;
                return Ok(());
            }
        }
        debug!(%ip, prefix_len, dev = %dev, "route already absent");
        Ok(())
    })
}

/// Install a permanent, externally-learned proxy NDP entry for `addr` on `dev`.
pub fn ndp_proxy_add(addr: &Addr, dev: &str) -> OsNetResult<()> {
    let ip: std::net::Ipv6Addr = addr.bytes().into();
    let output = Command::new("ip")
        .args([
            "neigh",
            "add",
            "nud",
            "permanent",
            "proxy",
            &ip.to_string(),
            "dev",
            dev,
            "extern_learn",
        ])
        .output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.contains("File exists") {
            return Err(OsNetError::CommandFailed {
                command: format!("ip neigh add proxy {ip} dev {dev}"),
                detail: stderr.trim().to_string(),
            });
        }
    }
    Ok(())
}

pub fn ndp_proxy_del(addr: &Addr, dev: &str) -> OsNetResult<()> {
    let ip: std::net::Ipv6Addr = addr.bytes().into();
    let output = Command::new("ip")
        .args(["neigh", "del", "proxy", &ip.to_string(), "dev", dev])
        .output()?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.contains("No such") {
            return Err(OsNetError::CommandFailed {
                command: format!("ip neigh del proxy {ip} dev {dev}"),
                detail: stderr.trim().to_string(),
            });
        }
    }
    Ok(())
}

/// Run a one-off async netlink operation to completion on a fresh connection, the way
/// the teacher's `tun.rs` does for every route/address call.
fn run_netlink<F, Fut>(op: F) -> OsNetResult<()>
where
    F: FnOnce(rtnetlink::Handle) -> Fut,
    Fut: std::future::Future<Output = OsNetResult<()>>,
{
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| OsNetError::Netlink(e.to_string()))?;
    rt.block_on(async {
        let (connection, handle, _) =
            rtnetlink::new_connection().map_err(|e| OsNetError::Netlink(e.to_string()))?;
        let task = tokio::spawn(connection);
        let result = op(handle).await;
        task.abort();
        result
    })
}

const RETRY_ATTEMPTS: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Solicit one router advertisement on `interface` and return its advertised prefix as
/// a /64 [`Addr`], retrying up to [`RETRY_ATTEMPTS`] times.
pub fn discover_external_prefix(interface: &str) -> OsNetResult<Addr> {
    let mut last_err = String::new();
    for attempt in 1..=RETRY_ATTEMPTS {
        match discover_external_prefix_once(interface) {
            Ok(addr) => return Ok(addr),
            Err(e) => {
                warn!(interface, attempt, error = %e, "router advertisement discovery failed, retrying");
                last_err = e;
                std::thread::sleep(RETRY_DELAY);
            }
        }
    }
    Err(OsNetError::PrefixDiscoveryFailed {
        interface: interface.to_string(),
        attempts: RETRY_ATTEMPTS,
        detail: last_err,
    })
}

const ND_ROUTER_SOLICIT: u8 = 133;
const ND_ROUTER_ADVERT: u8 = 134;
const ICMPV6_OPT_PREFIX_INFORMATION: u8 = 3;

fn discover_external_prefix_once(interface: &str) -> Result<Addr, String> {
    use nix::sys::socket::{
        recvfrom, sendto, socket, AddressFamily, Icmp6Filter, LinkAddr, MsgFlags, SockFlag,
        SockProtocol, SockType, SockaddrIn6,
    };
    use std::net::Ipv6Addr;

    let fd = socket(
        AddressFamily::Inet6,
        SockType::Raw,
        SockFlag::empty(),
        SockProtocol::ICMPV6,
    )
    .map_err(|e| format!("socket: {e}"))?;

    let mut filter = Icmp6Filter::new_block_all();
    filter.pass(ND_ROUTER_ADVERT);
    nix::sys::socket::setsockopt(&fd, nix::sys::socket::sockopt::Icmp6Filter, &filter)
        .map_err(|e| format!("setsockopt ICMP6_FILTER: {e}"))?;

    let if_index = interface_index(interface)?;

    let timeout = libc::timeval {
        tv_sec: 2,
        tv_usec: 0,
    };
    nix::sys::socket::setsockopt(&fd, nix::sys::socket::sockopt::ReceiveTimeout, &timeout)
        .map_err(|e| format!("setsockopt SO_RCVTIMEO: {e}"))?;

    let solicit = build_router_solicitation();
    let dest = SockaddrIn6::from(std::net::SocketAddrV6::new(
        "ff02::2".parse::<Ipv6Addr>().unwrap(),
        0,
        0,
        if_index,
    ));
    sendto(fd.as_raw_fd(), &solicit, &dest, MsgFlags::empty()).map_err(|e| format!("sendto: {e}"))?;

    let mut buf = [0u8; 1500];
    let (len, _) = recvfrom::<LinkAddr>(fd.as_raw_fd(), &mut buf).map_err(|e| format!("recvfrom: {e}"))?;
    parse_router_advertisement(&buf[..len])
}

fn interface_index(name: &str) -> Result<u32, String> {
    let c_name = std::ffi::CString::new(name).map_err(|_| "invalid interface name".to_string())?;
    let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
    if index == 0 {
        return Err(format!("no such interface: {name}"));
    }
    Ok(index)
}

fn build_router_solicitation() -> [u8; 8] {
    // ICMPv6 Router Solicitation: type 133, code 0, checksum left to the kernel on a
    // raw ICMPv6 socket, 4 reserved bytes.
    [ND_ROUTER_SOLICIT, 0, 0, 0, 0, 0, 0, 0]
}

fn parse_router_advertisement(packet: &[u8]) -> Result<Addr, String> {
    if packet.len() < 16 || packet[0] != ND_ROUTER_ADVERT {
        return Err("not a router advertisement".to_string());
    }
    let mut index = 16usize; // fixed RA header
    while index + 2 <= packet.len() {
        let opt_type = packet[index];
        let opt_len_words = packet[index + 1] as usize;
        if opt_len_words == 0 {
            return Err("zero-length option".to_string());
        }
        let opt_len = opt_len_words * 8;
        if index + opt_len > packet.len() {
            return Err("truncated option".to_string());
        }
        if opt_type == ICMPV6_OPT_PREFIX_INFORMATION && opt_len >= 32 {
            let prefix_len = packet[index + 2];
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&packet[index + 16..index + 32]);
            return Addr::new(bytes, prefix_len).map_err(|e| e.to_string());
        }
        index += opt_len;
    }
    Err("no prefix information option in advertisement".to_string())
}

/// The subset of this module's operations the bridge core and sink endpoints depend on,
/// abstracted so tests can exercise attach/detach/forwarding logic with an in-memory
/// fake instead of real netlink sockets and subprocesses.
pub trait OsFacade: Send + Sync {
    fn tun_destroy(&self, name: &str) -> OsNetResult<()>;
    fn tun_up(&self, name: &str) -> OsNetResult<()>;
    fn route_replace(&self, prefix: &Addr, dev: &str) -> OsNetResult<()>;
    fn route_add(&self, prefix: &Addr, dev: &str, metric: u32) -> OsNetResult<()>;
    fn route_del(&self, prefix: &Addr, dev: &str) -> OsNetResult<()>;
    fn addr_add(&self, addr: &Addr, dev: &str) -> OsNetResult<()>;
    fn addr_del(&self, addr: &Addr, dev: &str) -> OsNetResult<()>;
    fn ndp_proxy_add(&self, addr: &Addr, dev: &str) -> OsNetResult<()>;
    fn ndp_proxy_del(&self, addr: &Addr, dev: &str) -> OsNetResult<()>;
    fn discover_external_prefix(&self, interface: &str) -> OsNetResult<Addr>;
}

/// The real façade, delegating to this module's netlink/ioctl/subprocess functions.
pub struct RealOsFacade;

impl OsFacade for RealOsFacade {
    fn tun_destroy(&self, name: &str) -> OsNetResult<()> {
        tun_destroy(name)
    }

    fn tun_up(&self, name: &str) -> OsNetResult<()> {
        tun_up(name)
    }

    fn route_replace(&self, prefix: &Addr, dev: &str) -> OsNetResult<()> {
        route_replace(prefix, dev)
    }

    fn route_add(&self, prefix: &Addr, dev: &str, metric: u32) -> OsNetResult<()> {
        route_add(prefix, dev, metric)
    }

    fn route_del(&self, prefix: &Addr, dev: &str) -> OsNetResult<()> {
        route_del(prefix, dev)
    }

    fn addr_add(&self, addr: &Addr, dev: &str) -> OsNetResult<()> {
        addr_add(addr, dev)
    }

    fn addr_del(&self, addr: &Addr, dev: &str) -> OsNetResult<()> {
        addr_del(addr, dev)
    }

    fn ndp_proxy_add(&self, addr: &Addr, dev: &str) -> OsNetResult<()> {
        ndp_proxy_add(addr, dev)
    }

    fn ndp_proxy_del(&self, addr: &Addr, dev: &str) -> OsNetResult<()> {
        ndp_proxy_del(addr, dev)
    }

    fn discover_external_prefix(&self, interface: &str) -> OsNetResult<Addr> {
        discover_external_prefix(interface)
    }
}

/// In-memory fakes for the end-to-end scenarios in the testable-properties section:
/// a recording [`OsFacade`] and a channel-backed [`PacketIo`], neither of which touches
/// the kernel, so the bridge core's attach/detach/forwarding logic can be exercised
/// without root privileges or a real TUN device.
pub mod test_support {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum RecordedOp {
        RouteReplace(Addr, String),
        RouteAdd(Addr, String, u32),
        RouteDel(Addr, String),
        AddrAdd(Addr, String),
        AddrDel(Addr, String),
        NdpProxyAdd(Addr, String),
        NdpProxyDel(Addr, String),
    }

    #[derive(Default)]
    pub struct FakeOsFacade {
        pub ops: Mutex<Vec<RecordedOp>>,
        pub discovered_prefix: Mutex<Option<Addr>>,
    }

    impl FakeOsFacade {
        pub fn new(discovered_prefix: Addr) -> Self {
            Self {
                ops: Mutex::new(Vec::new()),
                discovered_prefix: Mutex::new(Some(discovered_prefix)),
            }
        }
    }

    impl OsFacade for FakeOsFacade {
        fn tun_destroy(&self, _name: &str) -> OsNetResult<()> {
            Ok(())
        }

        fn tun_up(&self, _name: &str) -> OsNetResult<()> {
            Ok(())
        }

        fn route_replace(&self, prefix: &Addr, dev: &str) -> OsNetResult<()> {
            self.ops.lock().unwrap().push(RecordedOp::RouteReplace(*prefix, dev.to_string()));
            Ok(())
        }

        fn route_add(&self, prefix: &Addr, dev: &str, metric: u32) -> OsNetResult<()> {
            self.ops
                .lock()
                .unwrap()
                .push(RecordedOp::RouteAdd(*prefix, dev.to_string(), metric));
            Ok(())
        }

        fn route_del(&self, prefix: &Addr, dev: &str) -> OsNetResult<()> {
            self.ops.lock().unwrap().push(RecordedOp::RouteDel(*prefix, dev.to_string()));
            Ok(())
        }

        fn addr_add(&self, addr: &Addr, dev: &str) -> OsNetResult<()> {
            self.ops.lock().unwrap().push(RecordedOp::AddrAdd(*addr, dev.to_string()));
            Ok(())
        }

        fn addr_del(&self, addr: &Addr, dev: &str) -> OsNetResult<()> {
            self.ops.lock().unwrap().push(RecordedOp::AddrDel(*addr, dev.to_string()));
            Ok(())
        }

        fn ndp_proxy_add(&self, addr: &Addr, dev: &str) -> OsNetResult<()> {
            self.ops.lock().unwrap().push(RecordedOp::NdpProxyAdd(*addr, dev.to_string()));
            Ok(())
        }

        fn ndp_proxy_del(&self, addr: &Addr, dev: &str) -> OsNetResult<()> {
            self.ops.lock().unwrap().push(RecordedOp::NdpProxyDel(*addr, dev.to_string()));
            Ok(())
        }

        fn discover_external_prefix(&self, _interface: &str) -> OsNetResult<Addr> {
            self.discovered_prefix
                .lock()
                .unwrap()
                .ok_or_else(|| OsNetError::PrefixDiscoveryFailed {
                    interface: _interface.to_string(),
                    attempts: 0,
                    detail: "no prefix configured on fake".to_string(),
                })
        }
    }

    /// A [`PacketIo`] backed by two channels: one the test writes outbound packets
    /// into (as if they arrived on the real TUN), one the bridge's inbound path
    /// writes received mesh packets into (for the test to assert on).
    pub struct FakeTun {
        pub inbound_from_test: crossbeam_channel::Receiver<Vec<u8>>,
        pub outbound_to_test: crossbeam_channel::Sender<Vec<u8>>,
    }

    impl PacketIo for FakeTun {
        fn recv(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.inbound_from_test.recv() {
                Ok(packet) => {
                    let n = packet.len().min(buf.len());
                    buf[..n].copy_from_slice(&packet[..n]);
                    Ok(n)
                }
                Err(_) => Ok(0),
            }
        }

        fn send(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let _ = self.outbound_to_test.send(buf.to_vec());
            Ok(buf.len())
        }
    }
}
