//! End-to-end scenarios wiring a fake mesh SDK and a fake OS-networking façade to the
//! bridge core, exercising the attach/forward/detach lifecycle without root privileges
//! or a real TUN device.

use std::sync::Arc;
use std::time::Duration;
use wirepas_ipv6_bridge::addr::Addr;
use wirepas_ipv6_bridge::bridge::Bridge;
use wirepas_ipv6_bridge::config::BridgeConfig;
use wirepas_ipv6_bridge::mesh::{FakeSinkManager, MeshEvent, SinkConfig, SinkManager};
use wirepas_ipv6_bridge::netconfig::AppConfigEnvelope;
use wirepas_ipv6_bridge::osnet::test_support::{FakeOsFacade, FakeTun};
use wirepas_ipv6_bridge::osnet::OsFacade;

fn prefix() -> Addr {
    Addr::parse("2001:db8:1:2::/64").unwrap()
}

struct Harness {
    bridge: Arc<Bridge>,
    manager: Arc<FakeSinkManager>,
    inbound_tx: crossbeam_channel::Sender<Vec<u8>>,
    outbound_rx: crossbeam_channel::Receiver<Vec<u8>>,
}

fn build(off_mesh_service: Option<Addr>) -> Harness {
    let manager = Arc::new(FakeSinkManager::new());
    let os: Arc<dyn OsFacade> = Arc::new(FakeOsFacade::new(prefix()));
    let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
    let (outbound_tx, outbound_rx) = crossbeam_channel::unbounded();
    let tun = FakeTun {
        inbound_from_test: inbound_rx,
        outbound_to_test: outbound_tx,
    };
    let bridge = Bridge::new(
        BridgeConfig {
            external_interface: "tap0".to_string(),
            off_mesh_service,
        },
        Arc::clone(&manager) as Arc<dyn SinkManager>,
        os,
        Box::new(tun),
        prefix(),
        false,
    )
    .unwrap();
    Harness {
        bridge,
        manager,
        inbound_tx,
        outbound_rx,
    }
}

fn wait_for<F: Fn() -> bool>(pred: F) {
    for _ in 0..200 {
        if pred() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("condition not met in time");
}

#[test]
fn prefix_is_published_into_a_new_sinks_app_config() {
    let harness = build(None);
    harness.manager.add_sink(
        "s0",
        SinkConfig {
            started: true,
            node_address: 0x0a0b0c0d,
            ..Default::default()
        },
    );
    harness.bridge.attach("s0").unwrap();

    let sink = harness.manager.get_sink("s0").unwrap();
    let config = sink.read_config().unwrap();
    let envelope = AppConfigEnvelope::decode(&config.app_config_data).unwrap();
    let net_config = envelope.network_config().unwrap();
    assert_eq!(net_config.nw_prefix, Some(prefix().bytes()[0..8].try_into().unwrap()));
}

#[test]
fn reattaching_the_same_sink_only_bumps_the_nonce() {
    let harness = build(None);
    harness.manager.add_sink(
        "s0",
        SinkConfig {
            started: true,
            node_address: 0x0a0b0c0d,
            ..Default::default()
        },
    );
    harness.bridge.attach("s0").unwrap();
    harness.bridge.attach("s0").unwrap();

    let sink = harness.manager.get_sink("s0").unwrap();
    let config = sink.read_config().unwrap();
    let envelope = AppConfigEnvelope::decode(&config.app_config_data).unwrap();
    let net_config = envelope.network_config().unwrap();
    // First attach finds no prior record (nonce stays 0); second attach finds that
    // record and bumps it once.
    assert_eq!(net_config.nonce, 1);
}

#[test]
fn foreign_app_config_entries_survive_attach() {
    let harness = build(None);
    let mut envelope = AppConfigEnvelope::empty();
    envelope.set_network_config(&wirepas_ipv6_bridge::netconfig::NetworkConfig::fresh());
    let mut raw = envelope.encode();
    raw.push(9); // foreign entry type
    raw.push(2); // length
    raw.push(0xaa);
    raw.push(0xbb);

    harness.manager.add_sink(
        "s0",
        SinkConfig {
            started: true,
            node_address: 0x0a0b0c0d,
            app_config_data: raw,
            ..Default::default()
        },
    );
    harness.bridge.attach("s0").unwrap();

    let sink = harness.manager.get_sink("s0").unwrap();
    let config = sink.read_config().unwrap();
    let envelope = AppConfigEnvelope::decode(&config.app_config_data).unwrap();
    assert!(envelope.network_config().is_some());
    let reencoded = envelope.encode();
    assert!(reencoded.windows(4).any(|w| w == [9, 2, 0xaa, 0xbb]));
}

#[test]
fn outbound_packet_is_forwarded_to_the_owning_sink() {
    let harness = build(None);
    harness.manager.add_sink(
        "s0",
        SinkConfig {
            started: true,
            node_address: 0x0a0b0c0d,
            ..Default::default()
        },
    );
    harness.bridge.attach("s0").unwrap();

    let dst = Addr::from_prefix_sink_and_node(&prefix(), 0x0a0b0c0d, 7).unwrap();
    let mut packet = vec![0u8; 48];
    packet[6] = 17; // UDP
    packet[24..40].copy_from_slice(&dst.bytes());
    harness.inbound_tx.send(packet.clone()).unwrap();

    wait_for(|| !harness.manager.sent.lock().unwrap().is_empty());
    let sent = harness.manager.sent.lock().unwrap();
    assert_eq!(sent[0].dst_node, 7);
    assert_eq!(sent[0].payload, packet);
}

#[test]
fn unsupported_next_header_is_silently_dropped() {
    let harness = build(None);
    harness.manager.add_sink(
        "s0",
        SinkConfig {
            started: true,
            node_address: 0x0a0b0c0d,
            ..Default::default()
        },
    );
    harness.bridge.attach("s0").unwrap();

    let dst = Addr::from_prefix_sink_and_node(&prefix(), 0x0a0b0c0d, 7).unwrap();
    let mut packet = vec![0u8; 48];
    packet[6] = 6; // TCP, not forwarded
    packet[24..40].copy_from_slice(&dst.bytes());
    harness.inbound_tx.send(packet).unwrap();

    std::thread::sleep(Duration::from_millis(100));
    assert!(harness.manager.sent.lock().unwrap().is_empty());
}

#[test]
fn multicast_destination_is_silently_dropped() {
    let harness = build(None);
    harness.manager.add_sink(
        "s0",
        SinkConfig {
            started: true,
            node_address: 0x0a0b0c0d,
            ..Default::default()
        },
    );
    harness.bridge.attach("s0").unwrap();

    let multicast = Addr::parse("ff02::1").unwrap();
    let mut packet = vec![0u8; 48];
    packet[6] = 17;
    packet[24..40].copy_from_slice(&multicast.bytes());
    harness.inbound_tx.send(packet).unwrap();

    std::thread::sleep(Duration::from_millis(100));
    assert!(harness.manager.sent.lock().unwrap().is_empty());
}

#[test]
fn inbound_mesh_data_learns_an_ndp_entry_and_reaches_the_tun() {
    let harness = build(None);
    harness.manager.add_sink(
        "s0",
        SinkConfig {
            started: true,
            node_address: 0x0a0b0c0d,
            ..Default::default()
        },
    );
    harness.bridge.attach("s0").unwrap();

    harness.bridge.handle_mesh_event(MeshEvent::DataReceived {
        sink_id: "s0".to_string(),
        src: 2,
        dst: 0x0a0b0c0d,
        src_ep: 66,
        dst_ep: 66,
        data: vec![0xde, 0xad, 0xbe, 0xef],
    });

    let received = harness.outbound_rx.recv_timeout(Duration::from_millis(500)).unwrap();
    assert_eq!(received, vec![0xde, 0xad, 0xbe, 0xef]);
}

#[test]
fn detaching_a_sink_stops_forwarding_to_it() {
    let harness = build(None);
    harness.manager.add_sink(
        "s0",
        SinkConfig {
            started: true,
            node_address: 0x0a0b0c0d,
            ..Default::default()
        },
    );
    harness.bridge.attach("s0").unwrap();
    harness.bridge.detach("s0");

    let dst = Addr::from_prefix_sink_and_node(&prefix(), 0x0a0b0c0d, 7).unwrap();
    let mut packet = vec![0u8; 48];
    packet[6] = 17;
    packet[24..40].copy_from_slice(&dst.bytes());
    harness.inbound_tx.send(packet).unwrap();

    std::thread::sleep(Duration::from_millis(100));
    assert!(harness.manager.sent.lock().unwrap().is_empty());
}

#[test]
fn off_mesh_service_address_is_published_when_configured() {
    let off_mesh = Addr::parse("2001:db8:9:9::53").unwrap();
    let harness = build(Some(off_mesh));
    harness.manager.add_sink(
        "s0",
        SinkConfig {
            started: true,
            node_address: 0x0a0b0c0d,
            ..Default::default()
        },
    );
    harness.bridge.attach("s0").unwrap();

    let sink = harness.manager.get_sink("s0").unwrap();
    let config = sink.read_config().unwrap();
    let envelope = AppConfigEnvelope::decode(&config.app_config_data).unwrap();
    let net_config = envelope.network_config().unwrap();
    assert_eq!(net_config.off_mesh_service, Some(off_mesh.bytes()));
}
