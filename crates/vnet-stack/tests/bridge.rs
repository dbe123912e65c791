mod common;

use common::*;
use vnet_stack::{
    pump_frames, InterfaceId, InterfaceKind, InterfaceParams, MacAddr, StackConfig, StackError,
    StackEvent, DEFAULT_MAX_FRAMES_PER_TICK, MAX_BRIDGE_PORTS,
};

const BRIDGE_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0xb0]);
const STATION_A: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x0a]);
const STATION_X: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x0f]);

fn frame(dst: MacAddr, src: MacAddr) -> Vec<u8> {
    let mut out = Vec::with_capacity(60);
    out.extend_from_slice(&dst.0);
    out.extend_from_slice(&src.0);
    out.extend_from_slice(&0x0800u16.to_be_bytes());
    out.resize(60, 0);
    out
}

struct Switch {
    node: Node,
    p1: InterfaceId,
    p2: InterfaceId,
    bridge: InterfaceId,
}

fn switch() -> Switch {
    let mut node = Node::new(StackConfig::default());
    let p1 = node.add(InterfaceParams::tap(mac(0x11)));
    let p2 = node.add(InterfaceParams::tap(mac(0x12)));
    let bridge = node.add(
        InterfaceParams::bridge(BRIDGE_MAC, [p1, p2]).with_ipv4(SERVER_IP, NETMASK_24),
    );
    Switch {
        node,
        p1,
        p2,
        bridge,
    }
}

#[test]
fn ports_stay_attached_until_the_bridge_goes() {
    let Switch {
        mut node,
        p1,
        p2,
        bridge,
    } = switch();

    let info = node.stack.interface(bridge).unwrap();
    assert_eq!(info.kind, InterfaceKind::Bridge);
    assert_eq!(info.name, "br0");
    assert_eq!(info.ports, vec![p1, p2]);
    assert_eq!(node.stack.interface(p1).unwrap().bridge, Some(bridge));

    assert_eq!(
        node.stack.remove_interface(p1),
        Err(StackError::PortAttached { port: p1, bridge })
    );
    assert!(node.stack.interface(p1).is_some());

    node.stack.remove_interface(bridge).unwrap();
    assert!(node.stack.interface(bridge).is_none());
    assert_eq!(node.stack.interface(p1).unwrap().bridge, None);
    assert_eq!(node.stack.interface(p2).unwrap().bridge, None);
    node.stack.remove_interface(p1).unwrap();
    node.stack.remove_interface(p2).unwrap();
    assert!(node.stack.interfaces().is_empty());
}

#[test]
fn invalid_port_sets_are_rejected_without_side_effects() {
    let Switch { mut node, p1, .. } = switch();
    let lo = node.add(InterfaceParams::loopback());
    let spare = node.add(InterfaceParams::tap(mac(0x13)));

    let attempts = [
        (vec![p1], StackError::UnsupportedPort),
        (vec![lo], StackError::UnsupportedPort),
        (vec![spare, spare], StackError::UnsupportedPort),
        (vec![InterfaceId::from_raw(999)], StackError::InvalidHandle),
        (
            vec![spare; MAX_BRIDGE_PORTS + 1],
            StackError::TooManyPorts {
                count: MAX_BRIDGE_PORTS + 1,
                max: MAX_BRIDGE_PORTS,
            },
        ),
    ];
    for (ports, expected) in attempts {
        let params = InterfaceParams::bridge(mac(0xb1), ports);
        assert_eq!(node.stack.create_interface(params), Err(expected));
    }
    assert_eq!(node.stack.interface(spare).unwrap().bridge, None);

    // Failed creations did not consume a name.
    let second = node.add(InterfaceParams::bridge(mac(0xb1), [spare]));
    assert_eq!(node.stack.interface(second).unwrap().name, "br1");
}

#[test]
fn learns_stations_and_switches_between_ports() {
    let Switch {
        mut node,
        p1,
        p2,
        bridge,
    } = switch();

    // Unknown destination: flooded to every other port.
    node.stack
        .deliver_inbound(p1, &frame(STATION_X, STATION_A))
        .unwrap();
    {
        let mut wire = node.wire.borrow_mut();
        assert_eq!(wire.count_for(p1), 0);
        assert_eq!(wire.drain_for(p2), vec![frame(STATION_X, STATION_A)]);
    }

    // The reply is steered to the port A was learned on.
    node.stack
        .deliver_inbound(p2, &frame(STATION_A, STATION_X))
        .unwrap();
    {
        let mut wire = node.wire.borrow_mut();
        assert_eq!(wire.count_for(p2), 0);
        assert_eq!(wire.drain_for(p1), vec![frame(STATION_A, STATION_X)]);
    }

    let fdb = node.stack.bridge_fdb(bridge).unwrap();
    let ports: Vec<_> = fdb.iter().map(|entry| (entry.mac, entry.port)).collect();
    assert_eq!(ports, vec![(STATION_A, p1), (STATION_X, p2)]);

    // A port going down forgets its stations and stops receiving floods.
    node.stack.set_link_state(p2, false).unwrap();
    let fdb = node.stack.bridge_fdb(bridge).unwrap();
    assert_eq!(fdb.len(), 1);
    assert_eq!(fdb[0].mac, STATION_A);

    node.stack
        .deliver_inbound(p1, &frame(STATION_X, STATION_A))
        .unwrap();
    assert!(node.wire.borrow().is_empty());
    assert_eq!(
        node.stack.deliver_inbound(p2, &frame(STATION_A, STATION_X)),
        Err(StackError::InterfaceDown)
    );
    assert_eq!(node.stack.bridge_fdb(p1), Err(StackError::InvalidHandle));
}

#[test]
fn stations_age_out() {
    let Switch {
        mut node,
        p1,
        bridge,
        ..
    } = switch();
    node.stack
        .deliver_inbound(p1, &frame(STATION_X, STATION_A))
        .unwrap();
    assert_eq!(node.stack.bridge_fdb(bridge).unwrap().len(), 1);

    let max_age = node.stack.config().fdb_max_age_ms;
    node.stack.expire_timers_at(max_age + 1);
    assert!(node.stack.bridge_fdb(bridge).unwrap().is_empty());
}

#[test]
fn peer_on_a_port_reaches_the_bridge_address() {
    let Switch {
        mut node,
        p1,
        p2,
        bridge,
    } = switch();
    let service = node.stack.udp_open(None, 53, false).unwrap();

    let mut peer = Node::new(StackConfig::default());
    let peer_tap = peer.add(InterfaceParams::tap(STATION_A).with_ipv4(CLIENT_IP, NETMASK_24));
    let client = peer.stack.udp_open(None, 0, false).unwrap();
    let client_port = peer.stack.udp_local_port(client).unwrap();
    peer.stack
        .udp_send(client, SERVER_IP, 53, b"query")
        .unwrap();

    let mut now = 0;
    let mut delivered = false;
    for _ in 0..100 {
        let peer_wire = peer.wire.clone();
        let _ = pump_frames(
            &mut peer_wire.borrow_mut(),
            peer_tap,
            &mut node.stack,
            p1,
            DEFAULT_MAX_FRAMES_PER_TICK,
        );
        let node_wire = node.wire.clone();
        let _ = pump_frames(
            &mut node_wire.borrow_mut(),
            p1,
            &mut peer.stack,
            peer_tap,
            DEFAULT_MAX_FRAMES_PER_TICK,
        );
        now += STEP_MS;
        node.stack.expire_timers_at(now);
        peer.stack.expire_timers_at(now);

        if node.events().contains(&StackEvent::Datagram {
            endpoint: service,
            src_addr: CLIENT_IP,
            src_port: client_port,
            data: b"query".to_vec(),
        }) {
            delivered = true;
            break;
        }
    }
    assert!(delivered, "datagram never reached the bridge");

    // The peer's ARP broadcast was flooded to the other port as well.
    assert!(node.wire.borrow().count_for(p2) > 0);
    let learned = node.stack.bridge_fdb(bridge).unwrap();
    assert_eq!(learned[0].mac, STATION_A);
    assert_eq!(learned[0].port, p1);
}
