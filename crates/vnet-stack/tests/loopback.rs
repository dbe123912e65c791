mod common;

use core::net::Ipv4Addr;

use common::*;
use vnet_stack::{InterfaceKind, InterfaceParams, StackConfig, StackError, StackEvent};

fn loopback_node() -> Node {
    let mut node = Node::new(StackConfig::default());
    node.add(
        InterfaceParams::loopback().with_ipv4(Ipv4Addr::LOCALHOST, Ipv4Addr::new(255, 0, 0, 0)),
    );
    node
}

/// Loopback traffic never reaches the host; draining and a few timer ticks move it along.
fn settle(node: &mut Node, mut done: impl FnMut(&[StackEvent]) -> bool) -> bool {
    for _ in 0..200 {
        node.stack.drain_self_queued();
        if done(node.events()) {
            return true;
        }
        let now = node.stack.now_ms() + STEP_MS;
        node.stack.expire_timers_at(now);
    }
    false
}

#[test]
fn tcp_over_loopback() {
    let mut node = loopback_node();
    let listener = node.stack.tcp_listen(Some(Ipv4Addr::LOCALHOST), 7).unwrap();
    let client = node.stack.tcp_connect(Ipv4Addr::LOCALHOST, 7).unwrap();

    assert!(settle(&mut node, |events| {
        accepted(events, listener).is_some() && events.contains(&StackEvent::Connected(client))
    }));
    let server = accepted(node.events(), listener).unwrap();
    assert_ne!(server, client);

    assert_eq!(node.stack.tcp_send(client, b"echo me").unwrap(), 7);
    assert!(settle(&mut node, |events| received(events, server) == b"echo me"));
    node.stack.tcp_mark_received(server, 7).unwrap();

    node.stack.tcp_close(server).unwrap();
    assert!(settle(&mut node, |events| {
        closed_count(events, server) == 1 && closed_count(events, client) == 1
    }));
    assert!(node.wire.borrow().is_empty());
}

#[test]
fn udp_over_loopback() {
    let mut node = loopback_node();
    let a = node.stack.udp_open(None, 5000, false).unwrap();
    let b = node.stack.udp_open(None, 5001, false).unwrap();
    node.stack
        .udp_send(a, Ipv4Addr::LOCALHOST, 5001, b"self")
        .unwrap();

    let expected = StackEvent::Datagram {
        endpoint: b,
        src_addr: Ipv4Addr::LOCALHOST,
        src_port: 5000,
        data: b"self".to_vec(),
    };
    assert!(settle(&mut node, |events| events.contains(&expected)));
    assert!(node.wire.borrow().is_empty());
}

#[test]
fn connections_to_an_own_address_stay_inside_the_stack() {
    let tunnel_ip = Ipv4Addr::new(172, 16, 0, 1);
    let cases = [
        (InterfaceParams::tap(mac(1)).with_ipv4(SERVER_IP, NETMASK_24), SERVER_IP),
        (
            InterfaceParams::tunnel().with_ipv4(tunnel_ip, Ipv4Addr::new(255, 255, 0, 0)),
            tunnel_ip,
        ),
    ];
    for (params, addr) in cases {
        let mut node = Node::new(StackConfig::default());
        node.add(params);
        let listener = node.stack.tcp_listen(None, 80).unwrap();
        let client = node.stack.tcp_connect(addr, 80).unwrap();

        assert!(settle(&mut node, |events| {
            accepted(events, listener).is_some() && events.contains(&StackEvent::Connected(client))
        }));
        let server = accepted(node.events(), listener).unwrap();
        let (local, remote) = node.stack.tcp_endpoints(server).unwrap();
        assert_eq!((*local.ip(), *remote.ip()), (addr, addr));

        assert_eq!(node.stack.tcp_send(client, b"to myself").unwrap(), 9);
        assert!(settle(&mut node, |events| received(events, server) == b"to myself"));
        node.stack.tcp_mark_received(server, 9).unwrap();

        node.stack.tcp_close(client).unwrap();
        assert!(settle(&mut node, |events| {
            closed_count(events, server) == 1 && closed_count(events, client) == 1
        }));
        assert!(node.wire.borrow().is_empty());
    }
}

#[test]
fn datagrams_to_an_own_tap_address_are_delivered_locally() {
    let mut node = Node::new(StackConfig::default());
    node.add(InterfaceParams::tap(mac(1)).with_ipv4(SERVER_IP, NETMASK_24));
    let a = node.stack.udp_open(None, 5000, false).unwrap();
    let b = node.stack.udp_open(Some(SERVER_IP), 5001, false).unwrap();
    node.stack.udp_send(a, SERVER_IP, 5001, b"self").unwrap();

    let expected = StackEvent::Datagram {
        endpoint: b,
        src_addr: SERVER_IP,
        src_port: 5000,
        data: b"self".to_vec(),
    };
    assert!(settle(&mut node, |events| events.contains(&expected)));
    assert!(node.wire.borrow().is_empty());
}

#[test]
fn looped_frames_hold_buffers_until_read_back() {
    let cfg = StackConfig {
        buffer_pool_capacity: 1,
        ..StackConfig::default()
    };
    let mut node = Node::new(cfg);
    node.add(
        InterfaceParams::loopback().with_ipv4(Ipv4Addr::LOCALHOST, Ipv4Addr::new(255, 0, 0, 0)),
    );
    let tap = node.add(InterfaceParams::tap(mac(1)).with_ipv4(SERVER_IP, NETMASK_24));
    let a = node.stack.udp_open(None, 5000, false).unwrap();
    let b = node.stack.udp_open(None, 5001, false).unwrap();

    node.stack
        .udp_send(a, Ipv4Addr::LOCALHOST, 5001, b"parked")
        .unwrap();
    assert_eq!(node.stack.pool_stats().in_use, 1);
    assert_eq!(
        node.stack.deliver_inbound(tap, &[0; 60]),
        Err(StackError::NoMemory)
    );

    let expected = StackEvent::Datagram {
        endpoint: b,
        src_addr: Ipv4Addr::LOCALHOST,
        src_port: 5000,
        data: b"parked".to_vec(),
    };
    assert!(settle(&mut node, |events| events.contains(&expected)));
    assert_eq!(node.stack.pool_stats().in_use, 0);
    node.stack.deliver_inbound(tap, &[0; 60]).unwrap();
}

#[test]
fn interface_snapshot_and_admin_state() {
    let mut node = loopback_node();
    let tap = node.add(
        InterfaceParams::tap(mac(9))
            .with_ipv4(SERVER_IP, NETMASK_24)
            .with_gateway(Ipv4Addr::new(10, 0, 0, 254))
            .with_mtu(1400)
            .with_tag(42),
    );
    let tun = node.add(InterfaceParams::tunnel().with_address(Ipv4Addr::new(172, 16, 0, 1)));

    let names: Vec<_> = node
        .stack
        .interfaces()
        .into_iter()
        .map(|info| (info.kind, info.name))
        .collect();
    assert_eq!(
        names,
        vec![
            (InterfaceKind::Loopback, "lo0".to_string()),
            (InterfaceKind::Tap, "tap0".to_string()),
            (InterfaceKind::Tunnel, "tun0".to_string()),
        ]
    );

    let info = node.stack.interface(tap).unwrap();
    assert_eq!(info.mac, Some(mac(9)));
    assert_eq!(info.address, Some(SERVER_IP));
    assert_eq!(info.netmask, Some(NETMASK_24));
    assert_eq!(info.gateway, Some(Ipv4Addr::new(10, 0, 0, 254)));
    assert_eq!(info.mtu, 1400);
    assert_eq!(info.tag, 42);

    // An address without a netmask covers everything.
    assert_eq!(
        node.stack.interface(tun).unwrap().netmask,
        Some(Ipv4Addr::UNSPECIFIED)
    );

    node.stack.set_admin_state(tap, false).unwrap();
    assert_eq!(
        node.stack.deliver_inbound(tap, &[0; 60]),
        Err(StackError::InterfaceDown)
    );
    node.stack.set_admin_state(tap, true).unwrap();
    node.stack.deliver_inbound(tap, &[0; 60]).unwrap();

    node.stack.remove_interface(tun).unwrap();
    assert_eq!(
        node.stack.deliver_inbound(tun, &[0x45; 20]),
        Err(StackError::InvalidHandle)
    );
    assert_eq!(node.stack.remove_interface(tun), Err(StackError::InvalidHandle));
}

#[test]
fn bad_interface_parameters_are_rejected() {
    let mut node = loopback_node();
    let bad_mask = InterfaceParams::tap(mac(3))
        .with_ipv4(SERVER_IP, Ipv4Addr::new(255, 0, 255, 0));
    assert_eq!(
        node.stack.create_interface(bad_mask),
        Err(StackError::InvalidNetmask)
    );
    assert!(matches!(
        node.stack
            .create_interface(InterfaceParams::tap(mac(3)).with_mtu(20)),
        Err(StackError::InvalidConfig(_))
    ));
    // Neither attempt used up a name.
    let tap = node.add(InterfaceParams::tap(mac(3)));
    assert_eq!(node.stack.interface(tap).unwrap().name, "tap0");
}

#[test]
fn timers_never_run_backwards() {
    let mut node = loopback_node();
    node.stack.expire_timers_at(1_000);
    node.stack.expire_timers_at(10);
    assert_eq!(node.stack.now_ms(), 1_000);
    assert_eq!(node.stack.next_poll_delay(), None);
}
