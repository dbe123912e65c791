//! Two stacks joined back to back through one tap interface each, driven in lockstep.
#![allow(dead_code)]

use core::net::Ipv4Addr;
use std::cell::RefCell;
use std::rc::Rc;

use vnet_stack::{
    pump_frames, ConnectionId, EventLog, FrameQueue, InterfaceId, InterfaceParams, ListenerId,
    MacAddr, NetStack, StackConfig, StackEvent, DEFAULT_MAX_FRAMES_PER_TICK,
};

pub const STEP_MS: u64 = 20;
pub const SERVER_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
pub const CLIENT_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
pub const NETMASK_24: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// Routes stack logs through the test harness. Repeated calls are harmless.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing_subscriber::filter::LevelFilter::DEBUG)
        .try_init();
}

pub fn mac(n: u8) -> MacAddr {
    MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, n])
}

/// One stack with a recording transport and an event log.
pub struct Node {
    pub stack: NetStack,
    pub wire: Rc<RefCell<FrameQueue>>,
    log: Rc<RefCell<EventLog>>,
    seen: Vec<StackEvent>,
}

impl Node {
    pub fn new(cfg: StackConfig) -> Self {
        init_tracing();
        let wire = Rc::new(RefCell::new(FrameQueue::new()));
        let log = Rc::new(RefCell::new(EventLog::new()));
        let stack = NetStack::new(cfg, wire.clone(), log.clone()).unwrap();
        Self {
            stack,
            wire,
            log,
            seen: Vec::new(),
        }
    }

    /// Everything notified so far and not yet taken.
    pub fn events(&mut self) -> &[StackEvent] {
        let fresh = self.log.borrow_mut().drain();
        self.seen.extend(fresh);
        &self.seen
    }

    pub fn take_events(&mut self) -> Vec<StackEvent> {
        self.events();
        std::mem::take(&mut self.seen)
    }

    pub fn add(&mut self, params: InterfaceParams) -> InterfaceId {
        self.stack.create_interface(params).unwrap()
    }
}

/// A server with `lo0 127.0.0.1/8` and `tap0 10.0.0.1/24`, wired to a client with
/// `tap0 10.0.0.2/24`.
pub struct Pair {
    pub server: Node,
    pub server_tap: InterfaceId,
    pub client: Node,
    pub client_tap: InterfaceId,
}

impl Pair {
    pub fn new() -> Self {
        Self::with_configs(StackConfig::default(), StackConfig::default())
    }

    pub fn with_configs(server_cfg: StackConfig, client_cfg: StackConfig) -> Self {
        let mut server = Node::new(server_cfg);
        server.add(
            InterfaceParams::loopback()
                .with_ipv4(Ipv4Addr::LOCALHOST, Ipv4Addr::new(255, 0, 0, 0)),
        );
        let server_tap = server.add(InterfaceParams::tap(mac(1)).with_ipv4(SERVER_IP, NETMASK_24));

        let mut client = Node::new(client_cfg);
        let client_tap = client.add(InterfaceParams::tap(mac(2)).with_ipv4(CLIENT_IP, NETMASK_24));

        Self {
            server,
            server_tap,
            client,
            client_tap,
        }
    }

    /// Moves every queued frame across the wire once in each direction, then advances both clocks.
    pub fn step(&mut self) {
        self.step_by(STEP_MS);
    }

    pub fn step_by(&mut self, ms: u64) {
        let client_wire = self.client.wire.clone();
        let _ = pump_frames(
            &mut client_wire.borrow_mut(),
            self.client_tap,
            &mut self.server.stack,
            self.server_tap,
            DEFAULT_MAX_FRAMES_PER_TICK,
        );
        let server_wire = self.server.wire.clone();
        let _ = pump_frames(
            &mut server_wire.borrow_mut(),
            self.server_tap,
            &mut self.client.stack,
            self.client_tap,
            DEFAULT_MAX_FRAMES_PER_TICK,
        );
        let now = self.server.stack.now_ms().max(self.client.stack.now_ms()) + ms;
        self.server.stack.expire_timers_at(now);
        self.client.stack.expire_timers_at(now);
    }

    /// Steps until `done(server_events, client_events)` holds. Returns false on timeout.
    pub fn run_until(
        &mut self,
        max_steps: usize,
        mut done: impl FnMut(&[StackEvent], &[StackEvent]) -> bool,
    ) -> bool {
        for _ in 0..max_steps {
            let server_events = self.server.events().to_vec();
            if done(&server_events, self.client.events()) {
                return true;
            }
            self.step();
        }
        false
    }

    pub fn run(&mut self, steps: usize) {
        for _ in 0..steps {
            self.step();
        }
    }

    /// Listens on `0.0.0.0:port` on the server, connects from the client and waits for both
    /// sides to report the connection. Events seen up to that point are consumed.
    pub fn establish(&mut self, port: u16) -> (ListenerId, ConnectionId, ConnectionId) {
        let listener = self.server.stack.tcp_listen(None, port).unwrap();
        let client_conn = self.client.stack.tcp_connect(SERVER_IP, port).unwrap();
        let ok = self.run_until(500, |server, client| {
            accepted(server, listener).is_some()
                && client.contains(&StackEvent::Connected(client_conn))
        });
        assert!(ok, "handshake did not complete");
        let server_conn = accepted(self.server.events(), listener).unwrap();
        self.server.take_events();
        self.client.take_events();
        (listener, server_conn, client_conn)
    }
}

pub fn accepted(events: &[StackEvent], listener: ListenerId) -> Option<ConnectionId> {
    events.iter().find_map(|event| match event {
        StackEvent::Accepted {
            listener: l,
            conn,
        } if *l == listener => Some(*conn),
        _ => None,
    })
}

/// All bytes surfaced for `conn`, in order.
pub fn received(events: &[StackEvent], conn: ConnectionId) -> Vec<u8> {
    events
        .iter()
        .filter_map(|event| match event {
            StackEvent::Received { conn: c, data } if *c == conn => Some(data.as_slice()),
            _ => None,
        })
        .flatten()
        .copied()
        .collect()
}

pub fn sent(events: &[StackEvent], conn: ConnectionId) -> usize {
    events
        .iter()
        .map(|event| match event {
            StackEvent::Sent { conn: c, len } if *c == conn => *len,
            _ => 0,
        })
        .sum()
}

pub fn closed_count(events: &[StackEvent], conn: ConnectionId) -> usize {
    events
        .iter()
        .filter(|event| **event == StackEvent::Closed(conn))
        .count()
}
