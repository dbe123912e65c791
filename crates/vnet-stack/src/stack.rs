use std::collections::BTreeSet;
use std::time::Instant;

use tracing::{debug, trace};
use vnet_backend::{HostTransport, InterfaceId};

use crate::buffer::{BufferPool, PoolStats};
use crate::config::{InterfaceParams, LinkParams, StackConfig, MAX_BRIDGE_PORTS};
use crate::error::{Result, StackError};
use crate::events::{HandleAlloc, Notifier};
use crate::iface::bridge::FdbEntry;
use crate::iface::{IfaceFlags, InterfaceInfo, InterfaceKind, VirtualInterface};
use crate::ports::PortTable;
use crate::registry::Registry;
use crate::tcp::TcpBridge;
use crate::udp::UdpBridge;
use crate::Millis;

/// A set of virtual interfaces multiplexed onto one cooperative TCP/IP engine.
///
/// The stack is single-threaded and never runs on its own: every operation completes before it
/// returns, and time only moves forward in [`NetStack::expire_timers`] /
/// [`NetStack::expire_timers_at`]. Outbound frames go to the [`HostTransport`] given at
/// construction, connection-level events to the [`Notifier`].
pub struct NetStack {
    pub(crate) cfg: StackConfig,
    pub(crate) registry: Registry,
    pub(crate) tcp: TcpBridge,
    pub(crate) udp: UdpBridge,
    pub(crate) tcp_ports: PortTable,
    pub(crate) udp_ports: PortTable,
    pub(crate) handles: HandleAlloc,
    pub(crate) pool: BufferPool,
    pub(crate) transport: Box<dyn HostTransport>,
    pub(crate) notifier: Box<dyn Notifier>,
    pub(crate) now: Millis,
    pub(crate) started: Instant,
}

impl NetStack {
    pub fn new(
        cfg: StackConfig,
        transport: impl HostTransport + 'static,
        notifier: impl Notifier + 'static,
    ) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            registry: Registry::default(),
            tcp: TcpBridge::default(),
            udp: UdpBridge::default(),
            tcp_ports: PortTable::new(cfg.ephemeral_ports.clone()),
            udp_ports: PortTable::new(cfg.ephemeral_ports.clone()),
            handles: HandleAlloc::default(),
            pool: BufferPool::new(cfg.buffer_pool_capacity),
            transport: Box::new(transport),
            notifier: Box::new(notifier),
            now: 0,
            started: Instant::now(),
            cfg,
        })
    }

    pub fn config(&self) -> &StackConfig {
        &self.cfg
    }

    /// Current stack time in milliseconds.
    pub fn now_ms(&self) -> Millis {
        self.now
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Creates an interface, registers it with the engine and brings it up.
    ///
    /// For bridges, every listed port is attached in order; ports stop hosting sockets of their
    /// own for as long as they are attached. Either everything succeeds or nothing changes.
    pub fn create_interface(&mut self, params: InterfaceParams) -> Result<InterfaceId> {
        if let LinkParams::Bridge { ports, .. } = &params.link {
            self.check_ports(ports)?;
        }
        let kind = params.link.kind();
        let (id, name) = self.registry.reserve(kind);
        let iface = VirtualInterface::build(id, name, &params, &self.cfg, self.now)?;
        debug!(
            iface = %id,
            name = iface.name(),
            address = ?params.address,
            "interface created"
        );
        let ports = iface.ports().to_vec();
        self.registry.insert(iface);

        for port in ports {
            if let Some(port_iface) = self.registry.get_mut(port) {
                port_iface.set_bridge(Some(id));
            }
            self.detach_sockets(port);
            debug!(bridge = %id, port = %port, "port attached");
        }
        self.attach_sockets(id);
        Ok(id)
    }

    fn check_ports(&self, ports: &[InterfaceId]) -> Result<()> {
        if ports.len() > MAX_BRIDGE_PORTS {
            return Err(StackError::TooManyPorts {
                count: ports.len(),
                max: MAX_BRIDGE_PORTS,
            });
        }
        let mut seen = BTreeSet::new();
        for &port in ports {
            let iface = self.registry.get(port).ok_or(StackError::InvalidHandle)?;
            if iface.kind() != InterfaceKind::Tap || iface.bridge().is_some() || !seen.insert(port)
            {
                return Err(StackError::UnsupportedPort);
            }
        }
        Ok(())
    }

    /// Brings the interface down, detaches it from the engine and releases it.
    ///
    /// A bridge port must be released by removing its bridge first ([`StackError::PortAttached`]).
    /// Removing a bridge leaves its ports in place as standalone interfaces. Connections on the
    /// removed interface get their `on_closed` on the next tick.
    pub fn remove_interface(&mut self, id: InterfaceId) -> Result<()> {
        let iface = self.registry.get_mut(id).ok_or(StackError::InvalidHandle)?;
        if let Some(bridge) = iface.bridge() {
            return Err(StackError::PortAttached { port: id, bridge });
        }
        iface.set_flag(IfaceFlags::LINK_UP | IfaceFlags::UP, false);
        self.detach_sockets(id);

        let Some(mut iface) = self.registry.remove(id) else {
            return Err(StackError::InvalidHandle);
        };
        for port in iface.take_ports() {
            if let Some(port_iface) = self.registry.get_mut(port) {
                port_iface.set_bridge(None);
            }
            self.attach_sockets(port);
            debug!(bridge = %id, port = %port, "port detached");
        }
        debug!(iface = %id, "interface removed");
        Ok(())
    }

    pub fn set_admin_state(&mut self, id: InterfaceId, up: bool) -> Result<()> {
        self.set_flag(id, IfaceFlags::UP, up)
    }

    pub fn set_link_state(&mut self, id: InterfaceId, up: bool) -> Result<()> {
        self.set_flag(id, IfaceFlags::LINK_UP, up)
    }

    fn set_flag(&mut self, id: InterfaceId, flag: IfaceFlags, on: bool) -> Result<()> {
        let iface = self.registry.get_mut(id).ok_or(StackError::InvalidHandle)?;
        iface.set_flag(flag, on);
        debug!(iface = %id, flags = ?iface.flags(), "interface state changed");

        // Stations behind a port that went down must be relearned elsewhere.
        if !iface.is_up() {
            if let Some(bridge) = iface.bridge() {
                if let Some(fdb) = self.registry.get_mut(bridge).and_then(|b| b.fdb_mut()) {
                    fdb.forget_port(id);
                }
            }
        }
        Ok(())
    }

    pub fn interface(&self, id: InterfaceId) -> Option<InterfaceInfo> {
        self.registry.get(id).map(VirtualInterface::info)
    }

    /// All interfaces in creation order.
    pub fn interfaces(&self) -> Vec<InterfaceInfo> {
        self.registry.iter().map(VirtualInterface::info).collect()
    }

    /// Stations learned by a bridge.
    pub fn bridge_fdb(&self, bridge: InterfaceId) -> Result<Vec<FdbEntry>> {
        self.registry
            .get(bridge)
            .and_then(VirtualInterface::fdb)
            .map(|fdb| fdb.entries())
            .ok_or(StackError::InvalidHandle)
    }

    /// Hands one frame (Tap/Bridge) or IP packet (Loopback/Tunnel) from the host to the engine.
    ///
    /// `bytes` is only borrowed for the duration of the call. Frames arriving on a bridge port are
    /// switched by the bridge. Notifications caused by the frame are delivered before returning.
    pub fn deliver_inbound(&mut self, id: InterfaceId, bytes: &[u8]) -> Result<()> {
        let iface = self.registry.get(id).ok_or(StackError::InvalidHandle)?;
        if !iface.is_up() {
            return Err(StackError::InterfaceDown);
        }
        let bridge = iface.bridge();
        let frame = self.pool.borrow_frame(bytes).ok_or(StackError::NoMemory)?;
        trace!(iface = %id, len = frame.len(), "inbound");

        match bridge {
            Some(bridge) => self.bridge_input(bridge, id, frame.bytes()),
            None => {
                self.registry
                    .poll(id, self.now, Some(frame.bytes()), &mut *self.transport, &self.pool);
            }
        }
        drop(frame);

        self.dispatch();
        Ok(())
    }

    fn bridge_input(&mut self, bridge_id: InterfaceId, in_port: InterfaceId, frame: &[u8]) {
        let up_ports = self.registry.up_ports(bridge_id);
        let now = self.now;
        let Some(bridge) = self.registry.get_mut(bridge_id) else {
            return;
        };
        if !bridge.is_up() {
            trace!(bridge = %bridge_id, "bridge down, frame dropped");
            return;
        }
        let Some(mac) = bridge.mac() else { return };
        let Some(fdb) = bridge.fdb_mut() else { return };
        let decision = fdb.ingress(mac, frame, in_port, &up_ports, now);

        for port in decision.forward {
            trace!(bridge = %bridge_id, from = %in_port, to = %port, "forward");
            self.transport.transmit(port, frame);
        }
        if decision.local {
            self.registry
                .poll(bridge_id, now, Some(frame), &mut *self.transport, &self.pool);
        }
    }

    /// Lets one interface transmit whatever its sockets have ready.
    pub(crate) fn flush(&mut self, id: InterfaceId) {
        self.registry
            .poll(id, self.now, None, &mut *self.transport, &self.pool);
    }

    /// Translates engine state changes into notifications, then flushes interfaces whose sockets
    /// were touched while doing so.
    pub(crate) fn dispatch(&mut self) {
        let mut dirty = self.dispatch_tcp();
        self.dispatch_udp();
        self.reap_tcp();
        dirty.retain(|id| self.registry.get(*id).is_some());
        for id in dirty {
            self.flush(id);
        }
    }

    /// Gives a newly socket-hosting interface its share of every wildcard listener and endpoint.
    fn attach_sockets(&mut self, id: InterfaceId) {
        let Some(iface) = self.registry.get_mut(id) else {
            return;
        };
        if !iface.hosts_sockets() {
            return;
        }
        self.tcp.attach_interface(iface, &self.cfg);
        self.udp.attach_interface(iface, &self.cfg);
    }

    /// Drops every listener and endpoint socket on `id` and aborts its connections.
    fn detach_sockets(&mut self, id: InterfaceId) {
        self.tcp.detach_interface(&mut self.registry, id);
        self.udp.detach_interface(&mut self.registry, id);
    }
}
