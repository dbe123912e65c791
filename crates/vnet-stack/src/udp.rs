//! UDP endpoints: binding, routed and broadcast sends, datagram delivery.

use core::net::Ipv4Addr;
use std::collections::BTreeMap;

use smoltcp::iface::SocketHandle;
use smoltcp::socket::udp;
use smoltcp::wire::IpListenEndpoint;
use tracing::{debug, trace, warn};
use vnet_backend::InterfaceId;

use crate::addr::{from_engine_addr, is_limited_broadcast, to_engine_addr, to_engine_endpoint};
use crate::config::StackConfig;
use crate::error::{Result, StackError};
use crate::events::EndpointId;
use crate::iface::VirtualInterface;
use crate::registry::Registry;
use crate::NetStack;

pub(crate) struct Endpoint {
    /// `UNSPECIFIED` when bound to every interface.
    addr: Ipv4Addr,
    port: u16,
    broadcast: bool,
    sockets: BTreeMap<InterfaceId, SocketHandle>,
}

impl Endpoint {
    fn binds_on(&self, iface: &VirtualInterface) -> bool {
        self.addr.is_unspecified() || iface.address() == Some(self.addr)
    }

    fn add_socket(&mut self, iface: &mut VirtualInterface, cfg: &StackConfig) -> Result<()> {
        if !self.binds_on(iface) {
            return Ok(());
        }
        let rx = udp::PacketBuffer::new(
            vec![udp::PacketMetadata::EMPTY; cfg.udp_rx_slots],
            vec![0; cfg.udp_rx_buffer_len],
        );
        let tx = udp::PacketBuffer::new(
            vec![udp::PacketMetadata::EMPTY; cfg.udp_tx_slots],
            vec![0; cfg.udp_tx_buffer_len],
        );
        let mut socket = udp::Socket::new(rx, tx);
        socket
            .bind(IpListenEndpoint {
                addr: (!self.addr.is_unspecified()).then(|| to_engine_addr(self.addr)),
                port: self.port,
            })
            .map_err(|_| StackError::Engine("udp bind failed"))?;
        self.sockets.insert(iface.id(), iface.sockets.add(socket));
        Ok(())
    }

    fn drop_sockets(&mut self, registry: &mut Registry) {
        for (iface, handle) in std::mem::take(&mut self.sockets) {
            if let Some(iface) = registry.get_mut(iface) {
                iface.sockets.remove(handle);
            }
        }
    }
}

#[derive(Default)]
pub(crate) struct UdpBridge {
    endpoints: BTreeMap<EndpointId, Endpoint>,
}

impl UdpBridge {
    pub(crate) fn attach_interface(&mut self, iface: &mut VirtualInterface, cfg: &StackConfig) {
        for (id, endpoint) in &mut self.endpoints {
            if let Err(err) = endpoint.add_socket(iface, cfg) {
                warn!(endpoint = %id, iface = %iface.id(), %err, "could not extend endpoint");
            }
        }
    }

    pub(crate) fn detach_interface(&mut self, registry: &mut Registry, id: InterfaceId) {
        let Some(iface) = registry.get_mut(id) else {
            return;
        };
        for endpoint in self.endpoints.values_mut() {
            if let Some(handle) = endpoint.sockets.remove(&id) {
                iface.sockets.remove(handle);
            }
        }
    }
}

impl NetStack {
    /// Binds a UDP endpoint to `addr:port`, or to every interface when `addr` is `None`.
    /// Port 0 picks an ephemeral port.
    ///
    /// `allow_broadcast` gates sends to `255.255.255.255`; without it such sends fail with
    /// [`StackError::BroadcastNotPermitted`] instead of falling back to unicast.
    pub fn udp_open(
        &mut self,
        addr: Option<Ipv4Addr>,
        port: u16,
        allow_broadcast: bool,
    ) -> Result<EndpointId> {
        let addr = addr.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let port = self.udp_ports.bind(addr, port)?;
        let mut endpoint = Endpoint {
            addr,
            port,
            broadcast: allow_broadcast,
            sockets: BTreeMap::new(),
        };
        for id in self.registry.ids() {
            let Some(iface) = self.registry.get_mut(id) else {
                continue;
            };
            if !iface.hosts_sockets() {
                continue;
            }
            if let Err(err) = endpoint.add_socket(iface, &self.cfg) {
                endpoint.drop_sockets(&mut self.registry);
                self.udp_ports.release(addr, port);
                return Err(err);
            }
        }
        let id = self.handles.endpoint();
        debug!(endpoint = %id, %addr, port, allow_broadcast, "udp open");
        self.udp.endpoints.insert(id, endpoint);
        Ok(id)
    }

    pub fn udp_local_port(&self, endpoint: EndpointId) -> Result<u16> {
        self.udp
            .endpoints
            .get(&endpoint)
            .map(|endpoint| endpoint.port)
            .ok_or(StackError::InvalidHandle)
    }

    /// Sends one datagram.
    ///
    /// The payload is copied into a pool buffer first, so `data` need not outlive the call; the
    /// buffer is released once every target has queued the datagram. A send to the limited
    /// broadcast address goes out once on every up, broadcast-capable interface in creation
    /// order, from `0.0.0.0` where the interface has no address yet. The first failing interface
    /// aborts the fan-out; interfaces before it still transmit.
    pub fn udp_send(
        &mut self,
        endpoint: EndpointId,
        dst: Ipv4Addr,
        port: u16,
        data: &[u8],
    ) -> Result<()> {
        let entry = self
            .udp
            .endpoints
            .get(&endpoint)
            .ok_or(StackError::InvalidHandle)?;
        let payload = self
            .pool
            .copy_from(data)
            .ok_or(StackError::AllocationFailed)?;

        let broadcast = is_limited_broadcast(dst);
        let targets = if broadcast {
            if !entry.broadcast {
                return Err(StackError::BroadcastNotPermitted);
            }
            self.registry.broadcast_targets()
        } else {
            vec![self.registry.route(dst).ok_or(StackError::NoRoute)?]
        };
        let sockets = entry.sockets.clone();

        let mut queued = Vec::with_capacity(targets.len());
        let mut result = Ok(());
        for iface_id in targets {
            match self.enqueue_datagram(&sockets, iface_id, broadcast, dst, port, &payload) {
                Ok(()) => {
                    trace!(%endpoint, iface = %iface_id, %dst, port, len = payload.len(), "udp send");
                    queued.push(iface_id);
                }
                Err(err) => {
                    debug!(%endpoint, iface = %iface_id, %err, "udp send aborted");
                    result = Err(err);
                    break;
                }
            }
        }
        drop(payload);
        for iface_id in queued {
            self.flush(iface_id);
        }
        result
    }

    fn enqueue_datagram(
        &mut self,
        sockets: &BTreeMap<InterfaceId, SocketHandle>,
        iface_id: InterfaceId,
        broadcast: bool,
        dst: Ipv4Addr,
        port: u16,
        payload: &[u8],
    ) -> Result<()> {
        let handle = *sockets.get(&iface_id).ok_or(StackError::NoRoute)?;
        let iface = self
            .registry
            .get_mut(iface_id)
            .ok_or(StackError::InvalidHandle)?;
        let mut meta = udp::UdpMetadata::from(to_engine_endpoint(dst, port));
        if iface.address().is_none() {
            if !broadcast {
                return Err(StackError::NoRoute);
            }
            meta.local_address = Some(to_engine_addr(Ipv4Addr::UNSPECIFIED));
        }
        iface
            .sockets
            .get_mut::<udp::Socket>(handle)
            .send_slice(payload, meta)
            .map_err(|err| match err {
                udp::SendError::BufferFull => StackError::AllocationFailed,
                _ => StackError::NoRoute,
            })
    }

    /// Releases the endpoint. UDP has no terminal notification.
    pub fn udp_close(&mut self, endpoint: EndpointId) -> Result<()> {
        let mut removed = self
            .udp
            .endpoints
            .remove(&endpoint)
            .ok_or(StackError::InvalidHandle)?;
        removed.drop_sockets(&mut self.registry);
        self.udp_ports.release(removed.addr, removed.port);
        debug!(%endpoint, "udp closed");
        Ok(())
    }

    /// Surfaces every queued datagram. When the pool is exhausted (only while looped frames hold
    /// buffers) the rest stay queued in the engine until a later tick.
    pub(crate) fn dispatch_udp(&mut self) {
        let Self {
            registry,
            udp,
            pool,
            notifier,
            ..
        } = self;
        for (&id, endpoint) in &udp.endpoints {
            for (&iface_id, &handle) in &endpoint.sockets {
                let Some(iface) = registry.get_mut(iface_id) else {
                    continue;
                };
                let socket = iface.sockets.get_mut::<udp::Socket>(handle);
                while socket.can_recv() {
                    let Ok((data, meta)) = socket.peek() else {
                        break;
                    };
                    let src = meta.endpoint;
                    let Some(buf) = pool.copy_from(data) else {
                        trace!(endpoint = %id, "datagram deferred, no buffers");
                        break;
                    };
                    let _ = socket.recv();
                    let Some(src_addr) = from_engine_addr(src.addr) else {
                        continue;
                    };
                    trace!(endpoint = %id, %src_addr, src_port = src.port, len = buf.len(), "udp received");
                    notifier.on_datagram(id, src_addr, src.port, &buf);
                }
            }
        }
    }
}
