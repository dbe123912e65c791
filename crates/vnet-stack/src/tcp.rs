//! TCP connection lifecycle: listeners, active connections and the translation of engine socket
//! state into [`crate::Notifier`] events.
//!
//! The engine reports nothing by callback, so every tick compares each socket against what was
//! last surfaced for it: new in-order bytes become `on_received`, a shrinking send queue becomes
//! `on_sent`, and so on. Surfaced bytes are only peeked; they leave the engine's receive buffer
//! (and reopen the window) when the host calls [`NetStack::tcp_mark_received`].

use core::net::{Ipv4Addr, SocketAddrV4};
use std::collections::{BTreeMap, BTreeSet};

use smoltcp::iface::SocketHandle;
use smoltcp::socket::tcp::{self, State};
use smoltcp::time::Duration;
use smoltcp::wire::IpListenEndpoint;
use tracing::{debug, trace, warn};
use vnet_backend::InterfaceId;

use crate::addr::{from_engine_addr, to_engine_addr, to_engine_endpoint};
use crate::config::StackConfig;
use crate::error::{Result, StackError};
use crate::events::{ConnectionId, ListenerId};
use crate::iface::VirtualInterface;
use crate::registry::Registry;
use crate::NetStack;

pub(crate) struct Listener {
    /// `UNSPECIFIED` for a wildcard listener.
    addr: Ipv4Addr,
    port: u16,
    /// Sockets in `Listen`, `listen_backlog` of them per hosting interface.
    backlog: Vec<(InterfaceId, SocketHandle)>,
}

impl Listener {
    fn listens_on(&self, iface: &VirtualInterface) -> bool {
        self.addr.is_unspecified() || iface.address() == Some(self.addr)
    }

    fn endpoint(&self) -> IpListenEndpoint {
        IpListenEndpoint {
            addr: (!self.addr.is_unspecified()).then(|| to_engine_addr(self.addr)),
            port: self.port,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Accepted(ListenerId),
    /// Outbound; holds an ephemeral port until the socket is reclaimed.
    Connected { addr: Ipv4Addr, port: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Open,
}

pub(crate) struct Connection {
    iface: InterfaceId,
    handle: SocketHandle,
    origin: Origin,
    phase: Phase,
    /// Bytes at the head of the receive buffer already passed to `on_received`.
    delivered: usize,
    /// Send queue length last reported; the difference to the current one was acknowledged.
    unacked: usize,
}

/// A socket whose connection has been reported closed but which the engine still needs, e.g. to
/// finish the FIN exchange or sit out TIME-WAIT.
struct Retired {
    iface: InterfaceId,
    handle: SocketHandle,
    origin: Origin,
}

#[derive(Default)]
pub(crate) struct TcpBridge {
    listeners: BTreeMap<ListenerId, Listener>,
    conns: BTreeMap<ConnectionId, Connection>,
    retired: Vec<Retired>,
}

fn new_socket(cfg: &StackConfig) -> tcp::Socket<'static> {
    let rx = tcp::SocketBuffer::new(vec![0; cfg.tcp_rx_buffer_len]);
    let tx = tcp::SocketBuffer::new(vec![0; cfg.tcp_tx_buffer_len]);
    let mut socket = tcp::Socket::new(rx, tx);
    socket.set_ack_delay(cfg.tcp_ack_delay_ms.map(Duration::from_millis));
    socket.set_nagle_enabled(cfg.tcp_nagle);
    socket.set_timeout(cfg.tcp_timeout_ms.map(Duration::from_millis));
    socket.set_keep_alive(cfg.tcp_keep_alive_ms.map(Duration::from_millis));
    socket
}

fn listen_socket(cfg: &StackConfig, endpoint: IpListenEndpoint) -> Result<tcp::Socket<'static>> {
    let mut socket = new_socket(cfg);
    socket
        .listen(endpoint)
        .map_err(|_| StackError::Engine("tcp listen failed"))?;
    Ok(socket)
}

/// True once the three-way handshake has completed, whatever happened afterwards.
fn handshake_done(state: State) -> bool {
    !matches!(
        state,
        State::Closed | State::Listen | State::SynSent | State::SynReceived
    )
}

/// True when the peer's FIN has been processed.
fn peer_finished(state: State) -> bool {
    matches!(
        state,
        State::CloseWait | State::LastAck | State::Closing | State::TimeWait
    )
}

impl TcpBridge {
    fn fill_backlog(
        listener: &mut Listener,
        iface: &mut VirtualInterface,
        cfg: &StackConfig,
    ) -> Result<()> {
        if !listener.listens_on(iface) {
            return Ok(());
        }
        for _ in 0..cfg.listen_backlog {
            let socket = listen_socket(cfg, listener.endpoint())?;
            let handle = iface.sockets.add(socket);
            listener.backlog.push((iface.id(), handle));
        }
        Ok(())
    }

    fn drop_backlog(registry: &mut Registry, backlog: &[(InterfaceId, SocketHandle)]) {
        for &(iface, handle) in backlog {
            if let Some(iface) = registry.get_mut(iface) {
                iface.sockets.remove(handle);
            }
        }
    }

    pub(crate) fn attach_interface(&mut self, iface: &mut VirtualInterface, cfg: &StackConfig) {
        for (id, listener) in &mut self.listeners {
            if let Err(err) = Self::fill_backlog(listener, iface, cfg) {
                warn!(listener = %id, iface = %iface.id(), %err, "could not extend listener");
            }
        }
    }

    pub(crate) fn detach_interface(&mut self, registry: &mut Registry, id: InterfaceId) {
        for listener in self.listeners.values_mut() {
            let (gone, kept) = listener
                .backlog
                .iter()
                .copied()
                .partition::<Vec<_>, _>(|(iface, _)| *iface == id);
            Self::drop_backlog(registry, &gone);
            listener.backlog = kept;
        }
        let Some(iface) = registry.get_mut(id) else {
            return;
        };
        for conn in self.conns.values().filter(|conn| conn.iface == id) {
            iface.sockets.get_mut::<tcp::Socket>(conn.handle).abort();
        }
    }
}

impl NetStack {
    /// Starts accepting connections on `addr:port`, or on every interface when `addr` is `None`.
    ///
    /// Port 0 picks an ephemeral port; see [`NetStack::tcp_listen_port`]. Interfaces created later
    /// join wildcard listeners automatically.
    pub fn tcp_listen(&mut self, addr: Option<Ipv4Addr>, port: u16) -> Result<ListenerId> {
        let addr = addr.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let port = self.tcp_ports.bind(addr, port)?;
        let mut listener = Listener {
            addr,
            port,
            backlog: Vec::new(),
        };
        for id in self.registry.ids() {
            let Some(iface) = self.registry.get_mut(id) else {
                continue;
            };
            if !iface.hosts_sockets() {
                continue;
            }
            if let Err(err) = TcpBridge::fill_backlog(&mut listener, iface, &self.cfg) {
                TcpBridge::drop_backlog(&mut self.registry, &listener.backlog);
                self.tcp_ports.release(addr, port);
                return Err(err);
            }
        }
        let id = self.handles.listener();
        debug!(listener = %id, %addr, port, "tcp listen");
        self.tcp.listeners.insert(id, listener);
        Ok(id)
    }

    pub fn tcp_listen_port(&self, listener: ListenerId) -> Result<u16> {
        self.tcp
            .listeners
            .get(&listener)
            .map(|listener| listener.port)
            .ok_or(StackError::InvalidHandle)
    }

    /// Stops accepting and frees the port. Connections already accepted are unaffected.
    pub fn tcp_close_listener(&mut self, listener: ListenerId) -> Result<()> {
        let removed = self
            .tcp
            .listeners
            .remove(&listener)
            .ok_or(StackError::InvalidHandle)?;
        TcpBridge::drop_backlog(&mut self.registry, &removed.backlog);
        self.tcp_ports.release(removed.addr, removed.port);
        debug!(%listener, "tcp listener closed");
        Ok(())
    }

    /// Starts an active open towards `dst:port` over the interface routing `dst`.
    ///
    /// An immediate failure is returned here and produces no notification. Otherwise exactly one
    /// of `on_connected` or `on_closed` follows on a later tick.
    pub fn tcp_connect(&mut self, dst: Ipv4Addr, port: u16) -> Result<ConnectionId> {
        let iface_id = self.registry.route(dst).ok_or(StackError::NoRoute)?;
        let local_addr = self
            .registry
            .get(iface_id)
            .and_then(VirtualInterface::address)
            .ok_or(StackError::NoRoute)?;
        let local_port = self.tcp_ports.bind(local_addr, 0)?;

        let Some(iface) = self.registry.get_mut(iface_id) else {
            self.tcp_ports.release(local_addr, local_port);
            return Err(StackError::InvalidHandle);
        };
        let mut socket = new_socket(&self.cfg);
        let (engine, sockets) = iface.split();
        if let Err(err) = socket.connect(
            engine.context(),
            to_engine_endpoint(dst, port),
            to_engine_endpoint(local_addr, local_port),
        ) {
            self.tcp_ports.release(local_addr, local_port);
            debug!(%dst, port, ?err, "tcp connect rejected");
            return Err(StackError::ConnectRejected);
        }
        let handle = sockets.add(socket);

        let id = self.handles.connection();
        self.tcp.conns.insert(
            id,
            Connection {
                iface: iface_id,
                handle,
                origin: Origin::Connected {
                    addr: local_addr,
                    port: local_port,
                },
                phase: Phase::Connecting,
                delivered: 0,
                unacked: 0,
            },
        );
        debug!(conn = %id, iface = %iface_id, %dst, port, local_port, "tcp connect");
        self.flush(iface_id);
        Ok(id)
    }

    fn conn_socket(&mut self, conn: ConnectionId) -> Result<(&mut Connection, &mut tcp::Socket<'static>)> {
        let entry = self.tcp.conns.get_mut(&conn).ok_or(StackError::InvalidHandle)?;
        let iface = self
            .registry
            .get_mut(entry.iface)
            .ok_or(StackError::InvalidHandle)?;
        let socket = iface.sockets.get_mut::<tcp::Socket>(entry.handle);
        Ok((entry, socket))
    }

    /// Queues up to `min(data.len(), send window)` bytes and returns how many were taken.
    ///
    /// Returns `Ok(0)` without touching the engine while the window is full or the connection
    /// cannot send (still connecting, or closing).
    pub fn tcp_send(&mut self, conn: ConnectionId, data: &[u8]) -> Result<usize> {
        let (entry, socket) = self.conn_socket(conn)?;
        if entry.phase == Phase::Connecting || !socket.may_send() {
            return Ok(0);
        }
        let window = socket.send_capacity() - socket.send_queue();
        let len = data.len().min(window);
        if len == 0 {
            return Ok(0);
        }
        let sent = socket
            .send_slice(&data[..len])
            .map_err(|_| StackError::Engine("tcp send failed"))?;
        entry.unacked += sent;
        let iface = entry.iface;
        trace!(%conn, sent, "tcp send");
        self.flush(iface);
        Ok(sent)
    }

    /// Space currently available in the send buffer.
    pub fn tcp_send_window(&mut self, conn: ConnectionId) -> Result<usize> {
        let (entry, socket) = self.conn_socket(conn)?;
        if entry.phase == Phase::Connecting || !socket.may_send() {
            return Ok(0);
        }
        Ok(socket.send_capacity() - socket.send_queue())
    }

    /// Acknowledges `len` bytes previously surfaced through `on_received`, reopening the
    /// receive window by that much. Lengths beyond what was surfaced are clamped.
    pub fn tcp_mark_received(&mut self, conn: ConnectionId, len: usize) -> Result<()> {
        let (entry, socket) = self.conn_socket(conn)?;
        let len = len.min(entry.delivered);
        let mut remaining = len;
        while remaining > 0 {
            let taken = socket
                .recv(|buf| {
                    let n = remaining.min(buf.len());
                    (n, n)
                })
                .map_err(|_| StackError::Engine("tcp recv failed"))?;
            if taken == 0 {
                break;
            }
            remaining -= taken;
        }
        entry.delivered -= len - remaining;
        let iface = entry.iface;
        self.flush(iface);
        Ok(())
    }

    /// Starts a graceful close. Not terminal: `on_closed` still follows once the engine has
    /// seen the peer's side finish (or reset).
    pub fn tcp_close(&mut self, conn: ConnectionId) -> Result<()> {
        let (entry, socket) = self.conn_socket(conn)?;
        socket.close();
        let iface = entry.iface;
        debug!(%conn, state = %socket.state(), "tcp close");
        self.flush(iface);
        Ok(())
    }

    /// Local and remote address of a connection.
    pub fn tcp_endpoints(&mut self, conn: ConnectionId) -> Result<(SocketAddrV4, SocketAddrV4)> {
        let (_, socket) = self.conn_socket(conn)?;
        let convert = |endpoint: Option<smoltcp::wire::IpEndpoint>| {
            let endpoint = endpoint?;
            Some(SocketAddrV4::new(from_engine_addr(endpoint.addr)?, endpoint.port))
        };
        match (convert(socket.local_endpoint()), convert(socket.remote_endpoint())) {
            (Some(local), Some(remote)) => Ok((local, remote)),
            _ => Err(StackError::Engine("connection has no endpoints")),
        }
    }

    /// Promotes completed handshakes, then walks every connection. Returns interfaces whose
    /// sockets were given work that still has to be transmitted.
    pub(crate) fn dispatch_tcp(&mut self) -> BTreeSet<InterfaceId> {
        let mut dirty = BTreeSet::new();
        let Self {
            cfg,
            registry,
            tcp,
            handles,
            pool,
            notifier,
            tcp_ports,
            ..
        } = self;
        let TcpBridge {
            listeners,
            conns,
            retired,
        } = tcp;

        for (&listener_id, listener) in listeners.iter_mut() {
            let endpoint = listener.endpoint();
            let mut backlog = Vec::with_capacity(listener.backlog.len());
            for (iface_id, handle) in std::mem::take(&mut listener.backlog) {
                let Some(iface) = registry.get_mut(iface_id) else {
                    continue;
                };
                let socket = iface.sockets.get_mut::<tcp::Socket>(handle);
                let state = socket.state();
                if !handshake_done(state) {
                    if state == State::Closed {
                        // Handshake timed out; ready the socket for the next SYN.
                        if socket.listen(endpoint).is_err() {
                            iface.sockets.remove(handle);
                            continue;
                        }
                    }
                    backlog.push((iface_id, handle));
                    continue;
                }

                let unacked = socket.send_queue();
                match listen_socket(cfg, endpoint) {
                    Ok(fresh) => backlog.push((iface_id, iface.sockets.add(fresh))),
                    Err(err) => warn!(listener = %listener_id, %err, "backlog not replenished"),
                }
                let conn = handles.connection();
                conns.insert(
                    conn,
                    Connection {
                        iface: iface_id,
                        handle,
                        origin: Origin::Accepted(listener_id),
                        phase: Phase::Open,
                        delivered: 0,
                        unacked,
                    },
                );
                debug!(listener = %listener_id, %conn, iface = %iface_id, "tcp accept");
                notifier.on_accept(listener_id, conn);
            }
            listener.backlog = backlog;
        }

        let ids: Vec<ConnectionId> = conns.keys().copied().collect();
        for id in ids {
            let Some(conn) = conns.get_mut(&id) else {
                continue;
            };
            let Some(iface) = registry.get_mut(conn.iface) else {
                // The interface went away and took the socket with it.
                if let Origin::Connected { addr, port } = conn.origin {
                    tcp_ports.release(addr, port);
                }
                conns.remove(&id);
                debug!(conn = %id, "tcp closed with its interface");
                notifier.on_closed(id);
                continue;
            };
            let socket = iface.sockets.get_mut::<tcp::Socket>(conn.handle);
            let state = socket.state();

            if conn.phase == Phase::Connecting {
                if handshake_done(state) {
                    conn.phase = Phase::Open;
                    conn.unacked = socket.send_queue();
                    debug!(conn = %id, "tcp connected");
                    notifier.on_connected(id);
                } else if state != State::Closed {
                    continue;
                }
            }

            let queued = socket.send_queue();
            if queued < conn.unacked {
                notifier.on_sent(id, conn.unacked - queued);
            }
            conn.unacked = queued;

            let available = socket.recv_queue();
            if available > conn.delivered {
                match pool.alloc(available) {
                    Some(mut buf) => {
                        let read = socket.peek_slice(buf.as_mut_slice()).unwrap_or(0);
                        buf.truncate(read);
                        if read > conn.delivered {
                            trace!(conn = %id, len = read - conn.delivered, "tcp received");
                            notifier.on_received(id, &buf[conn.delivered..]);
                            conn.delivered = read;
                        }
                    }
                    // Only while looped frames hold every buffer.
                    None => trace!(conn = %id, "receive deferred, no buffers"),
                }
            }

            let finished = peer_finished(state) && socket.recv_queue() == conn.delivered;
            if state != State::Closed && !finished {
                continue;
            }
            if state == State::CloseWait {
                socket.close();
                dirty.insert(conn.iface);
            }
            retired.push(Retired {
                iface: conn.iface,
                handle: conn.handle,
                origin: conn.origin,
            });
            conns.remove(&id);
            debug!(conn = %id, %state, "tcp closed");
            notifier.on_closed(id);
        }
        dirty
    }

    /// Removes retired sockets the engine is done with and frees their ports.
    pub(crate) fn reap_tcp(&mut self) {
        let registry = &mut self.registry;
        let tcp_ports = &mut self.tcp_ports;
        self.tcp.retired.retain(|retired| {
            if let Some(iface) = registry.get_mut(retired.iface) {
                if iface.sockets.get::<tcp::Socket>(retired.handle).state() != State::Closed {
                    return true;
                }
                iface.sockets.remove(retired.handle);
            }
            if let Origin::Connected { addr, port } = retired.origin {
                tcp_ports.release(addr, port);
            }
            trace!(iface = %retired.iface, "tcp socket reclaimed");
            false
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_and_fin_classification() {
        assert!(!handshake_done(State::SynReceived));
        assert!(handshake_done(State::Established));
        assert!(handshake_done(State::CloseWait));
        assert!(peer_finished(State::TimeWait));
        assert!(!peer_finished(State::FinWait2));
    }

    #[test]
    fn wildcard_listener_listens_everywhere() {
        let listener = Listener {
            addr: Ipv4Addr::UNSPECIFIED,
            port: 80,
            backlog: Vec::new(),
        };
        assert_eq!(listener.endpoint().addr, None);
        assert_eq!(listener.endpoint().port, 80);
    }

    #[test]
    fn sockets_follow_config() {
        let cfg = StackConfig::default();
        let socket = new_socket(&cfg);
        assert_eq!(socket.send_capacity(), cfg.tcp_tx_buffer_len);
        assert_eq!(socket.recv_capacity(), cfg.tcp_rx_buffer_len);
        assert!(socket.nagle_enabled());
        assert_eq!(socket.timeout(), Some(Duration::from_millis(120_000)));
        assert_eq!(socket.keep_alive(), Some(Duration::from_millis(30_000)));

        let quiet = new_socket(&StackConfig {
            tcp_timeout_ms: None,
            tcp_keep_alive_ms: None,
            ..cfg
        });
        assert_eq!((quiet.timeout(), quiet.keep_alive()), (None, None));
    }
}
