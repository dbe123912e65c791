//! Host-visible notification surface.

use core::fmt;
use core::net::Ipv4Addr;
use std::cell::RefCell;
use std::rc::Rc;

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(u32);

        impl $name {
            pub const fn raw(self) -> u32 {
                self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "#{}"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Debug::fmt(self, f)
            }
        }
    };
}

handle_type!(
    /// A passive TCP listener returned by [`crate::NetStack::tcp_listen`].
    ListenerId,
    "listener"
);
handle_type!(
    /// One TCP connection, either accepted from a listener or opened with
    /// [`crate::NetStack::tcp_connect`].
    ConnectionId,
    "conn"
);
handle_type!(
    /// A bound UDP endpoint returned by [`crate::NetStack::udp_open`].
    EndpointId,
    "udp"
);

/// Monotonic allocator for one kind of handle. Handles are never reused within a stack.
#[derive(Debug, Default)]
pub(crate) struct HandleAlloc {
    next: u32,
}

impl HandleAlloc {
    pub(crate) fn listener(&mut self) -> ListenerId {
        ListenerId(self.bump())
    }

    pub(crate) fn connection(&mut self) -> ConnectionId {
        ConnectionId(self.bump())
    }

    pub(crate) fn endpoint(&mut self) -> EndpointId {
        EndpointId(self.bump())
    }

    fn bump(&mut self) -> u32 {
        self.next = self.next.wrapping_add(1);
        self.next
    }
}

/// Receiver of engine activity translated into connection-level events.
///
/// Every method has an empty default body so implementors only handle what they care about.
/// Notifications are only delivered from [`crate::NetStack::deliver_inbound`],
/// [`crate::NetStack::drain_self_queued`] and the `expire_timers*` ticks; the notifier never gets
/// access to the stack, so it cannot re-enter it.
pub trait Notifier {
    /// A handshake on `listener` completed and produced `conn`.
    fn on_accept(&mut self, listener: ListenerId, conn: ConnectionId) {
        let _ = (listener, conn);
    }

    /// An outbound connection reached the established state.
    fn on_connected(&mut self, conn: ConnectionId) {
        let _ = conn;
    }

    /// Terminal event for `conn`. Fires exactly once; the handle is invalid afterwards.
    fn on_closed(&mut self, conn: ConnectionId) {
        let _ = conn;
    }

    /// New in-order bytes. They keep occupying the receive window until acknowledged with
    /// [`crate::NetStack::tcp_mark_received`].
    fn on_received(&mut self, conn: ConnectionId, data: &[u8]) {
        let _ = (conn, data);
    }

    /// `len` previously sent bytes were acknowledged by the peer.
    fn on_sent(&mut self, conn: ConnectionId, len: usize) {
        let _ = (conn, len);
    }

    fn on_datagram(&mut self, endpoint: EndpointId, src_addr: Ipv4Addr, src_port: u16, data: &[u8]) {
        let _ = (endpoint, src_addr, src_port, data);
    }
}

/// Ignores every notification.
impl Notifier for () {}

macro_rules! forward_notifier {
    ($($target:tt)*) => {
        fn on_accept(&mut self, listener: ListenerId, conn: ConnectionId) {
            $($target)*(self).on_accept(listener, conn)
        }

        fn on_connected(&mut self, conn: ConnectionId) {
            $($target)*(self).on_connected(conn)
        }

        fn on_closed(&mut self, conn: ConnectionId) {
            $($target)*(self).on_closed(conn)
        }

        fn on_received(&mut self, conn: ConnectionId, data: &[u8]) {
            $($target)*(self).on_received(conn, data)
        }

        fn on_sent(&mut self, conn: ConnectionId, len: usize) {
            $($target)*(self).on_sent(conn, len)
        }

        fn on_datagram(
            &mut self,
            endpoint: EndpointId,
            src_addr: Ipv4Addr,
            src_port: u16,
            data: &[u8],
        ) {
            $($target)*(self).on_datagram(endpoint, src_addr, src_port, data)
        }
    };
}

fn deref_box<T: ?Sized>(b: &mut Box<T>) -> &mut T {
    &mut **b
}

fn deref_mut_ref<'a, T: ?Sized>(r: &'a mut &mut T) -> &'a mut T {
    &mut **r
}

impl<T: Notifier + ?Sized> Notifier for Box<T> {
    forward_notifier!(deref_box);
}

impl<T: Notifier + ?Sized> Notifier for &mut T {
    forward_notifier!(deref_mut_ref);
}

impl<T: Notifier + ?Sized> Notifier for Rc<RefCell<T>> {
    forward_notifier!(RefCell::borrow_mut);
}

/// A notification captured by [`EventLog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackEvent {
    Accepted {
        listener: ListenerId,
        conn: ConnectionId,
    },
    Connected(ConnectionId),
    Closed(ConnectionId),
    Received {
        conn: ConnectionId,
        data: Vec<u8>,
    },
    Sent {
        conn: ConnectionId,
        len: usize,
    },
    Datagram {
        endpoint: EndpointId,
        src_addr: Ipv4Addr,
        src_port: u16,
        data: Vec<u8>,
    },
}

/// [`Notifier`] that records every event in arrival order, for hosts that prefer polling.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Vec<StackEvent>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> &[StackEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn drain(&mut self) -> Vec<StackEvent> {
        std::mem::take(&mut self.events)
    }
}

impl Notifier for EventLog {
    fn on_accept(&mut self, listener: ListenerId, conn: ConnectionId) {
        self.events.push(StackEvent::Accepted { listener, conn });
    }

    fn on_connected(&mut self, conn: ConnectionId) {
        self.events.push(StackEvent::Connected(conn));
    }

    fn on_closed(&mut self, conn: ConnectionId) {
        self.events.push(StackEvent::Closed(conn));
    }

    fn on_received(&mut self, conn: ConnectionId, data: &[u8]) {
        self.events.push(StackEvent::Received {
            conn,
            data: data.to_vec(),
        });
    }

    fn on_sent(&mut self, conn: ConnectionId, len: usize) {
        self.events.push(StackEvent::Sent { conn, len });
    }

    fn on_datagram(&mut self, endpoint: EndpointId, src_addr: Ipv4Addr, src_port: u16, data: &[u8]) {
        self.events.push(StackEvent::Datagram {
            endpoint,
            src_addr,
            src_port,
            data: data.to_vec(),
        });
    }
}
