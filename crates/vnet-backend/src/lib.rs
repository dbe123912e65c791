//! Host-side transport primitives for the virtual network stack.
//!
//! This crate is intentionally minimal: it deals exclusively with raw wire payloads (Ethernet
//! frames for Tap/Bridge interfaces, bare IPv4 packets for Tunnel interfaces) and the identity of
//! the interface they belong to. It has no knowledge of the protocol engine, so host glue that only
//! needs to move bytes does not have to depend on `vnet-stack`.
#![forbid(unsafe_code)]

use core::fmt;

pub mod queue;

pub use queue::{FrameQueue, FrameQueueStats};

/// Stable handle of a virtual interface.
///
/// Handles are allocated monotonically by the stack and never reused for the lifetime of a stack
/// instance, so ordering by handle is ordering by creation.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterfaceId(u32);

impl InterfaceId {
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "if#{}", self.0)
    }
}

impl fmt::Display for InterfaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "if#{}", self.0)
    }
}

/// Outbound path from the stack to the host transport.
///
/// The stack calls [`HostTransport::transmit`] whenever the engine has assembled a frame (or, for
/// point-to-point interfaces, an IP packet) for the interface identified by `iface`. The payload is
/// only valid for the duration of the call; implementations that need it later must copy it.
pub trait HostTransport {
    fn transmit(&mut self, iface: InterfaceId, frame: &[u8]);
}

impl<T: HostTransport + ?Sized> HostTransport for Box<T> {
    fn transmit(&mut self, iface: InterfaceId, frame: &[u8]) {
        <T as HostTransport>::transmit(&mut **self, iface, frame);
    }
}

impl<T: HostTransport + ?Sized> HostTransport for &mut T {
    fn transmit(&mut self, iface: InterfaceId, frame: &[u8]) {
        <T as HostTransport>::transmit(&mut **self, iface, frame);
    }
}

/// Discards every frame.
impl HostTransport for () {
    fn transmit(&mut self, _iface: InterfaceId, _frame: &[u8]) {}
}

impl<T: HostTransport> HostTransport for Option<T> {
    fn transmit(&mut self, iface: InterfaceId, frame: &[u8]) {
        if let Some(transport) = self.as_mut() {
            transport.transmit(iface, frame);
        }
    }
}

impl<T: HostTransport + ?Sized> HostTransport for std::rc::Rc<std::cell::RefCell<T>> {
    fn transmit(&mut self, iface: InterfaceId, frame: &[u8]) {
        self.borrow_mut().transmit(iface, frame);
    }
}

impl<T: HostTransport + ?Sized> HostTransport for std::sync::Arc<std::sync::Mutex<T>> {
    fn transmit(&mut self, iface: InterfaceId, frame: &[u8]) {
        self.lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .transmit(iface, frame);
    }
}

/// Adapts a closure into a [`HostTransport`].
pub struct FnTransport<F>(pub F);

impl<F: FnMut(InterfaceId, &[u8])> HostTransport for FnTransport<F> {
    fn transmit(&mut self, iface: InterfaceId, frame: &[u8]) {
        (self.0)(iface, frame)
    }
}
