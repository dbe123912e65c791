use core::net::Ipv4Addr;

use thiserror::Error;
use vnet_backend::InterfaceId;

pub type Result<T> = std::result::Result<T, StackError>;

/// Error type shared by every stack operation.
///
/// All failures are reported synchronously as values; nothing in the stack panics on resource
/// exhaustion. A full TCP send window is not an error: [`crate::NetStack::tcp_send`] returns
/// `Ok(0)` instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StackError {
    /// A structure could not be allocated (interface wrapper, PCB, copied buffer).
    ///
    /// Always recoverable: retrying once resources are released may succeed.
    #[error("allocation failed")]
    AllocationFailed,

    /// No packet buffer was available to wrap inbound bytes.
    #[error("out of packet buffers")]
    NoMemory,

    #[error("address {addr}:{port} is already in use")]
    BindConflict { addr: Ipv4Addr, port: u16 },

    /// The engine refused to start an active open, e.g. for an unusable remote endpoint.
    #[error("connection rejected by the engine")]
    ConnectRejected,

    /// The handle does not refer to a live interface, listener, connection or endpoint.
    #[error("invalid handle")]
    InvalidHandle,

    #[error("no route to destination")]
    NoRoute,

    #[error("broadcast is not enabled on this endpoint")]
    BroadcastNotPermitted,

    #[error("interface is down")]
    InterfaceDown,

    #[error("netmask is not contiguous")]
    InvalidNetmask,

    #[error("{port} is attached to bridge {bridge}")]
    PortAttached {
        port: InterfaceId,
        bridge: InterfaceId,
    },

    #[error("bridge supports at most {max} ports, got {count}")]
    TooManyPorts { count: usize, max: usize },

    /// Only Ethernet (Tap) interfaces that are not already bridged can become bridge ports.
    #[error("interface cannot be used as a bridge port")]
    UnsupportedPort,

    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),

    /// Engine return code passed through unchanged.
    #[error("engine error: {0}")]
    Engine(&'static str),
}
