//! Virtual network interfaces and TCP/UDP connection lifecycle on top of a cooperative,
//! single-threaded TCP/IP engine.
//!
//! A [`NetStack`] owns a set of interfaces (loopback, point-to-point tunnel, Ethernet tap, and
//! learning bridges over taps), a bounded packet buffer pool and the engine state behind them.
//! Hosts feed wire bytes in with [`NetStack::deliver_inbound`], receive outbound bytes through a
//! [`HostTransport`], and observe connection activity through a [`Notifier`]. Nothing runs in the
//! background: the host drives [`NetStack::drain_self_queued`] and [`NetStack::expire_timers`]
//! from its own loop.
#![forbid(unsafe_code)]

mod addr;
mod buffer;
mod config;
mod device;
mod driver;
mod error;
mod events;
mod iface;
mod ports;
pub mod pump;
mod registry;
mod stack;
mod tcp;
mod udp;

/// Milliseconds on the stack clock.
pub type Millis = u64;

pub use addr::{Ipv4Net, MacAddr};
pub use buffer::{BorrowedFrame, BufferPool, PoolStats, PooledBuf};
pub use config::{InterfaceParams, LinkParams, StackConfig, MAX_BRIDGE_PORTS, TCP_MSS};
pub use error::{Result, StackError};
pub use events::{ConnectionId, EndpointId, EventLog, ListenerId, Notifier, StackEvent};
pub use iface::bridge::FdbEntry;
pub use iface::{IfaceFlags, InterfaceInfo, InterfaceKind};
pub use pump::{pump_frames, FramePump, PumpCounts, DEFAULT_MAX_FRAMES_PER_TICK};
pub use stack::NetStack;
pub use vnet_backend::{FnTransport, FrameQueue, FrameQueueStats, HostTransport, InterfaceId};
