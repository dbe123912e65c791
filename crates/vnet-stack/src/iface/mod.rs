//! Virtual interfaces: one sum type over the four link flavours, each owning exactly one engine
//! interface and the engine sockets hosted on it.

pub mod bridge;

use core::net::Ipv4Addr;

use bitflags::bitflags;
use smoltcp::iface::{Config, Interface, SocketSet};
use smoltcp::phy::{DeviceCapabilities, Medium};
use smoltcp::time::Instant;
use smoltcp::wire::HardwareAddress;
use tracing::trace;
use vnet_backend::{HostTransport, InterfaceId};

use crate::addr::{Ipv4Net, MacAddr};
use crate::buffer::BufferPool;
use crate::config::{InterfaceParams, LinkParams, StackConfig};
use crate::device::{self, Egress, LinkDevice, LoopQueue, Outbound, LOOPBACK_MTU};
use crate::error::{Result, StackError};
use crate::Millis;

use self::bridge::Fdb;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceKind {
    Loopback,
    Tunnel,
    Tap,
    Bridge,
}

impl InterfaceKind {
    /// Conventional name prefix, completed with a per-kind index (`lo0`, `tap1`, ...).
    pub fn name_prefix(self) -> &'static str {
        match self {
            InterfaceKind::Loopback => "lo",
            InterfaceKind::Tunnel => "tun",
            InterfaceKind::Tap => "tap",
            InterfaceKind::Bridge => "br",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            InterfaceKind::Loopback => 0,
            InterfaceKind::Tunnel => 1,
            InterfaceKind::Tap => 2,
            InterfaceKind::Bridge => 3,
        }
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct IfaceFlags: u8 {
        /// Administratively up.
        const UP = 1 << 0;
        const LINK_UP = 1 << 1;
        /// Eligible for limited-broadcast fan-out.
        const BROADCAST = 1 << 2;
        const ETHARP = 1 << 3;
        const ETHERNET = 1 << 4;
    }
}

/// Snapshot of an interface, as returned by [`crate::NetStack::interface`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub id: InterfaceId,
    pub kind: InterfaceKind,
    pub name: String,
    pub mac: Option<MacAddr>,
    pub address: Option<Ipv4Addr>,
    pub netmask: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub mtu: u16,
    pub flags: IfaceFlags,
    pub tag: u64,
    /// Bridge this interface is attached to as a port.
    pub bridge: Option<InterfaceId>,
    /// Ports of a bridge, in attachment order. Empty for every other kind.
    pub ports: Vec<InterfaceId>,
}

pub(crate) enum Link {
    Loopback,
    Tunnel,
    Tap {
        mac: MacAddr,
        bridge: Option<InterfaceId>,
    },
    Bridge {
        mac: MacAddr,
        ports: Vec<InterfaceId>,
        fdb: Fdb,
    },
}

pub(crate) struct VirtualInterface {
    id: InterfaceId,
    name: String,
    link: Link,
    net: Option<Ipv4Net>,
    gateway: Option<Ipv4Addr>,
    mtu: u16,
    flags: IfaceFlags,
    tag: u64,
    engine: Interface,
    pub(crate) sockets: SocketSet<'static>,
    /// Frames the interface sent to its own address, read back by the next poll.
    looped: LoopQueue,
}

pub(crate) fn instant(now: Millis) -> Instant {
    Instant::from_millis(i64::try_from(now).unwrap_or(i64::MAX))
}

impl VirtualInterface {
    /// Builds the wrapper and its engine interface together. Nothing is registered anywhere, so a
    /// failure leaves no trace.
    pub(crate) fn build(
        id: InterfaceId,
        name: String,
        params: &InterfaceParams,
        cfg: &StackConfig,
        now: Millis,
    ) -> Result<Self> {
        let net = match params.address {
            Some(address) => Some(Ipv4Net::from_netmask(
                address,
                params.netmask.unwrap_or(Ipv4Addr::UNSPECIFIED),
            )?),
            None => None,
        };
        if params.mtu.is_some_and(|mtu| mtu < 68) {
            return Err(StackError::InvalidConfig("interface mtu is below the IPv4 minimum"));
        }

        let up = IfaceFlags::UP | IfaceFlags::LINK_UP;
        let ethernet = IfaceFlags::BROADCAST | IfaceFlags::ETHARP | IfaceFlags::ETHERNET;
        let (link, flags, mtu) = match &params.link {
            LinkParams::Loopback => (
                Link::Loopback,
                up,
                params.mtu.unwrap_or(LOOPBACK_MTU),
            ),
            LinkParams::Tunnel => (Link::Tunnel, up, params.mtu.unwrap_or(cfg.default_mtu)),
            LinkParams::Tap { mac } => (
                Link::Tap {
                    mac: *mac,
                    bridge: None,
                },
                up | ethernet,
                params.mtu.unwrap_or(cfg.default_mtu),
            ),
            LinkParams::Bridge { mac, ports } => (
                Link::Bridge {
                    mac: *mac,
                    ports: ports.clone(),
                    fdb: Fdb::new(cfg.fdb_capacity, cfg.fdb_max_age_ms),
                },
                up | ethernet,
                params.mtu.unwrap_or(cfg.default_mtu),
            ),
        };

        let hardware_addr = match &link {
            Link::Tap { mac, .. } | Link::Bridge { mac, .. } => {
                HardwareAddress::Ethernet(mac.to_engine())
            }
            Link::Loopback | Link::Tunnel => HardwareAddress::Ip,
        };
        let mut config = Config::new(hardware_addr);
        config.random_seed = cfg.random_seed ^ u64::from(id.raw());

        let caps = Self::caps_for(&link, mtu);
        // The engine only reads the capabilities here.
        let mut scratch = LoopQueue::new();
        let scratch_pool = BufferPool::new(0);
        let mut device = LinkDevice::new(
            caps,
            None,
            Outbound::new(None, &mut scratch, &scratch_pool, Egress::Local),
        );
        let mut engine = Interface::new(config, &mut device, instant(now));

        if let Some(net) = net {
            engine.update_ip_addrs(|addrs| {
                if addrs.push(net.to_engine()).is_err() {
                    tracing::warn!(iface = %id, "engine address table is full");
                }
            });
        }
        if let Some(gateway) = params.gateway {
            engine
                .routes_mut()
                .add_default_ipv4_route(gateway)
                .map_err(|_| StackError::Engine("route table full"))?;
        }

        Ok(Self {
            id,
            name,
            link,
            net,
            gateway: params.gateway,
            mtu,
            flags,
            tag: params.tag,
            engine,
            sockets: SocketSet::new(vec![]),
            looped: LoopQueue::new(),
        })
    }

    fn caps_for(link: &Link, mtu: u16) -> DeviceCapabilities {
        match link {
            // Nothing crosses a wire, so checksums are neither computed nor verified.
            Link::Loopback => device::capabilities(Medium::Ip, mtu, false),
            Link::Tunnel => device::capabilities(Medium::Ip, mtu, true),
            Link::Tap { .. } | Link::Bridge { .. } => {
                device::capabilities(Medium::Ethernet, mtu, true)
            }
        }
    }

    pub(crate) fn id(&self) -> InterfaceId {
        self.id
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn kind(&self) -> InterfaceKind {
        match self.link {
            Link::Loopback => InterfaceKind::Loopback,
            Link::Tunnel => InterfaceKind::Tunnel,
            Link::Tap { .. } => InterfaceKind::Tap,
            Link::Bridge { .. } => InterfaceKind::Bridge,
        }
    }

    pub(crate) fn mac(&self) -> Option<MacAddr> {
        match &self.link {
            Link::Tap { mac, .. } | Link::Bridge { mac, .. } => Some(*mac),
            _ => None,
        }
    }

    pub(crate) fn net(&self) -> Option<Ipv4Net> {
        self.net
    }

    pub(crate) fn address(&self) -> Option<Ipv4Addr> {
        self.net.map(|net| net.address())
    }

    pub(crate) fn gateway(&self) -> Option<Ipv4Addr> {
        self.gateway
    }

    pub(crate) fn flags(&self) -> IfaceFlags {
        self.flags
    }

    pub(crate) fn set_flag(&mut self, flag: IfaceFlags, on: bool) {
        self.flags.set(flag, on);
    }

    pub(crate) fn is_up(&self) -> bool {
        self.flags.contains(IfaceFlags::UP | IfaceFlags::LINK_UP)
    }

    /// Bridge this Tap is attached to.
    pub(crate) fn bridge(&self) -> Option<InterfaceId> {
        match self.link {
            Link::Tap { bridge, .. } => bridge,
            _ => None,
        }
    }

    pub(crate) fn set_bridge(&mut self, owner: Option<InterfaceId>) {
        if let Link::Tap { bridge, .. } = &mut self.link {
            *bridge = owner;
        }
    }

    /// Interfaces attached to a bridge carry no sockets of their own.
    pub(crate) fn hosts_sockets(&self) -> bool {
        self.bridge().is_none()
    }

    pub(crate) fn ports(&self) -> &[InterfaceId] {
        match &self.link {
            Link::Bridge { ports, .. } => ports,
            _ => &[],
        }
    }

    pub(crate) fn take_ports(&mut self) -> Vec<InterfaceId> {
        match &mut self.link {
            Link::Bridge { ports, .. } => std::mem::take(ports),
            _ => Vec::new(),
        }
    }

    pub(crate) fn fdb(&self) -> Option<&Fdb> {
        match &self.link {
            Link::Bridge { fdb, .. } => Some(fdb),
            _ => None,
        }
    }

    pub(crate) fn fdb_mut(&mut self) -> Option<&mut Fdb> {
        match &mut self.link {
            Link::Bridge { fdb, .. } => Some(fdb),
            _ => None,
        }
    }

    /// Engine interface and socket set, borrowed together.
    pub(crate) fn split(&mut self) -> (&mut Interface, &mut SocketSet<'static>) {
        (&mut self.engine, &mut self.sockets)
    }

    /// Runs the engine once: consumes `inbound` (if any) plus anything looped back, fires due
    /// timers and transmits whatever the sockets have ready.
    ///
    /// `up_ports` is only consulted by bridges, to switch egress frames.
    pub(crate) fn poll(
        &mut self,
        now: Millis,
        inbound: Option<&[u8]>,
        transport: &mut dyn HostTransport,
        pool: &BufferPool,
        up_ports: &[InterfaceId],
    ) {
        let caps = Self::caps_for(&self.link, self.mtu);
        let id = self.id;
        let local = self.net.map(|net| net.address());
        let egress = match &self.link {
            Link::Loopback => Egress::Local,
            Link::Bridge { fdb, .. } => Egress::Bridge {
                fdb,
                ports: up_ports,
                transport,
                now,
            },
            Link::Tunnel | Link::Tap { .. } => Egress::Host { id, transport },
        };
        let outbound = Outbound::new(local, &mut self.looped, pool, egress);
        let mut device = LinkDevice::new(caps, inbound, outbound);
        trace!(iface = %id, inbound = inbound.map(<[u8]>::len), "poll");
        let _ = self.engine.poll(instant(now), &mut device, &mut self.sockets);
    }

    /// Milliseconds until the engine wants to run again, `None` when it has nothing scheduled.
    pub(crate) fn poll_delay(&mut self, now: Millis) -> Option<Millis> {
        self.engine
            .poll_delay(instant(now), &self.sockets)
            .map(|delay| delay.total_millis())
    }

    pub(crate) fn info(&self) -> InterfaceInfo {
        InterfaceInfo {
            id: self.id,
            kind: self.kind(),
            name: self.name.clone(),
            mac: self.mac(),
            address: self.address(),
            netmask: self.net.map(|net| net.netmask()),
            gateway: self.gateway,
            mtu: self.mtu,
            flags: self.flags,
            tag: self.tag,
            bridge: self.bridge(),
            ports: self.ports().to_vec(),
        }
    }
}
