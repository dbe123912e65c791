//! Adapter between a virtual interface and the engine's device abstraction.
//!
//! A [`LinkDevice`] only lives for one engine poll. It borrows whatever the interface needs for
//! that poll: at most one inbound frame from the host, the interface's loopback queue, and the
//! egress target for frames the engine assembles.
//!
//! Every interface loops back traffic for its own address, so a stack talking to itself never
//! reaches the host. Looped frames are copies and hold a pool slot until the next poll reads them.

use core::net::Ipv4Addr;
use std::collections::VecDeque;

use smoltcp::phy::{self, ChecksumCapabilities, DeviceCapabilities, Medium};
use smoltcp::time::Instant;
use smoltcp::wire::{
    ArpPacket, ArpRepr, EthernetFrame, EthernetProtocol, Ipv4Packet, ETHERNET_HEADER_LEN,
};
use tracing::{trace, warn};
use vnet_backend::{HostTransport, InterfaceId};

use crate::buffer::{BufferPool, PooledBuf};
use crate::iface::bridge::Fdb;
use crate::Millis;

/// MTU used by loopback interfaces when none is configured.
pub(crate) const LOOPBACK_MTU: u16 = 65535;

/// Frames an interface sent to itself, waiting for the next poll.
pub(crate) type LoopQueue = VecDeque<PooledBuf>;

/// Where frames produced by the engine go when they are not addressed to the interface itself.
pub(crate) enum Egress<'a> {
    /// Straight to the host transport under the interface's own handle.
    Host {
        id: InterfaceId,
        transport: &'a mut dyn HostTransport,
    },
    /// Nowhere: everything loops back (loopback interfaces).
    Local,
    /// Switched to bridge ports according to the forwarding database.
    Bridge {
        fdb: &'a Fdb,
        ports: &'a [InterfaceId],
        transport: &'a mut dyn HostTransport,
        now: Millis,
    },
}

/// Output side of one poll.
pub(crate) struct Outbound<'a> {
    /// Address of the interface; frames for it are looped back.
    local: Option<Ipv4Addr>,
    looped: &'a mut LoopQueue,
    pool: &'a BufferPool,
    egress: Egress<'a>,
}

impl<'a> Outbound<'a> {
    pub(crate) fn new(
        local: Option<Ipv4Addr>,
        looped: &'a mut LoopQueue,
        pool: &'a BufferPool,
        egress: Egress<'a>,
    ) -> Self {
        Self {
            local,
            looped,
            pool,
            egress,
        }
    }

    fn emit(&mut self, medium: Medium, frame: &[u8]) {
        let is_local = matches!(self.egress, Egress::Local)
            || (self.local.is_some() && destination(medium, frame) == self.local);
        if is_local {
            match self.pool.copy_from(frame) {
                Some(buf) => {
                    trace!(len = frame.len(), "loopback enqueue");
                    self.looped.push_back(buf);
                }
                None => warn!(len = frame.len(), "loopback frame dropped, no buffers"),
            }
            return;
        }
        match &mut self.egress {
            Egress::Host { id, transport } => {
                trace!(iface = %id, len = frame.len(), "egress");
                transport.transmit(*id, frame);
            }
            Egress::Local => {}
            Egress::Bridge {
                fdb,
                ports,
                transport,
                now,
            } => {
                for port in fdb.egress_targets(frame, ports, *now) {
                    trace!(port = %port, len = frame.len(), "bridge egress");
                    transport.transmit(port, frame);
                }
            }
        }
    }
}

/// IPv4 destination of an outgoing frame; for ARP, the address being resolved. Resolving the
/// interface's own address is answered by the interface itself once the request loops back.
fn destination(medium: Medium, frame: &[u8]) -> Option<Ipv4Addr> {
    match medium {
        Medium::Ip => Some(Ipv4Packet::new_checked(frame).ok()?.dst_addr()),
        Medium::Ethernet => {
            let frame = EthernetFrame::new_checked(frame).ok()?;
            match frame.ethertype() {
                EthernetProtocol::Ipv4 => {
                    Some(Ipv4Packet::new_checked(frame.payload()).ok()?.dst_addr())
                }
                EthernetProtocol::Arp => {
                    let packet = ArpPacket::new_checked(frame.payload()).ok()?;
                    match ArpRepr::parse(&packet).ok()? {
                        ArpRepr::EthernetIpv4 {
                            target_protocol_addr,
                            ..
                        } => Some(target_protocol_addr),
                        _ => None,
                    }
                }
                _ => None,
            }
        }
        #[allow(unreachable_patterns)]
        _ => None,
    }
}

pub(crate) struct LinkDevice<'a> {
    caps: DeviceCapabilities,
    inbound: Option<&'a [u8]>,
    outbound: Outbound<'a>,
}

impl<'a> LinkDevice<'a> {
    pub(crate) fn new(
        caps: DeviceCapabilities,
        inbound: Option<&'a [u8]>,
        outbound: Outbound<'a>,
    ) -> Self {
        Self {
            caps,
            inbound,
            outbound,
        }
    }
}

/// Device capabilities for an interface of the given medium and IP-layer MTU.
pub(crate) fn capabilities(medium: Medium, ip_mtu: u16, verify_checksums: bool) -> DeviceCapabilities {
    let mut caps = DeviceCapabilities::default();
    caps.medium = medium;
    caps.max_transmission_unit = match medium {
        Medium::Ethernet => usize::from(ip_mtu) + ETHERNET_HEADER_LEN,
        _ => usize::from(ip_mtu),
    };
    if !verify_checksums {
        caps.checksum = ChecksumCapabilities::ignored();
    }
    caps
}

enum Inbound<'a> {
    Borrowed(&'a [u8]),
    Looped(PooledBuf),
}

pub(crate) struct LinkRxToken<'a> {
    frame: Inbound<'a>,
}

impl phy::RxToken for LinkRxToken<'_> {
    fn consume<R, F>(self, f: F) -> R
    where
        F: FnOnce(&[u8]) -> R,
    {
        match &self.frame {
            Inbound::Borrowed(bytes) => f(bytes),
            Inbound::Looped(buf) => f(buf),
        }
    }
}

pub(crate) struct LinkTxToken<'b, 'a> {
    medium: Medium,
    outbound: &'b mut Outbound<'a>,
}

impl phy::TxToken for LinkTxToken<'_, '_> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut frame = vec![0u8; len];
        let result = f(&mut frame);
        self.outbound.emit(self.medium, &frame);
        result
    }
}

impl<'a> phy::Device for LinkDevice<'a> {
    type RxToken<'b> = LinkRxToken<'a> where Self: 'b;
    type TxToken<'b> = LinkTxToken<'b, 'a> where Self: 'b;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let frame = match self.inbound.take() {
            Some(bytes) => Inbound::Borrowed(bytes),
            None => Inbound::Looped(self.outbound.looped.pop_front()?),
        };
        Some((
            LinkRxToken { frame },
            LinkTxToken {
                medium: self.caps.medium,
                outbound: &mut self.outbound,
            },
        ))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(LinkTxToken {
            medium: self.caps.medium,
            outbound: &mut self.outbound,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        self.caps.clone()
    }
}
