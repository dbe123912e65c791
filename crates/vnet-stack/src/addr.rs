use core::fmt;
use core::net::Ipv4Addr;

use smoltcp::wire::{EthernetAddress, IpAddress, IpCidr, IpEndpoint, Ipv4Cidr};

use crate::error::{Result, StackError};

#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: Self = Self([0xff; 6]);

    /// True for broadcast and every group address (I/G bit set).
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    pub(crate) fn to_engine(self) -> EthernetAddress {
        EthernetAddress(self.0)
    }

    pub(crate) fn from_engine(addr: EthernetAddress) -> Self {
        Self(addr.0)
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(octets: [u8; 6]) -> Self {
        Self(octets)
    }
}

/// An interface address together with its subnet (e.g. `10.0.0.1/24`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ipv4Net {
    address: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Net {
    pub const fn new(address: Ipv4Addr, prefix_len: u8) -> Self {
        Self {
            address,
            prefix_len,
        }
    }

    /// Builds a subnet from an address and a dotted netmask, rejecting non-contiguous masks.
    pub fn from_netmask(address: Ipv4Addr, netmask: Ipv4Addr) -> Result<Self> {
        let mask = u32::from(netmask);
        let prefix_len = mask.leading_ones();
        if mask.checked_shl(prefix_len).unwrap_or(0) != 0 {
            return Err(StackError::InvalidNetmask);
        }
        Ok(Self::new(address, prefix_len as u8))
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.mask())
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = self.mask();
        u32::from(self.address) & mask == u32::from(ip) & mask
    }

    fn mask(&self) -> u32 {
        let prefix_len = self.prefix_len.min(32);
        if prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - prefix_len)
        }
    }

    pub(crate) fn to_engine(self) -> IpCidr {
        IpCidr::Ipv4(Ipv4Cidr::new(self.address, self.prefix_len))
    }
}

impl fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

pub(crate) fn is_limited_broadcast(ip: Ipv4Addr) -> bool {
    ip == Ipv4Addr::BROADCAST
}

pub(crate) fn to_engine_addr(ip: Ipv4Addr) -> IpAddress {
    IpAddress::Ipv4(ip)
}

pub(crate) fn to_engine_endpoint(ip: Ipv4Addr, port: u16) -> IpEndpoint {
    IpEndpoint::new(to_engine_addr(ip), port)
}

pub(crate) fn from_engine_addr(addr: IpAddress) -> Option<Ipv4Addr> {
    match addr {
        IpAddress::Ipv4(v4) => Some(v4),
        #[allow(unreachable_patterns)]
        _ => None,
    }
}
