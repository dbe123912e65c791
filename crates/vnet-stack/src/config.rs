use core::net::Ipv4Addr;
use core::ops::RangeInclusive;

use vnet_backend::InterfaceId;

use crate::addr::MacAddr;
use crate::error::{Result, StackError};
use crate::iface::InterfaceKind;

/// Maximum TCP segment size advertised by the engine.
pub const TCP_MSS: usize = 1460;

/// Hard upper bound on the number of ports a single bridge can aggregate.
pub const MAX_BRIDGE_PORTS: usize = 31;

#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Number of packet buffers (both copied and referenced) that may be live at once.
    ///
    /// Frames an interface sends to its own address hold a buffer until the next poll reads them
    /// back. When exhausted, inbound delivery fails with [`StackError::NoMemory`] and UDP sends
    /// fail with [`StackError::AllocationFailed`]; surfacing received data waits for a later tick.
    pub buffer_pool_capacity: usize,

    /// Receive buffer per TCP connection. This is also the largest receive window advertised to
    /// the peer; data surfaced via `on_received` occupies it until acknowledged with
    /// [`crate::NetStack::tcp_mark_received`].
    pub tcp_rx_buffer_len: usize,
    /// Send buffer per TCP connection; bounds what a single `tcp_send` can accept.
    pub tcp_tx_buffer_len: usize,
    /// Listening PCBs kept ready per listener and interface, i.e. how many handshakes can be in
    /// flight at once before further SYNs are ignored.
    pub listen_backlog: usize,
    pub tcp_ack_delay_ms: Option<u64>,
    pub tcp_nagle: bool,
    /// Abort connections whose peer stops responding for this long. A connection that is
    /// still closing when its peer vanishes ends here too.
    pub tcp_timeout_ms: Option<u64>,
    /// Probe idle connections this often so a quiet but live peer does not hit
    /// `tcp_timeout_ms`. Must be shorter than the timeout.
    pub tcp_keep_alive_ms: Option<u64>,

    pub udp_rx_slots: usize,
    pub udp_tx_slots: usize,
    pub udp_rx_buffer_len: usize,
    pub udp_tx_buffer_len: usize,

    /// Local ports handed out to outbound connections and unbound UDP endpoints.
    pub ephemeral_ports: RangeInclusive<u16>,

    /// IP MTU used when an interface does not configure its own.
    pub default_mtu: u16,

    /// Maximum number of learned MAC addresses per bridge. The oldest entry is evicted first.
    pub fdb_capacity: usize,
    /// Learned bridge entries not refreshed for this long are dropped by `expire_timers`.
    pub fdb_max_age_ms: u64,

    /// Seed for initial sequence numbers and similar engine randomness.
    pub random_seed: u64,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            buffer_pool_capacity: 32,
            tcp_rx_buffer_len: 4 * TCP_MSS,
            tcp_tx_buffer_len: 4 * TCP_MSS,
            listen_backlog: 4,
            tcp_ack_delay_ms: Some(10),
            tcp_nagle: true,
            tcp_timeout_ms: Some(120_000),
            tcp_keep_alive_ms: Some(30_000),
            udp_rx_slots: 16,
            udp_tx_slots: 16,
            udp_rx_buffer_len: 16 * 1024,
            udp_tx_buffer_len: 16 * 1024,
            ephemeral_ports: 49152..=65535,
            default_mtu: 1500,
            fdb_capacity: 1024,
            fdb_max_age_ms: 300_000,
            random_seed: 0x5eed_7c91_0bad_cafe,
        }
    }
}

impl StackConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.buffer_pool_capacity == 0 {
            return Err(StackError::InvalidConfig("buffer_pool_capacity must be non-zero"));
        }
        if self.tcp_rx_buffer_len == 0 || self.tcp_tx_buffer_len == 0 {
            return Err(StackError::InvalidConfig("tcp buffers must be non-empty"));
        }
        if self.listen_backlog == 0 {
            return Err(StackError::InvalidConfig("listen_backlog must be non-zero"));
        }
        if let (Some(keep_alive), Some(timeout)) = (self.tcp_keep_alive_ms, self.tcp_timeout_ms) {
            if keep_alive >= timeout {
                return Err(StackError::InvalidConfig("tcp_keep_alive_ms must be below tcp_timeout_ms"));
            }
        }
        if self.udp_rx_slots == 0 || self.udp_tx_slots == 0 {
            return Err(StackError::InvalidConfig("udp slot counts must be non-zero"));
        }
        if self.ephemeral_ports.is_empty() || *self.ephemeral_ports.start() == 0 {
            return Err(StackError::InvalidConfig("ephemeral port range must be non-empty and exclude 0"));
        }
        if self.default_mtu < 68 {
            return Err(StackError::InvalidConfig("default_mtu is below the IPv4 minimum"));
        }
        Ok(())
    }
}

/// Link-layer flavour of an interface being created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkParams {
    Loopback,
    Tunnel,
    Tap {
        mac: MacAddr,
    },
    /// `ports` must be existing Tap interfaces that are not attached to another bridge. They are
    /// attached in order.
    Bridge {
        mac: MacAddr,
        ports: Vec<InterfaceId>,
    },
}

impl LinkParams {
    pub fn kind(&self) -> InterfaceKind {
        match self {
            LinkParams::Loopback => InterfaceKind::Loopback,
            LinkParams::Tunnel => InterfaceKind::Tunnel,
            LinkParams::Tap { .. } => InterfaceKind::Tap,
            LinkParams::Bridge { .. } => InterfaceKind::Bridge,
        }
    }
}

/// Parameters for [`crate::NetStack::create_interface`].
///
/// ```
/// use core::net::Ipv4Addr;
/// use vnet_stack::{InterfaceParams, MacAddr};
///
/// let params = InterfaceParams::tap(MacAddr([0x02, 0, 0, 0, 0, 1]))
///     .with_ipv4(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(255, 255, 255, 0))
///     .with_tag(7);
/// assert_eq!(params.tag, 7);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceParams {
    pub link: LinkParams,
    /// Absence means "no address", not an error.
    pub address: Option<Ipv4Addr>,
    /// Ignored without `address`. An address without a netmask gets the all-zero mask.
    pub netmask: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    /// IP-layer MTU; falls back to [`StackConfig::default_mtu`].
    pub mtu: Option<u16>,
    /// Opaque value for the host's own bookkeeping; reported back in [`crate::InterfaceInfo`].
    pub tag: u64,
}

impl InterfaceParams {
    fn with_link(link: LinkParams) -> Self {
        Self {
            link,
            address: None,
            netmask: None,
            gateway: None,
            mtu: None,
            tag: 0,
        }
    }

    pub fn loopback() -> Self {
        Self::with_link(LinkParams::Loopback)
    }

    pub fn tunnel() -> Self {
        Self::with_link(LinkParams::Tunnel)
    }

    pub fn tap(mac: MacAddr) -> Self {
        Self::with_link(LinkParams::Tap { mac })
    }

    pub fn bridge(mac: MacAddr, ports: impl IntoIterator<Item = InterfaceId>) -> Self {
        Self::with_link(LinkParams::Bridge {
            mac,
            ports: ports.into_iter().collect(),
        })
    }

    pub fn with_ipv4(mut self, address: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        self.address = Some(address);
        self.netmask = Some(netmask);
        self
    }

    pub fn with_address(mut self, address: Ipv4Addr) -> Self {
        self.address = Some(address);
        self
    }

    pub fn with_gateway(mut self, gateway: Ipv4Addr) -> Self {
        self.gateway = Some(gateway);
        self
    }

    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = Some(mtu);
        self
    }

    pub fn with_tag(mut self, tag: u64) -> Self {
        self.tag = tag;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        StackConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_degenerate_limits() {
        let cfg = StackConfig {
            buffer_pool_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(StackError::InvalidConfig(_))));

        let cfg = StackConfig {
            ephemeral_ports: 0..=10,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(StackError::InvalidConfig(_))));

        let cfg = StackConfig {
            tcp_keep_alive_ms: Some(60_000),
            tcp_timeout_ms: Some(60_000),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(StackError::InvalidConfig(_))));
    }
}
