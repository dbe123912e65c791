use core::net::Ipv4Addr;
use std::collections::BTreeMap;

use vnet_backend::{HostTransport, InterfaceId};

use crate::buffer::BufferPool;
use crate::iface::{IfaceFlags, InterfaceKind, VirtualInterface};
use crate::Millis;

/// Every live interface of one stack, keyed (and therefore iterated) in creation order.
#[derive(Default)]
pub(crate) struct Registry {
    ifaces: BTreeMap<InterfaceId, VirtualInterface>,
    next_id: u32,
    next_index: [u32; 4],
}

impl Registry {
    /// Handle and name the next interface of `kind` will get. Nothing is claimed until
    /// [`Registry::insert`], so a failed creation does not burn either.
    pub(crate) fn reserve(&self, kind: InterfaceKind) -> (InterfaceId, String) {
        let name = format!("{}{}", kind.name_prefix(), self.next_index[kind.index()]);
        (InterfaceId::from_raw(self.next_id + 1), name)
    }

    pub(crate) fn insert(&mut self, iface: VirtualInterface) {
        self.next_id = self.next_id.max(iface.id().raw());
        self.next_index[iface.kind().index()] += 1;
        self.ifaces.insert(iface.id(), iface);
    }

    pub(crate) fn remove(&mut self, id: InterfaceId) -> Option<VirtualInterface> {
        self.ifaces.remove(&id)
    }

    pub(crate) fn get(&self, id: InterfaceId) -> Option<&VirtualInterface> {
        self.ifaces.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: InterfaceId) -> Option<&mut VirtualInterface> {
        self.ifaces.get_mut(&id)
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &VirtualInterface> {
        self.ifaces.values()
    }

    pub(crate) fn ids(&self) -> Vec<InterfaceId> {
        self.ifaces.keys().copied().collect()
    }

    /// Interfaces that host sockets and take part in routing.
    fn routable(&self) -> impl Iterator<Item = &VirtualInterface> {
        self.ifaces
            .values()
            .filter(|iface| iface.is_up() && iface.hosts_sockets() && iface.net().is_some())
    }

    /// Longest-prefix match over routable interfaces, then the first one with a gateway.
    pub(crate) fn route(&self, dst: Ipv4Addr) -> Option<InterfaceId> {
        let mut best: Option<(u8, InterfaceId)> = None;
        for iface in self.routable() {
            let Some(net) = iface.net() else { continue };
            if !net.contains(dst) {
                continue;
            }
            if best.map_or(true, |(len, _)| net.prefix_len() > len) {
                best = Some((net.prefix_len(), iface.id()));
            }
        }
        if let Some((_, id)) = best {
            return Some(id);
        }
        self.routable()
            .find(|iface| iface.gateway().is_some())
            .map(|iface| iface.id())
    }

    /// Targets of a limited broadcast: up, broadcast-capable socket hosts in creation order.
    pub(crate) fn broadcast_targets(&self) -> Vec<InterfaceId> {
        self.ifaces
            .values()
            .filter(|iface| {
                iface.is_up() && iface.hosts_sockets() && iface.flags().contains(IfaceFlags::BROADCAST)
            })
            .map(|iface| iface.id())
            .collect()
    }

    /// Ports of `bridge` that are currently up.
    pub(crate) fn up_ports(&self, bridge: InterfaceId) -> Vec<InterfaceId> {
        let Some(bridge) = self.ifaces.get(&bridge) else {
            return Vec::new();
        };
        bridge
            .ports()
            .iter()
            .copied()
            .filter(|port| self.ifaces.get(port).is_some_and(VirtualInterface::is_up))
            .collect()
    }

    /// Polls one interface if it is up. Returns whether the engine ran.
    pub(crate) fn poll(
        &mut self,
        id: InterfaceId,
        now: Millis,
        inbound: Option<&[u8]>,
        transport: &mut dyn HostTransport,
        pool: &BufferPool,
    ) -> bool {
        let up_ports = self.up_ports(id);
        match self.ifaces.get_mut(&id) {
            Some(iface) if iface.is_up() => {
                iface.poll(now, inbound, transport, pool, &up_ports);
                true
            }
            _ => false,
        }
    }
}
