//! Learning bridge: forwarding database and per-frame switching decisions.

use std::collections::BTreeMap;

use smoltcp::wire::EthernetFrame;
use vnet_backend::InterfaceId;

use crate::addr::MacAddr;
use crate::Millis;

/// Destination and source MAC of an Ethernet frame. Anything shorter than a header is not a frame.
fn parse_header(frame: &[u8]) -> Option<(MacAddr, MacAddr)> {
    let frame = EthernetFrame::new_checked(frame).ok()?;
    Some((
        MacAddr::from_engine(frame.dst_addr()),
        MacAddr::from_engine(frame.src_addr()),
    ))
}

/// A learned station, as reported by [`crate::NetStack::bridge_fdb`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdbEntry {
    pub mac: MacAddr,
    pub port: InterfaceId,
    pub last_seen_ms: Millis,
}

#[derive(Debug, Clone, Copy)]
struct Station {
    port: InterfaceId,
    last_seen_ms: Millis,
}

/// What to do with a frame that arrived on a bridge port.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct Ingress {
    /// Hand the frame to the bridge's own engine interface.
    pub local: bool,
    /// Retransmit the frame on these ports.
    pub forward: Vec<InterfaceId>,
}

#[derive(Debug)]
pub(crate) struct Fdb {
    stations: BTreeMap<MacAddr, Station>,
    capacity: usize,
    max_age_ms: Millis,
}

impl Fdb {
    pub(crate) fn new(capacity: usize, max_age_ms: Millis) -> Self {
        Self {
            stations: BTreeMap::new(),
            capacity,
            max_age_ms,
        }
    }

    pub(crate) fn entries(&self) -> Vec<FdbEntry> {
        self.stations
            .iter()
            .map(|(mac, station)| FdbEntry {
                mac: *mac,
                port: station.port,
                last_seen_ms: station.last_seen_ms,
            })
            .collect()
    }

    fn learn(&mut self, mac: MacAddr, port: InterfaceId, now: Millis) {
        if mac.is_multicast() || self.capacity == 0 {
            return;
        }
        if !self.stations.contains_key(&mac) && self.stations.len() >= self.capacity {
            let oldest = self
                .stations
                .iter()
                .min_by_key(|(_, station)| station.last_seen_ms)
                .map(|(mac, _)| *mac);
            if let Some(oldest) = oldest {
                self.stations.remove(&oldest);
            }
        }
        self.stations.insert(
            mac,
            Station {
                port,
                last_seen_ms: now,
            },
        );
    }

    fn lookup(&self, mac: MacAddr, now: Millis) -> Option<InterfaceId> {
        let station = self.stations.get(&mac)?;
        if now.saturating_sub(station.last_seen_ms) > self.max_age_ms {
            return None;
        }
        Some(station.port)
    }

    /// Drops stations not seen for longer than the configured age. Returns how many were removed.
    pub(crate) fn age(&mut self, now: Millis) -> usize {
        let before = self.stations.len();
        let max_age_ms = self.max_age_ms;
        self.stations
            .retain(|_, station| now.saturating_sub(station.last_seen_ms) <= max_age_ms);
        before - self.stations.len()
    }

    pub(crate) fn forget_port(&mut self, port: InterfaceId) {
        self.stations.retain(|_, station| station.port != port);
    }

    /// Ports a frame sent by the bridge itself goes out on. `ports` are the ports currently up.
    pub(crate) fn egress_targets(
        &self,
        frame: &[u8],
        ports: &[InterfaceId],
        now: Millis,
    ) -> Vec<InterfaceId> {
        let Some((dst, _)) = parse_header(frame) else {
            return Vec::new();
        };
        if !dst.is_multicast() {
            if let Some(port) = self.lookup(dst, now) {
                if ports.contains(&port) {
                    return vec![port];
                }
            }
        }
        ports.to_vec()
    }

    /// Learns the sender of a frame received on `in_port` and decides where it goes.
    pub(crate) fn ingress(
        &mut self,
        bridge_mac: MacAddr,
        frame: &[u8],
        in_port: InterfaceId,
        ports: &[InterfaceId],
        now: Millis,
    ) -> Ingress {
        let Some((dst, src)) = parse_header(frame) else {
            return Ingress::default();
        };
        self.learn(src, in_port, now);

        if dst == bridge_mac {
            return Ingress {
                local: true,
                forward: Vec::new(),
            };
        }
        let flood = || -> Vec<InterfaceId> {
            ports.iter().copied().filter(|port| *port != in_port).collect()
        };
        if dst.is_multicast() {
            return Ingress {
                local: true,
                forward: flood(),
            };
        }
        match self.lookup(dst, now) {
            // The station lives on the segment the frame came from.
            Some(port) if port == in_port => Ingress::default(),
            Some(port) if ports.contains(&port) => Ingress {
                local: false,
                forward: vec![port],
            },
            Some(_) => Ingress::default(),
            None => Ingress {
                local: false,
                forward: flood(),
            },
        }
    }
}
