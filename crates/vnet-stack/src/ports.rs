use core::net::Ipv4Addr;
use core::ops::RangeInclusive;
use std::collections::BTreeSet;

use crate::error::{Result, StackError};

/// Local port bindings of one transport protocol.
///
/// Two bindings conflict when they share a port and either one is the wildcard address or both
/// name the same address.
#[derive(Debug)]
pub(crate) struct PortTable {
    bound: BTreeSet<(u16, Ipv4Addr)>,
    ephemeral: RangeInclusive<u16>,
    next: u16,
}

impl PortTable {
    pub(crate) fn new(ephemeral: RangeInclusive<u16>) -> Self {
        let next = *ephemeral.start();
        Self {
            bound: BTreeSet::new(),
            ephemeral,
            next,
        }
    }

    fn conflicts(&self, addr: Ipv4Addr, port: u16) -> bool {
        self.bound
            .range((port, Ipv4Addr::UNSPECIFIED)..=(port, Ipv4Addr::BROADCAST))
            .any(|(_, bound)| {
                addr.is_unspecified() || bound.is_unspecified() || *bound == addr
            })
    }

    /// Claims `port` on `addr`; port 0 picks a free ephemeral port. Returns the claimed port.
    pub(crate) fn bind(&mut self, addr: Ipv4Addr, port: u16) -> Result<u16> {
        let port = if port == 0 {
            self.pick_ephemeral(addr)?
        } else {
            if self.conflicts(addr, port) {
                return Err(StackError::BindConflict { addr, port });
            }
            port
        };
        self.bound.insert((port, addr));
        Ok(port)
    }

    fn pick_ephemeral(&mut self, addr: Ipv4Addr) -> Result<u16> {
        let (start, end) = (*self.ephemeral.start(), *self.ephemeral.end());
        let span = u32::from(end - start) + 1;
        let mut candidate = self.next;
        for _ in 0..span {
            let next = if candidate >= end { start } else { candidate + 1 };
            if !self.conflicts(addr, candidate) {
                self.next = next;
                return Ok(candidate);
            }
            candidate = next;
        }
        Err(StackError::AllocationFailed)
    }

    pub(crate) fn release(&mut self, addr: Ipv4Addr, port: u16) {
        self.bound.remove(&(port, addr));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    #[test]
    fn wildcard_conflicts_with_everything_on_the_port() {
        let mut table = PortTable::new(49152..=65535);
        table.bind(A, 80).unwrap();
        table.bind(B, 80).unwrap();
        assert_eq!(
            table.bind(Ipv4Addr::UNSPECIFIED, 80),
            Err(StackError::BindConflict {
                addr: Ipv4Addr::UNSPECIFIED,
                port: 80
            })
        );
        assert!(table.bind(A, 80).is_err());
        table.bind(Ipv4Addr::UNSPECIFIED, 81).unwrap();
        assert!(table.bind(B, 81).is_err());

        table.release(A, 80);
        table.release(B, 80);
        table.bind(Ipv4Addr::UNSPECIFIED, 80).unwrap();
    }

    #[test]
    fn ephemeral_ports_rotate_and_exhaust() {
        let mut table = PortTable::new(5000..=5001);
        assert_eq!(table.bind(A, 0), Ok(5000));
        assert_eq!(table.bind(A, 0), Ok(5001));
        assert_eq!(table.bind(A, 0), Err(StackError::AllocationFailed));

        table.release(A, 5000);
        assert_eq!(table.bind(A, 0), Ok(5000));
    }
}
