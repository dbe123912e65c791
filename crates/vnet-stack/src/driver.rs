//! Host-driven ticks. The engine has no thread of its own; these are its only chance to run
//! outside of inbound deliveries.

use tracing::trace;

use crate::{Millis, NetStack};

impl NetStack {
    /// Lets every interface process what it sent to its own address (everything, for loopback
    /// interfaces), then delivers the resulting notifications. Runs at the current stack time.
    pub fn drain_self_queued(&mut self) {
        for id in self.registry.ids() {
            self.flush(id);
        }
        self.dispatch();
    }

    /// Advances the clock to the wall time elapsed since the stack was created and runs timers.
    pub fn expire_timers(&mut self) {
        let elapsed = self.started.elapsed().as_millis();
        self.expire_timers_at(Millis::try_from(elapsed).unwrap_or(Millis::MAX));
    }

    /// Advances the clock to `now_ms` and runs everything that became due: retransmissions,
    /// delayed ACKs, neighbour cache aging, bridge station aging.
    ///
    /// The clock never goes backwards; an earlier `now_ms` runs timers at the current time.
    pub fn expire_timers_at(&mut self, now_ms: Millis) {
        self.now = self.now.max(now_ms);
        let now = self.now;

        for id in self.registry.ids() {
            let Some(fdb) = self.registry.get_mut(id).and_then(|iface| iface.fdb_mut()) else {
                continue;
            };
            let aged = fdb.age(now);
            if aged > 0 {
                trace!(bridge = %id, aged, "bridge stations aged out");
            }
        }
        for id in self.registry.ids() {
            self.flush(id);
        }
        self.dispatch();
    }

    /// Milliseconds until some interface needs [`NetStack::expire_timers`] again. `Some(0)` means
    /// work is already due; `None` means nothing is scheduled.
    pub fn next_poll_delay(&mut self) -> Option<Millis> {
        let now = self.now;
        let mut delay: Option<Millis> = None;
        for id in self.registry.ids() {
            let Some(iface) = self.registry.get_mut(id) else {
                continue;
            };
            if !iface.is_up() {
                continue;
            }
            if let Some(next) = iface.poll_delay(now) {
                delay = Some(delay.map_or(next, |current| current.min(next)));
            }
        }
        delay
    }
}
