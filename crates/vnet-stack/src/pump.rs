//! Glue for hosts that wire interfaces together instead of attaching them to real links.
//!
//! A [`FrameQueue`] records what a stack transmits; the pump replays the frames of one interface
//! into another interface (usually of another stack) with a bounded budget per tick, which keeps
//! every step deterministic.

use tracing::warn;
use vnet_backend::{FrameQueue, InterfaceId};

use crate::NetStack;

/// Default frame budget per [`FramePump::tick`] call.
pub const DEFAULT_MAX_FRAMES_PER_TICK: usize = 256;

/// Outcome of one pump tick.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PumpCounts {
    /// Frames accepted by [`NetStack::deliver_inbound`].
    pub delivered: usize,
    /// Frames the receiving stack refused (interface down, out of buffers, ...). They are dropped,
    /// like frames lost on a wire.
    pub rejected: usize,
}

/// Configuration-only pump, for hosts that own the queues and stacks themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePump {
    pub max_frames_per_tick: usize,
}

impl Default for FramePump {
    fn default() -> Self {
        Self {
            max_frames_per_tick: DEFAULT_MAX_FRAMES_PER_TICK,
        }
    }
}

impl FramePump {
    pub fn new(max_frames_per_tick: usize) -> Self {
        Self {
            max_frames_per_tick,
        }
    }

    pub fn tick(
        &mut self,
        queue: &mut FrameQueue,
        from: InterfaceId,
        stack: &mut NetStack,
        to: InterfaceId,
    ) -> PumpCounts {
        pump_frames(queue, from, stack, to, self.max_frames_per_tick)
    }
}

/// Moves up to `max_frames` frames recorded for `from` into `stack` as inbound traffic on `to`,
/// oldest first. Frames recorded for other interfaces stay queued.
pub fn pump_frames(
    queue: &mut FrameQueue,
    from: InterfaceId,
    stack: &mut NetStack,
    to: InterfaceId,
    max_frames: usize,
) -> PumpCounts {
    let mut counts = PumpCounts::default();
    for _ in 0..max_frames {
        let Some(frame) = queue.pop_for(from) else {
            break;
        };
        match stack.deliver_inbound(to, &frame) {
            Ok(()) => counts.delivered += 1,
            Err(err) => {
                warn!(%from, %to, %err, "pumped frame rejected");
                counts.rejected += 1;
            }
        }
    }
    counts
}
