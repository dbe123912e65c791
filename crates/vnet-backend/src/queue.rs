use std::collections::VecDeque;

use tracing::warn;

use crate::{HostTransport, InterfaceId};

/// Default bound on the number of frames a [`FrameQueue`] keeps before dropping new ones.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameQueueStats {
    /// Frames currently queued.
    pub pending_frames: usize,
    /// Total frames accepted since creation.
    pub queued_frames: u64,
    /// Frames dropped because the queue was full.
    pub dropped_frames: u64,
}

/// Recording [`HostTransport`] that copies every outbound frame into a bounded FIFO.
///
/// This is the usual choice for hosts that cannot act on a frame while the stack is still running
/// (the payload passed to `transmit` is only borrowed). Frames are drained later, either all at once
/// or per interface. When the queue is full new frames are dropped, never the oldest ones.
#[derive(Debug)]
pub struct FrameQueue {
    frames: VecDeque<(InterfaceId, Vec<u8>)>,
    max_pending_frames: usize,
    queued_frames: u64,
    dropped_frames: u64,
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_PENDING_FRAMES)
    }
}

impl FrameQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limit(max_pending_frames: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            max_pending_frames,
            queued_frames: 0,
            dropped_frames: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn pop(&mut self) -> Option<(InterfaceId, Vec<u8>)> {
        self.frames.pop_front()
    }

    /// Pops the oldest frame queued for `iface`, leaving frames of other interfaces in place.
    pub fn pop_for(&mut self, iface: InterfaceId) -> Option<Vec<u8>> {
        let pos = self.frames.iter().position(|(id, _)| *id == iface)?;
        self.frames.remove(pos).map(|(_, frame)| frame)
    }

    pub fn drain(&mut self) -> Vec<(InterfaceId, Vec<u8>)> {
        self.frames.drain(..).collect()
    }

    /// Removes and returns every frame queued for `iface`, in FIFO order.
    pub fn drain_for(&mut self, iface: InterfaceId) -> Vec<Vec<u8>> {
        let mut taken = Vec::new();
        self.frames.retain(|(id, frame)| {
            if *id == iface {
                taken.push(frame.clone());
                false
            } else {
                true
            }
        });
        taken
    }

    pub fn count_for(&self, iface: InterfaceId) -> usize {
        self.frames.iter().filter(|(id, _)| *id == iface).count()
    }

    pub fn stats(&self) -> FrameQueueStats {
        FrameQueueStats {
            pending_frames: self.frames.len(),
            queued_frames: self.queued_frames,
            dropped_frames: self.dropped_frames,
        }
    }
}

impl HostTransport for FrameQueue {
    fn transmit(&mut self, iface: InterfaceId, frame: &[u8]) {
        if self.frames.len() >= self.max_pending_frames {
            self.dropped_frames += 1;
            warn!(%iface, len = frame.len(), "frame queue full; dropping outbound frame");
            return;
        }
        self.queued_frames += 1;
        self.frames.push_back((iface, frame.to_vec()));
    }
}
