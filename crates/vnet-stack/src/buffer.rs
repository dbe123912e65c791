//! Packet buffer ownership.
//!
//! Two modes exist, mirroring how bytes cross the host/engine boundary:
//!
//! - [`BorrowedFrame`] (*referenced*): aliases host memory for the duration of one synchronous
//!   call. The lifetime parameter ties it to the caller's slice, so it cannot be stashed past the
//!   call that created it. Dropping it returns the pool slot but never touches the host memory.
//! - [`PooledBuf`] (*copied*): a private copy owned by the stack, used when bytes must survive
//!   the call that produced them (UDP sends, surfacing received data, frames an interface sends
//!   to its own address, which wait for the next poll).
//!
//! Both draw from a bounded [`BufferPool`] and release their slot in `Drop`, so every exit path,
//! including early error returns, releases exactly once.

use std::cell::Cell;
use std::ops::Deref;
use std::rc::Rc;

use tracing::warn;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub in_use: usize,
    /// Highest `in_use` ever observed.
    pub peak: usize,
    pub allocated: u64,
    pub released: u64,
    /// Allocation attempts refused because the pool was exhausted.
    pub failed: u64,
}

#[derive(Debug)]
struct PoolState {
    capacity: usize,
    in_use: Cell<usize>,
    peak: Cell<usize>,
    allocated: Cell<u64>,
    released: Cell<u64>,
    failed: Cell<u64>,
}

impl PoolState {
    fn acquire(self: &Rc<Self>) -> Option<Slot> {
        let in_use = self.in_use.get();
        if in_use >= self.capacity {
            self.failed.set(self.failed.get() + 1);
            warn!(capacity = self.capacity, "packet buffer pool exhausted");
            return None;
        }
        self.in_use.set(in_use + 1);
        self.peak.set(self.peak.get().max(in_use + 1));
        self.allocated.set(self.allocated.get() + 1);
        Some(Slot {
            pool: Rc::clone(self),
        })
    }
}

/// Accounting token for one pool slot.
#[derive(Debug)]
struct Slot {
    pool: Rc<PoolState>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.pool.in_use.set(self.pool.in_use.get() - 1);
        self.pool.released.set(self.pool.released.get() + 1);
    }
}

/// Bounded packet buffer allocator. Cloning yields another handle to the same pool.
#[derive(Debug, Clone)]
pub struct BufferPool {
    state: Rc<PoolState>,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Rc::new(PoolState {
                capacity,
                in_use: Cell::new(0),
                peak: Cell::new(0),
                allocated: Cell::new(0),
                released: Cell::new(0),
                failed: Cell::new(0),
            }),
        }
    }

    /// Wraps host memory without copying it.
    pub fn borrow_frame<'a>(&self, bytes: &'a [u8]) -> Option<BorrowedFrame<'a>> {
        let slot = self.state.acquire()?;
        Some(BorrowedFrame { bytes, _slot: slot })
    }

    /// Copies `bytes` into a buffer owned by the stack.
    pub fn copy_from(&self, bytes: &[u8]) -> Option<PooledBuf> {
        let slot = self.state.acquire()?;
        Some(PooledBuf {
            data: bytes.to_vec(),
            _slot: slot,
        })
    }

    /// Allocates a zeroed buffer of `len` bytes to be filled by the caller.
    pub fn alloc(&self, len: usize) -> Option<PooledBuf> {
        let slot = self.state.acquire()?;
        Some(PooledBuf {
            data: vec![0; len],
            _slot: slot,
        })
    }

    pub fn stats(&self) -> PoolStats {
        let s = &self.state;
        PoolStats {
            capacity: s.capacity,
            in_use: s.in_use.get(),
            peak: s.peak.get(),
            allocated: s.allocated.get(),
            released: s.released.get(),
            failed: s.failed.get(),
        }
    }
}

/// Referenced buffer over host-owned bytes.
#[derive(Debug)]
pub struct BorrowedFrame<'a> {
    bytes: &'a [u8],
    _slot: Slot,
}

impl<'a> BorrowedFrame<'a> {
    pub fn bytes(&self) -> &'a [u8] {
        self.bytes
    }
}

impl Deref for BorrowedFrame<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.bytes
    }
}

/// Copied buffer owned by the stack.
#[derive(Debug)]
pub struct PooledBuf {
    data: Vec<u8>,
    _slot: Slot,
}

impl PooledBuf {
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn truncate(&mut self, len: usize) {
        self.data.truncate(len);
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}
