//! Fixed-Block Memory Pool
//!
//! A pool of pre-allocated, equally sized byte blocks that can be checked
//! out and returned without touching the global allocator.  Blocks are
//! created once in [`MemoryPool::new`] and freed only when the pool itself is
//! dropped; they are never resized.
//!
//! # Performance-First Design:
//! - Free-count reservation first, so exhaustion is reported in O(1)
//! - Slot scan starts at a rotating hint, keeping the common case O(1)
//! - Per-block state and generation share one atomic word; no lock is taken
//!   on allocate/release
//! - Released blocks are zeroed so data never leaks between users
//!
//! # Ownership
//!
//! [`MemoryPool::allocate`] returns a [`PoolBlock`] guard that derefs to the
//! block's bytes and hands the block back when dropped.  The guard can be
//! turned into a plain [`BlockId`] token ([`PoolBlock::into_raw`]) and
//! returned later through [`MemoryPool::deallocate_raw`], which detects
//! double frees and foreign tokens instead of corrupting pool state.

use serde::Serialize;
use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{NexusError, Result};

const FREE: u8 = 0;
const IN_USE: u8 = 1;
const RELEASING: u8 = 2;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Slot word layout: generation in the upper 32 bits, state in the low byte.
#[inline]
fn pack(generation: u32, state: u8) -> u64 {
    (u64::from(generation) << 32) | u64::from(state)
}

#[inline]
fn generation_of(word: u64) -> u32 {
    (word >> 32) as u32
}

#[inline]
fn state_of(word: u64) -> u8 {
    word as u8
}

struct Block {
    data: UnsafeCell<Box<[u8]>>,
    /// State and generation, changed together in one CAS. The generation is
    /// bumped on every allocation so stale tokens are recognized.
    slot: AtomicU64,
}

/// Utilization counters for a [`MemoryPool`].
///
/// `total_allocations - total_deallocations == allocated_blocks` whenever no
/// allocate/release is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total_blocks: usize,
    pub allocated_blocks: usize,
    pub free_blocks: usize,
    pub total_allocations: u64,
    pub total_deallocations: u64,
}

/// Copyable identity of a checked-out block, detached from its guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId {
    pool_id: u64,
    index: usize,
    generation: u32,
}

impl BlockId {
    /// Slot index inside the owning pool.
    pub fn index(&self) -> usize {
        self.index
    }
}

/// A pool of fixed-size byte blocks.
pub struct MemoryPool {
    id: u64,
    block_size: usize,
    blocks: Box<[Block]>,
    free_count: AtomicUsize,
    next_hint: AtomicUsize,
    total_allocations: AtomicU64,
    total_deallocations: AtomicU64,
}

// SAFETY: a block's bytes are only reachable through the unique PoolBlock
// that won the FREE -> IN_USE transition, or by the releasing thread that
// won IN_USE -> RELEASING for that same generation.
unsafe impl Sync for MemoryPool {}
unsafe impl Send for MemoryPool {}

impl MemoryPool {
    /// Create a pool of `num_blocks` blocks, each `block_size` bytes.
    pub fn new(block_size: usize, num_blocks: usize) -> Result<Arc<Self>> {
        if block_size == 0 || num_blocks == 0 {
            return Err(NexusError::InvalidConfig(format!(
                "memory pool needs non-zero block size and count, got {block_size}x{num_blocks}"
            )));
        }
        info!(block_size, num_blocks, "Creating MemoryPool");
        let blocks = (0..num_blocks)
            .map(|_| Block {
                data: UnsafeCell::new(vec![0u8; block_size].into_boxed_slice()),
                slot: AtomicU64::new(pack(0, FREE)),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Ok(Arc::new(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            block_size,
            blocks,
            free_count: AtomicUsize::new(num_blocks),
            next_hint: AtomicUsize::new(0),
            total_allocations: AtomicU64::new(0),
            total_deallocations: AtomicU64::new(0),
        }))
    }

    /// Check out a free block, or `None` when every block is in use.
    ///
    /// Never blocks and never grows the pool.
    pub fn allocate(self: &Arc<Self>) -> Option<PoolBlock> {
        // Reserve first: a successful decrement guarantees a FREE slot exists
        // that no other reserver will take.
        self.free_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |free| free.checked_sub(1))
            .ok()?;

        let len = self.blocks.len();
        let mut idx = self.next_hint.load(Ordering::Relaxed) % len;
        loop {
            let block = &self.blocks[idx];
            let word = block.slot.load(Ordering::Relaxed);
            let generation = generation_of(word).wrapping_add(1);
            if state_of(word) == FREE
                && block
                    .slot
                    .compare_exchange(
                        word,
                        pack(generation, IN_USE),
                        Ordering::Acquire,
                        Ordering::Relaxed,
                    )
                    .is_ok()
            {
                self.total_allocations.fetch_add(1, Ordering::Release);
                self.next_hint.store((idx + 1) % len, Ordering::Relaxed);
                debug!(pool = self.id, index = idx, "Block allocated");
                return Some(PoolBlock {
                    pool: self.clone(),
                    index: idx,
                    generation,
                    live: true,
                });
            }
            idx = (idx + 1) % len;
        }
    }

    /// Like [`allocate`](Self::allocate) but reports exhaustion as an error.
    pub fn try_allocate(self: &Arc<Self>) -> Result<PoolBlock> {
        self.allocate().ok_or(NexusError::PoolExhausted {
            blocks: self.blocks.len(),
        })
    }

    /// Return a block to this pool.
    ///
    /// A block that belongs to another pool is rejected with
    /// [`NexusError::ForeignBlock`]; it is then returned to its own pool when
    /// the guard drops, so neither pool is corrupted.
    pub fn deallocate(&self, mut block: PoolBlock) -> Result<()> {
        if !std::ptr::eq(Arc::as_ptr(&block.pool), self) {
            warn!(pool = self.id, index = block.index, "Rejected foreign block");
            return Err(NexusError::ForeignBlock { index: block.index });
        }
        block.live = false;
        self.release(block.index, block.generation)
    }

    /// Return a block previously detached with [`PoolBlock::into_raw`].
    pub fn deallocate_raw(&self, id: BlockId) -> Result<()> {
        if id.pool_id != self.id || id.index >= self.blocks.len() {
            warn!(pool = self.id, index = id.index, "Rejected foreign block token");
            return Err(NexusError::ForeignBlock { index: id.index });
        }
        self.release(id.index, id.generation)
    }

    fn release(&self, index: usize, generation: u32) -> Result<()> {
        let block = &self.blocks[index];
        if let Err(current) = block.slot.compare_exchange(
            pack(generation, IN_USE),
            pack(generation, RELEASING),
            Ordering::Acquire,
            Ordering::Relaxed,
        ) {
            // The generation only changes on allocate, so a mismatch means the
            // token outlived its allocation.
            if generation_of(current) != generation {
                warn!(pool = self.id, index, "Stale block token released");
            } else {
                warn!(pool = self.id, index, "Double free detected");
            }
            return Err(NexusError::DoubleFree { index });
        }

        // SAFETY: winning IN_USE -> RELEASING for this generation grants
        // exclusive access.
        unsafe { (*block.data.get()).fill(0) };
        block.slot.store(pack(generation, FREE), Ordering::Release);
        self.free_count.fetch_add(1, Ordering::Release);
        self.total_deallocations.fetch_add(1, Ordering::Release);
        debug!(pool = self.id, index, "Block released");
        Ok(())
    }

    /// Snapshot of utilization counters.
    pub fn stats(&self) -> PoolStats {
        let total_blocks = self.blocks.len();
        let free_blocks = self.free_count.load(Ordering::Acquire);
        PoolStats {
            total_blocks,
            allocated_blocks: total_blocks - free_blocks,
            free_blocks,
            total_allocations: self.total_allocations.load(Ordering::Acquire),
            total_deallocations: self.total_deallocations.load(Ordering::Acquire),
        }
    }

    pub fn has_free_blocks(&self) -> bool {
        self.free_count.load(Ordering::Acquire) > 0
    }

    /// Percentage of blocks currently checked out.
    pub fn utilization_percent(&self) -> f64 {
        let free = self.free_count.load(Ordering::Acquire) as f64;
        (1.0 - free / self.blocks.len() as f64) * 100.0
    }

    /// Bytes currently checked out.
    pub fn allocated_bytes(&self) -> u64 {
        (self.stats().allocated_blocks * self.block_size) as u64
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn max_blocks(&self) -> usize {
        self.blocks.len()
    }
}

/// Exclusive access to one block of a [`MemoryPool`].
///
/// Derefs to the block's bytes; returns the block to the pool on drop.
pub struct PoolBlock {
    pool: Arc<MemoryPool>,
    index: usize,
    generation: u32,
    live: bool,
}

impl PoolBlock {
    /// Slot index inside the owning pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Detach from the guard; the block stays checked out until
    /// [`MemoryPool::deallocate_raw`] is called with the returned token.
    pub fn into_raw(mut self) -> BlockId {
        self.live = false;
        BlockId {
            pool_id: self.pool.id,
            index: self.index,
            generation: self.generation,
        }
    }
}

impl Deref for PoolBlock {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: this guard won FREE -> IN_USE and is the only accessor.
        unsafe { &*self.pool.blocks[self.index].data.get() }
    }
}

impl DerefMut for PoolBlock {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` rules out aliasing through the guard.
        unsafe { &mut *self.pool.blocks[self.index].data.get() }
    }
}

impl Drop for PoolBlock {
    fn drop(&mut self) {
        if self.live {
            if let Err(err) = self.pool.release(self.index, self.generation) {
                warn!(error = %err, "Failed to return block on drop");
            }
        }
    }
}
