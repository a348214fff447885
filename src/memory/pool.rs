//! Device memory pool
//!
//! One contiguous arena reserved from the device at session start and carved
//! up with best-fit free blocks. Every allocation starts on an alignment
//! boundary. Members of a packed group are tracked one by one at their
//! packed offsets, so freeing some of them can leave free blocks off the
//! grid; carving rounds the start up and keeps the head as its own block.
//!
//! # Thread Safety
//!
//! All bookkeeping sits behind one `Mutex`. Share the pool between runtimes
//! with `Arc<MemoryPool>`; allocate and free are serialized across graphs.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::device::{Device, DevicePtr};
use crate::error::{ForgeError, ForgeResult};
use crate::memory::address::DeviceAddress;

/// Free region of the arena, as an offset from the arena base
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeBlock {
    offset: usize,
    size: usize,
}

impl FreeBlock {
    fn new(offset: usize, size: usize) -> Self {
        Self { offset, size }
    }

    fn is_adjacent_to(&self, other: &FreeBlock) -> bool {
        self.offset + self.size == other.offset
    }
}

#[derive(Debug)]
struct PoolState {
    /// Sorted by offset, adjacent blocks always coalesced
    free_blocks: Vec<FreeBlock>,
    alignment: usize,
    /// Live allocations: offset -> reserved bytes
    live: HashMap<usize, usize>,
    in_use: usize,
    peak_in_use: usize,
    allocation_count: u64,
    free_count: u64,
}

impl PoolState {
    fn new(capacity: usize, alignment: usize) -> Self {
        Self {
            free_blocks: vec![FreeBlock::new(0, capacity)],
            alignment,
            live: HashMap::new(),
            in_use: 0,
            peak_in_use: 0,
            allocation_count: 0,
            free_count: 0,
        }
    }

    fn remaining(&self) -> usize {
        self.free_blocks.iter().map(|b| b.size).sum()
    }

    /// Smallest free block that still fits `size` once its start is aligned
    fn find_best_fit(&self, size: usize) -> Option<usize> {
        self.free_blocks
            .iter()
            .enumerate()
            .filter_map(|(idx, block)| {
                let padding = align_up(block.offset, self.alignment) - block.offset;
                let usable = block.size.checked_sub(padding)?;
                (usable >= size).then_some((idx, usable))
            })
            .min_by_key(|&(_, usable)| usable)
            .map(|(idx, _)| idx)
    }

    /// Take `size` bytes (already aligned) out of the free list.
    ///
    /// Freed members of a packed group leave blocks that start off the
    /// alignment grid; the unaligned head stays on the free list.
    fn carve(&mut self, size: usize) -> ForgeResult<usize> {
        let idx = self.find_best_fit(size).ok_or_else(|| ForgeError::OutOfMemory {
            requested: size,
            available: self.remaining(),
        })?;

        let block = self.free_blocks.remove(idx);
        let offset = align_up(block.offset, self.alignment);
        let padding = offset - block.offset;
        let trailing = block.size - padding - size;

        if trailing > 0 {
            self.free_blocks.insert(idx, FreeBlock::new(offset + size, trailing));
        }
        if padding > 0 {
            self.free_blocks.insert(idx, FreeBlock::new(block.offset, padding));
        }

        self.in_use += size;
        self.peak_in_use = self.peak_in_use.max(self.in_use);
        Ok(offset)
    }

    fn give_back(&mut self, offset: usize, size: usize) {
        let pos = self
            .free_blocks
            .partition_point(|block| block.offset < offset);
        self.free_blocks.insert(pos, FreeBlock::new(offset, size));
        self.in_use -= size;
        self.coalesce_free_blocks();
    }

    fn coalesce_free_blocks(&mut self) {
        let mut i = 0;
        while i + 1 < self.free_blocks.len() {
            let current = self.free_blocks[i];
            let next = self.free_blocks[i + 1];

            if current.is_adjacent_to(&next) {
                self.free_blocks[i].size += next.size;
                self.free_blocks.remove(i + 1);
            } else {
                i += 1;
            }
        }
    }
}

/// Device memory pool over a single reserved arena
pub struct MemoryPool {
    device: Arc<dyn Device>,
    base: DevicePtr,
    capacity: usize,
    alignment: usize,
    state: Mutex<PoolState>,
}

impl fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("device", &self.device.name())
            .field("base", &self.base)
            .field("capacity", &self.capacity)
            .field("alignment", &self.alignment)
            .finish()
    }
}

impl MemoryPool {
    /// Default allocation granularity in bytes
    pub const DEFAULT_ALIGNMENT: usize = 512;

    /// Reserve `capacity` bytes from `device` and build a pool over them.
    ///
    /// `capacity` is rounded down to a multiple of `alignment`.
    ///
    /// # Errors
    /// - `InvalidConfiguration` if alignment is not a power of two or the
    ///   rounded capacity is zero
    /// - whatever the device returns from `reserve`
    pub fn reserve(device: Arc<dyn Device>, capacity: usize, alignment: usize) -> ForgeResult<Self> {
        if !alignment.is_power_of_two() {
            return Err(ForgeError::InvalidConfiguration(format!(
                "pool alignment must be a power of 2, got {}",
                alignment
            )));
        }
        let capacity = capacity & !(alignment - 1);
        if capacity == 0 {
            return Err(ForgeError::InvalidConfiguration(
                "pool capacity rounds down to zero".to_string(),
            ));
        }

        let base = device.reserve(capacity)?;
        tracing::info!(
            "MemoryPool reserved {} MB ({} bytes) at {} on {}",
            capacity / 1024 / 1024,
            capacity,
            base,
            device.name()
        );

        Ok(Self {
            device,
            base,
            capacity,
            alignment,
            state: Mutex::new(PoolState::new(capacity, alignment)),
        })
    }

    pub fn base(&self) -> DevicePtr {
        self.base
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Round `size` up to the pool granularity. Zero still costs one unit.
    pub fn aligned_size(&self, size: usize) -> usize {
        align_up(size.max(1), self.alignment)
    }

    /// Allocate `size` bytes.
    ///
    /// # Errors
    /// `OutOfMemory` when no free block can hold the aligned size.
    pub fn allocate(&self, size: usize) -> ForgeResult<DevicePtr> {
        let reserved = self.aligned_size(size);
        let mut state = self.state.lock()?;
        let offset = state.carve(reserved)?;
        state.live.insert(offset, reserved);
        state.allocation_count += 1;

        let ptr = self.base.offset(offset);
        tracing::trace!("pool allocated {} bytes ({} reserved) at {}", size, reserved, ptr);
        Ok(ptr)
    }

    /// Return an allocation to the pool.
    ///
    /// # Errors
    /// `InvalidFree` if `ptr` is not a live allocation (double free, or a
    /// pointer that never came from this pool).
    pub fn free(&self, ptr: DevicePtr) -> ForgeResult<()> {
        if ptr < self.base || ptr.offset_from(self.base) >= self.capacity {
            return Err(ForgeError::InvalidFree(format!(
                "{} is outside the pool arena",
                ptr
            )));
        }
        let offset = ptr.offset_from(self.base);

        let mut state = self.state.lock()?;
        let size = state
            .live
            .remove(&offset)
            .ok_or_else(|| ForgeError::InvalidFree(format!("{} is not a live allocation", ptr)))?;
        state.give_back(offset, size);
        state.free_count += 1;

        tracing::trace!("pool freed {} bytes at {}", size, ptr);
        Ok(())
    }

    /// Allocate one packed region for `sizes` and return a pointer per entry.
    ///
    /// `ptrs[i] == ptrs[i - 1] + sizes[i - 1]`: no padding between members.
    /// Each non-empty member is tracked as its own allocation so members can
    /// later be freed one by one; the alignment tail is charged to the last
    /// non-empty member. Empty members share the next member's address and
    /// are not tracked.
    ///
    /// # Errors
    /// `OutOfMemory` if no single free block can hold the whole group.
    pub fn allocate_contiguous(&self, sizes: &[usize]) -> ForgeResult<Vec<DevicePtr>> {
        let total: usize = sizes.iter().sum();
        let reserved = self.aligned_size(total);

        let mut state = self.state.lock()?;
        let start = state.carve(reserved)?;

        let last_member = sizes.iter().rposition(|&size| size > 0);
        let mut ptrs = Vec::with_capacity(sizes.len());
        let mut offset = start;
        for (i, &size) in sizes.iter().enumerate() {
            ptrs.push(self.base.offset(offset));
            if size > 0 {
                let charged = if Some(i) == last_member {
                    reserved - (offset - start)
                } else {
                    size
                };
                state.live.insert(offset, charged);
                state.allocation_count += 1;
            }
            offset += size;
        }

        if last_member.is_none() {
            // Nothing to track member-wise; keep the unit under the group start.
            state.live.insert(start, reserved);
            state.allocation_count += 1;
        }

        tracing::trace!(
            "pool allocated contiguous group of {} members, {} bytes at {}",
            sizes.len(),
            total,
            self.base.offset(start)
        );
        Ok(ptrs)
    }

    /// Check whether `ptr` is the start of a live allocation
    pub fn is_live(&self, ptr: DevicePtr) -> bool {
        if ptr < self.base {
            return false;
        }
        self.state
            .lock()
            .map(|state| state.live.contains_key(&ptr.offset_from(self.base)))
            .unwrap_or(false)
    }

    /// Number of live allocations
    pub fn live_allocations(&self) -> usize {
        self.state.lock().map(|s| s.live.len()).unwrap_or(0)
    }

    pub fn stats(&self) -> PoolStats {
        match self.state.lock() {
            Ok(state) => PoolStats {
                capacity: self.capacity,
                in_use: state.in_use,
                peak_in_use: state.peak_in_use,
                allocation_count: state.allocation_count,
                free_count: state.free_count,
                fragment_count: state.free_blocks.len(),
                largest_free_block: state.free_blocks.iter().map(|b| b.size).max().unwrap_or(0),
            },
            Err(e) => {
                tracing::error!("MemoryPool state poisoned: {}", e);
                PoolStats {
                    capacity: self.capacity,
                    ..PoolStats::default()
                }
            }
        }
    }
}

/// Address binding on top of the raw pool.
///
/// Zero-sized addresses never touch the pool: they are bound to the arena
/// base with size 0 and unbinding them is free.
impl MemoryPool {
    /// Allocate `size` bytes and bind them to `address`
    pub fn malloc_address(&self, address: &mut DeviceAddress, size: usize) -> ForgeResult<()> {
        let ptr = if size == 0 { self.base } else { self.allocate(size)? };
        address.bind(ptr, size);
        Ok(())
    }

    /// Free the memory bound to `address` and leave it unallocated.
    ///
    /// Freeing an already unallocated address is a no-op.
    pub fn free_address(&self, address: &mut DeviceAddress) -> ForgeResult<()> {
        match address.unbind() {
            Some(binding) if binding.size > 0 => self.free(binding.ptr),
            _ => Ok(()),
        }
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        let live = self.live_allocations();
        if live > 0 {
            tracing::debug!("MemoryPool dropped with {} live allocations", live);
        }
        self.device.release(self.base, self.capacity);
        tracing::info!("MemoryPool released {} bytes at {}", self.capacity, self.base);
    }
}

/// Round `value` up to `alignment` (a power of two)
pub fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Pool usage snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub capacity: usize,
    /// Bytes currently handed out (including alignment padding)
    pub in_use: usize,
    pub peak_in_use: usize,
    pub allocation_count: u64,
    pub free_count: u64,
    /// Number of free regions; 1 means no fragmentation
    pub fragment_count: usize,
    pub largest_free_block: usize,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PoolStats: in_use={}KB, peak={}KB of {}KB, allocs={}, frees={}, fragments={}",
            self.in_use / 1024,
            self.peak_in_use / 1024,
            self.capacity / 1024,
            self.allocation_count,
            self.free_count,
            self.fragment_count
        )
    }
}
