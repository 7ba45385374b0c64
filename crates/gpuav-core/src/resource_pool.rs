//! Pooled instrumentation memory and descriptor sets.
//!
//! Pools grow on demand and are handed back wholesale: `return_all` rewinds
//! every cursor without touching device memory, `destroy_all` releases it.
//! One pool belongs to one command context (or one queue), so nothing here
//! takes a lock.

use std::collections::HashMap;
use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk;
use bytemuck::Pod;
use tracing::{debug, warn};

use crate::config::BufferConfig;
use crate::device::{
    align_up, BufferWrite, DescriptorLayout, DeviceAddress, DeviceBuffer, GpuDevice, HostPtr, MemoryBucket,
};
use crate::error::AbortSignal;

/// Alignment used when the caller has no stronger requirement. Covers
/// `minStorageBufferOffsetAlignment` and `minUniformBufferOffsetAlignment`
/// on every implementation.
pub const DEFAULT_ALIGNMENT: u64 = 256;

// ── Buffer ranges ───────────────────────────────────────────

/// A sub-allocation of a pooled block. Borrowed, never owned: it stays valid
/// until the owning pool is returned or destroyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRange {
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub size: u64,
    pub device_address: DeviceAddress,
    pub host: Option<HostPtr>,
}

impl BufferRange {
    /// The "allocation failed, skip this check" range.
    pub fn null() -> Self {
        Self {
            buffer: vk::Buffer::null(),
            offset: 0,
            size: 0,
            device_address: DeviceAddress::NULL,
            host: None,
        }
    }

    pub fn is_null(&self) -> bool {
        self.buffer == vk::Buffer::null()
    }

    pub fn descriptor_write(&self, binding: u32, descriptor_type: vk::DescriptorType) -> BufferWrite {
        BufferWrite {
            binding,
            descriptor_type,
            buffer: self.buffer,
            offset: self.offset,
            range: self.size,
        }
    }

    /// Copy `data` into the range at `offset`. Returns false when the range
    /// is not host visible or the write would leave it.
    ///
    /// # Safety
    /// The owning pool must not have been returned or destroyed, and no
    /// device work may be accessing the bytes concurrently.
    pub unsafe fn write_bytes(&self, offset: u64, data: &[u8]) -> bool {
        let Some(host) = self.host else {
            return false;
        };
        if offset + data.len() as u64 > self.size {
            return false;
        }
        // SAFETY: bounds checked above; lifetime per the caller's contract.
        unsafe {
            let dst = host.add(offset as usize);
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst.as_ptr(), data.len());
        }
        true
    }

    /// # Safety
    /// Same contract as [`BufferRange::write_bytes`].
    pub unsafe fn write_pod<T: Pod>(&self, offset: u64, value: &T) -> bool {
        // SAFETY: forwarded.
        unsafe { self.write_bytes(offset, bytemuck::bytes_of(value)) }
    }

    /// # Safety
    /// Same contract as [`BufferRange::write_bytes`]; device writes must have
    /// been made host visible first.
    pub unsafe fn read_bytes(&self, offset: u64, out: &mut [u8]) -> bool {
        let Some(host) = self.host else {
            return false;
        };
        if offset + out.len() as u64 > self.size {
            return false;
        }
        // SAFETY: bounds checked above; lifetime per the caller's contract.
        unsafe {
            let src = host.add(offset as usize);
            std::ptr::copy_nonoverlapping(src.as_ptr(), out.as_mut_ptr(), out.len());
        }
        true
    }
}

// ── Buffer cache ────────────────────────────────────────────

struct PooledBlock {
    buffer: DeviceBuffer,
    /// End of the bump-allocated prefix.
    used: u64,
}

impl PooledBlock {
    fn range(&self, offset: u64, size: u64) -> BufferRange {
        BufferRange {
            buffer: self.buffer.buffer,
            offset,
            size,
            device_address: self.buffer.device_address.offset(offset),
            // SAFETY: offset is inside the mapping.
            host: self.buffer.mapped.map(|p| unsafe { p.add(offset as usize) }),
        }
    }
}

/// Bump allocator over a growing list of blocks of one memory bucket.
pub struct BufferCache {
    bucket: MemoryBucket,
    min_block_size: u64,
    blocks: Vec<PooledBlock>,
    hint: usize,
}

impl BufferCache {
    pub fn new(bucket: MemoryBucket, min_block_size: u64) -> Self {
        Self {
            bucket,
            min_block_size: min_block_size.max(1),
            blocks: Vec::new(),
            hint: 0,
        }
    }

    pub fn bucket(&self) -> MemoryBucket {
        self.bucket
    }

    /// Carve `size` bytes aligned to `alignment` out of the first block,
    /// starting at the rotation hint, with enough slack. Appends a block of
    /// `max(size, min_block_size)` when none has.
    pub fn get_range(&mut self, device: &dyn GpuDevice, size: u64, alignment: u64) -> VkResult<BufferRange> {
        let size = size.max(1);
        let count = self.blocks.len();
        for step in 0..count {
            let i = (self.hint + step) % count;
            let block = &mut self.blocks[i];
            let start = align_up(block.used, alignment);
            if start + size <= block.buffer.size {
                block.used = start + size;
                self.hint = i;
                return Ok(block.range(start, size));
            }
        }

        let block_size = size.max(self.min_block_size);
        let buffer = device.create_buffer(block_size, self.bucket)?;
        debug!(
            bucket = self.bucket.name(),
            block_size,
            blocks = count + 1,
            "buffer cache grew"
        );
        self.blocks.push(PooledBlock { buffer, used: size });
        self.hint = count;
        Ok(self.blocks[count].range(0, size))
    }

    /// Rewind every block. Contents are left as they are.
    pub fn return_all(&mut self) {
        for block in &mut self.blocks {
            block.used = 0;
        }
        self.hint = 0;
    }

    pub fn destroy_all(&mut self, device: &dyn GpuDevice) {
        for block in self.blocks.drain(..) {
            device.destroy_buffer(&block.buffer);
        }
        self.hint = 0;
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Buffer handles of every block, in allocation order.
    pub fn block_buffers(&self) -> Vec<vk::Buffer> {
        self.blocks.iter().map(|b| b.buffer.buffer).collect()
    }

    pub fn used_bytes(&self) -> u64 {
        self.blocks.iter().map(|b| b.used).sum()
    }

    fn block_of(&self, range: &BufferRange) -> Option<&DeviceBuffer> {
        self.blocks
            .iter()
            .map(|b| &b.buffer)
            .find(|b| b.buffer == range.buffer)
    }
}

// ── Descriptor sets ─────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagedDescriptorSet {
    pub pool: vk::DescriptorPool,
    pub set: vk::DescriptorSet,
}

struct LayoutSets {
    layout: DescriptorLayout,
    pools: Vec<vk::DescriptorPool>,
    sets: Vec<ManagedDescriptorSet>,
    in_use: usize,
}

/// Descriptor sets per layout. Sets handed out in an earlier cycle are
/// reused before any new one is allocated.
pub struct DescriptorSetCache {
    sets_per_pool: u32,
    layouts: HashMap<vk::DescriptorSetLayout, LayoutSets>,
}

impl DescriptorSetCache {
    pub fn new(sets_per_pool: u32) -> Self {
        Self {
            sets_per_pool: sets_per_pool.max(1),
            layouts: HashMap::new(),
        }
    }

    pub fn get(&mut self, device: &dyn GpuDevice, layout: &DescriptorLayout) -> VkResult<ManagedDescriptorSet> {
        let entry = self.layouts.entry(layout.handle).or_insert_with(|| LayoutSets {
            layout: layout.clone(),
            pools: Vec::new(),
            sets: Vec::new(),
            in_use: 0,
        });

        if entry.in_use < entry.sets.len() {
            let set = entry.sets[entry.in_use];
            entry.in_use += 1;
            return Ok(set);
        }

        if let Some(&pool) = entry.pools.last() {
            match device.allocate_descriptor_set(pool, entry.layout.handle) {
                Ok(set) => {
                    let managed = ManagedDescriptorSet { pool, set };
                    entry.sets.push(managed);
                    entry.in_use += 1;
                    return Ok(managed);
                }
                Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY) | Err(vk::Result::ERROR_FRAGMENTED_POOL) => {}
                Err(e) => return Err(e),
            }
        }

        let pool = device.create_descriptor_pool(&entry.layout.bindings, self.sets_per_pool)?;
        entry.pools.push(pool);
        debug!(
            layout = ?entry.layout.handle,
            pools = entry.pools.len(),
            sets_per_pool = self.sets_per_pool,
            "descriptor pool added"
        );
        let set = device.allocate_descriptor_set(pool, entry.layout.handle)?;
        let managed = ManagedDescriptorSet { pool, set };
        entry.sets.push(managed);
        entry.in_use += 1;
        Ok(managed)
    }

    pub fn return_all(&mut self) {
        for entry in self.layouts.values_mut() {
            entry.in_use = 0;
        }
    }

    pub fn destroy_all(&mut self, device: &dyn GpuDevice) {
        for (_, entry) in self.layouts.drain() {
            for pool in entry.pools {
                device.destroy_descriptor_pool(pool);
            }
        }
    }

    pub fn pool_count(&self) -> usize {
        self.layouts.values().map(|e| e.pools.len()).sum()
    }

    pub fn set_count(&self) -> usize {
        self.layouts.values().map(|e| e.sets.len()).sum()
    }
}

// ── Resource pool ───────────────────────────────────────────

/// One bucket cache per [`MemoryBucket`] plus a descriptor-set cache.
pub struct ResourcePool {
    device: Arc<dyn GpuDevice>,
    abort: AbortSignal,
    caches: Vec<BufferCache>,
    descriptor_sets: DescriptorSetCache,
}

impl ResourcePool {
    pub fn new(device: Arc<dyn GpuDevice>, config: &BufferConfig, abort: AbortSignal) -> Self {
        Self {
            device,
            abort,
            caches: MemoryBucket::ALL
                .iter()
                .map(|&bucket| BufferCache::new(bucket, config.block_size_for(bucket)))
                .collect(),
            descriptor_sets: DescriptorSetCache::new(config.descriptor_sets_per_pool),
        }
    }

    pub fn get_range(&mut self, bucket: MemoryBucket, size: u64) -> BufferRange {
        self.get_range_aligned(bucket, size, DEFAULT_ALIGNMENT)
    }

    /// A range from `bucket`, or [`BufferRange::null`] when the device could
    /// not provide one. Callers skip their check on null.
    pub fn get_range_aligned(&mut self, bucket: MemoryBucket, size: u64, alignment: u64) -> BufferRange {
        if self.abort.is_aborted() {
            return BufferRange::null();
        }
        match self.caches[bucket.index()].get_range(self.device.as_ref(), size, alignment) {
            Ok(range) => range,
            Err(e) => {
                if !self.abort.check(e, "instrumentation buffer allocation") {
                    warn!(bucket = bucket.name(), size, error = ?e, "instrumentation buffer allocation failed, skipping check");
                }
                BufferRange::null()
            }
        }
    }

    pub fn get_descriptor_set(&mut self, layout: &DescriptorLayout) -> Option<ManagedDescriptorSet> {
        if self.abort.is_aborted() {
            return None;
        }
        match self.descriptor_sets.get(self.device.as_ref(), layout) {
            Ok(set) => Some(set),
            Err(e) => {
                if !self.abort.check(e, "instrumentation descriptor set allocation") {
                    warn!(error = ?e, "descriptor set allocation failed, skipping check");
                }
                None
            }
        }
    }

    /// Make host writes to `range` visible to the device.
    pub fn flush(&self, bucket: MemoryBucket, range: &BufferRange) -> VkResult<()> {
        match self.caches[bucket.index()].block_of(range) {
            Some(block) => self.device.flush(block, range.offset, range.size),
            None => Ok(()),
        }
    }

    /// Make device writes to `range` visible to the host.
    pub fn invalidate(&self, bucket: MemoryBucket, range: &BufferRange) -> VkResult<()> {
        match self.caches[bucket.index()].block_of(range) {
            Some(block) => self.device.invalidate(block, range.offset, range.size),
            None => Ok(()),
        }
    }

    pub fn cache(&self, bucket: MemoryBucket) -> &BufferCache {
        &self.caches[bucket.index()]
    }

    pub fn descriptor_sets(&self) -> &DescriptorSetCache {
        &self.descriptor_sets
    }

    pub fn return_all(&mut self) {
        for cache in &mut self.caches {
            cache.return_all();
        }
        self.descriptor_sets.return_all();
    }

    pub fn destroy_all(&mut self) {
        for cache in &mut self.caches {
            cache.destroy_all(self.device.as_ref());
        }
        self.descriptor_sets.destroy_all(self.device.as_ref());
    }
}
