//! In-process device.
//!
//! Buffers live in host memory, recorded commands execute synchronously when
//! submitted, and fences signal as soon as their submission has run unless
//! `hold_fences` is set. Host callbacks recorded into a command buffer stand
//! in for instrumented shader work: they run at the point in the queue where
//! the draw or dispatch would.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use super::{BufferWrite, DeviceAddress, DeviceBuffer, GpuDevice, HostPtr, LayoutBinding, MemoryBucket};

/// Work executed on the host when the command buffer holding it is submitted.
pub type HostCommand = Arc<dyn Fn(&HostDevice) + Send + Sync>;

#[derive(Clone)]
enum HostOp {
    Fill { buffer: vk::Buffer, offset: u64, size: u64, data: u32 },
    Update { buffer: vk::Buffer, offset: u64, data: Vec<u8> },
    Copy { src: vk::Buffer, dst: vk::Buffer, regions: Vec<vk::BufferCopy> },
    Barrier,
    Callback(HostCommand),
}

/// One queue submission as the host device saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRecord {
    pub queue: vk::Queue,
    pub command_buffers: Vec<vk::CommandBuffer>,
    pub fence: vk::Fence,
}

/// Backing store of one host buffer. 8-byte aligned.
pub struct HostMemory {
    words: Box<[AtomicU64]>,
    size: u64,
}

impl HostMemory {
    fn new(size: u64) -> Self {
        let len = (size as usize).div_ceil(8);
        Self {
            words: (0..len).map(|_| AtomicU64::new(0)).collect(),
            size,
        }
    }

    fn base(&self) -> *mut u8 {
        self.words.as_ptr() as *mut u8
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// The buffer as 32-bit atomics, as shader code addresses it.
    pub fn words(&self) -> &[AtomicU32] {
        // SAFETY: the store is 8-byte aligned, AtomicU32 has the layout of
        // u32 and two of them fit exactly in each AtomicU64.
        unsafe { std::slice::from_raw_parts(self.words.as_ptr() as *const AtomicU32, self.words.len() * 2) }
    }

    pub fn snapshot(&self) -> Vec<u32> {
        let len = (self.size / 4) as usize;
        self.words()[..len].iter().map(|w| w.load(Ordering::Acquire)).collect()
    }

    fn clamp(&self, offset: u64, len: u64) -> Option<(usize, usize)> {
        if offset >= self.size {
            return None;
        }
        let len = if len == vk::WHOLE_SIZE { self.size - offset } else { len.min(self.size - offset) };
        Some((offset as usize, len as usize))
    }

    fn read(&self, offset: u64, len: u64) -> Vec<u8> {
        let Some((offset, len)) = self.clamp(offset, len) else {
            return Vec::new();
        };
        let mut out = vec![0u8; len];
        // SAFETY: bounds clamped above; the store is interior mutable.
        unsafe { std::ptr::copy_nonoverlapping(self.base().add(offset), out.as_mut_ptr(), len) };
        out
    }

    fn write(&self, offset: u64, data: &[u8]) {
        let Some((offset, len)) = self.clamp(offset, data.len() as u64) else {
            return;
        };
        // SAFETY: bounds clamped above; the store is interior mutable.
        unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), self.base().add(offset), len) };
    }

    fn fill(&self, offset: u64, len: u64, data: u32) {
        let Some((offset, len)) = self.clamp(offset, len) else {
            return;
        };
        let words = self.words();
        for word in &words[offset / 4..(offset + len) / 4] {
            word.store(data, Ordering::Relaxed);
        }
    }
}

struct HostDescriptorPool {
    max_sets: u32,
    sets: Vec<vk::DescriptorSet>,
}

/// A device that runs entirely in process memory.
pub struct HostDevice {
    next_handle: AtomicU64,
    next_address: AtomicU64,
    buffers: DashMap<vk::Buffer, Arc<HostMemory>>,
    layouts: DashMap<vk::DescriptorSetLayout, Vec<LayoutBinding>>,
    descriptor_pools: DashMap<vk::DescriptorPool, HostDescriptorPool>,
    descriptor_sets: DashMap<vk::DescriptorSet, HashMap<u32, BufferWrite>>,
    command_pools: DashMap<vk::CommandPool, Vec<vk::CommandBuffer>>,
    command_buffers: DashMap<vk::CommandBuffer, Vec<HostOp>>,
    fences: DashMap<vk::Fence, bool>,
    queue_families: DashMap<vk::Queue, u32>,
    submissions: Mutex<Vec<SubmitRecord>>,
    fail_allocations: AtomicBool,
    device_lost: AtomicBool,
    hold_fences: AtomicBool,
    held_fences: Mutex<Vec<vk::Fence>>,
}

impl HostDevice {
    pub fn new() -> Self {
        Self {
            // Start from 1 so no minted handle is VK_NULL_HANDLE
            next_handle: AtomicU64::new(1),
            next_address: AtomicU64::new(0x1_0000_0000),
            buffers: DashMap::new(),
            layouts: DashMap::new(),
            descriptor_pools: DashMap::new(),
            descriptor_sets: DashMap::new(),
            command_pools: DashMap::new(),
            command_buffers: DashMap::new(),
            fences: DashMap::new(),
            queue_families: DashMap::new(),
            submissions: Mutex::new(Vec::new()),
            fail_allocations: AtomicBool::new(false),
            device_lost: AtomicBool::new(false),
            hold_fences: AtomicBool::new(false),
            held_fences: Mutex::new(Vec::new()),
        }
    }

    fn mint(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn check_lost(&self) -> VkResult<()> {
        if self.device_lost.load(Ordering::Acquire) {
            Err(vk::Result::ERROR_DEVICE_LOST)
        } else {
            Ok(())
        }
    }

    // ── Test controls ───────────────────────────────────────

    /// Create a queue handle belonging to `family`.
    pub fn create_queue(&self, family: u32) -> vk::Queue {
        let queue = vk::Queue::from_raw(self.mint());
        self.queue_families.insert(queue, family);
        queue
    }

    /// Make every following buffer and descriptor-pool allocation fail with
    /// `ERROR_OUT_OF_DEVICE_MEMORY`.
    pub fn fail_allocations(&self, fail: bool) {
        self.fail_allocations.store(fail, Ordering::Release);
    }

    /// Every following fallible call returns `ERROR_DEVICE_LOST`.
    pub fn lose_device(&self) {
        self.device_lost.store(true, Ordering::Release);
    }

    /// While set, fences passed to `queue_submit` stay unsignaled as if the
    /// work were still running. `release_fences` or `device_wait_idle`
    /// signals them.
    pub fn hold_fences(&self, hold: bool) {
        self.hold_fences.store(hold, Ordering::Release);
    }

    /// Signal every fence held back by `hold_fences`.
    pub fn release_fences(&self) {
        for fence in self.held_fences.lock().drain(..) {
            if let Some(mut signaled) = self.fences.get_mut(&fence) {
                *signaled = true;
            }
        }
    }

    /// Append work that runs on the host when `command_buffer` executes.
    pub fn record_host_callback(&self, command_buffer: vk::CommandBuffer, command: HostCommand) {
        self.command_buffers
            .entry(command_buffer)
            .or_default()
            .push(HostOp::Callback(command));
    }

    pub fn buffer_memory(&self, buffer: vk::Buffer) -> Option<Arc<HostMemory>> {
        self.buffers.get(&buffer).map(|m| m.value().clone())
    }

    pub fn read_buffer_words(&self, buffer: vk::Buffer) -> Vec<u32> {
        self.buffer_memory(buffer).map(|m| m.snapshot()).unwrap_or_default()
    }

    pub fn descriptor_write(&self, set: vk::DescriptorSet, binding: u32) -> Option<BufferWrite> {
        self.descriptor_sets.get(&set).and_then(|b| b.get(&binding).copied())
    }

    pub fn submissions(&self) -> Vec<SubmitRecord> {
        self.submissions.lock().clone()
    }

    pub fn clear_submissions(&self) {
        self.submissions.lock().clear();
    }

    pub fn live_buffer_count(&self) -> usize {
        self.buffers.len()
    }

    pub fn descriptor_pool_count(&self) -> usize {
        self.descriptor_pools.len()
    }

    fn execute(&self, command_buffer: vk::CommandBuffer) {
        let ops = match self.command_buffers.get(&command_buffer) {
            Some(ops) => ops.clone(),
            None => return,
        };
        for op in ops {
            match op {
                HostOp::Fill { buffer, offset, size, data } => {
                    if let Some(mem) = self.buffer_memory(buffer) {
                        mem.fill(offset, size, data);
                    }
                }
                HostOp::Update { buffer, offset, data } => {
                    if let Some(mem) = self.buffer_memory(buffer) {
                        mem.write(offset, &data);
                    }
                }
                HostOp::Copy { src, dst, regions } => {
                    let (Some(src), Some(dst)) = (self.buffer_memory(src), self.buffer_memory(dst)) else {
                        continue;
                    };
                    for region in regions {
                        let bytes = src.read(region.src_offset, region.size);
                        dst.write(region.dst_offset, &bytes);
                    }
                }
                HostOp::Barrier => {}
                HostOp::Callback(command) => command(self),
            }
        }
    }
}

impl Default for HostDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl GpuDevice for HostDevice {
    fn create_buffer(&self, size: u64, bucket: MemoryBucket) -> VkResult<DeviceBuffer> {
        self.check_lost()?;
        if self.fail_allocations.load(Ordering::Acquire) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let memory = Arc::new(HostMemory::new(size));
        let buffer = vk::Buffer::from_raw(self.mint());
        let address = self
            .next_address
            .fetch_add(super::align_up(size.max(1), 256), Ordering::Relaxed);
        let mapped = if bucket.is_host_visible() {
            HostPtr::new(memory.base())
        } else {
            None
        };
        self.buffers.insert(buffer, memory);
        debug!(?buffer, size, bucket = bucket.name(), "host buffer created");
        Ok(DeviceBuffer {
            buffer,
            memory: vk::DeviceMemory::from_raw(self.mint()),
            size,
            bucket,
            device_address: DeviceAddress(address),
            mapped,
        })
    }

    fn destroy_buffer(&self, buffer: &DeviceBuffer) {
        self.buffers.remove(&buffer.buffer);
    }

    fn flush(&self, _buffer: &DeviceBuffer, _offset: u64, _size: u64) -> VkResult<()> {
        self.check_lost()
    }

    fn invalidate(&self, _buffer: &DeviceBuffer, _offset: u64, _size: u64) -> VkResult<()> {
        self.check_lost()
    }

    fn create_descriptor_set_layout(&self, bindings: &[LayoutBinding]) -> VkResult<vk::DescriptorSetLayout> {
        self.check_lost()?;
        let layout = vk::DescriptorSetLayout::from_raw(self.mint());
        self.layouts.insert(layout, bindings.to_vec());
        Ok(layout)
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        self.layouts.remove(&layout);
    }

    fn create_descriptor_pool(&self, _bindings: &[LayoutBinding], max_sets: u32) -> VkResult<vk::DescriptorPool> {
        self.check_lost()?;
        if self.fail_allocations.load(Ordering::Acquire) {
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        let pool = vk::DescriptorPool::from_raw(self.mint());
        self.descriptor_pools.insert(
            pool,
            HostDescriptorPool {
                max_sets,
                sets: Vec::new(),
            },
        );
        Ok(pool)
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        if let Some((_, pool)) = self.descriptor_pools.remove(&pool) {
            for set in pool.sets {
                self.descriptor_sets.remove(&set);
            }
        }
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        self.check_lost()?;
        if !self.layouts.contains_key(&layout) {
            return Err(vk::Result::ERROR_UNKNOWN);
        }
        let mut pool = match self.descriptor_pools.get_mut(&pool) {
            Some(p) => p,
            None => return Err(vk::Result::ERROR_UNKNOWN),
        };
        if pool.sets.len() as u32 >= pool.max_sets {
            return Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY);
        }
        let set = vk::DescriptorSet::from_raw(self.mint());
        pool.sets.push(set);
        self.descriptor_sets.insert(set, HashMap::new());
        Ok(set)
    }

    fn write_buffer_descriptors(&self, set: vk::DescriptorSet, writes: &[BufferWrite]) {
        if let Some(mut bindings) = self.descriptor_sets.get_mut(&set) {
            for write in writes {
                bindings.insert(write.binding, *write);
            }
        }
    }

    fn queue_family_index(&self, queue: vk::Queue) -> u32 {
        self.queue_families.get(&queue).map(|f| *f).unwrap_or(0)
    }

    fn create_command_pool(&self, _queue_family_index: u32) -> VkResult<vk::CommandPool> {
        self.check_lost()?;
        let pool = vk::CommandPool::from_raw(self.mint());
        self.command_pools.insert(pool, Vec::new());
        Ok(pool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        if let Some((_, buffers)) = self.command_pools.remove(&pool) {
            for cb in buffers {
                self.command_buffers.remove(&cb);
            }
        }
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        self.check_lost()?;
        let cb = vk::CommandBuffer::from_raw(self.mint());
        match self.command_pools.get_mut(&pool) {
            Some(mut buffers) => buffers.push(cb),
            None => return Err(vk::Result::ERROR_UNKNOWN),
        }
        self.command_buffers.insert(cb, Vec::new());
        Ok(cb)
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.check_lost()?;
        self.command_buffers.insert(command_buffer, Vec::new());
        Ok(())
    }

    fn end_command_buffer(&self, _command_buffer: vk::CommandBuffer) -> VkResult<()> {
        self.check_lost()
    }

    fn cmd_fill_buffer(&self, command_buffer: vk::CommandBuffer, buffer: vk::Buffer, offset: u64, size: u64, data: u32) {
        self.command_buffers
            .entry(command_buffer)
            .or_default()
            .push(HostOp::Fill { buffer, offset, size, data });
    }

    fn cmd_update_buffer(&self, command_buffer: vk::CommandBuffer, buffer: vk::Buffer, offset: u64, data: &[u8]) {
        self.command_buffers
            .entry(command_buffer)
            .or_default()
            .push(HostOp::Update {
                buffer,
                offset,
                data: data.to_vec(),
            });
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        self.command_buffers
            .entry(command_buffer)
            .or_default()
            .push(HostOp::Copy {
                src,
                dst,
                regions: regions.to_vec(),
            });
    }

    fn cmd_shader_barrier(&self, command_buffer: vk::CommandBuffer) {
        self.command_buffers
            .entry(command_buffer)
            .or_default()
            .push(HostOp::Barrier);
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        self.check_lost()?;
        let fence = vk::Fence::from_raw(self.mint());
        self.fences.insert(fence, signaled);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        self.fences.remove(&fence);
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        self.check_lost()?;
        if let Some(mut signaled) = self.fences.get_mut(&fence) {
            *signaled = false;
        }
        Ok(())
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> VkResult<()> {
        if self.fence_status(fence)? {
            Ok(())
        } else {
            // Nothing runs asynchronously, so an unsignaled fence never signals.
            Err(vk::Result::TIMEOUT)
        }
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        self.check_lost()?;
        Ok(self.fences.get(&fence).map(|s| *s).unwrap_or(false))
    }

    fn queue_submit(&self, queue: vk::Queue, command_buffers: &[vk::CommandBuffer], fence: vk::Fence) -> VkResult<()> {
        self.check_lost()?;
        for &cb in command_buffers {
            self.execute(cb);
        }
        if fence != vk::Fence::null() {
            if self.hold_fences.load(Ordering::Acquire) {
                self.fences.insert(fence, false);
                self.held_fences.lock().push(fence);
            } else {
                self.fences.insert(fence, true);
            }
        }
        self.submissions.lock().push(SubmitRecord {
            queue,
            command_buffers: command_buffers.to_vec(),
            fence,
        });
        Ok(())
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        self.check_lost()?;
        self.release_fences();
        Ok(())
    }
}
