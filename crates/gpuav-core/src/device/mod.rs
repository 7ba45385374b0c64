//! Device abstraction.
//!
//! Everything the runtime does to the device goes through [`GpuDevice`]. The
//! `ash` backend drives a real Vulkan device; the host backend executes
//! recorded commands in process memory so the whole submission protocol can
//! run without a GPU.

pub mod host;
pub mod vulkan;

use std::ptr::NonNull;
use std::sync::atomic::AtomicU32;

use ash::prelude::VkResult;
use ash::vk;

pub use host::{HostCommand, HostDevice, SubmitRecord};
pub use vulkan::VulkanDevice;

// ── Memory buckets ──────────────────────────────────────────

/// Access pattern of a pooled allocation. Each bucket gets its own cache so
/// the most restrictive memory flags never leak into the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MemoryBucket {
    /// Host writes every recording, shaders read.
    HostCoherent,
    /// Shaders write, host reads back after an invalidate.
    HostCached,
    DeviceLocal,
    /// Device local and usable as an indirect argument source.
    DeviceLocalIndirect,
    /// Transfer source for uploads.
    Staging,
}

impl MemoryBucket {
    pub const ALL: [MemoryBucket; 5] = [
        MemoryBucket::HostCoherent,
        MemoryBucket::HostCached,
        MemoryBucket::DeviceLocal,
        MemoryBucket::DeviceLocalIndirect,
        MemoryBucket::Staging,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            MemoryBucket::HostCoherent => "host_coherent",
            MemoryBucket::HostCached => "host_cached",
            MemoryBucket::DeviceLocal => "device_local",
            MemoryBucket::DeviceLocalIndirect => "device_local_indirect",
            MemoryBucket::Staging => "staging",
        }
    }

    pub fn is_host_visible(self) -> bool {
        !matches!(self, MemoryBucket::DeviceLocal | MemoryBucket::DeviceLocalIndirect)
    }

    /// Host writes need a flush and device writes an invalidate.
    pub fn is_non_coherent(self) -> bool {
        self == MemoryBucket::HostCached
    }

    pub fn usage(self) -> vk::BufferUsageFlags {
        let common = vk::BufferUsageFlags::STORAGE_BUFFER
            | vk::BufferUsageFlags::UNIFORM_BUFFER
            | vk::BufferUsageFlags::TRANSFER_DST
            | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        match self {
            MemoryBucket::DeviceLocalIndirect => common | vk::BufferUsageFlags::INDIRECT_BUFFER,
            MemoryBucket::Staging => vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
            _ => common | vk::BufferUsageFlags::TRANSFER_SRC,
        }
    }

    pub fn required_memory_flags(self) -> vk::MemoryPropertyFlags {
        match self {
            MemoryBucket::HostCoherent | MemoryBucket::Staging => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
            MemoryBucket::HostCached => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_CACHED
            }
            MemoryBucket::DeviceLocal | MemoryBucket::DeviceLocalIndirect => {
                vk::MemoryPropertyFlags::DEVICE_LOCAL
            }
        }
    }
}

// ── Addresses and mapped pointers ───────────────────────────

/// An address in the device's address space. Never dereferenced on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DeviceAddress(pub u64);

impl DeviceAddress {
    pub const NULL: DeviceAddress = DeviceAddress(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn offset(self, bytes: u64) -> DeviceAddress {
        if self.is_null() {
            self
        } else {
            DeviceAddress(self.0 + bytes)
        }
    }
}

/// Host pointer into a persistently mapped allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostPtr(NonNull<u8>);

// SAFETY: the pointer targets device-mapped memory that lives as long as the
// owning allocation; all access goes through unsafe accessors whose callers
// uphold that lifetime.
unsafe impl Send for HostPtr {}
unsafe impl Sync for HostPtr {}

impl HostPtr {
    pub fn new(ptr: *mut u8) -> Option<Self> {
        NonNull::new(ptr).map(HostPtr)
    }

    pub fn as_ptr(self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// # Safety
    /// `bytes` must stay inside the mapped allocation.
    pub unsafe fn add(self, bytes: usize) -> HostPtr {
        // SAFETY: forwarded to the caller.
        HostPtr(unsafe { NonNull::new_unchecked(self.0.as_ptr().add(bytes)) })
    }
}

// ── Buffers ─────────────────────────────────────────────────

/// A buffer with its own memory allocation, persistently mapped when the
/// bucket is host visible.
#[derive(Debug, Clone)]
pub struct DeviceBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: u64,
    pub bucket: MemoryBucket,
    pub device_address: DeviceAddress,
    pub mapped: Option<HostPtr>,
}

impl DeviceBuffer {
    /// View the mapping as 32-bit atomics, the same granularity shader code
    /// uses for its atomic writes.
    ///
    /// # Safety
    /// The buffer must still be alive and mapped for the returned lifetime.
    pub unsafe fn atomic_words(&self) -> Option<&[AtomicU32]> {
        let ptr = self.mapped?;
        let len = (self.size / 4) as usize;
        // SAFETY: mappings are at least 4-byte aligned, AtomicU32 has the
        // layout of u32, and the caller keeps the mapping alive.
        Some(unsafe { std::slice::from_raw_parts(ptr.as_ptr() as *const AtomicU32, len) })
    }
}

// ── Descriptors ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub count: u32,
}

/// A descriptor-set layout together with the bindings it was created from,
/// which descriptor pools need for sizing.
#[derive(Debug, Clone)]
pub struct DescriptorLayout {
    pub handle: vk::DescriptorSetLayout,
    pub bindings: Vec<LayoutBinding>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferWrite {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub buffer: vk::Buffer,
    pub offset: u64,
    pub range: u64,
}

// ── Device trait ────────────────────────────────────────────

/// The device operations the runtime needs. Implementations must be usable
/// from any thread; callers provide the external synchronization Vulkan
/// requires for command buffers and queues.
pub trait GpuDevice: Send + Sync {
    fn create_buffer(&self, size: u64, bucket: MemoryBucket) -> VkResult<DeviceBuffer>;
    fn destroy_buffer(&self, buffer: &DeviceBuffer);
    fn flush(&self, buffer: &DeviceBuffer, offset: u64, size: u64) -> VkResult<()>;
    fn invalidate(&self, buffer: &DeviceBuffer, offset: u64, size: u64) -> VkResult<()>;

    fn create_descriptor_set_layout(&self, bindings: &[LayoutBinding]) -> VkResult<vk::DescriptorSetLayout>;
    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout);
    fn create_descriptor_pool(&self, bindings: &[LayoutBinding], max_sets: u32) -> VkResult<vk::DescriptorPool>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet>;
    fn write_buffer_descriptors(&self, set: vk::DescriptorSet, writes: &[BufferWrite]);

    fn queue_family_index(&self, queue: vk::Queue) -> u32;
    fn create_command_pool(&self, queue_family_index: u32) -> VkResult<vk::CommandPool>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer>;
    /// Begin recording; any previous contents are discarded.
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;

    fn cmd_fill_buffer(&self, command_buffer: vk::CommandBuffer, buffer: vk::Buffer, offset: u64, size: u64, data: u32);
    fn cmd_update_buffer(&self, command_buffer: vk::CommandBuffer, buffer: vk::Buffer, offset: u64, data: &[u8]);
    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    );
    /// Make transfer and host writes visible to shader reads and writes.
    fn cmd_shader_barrier(&self, command_buffer: vk::CommandBuffer);

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    /// `Err(vk::Result::TIMEOUT)` when the fence did not signal in time.
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()>;
    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool>;

    fn queue_submit(&self, queue: vk::Queue, command_buffers: &[vk::CommandBuffer], fence: vk::Fence) -> VkResult<()>;
    fn device_wait_idle(&self) -> VkResult<()>;
}

/// Round `value` up to a power-of-two `alignment`.
#[inline]
pub fn align_up(value: u64, alignment: u64) -> u64 {
    let alignment = alignment.max(1);
    debug_assert!(alignment.is_power_of_two(), "alignment {alignment} is not a power of two");
    (value + alignment - 1) & !(alignment - 1)
}
