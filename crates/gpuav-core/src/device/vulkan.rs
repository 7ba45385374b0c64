use std::ffi::c_void;

use ash::prelude::VkResult;
use ash::vk;
use dashmap::DashMap;
use tracing::{debug, warn};

use super::{BufferWrite, DeviceAddress, DeviceBuffer, GpuDevice, HostPtr, LayoutBinding, MemoryBucket};

/// [`GpuDevice`] over an application-created Vulkan device.
pub struct VulkanDevice {
    device: ash::Device,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    non_coherent_atom_size: u64,
    buffer_device_address: bool,
    queue_families: DashMap<vk::Queue, u32>,
}

impl VulkanDevice {
    /// Wrap `device`. `buffer_device_address` must match whether the feature
    /// was enabled at device creation.
    ///
    /// # Safety
    /// `instance`, `physical_device` and `device` must be valid and must
    /// outlive the returned value.
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        buffer_device_address: bool,
    ) -> Self {
        // SAFETY: handles are valid per the caller's contract.
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        Self {
            device,
            memory_properties,
            non_coherent_atom_size: properties.limits.non_coherent_atom_size.max(1),
            buffer_device_address,
            queue_families: DashMap::new(),
        }
    }

    /// Remember which family `queue` was retrieved from.
    pub fn register_queue(&self, queue: vk::Queue, family: u32) {
        self.queue_families.insert(queue, family);
    }

    pub fn raw(&self) -> &ash::Device {
        &self.device
    }

    fn find_memory_type(&self, type_bits: u32, required: vk::MemoryPropertyFlags) -> Option<u32> {
        let count = self.memory_properties.memory_type_count as usize;
        self.memory_properties.memory_types[..count]
            .iter()
            .enumerate()
            .find(|(i, ty)| type_bits & (1 << i) != 0 && ty.property_flags.contains(required))
            .map(|(i, _)| i as u32)
    }

    /// Memory type for `bucket`, relaxing to plain host-visible memory when
    /// the preferred combination does not exist.
    fn memory_type_for(&self, type_bits: u32, bucket: MemoryBucket) -> Option<u32> {
        self.find_memory_type(type_bits, bucket.required_memory_flags()).or_else(|| {
            if bucket.is_host_visible() {
                self.find_memory_type(type_bits, vk::MemoryPropertyFlags::HOST_VISIBLE)
            } else {
                self.find_memory_type(type_bits, vk::MemoryPropertyFlags::empty())
            }
        })
    }

    fn atom_range(&self, buffer: &DeviceBuffer, offset: u64, size: u64) -> vk::MappedMemoryRange<'static> {
        let atom = self.non_coherent_atom_size;
        let start = offset / atom * atom;
        let size = if size == vk::WHOLE_SIZE || offset + size >= buffer.size {
            vk::WHOLE_SIZE
        } else {
            super::align_up(offset + size - start, atom)
        };
        vk::MappedMemoryRange::default()
            .memory(buffer.memory)
            .offset(start)
            .size(size)
    }
}

// SAFETY: ash::Device is a table of function pointers plus a handle; Vulkan
// handles are valid across threads with the external synchronization the
// callers provide.
unsafe impl Send for VulkanDevice {}
unsafe impl Sync for VulkanDevice {}

impl GpuDevice for VulkanDevice {
    fn create_buffer(&self, size: u64, bucket: MemoryBucket) -> VkResult<DeviceBuffer> {
        let mut usage = bucket.usage();
        if !self.buffer_device_address {
            usage &= !vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        }
        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&create_info, None) }?;

        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let memory_type = match self.memory_type_for(requirements.memory_type_bits, bucket) {
            Some(t) => t,
            None => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                warn!(bucket = bucket.name(), "no memory type for bucket");
                return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
            }
        };

        let mut flags_info =
            vk::MemoryAllocateFlagsInfo::default().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let mut alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        if self.buffer_device_address {
            alloc_info = alloc_info.push_next(&mut flags_info);
        }
        let memory = match unsafe { self.device.allocate_memory(&alloc_info, None) } {
            Ok(m) => m,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let cleanup = |e: vk::Result| {
            unsafe {
                self.device.destroy_buffer(buffer, None);
                self.device.free_memory(memory, None);
            }
            e
        };

        unsafe { self.device.bind_buffer_memory(buffer, memory, 0) }.map_err(cleanup)?;

        let mapped = if bucket.is_host_visible() {
            let ptr: *mut c_void =
                unsafe { self.device.map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) }
                    .map_err(cleanup)?;
            HostPtr::new(ptr as *mut u8)
        } else {
            None
        };

        let device_address = if self.buffer_device_address {
            let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
            DeviceAddress(unsafe { self.device.get_buffer_device_address(&info) })
        } else {
            DeviceAddress::NULL
        };

        debug!(?buffer, size, bucket = bucket.name(), memory_type, "created instrumentation buffer");
        Ok(DeviceBuffer {
            buffer,
            memory,
            size,
            bucket,
            device_address,
            mapped,
        })
    }

    fn destroy_buffer(&self, buffer: &DeviceBuffer) {
        unsafe {
            if buffer.mapped.is_some() {
                self.device.unmap_memory(buffer.memory);
            }
            self.device.destroy_buffer(buffer.buffer, None);
            self.device.free_memory(buffer.memory, None);
        }
    }

    fn flush(&self, buffer: &DeviceBuffer, offset: u64, size: u64) -> VkResult<()> {
        if !buffer.bucket.is_non_coherent() {
            return Ok(());
        }
        let range = self.atom_range(buffer, offset, size);
        unsafe { self.device.flush_mapped_memory_ranges(std::slice::from_ref(&range)) }
    }

    fn invalidate(&self, buffer: &DeviceBuffer, offset: u64, size: u64) -> VkResult<()> {
        if !buffer.bucket.is_non_coherent() {
            return Ok(());
        }
        let range = self.atom_range(buffer, offset, size);
        unsafe { self.device.invalidate_mapped_memory_ranges(std::slice::from_ref(&range)) }
    }

    fn create_descriptor_set_layout(&self, bindings: &[LayoutBinding]) -> VkResult<vk::DescriptorSetLayout> {
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(b.count)
                    .stage_flags(vk::ShaderStageFlags::ALL)
            })
            .collect();
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        unsafe { self.device.create_descriptor_set_layout(&create_info, None) }
    }

    fn destroy_descriptor_set_layout(&self, layout: vk::DescriptorSetLayout) {
        unsafe { self.device.destroy_descriptor_set_layout(layout, None) };
    }

    fn create_descriptor_pool(&self, bindings: &[LayoutBinding], max_sets: u32) -> VkResult<vk::DescriptorPool> {
        let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
        for b in bindings {
            let count = b.count * max_sets;
            match sizes.iter_mut().find(|s| s.ty == b.descriptor_type) {
                Some(size) => size.descriptor_count += count,
                None => sizes.push(vk::DescriptorPoolSize {
                    ty: b.descriptor_type,
                    descriptor_count: count,
                }),
            }
        }
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(&sizes);
        unsafe { self.device.create_descriptor_pool(&create_info, None) }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn allocate_descriptor_set(
        &self,
        pool: vk::DescriptorPool,
        layout: vk::DescriptorSetLayout,
    ) -> VkResult<vk::DescriptorSet> {
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info) }?;
        sets.into_iter().next().ok_or(vk::Result::ERROR_OUT_OF_POOL_MEMORY)
    }

    fn write_buffer_descriptors(&self, set: vk::DescriptorSet, writes: &[BufferWrite]) {
        let infos: Vec<vk::DescriptorBufferInfo> = writes
            .iter()
            .map(|w| vk::DescriptorBufferInfo {
                buffer: w.buffer,
                offset: w.offset,
                range: w.range,
            })
            .collect();
        let vk_writes: Vec<vk::WriteDescriptorSet> = writes
            .iter()
            .zip(infos.iter())
            .map(|(w, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(w.binding)
                    .descriptor_type(w.descriptor_type)
                    .buffer_info(std::slice::from_ref(info))
            })
            .collect();
        unsafe { self.device.update_descriptor_sets(&vk_writes, &[]) };
    }

    fn queue_family_index(&self, queue: vk::Queue) -> u32 {
        self.queue_families.get(&queue).map(|f| *f).unwrap_or(0)
    }

    fn create_command_pool(&self, queue_family_index: u32) -> VkResult<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);
        unsafe { self.device.create_command_pool(&create_info, None) }
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }?;
        buffers.into_iter().next().ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
    }

    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(command_buffer, &begin_info) }
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        unsafe { self.device.end_command_buffer(command_buffer) }
    }

    fn cmd_fill_buffer(&self, command_buffer: vk::CommandBuffer, buffer: vk::Buffer, offset: u64, size: u64, data: u32) {
        unsafe { self.device.cmd_fill_buffer(command_buffer, buffer, offset, size, data) };
    }

    fn cmd_update_buffer(&self, command_buffer: vk::CommandBuffer, buffer: vk::Buffer, offset: u64, data: &[u8]) {
        unsafe { self.device.cmd_update_buffer(command_buffer, buffer, offset, data) };
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        regions: &[vk::BufferCopy],
    ) {
        unsafe { self.device.cmd_copy_buffer(command_buffer, src, dst, regions) };
    }

    fn cmd_shader_barrier(&self, command_buffer: vk::CommandBuffer) {
        let barrier = vk::MemoryBarrier::default()
            .src_access_mask(vk::AccessFlags::TRANSFER_WRITE | vk::AccessFlags::HOST_WRITE)
            .dst_access_mask(vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE);
        unsafe {
            self.device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TRANSFER | vk::PipelineStageFlags::HOST,
                vk::PipelineStageFlags::ALL_COMMANDS,
                vk::DependencyFlags::empty(),
                std::slice::from_ref(&barrier),
                &[],
                &[],
            )
        };
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        let create_info = vk::FenceCreateInfo::default().flags(flags);
        unsafe { self.device.create_fence(&create_info, None) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        unsafe { self.device.reset_fences(&[fence]) }
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> VkResult<()> {
        unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) }
    }

    fn fence_status(&self, fence: vk::Fence) -> VkResult<bool> {
        unsafe { self.device.get_fence_status(fence) }
    }

    fn queue_submit(&self, queue: vk::Queue, command_buffers: &[vk::CommandBuffer], fence: vk::Fence) -> VkResult<()> {
        let submit = vk::SubmitInfo::default().command_buffers(command_buffers);
        unsafe { self.device.queue_submit(queue, std::slice::from_ref(&submit), fence) }
    }

    fn device_wait_idle(&self) -> VkResult<()> {
        unsafe { self.device.device_wait_idle() }
    }
}
