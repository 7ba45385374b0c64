//! Per-device objects shared by every command context, keyed by type.
//!
//! Each type gets at most one instance, built on first request and torn down
//! in reverse creation order by [`SharedResources::destroy_all`].

use std::any::{Any, TypeId};
use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk;
use parking_lot::Mutex;
use tracing::debug;

use gpuav_protocol::bindings::{BindingKind, INSTRUMENTATION_BINDINGS};

use crate::device::{DescriptorLayout, DeviceBuffer, GpuDevice, LayoutBinding, MemoryBucket};

pub trait SharedResource: Any + Send + Sync {
    fn destroy(&self, device: &dyn GpuDevice);
}

struct Slot {
    type_id: TypeId,
    name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
    resource: Arc<dyn SharedResource>,
}

pub struct SharedResources {
    device: Arc<dyn GpuDevice>,
    slots: Mutex<Vec<Slot>>,
}

impl SharedResources {
    pub fn new(device: Arc<dyn GpuDevice>) -> Self {
        Self {
            device,
            slots: Mutex::new(Vec::new()),
        }
    }

    pub fn get<T: SharedResource>(&self) -> Option<Arc<T>> {
        let slots = self.slots.lock();
        slots
            .iter()
            .find(|s| s.type_id == TypeId::of::<T>())
            .and_then(|s| s.value.clone().downcast::<T>().ok())
    }

    /// The instance of `T`, creating it with `create` on first request.
    /// A failed creation leaves no slot behind, so a later call retries.
    pub fn get_or_create<T, F>(&self, create: F) -> VkResult<Arc<T>>
    where
        T: SharedResource,
        F: FnOnce(&dyn GpuDevice) -> VkResult<T>,
    {
        let mut slots = self.slots.lock();
        if let Some(existing) = slots
            .iter()
            .find(|s| s.type_id == TypeId::of::<T>())
            .and_then(|s| s.value.clone().downcast::<T>().ok())
        {
            return Ok(existing);
        }
        let value = Arc::new(create(self.device.as_ref())?);
        slots.push(Slot {
            type_id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
            value: value.clone(),
            resource: value.clone(),
        });
        debug!(resource = std::any::type_name::<T>(), "shared resource created");
        Ok(value)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    pub fn destroy_all(&self) {
        let mut slots = self.slots.lock();
        while let Some(slot) = slots.pop() {
            slot.resource.destroy(self.device.as_ref());
            debug!(resource = slot.name, "shared resource destroyed");
        }
    }
}

// ── Resources every device needs ────────────────────────────

/// Layout of the extra descriptor set instrumented shaders read.
pub struct InstrumentationLayout {
    pub layout: DescriptorLayout,
}

impl InstrumentationLayout {
    pub fn create(device: &dyn GpuDevice) -> VkResult<Self> {
        let bindings: Vec<LayoutBinding> = INSTRUMENTATION_BINDINGS
            .iter()
            .map(|slot| LayoutBinding {
                binding: slot.binding,
                descriptor_type: match slot.kind {
                    BindingKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
                    BindingKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
                },
                count: 1,
            })
            .collect();
        let handle = device.create_descriptor_set_layout(&bindings)?;
        Ok(Self {
            layout: DescriptorLayout { handle, bindings },
        })
    }

    pub fn descriptor_type(&self, binding: u32) -> vk::DescriptorType {
        self.layout
            .bindings
            .iter()
            .find(|b| b.binding == binding)
            .map(|b| b.descriptor_type)
            .unwrap_or(vk::DescriptorType::STORAGE_BUFFER)
    }
}

impl SharedResource for InstrumentationLayout {
    fn destroy(&self, device: &dyn GpuDevice) {
        device.destroy_descriptor_set_layout(self.layout.handle);
    }
}

/// Small zeroed buffer bound to every instrumentation binding no check
/// claimed, so every set is fully written. Shaders that see it read zeros,
/// which turns the corresponding check off.
pub struct DummyBuffer {
    pub buffer: DeviceBuffer,
}

impl DummyBuffer {
    pub const SIZE: u64 = 256;

    pub fn create(device: &dyn GpuDevice) -> VkResult<Self> {
        let buffer = device.create_buffer(Self::SIZE, MemoryBucket::HostCoherent)?;
        // SAFETY: freshly created and mapped.
        if let Some(words) = unsafe { buffer.atomic_words() } {
            for w in words {
                w.store(0, std::sync::atomic::Ordering::Relaxed);
            }
        }
        Ok(Self { buffer })
    }
}

impl SharedResource for DummyBuffer {
    fn destroy(&self, device: &dyn GpuDevice) {
        device.destroy_buffer(&self.buffer);
    }
}
