//! Descriptor id heap.
//!
//! Every tracked resource gets a small id when it is created. A device-visible
//! bitmap mirrors which ids are live, so instrumented shaders can reject a
//! descriptor whose resource has already been destroyed without asking the
//! host. Bit 0 belongs to [`DescriptorId::NULL`] and is never set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::device::{DeviceBuffer, GpuDevice, MemoryBucket};
use crate::error::GpuAvError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DescriptorId(pub u32);

impl DescriptorId {
    pub const NULL: DescriptorId = DescriptorId(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn get(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Buffer,
    BufferView,
    Image,
    ImageView,
    Sampler,
    AccelerationStructure,
}

/// The resource an id was handed out for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub handle: u64,
}

/// Bitmap size in bytes for `capacity` ids plus the null bit.
pub fn bitmap_bytes(capacity: u32) -> u64 {
    (u64::from(capacity) + 1).div_ceil(32) * 4
}

/// The test instrumented shaders perform before dereferencing `id`.
pub fn bitmap_test(words: &[u32], id: DescriptorId) -> bool {
    let word = (id.0 / 32) as usize;
    !id.is_null() && words.get(word).is_some_and(|w| w & (1 << (id.0 % 32)) != 0)
}

struct HeapState {
    next_id: u32,
    owners: HashMap<DescriptorId, ResourceRef>,
    bitmap: Option<DeviceBuffer>,
}

impl HeapState {
    fn bitmap_words(&self) -> Option<&[AtomicU32]> {
        // SAFETY: the bitmap is mapped from creation until `destroy` takes it
        // out of the state, and we hold the state lock.
        self.bitmap.as_ref().and_then(|b| unsafe { b.atomic_words() })
    }

    fn set_bit(&self, id: DescriptorId, live: bool) {
        let Some(words) = self.bitmap_words() else {
            return;
        };
        let mask = 1u32 << (id.0 % 32);
        if let Some(word) = words.get((id.0 / 32) as usize) {
            if live {
                word.fetch_or(mask, Ordering::Release);
            } else {
                word.fetch_and(!mask, Ordering::Release);
            }
        }
    }
}

pub struct DescriptorHeap {
    device: Option<Arc<dyn GpuDevice>>,
    capacity: u32,
    state: Mutex<HeapState>,
}

impl DescriptorHeap {
    /// Create a heap of `capacity` ids backed by a host-coherent bitmap.
    /// A capacity of zero yields a disabled heap.
    pub fn new(device: Arc<dyn GpuDevice>, capacity: u32) -> Result<Self, GpuAvError> {
        if capacity == 0 {
            return Ok(Self::disabled());
        }
        let size = bitmap_bytes(capacity);
        let bitmap = device.create_buffer(size, MemoryBucket::HostCoherent)?;
        // SAFETY: freshly created and mapped.
        match unsafe { bitmap.atomic_words() } {
            Some(words) => words.iter().for_each(|w| w.store(0, Ordering::Relaxed)),
            None => {
                device.destroy_buffer(&bitmap);
                return Err(GpuAvError::Device(vk::Result::ERROR_MEMORY_MAP_FAILED));
            }
        }
        info!(capacity, bitmap_bytes = size, "descriptor heap created");
        Ok(Self {
            device: Some(device),
            capacity,
            state: Mutex::new(HeapState {
                next_id: 1,
                owners: HashMap::new(),
                bitmap: Some(bitmap),
            }),
        })
    }

    /// A heap that never hands out ids.
    pub fn disabled() -> Self {
        Self {
            device: None,
            capacity: 0,
            state: Mutex::new(HeapState {
                next_id: 1,
                owners: HashMap::new(),
                bitmap: None,
            }),
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Hand out the next free id after the last one issued, wrapping past
    /// `capacity`. Returns [`DescriptorId::NULL`] when the heap is full or
    /// disabled.
    pub fn allocate(&self, owner: ResourceRef) -> DescriptorId {
        let mut state = self.state.lock();
        if self.capacity == 0 || state.owners.len() >= self.capacity as usize {
            if self.capacity > 0 {
                warn!(capacity = self.capacity, "descriptor heap exhausted");
            }
            return DescriptorId::NULL;
        }
        let mut candidate = state.next_id;
        loop {
            if candidate == 0 || candidate > self.capacity {
                candidate = 1;
            }
            if !state.owners.contains_key(&DescriptorId(candidate)) {
                break;
            }
            candidate += 1;
        }
        let id = DescriptorId(candidate);
        state.owners.insert(id, owner);
        state.set_bit(id, true);
        state.next_id = candidate + 1;
        id
    }

    /// Release `id`. The round-robin cursor is left alone, so the id is
    /// handed out again only after every other free id has been.
    pub fn free(&self, id: DescriptorId) -> bool {
        if id.is_null() {
            return false;
        }
        let mut state = self.state.lock();
        if state.owners.remove(&id).is_none() {
            debug!(id = id.0, "free of descriptor id that is not live");
            return false;
        }
        state.set_bit(id, false);
        true
    }

    pub fn is_live(&self, id: DescriptorId) -> bool {
        self.state.lock().owners.contains_key(&id)
    }

    pub fn owner(&self, id: DescriptorId) -> Option<ResourceRef> {
        self.state.lock().owners.get(&id).copied()
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().owners.len()
    }

    /// Current contents of the device-visible bitmap.
    pub fn bitmap_snapshot(&self) -> Vec<u32> {
        let state = self.state.lock();
        state
            .bitmap_words()
            .map(|words| words.iter().map(|w| w.load(Ordering::Acquire)).collect())
            .unwrap_or_default()
    }

    /// Buffer and byte size to bind where shaders expect the bitmap.
    pub fn bitmap_binding(&self) -> Option<(vk::Buffer, u64)> {
        self.state.lock().bitmap.as_ref().map(|b| (b.buffer, b.size))
    }

    pub fn destroy(&self) {
        let mut state = self.state.lock();
        if let (Some(device), Some(bitmap)) = (&self.device, state.bitmap.take()) {
            device.destroy_buffer(&bitmap);
            debug!(live = state.owners.len(), "descriptor heap destroyed");
        }
        state.owners.clear();
    }
}
