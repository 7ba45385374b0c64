//! Device-level entry point driven by the call-interception layer.
//!
//! Locks are always taken queue first, then command context. The heap and
//! the shared caches carry their own short locks.

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use ash::prelude::VkResult;
use ash::vk::{self, Handle};
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use gpuav_protocol::PrintfError;

use crate::checks::DescriptorIndexingCheck;
use crate::command_context::{BindPoint, CommandContext};
use crate::config::GpuAvConfig;
use crate::descriptor_heap::{DescriptorHeap, DescriptorId, ResourceKind, ResourceRef};
use crate::device::GpuDevice;
use crate::diagnostics::DiagnosticSink;
use crate::error::AbortSignal;
use crate::printf::{FormatTable, PrintfDecoder};
use crate::queue::{QueueState, Submission};
use crate::shared::SharedResources;

pub struct Validator {
    device: Arc<dyn GpuDevice>,
    config: Arc<GpuAvConfig>,
    abort: AbortSignal,
    sink: Arc<dyn DiagnosticSink>,
    heap: Arc<DescriptorHeap>,
    shared: Arc<SharedResources>,
    formats: Arc<FormatTable>,
    printf: Arc<PrintfDecoder>,
    descriptor_indexing: Arc<DescriptorIndexingCheck>,
    contexts: DashMap<vk::CommandBuffer, Arc<Mutex<CommandContext>>>,
    queues: DashMap<vk::Queue, Arc<Mutex<QueueState>>>,
    resource_ids: DashMap<ResourceRef, DescriptorId>,
    truncation_reported: AtomicBool,
}

impl Validator {
    pub fn new(device: Arc<dyn GpuDevice>, config: GpuAvConfig, sink: Arc<dyn DiagnosticSink>) -> Self {
        let abort = AbortSignal::new();
        let heap_wanted = config.validation.enabled && config.validation.descriptor_checks;
        let heap = if heap_wanted {
            match DescriptorHeap::new(device.clone(), config.heap.capacity) {
                Ok(heap) => heap,
                Err(e) => {
                    abort.trigger(&format!("descriptor heap: {e}"));
                    DescriptorHeap::disabled()
                }
            }
        } else {
            DescriptorHeap::disabled()
        };
        let heap = Arc::new(heap);
        let formats = Arc::new(FormatTable::new());
        info!(
            enabled = config.validation.enabled,
            descriptor_checks = config.validation.descriptor_checks,
            debug_printf = config.validation.debug_printf,
            heap_capacity = heap.capacity(),
            "GPU-assisted validation initialised"
        );
        Self {
            shared: Arc::new(SharedResources::new(device.clone())),
            printf: Arc::new(PrintfDecoder::new(formats.clone())),
            descriptor_indexing: Arc::new(DescriptorIndexingCheck::new(heap.clone())),
            device,
            config: Arc::new(config),
            abort,
            sink,
            heap,
            formats,
            contexts: DashMap::new(),
            queues: DashMap::new(),
            resource_ids: DashMap::new(),
            truncation_reported: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &GpuAvConfig {
        &self.config
    }

    pub fn abort_signal(&self) -> &AbortSignal {
        &self.abort
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }

    fn is_active(&self) -> bool {
        self.config.validation.enabled && !self.abort.is_aborted()
    }

    pub fn heap(&self) -> &Arc<DescriptorHeap> {
        &self.heap
    }

    pub fn formats(&self) -> &Arc<FormatTable> {
        &self.formats
    }

    pub fn shared(&self) -> &Arc<SharedResources> {
        &self.shared
    }

    // ── Resources ───────────────────────────────────────────

    /// Hand a descriptor id to a newly created resource. Returns the null id
    /// when the heap is disabled or full.
    pub fn on_resource_created(&self, kind: ResourceKind, handle: u64) -> DescriptorId {
        if !self.is_active() {
            return DescriptorId::NULL;
        }
        let owner = ResourceRef { kind, handle };
        let id = self.heap.allocate(owner);
        if !id.is_null() {
            if let Some(previous) = self.resource_ids.insert(owner, id) {
                warn!(?owner, "resource created twice, releasing its previous id");
                self.heap.free(previous);
            }
        }
        id
    }

    /// Release the id of a destroyed resource. The application guarantees
    /// no pending device work still uses it.
    pub fn on_resource_destroyed(&self, kind: ResourceKind, handle: u64) {
        if let Some((_, id)) = self.resource_ids.remove(&ResourceRef { kind, handle }) {
            self.heap.free(id);
        }
    }

    pub fn descriptor_id(&self, kind: ResourceKind, handle: u64) -> DescriptorId {
        self.resource_ids
            .get(&ResourceRef { kind, handle })
            .map(|e| *e.value())
            .unwrap_or(DescriptorId::NULL)
    }

    pub fn register_printf_strings(&self, shader_id: u32, strings: &[(u32, &str)]) -> Result<(), PrintfError> {
        for (string_id, source) in strings {
            self.formats.register(shader_id, *string_id, source)?;
        }
        Ok(())
    }

    // ── Command buffers ─────────────────────────────────────

    pub fn context(&self, command_buffer: vk::CommandBuffer) -> Option<Arc<Mutex<CommandContext>>> {
        self.contexts.get(&command_buffer).map(|e| e.value().clone())
    }

    pub fn context_count(&self) -> usize {
        self.contexts.len()
    }

    fn context_or_create(&self, command_buffer: vk::CommandBuffer) -> Arc<Mutex<CommandContext>> {
        self.contexts
            .entry(command_buffer)
            .or_insert_with(|| {
                Arc::new(Mutex::new(CommandContext::new(
                    command_buffer,
                    self.device.clone(),
                    self.shared.clone(),
                    self.config.clone(),
                    self.abort.clone(),
                )))
            })
            .value()
            .clone()
    }

    pub fn on_command_buffer_allocated(&self, command_buffer: vk::CommandBuffer) {
        if self.is_active() {
            self.context_or_create(command_buffer);
        }
    }

    /// Start a recording: reset the context and install the enabled checks,
    /// printf first.
    pub fn on_command_buffer_begin(&self, command_buffer: vk::CommandBuffer) {
        if !self.is_active() {
            return;
        }
        let ctx = self.context_or_create(command_buffer);
        let mut ctx = ctx.lock();
        ctx.begin();
        if self.config.validation.debug_printf {
            ctx.register_decoder(self.printf.clone());
        }
        if self.config.validation.descriptor_checks && self.heap.is_enabled() {
            self.descriptor_indexing.install(&mut ctx);
        }
    }

    pub fn on_command_buffer_end(&self, command_buffer: vk::CommandBuffer) {
        if let Some(ctx) = self.context(command_buffer) {
            ctx.lock().end();
        }
    }

    pub fn on_command_buffer_reset(&self, command_buffer: vk::CommandBuffer) {
        if let Some(ctx) = self.context(command_buffer) {
            ctx.lock().reset();
        }
    }

    pub fn on_command_buffer_freed(&self, command_buffer: vk::CommandBuffer) {
        if let Some((_, ctx)) = self.contexts.remove(&command_buffer) {
            ctx.lock().destroy();
        }
    }

    /// Note a draw, dispatch or trace. Returns the instrumentation set to bind
    /// at the configured set index, or `None` to run the action unchecked.
    pub fn record_action(
        &self,
        command_buffer: vk::CommandBuffer,
        bind_point: BindPoint,
        command: &str,
    ) -> Option<vk::DescriptorSet> {
        if !self.is_active() {
            return None;
        }
        self.context(command_buffer)?
            .lock()
            .record_action(bind_point, command)
    }

    pub fn begin_label(&self, command_buffer: vk::CommandBuffer, name: &str) {
        if let Some(ctx) = self.context(command_buffer) {
            ctx.lock().begin_label(name);
        }
    }

    pub fn end_label(&self, command_buffer: vk::CommandBuffer) {
        if let Some(ctx) = self.context(command_buffer) {
            ctx.lock().end_label();
        }
    }

    // ── Queues ──────────────────────────────────────────────

    pub fn queue(&self, queue: vk::Queue) -> Option<Arc<Mutex<QueueState>>> {
        self.queues.get(&queue).map(|e| e.value().clone())
    }

    fn queue_or_create(&self, queue: vk::Queue) -> Arc<Mutex<QueueState>> {
        self.queues
            .entry(queue)
            .or_insert_with(|| {
                Arc::new(Mutex::new(QueueState::new(
                    queue,
                    self.device.clone(),
                    &self.config,
                    self.abort.clone(),
                )))
            })
            .value()
            .clone()
    }

    pub fn queue_begin_label(&self, queue: vk::Queue, name: &str) {
        self.queue_or_create(queue).lock().begin_label(name);
    }

    pub fn queue_end_label(&self, queue: vk::Queue) {
        self.queue_or_create(queue).lock().end_label();
    }

    /// Wrap the application's submission: completed submissions on `queue`
    /// are retired without blocking, then pre-submit work, `real_submit` and
    /// post-submit work run in that order. The result of `real_submit` is
    /// returned unchanged; auxiliary failures never affect it.
    pub fn queue_submit<F>(&self, queue: vk::Queue, submissions: &[Submission], real_submit: F) -> VkResult<()>
    where
        F: FnOnce() -> VkResult<()>,
    {
        if !self.is_active() {
            return real_submit();
        }
        // Finished work releases its aux slots and output buffers here.
        self.retire_queue(queue, false);

        let state = self.queue_or_create(queue);
        let mut q = state.lock();

        let mut seen = HashSet::new();
        let handles: Vec<(vk::CommandBuffer, Arc<Mutex<CommandContext>>)> = submissions
            .iter()
            .flat_map(|s| s.command_buffers.iter().copied())
            .filter(|cb| seen.insert(*cb))
            .filter_map(|cb| self.context(cb).map(|ctx| (cb, ctx)))
            .collect();
        // Context locks are taken in handle order; guards stay in submission order.
        let mut lock_order: Vec<usize> = (0..handles.len()).collect();
        lock_order.sort_by_key(|&i| handles[i].0.as_raw());
        let mut locked: Vec<Option<MutexGuard<'_, CommandContext>>> = handles.iter().map(|_| None).collect();
        for i in lock_order {
            locked[i] = Some(handles[i].1.lock());
        }
        let mut guards: Vec<MutexGuard<'_, CommandContext>> = locked.into_iter().flatten().collect();

        let pre = {
            let contexts: Vec<&CommandContext> = guards.iter().map(|g| &**g).collect();
            q.submit_pre(&contexts)
        };

        let result = real_submit();
        match result {
            Ok(()) => {
                let mut contexts: Vec<&mut CommandContext> = guards.iter_mut().map(|g| &mut **g).collect();
                q.finish_submit(&mut contexts, pre);
            }
            Err(e) => {
                if !self.abort.check(e, "queue submit") {
                    debug!(?queue, error = ?e, "application submission failed");
                }
                q.abandon_submit(pre);
            }
        }
        result
    }

    /// Block until every in-flight submission on `queue` completed (or the
    /// retire timeout passed) and decode them. Returns the number of command
    /// buffers retired.
    pub fn retire(&self, queue: vk::Queue) -> usize {
        self.retire_queue(queue, true)
    }

    /// Decode the submissions on `queue` that already completed, without
    /// blocking.
    pub fn poll(&self, queue: vk::Queue) -> usize {
        self.retire_queue(queue, false)
    }

    /// Forward the application's queue wait, then retire everything.
    pub fn queue_wait_idle<F>(&self, queue: vk::Queue, real_wait: F) -> VkResult<()>
    where
        F: FnOnce() -> VkResult<()>,
    {
        let result = real_wait();
        if let Err(e) = result {
            self.abort.check(e, "queue wait idle");
        }
        self.retire(queue);
        result
    }

    /// Forward the application's device wait, then retire every queue.
    pub fn device_wait_idle<F>(&self, real_wait: F) -> VkResult<()>
    where
        F: FnOnce() -> VkResult<()>,
    {
        let result = real_wait();
        if let Err(e) = result {
            self.abort.check(e, "device wait idle");
        }
        let queues: Vec<vk::Queue> = self.queues.iter().map(|e| *e.key()).collect();
        for queue in queues {
            self.retire(queue);
        }
        result
    }

    fn retire_queue(&self, queue: vk::Queue, wait: bool) -> usize {
        if self.abort.is_aborted() {
            return 0;
        }
        let Some(state) = self.queue(queue) else {
            return 0;
        };
        let mut q = state.lock();
        let mut retired = 0;
        for submission in q.take_completed(wait) {
            for (command_buffer, labels) in submission.command_buffers {
                let Some(ctx) = self.context(command_buffer) else {
                    debug!(?command_buffer, "retired command buffer was freed while in flight");
                    continue;
                };
                ctx.lock()
                    .retire(queue, &labels, self.sink.as_ref(), &self.truncation_reported);
                retired += 1;
            }
            debug!(?queue, seq = submission.seq, "submission retired");
        }
        retired
    }

    /// Tear everything down. Call after the device is idle.
    pub fn destroy(&self) {
        for entry in self.queues.iter() {
            let mut q = entry.value().lock();
            if q.in_flight_len() > 0 {
                warn!(queue = ?entry.key(), in_flight = q.in_flight_len(), "destroying queue with submissions in flight");
            }
            q.destroy();
        }
        self.queues.clear();
        for entry in self.contexts.iter() {
            entry.value().lock().destroy();
        }
        self.contexts.clear();
        self.resource_ids.clear();
        self.shared.destroy_all();
        self.heap.destroy();
        info!("GPU-assisted validation shut down");
    }
}
