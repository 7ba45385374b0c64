//! Per-queue submission bookkeeping: the recycled auxiliary command buffers,
//! the in-flight list and the label stack carried between submissions.

use std::collections::VecDeque;
use std::sync::Arc;

use ash::vk;
use tracing::{debug, warn};

use crate::command_context::{CommandContext, SubmitCtx};
use crate::config::GpuAvConfig;
use crate::decode::apply_labels;
use crate::device::GpuDevice;
use crate::error::AbortSignal;
use crate::resource_pool::ResourcePool;

/// One batch of the application's submission, as in `VkSubmitInfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Submission {
    pub command_buffers: Vec<vk::CommandBuffer>,
}

impl Submission {
    pub fn new(command_buffers: impl Into<Vec<vk::CommandBuffer>>) -> Self {
        Self {
            command_buffers: command_buffers.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxSlot {
    pub command_buffer: vk::CommandBuffer,
    pub fence: vk::Fence,
}

/// Bounded pool of auxiliary command buffers, each paired with its own fence.
pub struct AuxPool {
    device: Arc<dyn GpuDevice>,
    family: u32,
    command_pool: Option<vk::CommandPool>,
    free: Vec<AuxSlot>,
    created: Vec<AuxSlot>,
    limit: usize,
}

impl AuxPool {
    pub fn new(device: Arc<dyn GpuDevice>, family: u32, limit: usize) -> Self {
        Self {
            device,
            family,
            command_pool: None,
            free: Vec::new(),
            created: Vec::new(),
            limit,
        }
    }

    /// A slot whose fence is unsignaled, or `None` once `limit` slots are in use.
    pub fn acquire(&mut self) -> VkResultOpt<AuxSlot> {
        if let Some(slot) = self.free.pop() {
            if let Err(e) = self.device.reset_fence(slot.fence) {
                self.free.push(slot);
                return Err(e);
            }
            return Ok(Some(slot));
        }
        if self.created.len() >= self.limit {
            return Ok(None);
        }
        let pool = match self.command_pool {
            Some(pool) => pool,
            None => {
                let pool = self.device.create_command_pool(self.family)?;
                self.command_pool = Some(pool);
                pool
            }
        };
        let command_buffer = self.device.allocate_command_buffer(pool)?;
        let fence = self.device.create_fence(false)?;
        let slot = AuxSlot { command_buffer, fence };
        self.created.push(slot);
        debug!(family = self.family, slots = self.created.len(), "auxiliary command buffer created");
        Ok(Some(slot))
    }

    pub fn release(&mut self, slot: AuxSlot) {
        debug_assert!(!self.free.contains(&slot), "auxiliary slot released twice");
        self.free.push(slot);
    }

    pub fn created(&self) -> usize {
        self.created.len()
    }

    pub fn available(&self) -> usize {
        self.free.len() + (self.limit - self.created.len().min(self.limit))
    }

    pub fn destroy(&mut self) {
        for slot in self.created.drain(..) {
            self.device.destroy_fence(slot.fence);
        }
        self.free.clear();
        if let Some(pool) = self.command_pool.take() {
            self.device.destroy_command_pool(pool);
        }
    }
}

/// `Ok(None)` is exhaustion, `Err` a device failure.
pub type VkResultOpt<T> = ash::prelude::VkResult<Option<T>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuxPhase {
    Pre,
    Post,
}

/// What retirement waits on for one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncPoint {
    Fence(vk::Fence),
    /// The device was idled at submit time.
    Complete,
}

struct InFlight {
    seq: u64,
    /// Application command buffers with the queue labels open when each began.
    command_buffers: Vec<(vk::CommandBuffer, Vec<String>)>,
    aux: Vec<AuxSlot>,
    sync: SyncPoint,
}

/// A submission whose sync point has passed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedSubmission {
    pub seq: u64,
    pub command_buffers: Vec<(vk::CommandBuffer, Vec<String>)>,
}

pub struct QueueState {
    queue: vk::Queue,
    device: Arc<dyn GpuDevice>,
    abort: AbortSignal,
    aux: AuxPool,
    pool: ResourcePool,
    submitted_seq: u64,
    completed_seq: u64,
    in_flight: VecDeque<InFlight>,
    label_stack: Vec<String>,
    retire_timeout_ns: u64,
}

impl QueueState {
    pub fn new(queue: vk::Queue, device: Arc<dyn GpuDevice>, config: &GpuAvConfig, abort: AbortSignal) -> Self {
        let family = device.queue_family_index(queue);
        Self {
            queue,
            aux: AuxPool::new(
                device.clone(),
                family,
                config.submission.aux_command_buffers_per_queue as usize,
            ),
            pool: ResourcePool::new(device.clone(), &config.buffers, abort.clone()),
            device,
            abort,
            submitted_seq: 0,
            completed_seq: 0,
            in_flight: VecDeque::new(),
            label_stack: Vec::new(),
            retire_timeout_ns: config.submission.retire_timeout_ms.saturating_mul(1_000_000),
        }
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn submitted_seq(&self) -> u64 {
        self.submitted_seq
    }

    pub fn completed_seq(&self) -> u64 {
        self.completed_seq
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn aux_pool(&self) -> &AuxPool {
        &self.aux
    }

    pub fn resource_pool(&self) -> &ResourcePool {
        &self.pool
    }

    pub fn label_stack(&self) -> &[String] {
        &self.label_stack
    }

    pub fn begin_label(&mut self, name: &str) {
        self.label_stack.push(name.to_string());
    }

    pub fn end_label(&mut self) {
        self.label_stack.pop();
    }

    // ── Submission ──────────────────────────────────────────

    /// Record and submit the pre-submit work of every context in `contexts`.
    /// Contexts without pre-submit hooks get nothing.
    pub(crate) fn submit_pre(&mut self, contexts: &[&CommandContext]) -> Vec<AuxSlot> {
        let mut slots = Vec::new();
        for ctx in contexts.iter().filter(|c| c.has_pre_submit_work()) {
            if let Some(slot) = self.record_aux(ctx, AuxPhase::Pre) {
                if self.submit_aux(slot) {
                    slots.push(slot);
                }
            }
        }
        slots
    }

    /// Account for the application's batch once it went to the device: mark
    /// the contexts submitted, capture their inherited labels, submit the
    /// post-submit work, and remember what retirement must wait on.
    pub(crate) fn finish_submit(&mut self, contexts: &mut [&mut CommandContext], pre_slots: Vec<AuxSlot>) -> u64 {
        self.submitted_seq += 1;
        let seq = self.submitted_seq;

        let mut command_buffers = Vec::with_capacity(contexts.len());
        for ctx in contexts.iter_mut() {
            ctx.mark_submitted();
            command_buffers.push((ctx.command_buffer(), self.label_stack.clone()));
            apply_labels(&mut self.label_stack, ctx.labels());
        }

        let mut aux = pre_slots;
        let mut last_fence = None;
        for ctx in contexts.iter().filter(|c| c.has_post_submit_work()) {
            if let Some(slot) = self.record_aux(ctx, AuxPhase::Post) {
                if self.submit_aux(slot) {
                    aux.push(slot);
                    last_fence = Some(slot.fence);
                }
            }
        }

        let sync = match last_fence {
            Some(fence) => SyncPoint::Fence(fence),
            None => match self.submit_fence_only() {
                Some(slot) => {
                    aux.push(slot);
                    SyncPoint::Fence(slot.fence)
                }
                None => self.idle_fallback(),
            },
        };

        debug!(
            queue = ?self.queue,
            seq,
            command_buffers = command_buffers.len(),
            aux = aux.len(),
            "submission tracked"
        );
        self.in_flight.push_back(InFlight {
            seq,
            command_buffers,
            aux,
            sync,
        });
        seq
    }

    /// Track a batch the application failed to submit, so its pre-submit
    /// slots come back once they finish.
    pub(crate) fn abandon_submit(&mut self, pre_slots: Vec<AuxSlot>) {
        if pre_slots.is_empty() {
            return;
        }
        self.submitted_seq += 1;
        let sync = pre_slots
            .last()
            .map(|s| SyncPoint::Fence(s.fence))
            .unwrap_or(SyncPoint::Complete);
        self.in_flight.push_back(InFlight {
            seq: self.submitted_seq,
            command_buffers: Vec::new(),
            aux: pre_slots,
            sync,
        });
    }

    fn record_aux(&mut self, ctx: &CommandContext, phase: AuxPhase) -> Option<AuxSlot> {
        let slot = match self.aux.acquire() {
            Ok(Some(slot)) => slot,
            Ok(None) => {
                debug!(queue = ?self.queue, ?phase, "auxiliary command buffers exhausted, hooks skipped");
                return None;
            }
            Err(e) => {
                if !self.abort.check(e, "auxiliary command buffer") {
                    warn!(queue = ?self.queue, error = ?e, "auxiliary command buffer unavailable, hooks skipped");
                }
                return None;
            }
        };
        if let Err(e) = self.device.begin_command_buffer(slot.command_buffer) {
            self.aux.release(slot);
            self.abort.check(e, "auxiliary command buffer begin");
            return None;
        }
        let mut submit_ctx = SubmitCtx {
            device: self.device.as_ref(),
            queue: self.queue,
            command_buffer: slot.command_buffer,
            target: ctx.command_buffer(),
            queue_pool: &mut self.pool,
        };
        match phase {
            AuxPhase::Pre => ctx.record_pre_submit(&mut submit_ctx),
            AuxPhase::Post => ctx.record_post_submit(&mut submit_ctx),
        }
        if let Err(e) = self.device.end_command_buffer(slot.command_buffer) {
            self.aux.release(slot);
            self.abort.check(e, "auxiliary command buffer end");
            return None;
        }
        Some(slot)
    }

    /// Submit one recorded slot. Failure is reported and the slot recycled;
    /// the application's own submission is unaffected.
    fn submit_aux(&mut self, slot: AuxSlot) -> bool {
        match self
            .device
            .queue_submit(self.queue, &[slot.command_buffer], slot.fence)
        {
            Ok(()) => true,
            Err(e) => {
                if !self.abort.check(e, "auxiliary submission") {
                    warn!(queue = ?self.queue, error = ?e, "auxiliary submission failed");
                }
                self.aux.release(slot);
                false
            }
        }
    }

    /// An empty auxiliary submission whose only job is its fence.
    fn submit_fence_only(&mut self) -> Option<AuxSlot> {
        let slot = match self.aux.acquire() {
            Ok(Some(slot)) => slot,
            Ok(None) => return None,
            Err(e) => {
                self.abort.check(e, "fence-only submission");
                return None;
            }
        };
        let recorded = self
            .device
            .begin_command_buffer(slot.command_buffer)
            .and_then(|()| self.device.end_command_buffer(slot.command_buffer));
        if let Err(e) = recorded {
            self.aux.release(slot);
            self.abort.check(e, "fence-only submission");
            return None;
        }
        if self.submit_aux(slot) {
            Some(slot)
        } else {
            None
        }
    }

    fn idle_fallback(&self) -> SyncPoint {
        warn!(queue = ?self.queue, "no fence available for submission, waiting for device idle");
        if let Err(e) = self.device.device_wait_idle() {
            self.abort.check(e, "device wait idle");
        }
        SyncPoint::Complete
    }

    // ── Retirement ──────────────────────────────────────────

    /// Pop every submission whose sync point has passed, oldest first.
    /// With `wait`, block on each fence up to the retire timeout; without,
    /// stop at the first one still pending.
    pub(crate) fn take_completed(&mut self, wait: bool) -> Vec<CompletedSubmission> {
        let mut done = Vec::new();
        while let Some(front) = self.in_flight.front() {
            let passed = match front.sync {
                SyncPoint::Complete => true,
                SyncPoint::Fence(fence) => self.fence_passed(fence, wait),
            };
            if !passed {
                break;
            }
            let Some(entry) = self.in_flight.pop_front() else {
                break;
            };
            for slot in entry.aux {
                self.aux.release(slot);
            }
            self.completed_seq = entry.seq;
            done.push(CompletedSubmission {
                seq: entry.seq,
                command_buffers: entry.command_buffers,
            });
        }
        if self.in_flight.is_empty() && !done.is_empty() {
            self.pool.return_all();
        }
        done
    }

    fn fence_passed(&self, fence: vk::Fence, wait: bool) -> bool {
        let result = if wait {
            self.device.wait_for_fence(fence, self.retire_timeout_ns).map(|()| true)
        } else {
            self.device.fence_status(fence)
        };
        match result {
            Ok(passed) => passed,
            Err(vk::Result::TIMEOUT) => {
                warn!(queue = ?self.queue, timeout_ns = self.retire_timeout_ns, "submission did not complete in time");
                false
            }
            Err(e) => {
                if !self.abort.check(e, "fence wait") {
                    warn!(queue = ?self.queue, error = ?e, "fence wait failed");
                }
                false
            }
        }
    }

    /// Forget everything in flight without decoding. Used at teardown.
    pub(crate) fn destroy(&mut self) {
        self.in_flight.clear();
        self.aux.destroy();
        self.pool.destroy_all();
        self.label_stack.clear();
    }
}
