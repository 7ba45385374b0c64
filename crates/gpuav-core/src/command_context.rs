//! Instrumentation state of one command buffer.
//!
//! ```text
//!  Reset ──begin──▶ Recording ──end──▶ Executable ──submit──▶ Submitted
//!    ▲                  ▲                  ▲                      │
//!    └──────reset───────┴──────begin───────┴───── retire ◀────────┘
//!                                                (Retiring)
//! ```
//!
//! Registrations (decoders and hooks) survive retirement so a command buffer
//! can be submitted again without being re-recorded; they are dropped when
//! the command buffer is reset or recorded anew.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ash::vk;
use tracing::{debug, warn};

use gpuav_protocol::bindings::{
    ACTION_INDEX, ACTION_INDEX_SLOT, ACTION_INDEX_WORDS, CMD_ERROR_COUNTS, DECODER_INDEX_SLOT, ERROR_BUFFER,
    ERROR_COUNTER_SLOT, ERROR_LIMIT_SLOT, INSTRUMENTATION_BINDINGS,
};
use gpuav_protocol::output::{clear_records, init_output, total_words, OutputFlags, MAX_CAPACITY_WORDS, OUTPUT_HEADER_WORDS};
use gpuav_protocol::record::{
    ACTION_INDEX_OVERFLOW, DECODER_INDEX_OVERFLOW, DECODER_INDEX_UNASSIGNED, ERROR_RECORD_WORDS,
};

use crate::config::GpuAvConfig;
use crate::decode::{decode_error_output, truncation_diagnostic, DecodeReport, DecoderRegistry, ErrorDecoder, LogContext};
use crate::device::{BufferWrite, DeviceBuffer, GpuDevice, MemoryBucket};
use crate::diagnostics::DiagnosticSink;
use crate::error::AbortSignal;
use crate::resource_pool::ResourcePool;
use crate::shared::{DummyBuffer, InstrumentationLayout, SharedResources};

// ── Action log ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindPoint {
    Graphics,
    Compute,
    RayTracing,
}

impl BindPoint {
    pub fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            BindPoint::Graphics => "graphics",
            BindPoint::Compute => "compute",
            BindPoint::RayTracing => "ray tracing",
        }
    }
}

/// One checked draw, dispatch or trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRecord {
    /// Position among all actions of the command buffer.
    pub index: u32,
    pub bind_point: BindPoint,
    /// Position among actions of the same bind point.
    pub bind_point_index: u32,
    pub command: String,
    /// Values written into the action's index block.
    pub action_index: u16,
    pub decoder_index: u16,
}

impl ActionRecord {
    pub fn describe(&self) -> String {
        format!("{} ({} action {})", self.command, self.bind_point.name(), self.bind_point_index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LabelCommand {
    Begin { position: u32, name: String },
    End { position: u32 },
}

impl LabelCommand {
    /// Number of actions recorded before the label command.
    pub fn position(&self) -> u32 {
        match self {
            LabelCommand::Begin { position, .. } | LabelCommand::End { position } => *position,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Reset,
    Recording,
    Executable,
    Submitted,
    Retiring,
    Destroyed,
}

// ── Hooks ───────────────────────────────────────────────────

/// Passed to hooks that run for every action.
pub struct DescUpdateCtx<'a> {
    pub device: &'a dyn GpuDevice,
    pub action: &'a ActionRecord,
    pub set: vk::DescriptorSet,
    /// Writes applied to `set` once all hooks ran.
    pub writes: &'a mut Vec<BufferWrite>,
    pub pool: &'a mut ResourcePool,
}

/// Passed to hooks that record auxiliary work around a submission.
pub struct SubmitCtx<'a> {
    pub device: &'a dyn GpuDevice,
    pub queue: vk::Queue,
    /// The auxiliary command buffer being recorded.
    pub command_buffer: vk::CommandBuffer,
    /// The application command buffer the work belongs to.
    pub target: vk::CommandBuffer,
    pub queue_pool: &'a mut ResourcePool,
}

pub struct CompletionCtx<'a> {
    pub device: &'a dyn GpuDevice,
    pub log: &'a LogContext<'a>,
    pub sink: &'a dyn DiagnosticSink,
}

pub type DescUpdateHook = Box<dyn Fn(&mut DescUpdateCtx<'_>) + Send + Sync>;
pub type SubmitHook = Box<dyn Fn(&mut SubmitCtx<'_>) + Send + Sync>;
pub type CompletionHook = Box<dyn Fn(&CompletionCtx<'_>) + Send + Sync>;

// ── Context ─────────────────────────────────────────────────

struct FixedBuffers {
    output: DeviceBuffer,
    error_counts: DeviceBuffer,
}

pub struct CommandContext {
    command_buffer: vk::CommandBuffer,
    device: Arc<dyn GpuDevice>,
    shared: Arc<SharedResources>,
    config: Arc<GpuAvConfig>,
    abort: AbortSignal,
    state: ContextState,
    pool: ResourcePool,
    fixed: Option<FixedBuffers>,
    layout: Option<Arc<InstrumentationLayout>>,
    decoders: DecoderRegistry,
    desc_update_hooks: Vec<DescUpdateHook>,
    pre_submit_hooks: Vec<SubmitHook>,
    post_submit_hooks: Vec<SubmitHook>,
    completion_hooks: Vec<CompletionHook>,
    actions: Vec<ActionRecord>,
    labels: Vec<LabelCommand>,
    bind_point_counts: [u32; 3],
    submit_count: u64,
}

impl CommandContext {
    pub fn new(
        command_buffer: vk::CommandBuffer,
        device: Arc<dyn GpuDevice>,
        shared: Arc<SharedResources>,
        config: Arc<GpuAvConfig>,
        abort: AbortSignal,
    ) -> Self {
        let pool = ResourcePool::new(device.clone(), &config.buffers, abort.clone());
        let mut ctx = Self {
            command_buffer,
            device,
            shared,
            config,
            abort,
            state: ContextState::Reset,
            pool,
            fixed: None,
            layout: None,
            decoders: DecoderRegistry::new(),
            desc_update_hooks: Vec::new(),
            pre_submit_hooks: Vec::new(),
            post_submit_hooks: Vec::new(),
            completion_hooks: Vec::new(),
            actions: Vec::new(),
            labels: Vec::new(),
            bind_point_counts: [0; 3],
            submit_count: 0,
        };
        ctx.acquire_fixed();
        ctx
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Whether the fixed instrumentation buffers exist.
    pub fn is_instrumented(&self) -> bool {
        self.fixed.is_some() && self.layout.is_some()
    }

    pub fn output_buffer(&self) -> Option<vk::Buffer> {
        self.fixed.as_ref().map(|f| f.output.buffer)
    }

    pub fn error_counts_buffer(&self) -> Option<vk::Buffer> {
        self.fixed.as_ref().map(|f| f.error_counts.buffer)
    }

    pub fn instrumentation_set_index(&self) -> u32 {
        self.config.submission.instrumentation_set_index
    }

    pub fn decoders(&self) -> &DecoderRegistry {
        &self.decoders
    }

    pub fn actions(&self) -> &[ActionRecord] {
        &self.actions
    }

    pub fn labels(&self) -> &[LabelCommand] {
        &self.labels
    }

    pub fn pool(&self) -> &ResourcePool {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut ResourcePool {
        &mut self.pool
    }

    pub fn submit_count(&self) -> u64 {
        self.submit_count
    }

    pub fn max_actions(&self) -> u32 {
        self.config
            .buffers
            .max_actions_per_command_buffer
            .clamp(1, u32::from(ACTION_INDEX_OVERFLOW))
    }

    // ── Registration ────────────────────────────────────────

    pub fn register_decoder(&mut self, decoder: Arc<dyn ErrorDecoder>) -> u16 {
        let index = self.decoders.register(decoder);
        if index == DECODER_INDEX_OVERFLOW {
            warn!(command_buffer = ?self.command_buffer, "decoder index space exhausted");
        }
        index
    }

    pub fn on_desc_update(&mut self, hook: DescUpdateHook) {
        self.desc_update_hooks.push(hook);
    }

    pub fn on_pre_submit(&mut self, hook: SubmitHook) {
        self.pre_submit_hooks.push(hook);
    }

    pub fn on_post_submit(&mut self, hook: SubmitHook) {
        self.post_submit_hooks.push(hook);
    }

    pub fn on_completion(&mut self, hook: CompletionHook) {
        self.completion_hooks.push(hook);
    }

    pub fn has_pre_submit_work(&self) -> bool {
        !self.pre_submit_hooks.is_empty()
    }

    pub fn has_post_submit_work(&self) -> bool {
        !self.post_submit_hooks.is_empty()
    }

    // ── Lifecycle ───────────────────────────────────────────

    pub fn begin(&mut self) {
        match self.state {
            ContextState::Destroyed => {
                debug_assert!(false, "begin on a destroyed command context");
                return;
            }
            ContextState::Submitted | ContextState::Retiring => {
                warn!(command_buffer = ?self.command_buffer, "command buffer re-recorded while in flight");
            }
            _ => {}
        }
        self.reset_instrumentation();
        self.state = ContextState::Recording;
    }

    pub fn end(&mut self) {
        debug_assert_eq!(self.state, ContextState::Recording, "end without begin");
        if self.state == ContextState::Recording {
            self.state = ContextState::Executable;
        }
    }

    pub fn reset(&mut self) {
        if self.state == ContextState::Destroyed {
            return;
        }
        self.reset_instrumentation();
        self.state = ContextState::Reset;
    }

    pub(crate) fn mark_submitted(&mut self) {
        if self.state == ContextState::Recording {
            warn!(command_buffer = ?self.command_buffer, "submitted while still recording");
        }
        self.state = ContextState::Submitted;
        self.submit_count += 1;
    }

    /// Drop every registration, rewind the pool, and make sure the fixed
    /// buffers exist and are clean.
    fn reset_instrumentation(&mut self) {
        self.decoders.clear();
        self.desc_update_hooks.clear();
        self.pre_submit_hooks.clear();
        self.post_submit_hooks.clear();
        self.completion_hooks.clear();
        self.actions.clear();
        self.labels.clear();
        self.bind_point_counts = [0; 3];
        self.pool.return_all();
        self.acquire_fixed();
        self.clear_fixed();
        debug!(command_buffer = ?self.command_buffer, "command context reset");
    }

    fn acquire_fixed(&mut self) {
        if self.abort.is_aborted() {
            return;
        }
        if self.layout.is_none() {
            match self.shared.get_or_create(InstrumentationLayout::create) {
                Ok(layout) => self.layout = Some(layout),
                Err(e) => {
                    self.abort.trigger(&format!("instrumentation descriptor set layout: {e:?}"));
                    return;
                }
            }
        }
        if self.fixed.is_some() {
            return;
        }

        let capacity = (self.config.buffers.error_buffer_words as usize)
            .clamp(ERROR_RECORD_WORDS, MAX_CAPACITY_WORDS - OUTPUT_HEADER_WORDS);
        let output = match self
            .device
            .create_buffer((total_words(capacity) * 4) as u64, MemoryBucket::HostCached)
        {
            Ok(b) => b,
            Err(e) => {
                self.abort.trigger(&format!("error output buffer: {e:?}"));
                return;
            }
        };
        let error_counts = match self
            .device
            .create_buffer(u64::from(self.max_actions()) * 4, MemoryBucket::HostCoherent)
        {
            Ok(b) => b,
            Err(e) => {
                self.device.destroy_buffer(&output);
                self.abort.trigger(&format!("error count buffer: {e:?}"));
                return;
            }
        };

        // SAFETY: both buffers were just created and stay mapped until destroy.
        let initialised = unsafe { output.atomic_words() }
            .map(|words| init_output(words, self.output_flags()).is_ok())
            .unwrap_or(false);
        if !initialised {
            self.device.destroy_buffer(&output);
            self.device.destroy_buffer(&error_counts);
            self.abort.trigger("error output buffer is not host visible");
            return;
        }
        debug!(
            command_buffer = ?self.command_buffer,
            capacity_words = capacity,
            counters = self.max_actions(),
            "fixed instrumentation buffers created"
        );
        self.fixed = Some(FixedBuffers { output, error_counts });
    }

    fn output_flags(&self) -> OutputFlags {
        let mut flags = OutputFlags::empty();
        if self.config.validation.descriptor_checks {
            flags |= OutputFlags::DESCRIPTOR_CHECKS;
        }
        if self.config.validation.debug_printf {
            flags |= OutputFlags::DEBUG_PRINTF;
        }
        flags
    }

    /// Zero the record region, the attempted count and every error counter.
    /// The capacity/flags word is kept.
    fn clear_fixed(&self) {
        let Some(fixed) = &self.fixed else {
            return;
        };
        // SAFETY: fixed buffers stay mapped until destroy.
        if let Some(words) = unsafe { fixed.output.atomic_words() } {
            clear_records(words);
        }
        if let Some(words) = unsafe { fixed.error_counts.atomic_words() } {
            for w in words {
                w.store(0, Ordering::Relaxed);
            }
        }
        if let Err(e) = self.device.flush(&fixed.output, 0, vk::WHOLE_SIZE) {
            self.abort.check(e, "error output flush");
        }
    }

    // ── Recording ───────────────────────────────────────────

    /// Note a checked action and prepare the instrumentation descriptor set
    /// it must bind. `None` means the action runs uninstrumented.
    pub fn record_action(&mut self, bind_point: BindPoint, command: &str) -> Option<vk::DescriptorSet> {
        debug_assert_eq!(self.state, ContextState::Recording, "action recorded outside begin/end");

        let index = self.actions.len() as u32;
        let bind_point_index = self.bind_point_counts[bind_point.index()];
        self.bind_point_counts[bind_point.index()] += 1;

        let max_actions = self.max_actions();
        let overflow = index >= max_actions;
        let action_index = if overflow { ACTION_INDEX_OVERFLOW } else { index as u16 };
        let decoder_index = if overflow {
            DECODER_INDEX_OVERFLOW
        } else {
            self.decoders.current().unwrap_or(DECODER_INDEX_UNASSIGNED)
        };
        if index == max_actions {
            warn!(
                command_buffer = ?self.command_buffer,
                max_actions,
                "too many actions to attribute errors individually"
            );
        }
        self.actions.push(ActionRecord {
            index,
            bind_point,
            bind_point_index,
            command: command.to_string(),
            action_index,
            decoder_index,
        });

        if self.abort.is_aborted() {
            return None;
        }
        let layout = self.layout.clone()?;
        let fixed = self.fixed.as_ref()?;

        let set = self.pool.get_descriptor_set(&layout.layout)?;
        let index_block = self
            .pool
            .get_range(MemoryBucket::HostCoherent, (ACTION_INDEX_WORDS * 4) as u64);
        if index_block.is_null() {
            return None;
        }
        let mut block = [0u32; ACTION_INDEX_WORDS];
        block[ACTION_INDEX_SLOT] = u32::from(action_index);
        block[DECODER_INDEX_SLOT] = u32::from(decoder_index);
        block[ERROR_COUNTER_SLOT] = index.min(max_actions - 1);
        block[ERROR_LIMIT_SLOT] = self.config.validation.max_errors_per_command;
        // SAFETY: the range was just handed out by our own pool and no device
        // work can be reading it while we record.
        unsafe { index_block.write_pod(0, &block) };

        let mut writes = vec![
            BufferWrite {
                binding: ERROR_BUFFER,
                descriptor_type: layout.descriptor_type(ERROR_BUFFER),
                buffer: fixed.output.buffer,
                offset: 0,
                range: fixed.output.size,
            },
            index_block.descriptor_write(ACTION_INDEX, layout.descriptor_type(ACTION_INDEX)),
            BufferWrite {
                binding: CMD_ERROR_COUNTS,
                descriptor_type: layout.descriptor_type(CMD_ERROR_COUNTS),
                buffer: fixed.error_counts.buffer,
                offset: 0,
                range: fixed.error_counts.size,
            },
        ];

        let action = &self.actions[index as usize];
        for hook in &self.desc_update_hooks {
            hook(&mut DescUpdateCtx {
                device: self.device.as_ref(),
                action,
                set: set.set,
                writes: &mut writes,
                pool: &mut self.pool,
            });
        }

        let dummy = match self.shared.get_or_create(DummyBuffer::create) {
            Ok(d) => d,
            Err(e) => {
                if !self.abort.check(e, "dummy buffer") {
                    warn!(error = ?e, "dummy buffer allocation failed, action left uninstrumented");
                }
                return None;
            }
        };
        for slot in INSTRUMENTATION_BINDINGS.iter() {
            if !writes.iter().any(|w| w.binding == slot.binding) {
                writes.push(BufferWrite {
                    binding: slot.binding,
                    descriptor_type: layout.descriptor_type(slot.binding),
                    buffer: dummy.buffer.buffer,
                    offset: 0,
                    range: DummyBuffer::SIZE,
                });
            }
        }
        self.device.write_buffer_descriptors(set.set, &writes);
        Some(set.set)
    }

    pub fn begin_label(&mut self, name: &str) {
        self.labels.push(LabelCommand::Begin {
            position: self.actions.len() as u32,
            name: name.to_string(),
        });
    }

    pub fn end_label(&mut self) {
        self.labels.push(LabelCommand::End {
            position: self.actions.len() as u32,
        });
    }

    // ── Submission ──────────────────────────────────────────

    pub fn record_pre_submit(&self, ctx: &mut SubmitCtx<'_>) {
        for hook in &self.pre_submit_hooks {
            hook(ctx);
        }
    }

    pub fn record_post_submit(&self, ctx: &mut SubmitCtx<'_>) {
        for hook in &self.post_submit_hooks {
            hook(ctx);
        }
    }

    /// Decode what the device wrote, run completion hooks, and clean the
    /// buffers for the next submission. Only call once the submission's
    /// fences have signalled.
    pub fn retire(
        &mut self,
        queue: vk::Queue,
        inherited_labels: &[String],
        sink: &dyn DiagnosticSink,
        truncation_reported: &AtomicBool,
    ) -> Option<DecodeReport> {
        if self.state == ContextState::Destroyed {
            return None;
        }
        self.state = ContextState::Retiring;

        let report = {
            let log = LogContext {
                queue,
                command_buffer: self.command_buffer,
                actions: &self.actions,
                labels: &self.labels,
                inherited_labels,
            };
            let report = self.decode_output(&log, sink, truncation_reported);
            let completion = CompletionCtx {
                device: self.device.as_ref(),
                log: &log,
                sink,
            };
            for hook in &self.completion_hooks {
                hook(&completion);
            }
            report
        };

        self.clear_fixed();
        self.state = ContextState::Executable;
        report
    }

    fn decode_output(
        &self,
        log: &LogContext<'_>,
        sink: &dyn DiagnosticSink,
        truncation_reported: &AtomicBool,
    ) -> Option<DecodeReport> {
        let fixed = self.fixed.as_ref()?;
        if let Err(e) = self.device.invalidate(&fixed.output, 0, vk::WHOLE_SIZE) {
            self.abort.check(e, "error output invalidate");
            return None;
        }
        // SAFETY: fixed buffers stay mapped until destroy, and the caller
        // waited for the device to finish writing.
        let words: Vec<u32> = unsafe { fixed.output.atomic_words() }?
            .iter()
            .map(|w| w.load(Ordering::Acquire))
            .collect();
        match decode_error_output(&words, &self.decoders, log, sink) {
            Ok(report) => {
                if report.truncated && !truncation_reported.swap(true, Ordering::AcqRel) {
                    warn!(
                        attempted = report.attempted_words,
                        capacity = report.capacity_words,
                        "error output buffer overflowed"
                    );
                    sink.emit(&truncation_diagnostic(&report, log));
                }
                Some(report)
            }
            Err(e) => {
                warn!(error = %e, command_buffer = ?self.command_buffer, "error output unreadable");
                None
            }
        }
    }

    /// Release everything this context owns.
    pub fn destroy(&mut self) {
        if self.state == ContextState::Destroyed {
            return;
        }
        self.pool.destroy_all();
        if let Some(fixed) = self.fixed.take() {
            self.device.destroy_buffer(&fixed.output);
            self.device.destroy_buffer(&fixed.error_counts);
        }
        self.decoders.clear();
        self.desc_update_hooks.clear();
        self.pre_submit_hooks.clear();
        self.post_submit_hooks.clear();
        self.completion_hooks.clear();
        self.actions.clear();
        self.labels.clear();
        self.state = ContextState::Destroyed;
        debug!(command_buffer = ?self.command_buffer, "command context destroyed");
    }
}
