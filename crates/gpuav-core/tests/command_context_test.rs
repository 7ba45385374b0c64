//! Integration test: CommandContext
//!
//! Drives one context through recording and retirement. Shader work is
//! emulated with the same write discipline instrumented shaders follow.
//!
//! Run with: cargo test --test command_context_test -- --nocapture

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use ash::vk::{self, Handle};

use gpuav_core::command_context::{BindPoint, CommandContext, CompletionCtx, ContextState, DescUpdateCtx};
use gpuav_core::config::GpuAvConfig;
use gpuav_core::decode::{LogContext, RULE_ACTION_OVERFLOW, RULE_BUFFER_OVERFLOW, RULE_UNATTRIBUTED};
use gpuav_core::shared::{DummyBuffer, SharedResources};
use gpuav_core::{AbortSignal, CollectingSink, ErrorDecoder, Finding, HostDevice, MemoryBucket, Severity};
use gpuav_protocol::bindings::{
    ACTION_INDEX, ACTION_INDEX_WORDS, CHECK_INPUT_0, CMD_ERROR_COUNTS, DESCRIPTOR_BITMAP, ERROR_BUFFER, ERROR_LIMIT_SLOT,
};
use gpuav_protocol::output::CAPACITY_MASK;
use gpuav_protocol::record::{ACTION_INDEX_OVERFLOW, DECODER_INDEX_OVERFLOW, DECODER_INDEX_UNASSIGNED, ERROR_RECORD_WORDS};
use gpuav_protocol::{ErrorHeader, ErrorRecord, ErrorWriter, WriteOutcome};

struct Harness {
    host: Arc<HostDevice>,
    ctx: CommandContext,
    abort: AbortSignal,
    sink: CollectingSink,
    truncation: AtomicBool,
}

fn make_harness(config: GpuAvConfig) -> Harness {
    let host = Arc::new(HostDevice::new());
    let shared = Arc::new(SharedResources::new(host.clone()));
    let abort = AbortSignal::new();
    let ctx = CommandContext::new(
        vk::CommandBuffer::from_raw(0xC0FFEE),
        host.clone(),
        shared,
        Arc::new(config),
        abort.clone(),
    );
    Harness {
        host,
        ctx,
        abort,
        sink: CollectingSink::new(),
        truncation: AtomicBool::new(false),
    }
}

fn queue() -> vk::Queue {
    vk::Queue::from_raw(0x51)
}

fn header(group: u8, subcode: u8, action_index: u16, decoder_index: u16) -> ErrorHeader {
    ErrorHeader {
        group,
        subcode,
        shader_id: 7,
        stage_id: 5,
        instruction_offset: 42,
        stage_info: [1, 2, 3],
        action_index,
        decoder_index,
    }
}

/// Write a record the way instrumented shader code would.
fn emit(h: &Harness, counter: usize, header: &ErrorHeader, params: &[u32]) -> WriteOutcome {
    let output = h
        .host
        .buffer_memory(h.ctx.output_buffer().expect("output buffer"))
        .expect("output memory");
    let counts = h
        .host
        .buffer_memory(h.ctx.error_counts_buffer().expect("count buffer"))
        .expect("count memory");
    ErrorWriter::new(output.words(), counts.words(), 6).write(counter, header, params)
}

fn retire(h: &mut Harness, inherited: &[String]) -> gpuav_core::DecodeReport {
    h.ctx
        .retire(queue(), inherited, &h.sink, &h.truncation)
        .expect("decode report")
}

fn index_block(h: &Harness, set: vk::DescriptorSet) -> Vec<u32> {
    let write = h.host.descriptor_write(set, ACTION_INDEX).expect("action index bound");
    let words = h.host.read_buffer_words(write.buffer);
    let base = (write.offset / 4) as usize;
    words[base..base + ACTION_INDEX_WORDS].to_vec()
}

fn claim_group_9(record: &ErrorRecord<'_>, _log: &LogContext<'_>) -> Option<Finding> {
    (record.group().0 == 9).then(|| Finding::error("TEST-group-9", format!("param {}", record.param(0))))
}

fn claim_group_3_first(record: &ErrorRecord<'_>, _log: &LogContext<'_>) -> Option<Finding> {
    (record.group().0 == 3).then(|| Finding::error("TEST-first", "first"))
}

fn claim_group_3_second(record: &ErrorRecord<'_>, _log: &LogContext<'_>) -> Option<Finding> {
    (record.group().0 == 3).then(|| Finding::error("TEST-second", "second"))
}

fn decline_all(_record: &ErrorRecord<'_>, _log: &LogContext<'_>) -> Option<Finding> {
    None
}

#[test]
fn test_lifecycle_states() {
    let mut h = make_harness(GpuAvConfig::default());
    assert_eq!(h.ctx.state(), ContextState::Reset);
    assert!(h.ctx.is_instrumented());

    h.ctx.begin();
    assert_eq!(h.ctx.state(), ContextState::Recording);
    h.ctx.end();
    assert_eq!(h.ctx.state(), ContextState::Executable);

    let report = retire(&mut h, &[]);
    assert_eq!(report.records, 0);
    assert_eq!(h.ctx.state(), ContextState::Executable);

    h.ctx.reset();
    assert_eq!(h.ctx.state(), ContextState::Reset);

    h.ctx.destroy();
    assert_eq!(h.ctx.state(), ContextState::Destroyed);
    assert!(h.ctx.output_buffer().is_none());
    assert!(h.ctx.retire(queue(), &[], &h.sink, &h.truncation).is_none());
}

#[test]
fn test_output_buffer_header_is_initialised() {
    let config = GpuAvConfig {
        buffers: gpuav_core::config::BufferConfig {
            error_buffer_words: 100,
            ..Default::default()
        },
        ..Default::default()
    };
    let h = make_harness(config);
    let words = h.host.read_buffer_words(h.ctx.output_buffer().expect("output"));
    assert_eq!(words.len(), 102);
    assert_eq!(words[0] & CAPACITY_MASK, 102, "capacity word holds the total length");
    assert_ne!(words[0] >> 24, 0, "enabled checks are advertised in the flags byte");
    assert_eq!(words[1], 0);
}

#[test]
fn test_record_action_binds_instrumentation_set() {
    let mut h = make_harness(GpuAvConfig::default());
    h.ctx.begin();

    let first = h.ctx.record_action(BindPoint::Graphics, "vkCmdDraw").expect("set");
    assert_eq!(index_block(&h, first), vec![0, u32::from(DECODER_INDEX_UNASSIGNED), 0, 6]);

    let decoder = h.ctx.register_decoder(Arc::new(claim_group_9));
    assert_eq!(decoder, 0);
    let second = h.ctx.record_action(BindPoint::Compute, "vkCmdDispatch").expect("set");
    assert_ne!(first, second);
    assert_eq!(index_block(&h, second), vec![1, 0, 1, 6]);

    let output = h.host.descriptor_write(second, ERROR_BUFFER).expect("error buffer bound");
    assert_eq!(Some(output.buffer), h.ctx.output_buffer());
    assert_eq!(output.descriptor_type, vk::DescriptorType::STORAGE_BUFFER);
    let counts = h.host.descriptor_write(second, CMD_ERROR_COUNTS).expect("counts bound");
    assert_eq!(Some(counts.buffer), h.ctx.error_counts_buffer());
    let index = h.host.descriptor_write(second, ACTION_INDEX).expect("index bound");
    assert_eq!(index.descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);

    // Nothing claimed these, so they see the zeroed dummy.
    let bitmap = h.host.descriptor_write(second, DESCRIPTOR_BITMAP).expect("bitmap slot bound");
    let input = h.host.descriptor_write(second, CHECK_INPUT_0).expect("input slot bound");
    assert_eq!(bitmap.buffer, input.buffer);
    assert_eq!(input.range, DummyBuffer::SIZE);

    let actions = h.ctx.actions();
    assert_eq!(actions.len(), 2);
    assert_eq!(actions[1].bind_point_index, 0);
    assert_eq!(actions[1].describe(), "vkCmdDispatch (compute action 0)");
}

#[test]
fn test_desc_update_hook_claims_a_binding() {
    let mut h = make_harness(GpuAvConfig::default());
    h.ctx.begin();
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    h.ctx.on_desc_update(Box::new(move |update: &mut DescUpdateCtx<'_>| {
        counter.fetch_add(1, Ordering::Relaxed);
        let range = update.pool.get_range(MemoryBucket::HostCoherent, 64);
        if !range.is_null() {
            update
                .writes
                .push(range.descriptor_write(CHECK_INPUT_0, vk::DescriptorType::STORAGE_BUFFER));
        }
    }));

    let set = h.ctx.record_action(BindPoint::Graphics, "vkCmdDraw").expect("set");
    h.ctx.record_action(BindPoint::Graphics, "vkCmdDraw").expect("set");
    assert_eq!(seen.load(Ordering::Relaxed), 2);

    let input = h.host.descriptor_write(set, CHECK_INPUT_0).expect("input bound");
    assert_eq!(input.range, 64);
    let bitmap = h.host.descriptor_write(set, DESCRIPTOR_BITMAP).expect("bitmap slot bound");
    assert_ne!(input.buffer, bitmap.buffer);
}

#[test]
fn test_decode_attributes_records_to_actions() {
    let mut h = make_harness(GpuAvConfig::default());
    h.ctx.begin();
    let decoder = h.ctx.register_decoder(Arc::new(claim_group_9));
    h.ctx.record_action(BindPoint::Graphics, "vkCmdDraw").expect("set");
    h.ctx.end();

    assert!(matches!(
        emit(&h, 0, &header(9, 1, 0, decoder), &[77]),
        WriteOutcome::Written { offset: 0 }
    ));
    let report = retire(&mut h, &[]);
    assert_eq!(report.records, 1);
    assert_eq!(report.findings, 1);
    assert!(!report.truncated);

    let found = h.sink.with_rule("TEST-group-9");
    assert_eq!(found.len(), 1, "got {:?}", h.sink.diagnostics());
    let d = &found[0];
    assert_eq!(d.message, "param 77");
    assert_eq!(d.command.as_deref(), Some("vkCmdDraw (graphics action 0)"));
    assert_eq!(d.action_index, Some(0));
    assert_eq!(d.queue, queue());
    let location = d.location.as_deref().unwrap_or_default();
    assert!(location.contains("Stage = Compute"), "location: {location}");
    assert!(location.contains("Shader 7, instruction 42"), "location: {location}");
    println!("{d}");
}

#[test]
fn test_retire_clears_output_and_counters() {
    let mut h = make_harness(GpuAvConfig::default());
    h.ctx.begin();
    h.ctx.record_action(BindPoint::Graphics, "vkCmdDraw").expect("set");
    h.ctx.end();

    emit(&h, 0, &header(9, 1, 0, 0), &[]);
    emit(&h, 0, &header(9, 1, 0, 0), &[]);
    let before = h.host.read_buffer_words(h.ctx.output_buffer().expect("output"));
    assert_eq!(before[1] as usize, 2 * ERROR_RECORD_WORDS);

    retire(&mut h, &[]);
    let after = h.host.read_buffer_words(h.ctx.output_buffer().expect("output"));
    assert_eq!(after[0], before[0], "capacity and flags survive the clear");
    assert!(after[1..].iter().all(|w| *w == 0));
    let counts = h.host.read_buffer_words(h.ctx.error_counts_buffer().expect("counts"));
    assert!(counts.iter().all(|w| *w == 0));
}

#[test]
fn test_unclaimed_record_is_reported() {
    let mut h = make_harness(GpuAvConfig::default());
    h.ctx.begin();
    h.ctx.register_decoder(Arc::new(claim_group_9));
    h.ctx.record_action(BindPoint::Compute, "vkCmdDispatch").expect("set");
    h.ctx.end();

    emit(&h, 0, &header(42, 3, 0, 0), &[]);
    let report = retire(&mut h, &[]);
    assert_eq!(report.unattributed, 1);
    let found = h.sink.with_rule(RULE_UNATTRIBUTED);
    assert_eq!(found.len(), 1);
    assert!(found[0].message.contains("group 42"), "message: {}", found[0].message);
    assert_eq!(found[0].severity, Severity::Error);
}

#[test]
fn test_declining_decoder_falls_back_in_registration_order() {
    let mut h = make_harness(GpuAvConfig::default());
    h.ctx.begin();
    let decliner = h.ctx.register_decoder(Arc::new(decline_all));
    h.ctx.register_decoder(Arc::new(claim_group_3_first));
    h.ctx.register_decoder(Arc::new(claim_group_3_second));
    h.ctx.record_action(BindPoint::Graphics, "vkCmdDraw").expect("set");
    h.ctx.end();

    emit(&h, 0, &header(3, 0, 0, decliner), &[]);
    emit(&h, 0, &header(3, 0, 0, DECODER_INDEX_UNASSIGNED), &[]);
    retire(&mut h, &[]);

    assert_eq!(h.sink.with_rule("TEST-first").len(), 2);
    assert!(h.sink.with_rule("TEST-second").is_empty());
}

#[test]
fn test_addressed_decoder_wins_over_earlier_ones() {
    let mut h = make_harness(GpuAvConfig::default());
    h.ctx.begin();
    h.ctx.register_decoder(Arc::new(claim_group_3_first));
    let second = h.ctx.register_decoder(Arc::new(claim_group_3_second));
    h.ctx.record_action(BindPoint::Graphics, "vkCmdDraw").expect("set");
    h.ctx.end();

    emit(&h, 0, &header(3, 0, 0, second), &[]);
    retire(&mut h, &[]);
    assert_eq!(h.sink.with_rule("TEST-second").len(), 1);
    assert!(h.sink.with_rule("TEST-first").is_empty());
}

#[test]
fn test_error_cap_reaches_the_index_block() {
    let mut config = GpuAvConfig::default();
    config.validation.max_errors_per_command = 3;
    let mut h = make_harness(config);
    h.ctx.begin();
    let set = h.ctx.record_action(BindPoint::Compute, "vkCmdDispatch").expect("set");
    assert_eq!(index_block(&h, set)[ERROR_LIMIT_SLOT], 3);
}

#[test]
fn test_actions_past_the_limit_use_overflow_sentinels() {
    let mut config = GpuAvConfig::default();
    config.buffers.max_actions_per_command_buffer = 2;
    let mut h = make_harness(config);
    h.ctx.begin();
    h.ctx.register_decoder(Arc::new(claim_group_9));
    h.ctx.record_action(BindPoint::Graphics, "vkCmdDraw").expect("set");
    h.ctx.record_action(BindPoint::Graphics, "vkCmdDraw").expect("set");
    let third = h.ctx.record_action(BindPoint::Graphics, "vkCmdDraw").expect("set");
    h.ctx.record_action(BindPoint::Graphics, "vkCmdDraw").expect("set");
    h.ctx.end();

    assert_eq!(
        index_block(&h, third),
        vec![u32::from(ACTION_INDEX_OVERFLOW), u32::from(DECODER_INDEX_OVERFLOW), 1, 6]
    );

    // Two records from actions that could not be attributed, one that could.
    emit(&h, 1, &header(9, 1, ACTION_INDEX_OVERFLOW, DECODER_INDEX_OVERFLOW), &[]);
    emit(&h, 1, &header(9, 1, ACTION_INDEX_OVERFLOW, DECODER_INDEX_OVERFLOW), &[]);
    emit(&h, 0, &header(9, 1, 0, 0), &[]);
    let report = retire(&mut h, &[]);
    assert_eq!(report.overflowed, 2);
    assert_eq!(report.findings, 1);

    let overflow = h.sink.with_rule(RULE_ACTION_OVERFLOW);
    assert_eq!(overflow.len(), 1, "one summary per decode pass");
    assert!(overflow[0].message.contains('2'));
    assert!(overflow[0].command.is_none());
}

#[test]
fn test_truncation_is_reported_once() {
    let mut config = GpuAvConfig::default();
    config.buffers.error_buffer_words = (2 * ERROR_RECORD_WORDS) as u32;
    let mut h = make_harness(config);
    h.ctx.begin();
    h.ctx.register_decoder(Arc::new(claim_group_9));
    h.ctx.record_action(BindPoint::Graphics, "vkCmdDraw").expect("set");
    h.ctx.end();

    for _ in 0..2 {
        emit(&h, 0, &header(9, 1, 0, 0), &[]);
    }
    assert_eq!(emit(&h, 0, &header(9, 1, 0, 0), &[]), WriteOutcome::BufferFull);

    let report = retire(&mut h, &[]);
    assert!(report.truncated);
    assert_eq!(report.records, 2);
    assert_eq!(report.attempted_words as usize, 3 * ERROR_RECORD_WORDS);
    assert_eq!(report.walked_words, 2 * ERROR_RECORD_WORDS);

    let warnings = h.sink.with_rule(RULE_BUFFER_OVERFLOW);
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].severity, Severity::Warning);
    assert!(warnings[0].message.contains("error_buffer_words"));

    // Same again: the findings repeat, the warning does not.
    for _ in 0..3 {
        emit(&h, 0, &header(9, 1, 0, 0), &[]);
    }
    assert!(retire(&mut h, &[]).truncated);
    assert_eq!(h.sink.with_rule(RULE_BUFFER_OVERFLOW).len(), 1);
    assert_eq!(h.sink.with_rule("TEST-group-9").len(), 4);
}

#[test]
fn test_per_command_cap_drops_flood() {
    let mut h = make_harness(GpuAvConfig::default());
    h.ctx.begin();
    h.ctx.register_decoder(Arc::new(claim_group_9));
    h.ctx.record_action(BindPoint::Compute, "vkCmdDispatch").expect("set");
    h.ctx.end();

    let outcomes: Vec<WriteOutcome> = (0..10).map(|_| emit(&h, 0, &header(9, 1, 0, 0), &[])).collect();
    assert_eq!(
        outcomes
            .iter()
            .filter(|o| matches!(o, WriteOutcome::Written { .. }))
            .count(),
        6
    );
    let report = retire(&mut h, &[]);
    assert_eq!(report.records, 6);
    assert!(!report.truncated, "capped writes never reserve space");
}

#[test]
fn test_label_regions_follow_actions() {
    let mut h = make_harness(GpuAvConfig::default());
    h.ctx.begin();
    h.ctx.register_decoder(Arc::new(claim_group_9));
    h.ctx.begin_label("frame");
    h.ctx.begin_label("shadows");
    h.ctx.record_action(BindPoint::Graphics, "vkCmdDraw").expect("set");
    h.ctx.end_label();
    h.ctx.record_action(BindPoint::Graphics, "vkCmdDraw").expect("set");
    h.ctx.end_label();
    h.ctx.end();

    emit(&h, 0, &header(9, 1, 0, 0), &[0]);
    emit(&h, 1, &header(9, 1, 1, 0), &[1]);
    retire(&mut h, &["submit-scope".to_string()]);

    let found = h.sink.with_rule("TEST-group-9");
    assert_eq!(found.len(), 2);
    assert_eq!(found[0].label_region.as_deref(), Some("submit-scope::frame::shadows"));
    assert_eq!(found[1].label_region.as_deref(), Some("submit-scope::frame"));
}

#[test]
fn test_registrations_survive_retire_but_not_reset() {
    let mut h = make_harness(GpuAvConfig::default());
    h.ctx.begin();
    h.ctx.register_decoder(Arc::new(claim_group_9));
    let completions = Arc::new(AtomicUsize::new(0));
    let counter = completions.clone();
    h.ctx.on_completion(Box::new(move |_ctx: &CompletionCtx<'_>| {
        counter.fetch_add(1, Ordering::Relaxed);
    }));
    h.ctx.record_action(BindPoint::Graphics, "vkCmdDraw").expect("set");
    h.ctx.end();

    retire(&mut h, &[]);
    retire(&mut h, &[]);
    assert_eq!(completions.load(Ordering::Relaxed), 2);
    assert_eq!(h.ctx.decoders().len(), 1);
    assert_eq!(h.ctx.actions().len(), 1);

    h.ctx.begin();
    assert!(h.ctx.decoders().is_empty());
    assert!(h.ctx.actions().is_empty());
    retire(&mut h, &[]);
    assert_eq!(completions.load(Ordering::Relaxed), 2);
}

#[test]
fn test_reset_rewinds_the_pool() {
    let mut h = make_harness(GpuAvConfig::default());
    h.ctx.begin();
    for _ in 0..4 {
        h.ctx.record_action(BindPoint::Graphics, "vkCmdDraw").expect("set");
    }
    h.ctx.end();
    let blocks = h.ctx.pool().cache(MemoryBucket::HostCoherent).block_buffers();
    let buffers = h.host.live_buffer_count();

    h.ctx.begin();
    assert_eq!(h.ctx.pool().cache(MemoryBucket::HostCoherent).used_bytes(), 0);
    for _ in 0..4 {
        h.ctx.record_action(BindPoint::Graphics, "vkCmdDraw").expect("set");
    }
    assert_eq!(h.ctx.pool().cache(MemoryBucket::HostCoherent).block_buffers(), blocks);
    assert_eq!(h.host.live_buffer_count(), buffers);
    assert_eq!(h.ctx.pool().descriptor_sets().set_count(), 4);
}

#[test]
fn test_destroy_releases_context_buffers() {
    let mut h = make_harness(GpuAvConfig::default());
    h.ctx.begin();
    h.ctx.record_action(BindPoint::Graphics, "vkCmdDraw").expect("set");
    h.ctx.end();
    // Output, counts, one pooled block and the shared dummy.
    assert_eq!(h.host.live_buffer_count(), 4);

    h.ctx.destroy();
    assert_eq!(h.host.live_buffer_count(), 1, "only the shared dummy remains");
}

#[test]
fn test_fixed_buffer_failure_aborts() {
    let host = Arc::new(HostDevice::new());
    host.fail_allocations(true);
    let abort = AbortSignal::new();
    let mut ctx = CommandContext::new(
        vk::CommandBuffer::from_raw(0xBAD),
        host.clone(),
        Arc::new(SharedResources::new(host.clone())),
        Arc::new(GpuAvConfig::default()),
        abort.clone(),
    );
    assert!(abort.is_aborted());
    assert!(!ctx.is_instrumented());
    ctx.begin();
    assert!(ctx.record_action(BindPoint::Graphics, "vkCmdDraw").is_none());
    assert_eq!(ctx.actions().len(), 1, "actions are still counted");
}

struct Never;

impl ErrorDecoder for Never {
    fn decode(&self, _record: &ErrorRecord<'_>, _log: &LogContext<'_>) -> Option<Finding> {
        None
    }
}

#[test]
fn test_decoder_index_is_registration_position() {
    let mut h = make_harness(GpuAvConfig::default());
    h.ctx.begin();
    for expected in 0..5u16 {
        assert_eq!(h.ctx.register_decoder(Arc::new(Never)), expected);
    }
    assert_eq!(h.ctx.decoders().current(), Some(4));
    assert!(!h.abort.is_aborted());
}
