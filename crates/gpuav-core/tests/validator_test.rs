//! Integration test: Validator
//!
//! Full submission protocol against the in-process device: auxiliary work
//! ordering, retirement, the exemplar checks, debug printf and the failure
//! paths.
//!
//! Run with: cargo test --test validator_test -- --nocapture

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use ash::vk::{self, Handle};
use parking_lot::Mutex;

use gpuav_core::checks::descriptor_indexing::{SUBCODE_DESTROYED, SUBCODE_INDEX_OOB};
use gpuav_core::command_context::SubmitCtx;
use gpuav_core::decode::RULE_BUFFER_OVERFLOW;
use gpuav_core::printf::RULE_DEBUG_PRINTF;
use gpuav_core::{
    BindPoint, CollectingSink, DescriptorId, GpuAvConfig, GpuDevice, HostDevice, MemoryBucket, ResourceKind, Severity,
    Submission, Validator,
};
use gpuav_protocol::bindings::DESCRIPTOR_BITMAP;
use gpuav_protocol::record::{ErrorGroup, ERROR_RECORD_WORDS};
use gpuav_protocol::{ErrorHeader, ErrorWriter};

/// Decoder indices installed by `on_command_buffer_begin` with every check on.
const PRINTF_DECODER: u16 = 0;
const DESCRIPTOR_DECODER: u16 = 1;

struct Fixture {
    host: Arc<HostDevice>,
    sink: Arc<CollectingSink>,
    validator: Validator,
    queue: vk::Queue,
}

fn make_fixture(config: GpuAvConfig) -> Fixture {
    gpuav_common::try_init_logging();
    let host = Arc::new(HostDevice::new());
    let sink = Arc::new(CollectingSink::new());
    let validator = Validator::new(host.clone(), config, sink.clone());
    let queue = host.create_queue(0);
    Fixture {
        host,
        sink,
        validator,
        queue,
    }
}

fn command_buffer(n: u64) -> vk::CommandBuffer {
    vk::CommandBuffer::from_raw(0xA000 + n)
}

/// Record one action on `cb` and leave it executable.
fn record_draw(f: &Fixture, cb: vk::CommandBuffer) -> vk::DescriptorSet {
    f.validator.on_command_buffer_allocated(cb);
    f.validator.on_command_buffer_begin(cb);
    let set = f
        .validator
        .record_action(cb, BindPoint::Graphics, "vkCmdDraw")
        .expect("instrumentation set");
    f.validator.on_command_buffer_end(cb);
    set
}

/// Make `cb` write `header` + `params` every time it executes, like an
/// instrumented shader would.
fn shader_writes(f: &Fixture, cb: vk::CommandBuffer, header: ErrorHeader, params: Vec<u32>) {
    let ctx = f.validator.context(cb).expect("context");
    let (output, counts) = {
        let ctx = ctx.lock();
        (
            ctx.output_buffer().expect("output buffer"),
            ctx.error_counts_buffer().expect("count buffer"),
        )
    };
    let output = f.host.buffer_memory(output).expect("output memory");
    let counts = f.host.buffer_memory(counts).expect("count memory");
    let cap = f.validator.config().validation.max_errors_per_command;
    f.host.record_host_callback(
        cb,
        Arc::new(move |_device: &HostDevice| {
            ErrorWriter::new(output.words(), counts.words(), cap).write(
                usize::from(header.action_index),
                &header,
                &params,
            );
        }),
    );
}

fn record_header(group: ErrorGroup, subcode: u8, action_index: u16, decoder_index: u16) -> ErrorHeader {
    ErrorHeader {
        group: group.0,
        subcode,
        shader_id: 7,
        stage_id: 4,
        instruction_offset: 100,
        stage_info: [0.5f32.to_bits(), 1.5f32.to_bits(), 0],
        action_index,
        decoder_index,
    }
}

fn submit(f: &Fixture, queue: vk::Queue, cbs: &[vk::CommandBuffer]) -> ash::prelude::VkResult<()> {
    let host = f.host.clone();
    let batch = cbs.to_vec();
    f.validator
        .queue_submit(queue, &[Submission::new(cbs.to_vec())], move || {
            host.queue_submit(queue, &batch, vk::Fence::null())
        })
}

#[test]
fn test_aux_work_surrounds_application_work() {
    let f = make_fixture(GpuAvConfig::default());
    let cb = command_buffer(1);
    record_draw(&f, cb);

    // The pre hook uploads a value; the application reads it; the post hook
    // overwrites it.
    let scratch = f
        .host
        .create_buffer(16, MemoryBucket::HostCoherent)
        .expect("scratch buffer");
    let target = scratch.buffer;
    {
        let ctx = f.validator.context(cb).expect("context");
        let mut ctx = ctx.lock();
        ctx.on_pre_submit(Box::new(move |s: &mut SubmitCtx<'_>| {
            s.device.cmd_update_buffer(s.command_buffer, target, 0, &5u32.to_le_bytes());
            s.device.cmd_shader_barrier(s.command_buffer);
        }));
        ctx.on_post_submit(Box::new(move |s: &mut SubmitCtx<'_>| {
            s.device.cmd_fill_buffer(s.command_buffer, target, 0, 4, 9);
        }));
    }
    let observed = Arc::new(AtomicU32::new(0));
    let seen = observed.clone();
    f.host.record_host_callback(
        cb,
        Arc::new(move |device: &HostDevice| {
            seen.store(device.read_buffer_words(target)[0], Ordering::SeqCst);
        }),
    );

    submit(&f, f.queue, &[cb]).expect("submit");

    assert_eq!(observed.load(Ordering::SeqCst), 5, "pre-submit work ran first");
    assert_eq!(f.host.read_buffer_words(target)[0], 9, "post-submit work ran last");

    let log = f.host.submissions();
    assert_eq!(log.len(), 3, "got {:?}", log);
    assert_ne!(log[0].command_buffers, vec![cb]);
    assert_ne!(log[0].fence, vk::Fence::null());
    assert_eq!(log[1].command_buffers, vec![cb]);
    assert_ne!(log[2].command_buffers, vec![cb]);
    assert_ne!(log[2].fence, vk::Fence::null());
}

#[test]
fn test_every_batch_gets_a_fence() {
    let f = make_fixture(GpuAvConfig::default());
    let cb = command_buffer(1);
    record_draw(&f, cb);

    submit(&f, f.queue, &[cb]).expect("submit");
    let log = f.host.submissions();
    assert_eq!(log.len(), 2, "application batch plus a fence-only submission");
    assert_eq!(log[0].command_buffers, vec![cb]);
    assert_ne!(log[1].fence, vk::Fence::null());

    let state = f.validator.queue(f.queue).expect("queue state");
    assert_eq!(state.lock().in_flight_len(), 1);
    assert_eq!(f.validator.retire(f.queue), 1);
    let state = state.lock();
    assert_eq!(state.in_flight_len(), 0);
    assert_eq!(state.completed_seq(), state.submitted_seq());
    assert_eq!(state.aux_pool().created(), 1);
}

#[test]
fn test_descriptor_index_out_of_bounds_is_reported() {
    let f = make_fixture(GpuAvConfig::default());
    let cb = command_buffer(1);
    let set = record_draw(&f, cb);

    let (bitmap, _) = f.validator.heap().bitmap_binding().expect("heap bitmap");
    let bound = f.host.descriptor_write(set, DESCRIPTOR_BITMAP).expect("bitmap bound");
    assert_eq!(bound.buffer, bitmap);

    shader_writes(
        &f,
        cb,
        record_header(ErrorGroup::DESCRIPTOR_INDEXING, SUBCODE_INDEX_OOB, 0, DESCRIPTOR_DECODER),
        vec![0, 3, 12, 8],
    );
    submit(&f, f.queue, &[cb]).expect("submit");
    assert!(f.sink.diagnostics().is_empty(), "nothing is decoded before retirement");
    f.validator.retire(f.queue);

    let found = f.sink.with_rule("VUID-vkCmdDraw-None-10068");
    assert_eq!(found.len(), 1, "got {:?}", f.sink.diagnostics());
    assert!(found[0]
        .message
        .contains("(set = 0, binding = 3) Index of 12 used to index descriptor array of length 8."));
    assert!(found[0]
        .location
        .as_deref()
        .is_some_and(|l| l.contains("Fragment coord (x, y) = (0.5, 1.5)")));
    println!("{}", found[0]);
}

#[test]
fn test_destroyed_descriptor_is_reported() {
    let f = make_fixture(GpuAvConfig::default());
    let first = f.validator.on_resource_created(ResourceKind::ImageView, 0x100);
    assert_eq!(first, DescriptorId(1));
    f.validator.on_resource_destroyed(ResourceKind::ImageView, 0x100);
    assert!(f.validator.descriptor_id(ResourceKind::ImageView, 0x100).is_null());
    let second = f.validator.on_resource_created(ResourceKind::Sampler, 0x200);
    assert_eq!(second, DescriptorId(2), "freed ids are not reused right away");

    let cb = command_buffer(1);
    record_draw(&f, cb);
    shader_writes(
        &f,
        cb,
        record_header(ErrorGroup::DESCRIPTOR_INDEXING, SUBCODE_DESTROYED, 0, DESCRIPTOR_DECODER),
        vec![1, 0, 4, first.get()],
    );
    submit(&f, f.queue, &[cb]).expect("submit");
    f.validator.retire(f.queue);

    let found = f.sink.with_rule("VUID-vkCmdDraw-None-08114");
    assert_eq!(found.len(), 1, "got {:?}", f.sink.diagnostics());
    assert!(found[0].message.contains("destroyed resource (descriptor id 1)"));
    assert!(!found[0].message.contains("reused"));
}

#[test]
fn test_debug_printf_end_to_end() {
    let f = make_fixture(GpuAvConfig::default());
    f.validator
        .register_printf_strings(7, &[(0, "count=%u vec=%v3f")])
        .expect("format parses");

    let cb = command_buffer(1);
    record_draw(&f, cb);
    let params = vec![
        0,
        0,
        0,
        0,
        5,
        1.0f32.to_bits(),
        2.0f32.to_bits(),
        3.0f32.to_bits(),
    ];
    shader_writes(&f, cb, record_header(ErrorGroup::DEBUG_PRINTF, 0, 0, PRINTF_DECODER), params);
    // A string the table has never seen.
    shader_writes(
        &f,
        cb,
        record_header(ErrorGroup::DEBUG_PRINTF, 0, 0, PRINTF_DECODER),
        vec![9, 0, 0, 0],
    );
    submit(&f, f.queue, &[cb]).expect("submit");
    f.validator.retire(f.queue);

    let printed = f.sink.with_rule(RULE_DEBUG_PRINTF);
    assert_eq!(printed.len(), 1, "got {:?}", f.sink.diagnostics());
    assert_eq!(printed[0].message, "count=5 vec=1.000000, 2.000000, 3.000000");
    assert_eq!(printed[0].severity, Severity::Info);

    let failed: Vec<_> = f
        .sink
        .diagnostics()
        .into_iter()
        .filter(|d| d.severity == Severity::Warning)
        .collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].message.contains("unknown format string 9"));
}

#[test]
fn test_resubmission_decodes_again() {
    let f = make_fixture(GpuAvConfig::default());
    let cb = command_buffer(1);
    record_draw(&f, cb);
    shader_writes(
        &f,
        cb,
        record_header(ErrorGroup::DESCRIPTOR_INDEXING, SUBCODE_INDEX_OOB, 0, DESCRIPTOR_DECODER),
        vec![0, 0, 2, 1],
    );

    for round in 1..=3 {
        submit(&f, f.queue, &[cb]).expect("submit");
        assert_eq!(f.validator.poll(f.queue), 1);
        assert_eq!(f.sink.with_rule("VUID-vkCmdDraw-None-10068").len(), round);
    }
}

#[test]
fn test_labels_carry_across_command_buffers() {
    let f = make_fixture(GpuAvConfig::default());
    let opener = command_buffer(1);
    let worker = command_buffer(2);

    f.validator.on_command_buffer_begin(opener);
    f.validator.begin_label(opener, "frame");
    f.validator.on_command_buffer_end(opener);

    f.validator.on_command_buffer_begin(worker);
    f.validator.begin_label(worker, "lighting");
    f.validator
        .record_action(worker, BindPoint::Compute, "vkCmdDispatch")
        .expect("set");
    f.validator.end_label(worker);
    f.validator.on_command_buffer_end(worker);
    shader_writes(
        &f,
        worker,
        record_header(ErrorGroup::DESCRIPTOR_INDEXING, SUBCODE_INDEX_OOB, 0, DESCRIPTOR_DECODER),
        vec![0, 0, 5, 4],
    );

    f.validator.queue_begin_label(f.queue, "app");
    submit(&f, f.queue, &[opener, worker]).expect("submit");
    f.validator.retire(f.queue);

    let found = f.sink.with_rule("VUID-vkCmdDispatch-None-10068");
    assert_eq!(found.len(), 1, "got {:?}", f.sink.diagnostics());
    assert_eq!(found[0].label_region.as_deref(), Some("app::frame::lighting"));

    let state = f.validator.queue(f.queue).expect("queue state");
    assert_eq!(state.lock().label_stack(), ["app".to_string(), "frame".to_string()]);
}

#[test]
fn test_truncation_warning_once_per_device() {
    let mut config = GpuAvConfig::default();
    config.buffers.error_buffer_words = (2 * ERROR_RECORD_WORDS) as u32;
    let f = make_fixture(config);

    let cbs = [command_buffer(1), command_buffer(2)];
    for &cb in &cbs {
        record_draw(&f, cb);
        for _ in 0..3 {
            shader_writes(
                &f,
                cb,
                record_header(ErrorGroup::DESCRIPTOR_INDEXING, SUBCODE_INDEX_OOB, 0, DESCRIPTOR_DECODER),
                vec![0, 0, 2, 1],
            );
        }
    }
    submit(&f, f.queue, &cbs).expect("submit");
    assert_eq!(f.validator.retire(f.queue), 2);

    assert_eq!(f.sink.with_rule(RULE_BUFFER_OVERFLOW).len(), 1);
    assert_eq!(f.sink.with_rule("VUID-vkCmdDraw-None-10068").len(), 4);
}

/// Count runs of a pre-submit hook installed on `cb`.
fn count_pre_submits(f: &Fixture, cb: vk::CommandBuffer) -> Arc<AtomicUsize> {
    let runs = Arc::new(AtomicUsize::new(0));
    let counter = runs.clone();
    f.validator
        .context(cb)
        .expect("context")
        .lock()
        .on_pre_submit(Box::new(move |_s: &mut SubmitCtx<'_>| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
    runs
}

#[test]
fn test_exhausted_aux_pool_skips_hooks() {
    let mut config = GpuAvConfig::default();
    config.submission.aux_command_buffers_per_queue = 2;
    let f = make_fixture(config);
    let cb = command_buffer(1);
    record_draw(&f, cb);
    let runs = count_pre_submits(&f, cb);

    // Fences stay pending, so the first batch keeps both slots.
    f.host.hold_fences(true);
    submit(&f, f.queue, &[cb]).expect("first submit");
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    submit(&f, f.queue, &[cb]).expect("second submit still reaches the device");
    assert_eq!(runs.load(Ordering::SeqCst), 1, "no slot left for the hook");

    // The second batch fell back to a device wait, which completed the first.
    submit(&f, f.queue, &[cb]).expect("third submit");
    assert_eq!(runs.load(Ordering::SeqCst), 2, "slots recycled once their fences signaled");
    let state = f.validator.queue(f.queue).expect("queue state");
    assert_eq!(state.lock().aux_pool().created(), 2);
    assert!(!f.validator.is_aborted());
}

#[test]
fn test_submit_recycles_completed_work() {
    let f = make_fixture(GpuAvConfig::default());
    let limit = f.validator.config().submission.aux_command_buffers_per_queue as usize;
    let cb = command_buffer(1);
    record_draw(&f, cb);
    let runs = count_pre_submits(&f, cb);
    shader_writes(
        &f,
        cb,
        record_header(ErrorGroup::DESCRIPTOR_INDEXING, SUBCODE_INDEX_OOB, 0, DESCRIPTOR_DECODER),
        vec![0, 0, 2, 1],
    );

    // The application syncs on its own fences and never waits through us.
    let rounds = limit + 8;
    for _ in 0..rounds {
        submit(&f, f.queue, &[cb]).expect("submit");
        let state = f.validator.queue(f.queue).expect("queue state");
        assert!(state.lock().in_flight_len() <= 1);
    }
    assert_eq!(runs.load(Ordering::SeqCst), rounds);

    // Pre-submit, application batch, fence-only batch every round; no idle fallback.
    let log = f.host.submissions();
    assert_eq!(log.len(), 3 * rounds);
    assert_eq!(log.iter().filter(|s| s.fence != vk::Fence::null()).count(), 2 * rounds);
    let state = f.validator.queue(f.queue).expect("queue state");
    assert_eq!(state.lock().aux_pool().created(), 2);

    // Each run was decoded once from a cleared buffer.
    f.validator.retire(f.queue);
    assert_eq!(f.sink.with_rule("VUID-vkCmdDraw-None-10068").len(), rounds);
    assert!(f.sink.with_rule(RULE_BUFFER_OVERFLOW).is_empty());
}

#[test]
fn test_shared_command_buffers_on_two_queues() {
    let f = Arc::new(make_fixture(GpuAvConfig::default()));
    let cbs = [command_buffer(1), command_buffer(2)];
    for &cb in &cbs {
        record_draw(&f, cb);
    }
    let queues = [f.queue, f.host.create_queue(1)];
    let batches = [vec![cbs[0], cbs[1]], vec![cbs[1], cbs[0]]];

    let workers: Vec<_> = queues
        .iter()
        .zip(batches)
        .map(|(&queue, batch)| {
            let f = f.clone();
            thread::spawn(move || {
                for _ in 0..200 {
                    submit(&f, queue, &batch).expect("submit");
                }
                f.validator.retire(queue);
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker");
    }

    let app_batches = f
        .host
        .submissions()
        .into_iter()
        .filter(|s| s.command_buffers.len() == 2)
        .count();
    assert_eq!(app_batches, 400);
}

#[test]
fn test_queues_use_separate_pools() {
    let f = Arc::new(make_fixture(GpuAvConfig::default()));
    let queues = [f.queue, f.host.create_queue(1)];
    let seen: Arc<Mutex<Vec<(vk::Queue, vk::Buffer)>>> = Arc::new(Mutex::new(Vec::new()));

    for (i, _) in queues.iter().enumerate() {
        let cb = command_buffer(i as u64);
        record_draw(&f, cb);
        let seen = seen.clone();
        f.validator
            .context(cb)
            .expect("context")
            .lock()
            .on_pre_submit(Box::new(move |s: &mut SubmitCtx<'_>| {
                let range = s.queue_pool.get_range(MemoryBucket::HostCoherent, 64);
                seen.lock().push((s.queue, range.buffer));
            }));
    }

    let workers: Vec<_> = queues
        .iter()
        .enumerate()
        .map(|(i, &queue)| {
            let f = f.clone();
            thread::spawn(move || {
                let cb = command_buffer(i as u64);
                for _ in 0..8 {
                    submit(&f, queue, &[cb]).expect("submit");
                }
                f.validator.retire(queue);
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("submit thread");
    }

    let seen = seen.lock();
    assert_eq!(seen.len(), 16);
    let per_queue: Vec<HashSet<vk::Buffer>> = queues
        .iter()
        .map(|q| seen.iter().filter(|(sq, _)| sq == q).map(|(_, b)| *b).collect())
        .collect();
    assert!(per_queue[0].is_disjoint(&per_queue[1]));
    for queue in queues {
        let state = f.validator.queue(queue).expect("queue state");
        assert_eq!(
            state.lock().resource_pool().cache(MemoryBucket::HostCoherent).used_bytes(),
            0,
            "queue pool returned once nothing is in flight"
        );
    }
}

#[test]
fn test_device_loss_disables_instrumentation() {
    let f = make_fixture(GpuAvConfig::default());
    let cb = command_buffer(1);
    record_draw(&f, cb);

    f.host.lose_device();
    let result = submit(&f, f.queue, &[cb]);
    assert_eq!(result, Err(vk::Result::ERROR_DEVICE_LOST));
    assert!(f.validator.is_aborted());

    f.validator.on_command_buffer_begin(cb);
    assert!(f.validator.record_action(cb, BindPoint::Graphics, "vkCmdDraw").is_none());
    let called = Arc::new(AtomicUsize::new(0));
    let c = called.clone();
    let passthrough = f.validator.queue_submit(f.queue, &[Submission::new(vec![cb])], move || {
        c.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    assert_eq!(passthrough, Ok(()));
    assert_eq!(called.load(Ordering::SeqCst), 1);
    assert_eq!(f.validator.retire(f.queue), 0);
}

#[test]
fn test_failed_application_submit_is_returned_unchanged() {
    let f = make_fixture(GpuAvConfig::default());
    let cb = command_buffer(1);
    record_draw(&f, cb);

    let result = f
        .validator
        .queue_submit(f.queue, &[Submission::new(vec![cb])], || {
            Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
        });
    assert_eq!(result, Err(vk::Result::ERROR_OUT_OF_HOST_MEMORY));
    assert!(!f.validator.is_aborted());
    assert_eq!(f.validator.retire(f.queue), 0);
}

#[test]
fn test_disabled_validation_passes_through() {
    let mut config = GpuAvConfig::default();
    config.validation.enabled = false;
    let f = make_fixture(config);
    let cb = command_buffer(1);

    f.validator.on_command_buffer_allocated(cb);
    f.validator.on_command_buffer_begin(cb);
    assert!(f.validator.context(cb).is_none());
    assert!(f.validator.record_action(cb, BindPoint::Graphics, "vkCmdDraw").is_none());
    assert!(f.validator.on_resource_created(ResourceKind::Buffer, 1).is_null());
    assert!(!f.validator.heap().is_enabled());

    submit(&f, f.queue, &[cb]).expect("submit");
    assert_eq!(f.host.submissions().len(), 1);
}

#[test]
fn test_heap_failure_degrades_to_disabled() {
    let host = Arc::new(HostDevice::new());
    host.fail_allocations(true);
    let validator = Validator::new(host.clone(), GpuAvConfig::default(), Arc::new(CollectingSink::new()));
    assert!(validator.is_aborted());
    assert!(!validator.heap().is_enabled());
}

#[test]
fn test_destroy_releases_everything() {
    let f = make_fixture(GpuAvConfig::default());
    for n in 0..3 {
        let cb = command_buffer(n);
        record_draw(&f, cb);
        submit(&f, f.queue, &[cb]).expect("submit");
    }
    f.validator.queue_wait_idle(f.queue, || Ok(())).expect("wait idle");
    f.validator.on_command_buffer_freed(command_buffer(0));
    assert_eq!(f.validator.context_count(), 2);

    f.validator.destroy();
    assert_eq!(f.host.live_buffer_count(), 0);
    assert_eq!(f.host.descriptor_pool_count(), 0);
    assert!(f.validator.shared().is_empty());
}
