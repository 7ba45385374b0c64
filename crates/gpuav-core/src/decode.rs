//! Host side of the error record protocol: the decoder registry and the loop
//! that walks a retired command buffer's output buffer.

use std::sync::Arc;

use ash::vk;
use tracing::debug;

use gpuav_protocol::record::{ACTION_INDEX_OVERFLOW, DECODER_INDEX_OVERFLOW, MAX_DECODER_INDEX};
use gpuav_protocol::stage::describe_stage;
use gpuav_protocol::{ErrorBufferView, ErrorRecord, ProtocolError};

use crate::command_context::{ActionRecord, LabelCommand};
use crate::diagnostics::{Diagnostic, DiagnosticSink, Finding, Severity};

pub const RULE_ACTION_OVERFLOW: &str = "UNASSIGNED-GPUAV-action-overflow";
pub const RULE_UNATTRIBUTED: &str = "UNASSIGNED-GPUAV-unattributed-record";
pub const RULE_BUFFER_OVERFLOW: &str = "UNASSIGNED-GPUAV-error-buffer-overflow";

/// Recognises one family of error records.
pub trait ErrorDecoder: Send + Sync {
    /// `None` when the record belongs to someone else.
    fn decode(&self, record: &ErrorRecord<'_>, log: &LogContext<'_>) -> Option<Finding>;
}

impl<F> ErrorDecoder for F
where
    F: Fn(&ErrorRecord<'_>, &LogContext<'_>) -> Option<Finding> + Send + Sync,
{
    fn decode(&self, record: &ErrorRecord<'_>, log: &LogContext<'_>) -> Option<Finding> {
        self(record, log)
    }
}

/// Decoders of one command context, addressed by the index shaders write
/// into each record. Registration order is part of the contract: when the
/// addressed decoder declines, the first registered decoder that accepts wins.
#[derive(Default, Clone)]
pub struct DecoderRegistry {
    decoders: Vec<Arc<dyn ErrorDecoder>>,
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `decoder`, returning its index, or the overflow sentinel once
    /// the 16-bit index space is used up.
    pub fn register(&mut self, decoder: Arc<dyn ErrorDecoder>) -> u16 {
        if self.decoders.len() > usize::from(MAX_DECODER_INDEX) {
            return DECODER_INDEX_OVERFLOW;
        }
        self.decoders.push(decoder);
        (self.decoders.len() - 1) as u16
    }

    /// Index of the most recently registered decoder.
    pub fn current(&self) -> Option<u16> {
        self.decoders.len().checked_sub(1).map(|i| i as u16)
    }

    pub fn get(&self, index: u16) -> Option<&Arc<dyn ErrorDecoder>> {
        if index > MAX_DECODER_INDEX {
            return None;
        }
        self.decoders.get(usize::from(index))
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    pub fn clear(&mut self) {
        self.decoders.clear();
    }

    pub fn decode(&self, record: &ErrorRecord<'_>, log: &LogContext<'_>) -> Option<Finding> {
        self.get(record.decoder_index())
            .and_then(|d| d.decode(record, log))
            .or_else(|| self.decoders.iter().find_map(|d| d.decode(record, log)))
    }
}

// ── Logging context ─────────────────────────────────────────

/// Where the records being decoded came from.
#[derive(Debug, Clone, Copy)]
pub struct LogContext<'a> {
    pub queue: vk::Queue,
    pub command_buffer: vk::CommandBuffer,
    pub actions: &'a [ActionRecord],
    pub labels: &'a [LabelCommand],
    /// Labels still open on the queue when the command buffer was submitted.
    pub inherited_labels: &'a [String],
}

impl<'a> LogContext<'a> {
    pub fn action(&self, action_index: u16) -> Option<&'a ActionRecord> {
        if action_index == ACTION_INDEX_OVERFLOW {
            return None;
        }
        self.actions.get(usize::from(action_index))
    }

    /// Label region active when action `action_index` was recorded.
    pub fn label_region(&self, action_index: u32) -> Option<String> {
        let mut stack = self.inherited_labels.to_vec();
        let before: Vec<LabelCommand> = self
            .labels
            .iter()
            .filter(|l| l.position() <= action_index)
            .cloned()
            .collect();
        apply_labels(&mut stack, &before);
        if stack.is_empty() {
            None
        } else {
            Some(stack.join("::"))
        }
    }

    /// Place `finding` in context. `record` supplies the action and stage.
    pub fn diagnostic(&self, finding: Finding, record: Option<&ErrorRecord<'_>>) -> Diagnostic {
        let mut diagnostic = Diagnostic {
            severity: finding.severity,
            rule_id: finding.rule_id,
            message: finding.message,
            queue: self.queue,
            command_buffer: self.command_buffer,
            command: None,
            action_index: None,
            label_region: None,
            location: None,
        };
        if let Some(record) = record {
            let index = record.action_index();
            if let Some(action) = self.action(index) {
                diagnostic.command = Some(action.describe());
                diagnostic.action_index = Some(action.index);
                diagnostic.label_region = self.label_region(action.index);
            }
            diagnostic.location = Some(format!(
                "{}. Shader {}, instruction {}.",
                describe_stage(record.stage_id(), record.stage_info()),
                record.shader_id(),
                record.instruction_offset()
            ));
        }
        diagnostic
    }
}

/// Replay begin/end label commands onto `stack`. An end with nothing open
/// is ignored.
pub fn apply_labels(stack: &mut Vec<String>, labels: &[LabelCommand]) {
    for label in labels {
        match label {
            LabelCommand::Begin { name, .. } => stack.push(name.clone()),
            LabelCommand::End { .. } => {
                stack.pop();
            }
        }
    }
}

// ── Decode loop ─────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodeReport {
    pub records: usize,
    pub findings: usize,
    pub unattributed: usize,
    /// Records from actions past the attribution limit.
    pub overflowed: usize,
    pub attempted_words: u32,
    pub walked_words: usize,
    pub capacity_words: usize,
    pub truncated: bool,
}

/// Walk a snapshot of an output buffer, hand each record to `decoders` and
/// emit what they find. Records nobody claims are still reported.
pub fn decode_error_output(
    words: &[u32],
    decoders: &DecoderRegistry,
    log: &LogContext<'_>,
    sink: &dyn DiagnosticSink,
) -> Result<DecodeReport, ProtocolError> {
    let view = ErrorBufferView::new(words)?;
    let mut report = DecodeReport {
        attempted_words: view.attempted(),
        capacity_words: view.capacity(),
        ..Default::default()
    };
    if view.is_empty() {
        return Ok(report);
    }

    let mut records = view.records();
    for record in records.by_ref() {
        report.records += 1;
        if record.decoder_index() == DECODER_INDEX_OVERFLOW {
            report.overflowed += 1;
            continue;
        }
        match decoders.decode(&record, log) {
            Some(finding) => {
                report.findings += 1;
                sink.emit(&log.diagnostic(finding, Some(&record)));
            }
            None => {
                report.unattributed += 1;
                let finding = Finding::error(
                    RULE_UNATTRIBUTED,
                    format!(
                        "Instrumented shader reported an error (group {}, subcode {}) that no registered check recognises.",
                        record.group().0,
                        record.subcode()
                    ),
                );
                sink.emit(&log.diagnostic(finding, Some(&record)));
            }
        }
    }

    if report.overflowed > 0 {
        let finding = Finding::error(
            RULE_ACTION_OVERFLOW,
            format!(
                "Too many actions in this command buffer to attribute {} error record(s) to the check that produced them.",
                report.overflowed
            ),
        );
        sink.emit(&log.diagnostic(finding, None));
    }

    report.walked_words = records.words_walked();
    report.truncated = view.truncated(report.walked_words);
    debug!(
        command_buffer = ?log.command_buffer,
        records = report.records,
        attempted = report.attempted_words,
        walked = report.walked_words,
        truncated = report.truncated,
        "decoded error output"
    );
    Ok(report)
}

/// The warning emitted once per device when records were lost.
pub fn truncation_diagnostic(report: &DecodeReport, log: &LogContext<'_>) -> Diagnostic {
    let finding = Finding {
        severity: Severity::Warning,
        rule_id: RULE_BUFFER_OVERFLOW.to_string(),
        message: format!(
            "Error output buffer too small: shaders tried to write {} words but only {} fit, so some diagnostics were dropped. \
             Increase buffers.error_buffer_words (currently {}).",
            report.attempted_words, report.walked_words, report.capacity_words
        ),
    };
    log.diagnostic(finding, None)
}
