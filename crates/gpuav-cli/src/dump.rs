//! Human-readable listing of an error output buffer.

use std::io::Write;

use anyhow::Context;

use gpuav_core::FormatTable;
use gpuav_protocol::record::{ACTION_INDEX_OVERFLOW, DECODER_INDEX_OVERFLOW, DECODER_INDEX_UNASSIGNED};
use gpuav_protocol::stage::describe_stage;
use gpuav_protocol::{ErrorBufferView, ErrorGroup, ErrorRecord};

/// Parse a decimal or `0x`-prefixed hex word.
pub fn parse_word(s: &str) -> anyhow::Result<u32> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => s.parse::<u32>(),
    };
    parsed.with_context(|| format!("invalid word '{s}'"))
}

fn index_label(index: u16, overflow: u16) -> String {
    if index == overflow {
        "overflow".to_string()
    } else if overflow == DECODER_INDEX_OVERFLOW && index == DECODER_INDEX_UNASSIGNED {
        "unassigned".to_string()
    } else {
        index.to_string()
    }
}

fn print_record(out: &mut impl Write, n: usize, record: &ErrorRecord<'_>, formats: Option<&FormatTable>) -> std::io::Result<()> {
    writeln!(
        out,
        "record {n}: group {} subcode {} shader {} instruction {} ({} words)",
        record.group().0,
        record.subcode(),
        record.shader_id(),
        record.instruction_offset(),
        record.len_words()
    )?;
    writeln!(
        out,
        "  action {} decoder {}",
        index_label(record.action_index(), ACTION_INDEX_OVERFLOW),
        index_label(record.decoder_index(), DECODER_INDEX_OVERFLOW)
    )?;
    writeln!(out, "  {}", describe_stage(record.stage_id(), record.stage_info()))?;
    let params: Vec<String> = record.params().iter().map(|p| format!("{p:#x}")).collect();
    writeln!(out, "  params [{}]", params.join(", "))?;
    if record.group() == ErrorGroup::DEBUG_PRINTF {
        if let Some(table) = formats {
            match table.render(record) {
                Ok(text) => writeln!(out, "  printf: {text}")?,
                Err(e) => writeln!(out, "  printf: <{e}>")?,
            }
        }
    }
    Ok(())
}

/// Write every record in `words`, then the truncation status.
pub fn print_report(out: &mut impl Write, words: &[u32], formats: Option<&FormatTable>) -> anyhow::Result<()> {
    let view = ErrorBufferView::new(words)?;
    writeln!(
        out,
        "capacity {} words ({} for records), flags {:?}, {} words attempted",
        view.total_capacity(),
        view.capacity(),
        view.flags(),
        view.attempted()
    )?;
    let mut records = view.records();
    let mut n = 0;
    for record in records.by_ref() {
        print_record(out, n, &record, formats)?;
        n += 1;
    }
    let walked = records.words_walked();
    if view.truncated(walked) {
        writeln!(
            out,
            "{n} records; truncated: {} of {} attempted words missing",
            u64::from(view.attempted()) - walked as u64,
            view.attempted()
        )?;
    } else {
        writeln!(out, "{n} records; complete")?;
    }
    Ok(())
}
