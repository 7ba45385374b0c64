//! Error output buffer: header words, the host-side record walker, and the
//! write discipline instrumented shaders follow.
//!
//! ```text
//! [0] flags (bits 31..24) | total buffer capacity in words, header included (bits 23..0)
//! [1] record words the shader side attempted to write (may exceed the record region)
//! [2..] packed records
//! ```
//!
//! The record region holds `capacity - OUTPUT_HEADER_WORDS` words.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::ProtocolError;
use crate::record::{record_len_for, ErrorHeader, ErrorRecord, HEADER_WORDS, RECORD_SIZE_OFFSET};

pub const OUTPUT_HEADER_WORDS: usize = 2;
pub const CAPACITY_WORD: usize = 0;
pub const WRITTEN_WORD: usize = 1;
pub const CAPACITY_MASK: u32 = 0x00FF_FFFF;
pub const FLAGS_SHIFT: u32 = 24;
/// Largest total buffer length, header included, the capacity field can hold.
pub const MAX_CAPACITY_WORDS: usize = CAPACITY_MASK as usize;

bitflags::bitflags! {
    /// Flags byte in the capacity word. Shaders read these to skip checks the
    /// host disabled; the host never clears them between submissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OutputFlags: u8 {
        const DESCRIPTOR_CHECKS     = 0b0000_0001;
        const BUFFER_ADDRESS_CHECKS = 0b0000_0010;
        const RAY_QUERY_CHECKS      = 0b0000_0100;
        const DEBUG_PRINTF          = 0b0000_1000;
    }
}

/// Pack the capacity word for a buffer of `total` words. Fails when `total`
/// does not fit in 24 bits.
pub fn pack_capacity_word(total: usize, flags: OutputFlags) -> Result<u32, ProtocolError> {
    if total > MAX_CAPACITY_WORDS {
        return Err(ProtocolError::CapacityTooLarge(total));
    }
    Ok((u32::from(flags.bits()) << FLAGS_SHIFT) | total as u32)
}

/// Total buffer length in words for a record region of `capacity` words.
pub fn total_words(capacity: usize) -> usize {
    capacity + OUTPUT_HEADER_WORDS
}

/// Record-region words described by a capacity word.
pub fn record_capacity(capacity_word: u32) -> usize {
    ((capacity_word & CAPACITY_MASK) as usize).saturating_sub(OUTPUT_HEADER_WORDS)
}

/// Write a fresh header over `output`: capacity set to its length, attempted
/// count zero, record region zeroed.
pub fn init_output(output: &[AtomicU32], flags: OutputFlags) -> Result<(), ProtocolError> {
    if output.len() < OUTPUT_HEADER_WORDS + HEADER_WORDS {
        return Err(ProtocolError::BufferTooSmall(output.len()));
    }
    output[CAPACITY_WORD].store(pack_capacity_word(output.len(), flags)?, Ordering::Relaxed);
    clear_records(output);
    Ok(())
}

/// Zero the record region and the attempted count, keeping the capacity/flags word.
pub fn clear_records(output: &[AtomicU32]) {
    for word in output.iter().skip(WRITTEN_WORD) {
        word.store(0, Ordering::Relaxed);
    }
}

/// Words of a raw little-endian buffer dump, as written by a capture tool.
pub fn words_from_dump(bytes: &[u8]) -> Result<Vec<u32>, ProtocolError> {
    if bytes.len() % 4 != 0 {
        return Err(ProtocolError::MalformedDump(format!(
            "{} bytes is not a whole number of words",
            bytes.len()
        )));
    }
    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    if words.len() < OUTPUT_HEADER_WORDS {
        return Err(ProtocolError::BufferTooSmall(words.len()));
    }
    let declared = (words[CAPACITY_WORD] & CAPACITY_MASK) as usize;
    if declared > words.len() {
        return Err(ProtocolError::MalformedDump(format!(
            "header declares {declared} words, dump holds {}",
            words.len()
        )));
    }
    Ok(words)
}

/// Read-only view over a snapshot of an output buffer.
#[derive(Debug, Clone, Copy)]
pub struct ErrorBufferView<'a> {
    words: &'a [u32],
}

impl<'a> ErrorBufferView<'a> {
    pub fn new(words: &'a [u32]) -> Result<Self, ProtocolError> {
        if words.len() < OUTPUT_HEADER_WORDS {
            return Err(ProtocolError::BufferTooSmall(words.len()));
        }
        Ok(Self { words })
    }

    /// Total capacity in words as written in the header.
    pub fn total_capacity(&self) -> usize {
        (self.words[CAPACITY_WORD] & CAPACITY_MASK) as usize
    }

    /// Capacity of the record region in words, clamped to what the snapshot holds.
    pub fn capacity(&self) -> usize {
        record_capacity(self.words[CAPACITY_WORD]).min(self.words.len() - OUTPUT_HEADER_WORDS)
    }

    pub fn flags(&self) -> OutputFlags {
        OutputFlags::from_bits_truncate((self.words[CAPACITY_WORD] >> FLAGS_SHIFT) as u8)
    }

    /// Record words the shader side tried to write, including abandoned reservations.
    pub fn attempted(&self) -> u32 {
        self.words[WRITTEN_WORD]
    }

    pub fn is_empty(&self) -> bool {
        self.attempted() == 0
    }

    pub fn records(&self) -> RecordIter<'a> {
        let words: &'a [u32] = self.words;
        let limit = (self.attempted() as usize).min(self.capacity());
        RecordIter {
            data: &words[OUTPUT_HEADER_WORDS..OUTPUT_HEADER_WORDS + limit],
            offset: 0,
            done: false,
        }
    }

    /// Whether a walk that stopped after `walked` words missed records.
    pub fn truncated(&self, walked: usize) -> bool {
        (walked as u64) < u64::from(self.attempted())
    }
}

/// Walks records by their own length field. Stops at the first slot whose
/// length is zero or runs past the written region.
#[derive(Debug, Clone)]
pub struct RecordIter<'a> {
    data: &'a [u32],
    offset: usize,
    done: bool,
}

impl<'a> RecordIter<'a> {
    /// Words consumed so far, relative to the first record.
    pub fn words_walked(&self) -> usize {
        self.offset
    }
}

impl<'a> Iterator for RecordIter<'a> {
    type Item = ErrorRecord<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset >= self.data.len() {
            return None;
        }
        let data: &'a [u32] = self.data;
        let len = data[self.offset + RECORD_SIZE_OFFSET] as usize;
        if len < HEADER_WORDS || self.offset + len > data.len() {
            self.done = true;
            return None;
        }
        match ErrorRecord::from_words(&data[self.offset..]) {
            Ok(record) => {
                self.offset += len;
                Some(record)
            }
            Err(_) => {
                self.done = true;
                None
            }
        }
    }
}

/// Result of one device-side write attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Record stored at this word offset into the record region.
    Written { offset: usize },
    /// The per-command error cap was already reached.
    CommandLimitReached,
    /// The reservation ran past capacity; the attempted count still grew.
    BufferFull,
}

/// Host-side rendition of the write discipline compiled into instrumented
/// shaders. The host device uses it to emulate shader work; the ordering of
/// checks is the contract:
///
/// 1. bump the per-command error counter and give up past the cap,
/// 2. reserve words with a fetch-add on the attempted count and give up when
///    the reservation does not fit,
/// 3. only then fill in the record.
pub struct ErrorWriter<'a> {
    output: &'a [AtomicU32],
    error_counts: &'a [AtomicU32],
    max_errors_per_command: u32,
}

impl<'a> ErrorWriter<'a> {
    pub fn new(
        output: &'a [AtomicU32],
        error_counts: &'a [AtomicU32],
        max_errors_per_command: u32,
    ) -> Self {
        Self {
            output,
            error_counts,
            max_errors_per_command,
        }
    }

    pub fn write(&self, counter_index: usize, header: &ErrorHeader, params: &[u32]) -> WriteOutcome {
        if let Some(last) = self.error_counts.len().checked_sub(1) {
            let counter = &self.error_counts[counter_index.min(last)];
            let count = counter.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
            if count > self.max_errors_per_command {
                return WriteOutcome::CommandLimitReached;
            }
        }

        if self.output.len() < OUTPUT_HEADER_WORDS {
            return WriteOutcome::BufferFull;
        }
        let len = record_len_for(params.len());
        let capacity = record_capacity(self.output[CAPACITY_WORD].load(Ordering::Relaxed))
            .min(self.output.len() - OUTPUT_HEADER_WORDS);
        let offset = self.output[WRITTEN_WORD].fetch_add(len as u32, Ordering::AcqRel) as usize;
        if offset + len > capacity {
            return WriteOutcome::BufferFull;
        }

        let encoded = header.encode(params);
        let base = OUTPUT_HEADER_WORDS + offset;
        for (i, word) in encoded.iter().enumerate().skip(1) {
            self.output[base + i].store(*word, Ordering::Relaxed);
        }
        self.output[base + RECORD_SIZE_OFFSET].store(encoded[RECORD_SIZE_OFFSET], Ordering::Release);
        WriteOutcome::Written { offset }
    }
}
