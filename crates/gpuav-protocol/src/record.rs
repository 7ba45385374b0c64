//! Error record layout.
//!
//! Every record starts with a fixed header of [`HEADER_WORDS`] words:
//!
//! ```text
//! [0] record length in words
//! [1] group (bits 31..24) | subcode (bits 23..18) | shader id (bits 17..0)
//! [2] stage id (bits 31..27) | instruction offset (bits 26..0)
//! [3] stage info 0
//! [4] stage info 1
//! [5] stage info 2
//! [6] action index (bits 31..16) | decoder index (bits 15..0)
//! ```
//!
//! followed by check-specific parameter words. Regular records are always
//! [`ERROR_RECORD_WORDS`] long; the length word lets printf records carry a
//! longer payload without changing the walker.

use bytemuck::{Pod, Zeroable};

use crate::error::ProtocolError;
use crate::stage::ShaderStage;

pub const HEADER_WORDS: usize = 7;
pub const PARAM_WORDS: usize = 6;
pub const ERROR_RECORD_WORDS: usize = HEADER_WORDS + PARAM_WORDS;

pub const RECORD_SIZE_OFFSET: usize = 0;
pub const SHADER_ERROR_OFFSET: usize = 1;
pub const STAGE_INSTRUCTION_OFFSET: usize = 2;
pub const STAGE_INFO_OFFSET: usize = 3;
pub const ACTION_DECODER_OFFSET: usize = 6;
pub const PARAMS_OFFSET: usize = HEADER_WORDS;

pub const SHADER_ID_MASK: u32 = 0x0003_FFFF;
pub const SUBCODE_SHIFT: u32 = 18;
pub const SUBCODE_MASK: u32 = 0x3F;
pub const GROUP_SHIFT: u32 = 24;
pub const GROUP_MASK: u32 = 0xFF;

pub const STAGE_SHIFT: u32 = 27;
pub const STAGE_MASK: u32 = 0x1F;
pub const INSTRUCTION_MASK: u32 = 0x07FF_FFFF;

pub const ACTION_SHIFT: u32 = 16;
pub const DECODER_MASK: u32 = 0xFFFF;

/// Decoder index written when the command buffer ran out of attributable actions.
pub const DECODER_INDEX_OVERFLOW: u16 = 0xFFFF;
/// Decoder index written by actions that were recorded before any decoder was registered.
pub const DECODER_INDEX_UNASSIGNED: u16 = 0xFFFE;
/// Largest decoder index that addresses a real decoder slot.
pub const MAX_DECODER_INDEX: u16 = 0xFFFD;
/// Action index written once the per-command-buffer action budget is exhausted.
pub const ACTION_INDEX_OVERFLOW: u16 = 0xFFFF;

/// Error group: the top byte of the shader/error word. Each check owns one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ErrorGroup(pub u8);

impl ErrorGroup {
    pub const DESCRIPTOR_INDEXING: ErrorGroup = ErrorGroup(1);
    pub const BUFFER_DEVICE_ADDRESS: ErrorGroup = ErrorGroup(2);
    pub const RAY_QUERY: ErrorGroup = ErrorGroup(3);
    pub const PRE_DRAW: ErrorGroup = ErrorGroup(4);
    pub const PRE_DISPATCH: ErrorGroup = ErrorGroup(5);
    pub const PRE_TRACE_RAYS: ErrorGroup = ErrorGroup(6);
    pub const COPY_BUFFER_TO_IMAGE: ErrorGroup = ErrorGroup(7);
    pub const DESCRIPTOR_CLASS: ErrorGroup = ErrorGroup(8);
    pub const INDEXED_DRAW: ErrorGroup = ErrorGroup(9);
    /// Not an error: the record carries a debug-printf payload.
    pub const DEBUG_PRINTF: ErrorGroup = ErrorGroup(0xFF);
}

/// Decoded header fields of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorHeader {
    pub group: u8,
    /// 6 bits.
    pub subcode: u8,
    /// 18 bits.
    pub shader_id: u32,
    /// 5 bits.
    pub stage_id: u8,
    /// 27 bits.
    pub instruction_offset: u32,
    pub stage_info: [u32; 3],
    pub action_index: u16,
    pub decoder_index: u16,
}

/// Raw header as it sits in memory, for byte-level views.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct RawRecordHeader {
    pub record_size: u32,
    pub shader_error: u32,
    pub stage_instruction: u32,
    pub stage_info: [u32; 3],
    pub action_decoder: u32,
}

#[inline]
pub fn pack_shader_error(group: u8, subcode: u8, shader_id: u32) -> u32 {
    debug_assert!(u32::from(subcode) <= SUBCODE_MASK, "subcode {subcode} exceeds 6 bits");
    debug_assert!(shader_id <= SHADER_ID_MASK, "shader id {shader_id} exceeds 18 bits");
    (u32::from(group) << GROUP_SHIFT)
        | ((u32::from(subcode) & SUBCODE_MASK) << SUBCODE_SHIFT)
        | (shader_id & SHADER_ID_MASK)
}

#[inline]
pub fn pack_stage_instruction(stage_id: u8, instruction_offset: u32) -> u32 {
    debug_assert!(u32::from(stage_id) <= STAGE_MASK);
    debug_assert!(instruction_offset <= INSTRUCTION_MASK);
    ((u32::from(stage_id) & STAGE_MASK) << STAGE_SHIFT) | (instruction_offset & INSTRUCTION_MASK)
}

#[inline]
pub fn pack_action_decoder(action_index: u16, decoder_index: u16) -> u32 {
    (u32::from(action_index) << ACTION_SHIFT) | u32::from(decoder_index)
}

impl ErrorHeader {
    pub fn error_group(&self) -> ErrorGroup {
        ErrorGroup(self.group)
    }

    pub fn stage(&self) -> Option<ShaderStage> {
        ShaderStage::from_id(u32::from(self.stage_id))
    }

    pub fn to_raw(&self, record_words: usize) -> RawRecordHeader {
        RawRecordHeader {
            record_size: record_words as u32,
            shader_error: pack_shader_error(self.group, self.subcode, self.shader_id),
            stage_instruction: pack_stage_instruction(self.stage_id, self.instruction_offset),
            stage_info: self.stage_info,
            action_decoder: pack_action_decoder(self.action_index, self.decoder_index),
        }
    }

    pub fn from_raw(raw: &RawRecordHeader) -> Self {
        Self {
            group: ((raw.shader_error >> GROUP_SHIFT) & GROUP_MASK) as u8,
            subcode: ((raw.shader_error >> SUBCODE_SHIFT) & SUBCODE_MASK) as u8,
            shader_id: raw.shader_error & SHADER_ID_MASK,
            stage_id: ((raw.stage_instruction >> STAGE_SHIFT) & STAGE_MASK) as u8,
            instruction_offset: raw.stage_instruction & INSTRUCTION_MASK,
            stage_info: raw.stage_info,
            action_index: (raw.action_decoder >> ACTION_SHIFT) as u16,
            decoder_index: (raw.action_decoder & DECODER_MASK) as u16,
        }
    }

    /// Encode a complete record: header followed by `params`, zero padded to
    /// [`ERROR_RECORD_WORDS`] when the payload fits the regular size.
    pub fn encode(&self, params: &[u32]) -> Vec<u32> {
        let len = record_len_for(params.len());
        let mut words = vec![0u32; len];
        words[..HEADER_WORDS].copy_from_slice(bytemuck::cast_slice(std::slice::from_ref(
            &self.to_raw(len),
        )));
        words[PARAMS_OFFSET..PARAMS_OFFSET + params.len()].copy_from_slice(params);
        words
    }
}

/// Length in words of a record carrying `param_count` parameter words.
#[inline]
pub fn record_len_for(param_count: usize) -> usize {
    HEADER_WORDS + param_count.max(PARAM_WORDS)
}

/// Borrowed view of one record inside an output buffer.
#[derive(Debug, Clone, Copy)]
pub struct ErrorRecord<'a> {
    words: &'a [u32],
}

impl<'a> ErrorRecord<'a> {
    /// Wrap `words`, which must start at a record boundary. The view is cut to
    /// the record's own length field.
    pub fn from_words(words: &'a [u32]) -> Result<Self, ProtocolError> {
        if words.len() < HEADER_WORDS {
            return Err(ProtocolError::TruncatedRecord {
                needed: HEADER_WORDS,
                available: words.len(),
            });
        }
        let len = words[RECORD_SIZE_OFFSET] as usize;
        if len < HEADER_WORDS || len > words.len() {
            return Err(ProtocolError::TruncatedRecord {
                needed: len.max(HEADER_WORDS),
                available: words.len(),
            });
        }
        Ok(Self { words: &words[..len] })
    }

    pub fn raw_header(&self) -> &'a RawRecordHeader {
        let words: &'a [u32] = self.words;
        bytemuck::from_bytes(bytemuck::cast_slice(&words[..HEADER_WORDS]))
    }

    pub fn header(&self) -> ErrorHeader {
        ErrorHeader::from_raw(self.raw_header())
    }

    pub fn words(&self) -> &'a [u32] {
        self.words
    }

    pub fn len_words(&self) -> usize {
        self.words.len()
    }

    pub fn group(&self) -> ErrorGroup {
        ErrorGroup(((self.words[SHADER_ERROR_OFFSET] >> GROUP_SHIFT) & GROUP_MASK) as u8)
    }

    pub fn subcode(&self) -> u8 {
        ((self.words[SHADER_ERROR_OFFSET] >> SUBCODE_SHIFT) & SUBCODE_MASK) as u8
    }

    pub fn shader_id(&self) -> u32 {
        self.words[SHADER_ERROR_OFFSET] & SHADER_ID_MASK
    }

    pub fn stage_id(&self) -> u32 {
        (self.words[STAGE_INSTRUCTION_OFFSET] >> STAGE_SHIFT) & STAGE_MASK
    }

    pub fn stage(&self) -> Option<ShaderStage> {
        ShaderStage::from_id(self.stage_id())
    }

    pub fn instruction_offset(&self) -> u32 {
        self.words[STAGE_INSTRUCTION_OFFSET] & INSTRUCTION_MASK
    }

    pub fn stage_info(&self) -> [u32; 3] {
        [
            self.words[STAGE_INFO_OFFSET],
            self.words[STAGE_INFO_OFFSET + 1],
            self.words[STAGE_INFO_OFFSET + 2],
        ]
    }

    pub fn action_index(&self) -> u16 {
        (self.words[ACTION_DECODER_OFFSET] >> ACTION_SHIFT) as u16
    }

    pub fn decoder_index(&self) -> u16 {
        (self.words[ACTION_DECODER_OFFSET] & DECODER_MASK) as u16
    }

    pub fn params(&self) -> &'a [u32] {
        let words: &'a [u32] = self.words;
        &words[PARAMS_OFFSET..]
    }

    /// Parameter word `i`, or 0 past the end of the record.
    pub fn param(&self, i: usize) -> u32 {
        self.params().get(i).copied().unwrap_or(0)
    }

    /// Two consecutive parameter words read as a little-endian `u64`.
    pub fn param_u64(&self, i: usize) -> u64 {
        u64::from(self.param(i)) | (u64::from(self.param(i + 1)) << 32)
    }
}
