//! Binding-number scheme shared with the shader instrumentation passes.
//!
//! Instrumented shaders reach every host-provided buffer through one extra
//! descriptor set. The binding numbers below are compiled into the shaders,
//! so any change here must bump [`BINDING_SCHEME_VERSION`].
//!
//! The error buffer's first word carries the output flags in its top byte
//! next to the 24-bit total capacity, so shaders learn which checks are
//! enabled without another binding. See [`crate::output`].

/// Version 2: total capacity in the error buffer header, error cap in the
/// action index block.
pub const BINDING_SCHEME_VERSION: u32 = 2;

pub const ERROR_BUFFER: u32 = 0;
pub const ACTION_INDEX: u32 = 1;
pub const CMD_ERROR_COUNTS: u32 = 2;
pub const DESCRIPTOR_BITMAP: u32 = 3;
pub const CHECK_INPUT_0: u32 = 4;
pub const CHECK_INPUT_1: u32 = 5;
pub const CHECK_INPUT_2: u32 = 6;

/// Words in the per-action index block bound at [`ACTION_INDEX`].
pub const ACTION_INDEX_WORDS: usize = 4;
pub const ACTION_INDEX_SLOT: usize = 0;
pub const DECODER_INDEX_SLOT: usize = 1;
pub const ERROR_COUNTER_SLOT: usize = 2;
/// Errors one counter may report before further writes are abandoned.
pub const ERROR_LIMIT_SLOT: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingKind {
    StorageBuffer,
    UniformBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindingSlot {
    pub binding: u32,
    pub kind: BindingKind,
    pub name: &'static str,
}

pub const INSTRUMENTATION_BINDINGS: [BindingSlot; 7] = [
    BindingSlot { binding: ERROR_BUFFER, kind: BindingKind::StorageBuffer, name: "error_output" },
    BindingSlot { binding: ACTION_INDEX, kind: BindingKind::UniformBuffer, name: "action_index" },
    BindingSlot { binding: CMD_ERROR_COUNTS, kind: BindingKind::StorageBuffer, name: "cmd_error_counts" },
    BindingSlot { binding: DESCRIPTOR_BITMAP, kind: BindingKind::StorageBuffer, name: "descriptor_bitmap" },
    BindingSlot { binding: CHECK_INPUT_0, kind: BindingKind::StorageBuffer, name: "check_input_0" },
    BindingSlot { binding: CHECK_INPUT_1, kind: BindingKind::StorageBuffer, name: "check_input_1" },
    BindingSlot { binding: CHECK_INPUT_2, kind: BindingKind::StorageBuffer, name: "check_input_2" },
];

pub fn binding_slot(binding: u32) -> Option<&'static BindingSlot> {
    INSTRUMENTATION_BINDINGS.iter().find(|s| s.binding == binding)
}
