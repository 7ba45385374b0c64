//! Descriptor indexing: array indices past the bound count, descriptors
//! that were never written, and descriptors whose resource was destroyed.
//!
//! Instrumented shaders test the id of every dynamically indexed descriptor
//! against the heap bitmap bound at [`DESCRIPTOR_BITMAP`]. Records carry
//! `[set, binding, index, length-or-id]` as parameters.

use std::sync::Arc;

use ash::vk;

use gpuav_protocol::bindings::DESCRIPTOR_BITMAP;
use gpuav_protocol::record::ErrorGroup;
use gpuav_protocol::ErrorRecord;

use crate::command_context::{CommandContext, DescUpdateCtx};
use crate::decode::{ErrorDecoder, LogContext};
use crate::descriptor_heap::{DescriptorHeap, DescriptorId};
use crate::device::BufferWrite;
use crate::diagnostics::Finding;

pub const SUBCODE_INDEX_OOB: u8 = 1;
pub const SUBCODE_UNINITIALIZED: u8 = 2;
pub const SUBCODE_DESTROYED: u8 = 3;

pub const SET_PARAM: usize = 0;
pub const BINDING_PARAM: usize = 1;
pub const INDEX_PARAM: usize = 2;
/// Array length for out-of-bounds records, descriptor id for destroyed ones.
pub const DETAIL_PARAM: usize = 3;

pub struct DescriptorIndexingCheck {
    heap: Arc<DescriptorHeap>,
}

impl DescriptorIndexingCheck {
    pub fn new(heap: Arc<DescriptorHeap>) -> Self {
        Self { heap }
    }

    /// Register the decoder on `ctx` and bind the heap bitmap for every
    /// action recorded after it. Returns the decoder index.
    pub fn install(self: &Arc<Self>, ctx: &mut CommandContext) -> u16 {
        let index = ctx.register_decoder(self.clone());
        if let Some((buffer, size)) = self.heap.bitmap_binding() {
            ctx.on_desc_update(Box::new(move |update: &mut DescUpdateCtx<'_>| {
                update.writes.retain(|w| w.binding != DESCRIPTOR_BITMAP);
                update.writes.push(BufferWrite {
                    binding: DESCRIPTOR_BITMAP,
                    descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
                    buffer,
                    offset: 0,
                    range: size,
                });
            }));
        }
        index
    }

    fn rule(log: &LogContext<'_>, record: &ErrorRecord<'_>, vuid: &str) -> String {
        match log.action(record.action_index()) {
            Some(action) => format!("VUID-{}-None-{vuid}", action.command),
            None => format!("UNASSIGNED-Descriptor-{vuid}"),
        }
    }
}

impl ErrorDecoder for DescriptorIndexingCheck {
    fn decode(&self, record: &ErrorRecord<'_>, log: &LogContext<'_>) -> Option<Finding> {
        if record.group() != ErrorGroup::DESCRIPTOR_INDEXING {
            return None;
        }
        let set = record.param(SET_PARAM);
        let binding = record.param(BINDING_PARAM);
        let index = record.param(INDEX_PARAM);
        let detail = record.param(DETAIL_PARAM);
        let finding = match record.subcode() {
            SUBCODE_INDEX_OOB => Finding::error(
                Self::rule(log, record, "10068"),
                format!(
                    "(set = {set}, binding = {binding}) Index of {index} used to index descriptor array of length {detail}."
                ),
            ),
            SUBCODE_UNINITIALIZED => Finding::error(
                Self::rule(log, record, "08114"),
                format!("(set = {set}, binding = {binding}) Descriptor index {index} is uninitialized."),
            ),
            SUBCODE_DESTROYED => {
                let id = DescriptorId(detail);
                let reused = match self.heap.owner(id) {
                    Some(owner) => format!(
                        " The id has since been reused by {:?} {:#x}.",
                        owner.kind, owner.handle
                    ),
                    None => String::new(),
                };
                Finding::error(
                    Self::rule(log, record, "08114"),
                    format!(
                        "(set = {set}, binding = {binding}) Descriptor index {index} references a destroyed resource (descriptor id {}).{reused}",
                        id.get()
                    ),
                )
            }
            _ => return None,
        };
        Some(finding)
    }
}
