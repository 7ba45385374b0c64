//! Checks that plug into a command context through its decoder registry and
//! hook lists. Each check owns one error group.

pub mod descriptor_indexing;

pub use descriptor_indexing::DescriptorIndexingCheck;
