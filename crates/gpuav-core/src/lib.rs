pub mod checks;
pub mod command_context;
pub mod config;
pub mod decode;
pub mod descriptor_heap;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod printf;
pub mod queue;
pub mod resource_pool;
pub mod shared;
pub mod validator;

pub use command_context::{BindPoint, CommandContext, ContextState};
pub use config::GpuAvConfig;
pub use decode::{DecodeReport, DecoderRegistry, ErrorDecoder, LogContext};
pub use descriptor_heap::{DescriptorHeap, DescriptorId, ResourceKind, ResourceRef};
pub use device::{GpuDevice, HostDevice, MemoryBucket, VulkanDevice};
pub use diagnostics::{CollectingSink, Diagnostic, DiagnosticSink, Finding, Severity, TracingSink};
pub use error::{AbortSignal, GpuAvError};
pub use printf::{FormatTable, PrintfDecoder};
pub use queue::{QueueState, Submission};
pub use resource_pool::{BufferRange, ResourcePool};
pub use validator::Validator;
