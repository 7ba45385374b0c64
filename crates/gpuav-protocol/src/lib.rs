//! Wire formats shared between instrumented shader code and the host.
//!
//! Nothing in this crate touches a device: the layouts here are what the
//! instrumentation passes compile into shaders and what the host runtime
//! walks after a submission retires.

pub mod bindings;
pub mod error;
pub mod output;
pub mod printf;
pub mod record;
pub mod stage;

pub use error::{PrintfError, ProtocolError};
pub use output::{ErrorBufferView, ErrorWriter, OutputFlags, WriteOutcome};
pub use printf::{FormatString, PayloadCursor, ValueMasks};
pub use record::{ErrorGroup, ErrorHeader, ErrorRecord};
pub use stage::ShaderStage;
