pub mod logging;

pub use logging::{init_logging, try_init_logging};

/// Environment variable holding the `tracing` filter directive.
pub const LOG_ENV: &str = "GPUAV_LOG";
