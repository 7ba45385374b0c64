use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ash::vk;
use gpuav_protocol::{PrintfError, ProtocolError};
use tracing::error;

#[derive(Debug, thiserror::Error)]
pub enum GpuAvError {
    #[error("device call failed: {0:?}")]
    Device(vk::Result),

    #[error("device lost")]
    DeviceLost,

    #[error("instrumentation aborted")]
    Aborted,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Printf(#[from] PrintfError),
}

impl From<vk::Result> for GpuAvError {
    fn from(result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_DEVICE_LOST => GpuAvError::DeviceLost,
            other => GpuAvError::Device(other),
        }
    }
}

/// Process-wide kill switch. Once tripped, every entry point turns into a
/// pass-through and the application keeps running unvalidated.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Trip the switch. Only the first call logs.
    pub fn trigger(&self, reason: &str) {
        if !self.0.swap(true, Ordering::AcqRel) {
            error!(reason, "GPU-assisted validation aborted, continuing without instrumentation");
        }
    }

    /// Trip the switch when `result` is a device-loss class failure.
    /// Returns whether it did.
    pub fn check(&self, result: vk::Result, what: &str) -> bool {
        if result == vk::Result::ERROR_DEVICE_LOST {
            self.trigger(what);
            true
        } else {
            false
        }
    }
}
