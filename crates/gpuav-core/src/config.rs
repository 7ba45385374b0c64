use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::device::MemoryBucket;
use crate::error::GpuAvError;

/// Top-level configuration, usually loaded from gpuav.toml by the embedding
/// layer and handed to [`crate::Validator::new`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GpuAvConfig {
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub buffers: BufferConfig,
    #[serde(default)]
    pub heap: HeapConfig,
    #[serde(default)]
    pub submission: SubmissionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationConfig {
    /// Master switch; when false submissions pass straight through
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Descriptor indexing checks
    #[serde(default = "default_true")]
    pub descriptor_checks: bool,
    /// Decode debug-printf records
    #[serde(default = "default_true")]
    pub debug_printf: bool,
    /// Records one action may write before further errors are dropped.
    /// Shaders read it from the action index block.
    #[serde(default = "default_max_errors_per_command")]
    pub max_errors_per_command: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BufferConfig {
    /// Size of the record region of each command buffer's error output buffer
    #[serde(default = "default_error_buffer_words")]
    pub error_buffer_words: u32,
    /// Smallest block a pooled bucket allocates
    #[serde(default = "default_min_block_size")]
    pub min_block_size: u64,
    /// Per-bucket overrides of `min_block_size`
    #[serde(default)]
    pub bucket_block_sizes: BucketBlockSizes,
    /// Sets per instrumentation descriptor pool
    #[serde(default = "default_descriptor_sets_per_pool")]
    pub descriptor_sets_per_pool: u32,
    /// Actions per command buffer that get their own error counter and index
    #[serde(default = "default_max_actions")]
    pub max_actions_per_command_buffer: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BucketBlockSizes {
    pub host_coherent: Option<u64>,
    pub host_cached: Option<u64>,
    pub device_local: Option<u64>,
    pub device_local_indirect: Option<u64>,
    pub staging: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HeapConfig {
    /// Descriptor ids available; 0 disables the heap
    #[serde(default = "default_heap_capacity")]
    pub capacity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmissionConfig {
    /// Upper bound on auxiliary command buffers each queue keeps
    #[serde(default = "default_aux_command_buffers")]
    pub aux_command_buffers_per_queue: u32,
    /// How long retirement waits on a fence before giving up
    #[serde(default = "default_retire_timeout_ms")]
    pub retire_timeout_ms: u64,
    /// Descriptor set index instrumented shaders use for the extra set
    #[serde(default = "default_instrumentation_set_index")]
    pub instrumentation_set_index: u32,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            descriptor_checks: true,
            debug_printf: true,
            max_errors_per_command: default_max_errors_per_command(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            error_buffer_words: default_error_buffer_words(),
            min_block_size: default_min_block_size(),
            bucket_block_sizes: BucketBlockSizes::default(),
            descriptor_sets_per_pool: default_descriptor_sets_per_pool(),
            max_actions_per_command_buffer: default_max_actions(),
        }
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            capacity: default_heap_capacity(),
        }
    }
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            aux_command_buffers_per_queue: default_aux_command_buffers(),
            retire_timeout_ms: default_retire_timeout_ms(),
            instrumentation_set_index: default_instrumentation_set_index(),
        }
    }
}

impl BufferConfig {
    /// Minimum block size for `bucket`, honouring the override table.
    pub fn block_size_for(&self, bucket: MemoryBucket) -> u64 {
        let table = &self.bucket_block_sizes;
        let over = match bucket {
            MemoryBucket::HostCoherent => table.host_coherent,
            MemoryBucket::HostCached => table.host_cached,
            MemoryBucket::DeviceLocal => table.device_local,
            MemoryBucket::DeviceLocalIndirect => table.device_local_indirect,
            MemoryBucket::Staging => table.staging,
        };
        over.unwrap_or(self.min_block_size).max(1)
    }
}

impl GpuAvConfig {
    pub fn from_toml_str(content: &str) -> Result<Self, GpuAvError> {
        toml::from_str(content).map_err(|e| GpuAvError::Config(e.to_string()))
    }

    /// Load configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, GpuAvError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Load configuration from file if it exists, otherwise return defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        Self::load(path).unwrap_or_default()
    }

    pub fn to_toml_string(&self) -> Result<String, GpuAvError> {
        toml::to_string_pretty(self).map_err(|e| GpuAvError::Config(e.to_string()))
    }
}

/// Returns the config file path to use.
/// Search order:
/// 1. `GPUAV_CONFIG` environment variable
/// 2. System-wide config: `/etc/gpuav/gpuav.toml`
/// 3. Local fallback: `./gpuav.toml`
pub fn default_config_path() -> String {
    if let Ok(path) = std::env::var("GPUAV_CONFIG") {
        if !path.is_empty() {
            return path;
        }
    }
    let system_path = "/etc/gpuav/gpuav.toml";
    if Path::new(system_path).exists() {
        return system_path.to_string();
    }
    "gpuav.toml".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_errors_per_command() -> u32 {
    6
}

fn default_error_buffer_words() -> u32 {
    16 * 1024
}

fn default_min_block_size() -> u64 {
    64 * 1024
}

fn default_descriptor_sets_per_pool() -> u32 {
    64
}

fn default_max_actions() -> u32 {
    8192
}

fn default_heap_capacity() -> u32 {
    1 << 20
}

fn default_aux_command_buffers() -> u32 {
    32
}

fn default_retire_timeout_ms() -> u64 {
    10_000
}

fn default_instrumentation_set_index() -> u32 {
    7
}
