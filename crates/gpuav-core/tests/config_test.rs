//! Configuration and format-file parsing.

use gpuav_core::printf::FormatFile;
use gpuav_core::{FormatTable, GpuAvConfig, GpuAvError, MemoryBucket};

#[test]
fn test_defaults() {
    let config = GpuAvConfig::default();
    assert!(config.validation.enabled);
    assert!(config.validation.descriptor_checks);
    assert!(config.validation.debug_printf);
    assert_eq!(config.validation.max_errors_per_command, 6);
    assert_eq!(config.buffers.error_buffer_words, 16 * 1024);
    assert_eq!(config.buffers.max_actions_per_command_buffer, 8192);
    assert_eq!(config.heap.capacity, 1 << 20);
    assert_eq!(config.submission.instrumentation_set_index, 7);
}

#[test]
fn test_empty_file_is_default() {
    let config = GpuAvConfig::from_toml_str("").expect("empty config parses");
    assert_eq!(config, GpuAvConfig::default());
}

#[test]
fn test_partial_file_keeps_other_defaults() {
    let config = GpuAvConfig::from_toml_str(
        r#"
[validation]
debug_printf = false

[buffers]
min_block_size = 4096

[buffers.bucket_block_sizes]
staging = 1048576

[submission]
retire_timeout_ms = 250
"#,
    )
    .expect("config parses");

    assert!(!config.validation.debug_printf);
    assert!(config.validation.descriptor_checks);
    assert_eq!(config.buffers.block_size_for(MemoryBucket::HostCoherent), 4096);
    assert_eq!(config.buffers.block_size_for(MemoryBucket::Staging), 1 << 20);
    assert_eq!(config.submission.retire_timeout_ms, 250);
    assert_eq!(config.submission.aux_command_buffers_per_queue, 32);
}

#[test]
fn test_zero_block_size_is_clamped() {
    let config = GpuAvConfig::from_toml_str("[buffers]\nmin_block_size = 0\n").expect("config parses");
    assert_eq!(config.buffers.block_size_for(MemoryBucket::DeviceLocal), 1);
}

#[test]
fn test_rejects_bad_types() {
    let err = GpuAvConfig::from_toml_str("[heap]\ncapacity = \"lots\"\n").unwrap_err();
    assert!(matches!(err, GpuAvError::Config(_)), "got {err:?}");
}

#[test]
fn test_written_config_reads_back() {
    let mut config = GpuAvConfig::default();
    config.heap.capacity = 0;
    config.buffers.bucket_block_sizes.device_local = Some(1 << 22);
    let text = config.to_toml_string().expect("serializes");
    assert_eq!(GpuAvConfig::from_toml_str(&text).expect("reparses"), config);
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let path = std::env::temp_dir().join("gpuav-config-test-does-not-exist.toml");
    assert!(matches!(GpuAvConfig::load(&path), Err(GpuAvError::Io(_))));
    assert_eq!(GpuAvConfig::load_or_default(&path), GpuAvConfig::default());
}

#[test]
fn test_format_file_loads_into_table() {
    let file = FormatFile::from_toml_str(
        r#"
[[formats]]
shader = 3
id = 0
text = "x=%d"

[[formats]]
shader = 3
id = 1
text = "pos=%v2f"
"#,
    )
    .expect("format file parses");
    assert_eq!(file.formats.len(), 2);

    let table = FormatTable::new();
    assert_eq!(table.load(&file).expect("strings parse"), 2);
    assert!(table.get(3, 1).is_some());
    assert!(table.get(4, 0).is_none());

    table.remove_shader(3);
    assert!(table.is_empty());
}

#[test]
fn test_format_file_with_bad_string_is_rejected() {
    let file = FormatFile::from_toml_str("[[formats]]\nshader = 1\nid = 0\ntext = \"%\"\n").expect("parses");
    assert!(FormatTable::new().load(&file).is_err());
}
