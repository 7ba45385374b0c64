//! Debug-printf records: format strings registered per shader and the
//! decoder that renders group `0xFF` records.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use gpuav_protocol::record::ErrorGroup;
use gpuav_protocol::{ErrorRecord, FormatString, PrintfError, ValueMasks};

use crate::decode::{ErrorDecoder, LogContext};
use crate::diagnostics::Finding;
use crate::error::GpuAvError;

pub const RULE_DEBUG_PRINTF: &str = "UNASSIGNED-DEBUG-PRINTF";
pub const RULE_PRINTF_DECODE: &str = "UNASSIGNED-DEBUG-PRINTF-decode";

/// Parameter word holding the format string id.
pub const STRING_ID_PARAM: usize = 0;
pub const FLOAT64_MASK_PARAM: usize = 1;
pub const SIGNED8_MASK_PARAM: usize = 2;
pub const SIGNED16_MASK_PARAM: usize = 3;
/// First payload word.
pub const VALUES_PARAM: usize = 4;

/// Parsed format strings keyed by `(shader_id, string_id)`.
#[derive(Debug, Default)]
pub struct FormatTable {
    formats: DashMap<(u32, u32), Arc<FormatString>>,
}

impl FormatTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and store `source`. A string already registered under the same
    /// key is replaced.
    pub fn register(&self, shader_id: u32, string_id: u32, source: &str) -> Result<(), PrintfError> {
        let parsed = FormatString::parse(source)?;
        self.formats.insert((shader_id, string_id), Arc::new(parsed));
        Ok(())
    }

    pub fn get(&self, shader_id: u32, string_id: u32) -> Option<Arc<FormatString>> {
        self.formats.get(&(shader_id, string_id)).map(|e| e.value().clone())
    }

    /// Drop every string of `shader_id`, e.g. when its module is destroyed.
    pub fn remove_shader(&self, shader_id: u32) {
        self.formats.retain(|(shader, _), _| *shader != shader_id);
    }

    pub fn len(&self) -> usize {
        self.formats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }

    /// Register every entry of a format file, stopping at the first string
    /// that does not parse.
    pub fn load(&self, file: &FormatFile) -> Result<usize, PrintfError> {
        for entry in &file.formats {
            self.register(entry.shader, entry.id, &entry.text)?;
        }
        debug!(count = file.formats.len(), "format strings registered");
        Ok(file.formats.len())
    }

    /// Render a printf record's payload. `Err` carries the reason it could not be.
    pub fn render(&self, record: &ErrorRecord<'_>) -> Result<String, PrintfError> {
        let string_id = record.param(STRING_ID_PARAM);
        let format = self
            .get(record.shader_id(), string_id)
            .ok_or(PrintfError::UnknownFormat {
                shader_id: record.shader_id(),
                string_id,
            })?;
        let masks = ValueMasks {
            float64: record.param(FLOAT64_MASK_PARAM),
            signed8: record.param(SIGNED8_MASK_PARAM),
            signed16: record.param(SIGNED16_MASK_PARAM),
        };
        let values = record.params().get(VALUES_PARAM..).unwrap_or(&[]);
        format.render_words(values, masks).map(|(text, _)| text)
    }
}

/// On-disk form of a format table, as written next to instrumented shaders.
///
/// ```toml
/// [[formats]]
/// shader = 3
/// id = 0
/// text = "x=%d"
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct FormatFile {
    #[serde(default)]
    pub formats: Vec<FormatEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FormatEntry {
    pub shader: u32,
    pub id: u32,
    pub text: String,
}

impl FormatFile {
    pub fn from_toml_str(s: &str) -> Result<Self, GpuAvError> {
        toml::from_str(s).map_err(|e| GpuAvError::Config(e.to_string()))
    }

    pub fn load(path: &std::path::Path) -> Result<Self, GpuAvError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }
}

/// Renders group `0xFF` records against a shared [`FormatTable`].
pub struct PrintfDecoder {
    table: Arc<FormatTable>,
}

impl PrintfDecoder {
    pub fn new(table: Arc<FormatTable>) -> Self {
        Self { table }
    }
}

impl ErrorDecoder for PrintfDecoder {
    fn decode(&self, record: &ErrorRecord<'_>, _log: &LogContext<'_>) -> Option<Finding> {
        if record.group() != ErrorGroup::DEBUG_PRINTF {
            return None;
        }
        Some(match self.table.render(record) {
            Ok(text) => Finding::info(RULE_DEBUG_PRINTF, text),
            Err(e) => Finding::warning(RULE_PRINTF_DECODE, format!("Debug printf record could not be rendered: {e}")),
        })
    }
}
