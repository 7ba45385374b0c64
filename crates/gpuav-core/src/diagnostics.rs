//! User-facing diagnostics and where they go.

use std::fmt;

use ash::vk;
use parking_lot::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Warning => write!(f, "warning"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// What a decoder produces for a record it recognises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub severity: Severity,
    pub rule_id: String,
    pub message: String,
}

impl Finding {
    pub fn error(rule_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            rule_id: rule_id.into(),
            message: message.into(),
        }
    }

    pub fn warning(rule_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            rule_id: rule_id.into(),
            message: message.into(),
        }
    }

    pub fn info(rule_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            rule_id: rule_id.into(),
            message: message.into(),
        }
    }
}

/// A finding placed in its submission context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub rule_id: String,
    pub message: String,
    pub queue: vk::Queue,
    pub command_buffer: vk::CommandBuffer,
    /// Name of the checked command, when the action could be attributed.
    pub command: Option<String>,
    pub action_index: Option<u32>,
    /// Debug-label region active at the action, `outer::inner`.
    pub label_region: Option<String>,
    /// Stage, invocation and instruction details, when a record was involved.
    pub location: Option<String>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.rule_id, self.message)?;
        if let Some(command) = &self.command {
            write!(f, "\n  Command: {command}")?;
            if let Some(index) = self.action_index {
                write!(f, " (action {index})")?;
            }
        }
        if let Some(region) = &self.label_region {
            write!(f, "\n  Debug region: {region}")?;
        }
        if let Some(location) = &self.location {
            write!(f, "\n  {location}")?;
        }
        Ok(())
    }
}

pub trait DiagnosticSink: Send + Sync {
    fn emit(&self, diagnostic: &Diagnostic);
}

/// Forwards diagnostics to `tracing` under the `gpuav::diagnostic` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl DiagnosticSink for TracingSink {
    fn emit(&self, d: &Diagnostic) {
        let queue = format!("{:?}", d.queue);
        let command_buffer = format!("{:?}", d.command_buffer);
        match d.severity {
            Severity::Error => error!(
                target: "gpuav::diagnostic",
                rule_id = %d.rule_id,
                queue = %queue,
                command_buffer = %command_buffer,
                "{d}"
            ),
            Severity::Warning => warn!(
                target: "gpuav::diagnostic",
                rule_id = %d.rule_id,
                queue = %queue,
                command_buffer = %command_buffer,
                "{d}"
            ),
            Severity::Info => info!(
                target: "gpuav::diagnostic",
                rule_id = %d.rule_id,
                queue = %queue,
                command_buffer = %command_buffer,
                "{d}"
            ),
        }
    }
}

/// Keeps every diagnostic in memory.
#[derive(Debug, Default)]
pub struct CollectingSink {
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        self.diagnostics.lock().clone()
    }

    pub fn take(&self) -> Vec<Diagnostic> {
        std::mem::take(&mut *self.diagnostics.lock())
    }

    pub fn with_rule(&self, rule_id: &str) -> Vec<Diagnostic> {
        self.diagnostics
            .lock()
            .iter()
            .filter(|d| d.rule_id == rule_id)
            .cloned()
            .collect()
    }
}

impl DiagnosticSink for CollectingSink {
    fn emit(&self, diagnostic: &Diagnostic) {
        self.diagnostics.lock().push(diagnostic.clone());
    }
}
