//! Compiler seam.
//!
//! The control plane never looks inside a program. It asks a [`Toolchain`] to
//! parse source into a [`SyntaxTree`], instruments that tree, and asks the
//! toolchain again to turn it into an [`EntryPoint`]. The result is wrapped
//! in an immutable [`CompiledModule`].

use crate::error::Fault;
use crate::program::{EntryPoint, ProgramHost};
use crate::syntax::SyntaxTree;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

/// Diagnostic severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
        }
    }
}

/// A compiler message tied to a source line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub file: String,
    pub line: u32,
    pub message: String,
}

impl Diagnostic {
    pub fn error(file: &str, line: u32, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            file: file.to_string(),
            line,
            message: message.into(),
        }
    }

    pub fn warning(file: &str, line: u32, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            file: file.to_string(),
            line,
            message: message.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({}): {}: {}", self.file, self.line, self.severity, self.message)
    }
}

/// What a compile produced: an entry point when it succeeded, plus messages.
pub struct CompileOutput {
    pub entry: Option<Arc<dyn EntryPoint>>,
    pub diagnostics: Vec<Diagnostic>,
}

impl CompileOutput {
    pub fn success(entry: Arc<dyn EntryPoint>, diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            entry: Some(entry),
            diagnostics,
        }
    }

    pub fn failure(diagnostics: Vec<Diagnostic>) -> Self {
        Self {
            entry: None,
            diagnostics,
        }
    }
}

impl fmt::Debug for CompileOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompileOutput")
            .field("entry", &self.entry.is_some())
            .field("diagnostics", &self.diagnostics)
            .finish()
    }
}

/// Front end plus code generator for one source language.
///
/// Both methods run on a blocking thread.
pub trait Toolchain: Send + Sync {
    /// Parse `source`, attributing positions to `file`.
    fn parse(&self, file: &str, source: &str) -> Result<SyntaxTree, Vec<Diagnostic>>;

    /// Compile an (already instrumented) tree.
    fn compile(&self, tree: &SyntaxTree, references: &[String]) -> CompileOutput;
}

/// Opaque identifier for a compiled module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModuleHandle(Uuid);

impl ModuleHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ModuleHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A successfully compiled program.
///
/// Failed compiles never produce one, so holding a `CompiledModule` means the
/// build succeeded. Modules are replaced on rebuild, never mutated.
#[derive(Clone)]
pub struct CompiledModule {
    handle: ModuleHandle,
    entry: Arc<dyn EntryPoint>,
    diagnostics: Vec<Diagnostic>,
    checkpoints: usize,
    compiled_at: DateTime<Utc>,
}

impl CompiledModule {
    pub fn new(entry: Arc<dyn EntryPoint>, diagnostics: Vec<Diagnostic>, checkpoints: usize) -> Self {
        Self {
            handle: ModuleHandle::new(),
            entry,
            diagnostics,
            checkpoints,
            compiled_at: Utc::now(),
        }
    }

    /// Wrap a hand-written entry point, bypassing any toolchain.
    pub fn from_entry(entry: impl EntryPoint + 'static) -> Self {
        Self::new(Arc::new(entry), Vec::new(), 0)
    }

    /// Wrap a closure as the entry point.
    pub fn from_fn(
        f: impl Fn(&mut ProgramHost) -> Result<(), Fault> + Send + Sync + 'static,
    ) -> Self {
        Self::from_entry(f)
    }

    pub fn handle(&self) -> ModuleHandle {
        self.handle
    }

    pub fn entry(&self) -> Arc<dyn EntryPoint> {
        Arc::clone(&self.entry)
    }

    /// Warnings carried over from the compile.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Number of checkpoints instrumented into this module.
    pub fn checkpoints(&self) -> usize {
        self.checkpoints
    }

    pub fn compiled_at(&self) -> DateTime<Utc> {
        self.compiled_at
    }
}

impl fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledModule")
            .field("handle", &self.handle)
            .field("diagnostics", &self.diagnostics.len())
            .field("checkpoints", &self.checkpoints)
            .field("compiled_at", &self.compiled_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_display() {
        let diag = Diagnostic::error("Program.sp", 4, "unclosed block");
        assert_eq!(diag.to_string(), "Program.sp(4): error: unclosed block");
        assert!(diag.is_error());
        assert!(!Diagnostic::warning("Program.sp", 1, "x").is_error());
    }

    #[test]
    fn test_module_handles_are_unique() {
        let a = CompiledModule::from_fn(|_| Ok(()));
        let b = a.clone();
        let c = CompiledModule::from_fn(|_| Ok(()));
        assert_eq!(a.handle(), b.handle());
        assert_ne!(a.handle(), c.handle());
        assert_eq!(a.checkpoints(), 0);
    }
}
