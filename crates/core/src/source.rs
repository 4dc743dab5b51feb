//! Source locations, carried by every AST node and every `Value::Error`.
//!
//! Grounded on `tenor-core::ast::Provenance` (`{file, line}`), widened to
//! the offsets the spec requires for diagnostics and coverage tooling.

use std::fmt;

/// A span of source text, identified by document name plus line and byte
/// offsets within it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceLocation {
    pub document_name: String,
    pub line: u32,
    pub start_offset: u32,
    pub end_offset: u32,
}

impl SourceLocation {
    pub fn new(document_name: impl Into<String>, line: u32, start_offset: u32, end_offset: u32) -> Self {
        SourceLocation {
            document_name: document_name.into(),
            line,
            start_offset,
            end_offset,
        }
    }

    /// A placeholder location for values synthesized outside any document
    /// (e.g. constant-folded at compile time, or produced by the broker).
    pub fn synthetic(document_name: impl Into<String>) -> Self {
        SourceLocation {
            document_name: document_name.into(),
            line: 0,
            start_offset: 0,
            end_offset: 0,
        }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} [{}..{}]",
            self.document_name, self.line, self.start_offset, self.end_offset
        )
    }
}
