//! Qualified names for functions and attributes: `<library.sub.name>`.
//!
//! Per spec Section 4.2: parsed into a list of parts, the last of which is
//! the simple name; the whole name is the dot-joined string. An empty part
//! list is invalid and is rejected by the constructors here (the compiler
//! turns that rejection into a `CompileError`).

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QualifiedName {
    parts: Vec<String>,
}

impl QualifiedName {
    /// Build from an explicit list of parts. Returns `None` if empty.
    pub fn from_parts(parts: Vec<String>) -> Option<Self> {
        if parts.is_empty() {
            None
        } else {
            Some(QualifiedName { parts })
        }
    }

    /// Parse `"library.sub.name"` into parts, splitting on `.`.
    /// Returns `None` for the empty string (no parts).
    pub fn parse(dotted: &str) -> Option<Self> {
        if dotted.is_empty() {
            return None;
        }
        Self::from_parts(dotted.split('.').map(str::to_owned).collect())
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    /// The last part: the simple (unqualified) name.
    pub fn simple_name(&self) -> &str {
        self.parts.last().expect("non-empty by construction")
    }

    /// The library prefix: every part but the last, dot-joined. Empty
    /// string for a single-part name.
    pub fn library(&self) -> String {
        self.parts[..self.parts.len().saturating_sub(1)].join(".")
    }

    /// The full dot-joined qualified name.
    pub fn full_name(&self) -> String {
        self.parts.join(".")
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.full_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_multi_part_name() {
        let qn = QualifiedName::parse("time.now").unwrap();
        assert_eq!(qn.simple_name(), "now");
        assert_eq!(qn.library(), "time");
        assert_eq!(qn.full_name(), "time.now");
    }

    #[test]
    fn single_part_has_empty_library() {
        let qn = QualifiedName::parse("subject").unwrap();
        assert_eq!(qn.simple_name(), "subject");
        assert_eq!(qn.library(), "");
    }

    #[test]
    fn empty_string_is_rejected() {
        assert!(QualifiedName::parse("").is_none());
    }

    #[test]
    fn empty_parts_list_is_rejected() {
        assert!(QualifiedName::from_parts(vec![]).is_none());
    }
}
