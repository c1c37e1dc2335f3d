//! Source locations threaded through tokens, AST nodes, and errors.

use std::fmt;
use std::rc::Rc;

/// A source file identity, shared cheaply between every token and node that
/// came from it.
///
/// `None` path denotes the top-level source passed directly to `parse`
/// (no file backing it, e.g. a string given by an embedder).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceName(Rc<str>);

impl SourceName {
    pub fn new(name: impl Into<Rc<str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A point in a source stream: file, line, column (all 1-based; `0` means
/// synthetic/unknown, per DESIGN.md's decision on §9's open question about
/// locationless errors).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceLoc {
    pub file: Option<SourceName>,
    pub line: u32,
    pub col: u32,
}

impl SourceLoc {
    pub const fn synthetic() -> Self {
        Self { file: None, line: 0, col: 0 }
    }

    pub fn new(file: Option<SourceName>, line: u32, col: u32) -> Self {
        Self { file, line, col }
    }
}

impl Default for SourceLoc {
    fn default() -> Self {
        Self::synthetic()
    }
}

impl fmt::Display for SourceLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.file {
            Some(name) => write!(f, "{name}:{}:{}", self.line, self.col),
            None => write!(f, "<unknown>:{}:{}", self.line, self.col),
        }
    }
}
