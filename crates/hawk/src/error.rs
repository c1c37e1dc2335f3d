//! GEM: the per-runtime error slot, rendered as `Gem`/`HawkError`.
//!
//! Every component threads a `&mut Gem` (or owns one) so failures are
//! reported uniformly: a component returns `Err`/`None`/`-1` per its own
//! calling convention and, on request, the caller can read back the precise
//! `HawkError` that was stashed.

use std::fmt;

use strum::Display;

use crate::loc::SourceLoc;

pub type HawkResult<T> = Result<T, HawkError>;

/// Error categories from spec §7, not further subdivided into a type per
/// condition (the conditions themselves are free-text messages, matching
/// how the source keeps one numeric code per message rather than a Rust-style
/// enum-per-condition).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ErrorKind {
    System,
    Syntax,
    Semantic,
    Runtime,
    Regex,
}

/// A fully located error: category, message, and where it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HawkError {
    pub kind: ErrorKind,
    pub message: String,
    pub loc: SourceLoc,
}

impl HawkError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, loc: SourceLoc) -> Self {
        Self { kind, message: message.into(), loc }
    }

    pub fn syntax(message: impl Into<String>, loc: SourceLoc) -> Self {
        Self::new(ErrorKind::Syntax, message, loc)
    }

    pub fn semantic(message: impl Into<String>, loc: SourceLoc) -> Self {
        Self::new(ErrorKind::Semantic, message, loc)
    }

    pub fn runtime(message: impl Into<String>, loc: SourceLoc) -> Self {
        Self::new(ErrorKind::Runtime, message, loc)
    }

    pub fn regex(message: impl Into<String>, loc: SourceLoc) -> Self {
        Self::new(ErrorKind::Regex, message, loc)
    }

    pub fn system(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::System, message, SourceLoc::synthetic())
    }
}

impl fmt::Display for HawkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.kind, self.message, self.loc)
    }
}

impl std::error::Error for HawkError {}

/// Per-runtime error context. Overwrites the previous error on each new
/// failure, matching the "stored in GEM, overwriting the previous error"
/// propagation policy of §7.
#[derive(Debug, Default)]
pub struct Gem {
    last_error: Option<HawkError>,
}

impl Gem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `err` as the last error and returns it, so call sites can
    /// write `return Err(gem.set(HawkError::syntax(...)))`.
    pub fn set(&mut self, err: HawkError) -> HawkError {
        self.last_error = Some(err.clone());
        err
    }

    pub fn last_error(&self) -> Option<&HawkError> {
        self.last_error.as_ref()
    }

    pub fn clear(&mut self) {
        self.last_error = None;
    }
}
