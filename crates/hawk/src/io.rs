//! External interface boundaries (spec §6): source input/deparse output,
//! runtime I/O (RIO), and the character manager. The core only specifies
//! these traits; concrete handlers (files, pipes, console, transcoding) are
//! the embedding wrapper's job and stay out of scope, matching spec §1.

use crate::error::HawkResult;

/// Caller-supplied source for lexing (spec §6.1). An embedder implements this
/// over a file, an in-memory string, or anything else a `@include` should be
/// able to open.
pub trait SourceIo {
    /// Opens `path` (or the top-level source when `path` is `None`) and
    /// returns a handle the lexer will pass back to subsequent calls.
    fn open(&mut self, path: Option<&str>) -> HawkResult<u64>;
    fn close(&mut self, handle: u64) -> HawkResult<()>;
    /// Reads up to `buf.len()` characters, returning the number read (`0` at EOF).
    fn read(&mut self, handle: u64, buf: &mut [char]) -> HawkResult<usize>;
}

/// An in-memory `SourceIo` backed by a fixed set of named strings, the
/// minimal implementation `hawk-cli` and tests need to actually run a
/// program (the concrete file/pipe/console handlers this spec excludes).
#[derive(Debug, Default)]
pub struct MemorySourceIo {
    sources: Vec<(Option<String>, Vec<char>, usize)>,
}

impl MemorySourceIo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the top-level source (no path).
    pub fn with_main(mut self, content: &str) -> Self {
        self.sources.push((None, content.chars().collect(), 0));
        self
    }

    /// Registers an includable source under `path`, resolved on `@include`.
    pub fn with_named(mut self, path: &str, content: &str) -> Self {
        self.sources.push((Some(path.to_owned()), content.chars().collect(), 0));
        self
    }
}

impl SourceIo for MemorySourceIo {
    fn open(&mut self, path: Option<&str>) -> HawkResult<u64> {
        for (idx, (name, _, pos)) in self.sources.iter_mut().enumerate() {
            if name.as_deref() == path {
                *pos = 0;
                return Ok(idx as u64);
            }
        }
        Err(crate::error::HawkError::system(format!(
            "cannot open source {path:?}"
        )))
    }

    fn close(&mut self, _handle: u64) -> HawkResult<()> {
        Ok(())
    }

    fn read(&mut self, handle: u64, buf: &mut [char]) -> HawkResult<usize> {
        let (_, content, pos) = &mut self.sources[handle as usize];
        let n = buf.len().min(content.len() - *pos);
        buf[..n].copy_from_slice(&content[*pos..*pos + n]);
        *pos += n;
        Ok(n)
    }
}

/// The I/O domain a [`RioHandler`] serves (spec §6.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RioDomain {
    File,
    Pipe,
    Console,
}

/// Mode a RIO stream was opened under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RioMode {
    Read,
    Write,
    Append,
    ReadWrite,
}

/// Host-supplied handler for runtime I/O: `getline`/`print`/`printf` and
/// their redirections (spec §6.2). The core calls these; it never opens a
/// file descriptor itself.
pub trait RioHandler {
    /// `domain` tells the host which kind of name `name` is — a path, a
    /// shell command line, or the console's own pseudo-name (`"-"`) — since
    /// `mode` alone can't distinguish `> file` from `| cmd`.
    fn open(&mut self, name: &str, mode: RioMode, domain: RioDomain) -> HawkResult<u64>;
    fn close(&mut self, handle: u64) -> HawkResult<()>;
    /// Reads one record (up to and including the record separator) as bytes;
    /// `Ok(None)` signals EOF.
    fn read(&mut self, handle: u64) -> HawkResult<Option<Vec<u8>>>;
    fn write(&mut self, handle: u64, data: &[u8]) -> HawkResult<usize>;
    fn flush(&mut self, handle: u64) -> HawkResult<()>;
    /// Console-only: advances to the next input source (e.g. next ARGV file).
    fn next(&mut self, _handle: u64) -> HawkResult<bool> {
        Ok(false)
    }
}

/// Per-engine or per-RIO pluggable transcoder (spec §6.3), used at I/O
/// boundaries and to expand narrow-character `\u`/`\U` escapes.
pub trait CharManager {
    /// Decodes one character from `bytes`, returning `(codepoint, bytes_consumed)`.
    fn bc_to_uc(&self, bytes: &[u8]) -> Option<(u32, usize)>;
    /// Encodes `codepoint` into `out`, returning bytes written.
    fn uc_to_bc(&self, codepoint: u32, out: &mut Vec<u8>) -> usize;
}

/// The default, and only core-provided, character manager: UTF-8. A host may
/// substitute UTF-16/MB8 transcoding by implementing [`CharManager`] itself.
#[derive(Debug, Default, Clone, Copy)]
pub struct Utf8CharManager;

impl CharManager for Utf8CharManager {
    fn bc_to_uc(&self, bytes: &[u8]) -> Option<(u32, usize)> {
        let s = std::str::from_utf8(bytes).ok()?;
        let c = s.chars().next()?;
        Some((c as u32, c.len_utf8()))
    }

    fn uc_to_bc(&self, codepoint: u32, out: &mut Vec<u8>) -> usize {
        let c = char::from_u32(codepoint).unwrap_or('\u{FFFD}');
        let start = out.len();
        let mut buf = [0u8; 4];
        out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
        out.len() - start
    }
}
