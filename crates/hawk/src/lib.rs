//! An embeddable interpreter for the Hawk AWK-dialect language.
//!
//! This crate implements the lexer, parser, value/heap model, and
//! tree-walking runtime described by the engine's design; it is deliberately
//! silent on how source is located, how `getline`/`print` talk to the
//! outside world, and how raw bytes become characters — those boundaries are
//! traits ([`io::SourceIo`], [`io::RioHandler`], [`io::CharManager`]) an
//! embedder supplies.

pub mod ast;
pub mod error;
pub mod gc;
pub mod heap;
pub mod io;
pub mod lexer;
pub mod loc;
pub mod modules;
pub mod options;
pub mod parser;
pub mod record;
pub mod rtx;
pub mod token;
pub mod trace;
pub mod value;

pub use error::{ErrorKind, Gem, HawkError, HawkResult};
pub use options::Options;
pub use rtx::Engine;
pub use trace::Tracer;
