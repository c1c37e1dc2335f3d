//! Runtime execution tracing infrastructure.
//!
//! Mirrors the bytecode VM's tracer design from the teacher crate, adapted to
//! a tree-walking evaluator: hooks fire at statement/expression boundaries,
//! function calls, and GC collections instead of at opcode dispatch.
//!
//! [`NoopTracer`] is the zero-overhead default; [`StderrTracer`] is a
//! human-readable log; [`RecordingTracer`] buffers events for tests that want
//! to assert on what the runtime actually did (e.g. "exactly one GC
//! collection of generation 0 happened").

/// A single traced event.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    /// A statement started executing, identified by its source line.
    Statement { line: u32 },
    /// A user or intrinsic function was called.
    Call { name: String, depth: usize },
    /// A function call returned.
    Return { depth: usize },
    /// A GC collection ran on the given generation.
    GcCollect { generation: u8, freed: usize },
    /// A module was resolved and loaded into the registry.
    ModuleLoad { namespace: String },
    /// A record was read from the input stream.
    RecordRead { nr: i64, nf: i64 },
}

/// Hook points a tree-walking runtime fires while executing a program.
///
/// All methods default to no-ops, so implementations only override the
/// hooks they care about, and `NoopTracer` costs nothing at the call sites.
pub trait Tracer: std::fmt::Debug {
    fn on_statement(&mut self, _line: u32) {}
    fn on_call(&mut self, _name: &str, _depth: usize) {}
    fn on_return(&mut self, _depth: usize) {}
    fn on_gc_collect(&mut self, _generation: u8, _freed: usize) {}
    fn on_module_load(&mut self, _namespace: &str) {}
    fn on_record_read(&mut self, _nr: i64, _nf: i64) {}
}

/// Zero-cost default tracer.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl Tracer for NoopTracer {}

/// Prints one line per event to stderr. Useful for interactive debugging.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrTracer;

impl Tracer for StderrTracer {
    fn on_statement(&mut self, line: u32) {
        eprintln!("stmt @ line {line}");
    }

    fn on_call(&mut self, name: &str, depth: usize) {
        eprintln!("{}call {name} (depth {depth})", "  ".repeat(depth));
    }

    fn on_return(&mut self, depth: usize) {
        eprintln!("{}return (depth {depth})", "  ".repeat(depth));
    }

    fn on_gc_collect(&mut self, generation: u8, freed: usize) {
        eprintln!("gc: collected generation {generation}, freed {freed}");
    }

    fn on_module_load(&mut self, namespace: &str) {
        eprintln!("module load: {namespace}");
    }

    fn on_record_read(&mut self, nr: i64, nf: i64) {
        eprintln!("record read: NR={nr} NF={nf}");
    }
}

/// Buffers every event it receives, in order. Used by tests that want to
/// assert on runtime behavior (GC timing, call depth, module loads) without
/// reaching into private state.
#[derive(Debug, Default, Clone)]
pub struct RecordingTracer {
    pub events: Vec<TraceEvent>,
}

impl RecordingTracer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Tracer for RecordingTracer {
    fn on_statement(&mut self, line: u32) {
        self.events.push(TraceEvent::Statement { line });
    }

    fn on_call(&mut self, name: &str, depth: usize) {
        self.events.push(TraceEvent::Call { name: name.to_owned(), depth });
    }

    fn on_return(&mut self, depth: usize) {
        self.events.push(TraceEvent::Return { depth });
    }

    fn on_gc_collect(&mut self, generation: u8, freed: usize) {
        self.events.push(TraceEvent::GcCollect { generation, freed });
    }

    fn on_module_load(&mut self, namespace: &str) {
        self.events.push(TraceEvent::ModuleLoad { namespace: namespace.to_owned() });
    }

    fn on_record_read(&mut self, nr: i64, nf: i64) {
        self.events.push(TraceEvent::RecordRead { nr, nf });
    }
}
