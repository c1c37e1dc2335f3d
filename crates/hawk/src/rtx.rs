//! Tree-walking runtime (spec §4.5). Frame layout follows §3.4: each call
//! pushes a [`Frame`] holding `arg0..arg(n-1), local0..local(m-1)` in one
//! contiguous slot array (params and locals share an index space, which is
//! also what lets a pass-by-reference [`RefTarget::Local`] address either).
//! The global table is a flat `Vec<Value>` sized by `Program::nglobals`,
//! seeded in the same fixed order the parser assigns static-global indices
//! in (see `statics` below) — this coupling to `parser::STATIC_GLOBALS` is
//! intentional and recorded in DESIGN.md.

use std::rc::Rc;

use ahash::RandomState;
use indexmap::IndexMap;

use crate::ast::{
    BinOp, Expr, FunctionDef, GetlineSource, IncDecOp, LValue, Literal, Pattern, Program, Redirect,
    Slot, Stmt, UnOp,
};
use crate::error::{Gem, HawkError, HawkResult};
use crate::gc;
use crate::heap::{Heap, HawkMap, HeapData};
use crate::io::{CharManager, RioDomain, RioHandler, RioMode};
use crate::loc::SourceLoc;
use crate::modules::{HawkModule, ModuleRegistry, Symbol};
use crate::options::{Options, Traits};
use crate::record::Record;
use crate::trace::{NoopTracer, Tracer};
use crate::value::{RefTarget, Value};

/// Fixed indices the parser assigns to the static globals, in declaration
/// order (spec §3.3's static-global list).
mod statics {
    pub const NR: u32 = 0;
    pub const NF: u32 = 1;
    pub const FS: u32 = 2;
    pub const RS: u32 = 3;
    pub const CONVFMT: u32 = 4;
    pub const OFMT: u32 = 5;
    pub const OFS: u32 = 6;
    pub const ORS: u32 = 7;
    pub const SUBSEP: u32 = 8;
    pub const FILENAME: u32 = 9;
    pub const FNR: u32 = 10;
    pub const RLENGTH: u32 = 11;
    pub const RSTART: u32 = 12;
    pub const OFILENAME: u32 = 13;
    pub const NUMSTRDETECT: u32 = 14;
    pub const IGNORECASE: u32 = 15;
    pub const STRIPRECSPC: u32 = 16;
    pub const STRIPSTRSPC: u32 = 17;
    pub const SCRIPTNAME: u32 = 18;
    pub const COUNT: u32 = 19;
}

/// One call frame: `nargs` slots bound to the callee's parameters, followed
/// by its locals, all in the same `Vec` (spec §3.4).
struct Frame {
    slots: Vec<Value>,
    /// Actual argument count this call was made with (what `@argc` reports;
    /// may exceed the function's declared parameter count when variadic).
    nargs: usize,
    /// Index into `slots` where locals begin. Always `>= params.len()`: a
    /// variadic call with fewer args than declared parameters still pads
    /// up to `params.len()` so `Slot::Param` indices stay valid.
    locals_offset: usize,
    func_idx: usize,
}

/// Resolves a `RefTarget::Local` against the frame one level below the
/// currently executing one — the caller that bound the reference. This
/// covers direct pass-by-reference (`function f(&x) {...}; f(n)`); a
/// reference forwarded through a second call, or stored somewhere that
/// outlives the caller's frame, reports a dangling reference instead of
/// silently addressing the wrong frame (documented simplification).
fn caller_frame(frames: &mut [Frame], slot: u32) -> HawkResult<&mut Frame> {
    let len = frames.len();
    if len < 2 {
        return Err(HawkError::runtime(format!("dangling local reference (slot {slot})"), SourceLoc::synthetic()));
    }
    Ok(&mut frames[len - 2])
}

/// How a statement or block finished, used to unwind control flow without
/// native exceptions (spec §4.5 "Control flow").
enum Flow {
    Normal,
    Break,
    Continue,
    Return(Value),
    Next,
    NextFile,
    NextOFile,
    Exit,
    Abort,
}

/// Coerces an argument to an integer without needing the full `Engine`
/// (only `&Heap` is available inside `HawkModule::call`): immediates convert
/// directly, heap scalars read through `Int`/`Float`, anything else is 0.
fn arg_as_i64(v: &Value, heap: &Heap) -> i64 {
    match v {
        Value::Nil => 0,
        Value::Int(i) => *i,
        Value::Char(c) => i64::from(u32::from(*c)),
        Value::ByteChar(b) => i64::from(*b),
        Value::Ref(id) => match heap.get(*id) {
            HeapData::Int(i) => *i,
            HeapData::Float(f) => *f as i64,
            _ => 0,
        },
    }
}

/// The `hawk` namespace: the GC user API from spec §4.4 (`gc`/`gc_collect`,
/// the per-generation threshold/pressure accessors, and `gcrefs`).
struct HawkModule_;

impl HawkModule for HawkModule_ {
    fn name(&self) -> &str {
        "hawk"
    }

    fn query(&self, sym: &str) -> Option<Symbol> {
        match sym {
            "gc" => Some(Symbol::Function { arity_min: 0, arity_max: Some(0) }),
            "gc_collect" => Some(Symbol::Function { arity_min: 0, arity_max: Some(1) }),
            "gc_get_threshold" => Some(Symbol::Function { arity_min: 1, arity_max: Some(1) }),
            "gc_set_threshold" => Some(Symbol::Function { arity_min: 2, arity_max: Some(2) }),
            "gc_get_pressure" => Some(Symbol::Function { arity_min: 1, arity_max: Some(1) }),
            "gcrefs" => Some(Symbol::Function { arity_min: 1, arity_max: Some(1) }),
            _ => None,
        }
    }

    fn call(&self, sym: &str, args: &[Value], heap: &mut Heap) -> HawkResult<Value> {
        match sym {
            "gc" => {
                gc::gc_collect(heap, 2);
                Ok(Value::Nil)
            }
            "gc_collect" => {
                let generation = args.first().map_or(-1, |v| arg_as_i64(v, heap));
                gc::gc_collect(heap, generation);
                Ok(Value::Nil)
            }
            "gc_get_threshold" => {
                let generation = arg_as_i64(&args[0], heap).clamp(0, 2) as u8;
                Ok(Value::make_int(gc::gc_get_threshold(heap, generation) as i64, heap))
            }
            "gc_set_threshold" => {
                let generation = arg_as_i64(&args[0], heap).clamp(0, 2) as u8;
                let value = arg_as_i64(&args[1], heap).max(0) as usize;
                gc::gc_set_threshold(heap, generation, value);
                Ok(Value::Nil)
            }
            "gc_get_pressure" => {
                let generation = arg_as_i64(&args[0], heap).clamp(0, 2) as u8;
                Ok(Value::make_int(gc::gc_get_pressure(heap, generation) as i64, heap))
            }
            "gcrefs" => Ok(Value::make_int(i64::from(gc::gcrefs(heap, &args[0])), heap)),
            other => Err(HawkError::semantic(format!("unknown hawk:: symbol '{other}'"), SourceLoc::synthetic())),
        }
    }
}

/// The tree-walking engine: owns the heap, the flat global table, the
/// current record, and every piece of mutable runtime state; borrows the
/// host-supplied RIO handler and character manager for the duration of a run
/// (spec §1 — those boundaries stay the embedder's concern).
pub struct Engine<'e> {
    heap: Heap,
    program: Program,
    func_index: IndexMap<Rc<str>, usize, RandomState>,
    globals: Vec<Value>,
    named: IndexMap<Rc<str>, Value, RandomState>,
    record: Record,
    gem: Gem,
    tracer: Box<dyn Tracer>,
    rio: &'e mut dyn RioHandler,
    cmgr: &'e dyn CharManager,
    modules: ModuleRegistry,
    traits: Traits,
    depth_limit: usize,
    in_handles: IndexMap<String, u64, RandomState>,
    out_handles: IndexMap<String, u64, RandomState>,
    main_handle: Option<u64>,
    rng_state: u64,
    rand_seed: i64,
    exit_code: i64,
    in_record_loop: bool,
    call_depth: usize,
}

impl<'e> Engine<'e> {
    pub fn new(
        program: Program,
        options: &Options,
        mut modules: ModuleRegistry,
        rio: &'e mut dyn RioHandler,
        cmgr: &'e dyn CharManager,
    ) -> Self {
        let mut func_index = IndexMap::default();
        for (i, f) in program.functions.iter().enumerate() {
            func_index.insert(f.name.clone(), i);
        }
        if !modules.contains("hawk") {
            modules.register(Rc::new(HawkModule_));
        }
        let mut heap = Heap::new();
        let mut globals: Vec<Value> =
            (0..program.nglobals.max(statics::COUNT) as usize).map(|_| Value::Nil).collect();
        let seed = |heap: &mut Heap, s: &str| Value::make_string(s.to_owned(), false, heap);
        globals[statics::NR as usize] = Value::Int(0);
        globals[statics::NF as usize] = Value::Int(0);
        globals[statics::FS as usize] = seed(&mut heap, " ");
        globals[statics::RS as usize] = seed(&mut heap, "\n");
        globals[statics::CONVFMT as usize] = seed(&mut heap, "%.17g");
        globals[statics::OFMT as usize] = seed(&mut heap, "%.17g");
        globals[statics::OFS as usize] = seed(&mut heap, " ");
        globals[statics::ORS as usize] = seed(&mut heap, "\n");
        globals[statics::SUBSEP as usize] = seed(&mut heap, "\u{1c}");
        globals[statics::FILENAME as usize] = seed(&mut heap, "");
        globals[statics::FNR as usize] = Value::Int(0);
        globals[statics::RLENGTH as usize] = Value::Int(-1);
        globals[statics::RSTART as usize] = Value::Int(0);
        globals[statics::OFILENAME as usize] = seed(&mut heap, "");
        globals[statics::NUMSTRDETECT as usize] = Value::Int(i64::from(options.traits.contains(Traits::NUMSTRDETECT)));
        globals[statics::IGNORECASE as usize] = Value::Int(0);
        globals[statics::STRIPRECSPC as usize] = Value::Int(i64::from(options.traits.contains(Traits::STRIPRECSPC)));
        globals[statics::STRIPSTRSPC as usize] = Value::Int(i64::from(options.traits.contains(Traits::STRIPSTRSPC)));
        globals[statics::SCRIPTNAME as usize] = seed(&mut heap, "");

        Self {
            heap,
            program,
            func_index,
            globals,
            named: IndexMap::default(),
            record: Record::new(),
            gem: Gem::new(),
            tracer: Box::new(NoopTracer),
            rio,
            cmgr,
            modules,
            traits: options.traits,
            depth_limit: options.depth.block_run,
            in_handles: IndexMap::default(),
            out_handles: IndexMap::default(),
            main_handle: None,
            rng_state: 0x2545_f491_4f6c_dd1d,
            rand_seed: 0,
            exit_code: 0,
            in_record_loop: false,
            call_depth: 0,
        }
    }

    pub fn with_tracer(mut self, tracer: Box<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    pub fn gem(&self) -> &Gem {
        &self.gem
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Sets the path the console RIO handler opens for the main record loop;
    /// `None` asks the handler for its default (typically stdin).
    pub fn set_main_source(&mut self, name: Option<&str>) -> HawkResult<()> {
        let domain = if name.is_some() { RioDomain::File } else { RioDomain::Console };
        let handle = self.rio.open(name.unwrap_or("-"), RioMode::Read, domain)?;
        self.main_handle = Some(handle);
        if let Some(n) = name {
            self.globals[statics::FILENAME as usize] = Value::make_string(n.to_owned(), false, &mut self.heap);
        }
        Ok(())
    }

    /// Runs `BEGIN` blocks, the record loop (if any chains exist and BEGIN
    /// didn't exit/abort), then `END` (spec §4.5 "Entry").
    pub fn run(&mut self) -> HawkResult<i64> {
        let begins = std::mem::take(&mut self.program.begin);
        let mut skip_main = false;
        let mut skip_end = false;
        for block in &begins {
            match self.exec_block(&mut Vec::new(), block)? {
                Flow::Exit => {
                    skip_main = true;
                    break;
                }
                Flow::Abort => {
                    skip_main = true;
                    skip_end = true;
                    break;
                }
                _ => {}
            }
        }
        self.program.begin = begins;

        if !skip_main && !self.program.chains.is_empty() {
            self.in_record_loop = true;
            if self.main_handle.is_none() {
                self.set_main_source(None)?;
            }
            'records: loop {
                let Some(handle) = self.main_handle else { break };
                let Some(bytes) = self.rio.read(handle)? else { break };
                let line = String::from_utf8_lossy(&bytes).into_owned();
                let fs = self.global_str(statics::FS);
                let strip = self.traits.contains(Traits::STRIPRECSPC);
                let re = self.field_regex(&fs)?;
                self.record.set_line(line, &fs, re.as_ref().map(|r| &r.re), strip);
                self.bump_int(statics::NR, 1);
                self.bump_int(statics::FNR, 1);
                self.globals[statics::NF as usize] = Value::Int(self.record.nf() as i64);
                self.tracer.on_record_read(self.read_int(statics::NR), self.read_int(statics::NF));

                let chains = std::mem::take(&mut self.program.chains);
                let mut flow_break = false;
                for chain in &chains {
                    let matched = match &chain.pattern {
                        Pattern::Always => true,
                        Pattern::Expr(e) => self.eval_expr(&mut Vec::new(), e)?.truthy(&self.heap),
                    };
                    if !matched {
                        continue;
                    }
                    let flow = match &chain.action {
                        Some(body) => self.exec_block(&mut Vec::new(), body)?,
                        None => {
                            let line = self.record.line().to_owned();
                            self.write_record_line(&line)?;
                            Flow::Normal
                        }
                    };
                    match flow {
                        Flow::Next => break,
                        Flow::NextFile => {
                            self.rio.next(handle)?;
                            break;
                        }
                        Flow::NextOFile => {
                            self.flush_all_outputs()?;
                        }
                        Flow::Exit => {
                            flow_break = true;
                            break;
                        }
                        Flow::Abort => {
                            flow_break = true;
                            skip_end = true;
                            break;
                        }
                        _ => {}
                    }
                }
                self.program.chains = chains;
                if flow_break {
                    break 'records;
                }
            }
            self.in_record_loop = false;
        }

        if !skip_end {
            let ends = std::mem::take(&mut self.program.end);
            for block in &ends {
                if matches!(self.exec_block(&mut Vec::new(), block)?, Flow::Exit | Flow::Abort) {
                    break;
                }
            }
            self.program.end = ends;
        }
        self.flush_all_outputs()?;
        Ok(self.exit_code)
    }

    fn flush_all_outputs(&mut self) -> HawkResult<()> {
        let handles: Vec<u64> = self.out_handles.values().copied().collect();
        for h in handles {
            self.rio.flush(h)?;
        }
        Ok(())
    }

    fn write_record_line(&mut self, line: &str) -> HawkResult<()> {
        let ors = self.global_str(statics::ORS);
        let handle = self.output_handle(None)?;
        self.rio.write(handle, line.as_bytes())?;
        self.rio.write(handle, ors.as_bytes())?;
        Ok(())
    }

    fn bump_int(&mut self, slot: u32, delta: i64) {
        let cur = self.read_int(slot);
        self.globals[slot as usize] = Value::Int(cur + delta);
    }

    fn read_int(&self, slot: u32) -> i64 {
        self.to_number(&self.globals[slot as usize]) as i64
    }

    fn global_str(&self, slot: u32) -> String {
        self.to_display_string(&self.globals[slot as usize])
    }

    fn field_regex(&mut self, fs: &str) -> HawkResult<Option<crate::heap::CompiledRegex>> {
        match crate::record::classify_fs(fs) {
            crate::record::FieldSplitter::Regex => {
                let re = regex::Regex::new(fs)
                    .map_err(|e| HawkError::regex(e.to_string(), SourceLoc::synthetic()))?;
                Ok(Some(crate::heap::CompiledRegex { source: Rc::from(fs), re }))
            }
            _ => Ok(None),
        }
    }

    // ---- output/input stream handles --------------------------------------

    fn output_handle(&mut self, redirect: Option<(&str, RioMode, RioDomain)>) -> HawkResult<u64> {
        let (name, mode, domain) = redirect.unwrap_or(("-", RioMode::Write, RioDomain::Console));
        let key = format!("{domain:?}:{mode:?}:{name}");
        if let Some(&h) = self.out_handles.get(&key) {
            return Ok(h);
        }
        let h = self.rio.open(name, mode, domain)?;
        self.out_handles.insert(key, h);
        Ok(h)
    }

    fn input_handle(&mut self, name: &str, mode: RioMode, domain: RioDomain) -> HawkResult<u64> {
        let key = format!("{domain:?}:{mode:?}:{name}");
        if let Some(&h) = self.in_handles.get(&key) {
            return Ok(h);
        }
        let h = self.rio.open(name, mode, domain)?;
        self.in_handles.insert(key, h);
        Ok(h)
    }

    fn close_stream(&mut self, name: &str) -> HawkResult<i64> {
        let mut closed = false;
        let out_keys: Vec<String> =
            self.out_handles.keys().filter(|k| k.ends_with(&format!(":{name}"))).cloned().collect();
        for k in out_keys {
            if let Some(h) = self.out_handles.shift_remove(&k) {
                self.rio.close(h)?;
                closed = true;
            }
        }
        let in_keys: Vec<String> =
            self.in_handles.keys().filter(|k| k.ends_with(&format!(":{name}"))).cloned().collect();
        for k in in_keys {
            if let Some(h) = self.in_handles.shift_remove(&k) {
                self.rio.close(h)?;
                closed = true;
            }
        }
        Ok(if closed { 0 } else { -1 })
    }

    // ---- statements ---------------------------------------------------------

    fn exec_block(&mut self, frames: &mut Vec<Frame>, stmts: &[Stmt]) -> HawkResult<Flow> {
        for stmt in stmts {
            match self.exec_stmt(frames, stmt)? {
                Flow::Normal => {}
                other => return Ok(other),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_stmt(&mut self, frames: &mut Vec<Frame>, stmt: &Stmt) -> HawkResult<Flow> {
        match stmt {
            Stmt::Block(stmts) => self.exec_block(frames, stmts),
            Stmt::Expr(e) => {
                let v = self.eval_expr(frames, e)?;
                v.drop_with_heap(&mut self.heap);
                Ok(Flow::Normal)
            }
            Stmt::If(cond, then_b, else_b) => {
                if self.eval_expr(frames, cond)?.truthy(&self.heap) {
                    self.exec_stmt(frames, then_b)
                } else if let Some(e) = else_b {
                    self.exec_stmt(frames, e)
                } else {
                    Ok(Flow::Normal)
                }
            }
            Stmt::While(cond, body) => {
                while self.eval_expr(frames, cond)?.truthy(&self.heap) {
                    match self.exec_stmt(frames, body)? {
                        Flow::Break => break,
                        Flow::Continue | Flow::Normal => {}
                        other => return Ok(other),
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::DoWhile(body, cond) => {
                loop {
                    match self.exec_stmt(frames, body)? {
                        Flow::Break => break,
                        Flow::Continue | Flow::Normal => {}
                        other => return Ok(other),
                    }
                    if !self.eval_expr(frames, cond)?.truthy(&self.heap) {
                        break;
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::For(init, cond, step, body) => {
                if let Some(i) = init {
                    match self.exec_stmt(frames, i)? {
                        Flow::Normal => {}
                        other => return Ok(other),
                    }
                }
                loop {
                    if let Some(c) = cond {
                        if !self.eval_expr(frames, c)?.truthy(&self.heap) {
                            break;
                        }
                    }
                    match self.exec_stmt(frames, body)? {
                        Flow::Break => break,
                        Flow::Continue | Flow::Normal => {}
                        other => return Ok(other),
                    }
                    if let Some(s) = step {
                        match self.exec_stmt(frames, s)? {
                            Flow::Normal => {}
                            other => return Ok(other),
                        }
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::ForIn(key_slot, arr_slot, body) => {
                let arr_val = self.slot_get(frames, arr_slot)?;
                let Value::Ref(id) = arr_val else {
                    arr_val.drop_with_heap(&mut self.heap);
                    return Ok(Flow::Normal);
                };
                let keys: Vec<Rc<str>> = match self.heap.get(id) {
                    HeapData::Map(m) => m.keys().cloned().collect(),
                    HeapData::Array(a) => (1..=a.len()).map(|i| Rc::from(i.to_string().as_str())).collect(),
                    _ => Vec::new(),
                };
                self.heap.refdown(id);
                for key in keys {
                    let kv = Value::make_string(key.to_string(), true, &mut self.heap);
                    self.slot_set(frames, key_slot, kv)?;
                    match self.exec_stmt(frames, body)? {
                        Flow::Break => break,
                        Flow::Continue | Flow::Normal => {}
                        other => return Ok(other),
                    }
                }
                Ok(Flow::Normal)
            }
            Stmt::Switch(scrutinee, cases, default) => {
                let v = self.eval_expr(frames, scrutinee)?;
                let mut matched_body: Option<&[Stmt]> = None;
                'outer: for case in cases {
                    for label in &case.labels {
                        if self.literal_eq(&v, label) {
                            matched_body = Some(&case.body);
                            break 'outer;
                        }
                    }
                }
                let body = matched_body.or(default.as_deref());
                v.drop_with_heap(&mut self.heap);
                match body {
                    Some(stmts) => match self.exec_block(frames, stmts)? {
                        Flow::Break => Ok(Flow::Normal),
                        other => Ok(other),
                    },
                    None => Ok(Flow::Normal),
                }
            }
            Stmt::Break(_) => Ok(Flow::Break),
            Stmt::Continue(_) => Ok(Flow::Continue),
            Stmt::Return(expr, _) => {
                let v = match expr {
                    Some(e) => self.eval_expr(frames, e)?,
                    None => Value::Nil,
                };
                Ok(Flow::Return(v))
            }
            Stmt::Exit(expr, _) => {
                if let Some(e) = expr {
                    let v = self.eval_expr(frames, e)?;
                    self.exit_code = self.to_number(&v) as i64;
                    v.drop_with_heap(&mut self.heap);
                }
                Ok(Flow::Exit)
            }
            Stmt::Abort(expr, _) => {
                if let Some(e) = expr {
                    let v = self.eval_expr(frames, e)?;
                    self.exit_code = self.to_number(&v) as i64;
                    v.drop_with_heap(&mut self.heap);
                }
                Ok(Flow::Abort)
            }
            Stmt::Next(loc) => {
                if !self.in_record_loop {
                    return Err(HawkError::runtime("next used outside the record loop", loc.clone()));
                }
                Ok(Flow::Next)
            }
            Stmt::NextFile(loc) => {
                if !self.in_record_loop {
                    return Err(HawkError::runtime("nextfile used outside the record loop", loc.clone()));
                }
                Ok(Flow::NextFile)
            }
            Stmt::NextOFile(_) => Ok(Flow::NextOFile),
            Stmt::Delete(slot, indices, _) => {
                let v = self.slot_get(frames, slot)?;
                if let Value::Ref(id) = v {
                    if indices.is_empty() {
                        if let HeapData::Map(m) = self.heap.get_mut(id) {
                            let drained: Vec<Value> = m.drain(..).map(|(_, v)| v).collect();
                            for d in drained {
                                self.heap.gc_aware_refdown_value(d);
                            }
                        } else if let HeapData::Array(a) = self.heap.get_mut(id) {
                            let drained = std::mem::take(a);
                            for d in drained {
                                self.heap.gc_aware_refdown_value(d);
                            }
                        }
                    } else {
                        let key = self.eval_expr(frames, &indices[0])?;
                        let key_str = self.to_display_string(&key);
                        key.drop_with_heap(&mut self.heap);
                        if let HeapData::Map(m) = self.heap.get_mut(id) {
                            if let Some(old) = m.shift_remove(key_str.as_str()) {
                                self.heap.gc_aware_refdown_value(old);
                            }
                        }
                    }
                    self.heap.refdown(id);
                } else {
                    v.drop_with_heap(&mut self.heap);
                }
                Ok(Flow::Normal)
            }
            Stmt::Reset(slot, _) => {
                self.slot_set(frames, slot, Value::Nil)?;
                Ok(Flow::Normal)
            }
            Stmt::Print(args, redirect, _) => {
                let ofs = self.global_str(statics::OFS);
                let ors = self.global_str(statics::ORS);
                let parts = if args.is_empty() {
                    vec![self.record.line().to_owned()]
                } else {
                    let mut out = Vec::with_capacity(args.len());
                    for a in args {
                        let v = self.eval_expr(frames, a)?;
                        out.push(self.to_print_string(&v));
                        v.drop_with_heap(&mut self.heap);
                    }
                    out
                };
                let line = parts.join(&ofs);
                let handle = self.redirect_handle(frames, redirect)?;
                self.rio.write(handle, line.as_bytes())?;
                self.rio.write(handle, ors.as_bytes())?;
                Ok(Flow::Normal)
            }
            Stmt::Printf(args, redirect, loc) => {
                if args.is_empty() {
                    return Err(HawkError::runtime("printf requires a format string", loc.clone()));
                }
                let mut vals = Vec::with_capacity(args.len());
                for a in args {
                    vals.push(self.eval_expr(frames, a)?);
                }
                let fmt = self.to_display_string(&vals[0]);
                let text = self.sprintf(&fmt, &vals[1..])?;
                for v in vals {
                    v.drop_with_heap(&mut self.heap);
                }
                let handle = self.redirect_handle(frames, redirect)?;
                self.rio.write(handle, text.as_bytes())?;
                Ok(Flow::Normal)
            }
        }
    }

    fn redirect_handle(&mut self, frames: &mut Vec<Frame>, redirect: &Option<Redirect>) -> HawkResult<u64> {
        match redirect {
            None => self.output_handle(None),
            Some(Redirect::Truncate(e)) => {
                let v = self.eval_expr(frames, e)?;
                let name = self.to_display_string(&v);
                v.drop_with_heap(&mut self.heap);
                self.output_handle(Some((&name, RioMode::Write, RioDomain::File)))
            }
            Some(Redirect::Append(e)) => {
                let v = self.eval_expr(frames, e)?;
                let name = self.to_display_string(&v);
                v.drop_with_heap(&mut self.heap);
                self.output_handle(Some((&name, RioMode::Append, RioDomain::File)))
            }
            Some(Redirect::Pipe(e)) => {
                let v = self.eval_expr(frames, e)?;
                let name = self.to_display_string(&v);
                v.drop_with_heap(&mut self.heap);
                self.output_handle(Some((&name, RioMode::Write, RioDomain::Pipe)))
            }
            Some(Redirect::BidirPipe(e)) => {
                let v = self.eval_expr(frames, e)?;
                let name = self.to_display_string(&v);
                v.drop_with_heap(&mut self.heap);
                self.output_handle(Some((&name, RioMode::ReadWrite, RioDomain::Pipe)))
            }
        }
    }

    fn literal_eq(&self, v: &Value, lit: &Literal) -> bool {
        match lit {
            Literal::Int(i) => (self.to_number(v) - *i as f64).abs() < f64::EPSILON,
            Literal::Float(f) => (self.to_number(v) - *f).abs() < f64::EPSILON,
            Literal::Str(s) => self.to_display_string(v) == s.as_ref(),
            Literal::Char(c) => self.to_display_string(v) == c.to_string(),
            _ => false,
        }
    }

    // ---- slots / lvalues ----------------------------------------------------

    fn slot_get(&mut self, frames: &mut Vec<Frame>, slot: &Slot) -> HawkResult<Value> {
        let raw = match slot {
            Slot::Global(i) => self.globals[*i as usize].clone_with_heap(&mut self.heap),
            Slot::Param(i) => {
                let frame = frames.last().expect("param access outside a frame");
                frame.slots[*i as usize].clone_with_heap(&mut self.heap)
            }
            Slot::Local(i) => {
                let frame = frames.last().expect("local access outside a frame");
                frame.slots[frame.locals_offset + *i as usize].clone_with_heap(&mut self.heap)
            }
            Slot::Named(name) => self.named.get(name).map_or(Value::Nil, |v| v.clone_with_heap(&mut self.heap)),
            Slot::SelfFunction => {
                let frame = frames.last().expect("self-function reference outside a frame");
                Value::Ref(self.heap.alloc_function_ref(frame.func_idx as u32))
            }
        };
        self.deref_if_reference(frames, raw)
    }

    fn slot_set(&mut self, frames: &mut Vec<Frame>, slot: &Slot, value: Value) -> HawkResult<()> {
        match slot {
            Slot::Global(i) => {
                let i = *i as usize;
                let current = self.globals[i].clone_with_heap(&mut self.heap);
                self.store_through_reference(frames, &current, value, |eng, _frames, v| {
                    let old = std::mem::replace(&mut eng.globals[i], v);
                    old.drop_with_heap(&mut eng.heap);
                })
            }
            Slot::Param(i) => {
                let idx = *i as usize;
                let current = frames.last().expect("param access outside a frame").slots[idx].clone_with_heap(&mut self.heap);
                self.store_through_reference(frames, &current, value, |eng, frames, v| {
                    let frame = frames.last_mut().expect("param access outside a frame");
                    let old = std::mem::replace(&mut frame.slots[idx], v);
                    old.drop_with_heap(&mut eng.heap);
                })
            }
            Slot::Local(i) => {
                let frame = frames.last().expect("local access outside a frame");
                let idx = frame.locals_offset + *i as usize;
                let current = frame.slots[idx].clone_with_heap(&mut self.heap);
                self.store_through_reference(frames, &current, value, |eng, frames, v| {
                    let frame = frames.last_mut().expect("local access outside a frame");
                    let old = std::mem::replace(&mut frame.slots[idx], v);
                    old.drop_with_heap(&mut eng.heap);
                })
            }
            Slot::Named(name) => {
                let current = self.named.get(name).map(|v| v.clone_with_heap(&mut self.heap)).unwrap_or(Value::Nil);
                let name = name.clone();
                self.store_through_reference(frames, &current, value, move |eng, _frames, v| {
                    if let Some(old) = eng.named.insert(name.clone(), v) {
                        old.drop_with_heap(&mut eng.heap);
                    }
                })
            }
            Slot::SelfFunction => Err(HawkError::runtime("cannot assign to a function's own name", SourceLoc::synthetic())),
        }
    }

    /// If `current` is a reference cell, writes `value` through to its
    /// target instead of overwriting the reference itself (spec §4.3
    /// "assigning through it refcounts the target in place"). Otherwise
    /// invokes `store_direct` to replace the raw slot.
    fn store_through_reference(
        &mut self,
        frames: &mut Vec<Frame>,
        current: &Value,
        value: Value,
        store_direct: impl FnOnce(&mut Self, &mut Vec<Frame>, Value),
    ) -> HawkResult<()> {
        if let Value::Ref(id) = current {
            if let HeapData::Reference(target) = self.heap.get(*id) {
                let target = target.clone();
                self.heap.refdown(*id);
                return self.set_reference_target(frames, &target, value);
            }
        }
        store_direct(self, frames, value);
        Ok(())
    }

    fn deref_if_reference(&mut self, frames: &mut Vec<Frame>, v: Value) -> HawkResult<Value> {
        if let Value::Ref(id) = v {
            if let HeapData::Reference(target) = self.heap.get(id) {
                let target = target.clone();
                self.heap.refdown(id);
                return self.get_reference_target(frames, &target);
            }
        }
        Ok(v)
    }

    /// Resolves a `RefTarget::Local` against the frame one level below the
    /// currently executing one — the caller that bound the reference. This
    /// covers direct pass-by-reference (`function f(&x) {...}; f(n)`); a
    /// reference forwarded through a second call, or stored somewhere that
    /// outlives the caller's frame, reports a dangling reference instead of
    /// silently addressing the wrong frame.
    fn get_reference_target(&mut self, frames: &mut Vec<Frame>, target: &RefTarget) -> HawkResult<Value> {
        match target {
            RefTarget::Global(i) => Ok(self.globals[*i as usize].clone_with_heap(&mut self.heap)),
            RefTarget::Local(i) => {
                let frame = caller_frame(frames, *i)?;
                Ok(frame.slots[*i as usize].clone_with_heap(&mut self.heap))
            }
            RefTarget::Field(k) => Ok(self.field_value(*k as usize)),
            RefTarget::Named(name) => {
                Ok(self.named.get(name).map_or(Value::Nil, |v| v.clone_with_heap(&mut self.heap)))
            }
            RefTarget::MapSlot(id, key) => {
                let v = self.heap.resolve(&RefTarget::MapSlot(*id, key.clone())).map(|v| match v {
                    Value::Ref(r) => Value::Ref(*r),
                    other => clone_immediate(other),
                });
                match v {
                    Some(Value::Ref(r)) => {
                        self.heap.refup(r);
                        Ok(Value::Ref(r))
                    }
                    Some(other) => Ok(other),
                    None => Ok(Value::Nil),
                }
            }
            RefTarget::ArraySlot(id, idx) => {
                let v = self.heap.resolve(&RefTarget::ArraySlot(*id, *idx)).map(|v| match v {
                    Value::Ref(r) => Value::Ref(*r),
                    other => clone_immediate(other),
                });
                match v {
                    Some(Value::Ref(r)) => {
                        self.heap.refup(r);
                        Ok(Value::Ref(r))
                    }
                    Some(other) => Ok(other),
                    None => Ok(Value::Nil),
                }
            }
        }
    }

    fn set_reference_target(&mut self, frames: &mut Vec<Frame>, target: &RefTarget, value: Value) -> HawkResult<()> {
        match target {
            RefTarget::Global(i) => {
                let old = std::mem::replace(&mut self.globals[*i as usize], value);
                old.drop_with_heap(&mut self.heap);
                Ok(())
            }
            RefTarget::Local(i) => {
                let frame = caller_frame(frames, *i)?;
                let old = std::mem::replace(&mut frame.slots[*i as usize], value);
                old.drop_with_heap(&mut self.heap);
                Ok(())
            }
            RefTarget::Field(k) => {
                let text = self.to_display_string(&value);
                value.drop_with_heap(&mut self.heap);
                self.set_field(*k as usize, text);
                Ok(())
            }
            RefTarget::Named(name) => {
                if let Some(old) = self.named.insert(name.clone(), value) {
                    old.drop_with_heap(&mut self.heap);
                }
                Ok(())
            }
            RefTarget::MapSlot(id, key) => {
                let id = *id;
                let key = key.clone();
                if let HeapData::Map(m) = self.heap.get_mut(id) {
                    if let Some(old) = m.insert(key, value) {
                        self.heap.gc_aware_refdown_value(old);
                    }
                }
                Ok(())
            }
            RefTarget::ArraySlot(id, idx) => {
                let id = *id;
                let idx = *idx;
                if let HeapData::Array(a) = self.heap.get_mut(id) {
                    if idx > a.len() {
                        a.resize_with(idx, || Value::Nil);
                    }
                    let old = std::mem::replace(&mut a[idx - 1], value);
                    self.heap.gc_aware_refdown_value(old);
                }
                Ok(())
            }
        }
    }

    fn eval_lvalue(&mut self, frames: &mut Vec<Frame>, lv: &LValue) -> HawkResult<Value> {
        match lv {
            LValue::Slot(slot) => self.slot_get(frames, slot),
            LValue::Field(e) => {
                let idx_v = self.eval_expr(frames, e)?;
                let idx = self.to_number(&idx_v) as i64;
                idx_v.drop_with_heap(&mut self.heap);
                Ok(self.field_value(idx.max(0) as usize))
            }
            LValue::Index(base, indices) => {
                let id = self.resolve_map_base(frames, base)?;
                let key = self.join_subscript(frames, indices)?;
                let v = match self.heap.get_mut(id) {
                    HeapData::Map(m) => m.get(key.as_str()).map(|v| v.clone_with_heap_ref()),
                    _ => None,
                };
                let result = match v {
                    Some(Value::Ref(r)) => {
                        self.heap.refup(r);
                        Value::Ref(r)
                    }
                    Some(other) => other,
                    None => {
                        if let HeapData::Map(m) = self.heap.get_mut(id) {
                            m.insert(Rc::from(key.as_str()), Value::Nil);
                        }
                        Value::Nil
                    }
                };
                self.heap.refdown(id);
                Ok(result)
            }
        }
    }

    fn assign_lvalue(&mut self, frames: &mut Vec<Frame>, lv: &LValue, value: Value) -> HawkResult<()> {
        match lv {
            LValue::Slot(slot) => self.slot_set(frames, slot, value),
            LValue::Field(e) => {
                let idx_v = self.eval_expr(frames, e)?;
                let idx = self.to_number(&idx_v) as i64;
                idx_v.drop_with_heap(&mut self.heap);
                let text = self.to_display_string(&value);
                value.drop_with_heap(&mut self.heap);
                self.set_field(idx.max(0) as usize, text);
                Ok(())
            }
            LValue::Index(base, indices) => {
                let id = self.resolve_map_base(frames, base)?;
                let key = self.join_subscript(frames, indices)?;
                if let HeapData::Map(m) = self.heap.get_mut(id) {
                    if let Some(old) = m.insert(Rc::from(key.as_str()), value) {
                        self.heap.gc_aware_refdown_value(old);
                    }
                }
                self.heap.refdown(id);
                Ok(())
            }
        }
    }

    /// Evaluates `base` to the `HeapId` of the map it names, materializing
    /// an empty one the first time a slot is auto-vivified by subscripting.
    fn resolve_map_base(&mut self, frames: &mut Vec<Frame>, base: &Expr) -> HawkResult<crate::heap::HeapId> {
        if let Expr::Var(slot, _) = base {
            let cur = self.slot_get(frames, slot)?;
            if let Value::Ref(id) = &cur {
                if matches!(self.heap.get(*id), HeapData::Map(_)) {
                    return Ok(*id);
                }
            }
            cur.drop_with_heap(&mut self.heap);
            let id = self.heap.alloc_map(HawkMap::default());
            self.heap.refup(id);
            self.slot_set(frames, slot, Value::Ref(id))?;
            return Ok(id);
        }
        let v = self.eval_expr(frames, base)?;
        match v {
            Value::Ref(id) if matches!(self.heap.get(id), HeapData::Map(_)) => Ok(id),
            other => {
                other.drop_with_heap(&mut self.heap);
                Err(HawkError::runtime("subscript base is not a map", SourceLoc::synthetic()))
            }
        }
    }

    fn join_subscript(&mut self, frames: &mut Vec<Frame>, indices: &[Expr]) -> HawkResult<String> {
        let subsep = self.global_str(statics::SUBSEP);
        let mut parts = Vec::with_capacity(indices.len());
        for e in indices {
            let v = self.eval_expr(frames, e)?;
            parts.push(self.to_display_string(&v));
            v.drop_with_heap(&mut self.heap);
        }
        Ok(parts.join(&subsep))
    }

    fn field_value(&self, k: usize) -> Value {
        let text = if k == 0 { self.record.line().to_owned() } else { self.record.field(k).to_owned() };
        let numeric = self.looks_numeric(&text);
        let mut heap = std::ptr::NonNull::from(&self.heap);
        // SAFETY: `field_value` needs a `&mut Heap` only to allocate the
        // resulting string cell; no other heap borrow is live here.
        let heap_mut: &mut Heap = unsafe { heap.as_mut() };
        Value::make_string(text, numeric, heap_mut)
    }

    fn set_field(&mut self, k: usize, value: String) {
        let ofs = self.global_str(statics::OFS);
        if k == 0 {
            let fs = self.global_str(statics::FS);
            let strip = self.traits.contains(Traits::STRIPRECSPC);
            let re = self.field_regex(&fs).ok().flatten();
            self.record.set_line(value, &fs, re.as_ref().map(|r| &r.re), strip);
        } else {
            self.record.set_field(k, value, &ofs);
        }
        self.globals[statics::NF as usize] = Value::Int(self.record.nf() as i64);
    }

    // ---- expressions ----------------------------------------------------------

    fn eval_expr(&mut self, frames: &mut Vec<Frame>, expr: &Expr) -> HawkResult<Value> {
        match expr {
            Expr::Literal(lit, loc) => self.eval_literal(lit, loc),
            Expr::Var(slot, _) => self.slot_get(frames, slot),
            Expr::Field(inner, _) => {
                let idx_v = self.eval_expr(frames, inner)?;
                let idx = self.to_number(&idx_v) as i64;
                idx_v.drop_with_heap(&mut self.heap);
                Ok(self.field_value(idx.max(0) as usize))
            }
            Expr::Group(items, _) => {
                let mut last = Value::Nil;
                for (i, e) in items.iter().enumerate() {
                    let v = self.eval_expr(frames, e)?;
                    if i + 1 == items.len() {
                        last = v;
                    } else {
                        v.drop_with_heap(&mut self.heap);
                    }
                }
                Ok(last)
            }
            Expr::Index(base, indices, _) => {
                let id = self.resolve_map_base(frames, base)?;
                let key = self.join_subscript(frames, indices)?;
                let existing = match self.heap.get(id) {
                    HeapData::Map(m) => m.get(key.as_str()).map(value_shallow_copy),
                    _ => None,
                };
                let result = match existing {
                    Some(Value::Ref(r)) => {
                        self.heap.refup(r);
                        Value::Ref(r)
                    }
                    Some(other) => other,
                    None => {
                        if let HeapData::Map(m) = self.heap.get_mut(id) {
                            m.insert(Rc::from(key.as_str()), Value::Nil);
                        }
                        Value::Nil
                    }
                };
                self.heap.refdown(id);
                Ok(result)
            }
            Expr::Call(callee, args, loc) => self.eval_call(frames, callee, args, loc),
            Expr::ModuleRef(ns, sym, loc) => match self.modules.resolve(ns, sym) {
                Some(Symbol::Int(i)) => Ok(Value::Int(i)),
                Some(Symbol::Float(f)) => Ok(Value::make_float(f, &mut self.heap)),
                Some(Symbol::Function { .. }) => {
                    Err(HawkError::runtime(format!("{ns}::{sym} is a function, call it"), loc.clone()))
                }
                None => Err(HawkError::semantic(format!("unknown symbol '{ns}::{sym}'"), loc.clone())),
            },
            Expr::Unary(op, inner, _) => self.eval_unary(frames, *op, inner),
            Expr::Binary(op, lhs, rhs, loc) => self.eval_binary(frames, *op, lhs, rhs, loc),
            Expr::Ternary(cond, then_e, else_e, _) => {
                let c = self.eval_expr(frames, cond)?;
                let truthy = c.truthy(&self.heap);
                c.drop_with_heap(&mut self.heap);
                if truthy { self.eval_expr(frames, then_e) } else { self.eval_expr(frames, else_e) }
            }
            Expr::Assign(lv, rhs, _) => {
                let v = self.eval_expr(frames, rhs)?;
                let out = v.clone_with_heap(&mut self.heap);
                self.assign_lvalue(frames, lv, v)?;
                Ok(out)
            }
            Expr::CompoundAssign(lv, op, rhs, loc) => {
                let cur = self.eval_lvalue(frames, lv)?;
                let rhs_v = self.eval_expr(frames, rhs)?;
                let result = self.apply_binop(*op, &cur, &rhs_v, loc)?;
                cur.drop_with_heap(&mut self.heap);
                rhs_v.drop_with_heap(&mut self.heap);
                let out = result.clone_with_heap(&mut self.heap);
                self.assign_lvalue(frames, lv, result)?;
                Ok(out)
            }
            Expr::IncDec(op, lv, loc) => {
                let cur = self.eval_lvalue(frames, lv)?;
                let cur_n = self.to_number(&cur);
                cur.drop_with_heap(&mut self.heap);
                let new_n = match op {
                    IncDecOp::PreInc | IncDecOp::PostInc => cur_n + 1.0,
                    IncDecOp::PreDec | IncDecOp::PostDec => cur_n - 1.0,
                };
                let new_v = self.make_number(new_n);
                let _ = loc;
                let stored = new_v.clone_with_heap(&mut self.heap);
                self.assign_lvalue(frames, lv, new_v)?;
                match op {
                    IncDecOp::PreInc | IncDecOp::PreDec => Ok(stored),
                    IncDecOp::PostInc | IncDecOp::PostDec => {
                        stored.drop_with_heap(&mut self.heap);
                        Ok(self.make_number(cur_n))
                    }
                }
            }
            Expr::Getline(src, lvalue, byte_form, loc) => self.eval_getline(frames, src, lvalue, *byte_form, loc),
            Expr::Argc(loc) => {
                let frame = frames.last().ok_or_else(|| HawkError::runtime("@argc outside a function", loc.clone()))?;
                Ok(Value::Int(frame.nargs as i64))
            }
            Expr::Argv(idx, loc) => {
                let frame =
                    frames.last().ok_or_else(|| HawkError::runtime("@argv outside a function", loc.clone()))?;
                match idx {
                    None => {
                        let arr: Vec<Value> =
                            frame.slots[..frame.nargs].iter().map(|v| v.clone_with_heap_ref()).collect();
                        let arr: Vec<Value> = arr
                            .into_iter()
                            .map(|v| match v {
                                Value::Ref(r) => {
                                    self.heap.refup(r);
                                    Value::Ref(r)
                                }
                                other => other,
                            })
                            .collect();
                        let id = self.heap.alloc_array(arr);
                        Ok(Value::Ref(id))
                    }
                    Some(e) => {
                        let iv = self.eval_expr(frames, e)?;
                        let i = self.to_number(&iv) as i64;
                        iv.drop_with_heap(&mut self.heap);
                        let frame = frames.last().unwrap();
                        if i < 1 || i as usize > frame.nargs {
                            Ok(Value::Nil)
                        } else {
                            Ok(frame.slots[i as usize - 1].clone_with_heap_ref_up(&mut self.heap))
                        }
                    }
                }
            }
            Expr::FuncRef(name, loc) => {
                if let Some(&idx) = self.func_index.get(name.as_ref()) {
                    Ok(Value::Ref(self.heap.alloc_function_ref(idx as u32)))
                } else {
                    Err(HawkError::semantic(format!("unknown function '{name}'"), loc.clone()))
                }
            }
        }
    }

    fn eval_literal(&mut self, lit: &Literal, _loc: &SourceLoc) -> HawkResult<Value> {
        Ok(match lit {
            Literal::Int(i) => Value::make_int(*i, &mut self.heap),
            Literal::Float(f) => Value::make_float(*f, &mut self.heap),
            Literal::Str(s) => Value::make_string(s.to_string(), false, &mut self.heap),
            Literal::ByteStr(b) => Value::make_byte_string(b.to_vec(), &mut self.heap),
            Literal::Char(c) => Value::Char(*c),
            Literal::ByteChar(b) => Value::ByteChar(*b),
            Literal::Regex(r) => Value::Ref(self.heap.alloc_regex(r.clone())?),
            Literal::Nil => Value::Nil,
        })
    }

    fn eval_unary(&mut self, frames: &mut Vec<Frame>, op: UnOp, inner: &Expr) -> HawkResult<Value> {
        let v = self.eval_expr(frames, inner)?;
        let result = match op {
            UnOp::Neg => self.make_number(-self.to_number(&v)),
            UnOp::Plus => self.make_number(self.to_number(&v)),
            UnOp::Not => Value::Int(i64::from(!v.truthy(&self.heap))),
            UnOp::BitNot => Value::Int(!(self.to_number(&v) as i64)),
        };
        v.drop_with_heap(&mut self.heap);
        Ok(result)
    }

    fn eval_binary(
        &mut self,
        frames: &mut Vec<Frame>,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        loc: &SourceLoc,
    ) -> HawkResult<Value> {
        // Short-circuiting forms evaluate their RHS lazily.
        match op {
            BinOp::And => {
                let l = self.eval_expr(frames, lhs)?;
                let truthy = l.truthy(&self.heap);
                l.drop_with_heap(&mut self.heap);
                if !truthy {
                    return Ok(Value::Int(0));
                }
                let r = self.eval_expr(frames, rhs)?;
                let out = Value::Int(i64::from(r.truthy(&self.heap)));
                r.drop_with_heap(&mut self.heap);
                return Ok(out);
            }
            BinOp::Or => {
                let l = self.eval_expr(frames, lhs)?;
                let truthy = l.truthy(&self.heap);
                l.drop_with_heap(&mut self.heap);
                if truthy {
                    return Ok(Value::Int(1));
                }
                let r = self.eval_expr(frames, rhs)?;
                let out = Value::Int(i64::from(r.truthy(&self.heap)));
                r.drop_with_heap(&mut self.heap);
                return Ok(out);
            }
            BinOp::In => {
                let l = self.eval_expr(frames, lhs)?;
                let key = self.to_display_string(&l);
                l.drop_with_heap(&mut self.heap);
                let r = self.eval_expr(frames, rhs)?;
                let found = match &r {
                    Value::Ref(id) => matches!(self.heap.get(*id), HeapData::Map(m) if m.contains_key(key.as_str())),
                    _ => false,
                };
                r.drop_with_heap(&mut self.heap);
                return Ok(Value::Int(i64::from(found)));
            }
            _ => {}
        }
        let l = self.eval_expr(frames, lhs)?;
        let r = self.eval_expr(frames, rhs)?;
        let result = self.apply_binop(op, &l, &r, loc);
        l.drop_with_heap(&mut self.heap);
        r.drop_with_heap(&mut self.heap);
        result
    }

    fn apply_binop(&mut self, op: BinOp, l: &Value, r: &Value, loc: &SourceLoc) -> HawkResult<Value> {
        match op {
            BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::IDiv | BinOp::Mod | BinOp::Pow => {
                let a = self.to_number(l);
                let b = self.to_number(r);
                let v = match op {
                    BinOp::Add => a + b,
                    BinOp::Sub => a - b,
                    BinOp::Mul => a * b,
                    BinOp::Div => {
                        if b == 0.0 {
                            return Err(HawkError::runtime("division by zero", loc.clone()));
                        }
                        a / b
                    }
                    BinOp::IDiv => {
                        if b == 0.0 {
                            return Err(HawkError::runtime("division by zero", loc.clone()));
                        }
                        (a / b).trunc()
                    }
                    BinOp::Mod => {
                        if b == 0.0 {
                            return Err(HawkError::runtime("division by zero", loc.clone()));
                        }
                        a % b
                    }
                    BinOp::Pow => a.powf(b),
                    _ => unreachable!(),
                };
                Ok(self.make_number(v))
            }
            BinOp::BitAnd => Ok(Value::Int(self.to_number(l) as i64 & self.to_number(r) as i64)),
            BinOp::BitOr => Ok(Value::Int(self.to_number(l) as i64 | self.to_number(r) as i64)),
            BinOp::BitXor => Ok(Value::Int(self.to_number(l) as i64 ^ self.to_number(r) as i64)),
            BinOp::Shl => Ok(Value::Int((self.to_number(l) as i64) << (self.to_number(r) as i64))),
            BinOp::Shr => Ok(Value::Int((self.to_number(l) as i64) >> (self.to_number(r) as i64))),
            BinOp::Concat => {
                let mut s = self.to_display_string(l);
                s.push_str(&self.to_display_string(r));
                Ok(Value::make_string(s, false, &mut self.heap))
            }
            BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge | BinOp::Eq | BinOp::Ne => {
                let ord = self.compare(l, r);
                let b = match op {
                    BinOp::Lt => ord.is_lt(),
                    BinOp::Le => ord.is_le(),
                    BinOp::Gt => ord.is_gt(),
                    BinOp::Ge => ord.is_ge(),
                    BinOp::Eq => ord.is_eq(),
                    BinOp::Ne => ord.is_ne(),
                    _ => unreachable!(),
                };
                Ok(Value::Int(i64::from(b)))
            }
            BinOp::StrictEq | BinOp::StrictNe => {
                let eq = self.strict_eq(l, r);
                Ok(Value::Int(i64::from(if op == BinOp::StrictEq { eq } else { !eq })))
            }
            BinOp::Match | BinOp::NotMatch => {
                let text = self.to_display_string(l);
                let pat = self.regex_source(r)?;
                let re = regex::Regex::new(&pat).map_err(|e| HawkError::regex(e.to_string(), loc.clone()))?;
                let found = re.is_match(&text);
                Ok(Value::Int(i64::from(if op == BinOp::Match { found } else { !found })))
            }
            BinOp::And | BinOp::Or | BinOp::In => unreachable!("short-circuit forms handled by eval_binary"),
        }
    }

    fn regex_source(&mut self, v: &Value) -> HawkResult<String> {
        if let Value::Ref(id) = v {
            if let HeapData::Regex(r) = self.heap.get(*id) {
                return Ok(r.source.to_string());
            }
        }
        Ok(regex::escape(&self.to_display_string(v)))
    }

    fn compare(&mut self, l: &Value, r: &Value) -> std::cmp::Ordering {
        let both_numericish = self.is_numeric_value(l) && self.is_numeric_value(r);
        if both_numericish {
            self.to_number(l).partial_cmp(&self.to_number(r)).unwrap_or(std::cmp::Ordering::Equal)
        } else {
            self.to_display_string(l).cmp(&self.to_display_string(r))
        }
    }

    fn strict_eq(&mut self, l: &Value, r: &Value) -> bool {
        match (l, r) {
            (Value::Nil, Value::Nil) => true,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Char(a), Value::Char(b)) => a == b,
            (Value::ByteChar(a), Value::ByteChar(b)) => a == b,
            (Value::Ref(a), Value::Ref(b)) => match (self.heap.get(*a), self.heap.get(*b)) {
                (HeapData::Str(x), HeapData::Str(y)) => x == y,
                (HeapData::ByteString(x), HeapData::ByteString(y)) => x == y,
                (HeapData::Float(x), HeapData::Float(y)) => x == y,
                (HeapData::Int(x), HeapData::Int(y)) => x == y,
                _ => a == b,
            },
            _ => false,
        }
    }

    fn is_numeric_value(&self, v: &Value) -> bool {
        match v {
            Value::Int(_) => true,
            Value::Nil | Value::Char(_) | Value::ByteChar(_) => true,
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Int(_) | HeapData::Float(_) => true,
                HeapData::Str(_) => self.heap.is_numeric_string(*id),
                _ => false,
            },
        }
    }

    // ---- number/string coercion (spec §4.5 "Type coercion") ------------------

    fn to_number(&self, v: &Value) -> f64 {
        match v {
            Value::Nil => 0.0,
            Value::Int(i) => *i as f64,
            Value::Char(c) => u32::from(*c) as f64,
            Value::ByteChar(b) => *b as f64,
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Int(i) => *i as f64,
                HeapData::Float(f) => *f,
                HeapData::Str(s) => self.str_to_number(s),
                HeapData::ByteString(b) => self.str_to_number(&String::from_utf8_lossy(b)),
                _ => 0.0,
            },
        }
    }

    fn str_to_number(&self, s: &str) -> f64 {
        let t = if self.traits.contains(Traits::STRIPSTRSPC) { s.trim() } else { s };
        let prefix_len = t
            .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+' || c == 'e' || c == 'E'))
            .unwrap_or(t.len());
        t[..prefix_len].parse::<f64>().unwrap_or(0.0)
    }

    fn looks_numeric(&self, s: &str) -> bool {
        if !self.traits.contains(Traits::NUMSTRDETECT) {
            return false;
        }
        let t = s.trim();
        !t.is_empty() && t.parse::<f64>().is_ok()
    }

    fn make_number(&mut self, v: f64) -> Value {
        if v.fract() == 0.0 && v.is_finite() && crate::value::immediate::in_range(v as i64) {
            Value::Int(v as i64)
        } else {
            Value::make_float(v, &mut self.heap)
        }
    }

    /// String conversion using CONVFMT (spec §4.5), used for concatenation,
    /// map subscripts, and comparisons.
    fn to_display_string(&self, v: &Value) -> String {
        self.number_aware_to_string(v, statics::CONVFMT)
    }

    /// String conversion for `print`, which uses OFMT instead of CONVFMT.
    fn to_print_string(&self, v: &Value) -> String {
        self.number_aware_to_string(v, statics::OFMT)
    }

    fn number_aware_to_string(&self, v: &Value, fmt_slot: u32) -> String {
        match v {
            Value::Nil => String::new(),
            Value::Int(i) => i.to_string(),
            Value::Char(c) => c.to_string(),
            Value::ByteChar(b) => (*b as char).to_string(),
            Value::Ref(id) => match self.heap.get(*id) {
                HeapData::Int(i) => i.to_string(),
                HeapData::Float(f) => {
                    if f.fract() == 0.0 && f.is_finite() {
                        format!("{f:.0}")
                    } else {
                        let fmt = self.number_aware_to_string(&self.globals[fmt_slot as usize], statics::CONVFMT);
                        sprintf_one(&fmt, *f)
                    }
                }
                HeapData::Str(s) => s.clone(),
                HeapData::ByteString(b) => String::from_utf8_lossy(b).into_owned(),
                HeapData::Regex(r) => r.source.to_string(),
                HeapData::FunctionRef(idx) => {
                    format!("<function {}>", self.program.functions.get(*idx as usize).map_or("?", |f| f.name.as_ref()))
                }
                HeapData::Map(_) => "<map>".to_owned(),
                HeapData::Array(_) => "<array>".to_owned(),
                HeapData::Reference(_) => String::new(),
            },
        }
    }

    // ---- calls ----------------------------------------------------------------

    fn eval_call(&mut self, frames: &mut Vec<Frame>, callee: &Expr, args: &[Expr], loc: &SourceLoc) -> HawkResult<Value> {
        match callee {
            Expr::FuncRef(name, _) => {
                if let Some(v) = self.try_builtin(frames, name, args, loc)? {
                    return Ok(v);
                }
                if let Some(&idx) = self.func_index.get(name.as_ref()) {
                    return self.call_user_function(frames, idx, args, loc);
                }
                Err(HawkError::semantic(format!("unknown function '{name}'"), loc.clone()))
            }
            Expr::ModuleRef(ns, sym, _) => {
                let mut vals = Vec::with_capacity(args.len());
                for a in args {
                    vals.push(self.eval_expr(frames, a)?);
                }
                let result = self.modules.call(ns, sym, &vals, &mut self.heap);
                for v in vals {
                    v.drop_with_heap(&mut self.heap);
                }
                result
            }
            other => {
                let v = self.eval_expr(frames, other)?;
                let Value::Ref(id) = v else {
                    return Err(HawkError::runtime("value is not callable", loc.clone()));
                };
                let HeapData::FunctionRef(idx) = self.heap.get(id) else {
                    self.heap.refdown(id);
                    return Err(HawkError::runtime("value is not callable", loc.clone()));
                };
                let idx = *idx;
                self.heap.refdown(id);
                self.call_user_function(frames, idx as usize, args, loc)
            }
        }
    }

    fn call_user_function(
        &mut self,
        frames: &mut Vec<Frame>,
        func_idx: usize,
        args: &[Expr],
        loc: &SourceLoc,
    ) -> HawkResult<Value> {
        self.call_depth += 1;
        if self.call_depth > self.depth_limit {
            self.call_depth -= 1;
            return Err(HawkError::runtime("call stack too deep", loc.clone()));
        }
        let (nparams, by_ref, nlocals, name) = {
            let def: &FunctionDef = &self.program.functions[func_idx];
            let by_ref: Vec<bool> = def.params.iter().map(|p| p.by_ref).collect();
            (def.params.len(), by_ref, def.nlocals as usize, def.name.clone())
        };

        let mut slots = Vec::with_capacity(args.len().max(nparams) + nlocals);
        for (i, a) in args.iter().enumerate() {
            let want_ref = by_ref.get(i).copied().unwrap_or(false);
            let v = if want_ref {
                self.eval_reference_arg(frames, a)?
            } else {
                self.eval_expr(frames, a)?
            };
            slots.push(v);
        }
        let nargs = slots.len();
        // Pad up to the declared parameter count so `Slot::Param` stays in
        // range even when fewer args were passed than declared (allowed for
        // variadic functions, and tolerated otherwise).
        while slots.len() < nparams {
            slots.push(Value::Nil);
        }
        let locals_offset = slots.len();
        for _ in 0..nlocals {
            slots.push(Value::Nil);
        }

        self.tracer.on_call(&name, self.call_depth);
        frames.push(Frame { slots, nargs, locals_offset, func_idx });
        let body = self.program.functions[func_idx].body.clone();
        let flow = self.exec_block(frames, &body);
        let frame = frames.pop().expect("frame pushed above");
        self.tracer.on_return(self.call_depth);
        self.call_depth -= 1;

        let flow = flow?;
        let result = match flow {
            Flow::Return(v) => v,
            Flow::Exit | Flow::Abort => {
                for v in frame.slots {
                    v.drop_with_heap(&mut self.heap);
                }
                return Err(HawkError::runtime("exit/abort unwinding through a call is not supported", loc.clone()));
            }
            _ => Value::Nil,
        };
        for v in frame.slots {
            v.drop_with_heap(&mut self.heap);
        }
        Ok(result)
    }

    /// Builds the Reference value a `&param` argument binds to (spec §4.5
    /// "Function call").
    fn eval_reference_arg(&mut self, frames: &mut Vec<Frame>, expr: &Expr) -> HawkResult<Value> {
        let target = match expr {
            Expr::Var(Slot::Global(i), _) => RefTarget::Global(*i),
            Expr::Var(Slot::Param(i), _) => {
                let frame = frames.last().ok_or_else(|| HawkError::runtime("reference argument outside a frame", expr.loc().clone()))?;
                if let Value::Ref(id) = &frame.slots[*i as usize] {
                    if matches!(self.heap.get(*id), HeapData::Reference(_)) {
                        self.heap.refup(*id);
                        return Ok(Value::Ref(*id));
                    }
                }
                RefTarget::Local(*i)
            }
            Expr::Var(Slot::Local(i), _) => {
                let frame = frames.last().ok_or_else(|| HawkError::runtime("reference argument outside a frame", expr.loc().clone()))?;
                let abs = frame.locals_offset as u32 + *i;
                if let Value::Ref(id) = &frame.slots[abs as usize] {
                    if matches!(self.heap.get(*id), HeapData::Reference(_)) {
                        self.heap.refup(*id);
                        return Ok(Value::Ref(*id));
                    }
                }
                RefTarget::Local(abs)
            }
            Expr::Var(Slot::Named(name), _) => {
                if let Some(Value::Ref(id)) = self.named.get(name) {
                    let id = *id;
                    if matches!(self.heap.get(id), HeapData::Reference(_)) {
                        self.heap.refup(id);
                        return Ok(Value::Ref(id));
                    }
                }
                RefTarget::Named(name.clone())
            }
            Expr::Field(inner, _) => {
                let iv = self.eval_expr(frames, inner)?;
                let k = self.to_number(&iv) as i64;
                iv.drop_with_heap(&mut self.heap);
                RefTarget::Field(k.max(0) as u32)
            }
            Expr::Index(base, indices, _) => {
                let id = self.resolve_map_base(frames, base)?;
                let key = self.join_subscript(frames, indices)?;
                let target = RefTarget::MapSlot(id, Rc::from(key.as_str()));
                self.heap.refdown(id);
                target
            }
            _ => return self.eval_expr(frames, expr),
        };
        Ok(Value::Ref(self.heap.alloc_reference(target)))
    }

    /// Dispatches to the fixed set of intrinsic functions (spec §4.2
    /// "intrinsic-function table"). Returns `Ok(None)` when `name` is not a
    /// builtin, so the caller falls through to user-function lookup. Kept
    /// separate from `parser::BUILTIN_NAMES`, which only needs the name list
    /// for forward-reference checking at parse time.
    fn try_builtin(&mut self, frames: &mut Vec<Frame>, name: &str, args: &[Expr], loc: &SourceLoc) -> HawkResult<Option<Value>> {
        Ok(Some(match name {
            "length" => {
                if args.is_empty() {
                    Value::Int(self.record.line().chars().count() as i64)
                } else {
                    let v = self.eval_expr(frames, &args[0])?;
                    let n = match &v {
                        Value::Ref(id) => match self.heap.get(*id) {
                            HeapData::Str(s) => s.chars().count() as i64,
                            HeapData::ByteString(b) => b.len() as i64,
                            HeapData::Map(m) => m.len() as i64,
                            HeapData::Array(a) => a.len() as i64,
                            _ => self.to_display_string(&v).chars().count() as i64,
                        },
                        _ => self.to_display_string(&v).chars().count() as i64,
                    };
                    v.drop_with_heap(&mut self.heap);
                    Value::Int(n)
                }
            }
            "substr" => {
                let s = self.eval_string_arg(frames, &args[0])?;
                let start_f = self.eval_num_arg(frames, &args[1])?;
                let chars: Vec<char> = s.chars().collect();
                let start = (start_f.round() as i64 - 1).max(0) as usize;
                let len = if args.len() > 2 {
                    self.eval_num_arg(frames, &args[2])?.round().max(0.0) as usize
                } else {
                    chars.len().saturating_sub(start)
                };
                let end = (start + len).min(chars.len());
                let out: String = if start < chars.len() { chars[start..end].iter().collect() } else { String::new() };
                Value::make_string(out, false, &mut self.heap)
            }
            "index" => {
                let s = self.eval_string_arg(frames, &args[0])?;
                let t = self.eval_string_arg(frames, &args[1])?;
                let pos = s.find(&t).map_or(0, |byte_idx| s[..byte_idx].chars().count() as i64 + 1);
                Value::Int(pos)
            }
            "split" => {
                let s = self.eval_string_arg(frames, &args[0])?;
                let id = self.resolve_map_base(frames, &args[1])?;
                let fs = if args.len() > 2 { self.eval_string_arg(frames, &args[2])? } else { self.global_str(statics::FS) };
                let re = self.field_regex(&fs)?;
                let strip = self.traits.contains(Traits::STRIPRECSPC);
                let mut tmp = Record::new();
                tmp.set_line(s, &fs, re.as_ref().map(|r| &r.re), strip);
                let n = tmp.nf();
                if let HeapData::Map(m) = self.heap.get_mut(id) {
                    let drained: Vec<Value> = m.drain(..).map(|(_, v)| v).collect();
                    for d in drained {
                        self.heap.gc_aware_refdown_value(d);
                    }
                }
                for i in 1..=n {
                    let field = tmp.field(i).to_owned();
                    let numeric = self.looks_numeric(&field);
                    let fv = Value::make_string(field, numeric, &mut self.heap);
                    if let HeapData::Map(m) = self.heap.get_mut(id) {
                        m.insert(Rc::from(i.to_string().as_str()), fv);
                    }
                }
                self.heap.refdown(id);
                Value::Int(n as i64)
            }
            "sub" | "gsub" => {
                let global = name == "gsub";
                let pat = self.eval_regex_arg(frames, &args[0])?;
                let repl = self.eval_string_arg(frames, &args[1])?;
                let target_lv = if args.len() > 2 {
                    self.expr_as_lvalue_for_sub(&args[2])?
                } else {
                    LValue::Field(Box::new(Expr::Literal(Literal::Int(0), loc.clone())))
                };
                let subject = self.eval_lvalue(frames, &target_lv)?;
                let text = self.to_display_string(&subject);
                subject.drop_with_heap(&mut self.heap);
                let re = regex::Regex::new(&pat).map_err(|e| HawkError::regex(e.to_string(), loc.clone()))?;
                let (out, count) = regex_replace(&re, &text, &repl, global);
                if count > 0 {
                    let v = Value::make_string(out, false, &mut self.heap);
                    self.assign_lvalue(frames, &target_lv, v)?;
                }
                Value::Int(count as i64)
            }
            "match" => {
                let s = self.eval_string_arg(frames, &args[0])?;
                let pat = self.eval_regex_arg(frames, &args[1])?;
                let re = regex::Regex::new(&pat).map_err(|e| HawkError::regex(e.to_string(), loc.clone()))?;
                match re.find(&s) {
                    Some(m) => {
                        let start = s[..m.start()].chars().count() as i64 + 1;
                        let len = s[m.start()..m.end()].chars().count() as i64;
                        self.globals[statics::RSTART as usize] = Value::Int(start);
                        self.globals[statics::RLENGTH as usize] = Value::Int(len);
                        Value::Int(start)
                    }
                    None => {
                        self.globals[statics::RSTART as usize] = Value::Int(0);
                        self.globals[statics::RLENGTH as usize] = Value::Int(-1);
                        Value::Int(0)
                    }
                }
            }
            "sprintf" => {
                let fmt = self.eval_string_arg(frames, &args[0])?;
                let mut rest = Vec::with_capacity(args.len() - 1);
                for a in &args[1..] {
                    rest.push(self.eval_expr(frames, a)?);
                }
                let out = self.sprintf(&fmt, &rest)?;
                for v in rest {
                    v.drop_with_heap(&mut self.heap);
                }
                Value::make_string(out, false, &mut self.heap)
            }
            "sin" => {
                let v = self.eval_num_arg(frames, &args[0])?.sin();
                self.make_number(v)
            }
            "cos" => {
                let v = self.eval_num_arg(frames, &args[0])?.cos();
                self.make_number(v)
            }
            "atan2" => {
                let y = self.eval_num_arg(frames, &args[0])?;
                let x = self.eval_num_arg(frames, &args[1])?;
                self.make_number(y.atan2(x))
            }
            "exp" => {
                let v = self.eval_num_arg(frames, &args[0])?.exp();
                self.make_number(v)
            }
            "log" => {
                let v = self.eval_num_arg(frames, &args[0])?.ln();
                self.make_number(v)
            }
            "sqrt" => {
                let v = self.eval_num_arg(frames, &args[0])?.sqrt();
                self.make_number(v)
            }
            "int" => {
                let v = self.eval_num_arg(frames, &args[0])?.trunc();
                self.make_number(v)
            }
            "rand" => {
                let v = self.next_rand();
                self.make_number(v)
            }
            "srand" => {
                let prev = self.rand_seed;
                let seed = if args.is_empty() { 0 } else { self.eval_num_arg(frames, &args[0])? as i64 };
                self.rand_seed = seed;
                self.rng_state = (seed as u64) ^ 0x9E37_79B9_7F4A_7C15;
                if self.rng_state == 0 {
                    self.rng_state = 0x2545_f491_4f6c_dd1d;
                }
                Value::Int(prev)
            }
            "tolower" => Value::make_string(self.eval_string_arg(frames, &args[0])?.to_lowercase(), false, &mut self.heap),
            "toupper" => Value::make_string(self.eval_string_arg(frames, &args[0])?.to_uppercase(), false, &mut self.heap),
            "system" => {
                let cmd = self.eval_string_arg(frames, &args[0])?;
                self.flush_all_outputs()?;
                let status = std::process::Command::new("/bin/sh").arg("-c").arg(&cmd).status();
                Value::Int(match status {
                    Ok(s) => s.code().unwrap_or(-1) as i64,
                    Err(_) => -1,
                })
            }
            "close" => {
                let name = self.eval_string_arg(frames, &args[0])?;
                Value::Int(self.close_stream(&name)?)
            }
            "fflush" => {
                if args.is_empty() {
                    self.flush_all_outputs()?;
                } else {
                    let name = self.eval_string_arg(frames, &args[0])?;
                    let handles: Vec<u64> = self
                        .out_handles
                        .iter()
                        .filter(|(k, _)| k.ends_with(&format!(":{name}")))
                        .map(|(_, &h)| h)
                        .collect();
                    for h in handles {
                        self.rio.flush(h)?;
                    }
                }
                Value::Int(0)
            }
            "typeof" => {
                let v = self.eval_expr(frames, &args[0])?;
                let t = match &v {
                    Value::Nil => "nil",
                    Value::Int(_) => "int",
                    Value::Char(_) => "char",
                    Value::ByteChar(_) => "bytechar",
                    Value::Ref(id) => match self.heap.get(*id) {
                        HeapData::Int(_) => "int",
                        HeapData::Float(_) => "float",
                        HeapData::Str(_) => "str",
                        HeapData::ByteString(_) => "bytestr",
                        HeapData::Regex(_) => "regex",
                        HeapData::FunctionRef(_) => "function",
                        HeapData::Map(_) => "map",
                        HeapData::Array(_) => "array",
                        HeapData::Reference(_) => "reference",
                    },
                };
                v.drop_with_heap(&mut self.heap);
                Value::make_string(t.to_owned(), false, &mut self.heap)
            }
            _ => return Ok(None),
        }))
    }

    fn expr_as_lvalue_for_sub(&mut self, e: &Expr) -> HawkResult<LValue> {
        match e {
            Expr::Var(slot, _) => Ok(LValue::Slot(slot.clone())),
            Expr::Field(inner, _) => Ok(LValue::Field(inner.clone())),
            Expr::Index(base, indices, _) => Ok(LValue::Index(base.clone(), indices.clone())),
            other => Err(HawkError::runtime(format!("{other:?} is not assignable"), other.loc().clone())),
        }
    }

    fn eval_string_arg(&mut self, frames: &mut Vec<Frame>, e: &Expr) -> HawkResult<String> {
        let v = self.eval_expr(frames, e)?;
        let s = self.to_display_string(&v);
        v.drop_with_heap(&mut self.heap);
        Ok(s)
    }

    fn eval_num_arg(&mut self, frames: &mut Vec<Frame>, e: &Expr) -> HawkResult<f64> {
        let v = self.eval_expr(frames, e)?;
        let n = self.to_number(&v);
        v.drop_with_heap(&mut self.heap);
        Ok(n)
    }

    fn eval_regex_arg(&mut self, frames: &mut Vec<Frame>, e: &Expr) -> HawkResult<String> {
        let v = self.eval_expr(frames, e)?;
        let s = self.regex_source(&v)?;
        v.drop_with_heap(&mut self.heap);
        Ok(s)
    }

    fn next_rand(&mut self) -> f64 {
        // xorshift64*, seeded by `srand`; deterministic and dependency-free.
        let mut x = self.rng_state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.rng_state = x;
        (x >> 11) as f64 / (1u64 << 53) as f64
    }

    fn sprintf(&mut self, fmt: &str, args: &[Value]) -> HawkResult<String> {
        printf_format(fmt, args, |v| self.to_display_string(v), |v| self.to_number(v))
    }

    // ---- getline (spec §4.5 "getline forms") -----------------------------

    fn eval_getline(
        &mut self,
        frames: &mut Vec<Frame>,
        src: &GetlineSource,
        lvalue: &Option<LValue>,
        byte_form: bool,
        loc: &SourceLoc,
    ) -> HawkResult<Value> {
        let (handle, updates_record) = match src {
            GetlineSource::Main => {
                if self.main_handle.is_none() {
                    self.set_main_source(None)?;
                }
                (self.main_handle.unwrap(), lvalue.is_none())
            }
            GetlineSource::File(e) => {
                let name = self.eval_string_arg(frames, e)?;
                (self.input_handle(&name, RioMode::Read, RioDomain::File)?, false)
            }
            GetlineSource::Cmd(e) => {
                let cmd = self.eval_string_arg(frames, e)?;
                (self.input_handle(&cmd, RioMode::Read, RioDomain::Pipe)?, false)
            }
            GetlineSource::CoCmd(e) => {
                let cmd = self.eval_string_arg(frames, e)?;
                (self.input_handle(&cmd, RioMode::ReadWrite, RioDomain::Pipe)?, false)
            }
        };
        let bytes = match self.rio.read(handle) {
            Ok(Some(b)) => b,
            Ok(None) => return Ok(Value::Int(0)),
            Err(_) => return Ok(Value::Int(-1)),
        };
        let _ = loc;
        if byte_form {
            let v = Value::make_byte_string(bytes, &mut self.heap);
            if let Some(lv) = lvalue {
                let v2 = v.clone_with_heap(&mut self.heap);
                self.assign_lvalue(frames, lv, v2)?;
                v.drop_with_heap(&mut self.heap);
            } else {
                v.drop_with_heap(&mut self.heap);
            }
            return Ok(Value::Int(1));
        }
        let text = String::from_utf8_lossy(&bytes).into_owned();
        match lvalue {
            Some(lv) => {
                let numeric = self.looks_numeric(&text);
                let v = Value::make_string(text, numeric, &mut self.heap);
                self.assign_lvalue(frames, lv, v)?;
                if updates_record {
                    self.bump_int(statics::NR, 1);
                }
            }
            None => {
                let fs = self.global_str(statics::FS);
                let strip = self.traits.contains(Traits::STRIPRECSPC);
                let re = self.field_regex(&fs)?;
                self.record.set_line(text, &fs, re.as_ref().map(|r| &r.re), strip);
                self.globals[statics::NF as usize] = Value::Int(self.record.nf() as i64);
                if updates_record {
                    self.bump_int(statics::NR, 1);
                }
            }
        }
        Ok(Value::Int(1))
    }
}

fn clone_immediate(v: &Value) -> Value {
    match v {
        Value::Nil => Value::Nil,
        Value::Char(c) => Value::Char(*c),
        Value::ByteChar(b) => Value::ByteChar(*b),
        Value::Int(i) => Value::Int(*i),
        Value::Ref(id) => Value::Ref(*id),
    }
}

fn value_shallow_copy(v: &Value) -> Value {
    clone_immediate(v)
}

impl Value {
    /// A copy that does not bump any refcount; only safe as an intermediate
    /// the caller immediately either discards or re-refcounts (used when
    /// reading out of a map/array slot we don't own).
    fn clone_with_heap_ref(&self) -> Value {
        clone_immediate(self)
    }

    fn clone_with_heap_ref_up(&self, heap: &mut Heap) -> Value {
        let v = clone_immediate(self);
        if let Value::Ref(id) = v {
            heap.refup(id);
        }
        v
    }
}

impl Heap {
    /// `refdown`, but accepts an owned [`Value`] and is a no-op for
    /// non-`Ref` variants (convenience for draining map/array contents).
    fn gc_aware_refdown_value(&mut self, v: Value) {
        if let Value::Ref(id) = v {
            self.gc_aware_refdown(id);
        }
    }
}

/// Replaces `&`/`\&` in a `sub`/`gsub` replacement template with the match text.
fn expand_replacement(repl: &str, matched: &str) -> String {
    let mut out = String::with_capacity(repl.len());
    let mut chars = repl.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.peek() {
                Some('&') => {
                    out.push('&');
                    chars.next();
                }
                Some('\\') => {
                    out.push('\\');
                    chars.next();
                }
                _ => out.push('\\'),
            }
        } else if c == '&' {
            out.push_str(matched);
        } else {
            out.push(c);
        }
    }
    out
}

fn regex_replace(re: &regex::Regex, text: &str, repl: &str, global: bool) -> (String, usize) {
    let mut out = String::with_capacity(text.len());
    let mut count = 0;
    let mut last = 0;
    for m in re.find_iter(text) {
        if !global && count == 1 {
            break;
        }
        out.push_str(&text[last..m.start()]);
        out.push_str(&expand_replacement(repl, m.as_str()));
        last = m.end();
        count += 1;
        if !global {
            break;
        }
        if m.start() == m.end() {
            // avoid an infinite loop on a zero-width match
            if let Some(c) = text[last..].chars().next() {
                out.push(c);
                last += c.len_utf8();
            } else {
                break;
            }
        }
    }
    out.push_str(&text[last..]);
    (out, count)
}

/// Formats a single float with a printf-style conversion spec drawn from
/// CONVFMT/OFMT (e.g. `"%.6g"`), falling back to Rust's default float
/// formatting if the format string doesn't parse as one conversion.
fn sprintf_one(fmt: &str, v: f64) -> String {
    // A single placeholder arg so `printf_format`'s `args.get(0)` finds
    // something to pass through `to_num`, which ignores it and returns `v`.
    printf_format(fmt, std::slice::from_ref(&Value::Nil), |_| String::new(), |_| v)
        .unwrap_or_else(|_| v.to_string())
}

/// A small printf-family formatter covering the conversions AWK scripts
/// actually use: `d i o x X u c s e E f F g G %`, with `-`, `0`, `+`, ` `
/// flags and decimal width/precision.
fn printf_format(
    fmt: &str,
    args: &[Value],
    to_str: impl Fn(&Value) -> String,
    to_num: impl Fn(&Value) -> f64,
) -> HawkResult<String> {
    let mut out = String::new();
    let mut argi = 0;
    let mut chars = fmt.chars().peekable();
    let next_num = |argi: &mut usize| -> f64 {
        let v = args.get(*argi).map_or(0.0, &to_num);
        *argi += 1;
        v
    };
    let next_str = |argi: &mut usize| -> String {
        let v = args.get(*argi).map_or(String::new(), |v| to_str(v));
        *argi += 1;
        v
    };
    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        if chars.peek() == Some(&'%') {
            chars.next();
            out.push('%');
            continue;
        }
        let mut left_align = false;
        let mut zero_pad = false;
        let mut plus_sign = false;
        let mut space_sign = false;
        loop {
            match chars.peek() {
                Some('-') => {
                    left_align = true;
                    chars.next();
                }
                Some('0') => {
                    zero_pad = true;
                    chars.next();
                }
                Some('+') => {
                    plus_sign = true;
                    chars.next();
                }
                Some(' ') => {
                    space_sign = true;
                    chars.next();
                }
                _ => break,
            }
        }
        let mut width = String::new();
        while chars.peek().is_some_and(char::is_ascii_digit) {
            width.push(chars.next().unwrap());
        }
        let mut prec = None;
        if chars.peek() == Some(&'.') {
            chars.next();
            let mut p = String::new();
            while chars.peek().is_some_and(char::is_ascii_digit) {
                p.push(chars.next().unwrap());
            }
            prec = Some(p.parse::<usize>().unwrap_or(0));
        }
        let width: usize = width.parse().unwrap_or(0);
        let Some(conv) = chars.next() else {
            out.push('%');
            break;
        };
        let mut body = match conv {
            'd' | 'i' => {
                let n = next_num(&mut argi) as i64;
                let sign = if n >= 0 && plus_sign { "+" } else if n >= 0 && space_sign { " " } else { "" };
                format!("{sign}{n}")
            }
            'o' => format!("{:o}", next_num(&mut argi) as i64),
            'x' => format!("{:x}", next_num(&mut argi) as i64),
            'X' => format!("{:X}", next_num(&mut argi) as i64),
            'u' => format!("{}", next_num(&mut argi) as i64 as u64),
            'c' => {
                if let Some(v) = args.get(argi) {
                    let s = match v {
                        Value::Int(i) => char::from_u32(*i as u32).map(String::from).unwrap_or_default(),
                        Value::Char(c) => c.to_string(),
                        Value::ByteChar(b) => (*b as char).to_string(),
                        other => to_str(other).chars().next().map(String::from).unwrap_or_default(),
                    };
                    argi += 1;
                    s
                } else {
                    String::new()
                }
            }
            's' => {
                let mut s = next_str(&mut argi);
                if let Some(p) = prec {
                    s.truncate(p);
                }
                s
            }
            'e' | 'E' => {
                let p = prec.unwrap_or(6);
                let s = format!("{:.*e}", p, next_num(&mut argi));
                if conv == 'E' { s.to_uppercase() } else { s }
            }
            'f' | 'F' => format!("{:.*}", prec.unwrap_or(6), next_num(&mut argi)),
            'g' | 'G' => format_g(next_num(&mut argi), prec.unwrap_or(6), conv == 'G'),
            other => {
                out.push('%');
                out.push(other);
                continue;
            }
        };
        if body.len() < width {
            let pad = width - body.len();
            if left_align {
                body.push_str(&" ".repeat(pad));
            } else if zero_pad && !matches!(conv, 's' | 'c') {
                let (sign, rest) = if body.starts_with('-') || body.starts_with('+') {
                    body.split_at(1)
                } else {
                    ("", body.as_str())
                };
                body = format!("{sign}{}{rest}", "0".repeat(pad));
            } else {
                body = format!("{}{body}", " ".repeat(pad));
            }
        }
        out.push_str(&body);
    }
    Ok(out)
}

/// A minimal C-style `%g`: picks `%e` or `%f` based on magnitude, then trims
/// trailing zeros (and a trailing decimal point).
fn format_g(v: f64, precision: usize, upper: bool) -> String {
    let precision = precision.max(1);
    if v == 0.0 {
        return "0".to_owned();
    }
    let exp = v.abs().log10().floor() as i32;
    let mut s = if exp < -4 || exp >= precision as i32 {
        let s = format!("{:.*e}", precision - 1, v);
        if upper { s.to_uppercase() } else { s }
    } else {
        let decimals = (precision as i32 - 1 - exp).max(0) as usize;
        format!("{v:.decimals$}")
    };
    if s.contains('.') && !s.contains('e') && !s.contains('E') {
        while s.ends_with('0') {
            s.pop();
        }
        if s.ends_with('.') {
            s.pop();
        }
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{MemorySourceIo, Utf8CharManager};
    use crate::parser::Parser;

    /// An in-memory, line-buffered RIO handler: one named input + stdout
    /// capture, enough to drive the runtime end-to-end in tests.
    #[derive(Default)]
    struct TestRio {
        input_lines: Vec<Vec<u8>>,
        input_pos: usize,
        pub output: Vec<u8>,
    }

    impl TestRio {
        fn with_input(text: &str) -> Self {
            let mut lines: Vec<Vec<u8>> = text.split_inclusive('\n').map(|l| l.as_bytes().to_vec()).collect();
            if lines.last().is_some_and(|l| l.is_empty()) {
                lines.pop();
            }
            Self { input_lines: lines, input_pos: 0, output: Vec::new() }
        }
    }

    impl RioHandler for TestRio {
        fn open(&mut self, _name: &str, _mode: RioMode, _domain: RioDomain) -> HawkResult<u64> {
            Ok(0)
        }
        fn close(&mut self, _handle: u64) -> HawkResult<()> {
            Ok(())
        }
        fn read(&mut self, _handle: u64) -> HawkResult<Option<Vec<u8>>> {
            if self.input_pos >= self.input_lines.len() {
                return Ok(None);
            }
            let line = self.input_lines[self.input_pos].clone();
            self.input_pos += 1;
            Ok(Some(line))
        }
        fn write(&mut self, _handle: u64, data: &[u8]) -> HawkResult<usize> {
            self.output.extend_from_slice(data);
            Ok(data.len())
        }
        fn flush(&mut self, _handle: u64) -> HawkResult<()> {
            Ok(())
        }
    }

    fn run_program(source: &str, input: &str) -> String {
        let mut io = MemorySourceIo::new().with_main(source);
        let options = Options::default();
        let mut parser = Parser::new(&mut io, &options).unwrap();
        let program = parser.parse_program().unwrap();
        let modules = ModuleRegistry::new();
        let mut rio = TestRio::with_input(input);
        let cmgr = Utf8CharManager;
        let mut engine = Engine::new(program, &options, modules, &mut rio, &cmgr);
        engine.run().unwrap();
        String::from_utf8(rio.output).unwrap()
    }

    #[test]
    fn field_split_and_print() {
        let out = run_program("{ print $2, $1 }", "hello world\nfoo bar\n");
        assert_eq!(out, "world hello\nbar foo\n");
    }

    #[test]
    fn constant_folding_and_print() {
        let out = run_program("BEGIN { print 2 + 3 * 4 }", "");
        assert_eq!(out, "14\n");
    }

    #[test]
    fn gc_on_self_referential_map_via_hawk_gc() {
        let out = run_program(
            "function make() { @local m; m[\"self\"] = m; return 1 } BEGIN { make(); hawk::gc(); print \"ok\" }",
            "",
        );
        assert_eq!(out, "ok\n");
    }

    #[test]
    fn gc_user_api_threshold_pressure_and_refs_are_reachable_from_hawk() {
        let out = run_program(
            r#"
            BEGIN {
                hawk::gc_set_threshold(0, 3);
                print hawk::gc_get_threshold(0);
                a[1] = 1;
                a[2] = 2;
                print hawk::gc_get_pressure(0) >= 1;
                print hawk::gcrefs(a) >= 1;
                print hawk::gcrefs(1);
                hawk::gc_collect(2);
                hawk::gc_collect();
            }
            "#,
            "",
        );
        assert_eq!(out, "3\n1\n1\n0\n");
    }

    #[test]
    fn pass_by_reference_mutates_caller_variable() {
        let out = run_program(
            "function bump(&x) { x = x + 1 } BEGIN { n = 41; bump(n); print n }",
            "",
        );
        assert_eq!(out, "42\n");
    }

    #[test]
    fn variadic_and_argv_sum() {
        let out = run_program(
            "function sum(...) { @local total, i; total = 0; for (i = 1; i <= @argc; i++) total += @argv[i]; return total } BEGIN { print sum(1, 2, 3, 4) }",
            "",
        );
        assert_eq!(out, "10\n");
    }

    #[test]
    fn switch_matches_literal_case() {
        let out = run_program(
            "BEGIN { x = 2; switch (x) { case 1: print \"one\"; break; case 2: print \"two\"; break; default: print \"other\" } }",
            "",
        );
        assert_eq!(out, "two\n");
    }

    #[test]
    fn sub_and_gsub_count_replacements() {
        let out = run_program(
            "BEGIN { s = \"a-b-c\"; n = gsub(/-/, \":\", s); print s, n }",
            "",
        );
        assert_eq!(out, "a:b:c 2\n");
    }

    #[test]
    fn sprintf_width_and_precision() {
        let out = run_program("BEGIN { print sprintf(\"%5d|%-5s|%.2f\", 3, \"hi\", 3.14159) }", "");
        assert_eq!(out, "    3|hi   |3.14\n");
    }

    #[test]
    fn for_in_iterates_map_keys() {
        let out = run_program(
            "BEGIN { a[\"x\"] = 1; a[\"y\"] = 2; n = 0; for (k in a) n++; print n }",
            "",
        );
        assert_eq!(out, "2\n");
    }
}
