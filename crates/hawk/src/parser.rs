//! Recursive-descent parser (spec §4.2, grammar in §6.4).
//!
//! Builds [`ast::Program`] directly off the lexer's token stream: symbol
//! scopes are resolved as identifiers are seen (no separate name-resolution
//! pass), constant arithmetic on literals is folded immediately (including
//! the parse-time divide-by-zero check), and `@include`/`@include_once`
//! splice a nested source in transparently through the lexer's frame stack.

use std::rc::Rc;

use ahash::RandomState;
use indexmap::IndexMap;

use crate::ast::{
    BinOp, Chain, Expr, FunctionDef, GetlineSource, IncDecOp, LValue, Literal, Param, Pattern,
    Program, Redirect, Slot, Stmt, SwitchCase, UnOp,
};
use crate::error::{HawkError, HawkResult};
use crate::io::SourceIo;
use crate::lexer::Lexer;
use crate::loc::SourceLoc;
use crate::modules::ModuleRegistry;
use crate::options::{DepthLimits, Options, Traits};
use crate::token::{AtKeyword, Keyword, Op, TokenKind};

/// Function names the runtime dispatches directly, never subject to the
/// forward-reference check user functions get (spec §4.2 "builtins").
const BUILTIN_NAMES: &[&str] = &[
    "length", "substr", "index", "split", "sub", "gsub", "match", "sprintf", "sin", "cos",
    "atan2", "exp", "log", "sqrt", "int", "rand", "srand", "tolower", "toupper", "system",
    "close", "fflush", "typeof", "hawk::gc",
];

const STATIC_GLOBALS: &[&str] = &[
    "NR", "NF", "FS", "RS", "CONVFMT", "OFMT", "OFS", "ORS", "SUBSEP", "FILENAME", "FNR",
    "RLENGTH", "RSTART", "OFILENAME", "NUMSTRDETECT", "IGNORECASE", "STRIPRECSPC", "STRIPSTRSPC",
    "SCRIPTNAME",
];

#[derive(Default)]
struct FunctionScope {
    name: Rc<str>,
    params: IndexMap<Rc<str>, u32, RandomState>,
    param_by_ref: Vec<bool>,
    locals: IndexMap<Rc<str>, u32, RandomState>,
    variadic: bool,
}

struct FunctionSig {
    arity_min: usize,
    variadic: bool,
}

pub struct Parser<'lx> {
    lexer: Lexer<'lx>,
    globals: IndexMap<Rc<str>, u32, RandomState>,
    functions: IndexMap<Rc<str>, u32, RandomState>,
    sigs: Vec<FunctionSig>,
    unresolved_calls: Vec<(Rc<str>, SourceLoc)>,
    pub modules: ModuleRegistry,
    traits: Traits,
    trait_restore_stack: Vec<Traits>,
    scope: Option<FunctionScope>,
    depth: DepthLimits,
    expr_depth: usize,
}

impl<'lx> Parser<'lx> {
    pub fn new(io: &'lx mut dyn SourceIo, options: &Options) -> HawkResult<Self> {
        let mut lexer = Lexer::new(io, options.depth.include)?;
        lexer.set_multiline_str(options.traits.contains(Traits::MULTILINE_STR));
        let mut globals = IndexMap::default();
        for (i, name) in STATIC_GLOBALS.iter().enumerate() {
            globals.insert(Rc::from(*name), i as u32);
        }
        Ok(Self {
            lexer,
            globals,
            functions: IndexMap::default(),
            sigs: Vec::new(),
            unresolved_calls: Vec::new(),
            modules: ModuleRegistry::new(),
            traits: options.traits,
            trait_restore_stack: Vec::new(),
            scope: None,
            depth: options.depth,
            expr_depth: 0,
        })
    }

    pub fn parse_program(&mut self) -> HawkResult<Program> {
        let mut program = Program::default();
        self.skip_terms()?;
        while !self.at_eof() {
            self.parse_top_item(&mut program)?;
            self.skip_terms()?;
        }
        for (name, loc) in std::mem::take(&mut self.unresolved_calls) {
            if !self.functions.contains_key(&name) && !BUILTIN_NAMES.contains(&name.as_ref()) {
                return Err(HawkError::semantic(format!("call to undefined function '{name}'"), loc));
            }
        }
        for body in program.begin.iter().chain(program.end.iter()) {
            self.check_call_arities(body)?;
        }
        for chain in &program.chains {
            if let Some(action) = &chain.action {
                self.check_call_arities(action)?;
            }
        }
        for f in &program.functions {
            self.check_call_arities(&f.body)?;
        }
        program.nglobals = self.globals.len() as u32;
        Ok(program)
    }

    /// Checks user-function call sites against the arity recorded when each
    /// function was parsed (spec §4.2 "wrong number of arguments").
    fn check_call_arities(&self, stmts: &[Stmt]) -> HawkResult<()> {
        for stmt in stmts {
            walk_stmt_exprs(stmt, &mut |expr| self.check_call_arity(expr))?;
        }
        Ok(())
    }

    fn check_call_arity(&self, expr: &Expr) -> HawkResult<()> {
        if let Expr::Call(callee, args, loc) = expr {
            if let Expr::FuncRef(name, _) = callee.as_ref() {
                if let Some(&idx) = self.functions.get(name) {
                    let sig = &self.sigs[idx as usize];
                    let ok = if sig.variadic { args.len() >= sig.arity_min } else { args.len() == sig.arity_min };
                    if !ok {
                        return Err(HawkError::semantic(
                            format!(
                                "function '{name}' expects {} argument(s), got {}",
                                sig.arity_min,
                                args.len()
                            ),
                            loc.clone(),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    // ---- token plumbing -------------------------------------------------

    fn at_eof(&self) -> bool {
        self.lexer.current().kind.is_eof()
    }

    fn cur_loc(&self) -> SourceLoc {
        self.lexer.loc()
    }

    fn err(&self, msg: impl Into<String>) -> HawkError {
        HawkError::syntax(msg, self.cur_loc())
    }

    /// Advances past the token just consumed as an atom; the next token is
    /// expected to be an infix operator (so a bare `/` means division).
    fn bump_operator_ctx(&mut self) -> HawkResult<()> {
        self.track_include_pop();
        self.lexer.advance(false)
    }

    /// Advances into a position where a new operand is expected (so a bare
    /// `/` starts a regex literal instead).
    fn bump_operand_ctx(&mut self) -> HawkResult<()> {
        self.track_include_pop();
        self.lexer.advance(true)
    }

    fn track_include_pop(&mut self) {
        while self.trait_restore_stack.len() >= self.lexer.frame_depth() {
            if let Some(prev) = self.trait_restore_stack.pop() {
                self.traits = prev;
            } else {
                break;
            }
        }
    }

    fn is_op(&self, op: Op) -> bool {
        matches!(&self.lexer.current().kind, TokenKind::Op(o) if *o == op)
    }

    fn is_kw(&self, kw: Keyword) -> bool {
        matches!(&self.lexer.current().kind, TokenKind::Keyword(k) if *k == kw)
    }

    fn eat_op(&mut self, op: Op, ctx_operand: bool) -> HawkResult<bool> {
        if self.is_op(op) {
            if ctx_operand {
                self.bump_operand_ctx()?;
            } else {
                self.bump_operator_ctx()?;
            }
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect_op(&mut self, op: Op, ctx_operand: bool) -> HawkResult<()> {
        if !self.eat_op(op, ctx_operand)? {
            return Err(self.err(format!("expected '{op:?}'")));
        }
        Ok(())
    }

    fn skip_terms(&mut self) -> HawkResult<()> {
        loop {
            match &self.lexer.current().kind {
                TokenKind::Newline => self.bump_operand_ctx()?,
                TokenKind::Op(Op::Semi) => self.bump_operand_ctx()?,
                _ => break,
            }
        }
        Ok(())
    }

    fn skip_newlines_only(&mut self) -> HawkResult<()> {
        while matches!(self.lexer.current().kind, TokenKind::Newline) {
            self.bump_operand_ctx()?;
        }
        Ok(())
    }

    fn ident_name(&self) -> Option<Rc<str>> {
        match &self.lexer.current().kind {
            TokenKind::Ident(name) => Some(name.clone()),
            _ => None,
        }
    }

    // ---- symbol tables ----------------------------------------------------

    fn declare_global(&mut self, name: &str) -> u32 {
        if let Some(&idx) = self.globals.get(name) {
            return idx;
        }
        let idx = self.globals.len() as u32;
        self.globals.insert(Rc::from(name), idx);
        idx
    }

    fn declare_local(&mut self, name: &str) -> HawkResult<u32> {
        if self.scope.is_none() {
            return Err(self.err("@local outside of a function"));
        }
        let scope = self.scope.as_mut().unwrap();
        if let Some(&idx) = scope.locals.get(name) {
            return Ok(idx);
        }
        let idx = scope.locals.len() as u32;
        scope.locals.insert(Rc::from(name), idx);
        Ok(idx)
    }

    fn resolve_ident(&mut self, name: &str, loc: &SourceLoc) -> HawkResult<Slot> {
        if let Some(scope) = &self.scope {
            if let Some(&idx) = scope.params.get(name) {
                return Ok(Slot::Param(idx));
            }
            if let Some(&idx) = scope.locals.get(name) {
                return Ok(Slot::Local(idx));
            }
            if scope.name.as_ref() == name {
                return Ok(Slot::SelfFunction);
            }
        }
        if let Some(&idx) = self.globals.get(name) {
            return Ok(Slot::Global(idx));
        }
        if self.traits.contains(Traits::IMPLICIT) {
            return Ok(Slot::Named(Rc::from(name)));
        }
        Err(HawkError::semantic(format!("undeclared identifier '{name}'"), loc.clone()))
    }

    // ---- top-level items ----------------------------------------------------

    fn parse_top_item(&mut self, program: &mut Program) -> HawkResult<()> {
        match &self.lexer.current().kind {
            TokenKind::At(AtKeyword::Include) => self.parse_include(false),
            TokenKind::At(AtKeyword::IncludeOnce) => self.parse_include(true),
            TokenKind::At(AtKeyword::Global) => self.parse_global_decl(),
            TokenKind::At(AtKeyword::Pragma) => self.parse_pragma(),
            TokenKind::Keyword(Keyword::Function) => {
                let f = self.parse_function()?;
                program.functions.push(f);
                Ok(())
            }
            TokenKind::Keyword(Keyword::Begin) => {
                self.bump_operand_ctx()?;
                self.skip_newlines_only()?;
                program.begin.push(self.parse_block()?);
                Ok(())
            }
            TokenKind::Keyword(Keyword::End) => {
                self.bump_operand_ctx()?;
                self.skip_newlines_only()?;
                program.end.push(self.parse_block()?);
                Ok(())
            }
            _ => {
                let chain = self.parse_chain()?;
                program.chains.push(chain);
                Ok(())
            }
        }
    }

    fn parse_include(&mut self, once: bool) -> HawkResult<()> {
        self.bump_operand_ctx()?;
        let path = match &self.lexer.current().kind {
            TokenKind::Str(s) => s.clone(),
            _ => return Err(self.err("expected a string path after @include")),
        };
        let loc = self.cur_loc();
        self.bump_operand_ctx()?;
        self.trait_restore_stack.push(self.traits);
        let entered = self.lexer.push_include(&path, once).map_err(|mut e| {
            e.loc = loc.clone();
            e
        })?;
        if !entered {
            // silent skip: the frame was never pushed, so no pop will ever
            // observe it; undo the speculative restore entry immediately.
            self.trait_restore_stack.pop();
        }
        // Re-prime current/lookahead now that the lexer may be reading from
        // a brand new frame.
        self.bump_operand_ctx()?;
        Ok(())
    }

    fn parse_global_decl(&mut self) -> HawkResult<()> {
        self.bump_operand_ctx()?;
        loop {
            let Some(name) = self.ident_name() else {
                return Err(self.err("expected identifier after @global"));
            };
            self.declare_global(&name);
            self.bump_operator_ctx()?;
            if !self.eat_op(Op::Comma, true)? {
                break;
            }
        }
        self.expect_terminator()
    }

    fn parse_pragma(&mut self) -> HawkResult<()> {
        self.bump_operand_ctx()?;
        let Some(name) = self.ident_name() else {
            return Err(self.err("expected pragma name"));
        };
        self.bump_operator_ctx()?;
        let on = match self.ident_name() {
            Some(s) if s.as_ref() == "on" => true,
            Some(s) if s.as_ref() == "off" => false,
            _ => return Err(self.err("expected 'on' or 'off' after pragma name")),
        };
        self.bump_operator_ctx()?;
        let flag = match name.as_ref() {
            "implicit" => Traits::IMPLICIT,
            "multiline_str" => {
                self.lexer.set_multiline_str(on);
                Traits::MULTILINE_STR
            }
            "rwpipe" => Traits::RWPIPE,
            "striprecspc" => Traits::STRIPRECSPC,
            "stripstrspc" => Traits::STRIPSTRSPC,
            "numstrdetect" => Traits::NUMSTRDETECT,
            "blank_concat" => Traits::BLANK_CONCAT,
            "rwexit" => Traits::RWEXIT,
            other => return Err(self.err(format!("unknown pragma '{other}'"))),
        };
        self.traits.set(flag, on);
        self.expect_terminator()
    }

    fn expect_terminator(&mut self) -> HawkResult<()> {
        match &self.lexer.current().kind {
            TokenKind::Newline | TokenKind::Op(Op::Semi) => self.skip_terms(),
            TokenKind::Eof => Ok(()),
            _ => Err(self.err("expected end of statement")),
        }
    }

    fn parse_function(&mut self) -> HawkResult<FunctionDef> {
        let loc = self.cur_loc();
        self.bump_operator_ctx()?;
        let Some(name) = self.ident_name() else {
            return Err(self.err("expected function name"));
        };
        self.bump_operator_ctx()?;
        self.expect_op(Op::LParen, true)?;

        let mut scope = FunctionScope { name: name.clone(), ..FunctionScope::default() };
        if !self.is_op(Op::RParen) {
            loop {
                let by_ref = self.eat_op(Op::Amp, true)?;
                if self.eat_op(Op::Ellipsis, false)? {
                    scope.variadic = true;
                    break;
                }
                let Some(pname) = self.ident_name() else {
                    return Err(self.err("expected parameter name"));
                };
                let idx = scope.params.len() as u32;
                scope.params.insert(pname, idx);
                scope.param_by_ref.push(by_ref);
                self.bump_operator_ctx()?;
                if !self.eat_op(Op::Comma, true)? {
                    break;
                }
            }
        }
        self.expect_op(Op::RParen, true)?;
        self.skip_newlines_only()?;

        if self.functions.contains_key(&name) {
            return Err(HawkError::semantic(format!("function '{name}' is already defined"), loc));
        }
        let arity_min = scope.params.len();
        let variadic = scope.variadic;
        let idx = self.functions.len() as u32;
        self.functions.insert(name.clone(), idx);
        self.sigs.push(FunctionSig { arity_min, variadic });

        self.scope = Some(scope);
        let body = self.parse_block()?;
        let scope = self.scope.take().unwrap();

        Ok(FunctionDef {
            name,
            params: scope
                .params
                .iter()
                .map(|(n, &i)| Param { name: n.clone(), by_ref: scope.param_by_ref[i as usize] })
                .collect(),
            variadic: scope.variadic,
            nlocals: scope.locals.len() as u32,
            body,
            loc,
        })
    }

    fn parse_chain(&mut self) -> HawkResult<Chain> {
        let pattern = if self.is_op(Op::LBrace) {
            Pattern::Always
        } else {
            Pattern::Expr(self.parse_expr()?)
        };
        self.skip_newlines_only()?;
        let action = if self.is_op(Op::LBrace) { Some(self.parse_block()?) } else { None };
        Ok(Chain { pattern, action })
    }

    // ---- statements -------------------------------------------------------

    fn parse_block(&mut self) -> HawkResult<Vec<Stmt>> {
        self.expect_op(Op::LBrace, true)?;
        self.skip_terms()?;
        let mut stmts = Vec::new();
        while !self.is_op(Op::RBrace) && !self.at_eof() {
            stmts.push(self.parse_stmt()?);
            self.skip_terms()?;
        }
        self.expect_op(Op::RBrace, false)?;
        Ok(stmts)
    }

    fn parse_stmt_or_block(&mut self) -> HawkResult<Stmt> {
        self.skip_newlines_only()?;
        if self.is_op(Op::LBrace) {
            Ok(Stmt::Block(self.parse_block()?))
        } else {
            self.parse_stmt()
        }
    }

    fn parse_stmt(&mut self) -> HawkResult<Stmt> {
        let loc = self.cur_loc();
        match &self.lexer.current().kind {
            TokenKind::Op(Op::LBrace) => Ok(Stmt::Block(self.parse_block()?)),
            TokenKind::Op(Op::Semi) => Ok(Stmt::Block(Vec::new())),
            TokenKind::Keyword(Keyword::If) => self.parse_if(),
            TokenKind::Keyword(Keyword::While) => self.parse_while(),
            TokenKind::Keyword(Keyword::Do) => self.parse_do_while(),
            TokenKind::Keyword(Keyword::For) => self.parse_for(),
            TokenKind::Keyword(Keyword::Switch) => self.parse_switch(),
            TokenKind::Keyword(Keyword::Break) => {
                self.bump_operator_ctx()?;
                Ok(Stmt::Break(loc))
            }
            TokenKind::Keyword(Keyword::Continue) => {
                self.bump_operator_ctx()?;
                Ok(Stmt::Continue(loc))
            }
            TokenKind::Keyword(Keyword::Next) => {
                self.bump_operator_ctx()?;
                Ok(Stmt::Next(loc))
            }
            TokenKind::Keyword(Keyword::NextFile) => {
                self.bump_operator_ctx()?;
                Ok(Stmt::NextFile(loc))
            }
            TokenKind::Keyword(Keyword::NextOFile) => {
                self.bump_operator_ctx()?;
                Ok(Stmt::NextOFile(loc))
            }
            TokenKind::Keyword(Keyword::Return) => {
                self.bump_operand_ctx()?;
                let value = if self.at_stmt_end() { None } else { Some(self.parse_expr()?) };
                Ok(Stmt::Return(value, loc))
            }
            TokenKind::Keyword(Keyword::Exit) => {
                self.bump_operand_ctx()?;
                let value = if self.at_stmt_end() { None } else { Some(self.parse_expr()?) };
                Ok(Stmt::Exit(value, loc))
            }
            TokenKind::At(AtKeyword::Abort) => {
                self.bump_operand_ctx()?;
                let value = if self.at_stmt_end() { None } else { Some(self.parse_expr()?) };
                Ok(Stmt::Abort(value, loc))
            }
            TokenKind::At(AtKeyword::Reset) => {
                self.bump_operator_ctx()?;
                let Some(name) = self.ident_name() else {
                    return Err(self.err("expected identifier after @reset"));
                };
                let slot = self.resolve_ident(&name, &loc)?;
                self.bump_operator_ctx()?;
                Ok(Stmt::Reset(slot, loc))
            }
            TokenKind::At(AtKeyword::Global) => {
                self.parse_global_decl()?;
                Ok(Stmt::Block(Vec::new()))
            }
            TokenKind::At(AtKeyword::Local) => self.parse_local_decl(loc),
            TokenKind::Keyword(Keyword::Delete) => self.parse_delete(loc),
            TokenKind::Keyword(Keyword::Print) => self.parse_print(loc, false),
            TokenKind::Keyword(Keyword::Printf) => self.parse_print(loc, true),
            _ => {
                let expr = self.parse_expr()?;
                Ok(Stmt::Expr(expr))
            }
        }
    }

    fn at_stmt_end(&self) -> bool {
        matches!(
            self.lexer.current().kind,
            TokenKind::Newline | TokenKind::Op(Op::Semi) | TokenKind::Op(Op::RBrace) | TokenKind::Eof
        )
    }

    fn parse_local_decl(&mut self, loc: SourceLoc) -> HawkResult<Stmt> {
        self.bump_operand_ctx()?;
        loop {
            let Some(name) = self.ident_name() else {
                return Err(self.err("expected identifier after @local"));
            };
            self.declare_local(&name)?;
            self.bump_operator_ctx()?;
            if !self.eat_op(Op::Comma, true)? {
                break;
            }
        }
        let _ = loc;
        Ok(Stmt::Block(Vec::new()))
    }

    fn parse_if(&mut self) -> HawkResult<Stmt> {
        self.bump_operator_ctx()?;
        self.expect_op(Op::LParen, true)?;
        let cond = self.parse_expr()?;
        self.expect_op(Op::RParen, false)?;
        let then_branch = Box::new(self.parse_stmt_or_block()?);
        self.skip_terms_allowing_else()?;
        let else_branch = if self.is_kw(Keyword::Else) {
            self.bump_operand_ctx()?;
            Some(Box::new(self.parse_stmt_or_block()?))
        } else {
            None
        };
        Ok(Stmt::If(cond, then_branch, else_branch))
    }

    /// After an `if` body, newlines/semicolons may separate it from a
    /// following `else` without making the `else` a new statement.
    fn skip_terms_allowing_else(&mut self) -> HawkResult<()> {
        self.skip_terms()
    }

    fn parse_while(&mut self) -> HawkResult<Stmt> {
        self.bump_operator_ctx()?;
        self.expect_op(Op::LParen, true)?;
        let cond = self.parse_expr()?;
        self.expect_op(Op::RParen, false)?;
        let body = Box::new(self.parse_stmt_or_block()?);
        Ok(Stmt::While(cond, body))
    }

    fn parse_do_while(&mut self) -> HawkResult<Stmt> {
        self.bump_operand_ctx()?;
        let body = Box::new(self.parse_stmt_or_block()?);
        self.skip_terms()?;
        if !self.is_kw(Keyword::While) {
            return Err(self.err("expected 'while' after 'do' body"));
        }
        self.bump_operator_ctx()?;
        self.expect_op(Op::LParen, true)?;
        let cond = self.parse_expr()?;
        self.expect_op(Op::RParen, false)?;
        Ok(Stmt::DoWhile(body, cond))
    }

    fn parse_for(&mut self) -> HawkResult<Stmt> {
        self.bump_operator_ctx()?;
        self.expect_op(Op::LParen, true)?;

        // `for (k in arr)` / `for ((k, v) in arr)` shorthand.
        if let Some(name) = self.ident_name() {
            if matches!(self.lexer.lookahead(false)?.kind, TokenKind::Keyword(Keyword::In)) {
                let loc = self.cur_loc();
                let key_slot = self.resolve_ident(&name, &loc)?;
                self.bump_operator_ctx()?; // ident
                self.bump_operand_ctx()?; // 'in'
                let Some(arr_name) = self.ident_name() else {
                    return Err(self.err("expected array name after 'in'"));
                };
                let arr_loc = self.cur_loc();
                let arr_slot = self.resolve_ident(&arr_name, &arr_loc)?;
                self.bump_operator_ctx()?;
                self.expect_op(Op::RParen, true)?;
                let body = Box::new(self.parse_stmt_or_block()?);
                return Ok(Stmt::ForIn(key_slot, arr_slot, body));
            }
        }

        let init = if self.is_op(Op::Semi) {
            None
        } else {
            Some(Box::new(Stmt::Expr(self.parse_expr()?)))
        };
        self.expect_op(Op::Semi, true)?;
        let cond = if self.is_op(Op::Semi) { None } else { Some(self.parse_expr()?) };
        self.expect_op(Op::Semi, true)?;
        let step = if self.is_op(Op::RParen) {
            None
        } else {
            Some(Box::new(Stmt::Expr(self.parse_expr()?)))
        };
        self.expect_op(Op::RParen, false)?;
        let body = Box::new(self.parse_stmt_or_block()?);
        Ok(Stmt::For(init, cond, step, body))
    }

    fn parse_switch(&mut self) -> HawkResult<Stmt> {
        self.bump_operator_ctx()?;
        self.expect_op(Op::LParen, true)?;
        let scrutinee = self.parse_expr()?;
        self.expect_op(Op::RParen, false)?;
        self.skip_newlines_only()?;
        self.expect_op(Op::LBrace, true)?;
        self.skip_terms()?;

        let mut cases = Vec::new();
        let mut default = None;
        while self.is_kw(Keyword::Case) || self.is_kw(Keyword::Default) {
            if self.is_kw(Keyword::Default) {
                self.bump_operator_ctx()?;
                self.expect_op(Op::Colon, true)?;
                self.skip_terms()?;
                default = Some(self.parse_case_body()?);
            } else {
                let mut labels = Vec::new();
                loop {
                    self.bump_operand_ctx()?;
                    labels.push(self.parse_literal_label()?);
                    self.bump_operator_ctx()?;
                    if !self.eat_op(Op::Comma, true)? {
                        break;
                    }
                    if !self.is_kw(Keyword::Case) {
                        continue;
                    }
                }
                self.expect_op(Op::Colon, true)?;
                self.skip_terms()?;
                let body = self.parse_case_body()?;
                cases.push(SwitchCase { labels, body });
            }
        }
        self.expect_op(Op::RBrace, false)?;
        Ok(Stmt::Switch(scrutinee, cases, default))
    }

    fn parse_case_body(&mut self) -> HawkResult<Vec<Stmt>> {
        let mut body = Vec::new();
        while !self.is_kw(Keyword::Case) && !self.is_kw(Keyword::Default) && !self.is_op(Op::RBrace) {
            body.push(self.parse_stmt()?);
            self.skip_terms()?;
        }
        Ok(body)
    }

    fn parse_literal_label(&mut self) -> HawkResult<Literal> {
        match self.lexer.current().kind.clone() {
            TokenKind::Int(v) => Ok(Literal::Int(v)),
            TokenKind::Float(v) => Ok(Literal::Float(v)),
            TokenKind::Str(s) => Ok(Literal::Str(Rc::from(s.as_str()))),
            TokenKind::Char(c) => Ok(Literal::Char(c)),
            _ => Err(self.err("expected a literal case label")),
        }
    }

    fn parse_delete(&mut self, loc: SourceLoc) -> HawkResult<Stmt> {
        self.bump_operator_ctx()?;
        let Some(name) = self.ident_name() else {
            return Err(self.err("expected array name after 'delete'"));
        };
        let slot = self.resolve_ident(&name, &loc)?;
        self.bump_operator_ctx()?;
        let mut indices = Vec::new();
        if self.eat_op(Op::LBracket, true)? {
            loop {
                indices.push(self.parse_expr()?);
                if !self.eat_op(Op::Comma, true)? {
                    break;
                }
            }
            self.expect_op(Op::RBracket, false)?;
        }
        Ok(Stmt::Delete(slot, indices, loc))
    }

    fn parse_print(&mut self, loc: SourceLoc, is_printf: bool) -> HawkResult<Stmt> {
        self.bump_operand_ctx()?;
        let mut args = Vec::new();
        if !self.at_stmt_end() && !self.starts_redirect() {
            loop {
                args.push(self.parse_expr_no_redirect_ops()?);
                if !self.eat_op(Op::Comma, true)? {
                    break;
                }
            }
        }
        let redirect = self.parse_redirect()?;
        if is_printf {
            Ok(Stmt::Printf(args, redirect, loc))
        } else {
            Ok(Stmt::Print(args, redirect, loc))
        }
    }

    fn starts_redirect(&self) -> bool {
        self.is_op(Op::Gt) || self.is_op(Op::Shr) || self.is_op(Op::Pipe) || self.is_op(Op::PipeAmp)
    }

    fn parse_redirect(&mut self) -> HawkResult<Option<Redirect>> {
        if self.eat_op(Op::Gt, true)? {
            Ok(Some(Redirect::Truncate(Box::new(self.parse_expr_no_redirect_ops()?))))
        } else if self.eat_op(Op::Shr, true)? {
            Ok(Some(Redirect::Append(Box::new(self.parse_expr_no_redirect_ops()?))))
        } else if self.eat_op(Op::PipeAmp, true)? {
            Ok(Some(Redirect::BidirPipe(Box::new(self.parse_expr_no_redirect_ops()?))))
        } else if self.eat_op(Op::Pipe, true)? {
            Ok(Some(Redirect::Pipe(Box::new(self.parse_expr_no_redirect_ops()?))))
        } else {
            Ok(None)
        }
    }

    // ---- expressions --------------------------------------------------------
    //
    // Lowest to highest precedence: assignment, ternary, or, and, in, match,
    // pipe-getline, concat, additive, multiplicative, bitwise, unary, pow,
    // postfix, primary. `no_redirect_ops` suppresses a bare `>` as a
    // relational operator and `|`/`|&`/`>>` as bitwise operators, so
    // `print a > "file"` and `print a | "cmd"` parse the redirection instead
    // of a comparison or a bitwise expression. A parenthesized sub-expression
    // is unaffected: it recurses through `parse_expr`, which resets the flag,
    // so `print (a | b)` still parses `|` as bitwise-or inside the parens.

    fn enter_expr(&mut self) -> HawkResult<()> {
        self.expr_depth += 1;
        if self.expr_depth > self.depth.expr_parse {
            return Err(self.err("expression nesting too deep"));
        }
        Ok(())
    }

    fn leave_expr(&mut self) {
        self.expr_depth -= 1;
    }

    pub fn parse_expr(&mut self) -> HawkResult<Expr> {
        self.parse_assignment(false)
    }

    fn parse_expr_no_redirect_ops(&mut self) -> HawkResult<Expr> {
        self.parse_assignment(true)
    }

    fn parse_assignment(&mut self, no_redirect_ops: bool) -> HawkResult<Expr> {
        self.enter_expr()?;
        let lhs = self.parse_ternary(no_redirect_ops)?;
        let loc = lhs.loc().clone();
        let compound = match &self.lexer.current().kind {
            TokenKind::Op(Op::Assign) => Some(None),
            TokenKind::Op(Op::PlusEq) => Some(Some(BinOp::Add)),
            TokenKind::Op(Op::MinusEq) => Some(Some(BinOp::Sub)),
            TokenKind::Op(Op::StarEq) => Some(Some(BinOp::Mul)),
            TokenKind::Op(Op::SlashEq) => Some(Some(BinOp::Div)),
            TokenKind::Op(Op::BackslashEq) => Some(Some(BinOp::IDiv)),
            TokenKind::Op(Op::PercentEq) => Some(Some(BinOp::Mod)),
            TokenKind::Op(Op::ShrEq) => Some(Some(BinOp::Shr)),
            _ => None,
        };
        let result = if let Some(op) = compound {
            self.bump_operand_ctx()?;
            let lvalue = self.expr_to_lvalue(lhs)?;
            let rhs = self.parse_assignment(no_redirect_ops)?;
            match op {
                None => Expr::Assign(lvalue, Box::new(rhs), loc),
                Some(binop) => Expr::CompoundAssign(lvalue, binop, Box::new(rhs), loc),
            }
        } else {
            lhs
        };
        self.leave_expr();
        Ok(result)
    }

    fn parse_ternary(&mut self, no_redirect_ops: bool) -> HawkResult<Expr> {
        let cond = self.parse_or(no_redirect_ops)?;
        if self.is_op(Op::Question) {
            let loc = cond.loc().clone();
            self.bump_operand_ctx()?;
            let then_branch = self.parse_assignment(false)?;
            self.expect_op(Op::Colon, true)?;
            let else_branch = self.parse_assignment(no_redirect_ops)?;
            Ok(Expr::Ternary(Box::new(cond), Box::new(then_branch), Box::new(else_branch), loc))
        } else {
            Ok(cond)
        }
    }

    fn parse_or(&mut self, no_redirect_ops: bool) -> HawkResult<Expr> {
        let mut lhs = self.parse_and(no_redirect_ops)?;
        while self.is_op(Op::PipePipe) {
            let loc = lhs.loc().clone();
            self.bump_operand_ctx()?;
            let rhs = self.parse_and(no_redirect_ops)?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs), loc);
        }
        Ok(lhs)
    }

    fn parse_and(&mut self, no_redirect_ops: bool) -> HawkResult<Expr> {
        let mut lhs = self.parse_in(no_redirect_ops)?;
        while self.is_op(Op::AmpAmp) {
            let loc = lhs.loc().clone();
            self.bump_operand_ctx()?;
            let rhs = self.parse_in(no_redirect_ops)?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs), loc);
        }
        Ok(lhs)
    }

    fn parse_in(&mut self, no_redirect_ops: bool) -> HawkResult<Expr> {
        let mut lhs = self.parse_match(no_redirect_ops)?;
        while self.is_kw(Keyword::In) {
            let loc = lhs.loc().clone();
            self.bump_operand_ctx()?;
            let Some(name) = self.ident_name() else {
                return Err(self.err("expected array name after 'in'"));
            };
            let arr_loc = self.cur_loc();
            let slot = self.resolve_ident(&name, &arr_loc)?;
            self.bump_operator_ctx()?;
            lhs = Expr::Binary(BinOp::In, Box::new(lhs), Box::new(Expr::Var(slot, arr_loc)), loc);
        }
        Ok(lhs)
    }

    fn parse_match(&mut self, no_redirect_ops: bool) -> HawkResult<Expr> {
        let mut lhs = self.parse_pipe_getline(no_redirect_ops)?;
        loop {
            let op = if self.is_op(Op::Tilde) {
                BinOp::Match
            } else if self.is_op(Op::NotMatch) {
                BinOp::NotMatch
            } else {
                break;
            };
            let loc = lhs.loc().clone();
            self.bump_operand_ctx()?;
            let rhs = self.parse_pipe_getline(no_redirect_ops)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs), loc);
        }
        Ok(lhs)
    }

    fn parse_pipe_getline(&mut self, no_redirect_ops: bool) -> HawkResult<Expr> {
        let lhs = self.parse_relational(no_redirect_ops)?;
        let bidir = self.is_op(Op::PipeAmp);
        if (self.is_op(Op::Pipe) || bidir)
            && matches!(self.lexer.lookahead(false)?.kind, TokenKind::Keyword(Keyword::Getline))
        {
            let loc = lhs.loc().clone();
            self.bump_operator_ctx()?; // pipe/pipeamp
            self.bump_operator_ctx()?; // getline
            let lvalue = self.maybe_parse_getline_target()?;
            let src = if bidir {
                GetlineSource::CoCmd(Box::new(lhs))
            } else {
                GetlineSource::Cmd(Box::new(lhs))
            };
            return Ok(Expr::Getline(src, lvalue, false, loc));
        }
        Ok(lhs)
    }

    fn maybe_parse_getline_target(&mut self) -> HawkResult<Option<LValue>> {
        let is_lvalue_start = matches!(&self.lexer.current().kind, TokenKind::Ident(_))
            || self.is_op(Op::Dollar);
        if !is_lvalue_start {
            return Ok(None);
        }
        let expr = self.parse_postfix(false)?;
        Ok(Some(self.expr_to_lvalue(expr)?))
    }

    fn parse_relational(&mut self, no_redirect_ops: bool) -> HawkResult<Expr> {
        let lhs = self.parse_concat(no_redirect_ops)?;
        let op = match &self.lexer.current().kind {
            TokenKind::Op(Op::Lt) => Some(BinOp::Lt),
            TokenKind::Op(Op::Le) => Some(BinOp::Le),
            TokenKind::Op(Op::Gt) if !no_redirect_ops => Some(BinOp::Gt),
            TokenKind::Op(Op::Ge) => Some(BinOp::Ge),
            TokenKind::Op(Op::Eq) => Some(BinOp::Eq),
            TokenKind::Op(Op::Ne) => Some(BinOp::Ne),
            TokenKind::Op(Op::StrictEq) => Some(BinOp::StrictEq),
            TokenKind::Op(Op::StrictNe) => Some(BinOp::StrictNe),
            _ => None,
        };
        if let Some(op) = op {
            let loc = lhs.loc().clone();
            self.bump_operand_ctx()?;
            let rhs = self.parse_concat(no_redirect_ops)?;
            Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs), loc))
        } else {
            Ok(lhs)
        }
    }

    fn starts_operand(&self) -> bool {
        matches!(
            &self.lexer.current().kind,
            TokenKind::Ident(_)
                | TokenKind::Int(_)
                | TokenKind::Float(_)
                | TokenKind::Str(_)
                | TokenKind::ByteStr(_)
                | TokenKind::Char(_)
                | TokenKind::ByteChar(_)
                | TokenKind::Regex(_)
                | TokenKind::At(AtKeyword::Argc | AtKeyword::Argv | AtKeyword::Nil)
                | TokenKind::Keyword(Keyword::Getline)
        ) || self.is_op(Op::Dollar)
            || self.is_op(Op::LParen)
            || self.is_op(Op::Bang)
    }

    fn parse_concat(&mut self, no_redirect_ops: bool) -> HawkResult<Expr> {
        if !self.traits.contains(Traits::BLANK_CONCAT) {
            return self.parse_additive(no_redirect_ops);
        }
        let mut lhs = self.parse_additive(no_redirect_ops)?;
        while self.starts_operand() {
            let loc = lhs.loc().clone();
            let rhs = self.parse_additive(no_redirect_ops)?;
            lhs = Expr::Binary(BinOp::Concat, Box::new(lhs), Box::new(rhs), loc);
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self, no_redirect_ops: bool) -> HawkResult<Expr> {
        let mut lhs = self.parse_multiplicative(no_redirect_ops)?;
        loop {
            let op = if self.is_op(Op::Plus) {
                BinOp::Add
            } else if self.is_op(Op::Minus) {
                BinOp::Sub
            } else {
                break;
            };
            let loc = lhs.loc().clone();
            self.bump_operand_ctx()?;
            let rhs = self.parse_multiplicative(no_redirect_ops)?;
            lhs = self.fold_binary(op, lhs, rhs, loc)?;
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self, no_redirect_ops: bool) -> HawkResult<Expr> {
        let mut lhs = self.parse_bitwise(no_redirect_ops)?;
        loop {
            let op = if self.is_op(Op::Star) {
                BinOp::Mul
            } else if self.is_op(Op::Slash) {
                BinOp::Div
            } else if self.is_op(Op::Backslash) {
                BinOp::IDiv
            } else if self.is_op(Op::Percent) {
                BinOp::Mod
            } else {
                break;
            };
            let loc = lhs.loc().clone();
            self.bump_operand_ctx()?;
            let rhs = self.parse_bitwise(no_redirect_ops)?;
            lhs = self.fold_binary(op, lhs, rhs, loc)?;
        }
        Ok(lhs)
    }

    /// `no_redirect_ops` suppresses `|`/`|&`/`>>` here so a print/printf
    /// redirect target isn't swallowed as a bitwise-or/shift operand; see
    /// `parse_print`.
    fn parse_bitwise(&mut self, no_redirect_ops: bool) -> HawkResult<Expr> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = if self.is_op(Op::Amp) {
                BinOp::BitAnd
            } else if self.is_op(Op::Pipe) && !no_redirect_ops {
                BinOp::BitOr
            } else if self.is_op(Op::Caret) {
                BinOp::BitXor
            } else if self.is_op(Op::Shl) {
                BinOp::Shl
            } else if self.is_op(Op::Shr) && !no_redirect_ops {
                BinOp::Shr
            } else {
                break;
            };
            let loc = lhs.loc().clone();
            self.bump_operand_ctx()?;
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs), loc);
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> HawkResult<Expr> {
        let loc = self.cur_loc();
        if self.eat_op(Op::Minus, true)? {
            return Ok(Expr::Unary(UnOp::Neg, Box::new(self.parse_unary()?), loc));
        }
        if self.eat_op(Op::Plus, true)? {
            return Ok(Expr::Unary(UnOp::Plus, Box::new(self.parse_unary()?), loc));
        }
        if self.eat_op(Op::Bang, true)? {
            return Ok(Expr::Unary(UnOp::Not, Box::new(self.parse_unary()?), loc));
        }
        if self.is_op(Op::Tilde) {
            self.bump_operand_ctx()?;
            return Ok(Expr::Unary(UnOp::BitNot, Box::new(self.parse_unary()?), loc));
        }
        if self.eat_op(Op::PlusPlus, true)? {
            let target = self.parse_unary()?;
            return Ok(Expr::IncDec(IncDecOp::PreInc, self.expr_to_lvalue(target)?, loc));
        }
        if self.eat_op(Op::MinusMinus, true)? {
            let target = self.parse_unary()?;
            return Ok(Expr::IncDec(IncDecOp::PreDec, self.expr_to_lvalue(target)?, loc));
        }
        self.parse_pow()
    }

    fn parse_pow(&mut self) -> HawkResult<Expr> {
        let lhs = self.parse_postfix(true)?;
        if self.is_op(Op::Pow) {
            let loc = lhs.loc().clone();
            self.bump_operand_ctx()?;
            let rhs = self.parse_unary()?;
            return self.fold_binary(BinOp::Pow, lhs, rhs, loc);
        }
        Ok(lhs)
    }

    fn parse_postfix(&mut self, allow_incdec: bool) -> HawkResult<Expr> {
        let mut expr = self.parse_primary()?;
        loop {
            if self.is_op(Op::LBracket) {
                let loc = expr.loc().clone();
                self.bump_operand_ctx()?;
                let mut indices = vec![self.parse_expr()?];
                while self.eat_op(Op::Comma, true)? {
                    indices.push(self.parse_expr()?);
                }
                self.expect_op(Op::RBracket, false)?;
                expr = Expr::Index(Box::new(expr), indices, loc);
                continue;
            }
            if self.is_op(Op::LParen) {
                let loc = expr.loc().clone();
                self.bump_operand_ctx()?;
                let mut args = Vec::new();
                if !self.is_op(Op::RParen) {
                    loop {
                        args.push(self.parse_expr()?);
                        if !self.eat_op(Op::Comma, true)? {
                            break;
                        }
                    }
                }
                self.expect_op(Op::RParen, false)?;
                expr = Expr::Call(Box::new(expr), args, loc);
                continue;
            }
            if allow_incdec && (self.is_op(Op::PlusPlus) || self.is_op(Op::MinusMinus)) {
                let loc = expr.loc().clone();
                let op = if self.is_op(Op::PlusPlus) { IncDecOp::PostInc } else { IncDecOp::PostDec };
                self.bump_operator_ctx()?;
                expr = Expr::IncDec(op, self.expr_to_lvalue(expr)?, loc);
                continue;
            }
            break;
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> HawkResult<Expr> {
        let loc = self.cur_loc();
        match self.lexer.current().kind.clone() {
            TokenKind::Int(v) => {
                self.bump_operator_ctx()?;
                Ok(Expr::Literal(Literal::Int(v), loc))
            }
            TokenKind::Float(v) => {
                self.bump_operator_ctx()?;
                Ok(Expr::Literal(Literal::Float(v), loc))
            }
            TokenKind::Str(s) => {
                self.bump_operator_ctx()?;
                Ok(Expr::Literal(Literal::Str(Rc::from(s.as_str())), loc))
            }
            TokenKind::ByteStr(b) => {
                self.bump_operator_ctx()?;
                Ok(Expr::Literal(Literal::ByteStr(Rc::from(b.as_slice())), loc))
            }
            TokenKind::Char(c) => {
                self.bump_operator_ctx()?;
                Ok(Expr::Literal(Literal::Char(c), loc))
            }
            TokenKind::ByteChar(b) => {
                self.bump_operator_ctx()?;
                Ok(Expr::Literal(Literal::ByteChar(b), loc))
            }
            TokenKind::Regex(s) => {
                self.bump_operator_ctx()?;
                Ok(Expr::Literal(Literal::Regex(Rc::from(s.as_str())), loc))
            }
            TokenKind::At(AtKeyword::Nil) => {
                self.bump_operator_ctx()?;
                Ok(Expr::Literal(Literal::Nil, loc))
            }
            TokenKind::At(AtKeyword::Argc) => {
                self.bump_operator_ctx()?;
                Ok(Expr::Argc(loc))
            }
            TokenKind::At(AtKeyword::Argv) => {
                self.bump_operator_ctx()?;
                if self.eat_op(Op::LBracket, true)? {
                    let idx = self.parse_expr()?;
                    self.expect_op(Op::RBracket, false)?;
                    Ok(Expr::Argv(Some(Box::new(idx)), loc))
                } else {
                    Ok(Expr::Argv(None, loc))
                }
            }
            TokenKind::Op(Op::Dollar) => {
                self.bump_operand_ctx()?;
                let inner = self.parse_postfix(false)?;
                Ok(Expr::Field(Box::new(inner), loc))
            }
            TokenKind::Op(Op::LParen) => {
                self.bump_operand_ctx()?;
                let mut items = vec![self.parse_expr()?];
                while self.eat_op(Op::Comma, true)? {
                    items.push(self.parse_expr()?);
                }
                self.expect_op(Op::RParen, false)?;
                if items.len() == 1 {
                    Ok(items.pop().unwrap())
                } else {
                    Ok(Expr::Group(items, loc))
                }
            }
            TokenKind::Keyword(Keyword::Getline) | TokenKind::Keyword(Keyword::Getbline) => {
                let byte_form = matches!(self.lexer.current().kind, TokenKind::Keyword(Keyword::Getbline));
                self.bump_operator_ctx()?;
                let lvalue = self.maybe_parse_getline_target()?;
                if self.eat_op(Op::Lt, true)? {
                    let file = self.parse_concat(true)?;
                    Ok(Expr::Getline(GetlineSource::File(Box::new(file)), lvalue, byte_form, loc))
                } else {
                    Ok(Expr::Getline(GetlineSource::Main, lvalue, byte_form, loc))
                }
            }
            TokenKind::Ident(name) => {
                self.bump_operator_ctx()?;
                if self.is_op(Op::ColonColon) {
                    self.bump_operand_ctx()?;
                    let Some(sym) = self.ident_name() else {
                        return Err(self.err("expected symbol name after '::'"));
                    };
                    self.bump_operator_ctx()?;
                    return Ok(Expr::ModuleRef(name, sym, loc));
                }
                if self.is_op(Op::LParen) {
                    if !self.functions.contains_key(&name) && !BUILTIN_NAMES.contains(&name.as_ref()) {
                        self.unresolved_calls.push((name.clone(), loc.clone()));
                    }
                    return Ok(Expr::FuncRef(name, loc));
                }
                if self.functions.contains_key(&name) || BUILTIN_NAMES.contains(&name.as_ref()) {
                    return Ok(Expr::FuncRef(name, loc));
                }
                let slot = self.resolve_ident(&name, &loc)?;
                Ok(Expr::Var(slot, loc))
            }
            other => Err(self.err(format!("unexpected token {other:?}"))),
        }
    }

    fn expr_to_lvalue(&self, expr: Expr) -> HawkResult<LValue> {
        match expr {
            Expr::Var(slot, _) => Ok(LValue::Slot(slot)),
            Expr::Field(inner, _) => Ok(LValue::Field(inner)),
            Expr::Index(base, indices, _) => Ok(LValue::Index(base, indices)),
            other => Err(self.err(format!("{other:?} is not assignable"))),
        }
    }

    /// Folds a binary arithmetic expression over two literal operands
    /// immediately, raising the parse-time divide-by-zero error called for
    /// by spec §9 when possible.
    fn fold_binary(&mut self, op: BinOp, lhs: Expr, rhs: Expr, loc: SourceLoc) -> HawkResult<Expr> {
        let (Expr::Literal(l, _), Expr::Literal(r, _)) = (&lhs, &rhs) else {
            return Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs), loc));
        };
        let (lf, rf) = match (l, r) {
            (Literal::Int(a), Literal::Int(b)) => (*a as f64, *b as f64),
            (Literal::Int(a), Literal::Float(b)) => (*a as f64, *b),
            (Literal::Float(a), Literal::Int(b)) => (*a, *b as f64),
            (Literal::Float(a), Literal::Float(b)) => (*a, *b),
            _ => return Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs), loc)),
        };
        let both_int = matches!(l, Literal::Int(_)) && matches!(r, Literal::Int(_));
        match op {
            BinOp::Div | BinOp::IDiv | BinOp::Mod if rf == 0.0 => {
                Err(HawkError::syntax("division by zero in constant expression", loc))
            }
            BinOp::Add if both_int => Ok(Expr::Literal(Literal::Int(lf as i64 + rf as i64), loc)),
            BinOp::Add => Ok(Expr::Literal(Literal::Float(lf + rf), loc)),
            BinOp::Sub if both_int => Ok(Expr::Literal(Literal::Int(lf as i64 - rf as i64), loc)),
            BinOp::Sub => Ok(Expr::Literal(Literal::Float(lf - rf), loc)),
            BinOp::Mul if both_int => Ok(Expr::Literal(Literal::Int(lf as i64 * rf as i64), loc)),
            BinOp::Mul => Ok(Expr::Literal(Literal::Float(lf * rf), loc)),
            BinOp::Div => Ok(Expr::Literal(Literal::Float(lf / rf), loc)),
            BinOp::IDiv if both_int => Ok(Expr::Literal(Literal::Int(lf as i64 / rf as i64), loc)),
            BinOp::IDiv => Ok(Expr::Literal(Literal::Int((lf / rf).trunc() as i64), loc)),
            BinOp::Mod if both_int => Ok(Expr::Literal(Literal::Int(lf as i64 % rf as i64), loc)),
            BinOp::Mod => Ok(Expr::Literal(Literal::Float(lf % rf), loc)),
            BinOp::Pow if both_int && rf >= 0.0 => {
                Ok(Expr::Literal(Literal::Int((lf as i64).pow(rf as u32)), loc))
            }
            BinOp::Pow => Ok(Expr::Literal(Literal::Float(lf.powf(rf)), loc)),
            _ => Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs), loc)),
        }
    }
}

/// Visits every statement reachable from `stmt` (including nested blocks and
/// bodies), calling `f` on each expression found directly inside it.
fn walk_stmt_exprs(stmt: &Stmt, f: &mut impl FnMut(&Expr) -> HawkResult<()>) -> HawkResult<()> {
    match stmt {
        Stmt::Block(stmts) => {
            for s in stmts {
                walk_stmt_exprs(s, f)?;
            }
        }
        Stmt::Expr(e) => walk_expr(e, f)?,
        Stmt::If(cond, then_b, else_b) => {
            walk_expr(cond, f)?;
            walk_stmt_exprs(then_b, f)?;
            if let Some(e) = else_b {
                walk_stmt_exprs(e, f)?;
            }
        }
        Stmt::While(cond, body) | Stmt::DoWhile(body, cond) => {
            walk_expr(cond, f)?;
            walk_stmt_exprs(body, f)?;
        }
        Stmt::For(init, cond, step, body) => {
            if let Some(s) = init {
                walk_stmt_exprs(s, f)?;
            }
            if let Some(c) = cond {
                walk_expr(c, f)?;
            }
            if let Some(s) = step {
                walk_stmt_exprs(s, f)?;
            }
            walk_stmt_exprs(body, f)?;
        }
        Stmt::ForIn(_, _, body) => walk_stmt_exprs(body, f)?,
        Stmt::Switch(scrutinee, cases, default) => {
            walk_expr(scrutinee, f)?;
            for case in cases {
                for s in &case.body {
                    walk_stmt_exprs(s, f)?;
                }
            }
            if let Some(body) = default {
                for s in body {
                    walk_stmt_exprs(s, f)?;
                }
            }
        }
        Stmt::Return(e, _) | Stmt::Exit(e, _) | Stmt::Abort(e, _) => {
            if let Some(e) = e {
                walk_expr(e, f)?;
            }
        }
        Stmt::Delete(_, indices, _) => {
            for e in indices {
                walk_expr(e, f)?;
            }
        }
        Stmt::Print(args, redirect, _) | Stmt::Printf(args, redirect, _) => {
            for e in args {
                walk_expr(e, f)?;
            }
            match redirect {
                Some(Redirect::Truncate(e) | Redirect::Append(e) | Redirect::Pipe(e) | Redirect::BidirPipe(e)) => {
                    walk_expr(e, f)?;
                }
                None => {}
            }
        }
        Stmt::Break(_) | Stmt::Continue(_) | Stmt::Next(_) | Stmt::NextFile(_) | Stmt::NextOFile(_) | Stmt::Reset(..) => {}
    }
    Ok(())
}

fn walk_expr(expr: &Expr, f: &mut impl FnMut(&Expr) -> HawkResult<()>) -> HawkResult<()> {
    f(expr)?;
    match expr {
        Expr::Literal(..) | Expr::Var(..) | Expr::Argc(_) | Expr::FuncRef(..) | Expr::ModuleRef(..) => {}
        Expr::Field(inner, _) | Expr::Unary(_, inner, _) => walk_expr(inner, f)?,
        Expr::Group(items, _) => {
            for e in items {
                walk_expr(e, f)?;
            }
        }
        Expr::Index(base, indices, _) => {
            walk_expr(base, f)?;
            for e in indices {
                walk_expr(e, f)?;
            }
        }
        Expr::Call(callee, args, _) => {
            walk_expr(callee, f)?;
            for e in args {
                walk_expr(e, f)?;
            }
        }
        Expr::Binary(_, l, r, _) => {
            walk_expr(l, f)?;
            walk_expr(r, f)?;
        }
        Expr::Ternary(c, t, e, _) => {
            walk_expr(c, f)?;
            walk_expr(t, f)?;
            walk_expr(e, f)?;
        }
        Expr::Assign(_, rhs, _) => walk_expr(rhs, f)?,
        Expr::CompoundAssign(_, _, rhs, _) => walk_expr(rhs, f)?,
        Expr::IncDec(..) => {}
        Expr::Getline(src, _, _, _) => match src {
            GetlineSource::Main => {}
            GetlineSource::File(e) | GetlineSource::Cmd(e) | GetlineSource::CoCmd(e) => walk_expr(e, f)?,
        },
        Expr::Argv(idx, _) => {
            if let Some(e) = idx {
                walk_expr(e, f)?;
            }
        }
    }
    Ok(())
}

/// Regenerates Hawk source text from a parsed program, used for the
/// structural-round-trip property (spec §8.1).
pub fn deparse(program: &Program) -> String {
    let mut out = String::new();
    for body in &program.begin {
        out.push_str("BEGIN {\n");
        deparse_stmts(body, 1, &mut out);
        out.push_str("}\n");
    }
    for chain in &program.chains {
        match &chain.pattern {
            Pattern::Always => {}
            Pattern::Expr(e) => {
                out.push_str(&deparse_expr(e));
                out.push(' ');
            }
        }
        if let Some(action) = &chain.action {
            out.push_str("{\n");
            deparse_stmts(action, 1, &mut out);
            out.push_str("}\n");
        } else {
            out.push('\n');
        }
    }
    for body in &program.end {
        out.push_str("END {\n");
        deparse_stmts(body, 1, &mut out);
        out.push_str("}\n");
    }
    for f in &program.functions {
        out.push_str(&format!("function {}(", f.name));
        let params: Vec<String> =
            f.params.iter().map(|p| if p.by_ref { format!("&{}", p.name) } else { p.name.to_string() }).collect();
        out.push_str(&params.join(", "));
        out.push_str(") {\n");
        deparse_stmts(&f.body, 1, &mut out);
        out.push_str("}\n");
    }
    out
}

fn indent(level: usize, out: &mut String) {
    for _ in 0..level {
        out.push_str("    ");
    }
}

fn deparse_stmts(stmts: &[Stmt], level: usize, out: &mut String) {
    for s in stmts {
        deparse_stmt(s, level, out);
    }
}

fn deparse_stmt(stmt: &Stmt, level: usize, out: &mut String) {
    indent(level, out);
    match stmt {
        Stmt::Block(stmts) => {
            out.push_str("{\n");
            deparse_stmts(stmts, level + 1, out);
            indent(level, out);
            out.push_str("}\n");
        }
        Stmt::Expr(e) => {
            out.push_str(&deparse_expr(e));
            out.push('\n');
        }
        Stmt::If(cond, then_b, else_b) => {
            out.push_str(&format!("if ({}) ", deparse_expr(cond)));
            out.push_str("{\n");
            deparse_stmt_inline(then_b, level + 1, out);
            indent(level, out);
            out.push('}');
            if let Some(e) = else_b {
                out.push_str(" else {\n");
                deparse_stmt_inline(e, level + 1, out);
                indent(level, out);
                out.push('}');
            }
            out.push('\n');
        }
        Stmt::While(cond, body) => {
            out.push_str(&format!("while ({}) {{\n", deparse_expr(cond)));
            deparse_stmt_inline(body, level + 1, out);
            indent(level, out);
            out.push_str("}\n");
        }
        Stmt::DoWhile(body, cond) => {
            out.push_str("do {\n");
            deparse_stmt_inline(body, level + 1, out);
            indent(level, out);
            out.push_str(&format!("}} while ({})\n", deparse_expr(cond)));
        }
        Stmt::For(init, cond, step, body) => {
            let init_s = init.as_ref().map(|s| deparse_stmt_to_string(s)).unwrap_or_default();
            let cond_s = cond.as_ref().map(deparse_expr).unwrap_or_default();
            let step_s = step.as_ref().map(|s| deparse_stmt_to_string(s)).unwrap_or_default();
            out.push_str(&format!("for ({init_s}; {cond_s}; {step_s}) {{\n"));
            deparse_stmt_inline(body, level + 1, out);
            indent(level, out);
            out.push_str("}\n");
        }
        Stmt::ForIn(key, arr, body) => {
            out.push_str(&format!("for ({} in {}) {{\n", deparse_slot(key), deparse_slot(arr)));
            deparse_stmt_inline(body, level + 1, out);
            indent(level, out);
            out.push_str("}\n");
        }
        Stmt::Switch(scrutinee, cases, default) => {
            out.push_str(&format!("switch ({}) {{\n", deparse_expr(scrutinee)));
            for case in cases {
                indent(level + 1, out);
                let labels: Vec<String> = case.labels.iter().map(deparse_literal).collect();
                out.push_str(&format!("case {}:\n", labels.join(", ")));
                deparse_stmts(&case.body, level + 2, out);
            }
            if let Some(body) = default {
                indent(level + 1, out);
                out.push_str("default:\n");
                deparse_stmts(body, level + 2, out);
            }
            indent(level, out);
            out.push_str("}\n");
        }
        Stmt::Break(_) => out.push_str("break\n"),
        Stmt::Continue(_) => out.push_str("continue\n"),
        Stmt::Return(v, _) => {
            out.push_str("return");
            if let Some(e) = v {
                out.push(' ');
                out.push_str(&deparse_expr(e));
            }
            out.push('\n');
        }
        Stmt::Exit(v, _) => {
            out.push_str("exit");
            if let Some(e) = v {
                out.push(' ');
                out.push_str(&deparse_expr(e));
            }
            out.push('\n');
        }
        Stmt::Abort(v, _) => {
            out.push_str("@abort");
            if let Some(e) = v {
                out.push(' ');
                out.push_str(&deparse_expr(e));
            }
            out.push('\n');
        }
        Stmt::Next(_) => out.push_str("next\n"),
        Stmt::NextFile(_) => out.push_str("nextfile\n"),
        Stmt::NextOFile(_) => out.push_str("nextofile\n"),
        Stmt::Delete(slot, indices, _) => {
            out.push_str(&format!("delete {}", deparse_slot(slot)));
            if !indices.is_empty() {
                let idx: Vec<String> = indices.iter().map(deparse_expr).collect();
                out.push_str(&format!("[{}]", idx.join(", ")));
            }
            out.push('\n');
        }
        Stmt::Reset(slot, _) => out.push_str(&format!("@reset {}\n", deparse_slot(slot))),
        Stmt::Print(args, redirect, _) => {
            out.push_str("print");
            deparse_print_tail(args, redirect, out);
        }
        Stmt::Printf(args, redirect, _) => {
            out.push_str("printf");
            deparse_print_tail(args, redirect, out);
        }
    }
}

fn deparse_print_tail(args: &[Expr], redirect: &Option<Redirect>, out: &mut String) {
    if !args.is_empty() {
        out.push(' ');
        let items: Vec<String> = args.iter().map(deparse_expr).collect();
        out.push_str(&items.join(", "));
    }
    match redirect {
        Some(Redirect::Truncate(e)) => out.push_str(&format!(" > {}", deparse_expr(e))),
        Some(Redirect::Append(e)) => out.push_str(&format!(" >> {}", deparse_expr(e))),
        Some(Redirect::Pipe(e)) => out.push_str(&format!(" | {}", deparse_expr(e))),
        Some(Redirect::BidirPipe(e)) => out.push_str(&format!(" |& {}", deparse_expr(e))),
        None => {}
    }
    out.push('\n');
}

fn deparse_stmt_to_string(stmt: &Stmt) -> String {
    let mut s = String::new();
    deparse_stmt(stmt, 0, &mut s);
    s.trim_end().to_string()
}

fn deparse_stmt_inline(stmt: &Stmt, level: usize, out: &mut String) {
    match stmt {
        Stmt::Block(stmts) => deparse_stmts(stmts, level, out),
        other => deparse_stmt(other, level, out),
    }
}

fn deparse_slot(slot: &Slot) -> String {
    match slot {
        Slot::Global(i) => format!("$g{i}"),
        Slot::Param(i) => format!("$p{i}"),
        Slot::Local(i) => format!("$l{i}"),
        Slot::Named(n) => n.to_string(),
        Slot::SelfFunction => "@self".to_string(),
    }
}

fn deparse_literal(lit: &Literal) -> String {
    match lit {
        Literal::Int(v) => v.to_string(),
        Literal::Float(v) => v.to_string(),
        Literal::Str(s) => format!("{s:?}"),
        Literal::ByteStr(b) => format!("b{:?}", String::from_utf8_lossy(b)),
        Literal::Char(c) => format!("'{c}'"),
        Literal::ByteChar(b) => format!("'{}'", *b as char),
        Literal::Regex(r) => format!("/{r}/"),
        Literal::Nil => "@nil".to_string(),
    }
}

fn deparse_expr(expr: &Expr) -> String {
    match expr {
        Expr::Literal(lit, _) => deparse_literal(lit),
        Expr::Var(slot, _) => deparse_slot(slot),
        Expr::Field(inner, _) => format!("${}", deparse_expr(inner)),
        Expr::Group(items, _) => {
            let parts: Vec<String> = items.iter().map(deparse_expr).collect();
            format!("({})", parts.join(", "))
        }
        Expr::Index(base, indices, _) => {
            let idx: Vec<String> = indices.iter().map(deparse_expr).collect();
            format!("{}[{}]", deparse_expr(base), idx.join(", "))
        }
        Expr::Call(callee, args, _) => {
            let a: Vec<String> = args.iter().map(deparse_expr).collect();
            format!("{}({})", deparse_expr(callee), a.join(", "))
        }
        Expr::ModuleRef(ns, sym, _) => format!("{ns}::{sym}"),
        Expr::Unary(op, inner, _) => {
            let sym = match op {
                UnOp::Neg => "-",
                UnOp::Plus => "+",
                UnOp::Not => "!",
                UnOp::BitNot => "~",
            };
            format!("{sym}{}", deparse_expr(inner))
        }
        Expr::Binary(op, l, r, _) => format!("({} {} {})", deparse_expr(l), binop_sym(*op), deparse_expr(r)),
        Expr::Ternary(c, t, e, _) => format!("({} ? {} : {})", deparse_expr(c), deparse_expr(t), deparse_expr(e)),
        Expr::Assign(lv, rhs, _) => format!("{} = {}", deparse_lvalue(lv), deparse_expr(rhs)),
        Expr::CompoundAssign(lv, op, rhs, _) => {
            format!("{} {}= {}", deparse_lvalue(lv), binop_sym(*op), deparse_expr(rhs))
        }
        Expr::IncDec(op, lv, _) => match op {
            IncDecOp::PreInc => format!("++{}", deparse_lvalue(lv)),
            IncDecOp::PreDec => format!("--{}", deparse_lvalue(lv)),
            IncDecOp::PostInc => format!("{}++", deparse_lvalue(lv)),
            IncDecOp::PostDec => format!("{}--", deparse_lvalue(lv)),
        },
        Expr::Getline(src, lvalue, _, _) => {
            let target = lvalue.as_ref().map(|lv| format!(" {}", deparse_lvalue(lv))).unwrap_or_default();
            match src {
                GetlineSource::Main => format!("getline{target}"),
                GetlineSource::File(f) => format!("getline{target} < {}", deparse_expr(f)),
                GetlineSource::Cmd(c) => format!("{} | getline{target}", deparse_expr(c)),
                GetlineSource::CoCmd(c) => format!("{} |& getline{target}", deparse_expr(c)),
            }
        }
        Expr::Argc(_) => "@argc".to_string(),
        Expr::Argv(idx, _) => match idx {
            Some(i) => format!("@argv[{}]", deparse_expr(i)),
            None => "@argv".to_string(),
        },
        Expr::FuncRef(name, _) => name.to_string(),
    }
}

fn deparse_lvalue(lv: &LValue) -> String {
    match lv {
        LValue::Slot(s) => deparse_slot(s),
        LValue::Field(e) => format!("${}", deparse_expr(e)),
        LValue::Index(base, indices) => {
            let idx: Vec<String> = indices.iter().map(deparse_expr).collect();
            format!("{}[{}]", deparse_expr(base), idx.join(", "))
        }
    }
}

fn binop_sym(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::IDiv => "\\",
        BinOp::Mod => "%",
        BinOp::Pow => "**",
        BinOp::Concat => " ",
        BinOp::Lt => "<",
        BinOp::Le => "<=",
        BinOp::Gt => ">",
        BinOp::Ge => ">=",
        BinOp::Eq => "==",
        BinOp::Ne => "!=",
        BinOp::StrictEq => "===",
        BinOp::StrictNe => "!==",
        BinOp::And => "&&",
        BinOp::Or => "||",
        BinOp::Match => "~",
        BinOp::NotMatch => "!~",
        BinOp::In => "in",
        BinOp::BitAnd => "&",
        BinOp::BitOr => "|",
        BinOp::BitXor => "^^",
        BinOp::Shl => "<<",
        BinOp::Shr => ">>",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemorySourceIo;

    fn parse(src: &str) -> HawkResult<Program> {
        let mut io = MemorySourceIo::new().with_main(src);
        let options = Options::default();
        let mut parser = Parser::new(&mut io, &options)?;
        parser.parse_program()
    }

    #[test]
    fn parses_field_split_and_print() {
        let prog = parse(r#"{ print $1, $2 }"#).unwrap();
        assert_eq!(prog.chains.len(), 1);
    }

    #[test]
    fn constant_folds_arithmetic() {
        let prog = parse("BEGIN { x = 1+2*3 }").unwrap();
        let Stmt::Expr(Expr::Assign(_, rhs, _)) = &prog.begin[0][0] else {
            panic!("unexpected shape");
        };
        assert!(matches!(**rhs, Expr::Literal(Literal::Int(7), _)));
    }

    #[test]
    fn parse_time_division_by_zero_is_an_error() {
        let err = parse("BEGIN { x = 10 / 0 }").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Syntax);
    }

    #[test]
    fn runtime_division_by_zero_is_not_folded() {
        // a variable divisor cannot be constant-folded, so this must parse fine.
        let prog = parse("BEGIN { y = 0; x = 10 / y }").unwrap();
        assert_eq!(prog.begin[0].len(), 2);
    }

    #[test]
    fn include_once_silently_skips_repeat() {
        let mut io = MemorySourceIo::new()
            .with_main("@include_once \"a.hwk\"\n@include_once \"a.hwk\"\nBEGIN { print 1 }")
            .with_named("a.hwk", "function helper() { return 1 }\n");
        let options = Options::default();
        let mut parser = Parser::new(&mut io, &options).unwrap();
        let prog = parser.parse_program().unwrap();
        assert_eq!(prog.functions.len(), 1);
    }

    #[test]
    fn duplicate_function_definition_is_rejected() {
        let err = parse("function f() { return 1 }\nfunction f() { return 2 }\nBEGIN { }").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Semantic);
    }

    #[test]
    fn call_to_undefined_function_is_rejected() {
        let err = parse("BEGIN { undefined_fn(1) }").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Semantic);
    }

    #[test]
    fn variadic_function_and_reference_param_parse() {
        let prog = parse("function f(&x, ...) { return @argc }\nBEGIN { y = 1; f(y) }").unwrap();
        assert_eq!(prog.functions[0].params.len(), 1);
        assert!(prog.functions[0].params[0].by_ref);
        assert!(prog.functions[0].variadic);
    }

    #[test]
    fn wrong_arity_call_to_user_function_is_rejected() {
        let err = parse("function f(a, b) { return a + b }\nBEGIN { f(1) }").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Semantic);
    }

    #[test]
    fn nested_call_arity_is_checked_inside_call_arguments() {
        let err = parse("function f(a) { return a }\nfunction g() { return f() }\nBEGIN { print f(g(1)) }").unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::Semantic);
    }

    #[test]
    fn deparse_round_trip_preserves_shape() {
        let src = "BEGIN { x = 1 + 2\n  if (x > 2) { print x } else { print 0 } }";
        let prog = parse(src).unwrap();
        let text = deparse(&prog);
        let reparsed = parse(&text).unwrap();
        assert_eq!(prog.begin.len(), reparsed.begin.len());
        assert_eq!(prog.begin[0].len(), reparsed.begin[0].len());
    }

    #[test]
    fn print_pipe_splits_into_redirect_not_bitor() {
        let prog = parse(r#"BEGIN { print "a" | "cat" }"#).unwrap();
        let Stmt::Print(args, Some(Redirect::Pipe(target)), _) = &prog.begin[0][0] else {
            panic!("expected a pipe-redirected print, got {:?}", prog.begin[0][0]);
        };
        assert_eq!(args.len(), 1);
        assert!(matches!(args[0], Expr::Literal(Literal::Str(_), _)));
        assert!(matches!(**target, Expr::Literal(Literal::Str(_), _)));
    }

    #[test]
    fn print_append_splits_into_redirect_not_shift() {
        let prog = parse(r#"BEGIN { print "a" >> "out.txt" }"#).unwrap();
        let Stmt::Print(_, Some(Redirect::Append(_)), _) = &prog.begin[0][0] else {
            panic!("expected an append-redirected print, got {:?}", prog.begin[0][0]);
        };
    }

    #[test]
    fn parenthesized_print_arg_disables_pipe_redirect_split() {
        let prog = parse(r#"BEGIN { print (3 | 5) }"#).unwrap();
        let Stmt::Print(args, None, _) = &prog.begin[0][0] else {
            panic!("expected a plain print with no redirect, got {:?}", prog.begin[0][0]);
        };
        assert_eq!(args.len(), 1);
        assert!(matches!(args[0], Expr::Binary(BinOp::BitOr, _, _, _)), "expected an unsplit bitor, got {:?}", args[0]);
    }

    #[test]
    fn printf_pipe_redirect_also_splits() {
        let prog = parse(r#"BEGIN { printf "%d", 1 | "cat" }"#).unwrap();
        assert!(matches!(&prog.begin[0][0], Stmt::Printf(_, Some(Redirect::Pipe(_)), _)));
    }
}
