//! Typed AST produced by the parser (spec §4.2, grammar in §6.4).

use std::rc::Rc;

use crate::loc::SourceLoc;

/// A literal value recognized at parse time, before any name resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Float(f64),
    Str(Rc<str>),
    ByteStr(Rc<[u8]>),
    Char(char),
    ByteChar(u8),
    /// Compiled lazily by the runtime the first time it is evaluated;
    /// stores the original source text (spec §3.1 Regex variant).
    Regex(Rc<str>),
    Nil,
}

/// Resolved slot a bare identifier refers to, filled in during parsing
/// (spec §3.3 symbol scopes / §4.2 identifier resolution order).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Slot {
    Global(u32),
    Param(u32),
    Local(u32),
    /// A named variable that materializes at first use (implicit dialect).
    Named(Rc<str>),
    /// The enclosing function referring to itself (for recursive calls by
    /// function-value, e.g. passing the function as a first-class value).
    SelfFunction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    Concat,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    StrictEq,
    StrictNe,
    And,
    Or,
    Match,
    NotMatch,
    In,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Plus,
    Not,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncDecOp {
    PreInc,
    PreDec,
    PostInc,
    PostDec,
}

/// Output redirection target for `print`/`printf` (spec "Print redirections").
#[derive(Debug, Clone)]
pub enum Redirect {
    Truncate(Box<Expr>),
    Append(Box<Expr>),
    Pipe(Box<Expr>),
    BidirPipe(Box<Expr>),
}

/// `getline` source form (spec §4.5 "getline forms").
#[derive(Debug, Clone)]
pub enum GetlineSource {
    /// Plain `getline` / `getline var`, reading the current main input.
    Main,
    /// `getline [var] < file`.
    File(Box<Expr>),
    /// `cmd | getline [var]`.
    Cmd(Box<Expr>),
    /// `cmd |& getline [var]`.
    CoCmd(Box<Expr>),
}

/// An lvalue: something `$k =`, `a[...] =`, plain assignment, `delete`, and
/// reference-parameter binding can all target.
#[derive(Debug, Clone)]
pub enum LValue {
    Slot(Slot),
    Field(Box<Expr>),
    Index(Box<Expr>, Vec<Expr>),
}

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Literal, SourceLoc),
    Var(Slot, SourceLoc),
    Field(Box<Expr>, SourceLoc),
    /// `(a, b, c)` — a parenthesized group, used bare for `print(a,b)` style
    /// argument grouping and for `(x,y) in arr` subscript tests.
    Group(Vec<Expr>, SourceLoc),
    Index(Box<Expr>, Vec<Expr>, SourceLoc),
    Call(Box<Expr>, Vec<Expr>, SourceLoc),
    /// `ns::sym` reference, resolved eagerly against the module registry at
    /// parse time (spec §4.2 "ns::sym").
    ModuleRef(Rc<str>, Rc<str>, SourceLoc),
    Unary(UnOp, Box<Expr>, SourceLoc),
    Binary(BinOp, Box<Expr>, Box<Expr>, SourceLoc),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>, SourceLoc),
    Assign(LValue, Box<Expr>, SourceLoc),
    /// Compound assignment (`+=`, `-=`, ...); `op` is the underlying binary op.
    CompoundAssign(LValue, BinOp, Box<Expr>, SourceLoc),
    IncDec(IncDecOp, LValue, SourceLoc),
    Getline(GetlineSource, Option<LValue>, bool /* byte form */, SourceLoc),
    /// `@argc` inside a function body.
    Argc(SourceLoc),
    /// `@argv` or `@argv[idx]`.
    Argv(Option<Box<Expr>>, SourceLoc),
    /// `func` used as a first-class value (bare function name with no call).
    FuncRef(Rc<str>, SourceLoc),
}

impl Expr {
    pub fn loc(&self) -> &SourceLoc {
        match self {
            Self::Literal(_, l)
            | Self::Var(_, l)
            | Self::Field(_, l)
            | Self::Group(_, l)
            | Self::Index(_, _, l)
            | Self::Call(_, _, l)
            | Self::ModuleRef(_, _, l)
            | Self::Unary(_, _, l)
            | Self::Binary(_, _, _, l)
            | Self::Ternary(_, _, _, l)
            | Self::Assign(_, _, l)
            | Self::CompoundAssign(_, _, _, l)
            | Self::IncDec(_, _, l)
            | Self::Getline(_, _, _, l)
            | Self::Argc(l)
            | Self::Argv(_, l)
            | Self::FuncRef(_, l) => l,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SwitchCase {
    pub labels: Vec<Literal>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Block(Vec<Stmt>),
    Expr(Expr),
    If(Expr, Box<Stmt>, Option<Box<Stmt>>),
    While(Expr, Box<Stmt>),
    DoWhile(Box<Stmt>, Expr),
    For(Option<Box<Stmt>>, Option<Expr>, Option<Box<Stmt>>, Box<Stmt>),
    ForIn(Slot, Slot, Box<Stmt>),
    Switch(Expr, Vec<SwitchCase>, Option<Vec<Stmt>>),
    Break(SourceLoc),
    Continue(SourceLoc),
    Return(Option<Expr>, SourceLoc),
    Exit(Option<Expr>, SourceLoc),
    Abort(Option<Expr>, SourceLoc),
    Next(SourceLoc),
    NextFile(SourceLoc),
    NextOFile(SourceLoc),
    Delete(Slot, Vec<Expr>, SourceLoc),
    Reset(Slot, SourceLoc),
    Print(Vec<Expr>, Option<Redirect>, SourceLoc),
    Printf(Vec<Expr>, Option<Redirect>, SourceLoc),
}

/// A user function definition (spec §4.2 `function`).
#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: Rc<str>,
    pub params: Vec<Param>,
    pub variadic: bool,
    pub nlocals: u32,
    pub body: Vec<Stmt>,
    pub loc: SourceLoc,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: Rc<str>,
    pub by_ref: bool,
}

/// A `pattern { action }` chain entry (spec §4.2 `chain`).
#[derive(Debug, Clone)]
pub enum Pattern {
    Always,
    Expr(Expr),
}

#[derive(Debug, Clone)]
pub struct Chain {
    pub pattern: Pattern,
    /// `None` means "blockless pattern", implying `print $0`.
    pub action: Option<Vec<Stmt>>,
}

/// The fully parsed program (spec §2 "program tree").
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub begin: Vec<Vec<Stmt>>,
    pub end: Vec<Vec<Stmt>>,
    pub chains: Vec<Chain>,
    pub functions: Vec<FunctionDef>,
    pub nglobals: u32,
}
