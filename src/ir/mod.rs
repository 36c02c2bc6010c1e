//! Stack-machine operations and the AST lowering walker
//!
//! Lowering turns a translation unit into a stream of [`Op`]s for a
//! stack machine: constants and loads push, binary operators pop two values
//! and push one, `Store` and `Drop` pop, `Halt` pops the return value and
//! leaves the function.
//!
//! The stream is delivered to an [`OpSink`]. The bytecode builder and the
//! native code generator are both sinks, so compiling from the AST and
//! compiling from bytecode see exactly the same operations.

mod walk;

pub use walk::lower;

use crate::parser::ast::SourceLocation;
use std::fmt;

/// Comparison performed by [`Op::Compare`]. Pushes 1 or 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Cmp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Cmp {
    pub const ALL: [Cmp; 6] = [Cmp::Eq, Cmp::Ne, Cmp::Lt, Cmp::Le, Cmp::Gt, Cmp::Ge];

    pub fn symbol(self) -> &'static str {
        match self {
            Cmp::Eq => "==",
            Cmp::Ne => "!=",
            Cmp::Lt => "<",
            Cmp::Le => "<=",
            Cmp::Gt => ">",
            Cmp::Ge => ">=",
        }
    }
}

/// Jump target handed out by [`OpSink::new_label`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// One stack-machine operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op<'a> {
    Nop,
    /// Pop the return value and leave the function
    Halt,
    Drop,
    Const(i32),
    /// Push the address of a NUL-terminated copy of these bytes
    ConstString(&'a [u8]),
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Compare(Cmp),
    Store(u32),
    Load(u32),
    Jump(Label),
    JumpIfFalse(Label),
    /// Call the function at this index of the module's function table
    Call { function: u16, argc: u16 },
    LibcCall { id: u16, argc: u16 },
}

impl Op<'_> {
    /// Control never falls through past this operation.
    pub fn is_terminator(&self) -> bool {
        matches!(self, Op::Halt | Op::Jump(_))
    }
}

/// Per-function layout shared by every sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionInfo {
    pub name: String,
    pub params: u16,
    /// Total frame slots, parameters included
    pub locals: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportInfo {
    pub name: String,
    pub path: Option<String>,
}

/// Module-level facts known before any code is generated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleInfo {
    pub name: Option<String>,
    pub imports: Vec<ImportInfo>,
    /// Explicit `export` declarations; empty means every function is exported
    pub exports: Vec<String>,
    pub functions: Vec<FunctionInfo>,
}

impl ModuleInfo {
    pub fn function_index(&self, name: &str) -> Option<usize> {
        self.functions.iter().position(|f| f.name == name)
    }

    pub fn main_index(&self) -> Option<usize> {
        self.function_index("main")
    }

    pub fn is_exported(&self, name: &str) -> bool {
        self.exports.is_empty() || self.exports.iter().any(|e| e == name)
    }
}

/// Consumer of a lowered operation stream.
pub trait OpSink {
    type Error: From<LowerError>;

    /// Called once, before the first function.
    fn begin_module(&mut self, module: &ModuleInfo) -> Result<(), Self::Error>;

    fn begin_function(&mut self, function: &FunctionInfo) -> Result<(), Self::Error>;

    fn end_function(&mut self) -> Result<(), Self::Error>;

    fn new_label(&mut self) -> Label;

    /// Attach `label` to the next operation.
    fn bind(&mut self, label: Label) -> Result<(), Self::Error>;

    fn op(&mut self, op: Op<'_>) -> Result<(), Self::Error>;
}

/// Errors raised while lowering the AST.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LowerError {
    #[error("line {}, column {}: {what} is not supported", location.line, location.column)]
    Unsupported {
        what: String,
        location: SourceLocation,
    },
    #[error("line {}, column {}: undefined variable '{name}'", location.line, location.column)]
    UndefinedVariable {
        name: String,
        location: SourceLocation,
    },
    #[error("line {}, column {}: call to undefined function '{name}'", location.line, location.column)]
    UndefinedFunction {
        name: String,
        location: SourceLocation,
    },
    #[error("line {}, column {}: '{name}' is already declared in this scope", location.line, location.column)]
    Redeclared {
        name: String,
        location: SourceLocation,
    },
    #[error("line {}, column {}: function '{name}' is defined more than once", location.line, location.column)]
    DuplicateFunction {
        name: String,
        location: SourceLocation,
    },
    #[error(
        "line {}, column {}: '{name}' takes {expected} argument(s), {found} given",
        location.line,
        location.column
    )]
    ArityMismatch {
        name: String,
        expected: usize,
        found: usize,
        location: SourceLocation,
    },
    #[error("line {}, column {}: '{keyword}' outside of a loop", location.line, location.column)]
    OutsideLoop {
        keyword: &'static str,
        location: SourceLocation,
    },
    #[error("line {}, column {}: constant {value} does not fit in 32 bits", location.line, location.column)]
    ConstantOutOfRange {
        value: i64,
        location: SourceLocation,
    },
    #[error("too many {what} (limit {limit})")]
    LimitExceeded { what: &'static str, limit: usize },
    #[error("expected a translation unit, found {0}")]
    NotATranslationUnit(&'static str),
}
