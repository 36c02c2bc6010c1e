//! C source code parser
//!
//! This module transforms C source text into an Abstract Syntax Tree (AST):
//! - [`lexer`]: Tokenization (source text → tokens)
//! - [`parse`]: Parser core, error recovery and helpers (tokens → AST)
//! - [`ast`]: AST node definitions
//!
//! The grammar productions live in `declarations`, `statements` and
//! `expressions`, each adding methods to [`parse::Parser`].
//!
//! # Supported C Subset
//!
//! - Types: `int`, `char`, `short`, `long`, `float`, `double`, `void`,
//!   `unsigned`/`signed`/`const` qualifiers, pointers, named structs
//! - Top level: functions, prototypes, globals, `module`, `import`, `export`
//! - Statements: declarations, `if`, `while`, `do-while`, `for`, `return`,
//!   `break`, `continue`, blocks, expression statements
//! - Expressions: arithmetic, comparison, logical, bitwise, assignment, calls
//! - No preprocessor (`#` lines are skipped)
//!
//! Accepting a construct here does not mean the code generator supports it;
//! see [`crate::ir`] for what can be lowered.

pub mod ast;
mod declarations;
mod expressions;
pub mod lexer;
pub mod parse;
mod statements;

pub use parse::{ParseError, ParseErrors, Parser};

/// Parse a complete translation unit.
pub fn parse(source: &str) -> Result<ast::AstNode, ParseErrors> {
    Parser::new(source).parse_translation_unit()
}
