//! `mythos` language core.
//!
//! High-level layout:
//! - frontend: `lexer` + `parser` produce the AST (`ast`)
//! - `emitter` lowers the AST to stack bytecode (`bytecode`)
//! - `vm` executes code objects over the runtime `value` model, with host
//!   functions injected through `builtins`
//! - `image` round-trips compiled programs to disk; `repl` drives an
//!   interactive session
//!
//! Embedding needs three operations: [`compile`], `builtins::Registry` for
//! registering host functions, and `vm::Vm::run`.

pub mod ast;
pub mod builtins;
pub mod bytecode;
pub mod emitter;
pub mod image;
pub mod lexer;
pub mod parser;
pub mod repl;
pub mod token;
pub mod value;
pub mod vm;

use std::rc::Rc;

use thiserror::Error;

use crate::bytecode::CodeObject;

/// Any failure on the way from source text to executable code. Lex and
/// parse errors abort compilation and cannot be caught by the program.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CompileError {
    #[error(transparent)]
    Lex(#[from] lexer::LexError),
    #[error(transparent)]
    Parse(#[from] parser::ParseError),
    #[error(transparent)]
    Emit(#[from] emitter::EmitError),
}

/// Compiles source text into an executable code object.
pub fn compile(source: &str) -> Result<Rc<CodeObject>, CompileError> {
    let tokens = lexer::tokenize(source)?;
    tracing::debug!(tokens = tokens.len(), "tokenized");
    let program = parser::parse_tokens(tokens)?;
    tracing::debug!(statements = program.statements.len(), "parsed");
    let code = emitter::compile(&program)?;
    tracing::debug!(instructions = code.code.len(), consts = code.consts.len(), "emitted");
    Ok(code)
}
