//! Khronicler: a compiler toolchain and stack virtual machine for KBasic,
//! a small BASIC-flavored language.
//!
//! The pipeline has three stages sharing one binary contract:
//!
//! 1. [`parse`] turns source text into an AST, reporting syntax errors with
//!    line and statement context.
//! 2. [`compile`] lowers the AST to a linear opcode stream with a resolved
//!    string pool and function table; [`serialize`] packs the result into a
//!    self-describing binary image.
//! 3. [`Machine`] executes a loaded [`Image`]: global and per-frame local
//!    variables, user-defined functions, built-in intrinsics, dynamic
//!    strings and dynamic arrays.
//!
//! ```
//! use khronicler::{Image, Machine, build};
//!
//! let bytes = build("dim x = 3 + 4 * 2\nexit x\n").unwrap();
//! let image = Image::load(&bytes).unwrap();
//! let mut machine = Machine::new(&image);
//! assert_eq!(machine.execute().unwrap(), 11);
//! ```

mod ast;
mod builtins;
mod compile;
mod heap;
mod image;
mod intern;
mod io;
mod lexer;
mod num;
mod op;
mod parse;
mod run;
mod tracer;
mod value;

pub use crate::{
    ast::{ElseIfArm, Expr, FuncParam, Operator, Program, Stmt, StmtKind},
    builtins::Builtin,
    compile::{
        CompiledProgram, ExtFunction, FuncInfo, IDENTIFIER_LEN_MAX, SemanticError,
        SemanticErrorReport, compile,
    },
    heap::ArrayId,
    image::{HEADER_MAGIC, Image, ImageError, serialize},
    intern::STRING_POOL_MAX,
    io::{CollectStringPrint, NoPrint, PrintWriter, StdPrint},
    lexer::{Keyword, LineAnalyzer, Token, TokenKind},
    op::{JumpTarget, Op, OpId, VarAccess},
    parse::{StatementKind, SyntaxError, SyntaxErrorReport, parse},
    run::{Machine, RuntimeError, RuntimeErrorReport},
    tracer::{NoopTracer, RecordingTracer, StderrTracer, TraceEvent, VmTracer},
    value::{RtStr, Value},
};

/// A parse- or compile-stage failure from [`build`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    Syntax(SyntaxErrorReport),
    Semantic(SemanticErrorReport),
}

impl BuildError {
    /// Source line the build stopped on.
    pub fn line(&self) -> u32 {
        match self {
            Self::Syntax(report) => report.line,
            Self::Semantic(report) => report.line,
        }
    }
}

impl std::fmt::Display for BuildError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Syntax(report) => {
                write!(f, "[Line {}] {}", report.line, report.error.message())
            }
            Self::Semantic(report) => {
                write!(f, "[Line {}] {}", report.line, report.error.message())
            }
        }
    }
}

impl std::error::Error for BuildError {}

impl From<SyntaxErrorReport> for BuildError {
    fn from(report: SyntaxErrorReport) -> Self {
        Self::Syntax(report)
    }
}

impl From<SemanticErrorReport> for BuildError {
    fn from(report: SemanticErrorReport) -> Self {
        Self::Semantic(report)
    }
}

/// Parses, compiles and serializes `source` into a binary image.
pub fn build(source: &str) -> Result<Vec<u8>, BuildError> {
    let program = parse(source)?;
    let compiled = compile(&program)?;
    Ok(serialize(&compiled))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_formats_errors_with_line_numbers() {
        let error = build("dim x = 1\ndim y = 2 +\n").unwrap_err();
        assert_eq!(error.line(), 2);
        assert_eq!(error.to_string(), "[Line 2] Invalid expression syntax.");

        let error = build("dim a = b\n").unwrap_err();
        assert_eq!(error.to_string(), "[Line 1] Undefined variable");
    }
}
