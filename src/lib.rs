//! Kakapo - an embeddable evaluator for a small Lisp
//!
//! This crate evaluates already-parsed s-expressions against a mutable,
//! lexically scoped environment. It supports closures with variadic
//! parameter lists, non-hygienic substitution macros, special forms,
//! calling strongly typed Rust functions as if they were native
//! expressions, and lightweight concurrency through background evaluation
//! and rendezvous channels.
//!
//! ```lisp
//! (define square (lambda (x) (* x x)))
//! (map square '(1 2 3))                ; (1 4 9)
//! (defmacro unless (c body) (if c nil body))
//! (let ((c (make-chan)))
//!   (spawn (send c (square 12)))
//!   (recv c))                          ; 144
//! ```
//!
//! ## Truthiness
//!
//! `nil` doubles as the empty list and the only false value. Everything
//! else, including `0` and `""`, is true. Predicates return `1` for truth,
//! which is also what host `bool`s convert to.
//!
//! ## Modules
//!
//! - `ast`: the value model (`Expr`) and list helpers
//! - `environment`: chained, shared scopes
//! - `evaluator`: evaluation, application and the special forms
//! - `macroexpand`: substitution-based macros
//! - `builtinops`: registry of special forms and builtin functions
//! - `interop`: host packages imported into the language
//! - `concurrency`: `spawn` and channels
//! - `reader`: s-expression reader (feature `reader`)
//! - `interpreter`: the embedding facade

use std::fmt;

use crate::ast::Expr;
use crate::evaluator::Arity;

/// Maximum parsing depth to prevent stack overflow on deeply nested input
pub const MAX_PARSE_DEPTH: usize = 128;

/// Maximum evaluation depth to prevent stack overflow in recursive evaluation.
/// Every nested evaluation (argument, body, macro expansion) counts one level.
pub const MAX_EVAL_DEPTH: usize = 20_000;

/// Stack size of the threads evaluation runs on, both those started by
/// `spawn` and the one the public entry points hand their work to.
pub const EVAL_STACK_SIZE: usize = 128 * 1024 * 1024;

/// Stack kept free below the deepest evaluation for builtins, host functions
/// and error formatting. Evaluation fails once it would eat into it.
pub const EVAL_STACK_RESERVE: usize = 2 * 1024 * 1024;

/// Interpreter name exposed to programs as `-interpreter`
pub const INTERPRETER_NAME: &str = "Kakapo";

/// Interpreter version exposed to programs as `-interpreter-version`
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Categorizes the different kinds of parsing errors.
#[derive(Debug, PartialEq, Clone)]
pub enum ParseErrorKind {
    /// Invalid or unexpected syntax (bad tokens, malformed expressions)
    InvalidSyntax,
    /// Input ended before the expression was complete (EOF, unterminated string, unclosed parens)
    Incomplete,
    /// Expression nesting exceeded the maximum parse depth
    TooDeeplyNested,
    /// Extra input found after a complete, valid expression
    TrailingContent,
}

/// A structured error providing detailed information about a parsing failure.
#[derive(Debug, PartialEq, Clone)]
pub struct ParseError {
    pub kind: ParseErrorKind,
    pub message: String,
    /// Context snippet from the input showing where the error occurred (max 100 chars)
    pub context: Option<String>,
    /// The problematic token or character encountered, if identifiable
    pub found: Option<String>,
}

impl ParseError {
    pub fn new(
        kind: ParseErrorKind,
        message: impl Into<String>,
        context: Option<String>,
        found: Option<String>,
    ) -> Self {
        ParseError {
            kind,
            message: message.into(),
            context,
            found,
        }
    }

    /// Create a simple ParseError with a kind and message but no context
    pub fn from_message(kind: ParseErrorKind, message: impl Into<String>) -> Self {
        Self::new(kind, message, None, None)
    }

    /// Create a ParseError with context extracted from input at a given offset
    pub fn with_context(
        kind: ParseErrorKind,
        message: impl Into<String>,
        input: &str,
        error_offset: usize,
    ) -> Self {
        const MAX_CONTEXT: usize = 100;

        let context_start = error_offset.saturating_sub(20);
        let context_str: String = input
            .chars()
            .skip(context_start)
            .take(MAX_CONTEXT)
            .collect();

        let mut display_context = String::new();
        if context_start > 0 {
            display_context.push_str("[...]");
        }
        display_context.push_str(&context_str);
        if context_start + context_str.len() < input.len() {
            display_context.push_str("[...]");
        }
        let display_context = display_context.replace('\n', "\\n").replace('\r', "");

        let found = input
            .get(error_offset..)
            .and_then(|rest| rest.chars().next())
            .map(String::from);

        Self::new(kind, message, Some(display_context), found)
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "ParseError: {}", self.message)?;
        if let Some(found) = &self.found {
            write!(f, "\nFound: {found}")?;
        }
        if let Some(context) = &self.context {
            write!(f, "\nContext: {context}")?;
        }
        Ok(())
    }
}

/// Error types for the interpreter.
///
/// Every failure unwinds the evaluation up to the nearest `recover` call in
/// the program, or out of [`evaluator::eval`] to the embedder.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    ParseError(ParseError),
    #[error("Unbound symbol: {0}")]
    UnboundSymbol(String),
    #[error("Not callable: {0}")]
    NotCallable(String),
    #[error(
        "ArityError: expected {expected} arguments, got {got}{}",
        context_suffix(.context)
    )]
    ArityMismatch {
        expected: Arity,
        got: usize,
        context: Option<String>,
    },
    #[error("Macro {name} expects {expected} arguments, got {got}")]
    MacroArityMismatch {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("Malformed list: {0}")]
    MalformedList(String),
    #[error("Invalid parameter specification: {0}")]
    InvalidParameterSpec(String),
    #[error("Invalid host argument: {0}")]
    InvalidHostArgument(String),
    #[error("Host member not found: {0}")]
    HostMemberNotFound(String),
    #[error("Invalid binding: {0}")]
    InvalidBinding(String),
    #[error("Not a macro: {0}")]
    NotAMacro(String),
    #[error("Type error: {0}")]
    TypeError(String),
    #[error("EvaluationError: {0}")]
    EvalError(String),
    #[error("Raised: {0}")]
    Raised(Expr),
}

fn context_suffix(context: &Option<String>) -> String {
    match context {
        Some(expr) => format!(" in {expr}"),
        None => String::new(),
    }
}

impl Error {
    /// Create an ArityMismatch without expression context
    pub fn arity_error(expected: Arity, got: usize) -> Self {
        Error::ArityMismatch {
            expected,
            got,
            context: None,
        }
    }

    /// Create an ArityMismatch with expression context
    pub fn arity_error_with_expr(expected: Arity, got: usize, expression: String) -> Self {
        Error::ArityMismatch {
            expected,
            got,
            context: Some(expression),
        }
    }

    /// The value handed to a `recover` handler: the payload of `raise`, or
    /// the error message as text for every other failure.
    pub fn to_expr(&self) -> Expr {
        match self {
            Error::Raised(value) => value.clone(),
            other => Expr::Text(other.to_string()),
        }
    }
}

impl From<ParseError> for Error {
    fn from(error: ParseError) -> Self {
        Error::ParseError(error)
    }
}

// Lets host functions fail with plain messages: `Result<T, &str>` and
// `Result<T, String>` are valid builtin return types.
impl From<&str> for Error {
    fn from(message: &str) -> Self {
        Error::EvalError(message.to_owned())
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Error::EvalError(message)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod ast;
pub mod builtinops;
pub mod concurrency;
pub mod environment;
pub mod evaluator;
pub mod interop;
pub mod interpreter;
pub mod macroexpand;
pub mod prelude;

#[cfg(feature = "reader")]
pub mod reader;

pub use crate::ast::NativeHandle;
pub use crate::environment::Env;
pub use crate::interop::{HostPackage, HostType};
pub use crate::interpreter::{Interpreter, InterpreterConfig};
