//! Evaluation and application.
//!
//! [`eval`] walks an expression tree against an [`Env`]. Pairs are
//! applications: the head is evaluated first and decides how the operands
//! are treated. Special forms see them unevaluated, macros expand them and
//! the expansion is evaluated in turn, and closures and builtins receive them
//! evaluated left to right.
//!
//! Every nested evaluation counts one level against [`MAX_EVAL_DEPTH`].
//! Evaluation always runs on a thread with an [`EVAL_STACK_SIZE`] stack, and
//! stops with an `EvalError` once it comes within [`EVAL_STACK_RESERVE`] of
//! the end of that stack, so runaway recursion in a program cannot overflow
//! the Rust stack whichever limit it reaches first.

use crate::ast::{Builtin, Closure, Expr, flatten, unflatten};
use crate::builtinops::{OpKind, get_builtin_ops};
use crate::environment::Env;
use crate::macroexpand::expand;
use crate::{EVAL_STACK_RESERVE, EVAL_STACK_SIZE, Error, MAX_EVAL_DEPTH};
use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

pub mod intooperation;

pub use intooperation::{IntIter, Native, NumIter, TextIter, ValueIter};

/// Signature shared by all special forms: unevaluated operands, the
/// environment of the form and the current evaluation depth.
pub type SpecialFormFn = fn(&[Expr], &Env, usize) -> Result<Expr, Error>;

/// What a builtin sees of its caller.
pub struct CallContext<'a> {
    /// Environment the call expression was evaluated in
    pub env: &'a Env,
    /// Evaluation depth of the call expression
    pub depth: usize,
}

/// Number of arguments accepted by a callable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    /// Exactly n arguments
    Exact(usize),
    /// At least n arguments
    AtLeast(usize),
    /// Between min and max arguments (inclusive)
    Range(usize, usize),
    /// Any number of arguments
    Any,
}

impl Arity {
    pub fn validate(&self, got: usize) -> Result<(), Error> {
        let ok = match *self {
            Arity::Exact(n) => got == n,
            Arity::AtLeast(n) => got >= n,
            Arity::Range(min, max) => (min..=max).contains(&got),
            Arity::Any => true,
        };
        if ok {
            Ok(())
        } else {
            Err(Error::arity_error(*self, got))
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Exact(n) => write!(f, "{n}"),
            Arity::AtLeast(n) => write!(f, "at least {n}"),
            Arity::Range(min, max) => write!(f, "{min} to {max}"),
            Arity::Any => write!(f, "any number of"),
        }
    }
}

thread_local! {
    /// Lowest stack address evaluation may use on this thread; unset on
    /// threads that were not started for evaluation.
    static STACK_FLOOR: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Address of a local in the caller's frame. Stacks grow downwards on every
/// supported target.
#[inline(never)]
fn stack_position() -> usize {
    let marker = 0u8;
    std::hint::black_box(&marker) as *const u8 as usize
}

/// Mark the current thread as an evaluation thread with a stack of
/// `stack_size` bytes, most of which is still unused.
pub(crate) fn enter_eval_stack(stack_size: usize) {
    let usable = stack_size.saturating_sub(EVAL_STACK_RESERVE);
    let floor = stack_position().saturating_sub(usable);
    STACK_FLOOR.with(|cell| cell.set(Some(floor)));
}

fn stack_exhausted() -> bool {
    STACK_FLOOR.with(|cell| cell.get().is_some_and(|floor| stack_position() < floor))
}

/// Run `work` on an evaluation stack.
///
/// On an evaluation thread this calls `work` directly; anywhere else it
/// starts a scoped thread with an [`EVAL_STACK_SIZE`] stack and waits for it.
pub(crate) fn on_eval_stack<T, F>(work: F) -> Result<T, Error>
where
    T: Send,
    F: FnOnce() -> Result<T, Error> + Send,
{
    if STACK_FLOOR.with(Cell::get).is_some() {
        return work();
    }
    std::thread::scope(|scope| {
        let handle = std::thread::Builder::new()
            .name("kakapo-eval".to_owned())
            .stack_size(EVAL_STACK_SIZE)
            .spawn_scoped(scope, || {
                enter_eval_stack(EVAL_STACK_SIZE);
                work()
            })
            .map_err(|e| Error::EvalError(format!("failed to start evaluation thread: {e}")))?;
        handle
            .join()
            .map_err(|_| Error::EvalError("evaluation thread panicked".to_owned()))?
    })
}

/// Evaluate an expression (public API)
pub fn eval(expr: &Expr, env: &Env) -> Result<Expr, Error> {
    on_eval_stack(|| eval_with_depth_tracking(expr, env, 0))
}

/// Evaluate an expression with depth tracking to prevent stack overflow
pub(crate) fn eval_with_depth_tracking(expr: &Expr, env: &Env, depth: usize) -> Result<Expr, Error> {
    if depth >= MAX_EVAL_DEPTH {
        return Err(Error::EvalError(format!(
            "Evaluation depth limit exceeded (max: {MAX_EVAL_DEPTH})"
        )));
    }
    if stack_exhausted() {
        return Err(Error::EvalError(
            "Evaluation depth limit exceeded (evaluation stack exhausted)".to_owned(),
        ));
    }
    match expr {
        Expr::Nil
        | Expr::Number(_)
        | Expr::Text(_)
        | Expr::Closure(_)
        | Expr::Builtin(_)
        | Expr::SpecialForm(_)
        | Expr::Macro(_)
        | Expr::Native(_) => Ok(expr.clone()),

        Expr::Symbol(name) => env.lookup(name),

        Expr::Pair(cell) => eval_application(expr, &cell.first, &cell.rest, env, depth)
            .map_err(|err| add_context(err, expr)),
    }
}

const CONTEXT_MARKER: &str = "\n  Context: ";

/// Attach the innermost failing expression to generic errors
fn add_context(error: Error, expr: &Expr) -> Error {
    match error {
        Error::EvalError(msg) if !msg.contains(CONTEXT_MARKER) => {
            Error::EvalError(format!("{msg}{CONTEXT_MARKER}while evaluating: {expr}"))
        }
        Error::TypeError(msg) if !msg.contains(CONTEXT_MARKER) => {
            Error::TypeError(format!("{msg}{CONTEXT_MARKER}while evaluating: {expr}"))
        }
        other => other,
    }
}

/// Evaluate operands left to right
fn eval_args(operands: &[Expr], env: &Env, depth: usize) -> Result<Vec<Expr>, Error> {
    operands
        .iter()
        .map(|arg| eval_with_depth_tracking(arg, env, depth + 1))
        .collect()
}

fn eval_application(
    form: &Expr,
    head: &Expr,
    tail: &Expr,
    env: &Env,
    depth: usize,
) -> Result<Expr, Error> {
    let func = eval_with_depth_tracking(head, env, depth + 1)?;
    let operands = flatten(tail)?;

    match &func {
        Expr::SpecialForm(op) => match &op.op_kind {
            OpKind::SpecialForm(special_form) => {
                op.validate_arity(operands.len()).map_err(|err| match err {
                    Error::ArityMismatch {
                        expected,
                        got,
                        context: None,
                    } => Error::arity_error_with_expr(expected, got, form.to_string()),
                    other => other,
                })?;
                special_form(&operands, env, depth)
            }
            // The root environment binds function ops as builtins; one
            // wrapped as a special form by hand is applied the same way
            OpKind::Function(f) => {
                let builtin = Expr::Builtin(Builtin::new(op.id, Arc::clone(f)));
                let args = eval_args(&operands, env, depth)?;
                apply_with_depth(&builtin, args, env, depth)
            }
        },
        Expr::Macro(mac) => {
            let expansion = expand(mac, &operands)?;
            tracing::trace!(macro_name = %mac.name, %expansion, "expanded macro");
            eval_with_depth_tracking(&expansion, env, depth + 1)
        }
        Expr::Closure(_) | Expr::Builtin(_) => {
            let args = eval_args(&operands, env, depth)?;
            apply_with_depth(&func, args, env, depth)
        }
        other => Err(Error::NotCallable(format!("{other} in {form}"))),
    }
}

/// Apply a closure or builtin to already evaluated arguments.
///
/// `env` is the caller's environment; only builtins observe it.
pub fn apply(func: &Expr, args: Vec<Expr>, env: &Env) -> Result<Expr, Error> {
    on_eval_stack(|| apply_with_depth(func, args, env, 0))
}

pub(crate) fn apply_with_depth(
    func: &Expr,
    args: Vec<Expr>,
    env: &Env,
    depth: usize,
) -> Result<Expr, Error> {
    match func {
        Expr::Closure(closure) => {
            let frame = closure.env.child();
            bind_params(&closure.params, args, &frame)?;
            eval_with_depth_tracking(&closure.body, &frame, depth + 1)
        }
        Expr::Builtin(builtin) => (builtin.func)(&CallContext { env, depth }, args),
        other => Err(Error::NotCallable(other.to_string())),
    }
}

/// Validate a parameter specification and compute its arity.
///
/// Accepted shapes are a proper list of distinct symbols, such a list with a
/// dotted symbol tail, or a single symbol. The two latter shapes are
/// variadic.
pub(crate) fn param_arity(params: &Expr) -> Result<Arity, Error> {
    fn check<'a>(param: &'a Expr, seen: &[&str]) -> Result<&'a str, Error> {
        match param {
            Expr::Symbol(s) if seen.contains(&s.as_str()) => Err(Error::InvalidParameterSpec(
                format!("duplicate parameter name: {s}"),
            )),
            Expr::Symbol(s) => Ok(s.as_str()),
            other => Err(Error::InvalidParameterSpec(format!(
                "parameters must be symbols, got {other}"
            ))),
        }
    }

    let mut seen: Vec<&str> = Vec::new();
    let mut spec = params;
    loop {
        match spec {
            Expr::Nil => return Ok(Arity::Exact(seen.len())),
            Expr::Symbol(_) => {
                check(spec, &seen)?;
                return Ok(Arity::AtLeast(seen.len()));
            }
            Expr::Pair(cell) => {
                let name = check(&cell.first, &seen)?;
                seen.push(name);
                spec = &cell.rest;
            }
            other => {
                return Err(Error::InvalidParameterSpec(format!(
                    "parameter list cannot end in {other}"
                )));
            }
        }
    }
}

/// Bind arguments positionally into `frame`, collecting any variadic tail
/// into a list.
fn bind_params(params: &Expr, args: Vec<Expr>, frame: &Env) -> Result<(), Error> {
    param_arity(params)?.validate(args.len())?;

    let mut args = args.into_iter();
    let mut spec = params;
    while let Expr::Pair(cell) = spec {
        if let (Some(name), Some(value)) = (cell.first.as_symbol(), args.next()) {
            frame.define_local(name, value);
        }
        spec = &cell.rest;
    }
    if let Expr::Symbol(rest) = spec {
        frame.define_local(rest.as_str(), unflatten(args.collect()));
    }
    Ok(())
}

/// Evaluate quote special form
pub(crate) fn eval_quote(args: &[Expr], _env: &Env, _depth: usize) -> Result<Expr, Error> {
    match args {
        [expr] => Ok(expr.clone()),
        _ => Err(Error::arity_error(Arity::Exact(1), args.len())),
    }
}

/// Evaluate define special form
pub(crate) fn eval_define(args: &[Expr], env: &Env, depth: usize) -> Result<Expr, Error> {
    match args {
        [Expr::Symbol(name), expr] => {
            let value = eval_with_depth_tracking(expr, env, depth + 1)?;
            env.define_hoisted(name.as_str(), value);
            Ok(Expr::Nil)
        }
        [other, _] => Err(Error::TypeError(format!(
            "define requires a symbol, got {other}"
        ))),
        _ => Err(Error::arity_error(Arity::Exact(2), args.len())),
    }
}

/// Evaluate if special form
pub(crate) fn eval_if(args: &[Expr], env: &Env, depth: usize) -> Result<Expr, Error> {
    let (condition_expr, then_expr, else_expr) = match args {
        [c, t] => (c, t, None),
        [c, t, e] => (c, t, Some(e)),
        _ => return Err(Error::arity_error(Arity::Range(2, 3), args.len())),
    };

    if eval_with_depth_tracking(condition_expr, env, depth + 1)?.is_truthy() {
        eval_with_depth_tracking(then_expr, env, depth + 1)
    } else if let Some(else_expr) = else_expr {
        eval_with_depth_tracking(else_expr, env, depth + 1)
    } else {
        Ok(Expr::Nil)
    }
}

/// Evaluate for special form: a while loop returning the last body value
pub(crate) fn eval_for(args: &[Expr], env: &Env, depth: usize) -> Result<Expr, Error> {
    let [condition, body] = args else {
        return Err(Error::arity_error(Arity::Exact(2), args.len()));
    };

    let mut last = Expr::Nil;
    while eval_with_depth_tracking(condition, env, depth + 1)?.is_truthy() {
        last = eval_with_depth_tracking(body, env, depth + 1)?;
    }
    Ok(last)
}

/// Evaluate lambda special form
pub(crate) fn eval_lambda(args: &[Expr], env: &Env, _depth: usize) -> Result<Expr, Error> {
    match args {
        [params, body] => {
            param_arity(params)?;

            // Each closure gets its own definition scope between the
            // captured environment and its call frames; `define` inside the
            // body hoists into it.
            Ok(Expr::Closure(Arc::new(Closure {
                params: params.clone(),
                body: body.clone(),
                env: env.child(),
            })))
        }
        _ => Err(Error::arity_error(Arity::Exact(2), args.len())),
    }
}

/// Evaluate let special form
pub(crate) fn eval_let(args: &[Expr], env: &Env, depth: usize) -> Result<Expr, Error> {
    let [bindings, body @ ..] = args else {
        return Err(Error::arity_error(Arity::AtLeast(1), 0));
    };

    let clauses = flatten(bindings)
        .map_err(|_| Error::InvalidBinding(format!("binding list must be a list, got {bindings}")))?;

    let scope = env.child();
    for clause in &clauses {
        let parts = flatten(clause).unwrap_or_default();
        match parts.as_slice() {
            [Expr::Symbol(name), value_expr] => {
                // Values see the outer environment, never their siblings
                let value = eval_with_depth_tracking(value_expr, env, depth + 1)?;
                scope.define_local(name.as_str(), value);
            }
            _ => {
                return Err(Error::InvalidBinding(format!(
                    "expected (symbol expression), got {clause}"
                )));
            }
        }
    }

    eval_sequence(body, &scope, depth)
}

/// Evaluate begin special form
pub(crate) fn eval_begin(args: &[Expr], env: &Env, depth: usize) -> Result<Expr, Error> {
    eval_sequence(args, env, depth)
}

fn eval_sequence(exprs: &[Expr], env: &Env, depth: usize) -> Result<Expr, Error> {
    let mut last = Expr::Nil;
    for expr in exprs {
        last = eval_with_depth_tracking(expr, env, depth + 1)?;
    }
    Ok(last)
}

/// Create a global environment with the special forms and builtin functions
pub fn create_global_env() -> Env {
    let env = Env::new();

    for builtin_op in get_builtin_ops() {
        let value = match &builtin_op.op_kind {
            OpKind::SpecialForm(_) => Expr::SpecialForm(builtin_op),
            OpKind::Function(func) => Expr::Builtin(Builtin::new(builtin_op.id, func.clone())),
        };
        env.define_local(builtin_op.id, value);
    }
    env.define_local("nil", Expr::Nil);

    env
}
