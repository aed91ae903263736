//! Built-in operations registry.
//!
//! Every special form and builtin function the root environment starts with
//! is listed once in [`BUILTIN_OPS`], together with its arity. Special forms
//! receive their operands unevaluated and are implemented in the evaluator,
//! macro and concurrency modules; functions receive evaluated arguments.
//!
//! ```lisp
//! (if (< 1 2) 'yes 'no)     ; special form
//! (+ 1 2 3)                 ; function
//! (recover (lambda () (raise 'oops))
//!          (lambda (e) e))  ; oops
//! ```
//!
//! ## Conventions
//!
//! - Predicates return `1` for truth and nil otherwise
//! - Arithmetic and ordering accept numbers only; anything else is a `TypeError`
//! - Argument counts are checked against the registered [`Arity`] before the
//!   implementation runs
//!
//! ## Adding New Operations
//!
//! 1. Implement the function with typed parameters (see
//!    [`crate::evaluator::intooperation`]) or, when it needs the caller's
//!    environment, against [`CallContext`] directly
//! 2. Add it to `BUILTIN_OPS` with its identifier and arity
//! 3. Add tests covering edge cases and error conditions

use crate::Error;
use crate::ast::{Expr, NumberType, flatten, is_list, unflatten};
use crate::concurrency::{arrow, eval_spawn, make_chan, recv, send};
use crate::evaluator::intooperation::{IntoOperation, IntoVariadicOperation, OperationFn, operation};
use crate::evaluator::{
    Arity, CallContext, Native, NumIter, SpecialFormFn, ValueIter, apply_with_depth, eval_begin,
    eval_define, eval_for, eval_if, eval_lambda, eval_let, eval_quote, eval_with_depth_tracking,
};
use crate::macroexpand::{eval_defmacro, eval_macroexpand_1};
use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, LazyLock};

/// Represents the implementation of a built-in expression (function or special form)
#[derive(Clone)]
pub enum OpKind {
    /// Regular function that takes evaluated arguments and returns a value
    /// via the canonical erased builtin signature used by the evaluator.
    Function(Arc<OperationFn>),
    /// Special form that receives unevaluated operands, the environment and
    /// the current evaluation depth
    SpecialForm(SpecialFormFn),
}

impl std::fmt::Debug for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpKind::Function(_) => write!(f, "Function(<fn>)"),
            OpKind::SpecialForm(_) => write!(f, "SpecialForm(<fn>)"),
        }
    }
}

/// Definition of a built-in operation
#[derive(Debug, Clone)]
pub struct BuiltinOp {
    /// The identifier this operation is bound to in the root environment
    pub id: &'static str,
    /// The implementation of this operation (function or special form)
    pub op_kind: OpKind,
    /// Expected number of arguments
    pub arity: Arity,
}

impl PartialEq for BuiltinOp {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl BuiltinOp {
    /// Check if this operation is a special form
    pub fn is_special_form(&self) -> bool {
        matches!(self.op_kind, OpKind::SpecialForm(_))
    }

    /// Check if the given number of arguments is valid for this operation
    pub(crate) fn validate_arity(&self, arg_count: usize) -> Result<(), Error> {
        self.arity.validate(arg_count)
    }
}

//
// Builtin Function Implementations
//

// Macro to generate chained numeric comparisons; fewer than two operands
// compare as true.
macro_rules! numeric_comparison {
    ($name:ident, $op:tt) => {
        fn $name(nums: NumIter<'_>) -> bool {
            let mut prev: Option<NumberType> = None;
            for current in nums {
                if let Some(prev) = prev
                    && !(prev $op current)
                {
                    return false;
                }
                prev = Some(current);
            }
            true
        }
    };
}

numeric_comparison!(builtin_lt, <);
numeric_comparison!(builtin_gt, >);
numeric_comparison!(builtin_le, <=);
numeric_comparison!(builtin_ge, >=);

fn builtin_add(nums: NumIter<'_>) -> NumberType {
    nums.fold(0.0, |sum, n| sum + n)
}

fn builtin_sub(mut nums: NumIter<'_>) -> NumberType {
    match nums.next() {
        None => 0.0,
        Some(first) if nums.len() == 0 => -first,
        Some(first) => nums.fold(first, |acc, n| acc - n),
    }
}

fn builtin_mul(nums: NumIter<'_>) -> NumberType {
    nums.fold(1.0, |product, n| product * n)
}

fn builtin_div(mut nums: NumIter<'_>) -> NumberType {
    match nums.next() {
        None => 0.0,
        Some(first) if nums.len() == 0 => 1.0 / first,
        Some(first) => nums.fold(first, |acc, n| acc / n),
    }
}

/// Remainder of the truncated operands, with the sign of the dividend
fn builtin_mod(a: NumberType, b: NumberType) -> Result<NumberType, Error> {
    let (a, b) = (a.trunc(), b.trunc());
    if b == 0.0 {
        return Err(Error::EvalError("division by zero in %".to_owned()));
    }
    Ok(a % b)
}

/// Structural equality of all arguments with the first
fn builtin_equal(mut values: ValueIter<'_>) -> bool {
    match values.next() {
        None => true,
        Some(first) => values.all(|v| v == first),
    }
}

fn builtin_not_equal(values: ValueIter<'_>) -> bool {
    !builtin_equal(values)
}

fn builtin_not(value: Expr) -> bool {
    value.is_nil()
}

fn builtin_cons(first: Expr, rest: Expr) -> Expr {
    Expr::cons(first, rest)
}

fn builtin_car(value: Expr) -> Result<Expr, Error> {
    match value {
        Expr::Pair(cell) => Ok(cell.first.clone()),
        other => Err(Error::TypeError(format!("car requires a pair, got {other}"))),
    }
}

fn builtin_cdr(value: Expr) -> Result<Expr, Error> {
    match value {
        Expr::Pair(cell) => Ok(cell.rest.clone()),
        other => Err(Error::TypeError(format!("cdr requires a pair, got {other}"))),
    }
}

fn builtin_list(values: ValueIter<'_>) -> Expr {
    unflatten(values.cloned().collect())
}

fn builtin_is_list(value: Expr) -> bool {
    is_list(&value)
}

fn builtin_print(value: Expr) -> Result<(), Error> {
    let mut out = std::io::stdout().lock();
    writeln!(out, "{value}").map_err(|e| Error::EvalError(format!("print failed: {e}")))
}

fn builtin_raise(value: Expr) -> Result<Expr, Error> {
    Err(Error::Raised(value))
}

/// `(eval expr)`: evaluate a value in the caller's environment
fn builtin_eval(ctx: &CallContext<'_>, args: Vec<Expr>) -> Result<Expr, Error> {
    match args.as_slice() {
        [expr] => eval_with_depth_tracking(expr, ctx.env, ctx.depth + 1),
        _ => Err(Error::arity_error(Arity::Exact(1), args.len())),
    }
}

/// `(apply f '(arg ...))`
fn builtin_apply(ctx: &CallContext<'_>, args: Vec<Expr>) -> Result<Expr, Error> {
    match args.as_slice() {
        [func, arg_list] => {
            let call_args = flatten(arg_list)?;
            apply_with_depth(func, call_args, ctx.env, ctx.depth + 1)
        }
        _ => Err(Error::arity_error(Arity::Exact(2), args.len())),
    }
}

/// `(recover thunk handler)`: call `thunk`; if it fails, call `handler`
/// with the raised value or the error message.
fn builtin_recover(ctx: &CallContext<'_>, args: Vec<Expr>) -> Result<Expr, Error> {
    let [thunk, handler] = args.as_slice() else {
        return Err(Error::arity_error(Arity::Exact(2), args.len()));
    };
    match apply_with_depth(thunk, Vec::new(), ctx.env, ctx.depth + 1) {
        Ok(value) => Ok(value),
        Err(error) => {
            tracing::debug!(%error, "recovered from error");
            apply_with_depth(handler, vec![error.to_expr()], ctx.env, ctx.depth + 1)
        }
    }
}

/// Conversion failures of core builtins are operand type errors, not host
/// boundary errors.
fn narrow_conversion_errors(op: Arc<OperationFn>) -> Arc<OperationFn> {
    operation(move |ctx, args| {
        op(ctx, args).map_err(|err| match err {
            Error::InvalidHostArgument(msg) => Error::TypeError(msg),
            other => other,
        })
    })
}

fn function(id: &'static str, arity: Arity, func: Arc<OperationFn>) -> BuiltinOp {
    let checked = operation(move |ctx, args| {
        arity.validate(args.len())?;
        func(ctx, args)
    });
    BuiltinOp {
        id,
        op_kind: OpKind::Function(checked),
        arity,
    }
}

fn special_form(id: &'static str, arity: Arity, form: SpecialFormFn) -> BuiltinOp {
    BuiltinOp {
        id,
        op_kind: OpKind::SpecialForm(form),
        arity,
    }
}

/// Global registry of all built-in operations.
///
/// Typed implementations are wired through the same adapter layer used for
/// custom builtin registration. This is done once at initialization time
/// via a `LazyLock`.
static BUILTIN_OPS: LazyLock<Vec<BuiltinOp>> = LazyLock::new(|| {
    fn typed<Args, F>(f: F) -> Arc<OperationFn>
    where
        F: IntoOperation<Args>,
    {
        narrow_conversion_errors(<F as IntoOperation<Args>>::into_operation(f))
    }

    fn typed_variadic<Args, F>(f: F) -> Arc<OperationFn>
    where
        F: IntoVariadicOperation<Args>,
    {
        narrow_conversion_errors(<F as IntoVariadicOperation<Args>>::into_variadic_operation(f))
    }

    vec![
        // Special forms
        special_form("quote", Arity::Exact(1), eval_quote),
        special_form("if", Arity::Range(2, 3), eval_if),
        special_form("for", Arity::Exact(2), eval_for),
        special_form("lambda", Arity::Exact(2), eval_lambda),
        special_form("let", Arity::AtLeast(1), eval_let),
        special_form("define", Arity::Exact(2), eval_define),
        special_form("begin", Arity::Any, eval_begin),
        special_form("defmacro", Arity::Exact(3), eval_defmacro),
        special_form("macroexpand-1", Arity::Exact(1), eval_macroexpand_1),
        special_form("spawn", Arity::Exact(1), eval_spawn),
        special_form("go", Arity::Exact(1), eval_spawn),
        // Arithmetic
        function("+", Arity::Any, typed_variadic::<(NumIter<'static>,), _>(builtin_add)),
        function("-", Arity::Any, typed_variadic::<(NumIter<'static>,), _>(builtin_sub)),
        function("*", Arity::Any, typed_variadic::<(NumIter<'static>,), _>(builtin_mul)),
        function("/", Arity::Any, typed_variadic::<(NumIter<'static>,), _>(builtin_div)),
        function("%", Arity::Exact(2), typed::<(NumberType, NumberType), _>(builtin_mod)),
        // Ordering and equality
        function("<", Arity::Any, typed_variadic::<(NumIter<'static>,), _>(builtin_lt)),
        function(">", Arity::Any, typed_variadic::<(NumIter<'static>,), _>(builtin_gt)),
        function("<=", Arity::Any, typed_variadic::<(NumIter<'static>,), _>(builtin_le)),
        function(">=", Arity::Any, typed_variadic::<(NumIter<'static>,), _>(builtin_ge)),
        function("=", Arity::Any, typed_variadic::<(ValueIter<'static>,), _>(builtin_equal)),
        function("equal?", Arity::Any, typed_variadic::<(ValueIter<'static>,), _>(builtin_equal)),
        function("/=", Arity::Any, typed_variadic::<(ValueIter<'static>,), _>(builtin_not_equal)),
        function("not", Arity::Exact(1), typed::<(Expr,), _>(builtin_not)),
        // Lists
        function("cons", Arity::Exact(2), typed::<(Expr, Expr), _>(builtin_cons)),
        function("car", Arity::Exact(1), typed::<(Expr,), _>(builtin_car)),
        function("cdr", Arity::Exact(1), typed::<(Expr,), _>(builtin_cdr)),
        function("list", Arity::Any, typed_variadic::<(ValueIter<'static>,), _>(builtin_list)),
        function("list?", Arity::Exact(1), typed::<(Expr,), _>(builtin_is_list)),
        // Meta
        function("eval", Arity::Exact(1), operation(builtin_eval)),
        function("apply", Arity::Exact(2), operation(builtin_apply)),
        function("print", Arity::Exact(1), typed::<(Expr,), _>(builtin_print)),
        // Errors
        function("raise", Arity::Exact(1), typed::<(Expr,), _>(builtin_raise)),
        function("panic", Arity::Exact(1), typed::<(Expr,), _>(builtin_raise)),
        function("recover", Arity::Exact(2), operation(builtin_recover)),
        // Channels
        function("make-chan", Arity::Exact(0), typed::<(), _>(make_chan)),
        function("send", Arity::Exact(2), typed::<(Native<crate::concurrency::Channel>, Expr), _>(send)),
        function("recv", Arity::Exact(1), typed::<(Native<crate::concurrency::Channel>,), _>(recv)),
        function(
            "<-",
            Arity::Range(1, 2),
            typed_variadic::<(Native<crate::concurrency::Channel>, ValueIter<'static>), _>(arrow),
        ),
    ]
});

/// Lazy static map from id to BuiltinOp (private - use find_op)
static BUILTIN_BY_ID: LazyLock<HashMap<&'static str, &'static BuiltinOp>> = LazyLock::new(|| {
    let ops: &'static [BuiltinOp] = BUILTIN_OPS.as_slice();
    ops.iter().map(|op| (op.id, op)).collect()
});

/// Get all builtin operations
pub fn get_builtin_ops() -> &'static [BuiltinOp] {
    BUILTIN_OPS.as_slice()
}

/// Find a builtin operation by its identifier
pub fn find_op(id: &str) -> Option<&'static BuiltinOp> {
    BUILTIN_BY_ID.get(id).copied()
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::Env;
    use crate::ast::{list, nil, sym, val};

    /// Invoke a builtin through the registry with a throwaway caller
    /// environment, exercising arity checks and the adapter layer.
    fn call_builtin(name: &str, args: &[Expr]) -> Result<Expr, Error> {
        let op = find_op(name).unwrap();
        let env = Env::new();
        match &op.op_kind {
            OpKind::Function(func) => func(&CallContext { env: &env, depth: 0 }, args.to_vec()),
            OpKind::SpecialForm(_) => {
                panic!("expected function builtin in tests, got special form: {name}")
            }
        }
    }

    #[test]
    fn test_builtin_ops_registry() {
        let not_op = find_op("not").unwrap();
        assert_eq!(not_op.arity, Arity::Exact(1));
        assert!(!not_op.is_special_form());

        let if_op = find_op("if").unwrap();
        assert!(if_op.is_special_form());
        assert_eq!(if_op.arity, Arity::Range(2, 3));

        // Aliases share their implementation but not their identity
        assert!(find_op("go").unwrap().is_special_form());
        assert_ne!(find_op("go").unwrap(), find_op("spawn").unwrap());

        assert!(find_op("unknown").is_none());

        let mut ids: Vec<_> = get_builtin_ops().iter().map(|op| op.id).collect();
        let count = ids.len();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), count, "duplicate builtin ids");
    }

    #[test]
    fn test_builtin_function_implementations() {
        type TestCase = (&'static str, Vec<Expr>, Result<Expr, &'static str>);
        let test_cases: Vec<TestCase> = vec![
            // Arithmetic
            ("+", vec![], Ok(val(0))),
            ("+", vec![val(1), val(2), val(3)], Ok(val(6))),
            ("+", vec![val(0.5), val(0.25)], Ok(val(0.75))),
            ("-", vec![], Ok(val(0))),
            ("-", vec![val(5)], Ok(val(-5))),
            ("-", vec![val(10), val(3), val(2)], Ok(val(5))),
            ("*", vec![], Ok(val(1))),
            ("*", vec![val(2), val(3), val(4)], Ok(val(24))),
            ("/", vec![], Ok(val(0))),
            ("/", vec![val(4)], Ok(val(0.25))),
            ("/", vec![val(12), val(2), val(3)], Ok(val(2))),
            ("/", vec![val(1), val(0)], Ok(val(f64::INFINITY))),
            ("%", vec![val(7), val(3)], Ok(val(1))),
            ("%", vec![val(-7), val(3)], Ok(val(-1))),
            ("%", vec![val(7.9), val(2)], Ok(val(1))),
            ("%", vec![val(1), val(0)], Err("division by zero")),
            ("%", vec![val(1)], Err("expected 2 arguments, got 1")),
            ("+", vec![val(1), val("a")], Err("Type error: expected number")),
            ("-", vec![nil()], Err("Type error")),
            // Ordering
            ("<", vec![], Ok(val(true))),
            ("<", vec![val(1), val(2), val(3)], Ok(val(true))),
            ("<", vec![val(1), val(3), val(2)], Ok(val(false))),
            (">", vec![val(3), val(2), val(1)], Ok(val(true))),
            ("<=", vec![val(1), val(1), val(2)], Ok(val(true))),
            (">=", vec![val(2), val(2), val(3)], Ok(val(false))),
            (">", vec![val("b"), val("a")], Err("Type error")),
            // Equality
            ("=", vec![], Ok(val(true))),
            ("=", vec![val(1), val(1), val(1)], Ok(val(true))),
            ("=", vec![val(1), val(2)], Ok(val(false))),
            ("=", vec![val("a"), val("a")], Ok(val(true))),
            (
                "equal?",
                vec![list(vec![val(1), list(vec![sym("x")])]), list(vec![val(1), list(vec![sym("x")])])],
                Ok(val(true)),
            ),
            ("equal?", vec![val(1), val("1")], Ok(val(false))),
            ("/=", vec![val(1), val(2)], Ok(val(true))),
            ("/=", vec![val(1), val(1)], Ok(val(false))),
            ("not", vec![nil()], Ok(val(true))),
            ("not", vec![val(0)], Ok(val(false))),
            ("not", vec![], Err("ArityError")),
            // Lists
            ("cons", vec![val(1), val(2)], Ok(Expr::cons(val(1), val(2)))),
            ("cons", vec![val(1), list(vec![val(2)])], Ok(list(vec![val(1), val(2)]))),
            ("car", vec![list(vec![val(1), val(2)])], Ok(val(1))),
            ("cdr", vec![list(vec![val(1), val(2)])], Ok(list(vec![val(2)]))),
            ("cdr", vec![list(vec![val(1)])], Ok(nil())),
            ("car", vec![nil()], Err("car requires a pair, got nil")),
            ("cdr", vec![val(5)], Err("cdr requires a pair")),
            ("list", vec![], Ok(nil())),
            ("list", vec![val(1), val("b")], Ok(list(vec![val(1), val("b")]))),
            ("list?", vec![list(vec![val(1)])], Ok(val(true))),
            ("list?", vec![nil()], Ok(val(true))),
            ("list?", vec![Expr::cons(val(1), val(2))], Ok(val(false))),
            ("list?", vec![val(5)], Ok(val(false))),
            // Errors
            ("raise", vec![sym("oops")], Err("Raised: oops")),
            ("panic", vec![val("bad")], Err("Raised: \"bad\"")),
            // Channels
            ("recv", vec![val(1)], Err("Type error")),
            ("make-chan", vec![val(1)], Err("ArityError")),
        ];

        for (i, (name, args, expected)) in test_cases.into_iter().enumerate() {
            let result = call_builtin(name, &args);
            match (result, expected) {
                (Ok(actual), Ok(expected)) => {
                    assert_eq!(actual, expected, "#{} ({name} {args:?})", i + 1);
                }
                (Err(err), Err(fragment)) => {
                    let msg = err.to_string();
                    assert!(
                        msg.contains(fragment),
                        "#{} ({name}): error should contain '{fragment}', got '{msg}'",
                        i + 1
                    );
                }
                (actual, expected) => {
                    panic!("#{} ({name} {args:?}): expected {expected:?}, got {actual:?}", i + 1)
                }
            }
        }
    }

    #[test]
    fn test_raise_keeps_payload() {
        let err = call_builtin("raise", &[list(vec![val(1), val(2)])]).unwrap_err();
        assert_eq!(err.to_expr(), list(vec![val(1), val(2)]));
        assert_eq!(
            Error::UnboundSymbol("x".to_owned()).to_expr(),
            val("Unbound symbol: x")
        );
    }

    #[test]
    fn test_arity_validation() {
        use Arity::*;

        let cases = vec![
            (Exact(2), 2, true),
            (Exact(2), 1, false),
            (AtLeast(1), 0, false),
            (AtLeast(1), 5, true),
            (Range(1, 2), 0, false),
            (Range(1, 2), 2, true),
            (Range(1, 2), 3, false),
            (Any, 0, true),
        ];
        for (arity, got, ok) in cases {
            assert_eq!(arity.validate(got).is_ok(), ok, "{arity:?} with {got}");
        }

        match Range(1, 2).validate(3) {
            Err(Error::ArityMismatch { expected, got, .. }) => {
                assert_eq!(expected, Range(1, 2));
                assert_eq!(got, 3);
            }
            other => panic!("Expected ArityMismatch, got {other:?}"),
        }
    }
}
