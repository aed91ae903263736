//! This module defines the value model of the interpreter. The main enum,
//! [`Expr`], covers every runtime value: pairs, symbols, numbers, text, the
//! nil marker, closures, special forms, macros, builtin functions and opaque
//! host handles. Lists are chains of [`Cons`] cells terminated by
//! [`Expr::Nil`]; [`flatten`] and [`unflatten`] move between that
//! representation and a `Vec`. Ergonomic helpers such as [`val`], [`sym`],
//! [`list`] and [`nil`] build trees in code and tests, and the `From` /
//! `TryInto` implementations form the scalar half of the host conversion
//! table used by `interop`.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::Error;
use crate::builtinops::BuiltinOp;
use crate::environment::Env;
use crate::evaluator::intooperation::OperationFn;

/// Type alias for number values in the interpreter
pub type NumberType = f64;

/// Allowed non-alphanumeric characters in symbol names
#[cfg_attr(not(feature = "reader"), allow(dead_code))]
pub(crate) const SYMBOL_SPECIAL_CHARS: &str = "+-*/<>=!?_$%&.:^~@";

/// Check if a string is a valid symbol name
/// Valid: non-empty, no leading digit, no sign-digit prefix, alphanumeric + SYMBOL_SPECIAL_CHARS
#[cfg_attr(not(feature = "reader"), allow(dead_code))]
pub(crate) fn is_valid_symbol(name: &str) -> bool {
    let mut chars = name.chars();

    match chars.next() {
        None => false,
        Some(first_char) => {
            if first_char.is_ascii_digit() {
                return false;
            }

            if (first_char == '-' || first_char == '+')
                && let Some(second_char) = chars.next()
                && second_char.is_ascii_digit()
            {
                return false;
            }

            name.chars()
                .all(|c| c.is_alphanumeric() || SYMBOL_SPECIAL_CHARS.contains(c))
        }
    }
}

/// Core value type of the interpreter
///
/// To build trees in code, use the helper functions:
/// - `val(42)` for values, `sym("name")` for symbols, `nil()` for the empty list
/// - `list(vec![sym("+"), val(1), val(2)])` for proper lists
#[derive(Clone)]
pub enum Expr {
    /// The empty list, which is also the only false value
    Nil,
    /// A cons cell
    Pair(Arc<Cons>),
    /// Identifier, compared by name
    Symbol(String),
    /// The single numeric representation
    Number(NumberType),
    /// String literal
    Text(String),
    /// Function produced by `lambda`
    Closure(Arc<Closure>),
    /// Function implemented in Rust, builtin or imported from a host package
    Builtin(Builtin),
    /// Form receiving its operands unevaluated
    SpecialForm(&'static BuiltinOp),
    /// Substitution macro produced by `defmacro`
    Macro(Arc<Macro>),
    /// Opaque host value
    Native(NativeHandle),
}

/// A cons cell: `first` is the element, `rest` the remainder of the chain.
#[derive(Debug, Clone, PartialEq)]
pub struct Cons {
    pub first: Expr,
    pub rest: Expr,
}

/// A `lambda` closure.
///
/// `params` is the raw parameter specification: a proper list of symbols,
/// a list ending in a bare symbol (dotted tail) or a single symbol, the last
/// two collecting extra arguments into a list.
pub struct Closure {
    pub params: Expr,
    pub body: Expr,
    pub env: Env,
}

/// A macro: formal parameter names and a body already pre-expanded at
/// definition time.
#[derive(Debug)]
pub struct Macro {
    pub name: String,
    pub formals: Vec<String>,
    pub body: Expr,
}

/// A function implemented in Rust.
///
/// Compared by id rather than by function pointer.
#[derive(Clone)]
pub struct Builtin {
    pub id: String,
    // Trait object so typed Rust functions and closures can be registered
    // after conversion to the canonical evaluator signature.
    pub func: Arc<OperationFn>,
}

impl Builtin {
    pub fn new(id: impl Into<String>, func: Arc<OperationFn>) -> Self {
        Builtin {
            id: id.into(),
            func,
        }
    }
}

/// Opaque handle to a host value with no direct `Expr` representation.
///
/// Handles can be passed around and returned, and host functions can
/// downcast them back to the concrete type, but programs cannot look inside.
/// Equality is identity.
#[derive(Clone)]
pub struct NativeHandle {
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl NativeHandle {
    /// Wrap a host value by value. Methods taking `&self` can be called on it.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        NativeHandle {
            type_name: std::any::type_name::<T>(),
            value: Arc::new(value),
        }
    }

    /// Wrap a host value behind a lock so that methods taking `&mut self`
    /// can be called on it as well.
    pub fn shared<T: Any + Send + Sync>(value: T) -> Self {
        NativeHandle {
            type_name: std::any::type_name::<T>(),
            value: Arc::new(HostCell::new(value)),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &NativeHandle) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

/// Interior of a handle created by [`NativeHandle::shared`].
pub type HostCell<T> = parking_lot::Mutex<T>;

impl Expr {
    /// Canonical truth value
    pub fn truth(b: bool) -> Expr {
        if b { Expr::Number(1.0) } else { Expr::Nil }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Expr::Nil)
    }

    pub fn is_truthy(&self) -> bool {
        !self.is_nil()
    }

    pub fn cons(first: Expr, rest: Expr) -> Expr {
        Expr::Pair(Arc::new(Cons { first, rest }))
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Expr::Symbol(name) => Some(name),
            _ => None,
        }
    }

    /// Short variant name for error messages
    pub fn kind_name(&self) -> &'static str {
        match self {
            Expr::Nil => "nil",
            Expr::Pair(_) => "pair",
            Expr::Symbol(_) => "symbol",
            Expr::Number(_) => "number",
            Expr::Text(_) => "text",
            Expr::Closure(_) => "lambda",
            Expr::Builtin(_) => "builtin",
            Expr::SpecialForm(_) => "special form",
            Expr::Macro(_) => "macro",
            Expr::Native(_) => "native handle",
        }
    }
}

/// Collect the elements of a proper list.
///
/// Fails with `MalformedList` when the chain ends in anything but nil.
pub fn flatten(expr: &Expr) -> Result<Vec<Expr>, Error> {
    let mut items = Vec::new();
    let mut current = expr;
    loop {
        match current {
            Expr::Nil => return Ok(items),
            Expr::Pair(cell) => {
                items.push(cell.first.clone());
                current = &cell.rest;
            }
            other => {
                return Err(Error::MalformedList(format!(
                    "list terminated by {other} instead of nil"
                )));
            }
        }
    }
}

/// Build a proper list from its elements.
pub fn unflatten(items: Vec<Expr>) -> Expr {
    unflatten_with_tail(items, Expr::Nil)
}

/// Build a chain of pairs ending in `tail` (an improper list unless `tail` is nil).
pub fn unflatten_with_tail(items: Vec<Expr>, tail: Expr) -> Expr {
    items
        .into_iter()
        .rev()
        .fold(tail, |rest, first| Expr::cons(first, rest))
}

/// True for nil and for pair chains terminated by nil.
pub fn is_list(expr: &Expr) -> bool {
    let mut current = expr;
    loop {
        match current {
            Expr::Nil => return true,
            Expr::Pair(cell) => current = &cell.rest,
            _ => return false,
        }
    }
}

impl fmt::Debug for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Nil => write!(f, "Nil"),
            Expr::Pair(cell) => write!(f, "Pair({:?}, {:?})", cell.first, cell.rest),
            Expr::Symbol(s) => write!(f, "Symbol({s})"),
            Expr::Number(n) => write!(f, "Number({n})"),
            Expr::Text(s) => write!(f, "Text(\"{s}\")"),
            Expr::Closure(closure) => {
                write!(f, "Closure(params={:?}, body={:?})", closure.params, closure.body)
            }
            Expr::Builtin(builtin) => write!(f, "Builtin({})", builtin.id),
            Expr::SpecialForm(op) => write!(f, "SpecialForm({})", op.id),
            Expr::Macro(m) => write!(f, "Macro({}, formals={:?})", m.name, m.formals),
            Expr::Native(handle) => write!(f, "Native({})", handle.type_name),
        }
    }
}

/// Integral numbers print without a fraction; non-finite ones as
/// `+inf.0`, `-inf.0` and `+nan.0`, which the reader accepts back.
fn write_number(f: &mut fmt::Formatter<'_>, n: NumberType) -> fmt::Result {
    if n.is_nan() {
        write!(f, "+nan.0")
    } else if n.is_infinite() {
        write!(f, "{}inf.0", if n > 0.0 { '+' } else { '-' })
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        write!(f, "{}", n as i64)
    } else {
        write!(f, "{n}")
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Nil => write!(f, "nil"),
            Expr::Pair(cell) => {
                write!(f, "({}", cell.first)?;
                let mut rest = &cell.rest;
                loop {
                    match rest {
                        Expr::Nil => break,
                        Expr::Pair(next) => {
                            write!(f, " {}", next.first)?;
                            rest = &next.rest;
                        }
                        tail => {
                            write!(f, " . {tail}")?;
                            break;
                        }
                    }
                }
                write!(f, ")")
            }
            Expr::Symbol(s) => write!(f, "{s}"),
            Expr::Number(n) => write_number(f, *n),
            Expr::Text(s) => {
                write!(f, "\"")?;
                for ch in s.chars() {
                    match ch {
                        '"' => write!(f, "\\\"")?,
                        '\\' => write!(f, "\\\\")?,
                        '\n' => write!(f, "\\n")?,
                        '\t' => write!(f, "\\t")?,
                        '\r' => write!(f, "\\r")?,
                        c => write!(f, "{c}")?,
                    }
                }
                write!(f, "\"")
            }
            Expr::Closure(_) => write!(f, "#<lambda>"),
            Expr::Builtin(builtin) => write!(f, "#<builtin:{}>", builtin.id),
            Expr::SpecialForm(op) => write!(f, "#<special-form:{}>", op.id),
            Expr::Macro(m) => write!(f, "#<macro:{}>", m.name),
            Expr::Native(handle) => write!(f, "#<native:{}>", handle.type_name),
        }
    }
}

impl PartialEq for Expr {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Expr::Nil, Expr::Nil) => true,
            (Expr::Pair(a), Expr::Pair(b)) => Arc::ptr_eq(a, b) || a == b,
            (Expr::Symbol(a), Expr::Symbol(b)) => a == b,
            (Expr::Number(a), Expr::Number(b)) => a == b,
            (Expr::Text(a), Expr::Text(b)) => a == b,
            (Expr::Closure(a), Expr::Closure(b)) => Arc::ptr_eq(a, b),
            // Compare builtins by id, not function pointer
            (Expr::Builtin(a), Expr::Builtin(b)) => a.id == b.id,
            (Expr::SpecialForm(a), Expr::SpecialForm(b)) => a.id == b.id,
            (Expr::Macro(a), Expr::Macro(b)) => Arc::ptr_eq(a, b),
            (Expr::Native(a), Expr::Native(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

// From trait implementations for Expr - the host-to-language direction of
// the conversion table.

impl From<&str> for Expr {
    fn from(s: &str) -> Self {
        Expr::Text(s.to_owned())
    }
}

impl From<String> for Expr {
    fn from(s: String) -> Self {
        Expr::Text(s)
    }
}

impl From<bool> for Expr {
    fn from(b: bool) -> Self {
        Expr::truth(b)
    }
}

impl From<()> for Expr {
    fn from(_: ()) -> Self {
        Expr::Nil
    }
}

impl<T: Into<Expr>> From<Option<T>> for Expr {
    fn from(value: Option<T>) -> Self {
        value.map_or(Expr::Nil, Into::into)
    }
}

impl From<NativeHandle> for Expr {
    fn from(handle: NativeHandle) -> Self {
        Expr::Native(handle)
    }
}

// Composite host values have no structural representation and cross the
// boundary as opaque handles.
impl<T: Any + Send + Sync> From<Vec<T>> for Expr {
    fn from(items: Vec<T>) -> Self {
        Expr::Native(NativeHandle::new(items))
    }
}

impl<K: Any + Send + Sync, V: Any + Send + Sync> From<std::collections::HashMap<K, V>> for Expr {
    fn from(map: std::collections::HashMap<K, V>) -> Self {
        Expr::Native(NativeHandle::new(map))
    }
}

/// Numeric conversion between `NumberType` and a host numeric type.
///
/// Integer targets accept only finite, integral values inside the target's
/// range; anything else is rejected instead of silently truncated or wrapped.
pub trait HostNumber: Sized {
    const KIND: &'static str;

    fn from_number(n: NumberType) -> Option<Self>;
    fn into_number(self) -> NumberType;
}

macro_rules! impl_host_signed {
    ($($t:ty),+) => {$(
        impl HostNumber for $t {
            const KIND: &'static str = stringify!($t);

            fn from_number(n: NumberType) -> Option<Self> {
                // MIN is a power of two, so both bounds are exact in f64
                let in_range = n >= <$t>::MIN as NumberType && n < -(<$t>::MIN as NumberType);
                (n.fract() == 0.0 && in_range).then(|| n as $t)
            }

            fn into_number(self) -> NumberType {
                self as NumberType
            }
        }
    )+};
}

macro_rules! impl_host_unsigned {
    ($($t:ty),+) => {$(
        impl HostNumber for $t {
            const KIND: &'static str = stringify!($t);

            fn from_number(n: NumberType) -> Option<Self> {
                let in_range = n >= 0.0 && n < (<$t>::MAX as NumberType) + 1.0;
                (n.fract() == 0.0 && in_range).then(|| n as $t)
            }

            fn into_number(self) -> NumberType {
                self as NumberType
            }
        }
    )+};
}

impl_host_signed!(i8, i16, i32, i64, isize);
impl_host_unsigned!(u8, u16, u32, u64, usize);

impl HostNumber for f32 {
    const KIND: &'static str = "f32";

    fn from_number(n: NumberType) -> Option<Self> {
        Some(n as f32)
    }

    fn into_number(self) -> NumberType {
        NumberType::from(self)
    }
}

impl HostNumber for f64 {
    const KIND: &'static str = "f64";

    fn from_number(n: NumberType) -> Option<Self> {
        Some(n)
    }

    fn into_number(self) -> NumberType {
        self
    }
}

// Fallible conversions from `Expr` back into host types; these feed the
// blanket `FromParam` implementation used for typed function parameters.
macro_rules! impl_numeric_conversions {
    ($($t:ty),+) => {$(
        impl From<$t> for Expr {
            fn from(n: $t) -> Self {
                Expr::Number(n.into_number())
            }
        }

        impl std::convert::TryInto<$t> for Expr {
            type Error = Error;

            fn try_into(self) -> Result<$t, Error> {
                match self {
                    Expr::Number(n) => <$t as HostNumber>::from_number(n).ok_or_else(|| {
                        Error::InvalidHostArgument(format!(
                            "{n} does not fit in {}",
                            <$t as HostNumber>::KIND
                        ))
                    }),
                    other => Err(Error::InvalidHostArgument(format!(
                        "expected number for {}, got {other}",
                        <$t as HostNumber>::KIND
                    ))),
                }
            }
        }
    )+};
}

impl_numeric_conversions!(i8, i16, i32, i64, isize, u8, u16, u32, u64, usize, f32, f64);

impl std::convert::TryInto<bool> for Expr {
    type Error = Error;

    /// Any value converts: nil is false, everything else is true.
    fn try_into(self) -> Result<bool, Error> {
        Ok(self.is_truthy())
    }
}

impl std::convert::TryInto<String> for Expr {
    type Error = Error;

    fn try_into(self) -> Result<String, Error> {
        match self {
            Expr::Text(s) => Ok(s),
            other => Err(Error::InvalidHostArgument(format!(
                "expected text, got {other}"
            ))),
        }
    }
}

/// Helper function for creating symbols
pub fn sym<S: AsRef<str>>(name: S) -> Expr {
    Expr::Symbol(name.as_ref().to_owned())
}

/// Helper function for creating values from anything convertible to `Expr`
pub fn val<T: Into<Expr>>(value: T) -> Expr {
    value.into()
}

/// Helper function for the empty list
pub fn nil() -> Expr {
    Expr::Nil
}

/// Helper function for building a proper list
pub fn list(items: Vec<Expr>) -> Expr {
    unflatten(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_helper_functions_data_driven() {
        let test_cases = vec![
            (val(42), Expr::Number(42.0)),
            (val(-17i8), Expr::Number(-17.0)),
            (val(2.5), Expr::Number(2.5)),
            (val(u64::from(u32::MAX)), Expr::Number(4294967295.0)),
            (val(true), Expr::Number(1.0)),
            (val(false), Expr::Nil),
            (val("hello"), Expr::Text("hello".to_owned())),
            (val(()), Expr::Nil),
            (val(None::<i32>), Expr::Nil),
            (val(Some(3)), Expr::Number(3.0)),
            (sym("strings.ToUpper"), Expr::Symbol("strings.ToUpper".to_owned())),
            (list(vec![]), Expr::Nil),
            (
                list(vec![val(1), val(2)]),
                Expr::cons(val(1), Expr::cons(val(2), Expr::Nil)),
            ),
        ];

        for (i, (actual, expected)) in test_cases.iter().enumerate() {
            assert_eq!(actual, expected, "Test case {} failed", i + 1);
        }
    }

    #[test]
    fn test_flatten_rebuilds_same_list() {
        let original = list(vec![sym("a"), list(vec![val(1), val("x")]), nil()]);
        let rebuilt = unflatten(flatten(&original).expect("proper list"));
        assert_eq!(rebuilt, original);
        assert_eq!(flatten(&nil()).expect("nil is a list"), Vec::<Expr>::new());
    }

    #[test]
    fn test_flatten_rejects_improper_tail() {
        let improper = unflatten_with_tail(vec![val(1), val(2)], val(3));
        assert!(matches!(flatten(&improper), Err(Error::MalformedList(_))));
        assert!(!is_list(&improper));
        assert!(!is_list(&val(3)));
        assert!(is_list(&nil()));
    }

    #[test]
    fn test_display() {
        let cases = vec![
            (list(vec![sym("+"), val(1), val(2.5)]), "(+ 1 2.5)"),
            (unflatten_with_tail(vec![sym("a")], sym("b")), "(a . b)"),
            (nil(), "nil"),
            (val("a\"b\n"), "\"a\\\"b\\n\""),
            (val(-3), "-3"),
            (list(vec![list(vec![]), val(0)]), "(nil 0)"),
            (val(f64::INFINITY), "+inf.0"),
            (val(f64::NEG_INFINITY), "-inf.0"),
            (val(f64::NAN), "+nan.0"),
        ];
        for (expr, expected) in cases {
            assert_eq!(format!("{expr}"), expected);
        }
    }

    #[test]
    fn test_truthiness() {
        assert!(!nil().is_truthy());
        assert!(val(0).is_truthy());
        assert!(val("").is_truthy());
        assert!(sym("nil").is_truthy());
    }

    #[test]
    fn test_integer_conversion_rejects_truncation() {
        let ok: Result<i32, Error> = val(42).try_into();
        assert_eq!(ok, Ok(42));

        let fraction: Result<i32, Error> = val(1.5).try_into();
        assert!(matches!(fraction, Err(Error::InvalidHostArgument(_))));

        let overflow: Result<u8, Error> = val(256).try_into();
        assert!(matches!(overflow, Err(Error::InvalidHostArgument(_))));

        let negative: Result<u64, Error> = val(-1).try_into();
        assert!(matches!(negative, Err(Error::InvalidHostArgument(_))));

        let boundary: Result<i64, Error> = val(9.223372036854775807e18).try_into();
        assert!(boundary.is_err(), "2^63 must not wrap into i64");

        let smallest: Result<i8, Error> = val(-128).try_into();
        assert_eq!(smallest, Ok(-128));

        let text: Result<f64, Error> = val("1").try_into();
        assert!(matches!(text, Err(Error::InvalidHostArgument(_))));
    }

    #[test]
    fn test_native_handle_identity() {
        let a = NativeHandle::new(vec![1u8, 2, 3]);
        let b = NativeHandle::new(vec![1u8, 2, 3]);
        assert_eq!(Expr::Native(a.clone()), Expr::Native(a.clone()));
        assert_ne!(Expr::Native(a.clone()), Expr::Native(b));
        assert_eq!(a.downcast_ref::<Vec<u8>>().map(Vec::len), Some(3));
        assert!(a.downcast_ref::<String>().is_none());
    }
}
