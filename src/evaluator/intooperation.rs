use crate::Error;
use crate::ast::{Expr, HostCell};
use crate::evaluator::{Arity, CallContext};
use std::any::Any;
use std::iter::FusedIterator;
use std::marker::PhantomData;
use std::sync::Arc;

// NOTE: This module is the adapter layer between strongly typed Rust
// functions and the erased `OperationFn` the evaluator calls. It is used by
// the builtin registry, by `Env::register_*` and by host packages, so every
// conversion a host function can observe is implemented here and easy to
// audit.
//
// Conversion failures are reported as `InvalidHostArgument`; the builtin
// registry narrows them to `TypeError` for the core operations.

/// Canonical erased builtin function type used by the evaluator.
///
/// Builtins receive the calling context (the caller's environment and the
/// current evaluation depth) and ownership of their argument vector.
pub type OperationFn = dyn Fn(&CallContext<'_>, Vec<Expr>) -> Result<Expr, Error> + Send + Sync;

/// Erase a closure into an [`OperationFn`].
///
/// Going through this function pins the closure's signature, which lets the
/// compiler infer a closure that is generic over the context lifetime.
pub fn operation<F>(func: F) -> Arc<OperationFn>
where
    F: Fn(&CallContext<'_>, Vec<Expr>) -> Result<Expr, Error> + Send + Sync + 'static,
{
    Arc::new(func)
}

// =====================================================================
// Fixed parameter conversion
// =====================================================================

/// Core trait used by the fixed-arity adapters to turn `Expr` arguments
/// into strongly typed parameters.
///
/// The associated `Param<'a>` type is the parameter type as seen by the
/// function for a given lifetime of the local argument slots.
pub trait FromParam {
    type Param<'a>;

    /// Convert a single argument into this parameter type, either borrowing
    /// from the slot (`&str`, [`Native<T>`]) or moving out of it.
    fn from_arg<'a>(value: &'a mut Expr) -> Result<Self::Param<'a>, Error>;
}

impl FromParam for Expr {
    type Param<'a> = Expr;

    fn from_arg<'a>(value: &'a mut Expr) -> Result<Self::Param<'a>, Error> {
        Ok(std::mem::replace(value, Expr::Nil))
    }
}

// Every scalar with an `impl TryInto<T> for Expr` in `ast.rs`: the numeric
// types, `bool` and `String`.
impl<T> FromParam for T
where
    Expr: std::convert::TryInto<T, Error = Error>,
{
    type Param<'a> = T;

    fn from_arg<'a>(value: &'a mut Expr) -> Result<Self::Param<'a>, Error> {
        let owned = std::mem::replace(value, Expr::Nil);
        <Expr as std::convert::TryInto<T>>::try_into(owned)
    }
}

impl FromParam for &str {
    type Param<'a> = &'a str;

    fn from_arg<'a>(value: &'a mut Expr) -> Result<Self::Param<'a>, Error> {
        match value {
            Expr::Text(s) => Ok(s.as_str()),
            other => Err(Error::InvalidHostArgument(format!(
                "expected text, got {other}"
            ))),
        }
    }
}

/// Parameter marker for an opaque host value of type `T`.
///
/// A function declared with a `Native<T>` parameter receives `&T`, borrowed
/// from a handle created with [`crate::NativeHandle::new`]. Handles created
/// with `NativeHandle::shared` are reached through methods instead.
pub struct Native<T>(PhantomData<T>);

impl<T: Any> FromParam for Native<T> {
    type Param<'a> = &'a T;

    fn from_arg<'a>(value: &'a mut Expr) -> Result<Self::Param<'a>, Error> {
        let expected = std::any::type_name::<T>();
        match value {
            Expr::Native(handle) => {
                let found = handle.type_name();
                handle.downcast_ref::<T>().ok_or_else(|| {
                    Error::InvalidHostArgument(format!("expected {expected}, got {found}"))
                })
            }
            other => Err(Error::InvalidHostArgument(format!(
                "expected {expected}, got {other}"
            ))),
        }
    }
}

// Lists are not marshaled across the boundary, so there is no list-valued
// parameter. Functions that need several values take a rest parameter.

// =====================================================================
// Typed iterators over rest arguments
// =====================================================================

/// Marker trait describing how to view an `Expr` slice as a typed
/// iterator. Implementations validate the whole slice up front and then
/// map each element infallibly.
#[doc(hidden)]
pub trait ValueElementKind {
    type Item<'a>;

    fn precheck(slice: &[Expr]) -> Result<(), Error>;
    fn project<'a>(v: &'a Expr) -> Self::Item<'a>;
}

/// Iterator over a run of arguments, parameterized by a
/// [`ValueElementKind`] that determines the element type and validation.
#[doc(hidden)]
pub struct TypedValueIter<'a, K: ValueElementKind> {
    inner: std::slice::Iter<'a, Expr>,
    _marker: PhantomData<K>,
}

impl<'a, K> TypedValueIter<'a, K>
where
    K: ValueElementKind,
{
    pub(crate) fn new(values: &'a [Expr]) -> Result<Self, Error> {
        K::precheck(values)?;
        Ok(TypedValueIter {
            inner: values.iter(),
            _marker: PhantomData,
        })
    }
}

impl<'a, K> Iterator for TypedValueIter<'a, K>
where
    K: ValueElementKind,
{
    type Item = K::Item<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let v = self.inner.next()?;
        Some(K::project(v))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

impl<'a, K> ExactSizeIterator for TypedValueIter<'a, K> where K: ValueElementKind {}
impl<'a, K> FusedIterator for TypedValueIter<'a, K> where K: ValueElementKind {}

#[doc(hidden)]
pub struct ValueKind;

impl ValueElementKind for ValueKind {
    type Item<'a> = &'a Expr;

    fn precheck(_slice: &[Expr]) -> Result<(), Error> {
        Ok(())
    }

    fn project<'a>(v: &'a Expr) -> Self::Item<'a> {
        v
    }
}

fn precheck_all(slice: &[Expr], expected: &str, accept: impl Fn(&Expr) -> bool) -> Result<(), Error> {
    match slice.iter().find(|v| !accept(v)) {
        Some(bad) => Err(Error::InvalidHostArgument(format!(
            "expected {expected}, got {bad}"
        ))),
        None => Ok(()),
    }
}

#[doc(hidden)]
pub struct NumberKind;

impl ValueElementKind for NumberKind {
    type Item<'a> = f64;

    fn precheck(slice: &[Expr]) -> Result<(), Error> {
        precheck_all(slice, "number", |v| matches!(v, Expr::Number(_)))
    }

    fn project<'a>(v: &'a Expr) -> Self::Item<'a> {
        match v {
            Expr::Number(n) => *n,
            _ => unreachable!("NumberKind invariant violated"),
        }
    }
}

#[doc(hidden)]
pub struct IntegerKind;

impl ValueElementKind for IntegerKind {
    type Item<'a> = i64;

    fn precheck(slice: &[Expr]) -> Result<(), Error> {
        precheck_all(slice, "integer", |v| {
            matches!(v, Expr::Number(n) if <i64 as crate::ast::HostNumber>::from_number(*n).is_some())
        })
    }

    fn project<'a>(v: &'a Expr) -> Self::Item<'a> {
        match v {
            Expr::Number(n) => *n as i64,
            _ => unreachable!("IntegerKind invariant violated"),
        }
    }
}

#[doc(hidden)]
pub struct TextKind;

impl ValueElementKind for TextKind {
    type Item<'a> = &'a str;

    fn precheck(slice: &[Expr]) -> Result<(), Error> {
        precheck_all(slice, "text", |v| matches!(v, Expr::Text(_)))
    }

    fn project<'a>(v: &'a Expr) -> Self::Item<'a> {
        match v {
            Expr::Text(s) => s.as_str(),
            _ => unreachable!("TextKind invariant violated"),
        }
    }
}

/// Borrowed iterator over arbitrary arguments.
pub type ValueIter<'a> = TypedValueIter<'a, ValueKind>;

/// Borrowed iterator over numeric arguments.
pub type NumIter<'a> = TypedValueIter<'a, NumberKind>;

/// Borrowed iterator over integral numeric arguments, narrowed to `i64`.
pub type IntIter<'a> = TypedValueIter<'a, IntegerKind>;

/// Borrowed iterator over text arguments.
pub type TextIter<'a> = TypedValueIter<'a, TextKind>;

// =====================================================================
// Rest-parameter support for variadic operations
// =====================================================================

/// Core trait used to construct rest-parameter values from the tail of the
/// argument vector.
pub trait FromRest {
    type Param<'a>;

    fn from_rest<'a>(slice: &'a [Expr]) -> Result<Self::Param<'a>, Error>;
}

impl<K> FromRest for TypedValueIter<'static, K>
where
    K: ValueElementKind,
{
    type Param<'a> = TypedValueIter<'a, K>;

    fn from_rest<'a>(slice: &'a [Expr]) -> Result<Self::Param<'a>, Error> {
        TypedValueIter::<K>::new(slice)
    }
}

// =====================================================================
// Return-type adaptation
// =====================================================================

/// Normalizes function return types to `Result<Expr, Error>`.
///
/// Anything `Into<Expr>` is accepted as is. `Result<T, E>` is accepted for
/// any error type convertible into [`Error`], which includes `&str` and
/// `String` messages.
pub trait IntoValueResult {
    fn into_value_result(self) -> Result<Expr, Error>;
}

impl<T, E> IntoValueResult for Result<T, E>
where
    T: Into<Expr>,
    E: Into<Error>,
{
    fn into_value_result(self) -> Result<Expr, Error> {
        self.map(Into::into).map_err(Into::into)
    }
}

impl<T> IntoValueResult for T
where
    T: Into<Expr>,
{
    fn into_value_result(self) -> Result<Expr, Error> {
        Ok(self.into())
    }
}

/// Converts a strongly typed Rust function or closure into the erased
/// [`OperationFn`], parameterized by its argument tuple type.
pub trait IntoOperation<Args> {
    fn into_operation(self) -> Arc<OperationFn>;
}

/// Converts a function whose last parameter is a rest iterator
/// ([`ValueIter`], [`NumIter`], [`IntIter`] or [`TextIter`]), optionally
/// after a fixed prefix of [`FromParam`] parameters.
pub trait IntoVariadicOperation<Args> {
    fn into_variadic_operation(self) -> Arc<OperationFn>;
}

// =====================================================================
// Variadic adapters
// =====================================================================

impl<F, I, R> IntoVariadicOperation<(I,)> for F
where
    I: FromRest,
    F: for<'a> Fn(<I as FromRest>::Param<'a>) -> R + Send + Sync + 'static,
    R: IntoValueResult,
{
    fn into_variadic_operation(self) -> Arc<OperationFn> {
        operation(move |_ctx, args| {
            let rest_param: <I as FromRest>::Param<'_> = <I as FromRest>::from_rest(&args[..])?;
            let result: R = (self)(rest_param);
            result.into_value_result()
        })
    }
}

macro_rules! impl_into_variadic_operation_for_prefix_and_rest {
    ($prefix:expr, $( $v:ident, $p:ident : $A:ident ),+ ) => {
        impl<F, I, R, $( $A ),+> IntoVariadicOperation<( $( $A, )+ I, )> for F
        where
            I: FromRest,
            $( $A: FromParam, )+
            F: for<'a> Fn(
                    $( <$A as FromParam>::Param<'a> ),+,
                    <I as FromRest>::Param<'a>,
                ) -> R
                + Send
                + Sync
                + 'static,
            R: IntoValueResult,
        {
            fn into_variadic_operation(self) -> Arc<OperationFn> {
                operation(move |_ctx, mut args: Vec<Expr>| {
                    let len = args.len();
                    match args.as_mut_slice() {
                        [ $( $v ),+, rest @ .. ] => {
                            $(
                                let $p: <$A as FromParam>::Param<'_> =
                                    <$A as FromParam>::from_arg($v)?;
                            )+

                            let rest_param: <I as FromRest>::Param<'_> =
                                <I as FromRest>::from_rest(&*rest)?;

                            let result: R = (self)( $( $p ),+, rest_param );
                            result.into_value_result()
                        }
                        _ => Err(Error::arity_error(Arity::AtLeast($prefix), len)),
                    }
                })
            }
        }
    };
}

impl_into_variadic_operation_for_prefix_and_rest!(1, v0, p0: A1);
impl_into_variadic_operation_for_prefix_and_rest!(2, v0, p0: A1, v1, p1: A2);
impl_into_variadic_operation_for_prefix_and_rest!(3, v0, p0: A1, v1, p1: A2, v2, p2: A3);
impl_into_variadic_operation_for_prefix_and_rest!(4, v0, p0: A1, v1, p1: A2, v2, p2: A3, v3, p3: A4);

// =====================================================================
// Fixed-arity adapters
// =====================================================================

/// Implements `IntoOperation` for one arity: checks the argument count,
/// then converts each slot with `FromParam` before calling the function.
macro_rules! impl_into_operation_for_arity {
    ($arity:expr, $( $v:ident, $p:ident : $A:ident ),+ ) => {
        impl<F, R, $( $A ),+> IntoOperation<( $( $A, )+ )> for F
        where
            F: for<'a> Fn( $( <$A as FromParam>::Param<'a> ),+ ) -> R
                + Send
                + Sync
                + 'static,
            $( $A: FromParam, )+
            R: IntoValueResult,
        {
            fn into_operation(self) -> Arc<OperationFn> {
                operation(move |_ctx, mut args: Vec<Expr>| {
                    let len = args.len();
                    match args.as_mut_slice() {
                        [ $( $v ),+ ] => {
                            $(
                                let $p: <$A as FromParam>::Param<'_> =
                                    <$A as FromParam>::from_arg($v)?;
                            )+

                            let result: R = (self)( $( $p ),+ );
                            result.into_value_result()
                        }
                        _ => Err(Error::arity_error(Arity::Exact($arity), len)),
                    }
                })
            }
        }
    };
}

impl<F, R> IntoOperation<()> for F
where
    F: Fn() -> R + Send + Sync + 'static,
    R: IntoValueResult,
{
    fn into_operation(self) -> Arc<OperationFn> {
        operation(move |_ctx, args| {
            if !args.is_empty() {
                return Err(Error::arity_error(Arity::Exact(0), args.len()));
            }

            let result: R = (self)();
            result.into_value_result()
        })
    }
}

impl_into_operation_for_arity!(1, v0, p0: A1);
impl_into_operation_for_arity!(2, v0, p0: A1, v1, p1: A2);
impl_into_operation_for_arity!(3, v0, p0: A1, v1, p1: A2, v2, p2: A3);
impl_into_operation_for_arity!(4, v0, p0: A1, v1, p1: A2, v2, p2: A3, v3, p3: A4);
impl_into_operation_for_arity!(5, v0, p0: A1, v1, p1: A2, v2, p2: A3, v3, p3: A4, v4, p4: A5);
impl_into_operation_for_arity!(6, v0, p0: A1, v1, p1: A2, v2, p2: A3, v3, p3: A4, v4, p4: A5, v5, p5: A6);

// =====================================================================
// Method adapters
// =====================================================================

fn receiver_mismatch<T>(found: &Expr) -> Error {
    Error::InvalidHostArgument(format!(
        "expected receiver of type {}, got {found}",
        std::any::type_name::<T>()
    ))
}

/// Run `f` against the `T` inside a receiver handle. Both plain handles
/// and [`HostCell`] handles are accepted; the latter is locked for the
/// duration of the call.
fn with_receiver<T: Any, R>(receiver: &Expr, f: impl FnOnce(&T) -> R) -> Result<R, Error> {
    let Expr::Native(handle) = receiver else {
        return Err(receiver_mismatch::<T>(receiver));
    };
    if let Some(value) = handle.downcast_ref::<T>() {
        return Ok(f(value));
    }
    match handle.downcast_ref::<HostCell<T>>() {
        Some(cell) => Ok(f(&cell.lock())),
        None => Err(receiver_mismatch::<T>(receiver)),
    }
}

/// Like [`with_receiver`] for `&mut self` methods, which need a
/// [`HostCell`] handle.
fn with_receiver_mut<T: Any, R>(receiver: &Expr, f: impl FnOnce(&mut T) -> R) -> Result<R, Error> {
    match receiver {
        Expr::Native(handle) => match handle.downcast_ref::<HostCell<T>>() {
            Some(cell) => Ok(f(&mut cell.lock())),
            None => Err(Error::InvalidHostArgument(format!(
                "method on {} needs a shared handle, got {receiver}",
                std::any::type_name::<T>()
            ))),
        },
        _ => Err(receiver_mismatch::<T>(receiver)),
    }
}

/// Converts a function taking `&T` plus typed parameters into an operation
/// whose first argument is the receiver handle.
pub trait IntoMethod<T, Args> {
    fn into_method(self) -> Arc<OperationFn>;
}

/// Converts a function taking `&mut T` plus typed parameters into an
/// operation whose first argument is a shared receiver handle.
pub trait IntoMutMethod<T, Args> {
    fn into_mut_method(self) -> Arc<OperationFn>;
}

macro_rules! impl_into_method_for_arity {
    ($arity:expr $(, $v:ident, $p:ident : $A:ident )* ) => {
        impl<T, F, R, $( $A ),*> IntoMethod<T, ( $( $A, )* )> for F
        where
            T: Any + Send + Sync,
            F: for<'a> Fn(&T, $( <$A as FromParam>::Param<'a> ),* ) -> R
                + Send
                + Sync
                + 'static,
            $( $A: FromParam, )*
            R: IntoValueResult,
        {
            fn into_method(self) -> Arc<OperationFn> {
                operation(move |_ctx, mut args: Vec<Expr>| {
                    let len = args.len();
                    match args.as_mut_slice() {
                        [ receiver $(, $v )* ] => {
                            $(
                                let $p: <$A as FromParam>::Param<'_> =
                                    <$A as FromParam>::from_arg($v)?;
                            )*

                            let result: R =
                                with_receiver::<T, R>(receiver, |target| (self)(target $(, $p )*))?;
                            result.into_value_result()
                        }
                        _ => Err(Error::arity_error(Arity::Exact($arity + 1), len)),
                    }
                })
            }
        }

        impl<T, F, R, $( $A ),*> IntoMutMethod<T, ( $( $A, )* )> for F
        where
            T: Any + Send + Sync,
            F: for<'a> Fn(&mut T, $( <$A as FromParam>::Param<'a> ),* ) -> R
                + Send
                + Sync
                + 'static,
            $( $A: FromParam, )*
            R: IntoValueResult,
        {
            fn into_mut_method(self) -> Arc<OperationFn> {
                operation(move |_ctx, mut args: Vec<Expr>| {
                    let len = args.len();
                    match args.as_mut_slice() {
                        [ receiver $(, $v )* ] => {
                            $(
                                let $p: <$A as FromParam>::Param<'_> =
                                    <$A as FromParam>::from_arg($v)?;
                            )*

                            let result: R =
                                with_receiver_mut::<T, R>(receiver, |target| (self)(target $(, $p )*))?;
                            result.into_value_result()
                        }
                        _ => Err(Error::arity_error(Arity::Exact($arity + 1), len)),
                    }
                })
            }
        }
    };
}

impl_into_method_for_arity!(0);
impl_into_method_for_arity!(1, v0, p0: A1);
impl_into_method_for_arity!(2, v0, p0: A1, v1, p1: A2);
impl_into_method_for_arity!(3, v0, p0: A1, v1, p1: A2, v2, p2: A3);
impl_into_method_for_arity!(4, v0, p0: A1, v1, p1: A2, v2, p2: A3, v3, p3: A4);
