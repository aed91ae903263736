//! Chained, shared scopes.
//!
//! An [`Env`] is a reference-counted handle to one scope. Cloning the handle
//! shares the scope: closures capture their defining scope this way, and
//! spawned evaluations run against the same chain as their parent.
//!
//! Two write policies exist. [`Env::define_local`] writes into the scope
//! itself and is used for parameter and `let` bindings.
//! [`Env::define_hoisted`] writes into the scope's [`Env::hoist_target`],
//! the enclosing scope one level up (the root writes into itself). `define`
//! and `defmacro` use it so that definitions made while evaluating a body
//! land in the scope that outlives the body's argument frame.
//!
//! Scopes are guarded by a read/write lock, which keeps each single lookup
//! or insertion atomic. Nothing orders a `define` in one spawned evaluation
//! against a lookup in another: concurrent writers to the same scope race at
//! the language level and must synchronise through channels.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::Error;
use crate::ast::{Builtin, Expr};
use crate::evaluator::Arity;
use crate::evaluator::intooperation::{IntoOperation, IntoVariadicOperation, operation};

/// Environment for variable bindings
#[derive(Clone)]
pub struct Env(Arc<Scope>);

struct Scope {
    bindings: RwLock<HashMap<String, Expr>>,
    parent: Option<Env>,
}

impl Env {
    /// Create a root environment with no parent
    pub fn new() -> Self {
        Env(Arc::new(Scope {
            bindings: RwLock::new(HashMap::new()),
            parent: None,
        }))
    }

    /// Create an empty scope whose parent is `self`
    pub fn child(&self) -> Self {
        Env(Arc::new(Scope {
            bindings: RwLock::new(HashMap::new()),
            parent: Some(self.clone()),
        }))
    }

    pub fn parent(&self) -> Option<&Env> {
        self.0.parent.as_ref()
    }

    pub fn is_root(&self) -> bool {
        self.0.parent.is_none()
    }

    /// Look `name` up in this scope, then in each ancestor.
    pub fn get(&self, name: &str) -> Option<Expr> {
        let mut scope = self;
        loop {
            if let Some(value) = scope.0.bindings.read().get(name) {
                return Some(value.clone());
            }
            scope = scope.parent()?;
        }
    }

    /// Like [`Env::get`] but fails with `UnboundSymbol`.
    pub fn lookup(&self, name: &str) -> Result<Expr, Error> {
        self.get(name)
            .ok_or_else(|| Error::UnboundSymbol(name.to_owned()))
    }

    /// True if `name` is bound in this scope itself, ignoring ancestors
    pub fn is_bound_locally(&self, name: &str) -> bool {
        self.0.bindings.read().contains_key(name)
    }

    /// Insert or overwrite a binding in this scope only.
    pub fn define_local(&self, name: impl Into<String>, value: Expr) {
        self.0.bindings.write().insert(name.into(), value);
    }

    /// The scope that hoisted definitions made from this scope land in:
    /// the parent, or the scope itself at the root.
    pub fn hoist_target(&self) -> &Env {
        self.parent().unwrap_or(self)
    }

    /// Insert or overwrite a binding in [`Env::hoist_target`].
    pub fn define_hoisted(&self, name: impl Into<String>, value: Expr) {
        self.hoist_target().define_local(name, value);
    }

    pub fn ptr_eq(&self, other: &Env) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Number of ancestors between this scope and the root
    pub fn depth(&self) -> usize {
        let mut depth = 0;
        let mut scope = self;
        while let Some(parent) = scope.parent() {
            depth += 1;
            scope = parent;
        }
        depth
    }

    /// Register a builtin that already works on raw `Expr` arguments.
    ///
    /// This is the low-level API. Prefer
    /// [`Env::register_builtin_operation`] for functions with typed
    /// parameters.
    ///
    /// ```
    /// use kakapo::Env;
    /// use kakapo::ast::Expr;
    ///
    /// fn count(args: &[Expr]) -> Result<Expr, kakapo::Error> {
    ///     Ok(Expr::from(args.len() as i64))
    /// }
    ///
    /// let env = Env::new();
    /// env.register_builtin_function("count", count);
    /// ```
    pub fn register_builtin_function(&self, name: &str, func: fn(&[Expr]) -> Result<Expr, Error>) {
        let wrapped = operation(move |_ctx, args| func(&args));
        self.define_local(name, Expr::Builtin(Builtin::new(name, wrapped)));
    }

    /// Register a strongly typed Rust function as a builtin, with automatic
    /// argument extraction and result conversion.
    ///
    /// ```
    /// use kakapo::Env;
    ///
    /// fn repeat(s: &str, n: usize) -> String {
    ///     s.repeat(n)
    /// }
    ///
    /// let env = Env::new();
    /// env.register_builtin_operation::<(&str, usize), _>("repeat", repeat);
    /// ```
    ///
    /// Supported parameter types:
    /// - every integer and float type (from numbers; integers must be integral and in range)
    /// - `bool` (any value, by truthiness)
    /// - `String` and `&str` (from text)
    /// - `Expr` (the raw value)
    /// - [`crate::evaluator::intooperation::Native<T>`], seen by the function as `&T`
    ///
    /// Supported return types are anything `Into<Expr>` (including `()`,
    /// `bool`, numbers, strings, `Option<T>` and `NativeHandle`) and
    /// `Result<T, E>` where `E: Into<Error>`.
    ///
    /// Arity is enforced automatically and conversion failures raise
    /// `InvalidHostArgument`.
    pub fn register_builtin_operation<Args, F>(&self, name: &str, func: F)
    where
        F: IntoOperation<Args>,
    {
        let wrapped = func.into_operation();
        self.define_local(name, Expr::Builtin(Builtin::new(name, wrapped)));
    }

    /// Register a variadic builtin whose last parameter is a rest iterator
    /// such as `NumIter` or `ValueIter`, optionally after a fixed prefix.
    ///
    /// The given [`Arity`] is validated on each call, since minimum and
    /// maximum counts are not derivable from the signature alone.
    pub fn register_variadic_builtin_operation<Args, F>(&self, name: &str, arity: Arity, func: F)
    where
        F: IntoVariadicOperation<Args>,
    {
        let inner = func.into_variadic_operation();
        let wrapped = operation(move |ctx, args| {
            arity.validate(args.len())?;
            inner(ctx, args)
        });
        self.define_local(name, Expr::Builtin(Builtin::new(name, wrapped)));
    }

    /// Get all bindings visible from this scope, inner bindings shadowing
    /// outer ones. Returns (name, value) pairs sorted by name.
    pub fn get_all_bindings(&self) -> Vec<(String, Expr)> {
        let mut bindings = HashMap::new();

        let mut chain = vec![self];
        while let Some(parent) = chain.last().and_then(|scope| scope.parent()) {
            chain.push(parent);
        }

        // Root first so that inner scopes override
        for scope in chain.into_iter().rev() {
            for (name, value) in scope.0.bindings.read().iter() {
                bindings.insert(name.clone(), value.clone());
            }
        }

        let mut result: Vec<_> = bindings.into_iter().collect();
        result.sort_by(|a, b| a.0.cmp(&b.0));
        result
    }
}

impl Default for Env {
    fn default() -> Self {
        Env::new()
    }
}

// Scopes can reach themselves through captured closures, so Debug stays shallow.
impl fmt::Debug for Env {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Env")
            .field("depth", &self.depth())
            .field("bindings", &self.0.bindings.read().len())
            .finish()
    }
}
