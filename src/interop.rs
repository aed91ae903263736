//! Host packages.
//!
//! A [`HostPackage`] groups Rust values, functions and type methods under an
//! import path. Packages are registered with a [`PackageRegistry`] (usually
//! through [`crate::Interpreter::import_package`]) and become visible to a
//! program only when it runs `(import "path")`. Members are then bound in the
//! importing scope as `base.Member`, and methods as `base.Type.Method`, where
//! `base` is the last segment of the path.
//!
//! ```
//! use kakapo::{HostPackage, HostType, NativeHandle};
//!
//! struct Counter(i64);
//!
//! impl Counter {
//!     fn get(&self) -> i64 {
//!         self.0
//!     }
//!     fn add(&mut self, n: i64) -> i64 {
//!         self.0 += n;
//!         self.0
//!     }
//! }
//!
//! let package = HostPackage::new("example.com/tally")
//!     .value("Limit", 10)
//!     .function::<(i64,), _>("New", |start: i64| NativeHandle::shared(Counter(start)))
//!     .host_type(
//!         HostType::<Counter>::new("Counter")
//!             .method::<(), _>("Get", Counter::get)
//!             .method_mut::<(i64,), _>("Add", Counter::add),
//!     );
//! assert_eq!(package.base_name(), "tally");
//! ```
//!
//! Scalars cross the boundary by value: numbers of every width, `bool`
//! (nil or `1`) and strings. Everything else is wrapped in a
//! [`NativeHandle`] that programs can pass around but not look inside.
//! Arguments that do not convert to the parameter type fail with
//! `InvalidHostArgument`.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::Error;
use crate::ast::{Builtin, Expr, NativeHandle};
use crate::environment::Env;
use crate::evaluator::Arity;
use crate::evaluator::intooperation::{
    IntoMethod, IntoMutMethod, IntoOperation, IntoVariadicOperation, OperationFn, operation,
};

#[derive(Clone)]
enum HostMember {
    Value(Expr),
    Function(Arc<OperationFn>),
}

/// Named collection of host members.
#[derive(Clone)]
pub struct HostPackage {
    path: String,
    members: Vec<(String, HostMember)>,
}

impl HostPackage {
    pub fn new(path: impl Into<String>) -> Self {
        HostPackage {
            path: path.into(),
            members: Vec::new(),
        }
    }

    /// The import path, as given to `(import ...)`
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Last segment of the path, used as the prefix of bound names
    pub fn base_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Export a value converted by kind: scalars become numbers, text or
    /// truth values, anything else an opaque handle.
    pub fn value(mut self, name: impl Into<String>, value: impl Into<Expr>) -> Self {
        self.members.push((name.into(), HostMember::Value(value.into())));
        self
    }

    /// Export any host value as an opaque handle.
    pub fn opaque<T: Any + Send + Sync>(self, name: impl Into<String>, value: T) -> Self {
        self.value(name, NativeHandle::new(value))
    }

    /// Export a typed function. See [`Env::register_builtin_operation`] for
    /// the supported parameter and return types.
    pub fn function<Args, F>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: IntoOperation<Args>,
    {
        self.members
            .push((name.into(), HostMember::Function(func.into_operation())));
        self
    }

    /// Export a function whose last parameter collects the remaining
    /// arguments. `arity` is checked before any conversion.
    pub fn variadic<Args, F>(mut self, name: impl Into<String>, arity: Arity, func: F) -> Self
    where
        F: IntoVariadicOperation<Args>,
    {
        let inner = func.into_variadic_operation();
        let checked = operation(move |ctx, args| {
            arity.validate(args.len())?;
            inner(ctx, args)
        });
        self.members.push((name.into(), HostMember::Function(checked)));
        self
    }

    /// Export the methods of a host type as `Type.Method`.
    pub fn host_type<T>(mut self, ty: HostType<T>) -> Self {
        let HostType { name, methods, .. } = ty;
        self.members.extend(
            methods
                .into_iter()
                .map(|(method, func)| (format!("{name}.{method}"), HostMember::Function(func))),
        );
        self
    }

    /// Names of all exported members, without the package prefix
    pub fn member_names(&self) -> impl Iterator<Item = &str> {
        self.members.iter().map(|(name, _)| name.as_str())
    }

    /// Bind every member into `env` under `base.member`.
    pub fn bind_into(&self, env: &Env) {
        let base = self.base_name();
        for (name, member) in &self.members {
            let qualified = format!("{base}.{name}");
            let value = match member {
                HostMember::Value(value) => value.clone(),
                HostMember::Function(func) => Expr::Builtin(Builtin::new(&qualified, func.clone())),
            };
            env.define_local(qualified, value);
        }
    }
}

impl std::fmt::Debug for HostPackage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostPackage")
            .field("path", &self.path)
            .field("members", &self.members.len())
            .finish()
    }
}

/// Methods of one host type.
///
/// Receivers are the first argument. `method` accepts handles created with
/// either [`NativeHandle::new`] or [`NativeHandle::shared`]; `method_mut`
/// needs a shared handle.
pub struct HostType<T> {
    name: String,
    methods: Vec<(String, Arc<OperationFn>)>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Any + Send + Sync> HostType<T> {
    pub fn new(name: impl Into<String>) -> Self {
        HostType {
            name: name.into(),
            methods: Vec::new(),
            _marker: PhantomData,
        }
    }

    pub fn method<Args, F>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: IntoMethod<T, Args>,
    {
        self.methods.push((name.into(), func.into_method()));
        self
    }

    pub fn method_mut<Args, F>(mut self, name: impl Into<String>, func: F) -> Self
    where
        F: IntoMutMethod<T, Args>,
    {
        self.methods.push((name.into(), func.into_mut_method()));
        self
    }
}

/// Packages available to `import`, keyed by path. Cloning shares the
/// registry.
#[derive(Clone, Default)]
pub struct PackageRegistry(Arc<RwLock<HashMap<String, Arc<HostPackage>>>>);

impl PackageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a package, replacing any package with the same path.
    pub fn register(&self, package: HostPackage) {
        tracing::debug!(path = package.path(), "registered host package");
        self.0
            .write()
            .insert(package.path.clone(), Arc::new(package));
    }

    pub fn get(&self, path: &str) -> Option<Arc<HostPackage>> {
        self.0.read().get(path).cloned()
    }

    /// The `import` builtin bound to this registry: `(import "path")` binds
    /// the package's members in the caller's scope and returns nil.
    pub fn import_operation(&self) -> Arc<OperationFn> {
        let registry = self.clone();
        operation(move |ctx, args| {
            let path = match args.as_slice() {
                [Expr::Text(path)] => path,
                [other] => {
                    return Err(Error::TypeError(format!(
                        "import requires a package path, got {other}"
                    )));
                }
                _ => return Err(Error::arity_error(Arity::Exact(1), args.len())),
            };
            let package = registry
                .get(path)
                .ok_or_else(|| Error::HostMemberNotFound(format!("package {path}")))?;
            package.bind_into(ctx.env);
            tracing::debug!(path = %path, base = package.base_name(), "imported host package");
            Ok(Expr::Nil)
        })
    }
}
