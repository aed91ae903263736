//! Embedding facade.
//!
//! An [`Interpreter`] owns a root environment holding the special forms,
//! the builtins and `import`, together with the registry of host packages
//! that `import` can see.
//!
//! ```
//! use kakapo::{HostPackage, Interpreter};
//!
//! fn check(n: i32, s: &str) -> bool {
//!     usize::try_from(n).is_ok_and(|n| n == s.len())
//! }
//!
//! let interp = Interpreter::new()?;
//! interp.import_package(HostPackage::new("strings").function::<(i32, &str), _>("Check", check));
//! interp.expose_global("answer", 42);
//!
//! let result = interp.eval_str(r#"(import "strings") (strings.Check answer "abc")"#)?;
//! assert!(result.is_nil());
//! assert_eq!(interp.eval_str("(len (map identity '(1 2 3)))")?.to_string(), "3");
//! # Ok::<(), kakapo::Error>(())
//! ```

use crate::ast::{Builtin, Expr};
use crate::environment::Env;
use crate::evaluator::{create_global_env, eval, on_eval_stack};
use crate::interop::{HostPackage, PackageRegistry};
use crate::prelude::PRELUDE;
use crate::{Error, INTERPRETER_NAME, VERSION};

#[cfg(feature = "reader")]
use crate::reader::{ParseConfig, parse_program_with_config};

/// Interpreter construction options
#[derive(Debug, Clone)]
pub struct InterpreterConfig {
    /// Evaluate the bootstrap library ([`crate::prelude::PRELUDE`])
    pub load_prelude: bool,
    /// Additional source evaluated after the prelude
    pub extra_bootstrap: Option<String>,
    /// Reader options used for bootstrap source and [`Interpreter::eval_str`]
    #[cfg(feature = "reader")]
    pub parse: ParseConfig,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        InterpreterConfig {
            load_prelude: cfg!(feature = "reader"),
            extra_bootstrap: None,
            #[cfg(feature = "reader")]
            parse: ParseConfig::default(),
        }
    }
}

/// A root environment plus the host packages available to it.
///
/// Cloning shares both, so a clone can be moved to another thread and
/// evaluate against the same definitions.
#[derive(Clone)]
pub struct Interpreter {
    root: Env,
    packages: PackageRegistry,
    #[cfg(feature = "reader")]
    parse: ParseConfig,
}

impl Interpreter {
    /// Create an interpreter with the default configuration
    pub fn new() -> Result<Self, Error> {
        Self::with_config(InterpreterConfig::default())
    }

    pub fn with_config(config: InterpreterConfig) -> Result<Self, Error> {
        let root = create_global_env();
        let packages = PackageRegistry::new();
        root.define_local(
            "import",
            Expr::Builtin(Builtin::new("import", packages.import_operation())),
        );

        let interp = Interpreter {
            root,
            packages,
            #[cfg(feature = "reader")]
            parse: config.parse,
        };
        interp.expose_global("-interpreter", INTERPRETER_NAME);
        interp.expose_global("-interpreter-version", VERSION);

        if config.load_prelude {
            interp.bootstrap("prelude", PRELUDE)?;
        }
        if let Some(source) = &config.extra_bootstrap {
            interp.bootstrap("extra", source)?;
        }
        Ok(interp)
    }

    #[cfg(feature = "reader")]
    fn bootstrap(&self, name: &str, source: &str) -> Result<(), Error> {
        let exprs = parse_program_with_config(source, self.parse)?;
        on_eval_stack(|| exprs.iter().try_for_each(|expr| self.evaluate(expr).map(drop)))?;
        tracing::debug!(source = name, expressions = exprs.len(), "loaded bootstrap source");
        Ok(())
    }

    #[cfg(not(feature = "reader"))]
    fn bootstrap(&self, name: &str, _source: &str) -> Result<(), Error> {
        Err(Error::EvalError(format!(
            "cannot load {name} bootstrap source without the reader feature"
        )))
    }

    /// The root environment
    pub fn root(&self) -> &Env {
        &self.root
    }

    pub fn packages(&self) -> &PackageRegistry {
        &self.packages
    }

    /// Evaluate one expression against the root environment.
    ///
    /// Evaluation runs on its own large stack, so this is safe to call from
    /// any thread.
    pub fn evaluate(&self, expr: &Expr) -> Result<Expr, Error> {
        eval(expr, &self.root)
    }

    /// Read and evaluate every expression in `source`, returning the value
    /// of the last one (nil for empty source).
    #[cfg(feature = "reader")]
    pub fn eval_str(&self, source: &str) -> Result<Expr, Error> {
        let exprs = parse_program_with_config(source, self.parse)?;
        on_eval_stack(|| {
            exprs
                .iter()
                .try_fold(Expr::Nil, |_, expr| self.evaluate(expr))
        })
    }

    /// Make a host package available to `(import "path")`
    pub fn import_package(&self, package: HostPackage) {
        self.packages.register(package);
    }

    /// Bind a host value in the root environment
    pub fn expose_global(&self, name: &str, value: impl Into<Expr>) {
        self.root.define_local(name, value.into());
    }
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter").field("root", &self.root).finish()
    }
}

#[cfg(all(test, feature = "reader"))]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::ast::{list, sym, val};

    #[test]
    fn test_identity_globals() {
        let interp = Interpreter::new().unwrap();
        assert_eq!(interp.eval_str("-interpreter").unwrap(), val("Kakapo"));
        assert_eq!(interp.eval_str("-interpreter-version").unwrap(), val(VERSION));
    }

    #[test]
    fn test_prelude() {
        let interp = Interpreter::new().unwrap();
        let cases: Vec<(&str, Expr)> = vec![
            ("true", val(1)),
            ("false", Expr::Nil),
            ("(null? nil)", val(true)),
            ("(null? '(1))", val(false)),
            ("(identity 'x)", sym("x")),
            ("(len nil)", val(0)),
            ("(len '(1 2 3))", val(3)),
            ("(map (lambda (x) (* x x)) '(1 2 3))", list(vec![val(1), val(4), val(9)])),
            ("(map car nil)", Expr::Nil),
            ("(filter (lambda (x) (> x 1)) '(1 2 3))", list(vec![val(2), val(3)])),
            ("(when (< 1 2) 'yes)", sym("yes")),
            ("(when nil 'yes)", Expr::Nil),
            ("(unless nil 'no)", sym("no")),
        ];
        for (input, expected) in cases {
            assert_eq!(interp.eval_str(input).unwrap(), expected, "{input}");
        }
    }

    #[test]
    fn test_configuration() {
        let bare = Interpreter::with_config(InterpreterConfig {
            load_prelude: false,
            ..InterpreterConfig::default()
        })
        .unwrap();
        assert!(matches!(bare.eval_str("(len nil)"), Err(Error::UnboundSymbol(_))));
        // Builtins and identity globals do not depend on the prelude
        assert_eq!(bare.eval_str("(+ 1 2)").unwrap(), val(3));
        assert_eq!(bare.eval_str("-interpreter").unwrap(), val("Kakapo"));

        let extended = Interpreter::with_config(InterpreterConfig {
            extra_bootstrap: Some("(define twice (lambda (x) (* 2 x)))".to_owned()),
            ..InterpreterConfig::default()
        })
        .unwrap();
        assert_eq!(extended.eval_str("(twice (len '(a b)))").unwrap(), val(4));

        let broken = Interpreter::with_config(InterpreterConfig {
            extra_bootstrap: Some("(undefined-function)".to_owned()),
            ..InterpreterConfig::default()
        });
        assert!(matches!(broken, Err(Error::UnboundSymbol(_))));

        let no_comments = Interpreter::with_config(InterpreterConfig {
            load_prelude: false,
            parse: ParseConfig {
                handle_comments: false,
            },
            ..InterpreterConfig::default()
        })
        .unwrap();
        assert!(matches!(no_comments.eval_str("; note"), Err(Error::ParseError(_))));
    }

    #[test]
    fn test_eval_str_sequences() {
        let interp = Interpreter::new().unwrap();
        assert_eq!(interp.eval_str("").unwrap(), Expr::Nil);
        assert_eq!(interp.eval_str("(define a 2) (define b 3) (* a b)").unwrap(), val(6));
        // Definitions persist across calls
        assert_eq!(interp.eval_str("(+ a b)").unwrap(), val(5));
        // A failure stops the sequence
        assert!(interp.eval_str("(define c 1) (car nil) (define c 2)").is_err());
        assert_eq!(interp.eval_str("c").unwrap(), val(1));
    }

    #[test]
    fn test_import_and_expose() {
        let interp = Interpreter::new().unwrap();
        interp.expose_global("limit", 10);
        interp.import_package(
            HostPackage::new("example.com/units")
                .value("Meter", 1)
                .value("Kilometer", 1000)
                .function::<(f64, f64), _>("Scale", |n: f64, unit: f64| n * unit),
        );

        assert!(interp.eval_str("units.Meter").is_err());
        assert_eq!(interp.eval_str("(import \"example.com/units\")").unwrap(), Expr::Nil);
        assert_eq!(interp.eval_str("(units.Scale 3 units.Kilometer)").unwrap(), val(3000));
        assert_eq!(interp.eval_str("(< units.Meter limit)").unwrap(), val(true));

        // Imports inside a function body stay local to the call
        let scoped = Interpreter::new().unwrap();
        scoped.import_package(HostPackage::new("pkg").value("X", 1));
        assert_eq!(
            scoped.eval_str("((lambda () (begin (import \"pkg\") pkg.X)))").unwrap(),
            val(1)
        );
        assert!(scoped.eval_str("pkg.X").is_err());
    }
}
