//! Substitution macros.
//!
//! A macro call is expanded by copying the macro body and replacing every
//! symbol that names a formal with the matching unevaluated argument
//! expression. Nothing is renamed, so identifiers introduced by the body can
//! capture or be captured by the caller's expressions.
//!
//! Bodies are pre-expanded once when `defmacro` runs: nested calls to macros
//! that are already defined are expanded in place, with each formal bound to
//! itself so that a formal shadowing a macro name stays untouched. Names
//! bound inside the body by `lambda`, `let` or a nested `defmacro` shadow
//! macros the same way, and the binding positions themselves are never
//! expanded. Quoted forms are left alone.

use std::collections::HashMap;
use std::sync::Arc;

use crate::Error;
use crate::MAX_EVAL_DEPTH;
use crate::ast::{Expr, Macro, flatten, list, unflatten_with_tail};
use crate::environment::Env;
use crate::evaluator::{Arity, eval_with_depth_tracking};

/// Expand a macro call once against its unevaluated arguments.
pub fn expand(mac: &Macro, args: &[Expr]) -> Result<Expr, Error> {
    if args.len() != mac.formals.len() {
        return Err(Error::MacroArityMismatch {
            name: mac.name.clone(),
            expected: mac.formals.len(),
            got: args.len(),
        });
    }

    // All formals are replaced in a single pass, so an argument that
    // mentions another formal's name is not substituted again.
    let bindings: HashMap<&str, &Expr> = mac
        .formals
        .iter()
        .map(String::as_str)
        .zip(args.iter())
        .collect();

    Ok(substitute(&mac.body, &bindings))
}

/// Structural copy of `expr` with bound symbols replaced
fn substitute(expr: &Expr, bindings: &HashMap<&str, &Expr>) -> Expr {
    match expr {
        Expr::Symbol(name) => match bindings.get(name.as_str()) {
            Some(replacement) => (*replacement).clone(),
            None => expr.clone(),
        },
        Expr::Pair(cell) => Expr::cons(
            substitute(&cell.first, bindings),
            substitute(&cell.rest, bindings),
        ),
        _ => expr.clone(),
    }
}

fn formal_names(formals: &Expr) -> Result<Vec<String>, Error> {
    let items = flatten(formals).map_err(|_| {
        Error::InvalidParameterSpec(format!("macro formals must be a list, got {formals}"))
    })?;

    let mut names: Vec<String> = Vec::with_capacity(items.len());
    for item in &items {
        match item {
            Expr::Symbol(name) if names.contains(name) => {
                return Err(Error::InvalidParameterSpec(format!(
                    "duplicate parameter name: {name}"
                )));
            }
            Expr::Symbol(name) => names.push(name.clone()),
            other => {
                return Err(Error::InvalidParameterSpec(format!(
                    "macro formals must be symbols, got {other}"
                )));
            }
        }
    }
    Ok(names)
}

/// Resolve the head of a form to a macro, if it names one
fn macro_at_head(form: &Expr, scope: &Env) -> Option<Arc<Macro>> {
    let Expr::Pair(cell) = form else {
        return None;
    };
    match scope.get(cell.first.as_symbol()?) {
        Some(Expr::Macro(mac)) => Some(mac),
        _ => None,
    }
}

/// Id of the special form the head of a form resolves to
fn special_form_at_head(form: &Expr, scope: &Env) -> Option<&'static str> {
    let Expr::Pair(cell) = form else {
        return None;
    };
    match scope.get(cell.first.as_symbol()?) {
        Some(Expr::SpecialForm(op)) => Some(op.id),
        _ => None,
    }
}

/// Elements of a (possibly improper) list and its final tail
fn spine(expr: &Expr) -> (Vec<&Expr>, &Expr) {
    let mut items = Vec::new();
    let mut current = expr;
    while let Expr::Pair(cell) = current {
        items.push(&cell.first);
        current = &cell.rest;
    }
    (items, current)
}

/// Symbols bound by a parameter specification, dotted tail included
fn param_names(params: &Expr) -> Vec<String> {
    let (items, tail) = spine(params);
    items
        .into_iter()
        .chain(std::iter::once(tail))
        .filter_map(Expr::as_symbol)
        .map(str::to_owned)
        .collect()
}

/// Child of `scope` in which each name stands for itself
fn shadowing(scope: &Env, names: Vec<String>) -> Env {
    let inner = scope.child();
    for name in names {
        inner.define_local(name.as_str(), Expr::Symbol(name.clone()));
    }
    inner
}

/// Expand every macro call reachable from `expr` without evaluating
/// anything.
fn pre_expand(expr: &Expr, scope: &Env, depth: usize) -> Result<Expr, Error> {
    if depth >= MAX_EVAL_DEPTH {
        return Err(Error::EvalError(format!(
            "Macro expansion depth limit exceeded (max: {MAX_EVAL_DEPTH})"
        )));
    }
    if !matches!(expr, Expr::Pair(_)) {
        return Ok(expr.clone());
    }

    match special_form_at_head(expr, scope) {
        Some("quote") => return Ok(expr.clone()),
        Some("lambda") => return pre_expand_binder(expr, 1, scope, depth),
        Some("defmacro") => return pre_expand_binder(expr, 2, scope, depth),
        Some("let") => return pre_expand_let(expr, scope, depth),
        _ => {}
    }

    if let Some(mac) = macro_at_head(expr, scope)
        && let Expr::Pair(cell) = expr
    {
        let args = flatten(&cell.rest)?;
        let expansion = expand(&mac, &args)?;
        return pre_expand(&expansion, scope, depth + 1);
    }

    // Walk the spine so that only forms, never bare symbols, are expanded
    let (items, tail) = spine(expr);
    let items = items
        .into_iter()
        .map(|item| pre_expand(item, scope, depth + 1))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(unflatten_with_tail(items, tail.clone()))
}

/// `(lambda params body)` or `(defmacro name formals body)`: everything up
/// to the parameter list is kept as written.
fn pre_expand_binder(expr: &Expr, params_at: usize, scope: &Env, depth: usize) -> Result<Expr, Error> {
    let (items, tail) = spine(expr);
    let Some(params) = items.get(params_at) else {
        return Ok(expr.clone());
    };
    let inner = shadowing(scope, param_names(params));

    let mut rewritten = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        if i <= params_at {
            rewritten.push((*item).clone());
        } else {
            rewritten.push(pre_expand(item, &inner, depth + 1)?);
        }
    }
    Ok(unflatten_with_tail(rewritten, tail.clone()))
}

/// `(let ((name value) ...) body ...)`: values are expanded in the enclosing
/// scope, the body with the bound names shadowing macros.
fn pre_expand_let(expr: &Expr, scope: &Env, depth: usize) -> Result<Expr, Error> {
    let (items, tail) = spine(expr);
    let Some((head, rest)) = items.split_first() else {
        return Ok(expr.clone());
    };
    let Some((clauses, body)) = rest.split_first() else {
        return Ok(expr.clone());
    };

    let (clause_items, clause_tail) = spine(clauses);
    let mut names = Vec::with_capacity(clause_items.len());
    let mut clauses_out = Vec::with_capacity(clause_items.len());
    for clause in clause_items {
        let (parts, end) = spine(clause);
        match (parts.as_slice(), end) {
            ([Expr::Symbol(name), value], Expr::Nil) => {
                names.push(name.clone());
                clauses_out.push(list(vec![
                    Expr::Symbol(name.clone()),
                    pre_expand(value, scope, depth + 1)?,
                ]));
            }
            // Malformed clauses are reported when the let is evaluated
            _ => clauses_out.push(clause.clone()),
        }
    }

    let inner = shadowing(scope, names);
    let mut rewritten = vec![(*head).clone(), unflatten_with_tail(clauses_out, clause_tail.clone())];
    for form in body {
        rewritten.push(pre_expand(form, &inner, depth + 1)?);
    }
    Ok(unflatten_with_tail(rewritten, tail.clone()))
}

/// Evaluate defmacro special form: `(defmacro name (formal ...) body)`
pub(crate) fn eval_defmacro(args: &[Expr], env: &Env, depth: usize) -> Result<Expr, Error> {
    let [name, formals, body] = args else {
        return Err(Error::arity_error(Arity::Exact(3), args.len()));
    };
    let Expr::Symbol(name) = name else {
        return Err(Error::TypeError(format!(
            "defmacro requires a symbol name, got {name}"
        )));
    };
    let formals = formal_names(formals)?;

    let placeholder = env.child();
    for formal in &formals {
        placeholder.define_local(formal.as_str(), Expr::Symbol(formal.clone()));
    }
    let body = pre_expand(body, &placeholder, depth + 1)?;

    tracing::debug!(macro_name = %name, formals = formals.len(), %body, "defined macro");
    env.define_hoisted(
        name.as_str(),
        Expr::Macro(Arc::new(Macro {
            name: name.clone(),
            formals,
            body,
        })),
    );
    Ok(Expr::Nil)
}

/// Evaluate macroexpand-1 special form: expand a quoted macro call once
/// without evaluating the result.
pub(crate) fn eval_macroexpand_1(args: &[Expr], env: &Env, depth: usize) -> Result<Expr, Error> {
    let [operand] = args else {
        return Err(Error::arity_error(Arity::Exact(1), args.len()));
    };

    let form = eval_with_depth_tracking(operand, env, depth + 1)?;
    let Expr::Pair(cell) = &form else {
        return Err(Error::NotAMacro(format!("{form} is not a macro call")));
    };

    let mac = match eval_with_depth_tracking(&cell.first, env, depth + 1) {
        Ok(Expr::Macro(mac)) => mac,
        Ok(other) => return Err(Error::NotAMacro(other.to_string())),
        Err(Error::UnboundSymbol(name)) => return Err(Error::NotAMacro(name)),
        Err(err) => return Err(err),
    };

    expand(&mac, &flatten(&cell.rest)?)
}
