//! Bootstrap library, written in the language itself.
//!
//! [`crate::Interpreter`] evaluates this source against the root
//! environment before any user input when
//! [`crate::InterpreterConfig::load_prelude`] is set.

pub const PRELUDE: &str = r#"
; Truth values
(define true 1)
(define false nil)

(define null? (lambda (x) (equal? x nil)))

(define identity (lambda (x) x))

; Number of elements of a proper list
(define len
  (lambda (l)
    (if (null? l)
        0
        (+ 1 (len (cdr l))))))

(define map
  (lambda (f l)
    (if (null? l)
        nil
        (cons (f (car l)) (map f (cdr l))))))

(define filter
  (lambda (keep? l)
    (if (null? l)
        nil
        (if (keep? (car l))
            (cons (car l) (filter keep? (cdr l)))
            (filter keep? (cdr l))))))

(defmacro when (c body) (if c body nil))
(defmacro unless (c body) (if c nil body))
"#;
