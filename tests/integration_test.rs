#![cfg(feature = "reader")]
#![expect(clippy::unwrap_used)] // test code OK

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_channel::RecvTimeoutError;
use kakapo::ast::{Expr, list, sym, val};
use kakapo::concurrency::Channel;
use kakapo::{Error, HostPackage, HostType, Interpreter, NativeHandle};

fn channel(interp: &Interpreter, name: &str) -> Channel {
    match interp.root().lookup(name).unwrap() {
        Expr::Native(handle) => handle.downcast_ref::<Channel>().unwrap().clone(),
        other => panic!("{name} is not a channel: {other}"),
    }
}

#[test]
fn evaluates_programs_through_the_public_api() {
    let interp = Interpreter::new().unwrap();
    let cases: Vec<(&str, Expr)> = vec![
        ("(quote (undefined symbols (stay put)))", list(vec![
            sym("undefined"),
            sym("symbols"),
            list(vec![sym("stay"), sym("put")]),
        ])),
        ("(let ((a 1) (b 2)) (+ a b))", val(3)),
        ("((lambda (a . rest) rest) 1 2 3)", list(vec![val(2), val(3)])),
        ("(define fact (lambda (n) (if (<= n 1) 1 (* n (fact (- n 1))))))", Expr::Nil),
        ("(fact 10)", val(3_628_800)),
        ("(defmacro m (x) (+ x x))", Expr::Nil),
        ("(macroexpand-1 '(m 5))", list(vec![sym("+"), val(5), val(5)])),
        ("(m 5)", val(10)),
        ("(begin (define i 0) (for (< i 5) (define i (+ i 1))))", Expr::Nil),
        ("i", val(5)),
    ];
    for (input, expected) in cases {
        assert_eq!(interp.eval_str(input).unwrap(), expected, "{input}");
    }

    assert!(matches!(
        interp.eval_str("((lambda (a b) a) 1)"),
        Err(Error::ArityMismatch { .. })
    ));
    assert!(matches!(interp.eval_str("(1 2)"), Err(Error::NotCallable(_))));
    assert!(matches!(interp.eval_str("(let ((1 2)) 1)"), Err(Error::InvalidBinding(_))));
}

#[test]
fn redefinition_is_visible_to_existing_closures() {
    // `define` at top level overwrites the single root binding the closure
    // looks up when called
    let interp = Interpreter::new().unwrap();
    let result = interp
        .eval_str("(begin (define x 1) (define f (lambda () x)) (define x 2) (f))")
        .unwrap();
    assert_eq!(result, val(2));

    // A parameter shadows the outer binding for the closure's lifetime
    let result = interp
        .eval_str("(begin (define make (lambda (x) (lambda () x))) (define g (make 1)) (define x 3) (g))")
        .unwrap();
    assert_eq!(result, val(1));
}

#[test]
fn runaway_recursion_fails_on_an_ordinary_thread() {
    // A default spawned thread has a small stack; evaluation must still
    // report the recursion instead of overflowing it
    let handle = std::thread::spawn(|| {
        let interp = Interpreter::new().unwrap();
        interp
            .eval_str("(define deep (lambda (n) (if (= n 0) 0 (+ 1 (deep (- n 1))))))")
            .unwrap();
        let outcome = interp.eval_str("(deep 100000)");
        let after = interp.eval_str("(deep 50)");
        (outcome, after)
    });
    let (outcome, after) = handle.join().unwrap();
    assert!(matches!(outcome, Err(Error::EvalError(msg)) if msg.contains("depth")));
    assert_eq!(after.unwrap(), val(50));
}

#[test]
fn prelude_handles_long_lists() {
    let interp = Interpreter::new().unwrap();
    interp
        .eval_str("(define build (lambda (n acc) (if (= n 0) acc (build (- n 1) (cons n acc)))))")
        .unwrap();
    assert_eq!(interp.eval_str("(len (build 1000 nil))").unwrap(), val(1000));
    assert_eq!(
        interp.eval_str("(len (map (lambda (x) (* x 2)) (build 1000 nil)))").unwrap(),
        val(1000)
    );
}

#[test]
fn if_only_evaluates_the_taken_branch() {
    let touched = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&touched);

    let interp = Interpreter::new().unwrap();
    interp.import_package(HostPackage::new("side").function::<(), _>("Touch", move || {
        counter.fetch_add(1, Ordering::SeqCst);
    }));
    interp.eval_str("(import \"side\")").unwrap();

    assert_eq!(interp.eval_str("(if nil (side.Touch) 'b)").unwrap(), sym("b"));
    assert_eq!(interp.eval_str("(if 0 'a (side.Touch))").unwrap(), sym("a"));
    assert_eq!(touched.load(Ordering::SeqCst), 0);

    assert_eq!(interp.eval_str("(if 1 (side.Touch))").unwrap(), Expr::Nil);
    assert_eq!(touched.load(Ordering::SeqCst), 1);
}

#[test]
fn host_function_round_trip() {
    fn check(n: i32, s: &str) -> bool {
        usize::try_from(n).is_ok_and(|n| n == s.len())
    }

    let interp = Interpreter::new().unwrap();
    interp.import_package(HostPackage::new("github.com/example/strutil").function::<(i32, &str), _>("Check", check));
    interp.eval_str("(import \"github.com/example/strutil\")").unwrap();

    assert_eq!(interp.eval_str("(strutil.Check 3 \"abc\")").unwrap(), val(1));
    assert_eq!(interp.eval_str("(strutil.Check 4 \"abc\")").unwrap(), Expr::Nil);
    assert!(matches!(
        interp.eval_str("(strutil.Check \"3\" \"abc\")"),
        Err(Error::InvalidHostArgument(_))
    ));
    assert!(matches!(
        interp.eval_str("(strutil.Check 1e10 \"abc\")"),
        Err(Error::InvalidHostArgument(_))
    ));
    assert!(matches!(
        interp.eval_str("(import \"github.com/example/missing\")"),
        Err(Error::HostMemberNotFound(_))
    ));
}

#[test]
fn host_methods_and_opaque_values() {
    #[derive(Default)]
    struct Stack(Vec<String>);

    impl Stack {
        fn push(&mut self, item: &str) {
            self.0.push(item.to_owned());
        }
        fn pop(&mut self) -> Option<String> {
            self.0.pop()
        }
        fn depth(&self) -> usize {
            self.0.len()
        }
    }

    let interp = Interpreter::new().unwrap();
    interp.import_package(
        HostPackage::new("coll")
            .function::<(), _>("NewStack", || NativeHandle::shared(Stack::default()))
            .host_type(
                HostType::<Stack>::new("Stack")
                    .method_mut::<(&str,), _>("Push", Stack::push)
                    .method_mut::<(), _>("Pop", Stack::pop)
                    .method::<(), _>("Depth", Stack::depth),
            ),
    );

    let program = r#"
        (import "coll")
        (define s (coll.NewStack))
        (coll.Stack.Push s "a")
        (coll.Stack.Push s "b")
        (list (coll.Stack.Pop s) (coll.Stack.Depth s) (coll.Stack.Pop s) (coll.Stack.Pop s))
    "#;
    assert_eq!(
        interp.eval_str(program).unwrap(),
        list(vec![val("b"), val(1), val("a"), Expr::Nil])
    );
    // Handles are opaque to arithmetic
    assert!(matches!(interp.eval_str("(+ s 1)"), Err(Error::TypeError(_))));
    assert_eq!(interp.eval_str("(equal? s s)").unwrap(), val(true));
}

#[test]
fn recover_intercepts_failures() {
    let interp = Interpreter::new().unwrap();
    let cases: Vec<(&str, Expr)> = vec![
        ("(recover (lambda () (raise '(code 7))) (lambda (e) (car (cdr e))))", val(7)),
        ("(recover (lambda () (+ 1 \"a\")) (lambda (e) 'type-error))", sym("type-error")),
        ("(recover (lambda () (undefined)) (lambda (e) e))", val("Unbound symbol: undefined")),
        ("(recover (lambda () 'fine) (lambda (e) 'unused))", sym("fine")),
    ];
    for (input, expected) in cases {
        assert_eq!(interp.eval_str(input).unwrap(), expected, "{input}");
    }

    match interp.eval_str("(raise 'boom)") {
        Err(Error::Raised(value)) => assert_eq!(value, sym("boom")),
        other => panic!("expected a raised value, got {other:?}"),
    }
}

#[test]
fn receive_blocks_until_a_send_occurs() {
    let interp = Interpreter::new().unwrap();
    interp
        .eval_str("(define gate (make-chan)) (define out (make-chan))")
        .unwrap();
    // The spawned evaluation cannot send before it is let through the gate
    interp
        .eval_str("(spawn (begin (recv gate) (send out (list 'done (* 6 7)))))")
        .unwrap();

    let gate = channel(&interp, "gate");
    let out = channel(&interp, "out");

    assert_eq!(
        out.recv_timeout(Duration::from_millis(50)),
        Err(RecvTimeoutError::Timeout)
    );
    gate.send(val(1)).unwrap();
    assert_eq!(
        out.recv_timeout(Duration::from_secs(5)).unwrap(),
        list(vec![sym("done"), val(42)])
    );
}

#[test]
fn spawned_evaluations_exchange_values() {
    let interp = Interpreter::new().unwrap();
    let program = r#"
        (define c (make-chan))
        (define producer
          (lambda (n)
            (begin
              (define i 0)
              (for (< i n)
                (begin (send c i) (define i (+ i 1))))
              (send c 'end))))
        (go (producer 3))
    "#;
    interp.eval_str(program).unwrap();

    let c = channel(&interp, "c");
    let received: Vec<Expr> = (0..4)
        .map(|_| c.recv_timeout(Duration::from_secs(5)).unwrap())
        .collect();
    assert_eq!(received, vec![val(0), val(1), val(2), sym("end")]);
}

#[test]
fn interpreter_is_shareable_across_threads() {
    let interp = Interpreter::new().unwrap();
    interp.eval_str("(define c (make-chan))").unwrap();

    let worker = interp.clone();
    let handle = std::thread::spawn(move || worker.eval_str("(recv c)").unwrap());
    interp.eval_str("(send c \"from main\")").unwrap();

    assert_eq!(handle.join().unwrap(), val("from main"));
}
