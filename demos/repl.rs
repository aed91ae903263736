use kakapo::ast::Expr;
use kakapo::{Error, HostPackage, Interpreter, ParseErrorKind};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::process;
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let interp = match Interpreter::new() {
        Ok(interp) => interp,
        Err(e) => {
            eprintln!("Failed to start interpreter: {e}");
            process::exit(1);
        }
    };
    interp.import_package(demo_package());

    // Files given on the command line are evaluated instead of starting the REPL
    let paths: Vec<String> = std::env::args().skip(1).collect();
    if !paths.is_empty() {
        for path in paths {
            let outcome = std::fs::read_to_string(&path)
                .map_err(|e| e.to_string())
                .and_then(|source| interp.eval_str(&source).map_err(|e| e.to_string()));
            if let Err(e) = outcome {
                eprintln!("{path}: {e}");
                process::exit(1);
            }
        }
        return;
    }

    run_repl(&interp);
}

fn demo_package() -> HostPackage {
    HostPackage::new("demo/strings")
        .function::<(&str,), _>("Upper", str::to_uppercase)
        .function::<(&str,), _>("Len", str::len)
        .function::<(&str, &str), _>("Contains", |s: &str, needle: &str| s.contains(needle))
}

fn run_repl(interp: &Interpreter) {
    println!("{} {}", kakapo::INTERPRETER_NAME, kakapo::VERSION);
    println!("Enter expressions like: (map (lambda (x) (* x x)) '(1 2 3))");
    println!("Type :help for more commands, or Ctrl+D to exit.");
    println!();

    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(e) => {
            eprintln!("Could not initialize REPL: {e}");
            process::exit(1);
        }
    };

    // Input accumulated across lines until it reads as complete
    let mut pending = String::new();

    loop {
        let prompt = if pending.is_empty() { "kakapo> " } else { "   ...> " };
        match rl.readline(prompt) {
            Ok(line) => {
                if pending.is_empty() {
                    match line.trim() {
                        "" => continue,
                        ":help" => {
                            print_help();
                            continue;
                        }
                        ":env" => {
                            print_environment(interp);
                            continue;
                        }
                        ":quit" | ":exit" => {
                            println!("Goodbye!");
                            break;
                        }
                        _ => {}
                    }
                }

                pending.push_str(&line);
                pending.push('\n');

                match interp.eval_str(&pending) {
                    Err(Error::ParseError(e)) if e.kind == ParseErrorKind::Incomplete => continue,
                    Ok(result) => println!("{result}"),
                    Err(e) => println!("Error: {e}"),
                }

                let _ = rl.add_history_entry(pending.trim_end());
                pending.clear();
            }

            Err(ReadlineError::Interrupted) => {
                // Ctrl+C abandons a partial expression
                pending.clear();
            }
            Err(ReadlineError::Eof) => {
                println!("Goodbye!");
                break;
            }
            Err(err) => {
                println!("Error: {err:?}");
                break;
            }
        }
    }
}

fn print_help() {
    println!("Commands:");
    println!("  :help      - Show this help message");
    println!("  :env       - Show current environment bindings");
    println!("  :quit      - Exit the interpreter");
    println!("  :exit      - Exit the interpreter");
    println!("  Ctrl+C     - Discard the current input");
    println!("  Ctrl+D     - Exit the interpreter");
    println!();
    println!("Special forms: quote if for lambda let define begin defmacro macroexpand-1 spawn go");
    println!("Prelude: true false null? identity len map filter when unless");
    println!();
    println!("Examples:");
    println!("  (define square (lambda (x) (* x x)))");
    println!("  (defmacro swap (a b) (list b a))");
    println!("  (macroexpand-1 '(swap 1 2))");
    println!("  (let ((c (make-chan))) (spawn (send c (square 12))) (recv c))");
    println!("  (recover (lambda () (raise 'oops)) (lambda (e) e))");
    println!("  (import \"demo/strings\") (strings.Upper \"kakapo\")");
    println!();
}

fn print_environment(interp: &Interpreter) {
    let bindings = interp.root().get_all_bindings();

    // Separate callables provided by the interpreter from values
    let mut callables = Vec::new();
    let mut values = Vec::new();

    for (name, value) in bindings {
        match value {
            Expr::Builtin(_) | Expr::SpecialForm(_) => callables.push(name),
            _ => values.push((name, value)),
        }
    }

    if !callables.is_empty() {
        println!("Builtins and special forms ({}):", callables.len());
        let mut col = 0;
        for name in callables {
            print!("  {name:<15}");
            col += 1;
            if col % 4 == 0 {
                println!();
            }
        }
        if col % 4 != 0 {
            println!();
        }
        println!();
    }

    if !values.is_empty() {
        println!("Values ({}):", values.len());
        for (name, value) in values {
            println!("  {name} = {value}");
        }
    }
}
