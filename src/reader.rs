//! S-expression reader.
//!
//! Turns program text into [`Expr`] trees. Supported syntax:
//!
//! - numbers: `42`, `-5`, `+1.5`, `2.5e-3`, and `+inf.0`, `-inf.0`, `+nan.0`
//! - text: `"a \"quoted\" line\n"` with `\n \t \r \\ \"` escapes
//! - symbols: alphanumerics plus `+-*/<>=!?_$%&.:^~@`, not starting with a digit
//! - lists: `(1 2 3)`, `()` for nil, dotted tails `(a . b)`
//! - `'x` as shorthand for `(quote x)`
//! - `;` line comments (see [`ParseConfig`])

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::take_while1,
    character::complete::{char, digit0, digit1, multispace0, multispace1, not_line_ending, one_of},
    combinator::{opt, recognize, value},
    error::{Error as NomError, ErrorKind},
    multi::many0_count,
    sequence::pair,
};

use crate::ast::{Expr, NumberType, SYMBOL_SPECIAL_CHARS, is_valid_symbol, sym, unflatten, unflatten_with_tail};
use crate::{Error, MAX_PARSE_DEPTH, ParseError, ParseErrorKind};

/// Reader options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseConfig {
    /// Treat `;` up to the end of the line as whitespace
    pub handle_comments: bool,
}

impl Default for ParseConfig {
    fn default() -> Self {
        ParseConfig {
            handle_comments: true,
        }
    }
}

/// Characters that may directly follow an atom
fn is_delimiter(c: char) -> bool {
    c.is_whitespace() || matches!(c, '(' | ')' | ';' | '"' | '\'')
}

/// Once an opening token has been consumed, errors are final: turn
/// recoverable errors into failures so `alt` reports the real position.
fn commit<T>(result: IResult<&str, T>) -> IResult<&str, T> {
    result.map_err(|e| match e {
        nom::Err::Error(e) => nom::Err::Failure(e),
        other => other,
    })
}

fn error_at<T>(input: &str, kind: ErrorKind) -> IResult<&str, T> {
    Err(nom::Err::Error(NomError::new(input, kind)))
}

fn line_comment(input: &str) -> IResult<&str, &str> {
    recognize(pair(char(';'), not_line_ending)).parse(input)
}

fn skip_ws(input: &str, config: ParseConfig) -> IResult<&str, ()> {
    if config.handle_comments {
        value((), many0_count(alt((multispace1, line_comment)))).parse(input)
    } else {
        value((), multispace0).parse(input)
    }
}

/// Convert nom parsing errors to structured parse errors
fn to_parse_error(input: &str, error: nom::Err<NomError<&str>>) -> ParseError {
    match error {
        nom::Err::Error(e) | nom::Err::Failure(e) => {
            let position = input.len().saturating_sub(e.input.len());
            let (kind, message) = match e.code {
                ErrorKind::TooLarge => (
                    ParseErrorKind::TooDeeplyNested,
                    format!("Expression too deeply nested (max depth: {MAX_PARSE_DEPTH})"),
                ),
                _ if e.input.is_empty() => {
                    (ParseErrorKind::Incomplete, "Unexpected end of input".to_owned())
                }
                ErrorKind::Escaped => (
                    ParseErrorKind::InvalidSyntax,
                    format!("Unknown escape sequence at position {position}"),
                ),
                ErrorKind::Char => (
                    ParseErrorKind::InvalidSyntax,
                    format!("Expected character at position {position}"),
                ),
                _ => {
                    let near: String = e.input.chars().take(10).collect();
                    (ParseErrorKind::InvalidSyntax, format!("Invalid syntax near '{near}'"))
                }
            };
            ParseError::with_context(kind, message, input, position)
        }
        nom::Err::Incomplete(_) => {
            ParseError::from_message(ParseErrorKind::Incomplete, "Incomplete input")
        }
    }
}

/// Parse a decimal number with optional sign, fraction and exponent
fn parse_number(input: &str) -> IResult<&str, Expr> {
    let (rest, text) = recognize((
        opt(one_of("+-")),
        digit1,
        opt((char('.'), digit0)),
        opt((one_of("eE"), opt(one_of("+-")), digit1)),
    ))
    .parse(input)?;

    // `123abc` is neither a number nor a symbol
    if rest.chars().next().is_some_and(|c| !is_delimiter(c)) {
        return error_at(input, ErrorKind::Digit);
    }

    match text.parse::<NumberType>() {
        Ok(n) => Ok((rest, Expr::Number(n))),
        Err(_) => error_at(input, ErrorKind::Digit),
    }
}

/// Parse the non-finite numbers `+inf.0`, `-inf.0` and `+nan.0`
fn parse_non_finite(input: &str) -> IResult<&str, Expr> {
    let (remaining, token) =
        take_while1(|c: char| c.is_alphanumeric() || SYMBOL_SPECIAL_CHARS.contains(c)).parse(input)?;

    let n = match token {
        "+inf.0" => NumberType::INFINITY,
        "-inf.0" => NumberType::NEG_INFINITY,
        "+nan.0" => NumberType::NAN,
        _ => return error_at(input, ErrorKind::Float),
    };
    Ok((remaining, Expr::Number(n)))
}

/// Parse a symbol (identifier)
fn parse_symbol(input: &str) -> IResult<&str, Expr> {
    let (remaining, candidate) =
        take_while1(|c: char| c.is_alphanumeric() || SYMBOL_SPECIAL_CHARS.contains(c)).parse(input)?;

    if is_valid_symbol(candidate) {
        Ok((remaining, Expr::Symbol(candidate.to_owned())))
    } else {
        error_at(input, ErrorKind::Alpha)
    }
}

/// Parse a string literal
fn parse_string(input: &str) -> IResult<&str, Expr> {
    let (mut remaining, _) = char('"').parse(input)?;
    let mut text = String::new();

    loop {
        let mut chars = remaining.chars();
        match chars.next() {
            Some('"') => return Ok((chars.as_str(), Expr::Text(text))),
            Some('\\') => {
                match chars.next() {
                    Some('n') => text.push('\n'),
                    Some('t') => text.push('\t'),
                    Some('r') => text.push('\r'),
                    Some('\\') => text.push('\\'),
                    Some('"') => text.push('"'),
                    Some(_) => {
                        return Err(nom::Err::Failure(NomError::new(remaining, ErrorKind::Escaped)));
                    }
                    None => {
                        return Err(nom::Err::Failure(NomError::new(chars.as_str(), ErrorKind::Char)));
                    }
                }
                remaining = chars.as_str();
            }
            Some(ch) => {
                text.push(ch);
                remaining = chars.as_str();
            }
            // Unterminated
            None => return Err(nom::Err::Failure(NomError::new(remaining, ErrorKind::Char))),
        }
    }
}

/// Parse a list, including the empty list and dotted tails
fn parse_list(input: &str, config: ParseConfig, depth: usize) -> IResult<&str, Expr> {
    let (mut input, _) = char('(').parse(input)?;
    let mut items = Vec::new();

    loop {
        let (rest, _) = skip_ws(input, config)?;

        if let Some(rest) = rest.strip_prefix(')') {
            return Ok((rest, unflatten(items)));
        }

        if let Some(after_dot) = rest.strip_prefix('.')
            && after_dot.chars().next().is_none_or(is_delimiter)
        {
            if items.is_empty() {
                return Err(nom::Err::Failure(NomError::new(rest, ErrorKind::Verify)));
            }
            let (after_tail, tail) = commit(parse_sexpr(after_dot, config, depth + 1))?;
            let (after_tail, _) = skip_ws(after_tail, config)?;
            let (after_tail, _) = commit(char(')').parse(after_tail))?;
            return Ok((after_tail, unflatten_with_tail(items, tail)));
        }

        let (rest, item) = commit(parse_sexpr(rest, config, depth + 1))?;
        items.push(item);
        input = rest;
    }
}

/// Parse quoted expression ('expr -> (quote expr))
fn parse_quote(input: &str, config: ParseConfig, depth: usize) -> IResult<&str, Expr> {
    let (input, _) = char('\'').parse(input)?;
    let (input, quoted) = commit(parse_sexpr(input, config, depth + 1))?;
    Ok((input, unflatten(vec![sym("quote"), quoted])))
}

/// Parse one s-expression, skipping leading whitespace
fn parse_sexpr(input: &str, config: ParseConfig, depth: usize) -> IResult<&str, Expr> {
    if depth >= MAX_PARSE_DEPTH {
        return Err(nom::Err::Failure(NomError::new(input, ErrorKind::TooLarge)));
    }
    let (input, _) = skip_ws(input, config)?;
    alt((
        |input| parse_quote(input, config, depth),
        |input| parse_list(input, config, depth),
        parse_number,
        parse_string,
        parse_non_finite,
        parse_symbol,
    ))
    .parse(input)
}

/// Parse exactly one expression; only whitespace (and comments) may follow.
pub fn parse(input: &str) -> Result<Expr, Error> {
    parse_with_config(input, ParseConfig::default())
}

pub fn parse_with_config(input: &str, config: ParseConfig) -> Result<Expr, Error> {
    let (rest, expr) = parse_sexpr(input, config, 0).map_err(|e| to_parse_error(input, e))?;
    let (rest, _) = skip_ws(rest, config).map_err(|e| to_parse_error(input, e))?;
    if rest.is_empty() {
        Ok(expr)
    } else {
        let position = input.len() - rest.len();
        Err(ParseError::with_context(
            ParseErrorKind::TrailingContent,
            format!("Unexpected remaining input at position {position}"),
            input,
            position,
        )
        .into())
    }
}

/// Parse a whole program: every expression in `input`, in order.
pub fn parse_program(input: &str) -> Result<Vec<Expr>, Error> {
    parse_program_with_config(input, ParseConfig::default())
}

pub fn parse_program_with_config(input: &str, config: ParseConfig) -> Result<Vec<Expr>, Error> {
    let mut exprs = Vec::new();
    let mut remaining = input;
    loop {
        let (rest, _) = skip_ws(remaining, config).map_err(|e| to_parse_error(input, e))?;
        if rest.is_empty() {
            return Ok(exprs);
        }
        let (rest, expr) = parse_sexpr(rest, config, 0).map_err(|e| to_parse_error(input, e))?;
        exprs.push(expr);
        remaining = rest;
    }
}

#[cfg(test)]
#[expect(clippy::unwrap_used)] // test code OK
mod tests {
    use super::*;
    use crate::ast::{list, nil, val};

    /// Test result variants for data-driven parsing tests
    #[derive(Debug)]
    enum ParseTestResult {
        Success(Expr),                // Parsing should succeed with this value
        SpecificError(ParseErrorKind), // Parsing should fail with this kind
        Error,                        // Parsing should fail (any error)
    }
    use ParseTestResult::*;

    fn success<T: Into<Expr>>(value: T) -> ParseTestResult {
        Success(value.into())
    }

    fn quoted(expr: Expr) -> Expr {
        list(vec![sym("quote"), expr])
    }

    /// Run parse tests; successful results must also survive a
    /// display -> parse -> display round trip.
    fn run_parse_tests(test_cases: Vec<(&str, ParseTestResult)>) {
        for (i, (input, expected)) in test_cases.into_iter().enumerate() {
            let test_id = format!("Parse test #{} ({input:?})", i + 1);
            match (parse(input), expected) {
                (Ok(actual), Success(expected)) => {
                    assert_eq!(actual, expected, "{test_id}: value mismatch");
                    let displayed = actual.to_string();
                    let reparsed = parse(&displayed).unwrap_or_else(|e| {
                        panic!("{test_id}: round-trip parse failed for '{displayed}': {e}")
                    });
                    assert_eq!(
                        reparsed.to_string(),
                        displayed,
                        "{test_id}: round-trip display mismatch"
                    );
                }
                (Err(_), Error) => {}
                (Err(crate::Error::ParseError(err)), SpecificError(kind)) => {
                    assert_eq!(err.kind, kind, "{test_id}: wrong error kind ({err})");
                }
                (actual, expected) => {
                    panic!("{test_id}: expected {expected:?}, got {actual:?}");
                }
            }
        }
    }

    #[test]
    fn test_parser_comprehensive() {
        use ParseErrorKind::*;

        let test_cases = vec![
            // ===== NUMBERS =====
            ("42", success(42)),
            ("-5", success(-5)),
            ("+5", success(5)),
            ("0", success(0)),
            ("2.75", success(2.75)),
            ("-0.5", success(-0.5)),
            ("1.", success(1)),
            ("1e3", success(1000)),
            ("2.5E-1", success(0.25)),
            ("123abc", Error),
            ("-42name", Error),
            ("1.5.2", Error),
            ("1e", Error),
            ("+inf.0", success(f64::INFINITY)),
            ("-inf.0", success(f64::NEG_INFINITY)),
            ("inf", success(sym("inf"))),
            // ===== SYMBOLS =====
            ("foo", success(sym("foo"))),
            ("+", success(sym("+"))),
            ("-", success(sym("-"))),
            (">=", success(sym(">="))),
            ("-abc", success(sym("-abc"))),
            ("-interpreter", success(sym("-interpreter"))),
            ("list?", success(sym("list?"))),
            ("make-chan", success(sym("make-chan"))),
            ("<-", success(sym("<-"))),
            ("demo.Counter.Get", success(sym("demo.Counter.Get"))),
            ("a%b&c:d^e~f@g", success(sym("a%b&c:d^e~f@g"))),
            ("test#tag", Error),
            ("test space", SpecificError(TrailingContent)),
            // ===== STRINGS =====
            ("\"hello\"", success("hello")),
            ("\"\"", success("")),
            (r#""hello\nworld""#, success("hello\nworld")),
            (r#""tab\there""#, success("tab\there")),
            (r#""carriage\rreturn""#, success("carriage\rreturn")),
            (r#""quote\"test""#, success("quote\"test")),
            (r#""backslash\\test""#, success("backslash\\test")),
            (r#""other\xchar""#, SpecificError(InvalidSyntax)),
            (r#""unterminated"#, SpecificError(Incomplete)),
            (r#""unterminated\"#, SpecificError(Incomplete)),
            // ===== LISTS =====
            ("()", success(nil())),
            ("(  )", success(nil())),
            ("(42)", success(list(vec![val(42)]))),
            (
                "(1 hello \"world\")",
                success(list(vec![val(1), sym("hello"), val("world")])),
            ),
            (
                "(+ 1 (* 2 3))",
                success(list(vec![
                    sym("+"),
                    val(1),
                    list(vec![sym("*"), val(2), val(3)]),
                ])),
            ),
            ("(a(b))", success(list(vec![sym("a"), list(vec![sym("b")])]))),
            ("(a . b)", success(Expr::cons(sym("a"), sym("b")))),
            (
                "(1 2 . 3)",
                success(unflatten_with_tail(vec![val(1), val(2)], val(3))),
            ),
            ("(a . (b))", success(list(vec![sym("a"), sym("b")]))),
            ("(. 1)", SpecificError(InvalidSyntax)),
            ("(1 . 2 3)", SpecificError(InvalidSyntax)),
            ("(1 .)", SpecificError(InvalidSyntax)),
            ("(1 2", SpecificError(Incomplete)),
            ("(1 (2 3)", SpecificError(Incomplete)),
            (")", SpecificError(InvalidSyntax)),
            ("(1 2))", SpecificError(TrailingContent)),
            ("", SpecificError(Incomplete)),
            ("   ", SpecificError(Incomplete)),
            // ===== QUOTE =====
            ("'x", success(quoted(sym("x")))),
            ("'(1 2)", success(quoted(list(vec![val(1), val(2)])))),
            ("''a", success(quoted(quoted(sym("a"))))),
            ("'()", success(quoted(nil()))),
            ("'", SpecificError(Incomplete)),
            // ===== WHITESPACE AND COMMENTS =====
            ("  42  ", success(42)),
            ("\n(1\t2)\n", success(list(vec![val(1), val(2)]))),
            ("; leading comment\n42", success(42)),
            ("(1 ; one\n 2) ; trailing", success(list(vec![val(1), val(2)]))),
            ("1 2", SpecificError(TrailingContent)),
        ];

        run_parse_tests(test_cases);
    }

    #[test]
    fn test_non_finite_numbers_read_back() {
        // Division by zero produces values the printer must write readably
        for n in [f64::INFINITY, f64::NEG_INFINITY, f64::NAN] {
            let printed = val(n).to_string();
            match parse(&printed).unwrap() {
                Expr::Number(read) if n.is_nan() => assert!(read.is_nan(), "{printed}"),
                Expr::Number(read) => assert_eq!(read, n, "{printed}"),
                other => panic!("{printed} read back as {other:?}"),
            }
        }
        let printed = list(vec![val(f64::INFINITY), val(2)]).to_string();
        assert_eq!(parse(&printed).unwrap().to_string(), printed);
    }

    #[test]
    fn test_nesting_limit() {
        let deep = format!("{}1{}", "(".repeat(MAX_PARSE_DEPTH + 10), ")".repeat(MAX_PARSE_DEPTH + 10));
        match parse(&deep) {
            Err(crate::Error::ParseError(err)) => {
                assert_eq!(err.kind, ParseErrorKind::TooDeeplyNested);
                assert!(err.message.contains("too deeply nested"));
            }
            other => panic!("expected nesting error, got {other:?}"),
        }

        let shallow = format!("{}1{}", "(".repeat(10), ")".repeat(10));
        assert!(parse(&shallow).is_ok());
    }

    #[test]
    fn test_comment_handling_is_configurable() {
        let no_comments = ParseConfig {
            handle_comments: false,
        };
        assert_eq!(parse_with_config("42", no_comments).unwrap(), val(42));
        assert!(parse_with_config("; note\n42", no_comments).is_err());
        assert!(parse_with_config("42 ; note", no_comments).is_err());
    }

    #[test]
    fn test_error_context() {
        let Err(crate::Error::ParseError(err)) = parse("(1 2 ]") else {
            panic!("expected parse error");
        };
        assert_eq!(err.kind, ParseErrorKind::InvalidSyntax);
        assert_eq!(err.found.as_deref(), Some("]"));
        assert!(err.context.as_ref().unwrap().contains("(1 2 ]"));
        assert!(err.to_string().starts_with("ParseError: "));
    }

    #[test]
    fn test_parse_program() {
        let program = "(define a 1) ; first\n\n(+ a 1)\n'done ";
        let exprs = parse_program(program).unwrap();
        assert_eq!(
            exprs,
            vec![
                list(vec![sym("define"), sym("a"), val(1)]),
                list(vec![sym("+"), sym("a"), val(1)]),
                quoted(sym("done")),
            ]
        );

        assert!(parse_program("").unwrap().is_empty());
        assert!(parse_program("  ; only a comment").unwrap().is_empty());

        match parse_program("(define a 1) (+ a") {
            Err(crate::Error::ParseError(err)) => assert_eq!(err.kind, ParseErrorKind::Incomplete),
            other => panic!("expected incomplete input, got {other:?}"),
        }
    }
}
