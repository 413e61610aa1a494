// Copyright (C) 2025 The Forgeci Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow expression AST and evaluator.
//!
//! Covers the subset the dispatcher needs: literals, `needs.<job>.result`,
//! `needs.<job>.outputs.<key>`, `matrix.<key>`, the status functions
//! `always()`/`success()`/`failure()`/`cancelled()`, boolean combinators,
//! and `==`/`!=`. Evaluation runs against a typed frame, so a reference to
//! a job or output that does not exist is a structured error rather than a
//! silent empty string.

use std::collections::HashMap;
use std::fmt;

use crate::status::Status;

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Str(String),
    Num(f64),
    Bool(bool),
    Null,
    /// `needs.<job>.result`
    NeedsResult { job: String },
    /// `needs.<job>.outputs.<key>`
    NeedsOutput { job: String, key: String },
    /// `matrix.<key>`
    Matrix { key: String },
    Always,
    Success,
    Failure,
    Cancelled,
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Eq(Box<Expr>, Box<Expr>),
    Ne(Box<Expr>, Box<Expr>),
}

/// Evaluation result of an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Num(f64),
    Str(String),
}

impl Value {
    /// Truthiness: null, false, 0, and "" are falsy.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Num(n) => *n != 0.0,
            Value::Str(s) => !s.is_empty(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Num(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::Str(s) => write!(f, "{}", s),
        }
    }
}

/// Structured evaluation failure.
#[derive(Debug, Clone, PartialEq)]
pub enum EvalError {
    /// The expression references a `needs` job the frame does not know.
    MissingJob { job: String },
    /// The referenced job finished without emitting the output. Carries the
    /// outputs it did emit, for diagnostics.
    MissingOutput {
        job: String,
        key: String,
        available: Vec<String>,
    },
    /// `matrix.<key>` names a dimension the frame does not carry.
    MissingMatrixDimension { key: String },
    /// Lexical or syntactic error in the expression text.
    Parse { message: String },
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::MissingJob { job } => write!(f, "unknown needs job '{}'", job),
            EvalError::MissingOutput { job, key, .. } => {
                write!(f, "job '{}' did not emit output '{}'", job, key)
            }
            EvalError::MissingMatrixDimension { key } => {
                write!(f, "unknown matrix dimension '{}'", key)
            }
            EvalError::Parse { message } => write!(f, "parse error: {}", message),
        }
    }
}

/// Context an expression evaluates against.
///
/// `strict_outputs` distinguishes the two call sites: matrix and `runs-on`
/// evaluation must fail on a missing output (it becomes a pre-execution
/// error), while `if:` evaluation treats it as an empty string.
pub struct EvalFrame<'a> {
    pub needs_results: &'a HashMap<String, Status>,
    pub needs_outputs: &'a HashMap<String, HashMap<String, String>>,
    pub matrix: &'a HashMap<String, String>,
    pub run_cancelled: bool,
    pub strict_outputs: bool,
}

impl Expr {
    /// Parse the inner text of a `${{ … }}` template region.
    pub fn parse(input: &str) -> Result<Expr, EvalError> {
        let tokens = lex(input)?;
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(EvalError::Parse {
                message: format!("trailing input after expression in '{}'", input),
            });
        }
        Ok(expr)
    }

    /// Whether the expression calls any status function. An `if:` without
    /// one gets an implicit `success()` conjunct.
    pub fn references_status_fn(&self) -> bool {
        match self {
            Expr::Always | Expr::Success | Expr::Failure | Expr::Cancelled => true,
            Expr::Not(inner) => inner.references_status_fn(),
            Expr::And(a, b) | Expr::Or(a, b) | Expr::Eq(a, b) | Expr::Ne(a, b) => {
                a.references_status_fn() || b.references_status_fn()
            }
            _ => false,
        }
    }

    /// Evaluate against a frame.
    pub fn eval(&self, frame: &EvalFrame<'_>) -> Result<Value, EvalError> {
        match self {
            Expr::Str(s) => Ok(Value::Str(s.clone())),
            Expr::Num(n) => Ok(Value::Num(*n)),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Null => Ok(Value::Null),
            Expr::NeedsResult { job } => match frame.needs_results.get(job) {
                Some(status) => Ok(Value::Str(status.as_str().to_string())),
                None => Err(EvalError::MissingJob { job: job.clone() }),
            },
            Expr::NeedsOutput { job, key } => {
                if !frame.needs_results.contains_key(job) && !frame.needs_outputs.contains_key(job)
                {
                    return Err(EvalError::MissingJob { job: job.clone() });
                }
                let outputs = frame.needs_outputs.get(job);
                match outputs.and_then(|m| m.get(key)) {
                    Some(v) => Ok(Value::Str(v.clone())),
                    None if frame.strict_outputs => Err(EvalError::MissingOutput {
                        job: job.clone(),
                        key: key.clone(),
                        available: outputs
                            .map(|m| {
                                let mut names: Vec<String> = m.keys().cloned().collect();
                                names.sort_unstable();
                                names
                            })
                            .unwrap_or_default(),
                    }),
                    None => Ok(Value::Str(String::new())),
                }
            }
            Expr::Matrix { key } => match frame.matrix.get(key) {
                Some(v) => Ok(Value::Str(v.clone())),
                None => Err(EvalError::MissingMatrixDimension { key: key.clone() }),
            },
            Expr::Always => Ok(Value::Bool(true)),
            Expr::Success => Ok(Value::Bool(
                !frame.run_cancelled
                    && frame.needs_results.values().all(|s| s.is_success()),
            )),
            Expr::Failure => Ok(Value::Bool(
                frame.needs_results.values().any(|s| *s == Status::Failure),
            )),
            Expr::Cancelled => Ok(Value::Bool(frame.run_cancelled)),
            Expr::Not(inner) => Ok(Value::Bool(!inner.eval(frame)?.truthy())),
            Expr::And(a, b) => {
                let left = a.eval(frame)?;
                if !left.truthy() {
                    return Ok(left);
                }
                b.eval(frame)
            }
            Expr::Or(a, b) => {
                let left = a.eval(frame)?;
                if left.truthy() {
                    return Ok(left);
                }
                b.eval(frame)
            }
            Expr::Eq(a, b) => Ok(Value::Bool(loose_eq(&a.eval(frame)?, &b.eval(frame)?))),
            Expr::Ne(a, b) => Ok(Value::Bool(!loose_eq(&a.eval(frame)?, &b.eval(frame)?))),
        }
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Num(x), Value::Num(y)) => x == y,
        (Value::Str(x), Value::Str(y)) => x == y,
        // Number against string: compare numerically when the string parses.
        (Value::Num(x), Value::Str(s)) | (Value::Str(s), Value::Num(x)) => {
            s.parse::<f64>().map(|y| y == *x).unwrap_or(false)
        }
        _ => false,
    }
}

// ===== template interpolation =====

/// Split `input` into literal and `${{ … }}` regions.
fn template_regions(input: &str) -> Vec<(bool, &str)> {
    let mut regions = Vec::new();
    let mut rest = input;
    while let Some(start) = rest.find("${{") {
        if let Some(end) = rest[start + 3..].find("}}") {
            if start > 0 {
                regions.push((false, &rest[..start]));
            }
            regions.push((true, rest[start + 3..start + 3 + end].trim()));
            rest = &rest[start + 3 + end + 2..];
        } else {
            break;
        }
    }
    if !rest.is_empty() {
        regions.push((false, rest));
    }
    regions
}

/// Whether the string contains any template region.
pub fn is_templated(input: &str) -> bool {
    input.contains("${{")
}

/// Evaluate a possibly-templated string.
///
/// A string that is exactly one template region yields the typed value of
/// that expression; anything else interpolates each region into the
/// surrounding text.
pub fn evaluate_template(input: &str, frame: &EvalFrame<'_>) -> Result<Value, EvalError> {
    let regions = template_regions(input);
    if let [(true, inner)] = regions.as_slice() {
        return Expr::parse(inner)?.eval(frame);
    }

    let mut out = String::new();
    for (is_expr, text) in regions {
        if is_expr {
            out.push_str(&Expr::parse(text)?.eval(frame)?.to_string());
        } else {
            out.push_str(text);
        }
    }
    Ok(Value::Str(out))
}

/// Collect the `needs` job names an expression references.
pub fn referenced_needs(expr: &Expr, into: &mut Vec<String>) {
    match expr {
        Expr::NeedsResult { job } | Expr::NeedsOutput { job, .. } => {
            if !into.contains(job) {
                into.push(job.clone());
            }
        }
        Expr::Not(inner) => referenced_needs(inner, into),
        Expr::And(a, b) | Expr::Or(a, b) | Expr::Eq(a, b) | Expr::Ne(a, b) => {
            referenced_needs(a, into);
            referenced_needs(b, into);
        }
        _ => {}
    }
}

// ===== lexer / parser =====

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Str(String),
    Num(f64),
    LParen,
    RParen,
    Not,
    And,
    Or,
    Eq,
    Ne,
}

fn lex(input: &str) -> Result<Vec<Tok>, EvalError> {
    let mut tokens = Vec::new();
    let bytes = input.as_bytes();
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Tok::RParen);
                i += 1;
            }
            '!' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Tok::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Tok::Not);
                i += 1;
            }
            '=' if bytes.get(i + 1) == Some(&b'=') => {
                tokens.push(Tok::Eq);
                i += 2;
            }
            '&' if bytes.get(i + 1) == Some(&b'&') => {
                tokens.push(Tok::And);
                i += 2;
            }
            '|' if bytes.get(i + 1) == Some(&b'|') => {
                tokens.push(Tok::Or);
                i += 2;
            }
            '\'' => {
                // Single-quoted string, '' escapes a quote. Content is
                // copied by slicing between quote bytes so multi-byte
                // characters come through intact.
                let mut s = String::new();
                i += 1;
                let mut seg_start = i;
                loop {
                    match bytes.get(i) {
                        Some(b'\'') if bytes.get(i + 1) == Some(&b'\'') => {
                            s.push_str(&input[seg_start..i]);
                            s.push('\'');
                            i += 2;
                            seg_start = i;
                        }
                        Some(b'\'') => {
                            s.push_str(&input[seg_start..i]);
                            i += 1;
                            break;
                        }
                        Some(_) => {
                            i += 1;
                        }
                        None => {
                            return Err(EvalError::Parse {
                                message: format!("unterminated string in '{}'", input),
                            });
                        }
                    }
                }
                tokens.push(Tok::Str(s));
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_digit() || bytes[i] == b'.')
                {
                    i += 1;
                }
                let text = &input[start..i];
                let n = text.parse::<f64>().map_err(|_| EvalError::Parse {
                    message: format!("bad number '{}'", text),
                })?;
                tokens.push(Tok::Num(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < bytes.len() {
                    let b = bytes[i] as char;
                    if b.is_ascii_alphanumeric() || b == '_' || b == '-' || b == '.' {
                        i += 1;
                    } else {
                        break;
                    }
                }
                tokens.push(Tok::Ident(input[start..i].to_string()));
            }
            other => {
                return Err(EvalError::Parse {
                    message: format!("unexpected character '{}' in '{}'", other, input),
                });
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Tok> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, tok: Tok) -> Result<(), EvalError> {
        match self.bump() {
            Some(t) if t == tok => Ok(()),
            other => Err(EvalError::Parse {
                message: format!("expected {:?}, found {:?}", tok, other),
            }),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Tok::Or) {
            self.bump();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, EvalError> {
        let mut left = self.parse_cmp()?;
        while self.peek() == Some(&Tok::And) {
            self.bump();
            let right = self.parse_cmp()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_cmp(&mut self) -> Result<Expr, EvalError> {
        let left = self.parse_unary()?;
        match self.peek() {
            Some(Tok::Eq) => {
                self.bump();
                let right = self.parse_unary()?;
                Ok(Expr::Eq(Box::new(left), Box::new(right)))
            }
            Some(Tok::Ne) => {
                self.bump();
                let right = self.parse_unary()?;
                Ok(Expr::Ne(Box::new(left), Box::new(right)))
            }
            _ => Ok(left),
        }
    }

    fn parse_unary(&mut self) -> Result<Expr, EvalError> {
        if self.peek() == Some(&Tok::Not) {
            self.bump();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, EvalError> {
        match self.bump() {
            Some(Tok::LParen) => {
                let inner = self.parse_or()?;
                self.expect(Tok::RParen)?;
                Ok(inner)
            }
            Some(Tok::Str(s)) => Ok(Expr::Str(s)),
            Some(Tok::Num(n)) => Ok(Expr::Num(n)),
            Some(Tok::Ident(name)) => self.parse_ident(name),
            other => Err(EvalError::Parse {
                message: format!("unexpected token {:?}", other),
            }),
        }
    }

    fn parse_ident(&mut self, name: String) -> Result<Expr, EvalError> {
        // Status functions take no arguments.
        if self.peek() == Some(&Tok::LParen) {
            self.bump();
            self.expect(Tok::RParen)?;
            return match name.as_str() {
                "always" => Ok(Expr::Always),
                "success" => Ok(Expr::Success),
                "failure" => Ok(Expr::Failure),
                "cancelled" => Ok(Expr::Cancelled),
                other => Err(EvalError::Parse {
                    message: format!("unknown function '{}'", other),
                }),
            };
        }

        match name.as_str() {
            "true" => return Ok(Expr::Bool(true)),
            "false" => return Ok(Expr::Bool(false)),
            "null" => return Ok(Expr::Null),
            _ => {}
        }

        let parts: Vec<&str> = name.split('.').collect();
        match parts.as_slice() {
            ["needs", job, "result"] => Ok(Expr::NeedsResult {
                job: job.to_string(),
            }),
            ["needs", job, "outputs", key] => Ok(Expr::NeedsOutput {
                job: job.to_string(),
                key: key.to_string(),
            }),
            ["matrix", key] => Ok(Expr::Matrix {
                key: key.to_string(),
            }),
            _ => Err(EvalError::Parse {
                message: format!("unsupported context reference '{}'", name),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_with<'a>(
        results: &'a HashMap<String, Status>,
        outputs: &'a HashMap<String, HashMap<String, String>>,
        matrix: &'a HashMap<String, String>,
    ) -> EvalFrame<'a> {
        EvalFrame {
            needs_results: results,
            needs_outputs: outputs,
            matrix,
            run_cancelled: false,
            strict_outputs: false,
        }
    }

    #[test]
    fn test_parse_and_eval_literals() {
        let empty_r = HashMap::new();
        let empty_o = HashMap::new();
        let empty_m = HashMap::new();
        let frame = frame_with(&empty_r, &empty_o, &empty_m);

        assert_eq!(
            Expr::parse("'abc'").unwrap().eval(&frame).unwrap(),
            Value::Str("abc".to_string())
        );
        assert_eq!(
            Expr::parse("3.5").unwrap().eval(&frame).unwrap(),
            Value::Num(3.5)
        );
        assert!(Expr::parse("true").unwrap().eval(&frame).unwrap().truthy());
        assert!(!Expr::parse("null").unwrap().eval(&frame).unwrap().truthy());
        assert_eq!(
            Expr::parse("'it''s'").unwrap().eval(&frame).unwrap(),
            Value::Str("it's".to_string())
        );
    }

    #[test]
    fn test_string_literal_keeps_multibyte_characters() {
        let empty_r = HashMap::new();
        let empty_o = HashMap::new();
        let mut matrix = HashMap::new();
        matrix.insert("name".to_string(), "héllo".to_string());
        let frame = frame_with(&empty_r, &empty_o, &matrix);

        assert_eq!(
            Expr::parse("'héllo'").unwrap().eval(&frame).unwrap(),
            Value::Str("héllo".to_string())
        );
        let expr = Expr::parse("matrix.name == 'héllo'").unwrap();
        assert!(expr.eval(&frame).unwrap().truthy());
    }

    #[test]
    fn test_boolean_combinators_and_precedence() {
        let empty_r = HashMap::new();
        let empty_o = HashMap::new();
        let empty_m = HashMap::new();
        let frame = frame_with(&empty_r, &empty_o, &empty_m);

        // && binds tighter than ||.
        let expr = Expr::parse("false && true || true").unwrap();
        assert!(expr.eval(&frame).unwrap().truthy());

        let expr = Expr::parse("!(1 == 2)").unwrap();
        assert!(expr.eval(&frame).unwrap().truthy());

        let expr = Expr::parse("'a' != 'b'").unwrap();
        assert!(expr.eval(&frame).unwrap().truthy());
    }

    #[test]
    fn test_needs_result_and_outputs() {
        let mut results = HashMap::new();
        results.insert("build".to_string(), Status::Success);
        let mut outputs = HashMap::new();
        let mut build_outputs = HashMap::new();
        build_outputs.insert("version".to_string(), "1.2.3".to_string());
        outputs.insert("build".to_string(), build_outputs);
        let matrix = HashMap::new();
        let frame = frame_with(&results, &outputs, &matrix);

        let expr = Expr::parse("needs.build.result == 'success'").unwrap();
        assert!(expr.eval(&frame).unwrap().truthy());

        let expr = Expr::parse("needs.build.outputs.version").unwrap();
        assert_eq!(expr.eval(&frame).unwrap(), Value::Str("1.2.3".to_string()));
    }

    #[test]
    fn test_missing_job_is_an_error() {
        let empty_r = HashMap::new();
        let empty_o = HashMap::new();
        let empty_m = HashMap::new();
        let frame = frame_with(&empty_r, &empty_o, &empty_m);

        let expr = Expr::parse("needs.ghost.result").unwrap();
        assert_eq!(
            expr.eval(&frame).unwrap_err(),
            EvalError::MissingJob {
                job: "ghost".to_string()
            }
        );
    }

    #[test]
    fn test_missing_output_strict_vs_lenient() {
        let mut results = HashMap::new();
        results.insert("a".to_string(), Status::Success);
        let mut outputs = HashMap::new();
        let mut a_outputs = HashMap::new();
        a_outputs.insert("x".to_string(), "1".to_string());
        outputs.insert("a".to_string(), a_outputs);
        let matrix = HashMap::new();

        let expr = Expr::parse("needs.a.outputs.colours").unwrap();

        let lenient = frame_with(&results, &outputs, &matrix);
        assert_eq!(expr.eval(&lenient).unwrap(), Value::Str(String::new()));

        let strict = EvalFrame {
            strict_outputs: true,
            ..frame_with(&results, &outputs, &matrix)
        };
        assert_eq!(
            expr.eval(&strict).unwrap_err(),
            EvalError::MissingOutput {
                job: "a".to_string(),
                key: "colours".to_string(),
                available: vec!["x".to_string()],
            }
        );
    }

    #[test]
    fn test_status_functions() {
        let mut results = HashMap::new();
        results.insert("a".to_string(), Status::Success);
        results.insert("b".to_string(), Status::Skipped);
        let outputs = HashMap::new();
        let matrix = HashMap::new();
        let frame = frame_with(&results, &outputs, &matrix);

        // A skipped predecessor satisfies always() but not success().
        assert!(Expr::parse("always()").unwrap().eval(&frame).unwrap().truthy());
        assert!(!Expr::parse("success()").unwrap().eval(&frame).unwrap().truthy());
        assert!(!Expr::parse("failure()").unwrap().eval(&frame).unwrap().truthy());

        let cancelled = EvalFrame {
            run_cancelled: true,
            ..frame_with(&results, &outputs, &matrix)
        };
        assert!(
            Expr::parse("cancelled()")
                .unwrap()
                .eval(&cancelled)
                .unwrap()
                .truthy()
        );
        assert!(
            !Expr::parse("success()")
                .unwrap()
                .eval(&cancelled)
                .unwrap()
                .truthy()
        );
    }

    #[test]
    fn test_references_status_fn() {
        assert!(Expr::parse("always()").unwrap().references_status_fn());
        assert!(
            Expr::parse("failure() && needs.a.result == 'failure'")
                .unwrap()
                .references_status_fn()
        );
        assert!(!Expr::parse("needs.a.result == 'success'").unwrap().references_status_fn());
    }

    #[test]
    fn test_evaluate_template() {
        let empty_r = HashMap::new();
        let empty_o = HashMap::new();
        let mut matrix = HashMap::new();
        matrix.insert("os".to_string(), "linux".to_string());
        let frame = frame_with(&empty_r, &empty_o, &matrix);

        // Whole-string template keeps the typed value.
        assert_eq!(
            evaluate_template("${{ matrix.os }}", &frame).unwrap(),
            Value::Str("linux".to_string())
        );
        // Mixed text interpolates.
        assert_eq!(
            evaluate_template("runner-${{ matrix.os }}-large", &frame).unwrap(),
            Value::Str("runner-linux-large".to_string())
        );
        // No template at all.
        assert_eq!(
            evaluate_template("ubuntu-latest", &frame).unwrap(),
            Value::Str("ubuntu-latest".to_string())
        );
    }

    #[test]
    fn test_referenced_needs_collection() {
        let expr =
            Expr::parse("needs.a.outputs.x == needs.b.result && needs.a.result").unwrap();
        let mut jobs = Vec::new();
        referenced_needs(&expr, &mut jobs);
        assert_eq!(jobs, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_parse_errors() {
        assert!(Expr::parse("needs.a").is_err());
        assert!(Expr::parse("'unterminated").is_err());
        assert!(Expr::parse("frobnicate()").is_err());
        assert!(Expr::parse("1 == 2 extra").is_err());
    }
}
