//! Expression language for conditions and value expressions.
//!
//! Expressions are evaluated against a [`Scope`], usually the session's data
//! model. The language supports:
//!
//! - `count`, `order.customer.id`, `items.0` - data model paths
//! - `_event.data.ok` - system variables are ordinary paths
//! - `"text"`, `'text'`, `42`, `-1.5`, `true`, `false`, `null` - literals
//! - `In('state')` - true if the state is active
//! - `a + b`, `a - b` - numeric addition/subtraction, string concatenation with `+`
//! - `==`, `!=`, `>`, `>=`, `<`, `<=` - comparisons
//! - `!expr`, `expr && expr`, `expr || expr`, `(expr)`
//!
//! Examples:
//! - `count > 3 && _event.data.ok`
//! - `In('busy') || retries >= 5`
//! - `total + _event.data.amount`

use crate::error::{CoreError, ExecutionError};
use rscx_value::{Access, Value};
use std::cmp::Ordering;
use std::fmt;

/// What an expression can see while it is evaluated.
pub trait Scope {
    /// Resolves a data path. Missing paths yield `Undefined`.
    fn lookup(&self, path: &[&str]) -> Value;

    /// Returns true if the state with this id is in the active configuration.
    fn in_state(&self, id: &str) -> bool;
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

/// Arithmetic operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
}

/// A parsed expression.
#[derive(Debug, Clone)]
pub enum Expr {
    /// A constant. Containers are deep-constant and cloned on evaluation.
    Literal(Value),
    /// A dotted data path.
    Path(Vec<String>),
    /// `In('id')`.
    InState(String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    Arith(ArithOp, Box<Expr>, Box<Expr>),
}

impl Expr {
    /// Parses an expression from a string.
    pub fn parse(s: &str) -> Result<Self, CoreError> {
        let s = s.trim();
        if s.is_empty() {
            return Err(invalid("empty expression"));
        }

        let mut parser = Parser::new(s);
        let expr = parser.parse_expr()?;
        parser.skip_whitespace();
        if parser.pos < s.len() {
            return Err(invalid(format!(
                "unexpected input at offset {}: '{}'",
                parser.pos,
                &s[parser.pos..]
            )));
        }
        Ok(expr)
    }

    /// Wraps a JSON literal, freezing containers.
    pub fn literal(value: Value) -> Self {
        value.make_deep_constant();
        Expr::Literal(value)
    }

    /// Parses a dotted location such as `order.items.0`.
    pub fn parse_location(s: &str) -> Result<Vec<String>, CoreError> {
        let s = s.trim();
        let mut parser = Parser::new(s);
        let path = parser.parse_path()?;
        if parser.pos < s.len() {
            return Err(invalid(format!("invalid location '{}'", s)));
        }
        Ok(path)
    }

    /// Evaluates to a value. Literal containers come back writable.
    pub fn evaluate(&self, scope: &dyn Scope) -> Result<Value, ExecutionError> {
        Ok(match self {
            Expr::Literal(value) => match value {
                Value::Object(_) | Value::Array(_) => value.deep_clone(Access::Writable),
                other => other.clone(),
            },
            Expr::Path(path) => {
                let segments: Vec<&str> = path.iter().map(String::as_str).collect();
                scope.lookup(&segments)
            }
            Expr::InState(id) => Value::Boolean(scope.in_state(id)),
            Expr::Not(inner) => Value::Boolean(!inner.evaluate(scope)?.is_truthy()),
            Expr::And(left, right) => {
                Value::Boolean(left.evaluate_bool(scope)? && right.evaluate_bool(scope)?)
            }
            Expr::Or(left, right) => {
                Value::Boolean(left.evaluate_bool(scope)? || right.evaluate_bool(scope)?)
            }
            Expr::Compare(op, left, right) => {
                let l = left.evaluate(scope)?;
                let r = right.evaluate(scope)?;
                Value::Boolean(compare(*op, &l, &r)?)
            }
            Expr::Arith(op, left, right) => {
                let l = left.evaluate(scope)?;
                let r = right.evaluate(scope)?;
                arith(*op, &l, &r)?
            }
        })
    }

    /// Evaluates and applies truthiness.
    pub fn evaluate_bool(&self, scope: &dyn Scope) -> Result<bool, ExecutionError> {
        Ok(self.evaluate(scope)?.is_truthy())
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(Value::String(s)) => write!(f, "{:?}", s),
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::Path(p) => write!(f, "{}", p.join(".")),
            Expr::InState(id) => write!(f, "In('{}')", id),
            Expr::Not(e) => write!(f, "!{}", e),
            Expr::And(l, r) => write!(f, "({} && {})", l, r),
            Expr::Or(l, r) => write!(f, "({} || {})", l, r),
            Expr::Compare(op, l, r) => {
                let sym = match op {
                    CmpOp::Eq => "==",
                    CmpOp::Ne => "!=",
                    CmpOp::Gt => ">",
                    CmpOp::Ge => ">=",
                    CmpOp::Lt => "<",
                    CmpOp::Le => "<=",
                };
                write!(f, "{} {} {}", l, sym, r)
            }
            Expr::Arith(op, l, r) => {
                let sym = if *op == ArithOp::Add { "+" } else { "-" };
                write!(f, "({} {} {})", l, sym, r)
            }
        }
    }
}

fn invalid(reason: impl Into<String>) -> CoreError {
    CoreError::InvalidExpression {
        reason: reason.into(),
    }
}

fn compare(op: CmpOp, l: &Value, r: &Value) -> Result<bool, ExecutionError> {
    match op {
        CmpOp::Eq => return Ok(l.loose_eq(r)),
        CmpOp::Ne => return Ok(!l.loose_eq(r)),
        _ => {}
    }

    // Ordering against a missing value is false rather than an error.
    if l.is_undefined() || l.is_null() || r.is_undefined() || r.is_null() {
        return Ok(false);
    }

    let ordering = l.compare(r).ok_or_else(|| {
        ExecutionError::execution(format!(
            "cannot order {} and {}",
            l.type_name(),
            r.type_name()
        ))
    })?;

    Ok(match op {
        CmpOp::Gt => ordering == Ordering::Greater,
        CmpOp::Ge => ordering != Ordering::Less,
        CmpOp::Lt => ordering == Ordering::Less,
        CmpOp::Le => ordering != Ordering::Greater,
        CmpOp::Eq | CmpOp::Ne => unreachable!(),
    })
}

fn arith(op: ArithOp, l: &Value, r: &Value) -> Result<Value, ExecutionError> {
    match (op, l, r) {
        (ArithOp::Add, Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
        (ArithOp::Sub, Value::Number(a), Value::Number(b)) => Ok(Value::Number(a - b)),
        (ArithOp::Add, Value::String(a), b) => Ok(Value::String(format!("{}{}", a, b))),
        (ArithOp::Add, a, Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
        _ => Err(ExecutionError::execution(format!(
            "cannot apply arithmetic to {} and {}",
            l.type_name(),
            r.type_name()
        ))),
    }
}

/// Recursive descent parser.
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn parse_expr(&mut self) -> Result<Expr, CoreError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_and()?;
        self.skip_whitespace();

        while self.peek_str("||") {
            self.pos += 2;
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_unary()?;
        self.skip_whitespace();

        while self.peek_str("&&") {
            self.pos += 2;
            let right = self.parse_unary()?;
            left = Expr::And(Box::new(left), Box::new(right));
            self.skip_whitespace();
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, CoreError> {
        self.skip_whitespace();

        if self.peek_char() == Some('!') && !self.peek_str("!=") {
            self.pos += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }

        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, CoreError> {
        let left = self.parse_additive()?;
        self.skip_whitespace();

        let op = if self.peek_str("==") {
            Some((CmpOp::Eq, 2))
        } else if self.peek_str("!=") {
            Some((CmpOp::Ne, 2))
        } else if self.peek_str(">=") {
            Some((CmpOp::Ge, 2))
        } else if self.peek_str("<=") {
            Some((CmpOp::Le, 2))
        } else if self.peek_char() == Some('>') {
            Some((CmpOp::Gt, 1))
        } else if self.peek_char() == Some('<') {
            Some((CmpOp::Lt, 1))
        } else {
            None
        };

        match op {
            Some((op, len)) => {
                self.pos += len;
                let right = self.parse_additive()?;
                Ok(Expr::Compare(op, Box::new(left), Box::new(right)))
            }
            None => Ok(left),
        }
    }

    fn parse_additive(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.parse_primary()?;
        loop {
            self.skip_whitespace();
            let op = match self.peek_char() {
                Some('+') => ArithOp::Add,
                Some('-') => ArithOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_primary()?;
            left = Expr::Arith(op, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Expr, CoreError> {
        self.skip_whitespace();

        match self.peek_char() {
            Some('(') => {
                self.pos += 1;
                let expr = self.parse_expr()?;
                self.skip_whitespace();
                if self.peek_char() != Some(')') {
                    return Err(invalid("expected ')'"));
                }
                self.pos += 1;
                Ok(expr)
            }
            Some('"') | Some('\'') => Ok(Expr::Literal(Value::String(self.parse_string()?))),
            Some(c) if c.is_ascii_digit() || c == '-' => {
                Ok(Expr::Literal(Value::Number(self.parse_number()?)))
            }
            Some(_) => {
                let path = self.parse_path()?;
                if path.len() == 1 {
                    match path[0].as_str() {
                        "true" => return Ok(Expr::Literal(Value::Boolean(true))),
                        "false" => return Ok(Expr::Literal(Value::Boolean(false))),
                        "null" => return Ok(Expr::Literal(Value::Null)),
                        "undefined" => return Ok(Expr::Literal(Value::Undefined)),
                        "In" => return self.parse_in_call(),
                        _ => {}
                    }
                }
                Ok(Expr::Path(path))
            }
            None => Err(invalid("unexpected end of expression")),
        }
    }

    fn parse_in_call(&mut self) -> Result<Expr, CoreError> {
        self.skip_whitespace();
        if self.peek_char() != Some('(') {
            return Err(invalid("expected '(' after In"));
        }
        self.pos += 1;
        self.skip_whitespace();
        let id = self.parse_string()?;
        self.skip_whitespace();
        if self.peek_char() != Some(')') {
            return Err(invalid("expected ')' after In argument"));
        }
        self.pos += 1;
        Ok(Expr::InState(id))
    }

    fn parse_path(&mut self) -> Result<Vec<String>, CoreError> {
        let mut segments = Vec::new();
        loop {
            let start = self.pos;
            while let Some(c) = self.peek_char() {
                if c.is_alphanumeric() || c == '_' || c == '$' {
                    self.pos += c.len_utf8();
                } else {
                    break;
                }
            }
            if start == self.pos {
                return Err(invalid(format!(
                    "expected identifier at offset {} in '{}'",
                    start, self.input
                )));
            }
            segments.push(self.input[start..self.pos].to_string());

            if self.peek_char() == Some('.') {
                self.pos += 1;
            } else {
                break;
            }
        }
        Ok(segments)
    }

    fn parse_string(&mut self) -> Result<String, CoreError> {
        let quote = match self.peek_char() {
            Some(q @ ('"' | '\'')) => q,
            _ => return Err(invalid("expected string")),
        };
        self.pos += 1;

        let mut out = String::new();
        while let Some(c) = self.peek_char() {
            self.pos += c.len_utf8();
            if c == quote {
                return Ok(out);
            }
            if c == '\\' {
                if let Some(escaped) = self.peek_char() {
                    self.pos += escaped.len_utf8();
                    out.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        other => other,
                    });
                }
            } else {
                out.push(c);
            }
        }

        Err(invalid("unterminated string"))
    }

    fn parse_number(&mut self) -> Result<f64, CoreError> {
        let start = self.pos;

        if self.peek_char() == Some('-') {
            self.pos += 1;
        }

        while let Some(c) = self.peek_char() {
            if c.is_ascii_digit() {
                self.pos += 1;
            } else {
                break;
            }
        }

        if self.peek_char() == Some('.') {
            self.pos += 1;
            while let Some(c) = self.peek_char() {
                if c.is_ascii_digit() {
                    self.pos += 1;
                } else {
                    break;
                }
            }
        }

        let num_str = &self.input[start..self.pos];
        num_str
            .parse::<f64>()
            .map_err(|_| invalid(format!("invalid number: '{}'", num_str)))
    }

    fn skip_whitespace(&mut self) {
        while let Some(c) = self.peek_char() {
            if c.is_whitespace() {
                self.pos += c.len_utf8();
            } else {
                break;
            }
        }
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.pos..].chars().next()
    }

    fn peek_str(&self, s: &str) -> bool {
        self.input[self.pos..].starts_with(s)
    }
}
