//! Arithmetic for `?=` connections.
//!
//! The definition is rendered first, so the evaluator only ever sees literals:
//! `{stage} + 1` arrives as `2 + 1`. The grammar is integer and float literals,
//! `+ - * /`, unary minus and parentheses. Integer results stay integers, `/` always
//! yields a float. There are no names, strings or calls.

use crate::record::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExprError {
    #[error("Unexpected end of expression")]
    UnexpectedEnd,
    #[error("Unexpected character {0:?} at offset {1}")]
    UnexpectedChar(char, usize),
    #[error("Unexpected characters at end of expression: {0:?}")]
    Trailing(String),
    #[error("Invalid number literal '{0}'")]
    InvalidNumber(String),
    #[error("Division by zero")]
    DivisionByZero,
    #[error("Arithmetic overflow in {0}")]
    Overflow(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    fn as_float(self) -> f64 {
        match self {
            Self::Int(value) => value as f64,
            Self::Float(value) => value,
        }
    }
}

impl From<Number> for Value {
    fn from(number: Number) -> Self {
        match number {
            Number::Int(value) => Value::Int(value),
            Number::Float(value) => Value::Float(value),
        }
    }
}

/// Evaluate a rendered `?=` definition
pub fn evaluate(expression: &str) -> Result<Value, ExprError> {
    let mut parser = Parser::new(expression);
    let result = parser.parse_expr()?;
    parser.expect_end()?;

    Ok(result.into())
}

/// integer operands use `checked`, anything else falls back to floats
fn apply(
    op: &'static str,
    lhs: Number,
    rhs: Number,
    checked: fn(i64, i64) -> Option<i64>,
    float: fn(f64, f64) -> f64,
) -> Result<Number, ExprError> {
    match (lhs, rhs) {
        (Number::Int(a), Number::Int(b)) => checked(a, b)
            .map(Number::Int)
            .ok_or(ExprError::Overflow(op)),
        _ => Ok(Number::Float(float(lhs.as_float(), rhs.as_float()))),
    }
}

fn divide(lhs: Number, rhs: Number) -> Result<Number, ExprError> {
    let divisor = rhs.as_float();
    if divisor == 0.0 {
        return Err(ExprError::DivisionByZero);
    }

    Ok(Number::Float(lhs.as_float() / divisor))
}

/// Recursive descent over the rendered expression
struct Parser<'a> {
    input: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, pos: 0 }
    }

    fn peek(&mut self) -> Option<char> {
        let rest = &self.input[self.pos..];
        self.pos += rest.len() - rest.trim_start().len();
        self.input[self.pos..].chars().next()
    }

    fn expect_end(&mut self) -> Result<(), ExprError> {
        if self.peek().is_some() {
            return Err(ExprError::Trailing(self.input[self.pos..].to_string()));
        }

        Ok(())
    }

    /// + and - (lowest precedence)
    fn parse_expr(&mut self) -> Result<Number, ExprError> {
        let mut left = self.parse_term()?;

        loop {
            left = match self.peek() {
                Some('+') => {
                    self.pos += 1;
                    apply("addition", left, self.parse_term()?, i64::checked_add, |a, b| a + b)?
                }
                Some('-') => {
                    self.pos += 1;
                    apply("subtraction", left, self.parse_term()?, i64::checked_sub, |a, b| a - b)?
                }
                _ => return Ok(left),
            };
        }
    }

    /// * and /
    fn parse_term(&mut self) -> Result<Number, ExprError> {
        let mut left = self.parse_unary()?;

        loop {
            left = match self.peek() {
                Some('*') => {
                    self.pos += 1;
                    apply("multiplication", left, self.parse_unary()?, i64::checked_mul, |a, b| a * b)?
                }
                Some('/') => {
                    self.pos += 1;
                    divide(left, self.parse_unary()?)?
                }
                _ => return Ok(left),
            };
        }
    }

    fn parse_unary(&mut self) -> Result<Number, ExprError> {
        if self.peek() != Some('-') {
            return self.parse_primary();
        }

        self.pos += 1;
        match self.parse_unary()? {
            Number::Int(value) => value
                .checked_neg()
                .map(Number::Int)
                .ok_or(ExprError::Overflow("negation")),
            Number::Float(value) => Ok(Number::Float(-value)),
        }
    }

    fn parse_primary(&mut self) -> Result<Number, ExprError> {
        match self.peek() {
            Some('(') => {
                self.pos += 1;
                let value = self.parse_expr()?;
                match self.peek() {
                    Some(')') => {
                        self.pos += 1;
                        Ok(value)
                    }
                    Some(c) => Err(ExprError::UnexpectedChar(c, self.pos)),
                    None => Err(ExprError::UnexpectedEnd),
                }
            }
            Some(c) if c.is_ascii_digit() || c == '.' => self.parse_number(),
            Some(c) => Err(ExprError::UnexpectedChar(c, self.pos)),
            None => Err(ExprError::UnexpectedEnd),
        }
    }

    fn parse_number(&mut self) -> Result<Number, ExprError> {
        let start = self.pos;
        let bytes = self.input.as_bytes();
        let mut is_float = false;

        while let Some(&byte) = bytes.get(self.pos) {
            match byte {
                b'0'..=b'9' => self.pos += 1,
                b'.' => {
                    is_float = true;
                    self.pos += 1;
                }
                b'e' | b'E' => {
                    is_float = true;
                    self.pos += 1;
                    if matches!(bytes.get(self.pos), Some(b'+' | b'-')) {
                        self.pos += 1;
                    }
                }
                _ => break,
            }
        }

        let literal = &self.input[start..self.pos];
        let parsed = if is_float {
            literal.parse().ok().map(Number::Float)
        } else {
            literal.parse().ok().map(Number::Int)
        };

        parsed.ok_or_else(|| ExprError::InvalidNumber(literal.to_string()))
    }
}
