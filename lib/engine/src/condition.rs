//! Guard-expression evaluation for edge conditions.
//!
//! Conditions are written in a small, self-contained expression language
//! evaluated against the shared map, which is bound to the name `shared`:
//!
//! ```text
//! shared['score'] > 5 and shared['kind'] == 'report'
//! 'urgent' in shared['tags'] or not shared['reviewed']
//! ```
//!
//! The surface is deliberately narrow: boolean logic (`and`/`or`/`not`, or
//! `&&`/`||`/`!`), comparisons, membership (`in` / `not in`), indexing with
//! string keys and integer offsets (negative offsets count from the end),
//! parentheses, and literals (`True`/`False`/`None`, `true`/`false`/`null`,
//! numbers, quoted strings). There are no function calls, no attribute
//! access, and no I/O, and evaluation never mutates the shared map.

use crate::error::ConditionError;
use serde_json::{Map, Number, Value};

/// Evaluates `expression` against `shared` and returns its truthiness.
///
/// Truthiness follows the conventions of the document format's origin: null
/// and false are false; zero, empty strings, and empty collections are
/// false; everything else is true.
///
/// # Errors
///
/// Returns an error if the expression cannot be parsed or fails during
/// evaluation (missing key, out-of-range index, mismatched comparison).
/// Callers at the edge-selection boundary treat any error as false.
pub fn evaluate(expression: &str, shared: &Map<String, Value>) -> Result<bool, ConditionError> {
    let tokens = lex(expression)?;
    let mut parser = Parser { tokens, position: 0 };
    let expr = parser.parse_expression()?;
    parser.expect_end()?;
    Ok(truthy(&eval(&expr, shared)?))
}

/// Returns the truthiness of a JSON value.
#[must_use]
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(entries) => !entries.is_empty(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Shared,
    Literal(Value),
    And,
    Or,
    Not,
    In,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Minus,
    LParen,
    RParen,
    LBracket,
    RBracket,
}

fn lex(input: &str) -> Result<Vec<Token>, ConditionError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '\'' | '"' => {
                let (string, consumed) = lex_string(&chars[i..], c)?;
                tokens.push(Token::Literal(Value::String(string)));
                i += consumed;
            }
            _ if c.is_ascii_digit() => {
                let (number, consumed) = lex_number(&chars[i..])?;
                tokens.push(Token::Literal(Value::Number(number)));
                i += consumed;
            }
            _ if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "shared" => Token::Shared,
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "True" | "true" => Token::Literal(Value::Bool(true)),
                    "False" | "false" => Token::Literal(Value::Bool(false)),
                    "None" | "null" => Token::Literal(Value::Null),
                    _ => {
                        return Err(ConditionError::Parse {
                            message: format!("unknown identifier '{word}'"),
                        });
                    }
                });
            }
            _ => {
                return Err(ConditionError::Parse {
                    message: format!("unexpected character '{c}' at offset {i}"),
                });
            }
        }
    }

    Ok(tokens)
}

fn lex_string(chars: &[char], quote: char) -> Result<(String, usize), ConditionError> {
    let mut out = String::new();
    let mut i = 1;
    while i < chars.len() {
        match chars[i] {
            '\\' => {
                let escaped = chars.get(i + 1).ok_or_else(|| ConditionError::Parse {
                    message: "unterminated escape in string literal".to_string(),
                })?;
                out.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => *other,
                });
                i += 2;
            }
            c if c == quote => return Ok((out, i + 1)),
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    Err(ConditionError::Parse { message: "unterminated string literal".to_string() })
}

fn lex_number(chars: &[char]) -> Result<(Number, usize), ConditionError> {
    let mut i = 0;
    let mut is_float = false;
    while i < chars.len() {
        match chars[i] {
            c if c.is_ascii_digit() => i += 1,
            '.' if !is_float => {
                is_float = true;
                i += 1;
            }
            _ => break,
        }
    }
    let text: String = chars[..i].iter().collect();
    if is_float {
        let parsed: f64 = text.parse().map_err(|_| ConditionError::Parse {
            message: format!("invalid number '{text}'"),
        })?;
        Number::from_f64(parsed)
            .map(|n| (n, i))
            .ok_or_else(|| ConditionError::Parse { message: format!("invalid number '{text}'") })
    } else {
        let parsed: i64 = text.parse().map_err(|_| ConditionError::Parse {
            message: format!("invalid number '{text}'"),
        })?;
        Ok((Number::from(parsed), i))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    NotIn,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Shared,
    Index(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.position).cloned();
        if token.is_some() {
            self.position += 1;
        }
        token
    }

    fn consume(&mut self, expected: &Token) -> Result<(), ConditionError> {
        match self.advance() {
            Some(token) if token == *expected => Ok(()),
            other => Err(ConditionError::Parse {
                message: format!("expected {expected:?}, found {other:?}"),
            }),
        }
    }

    fn expect_end(&self) -> Result<(), ConditionError> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(ConditionError::Parse {
                message: format!("unexpected trailing token {token:?}"),
            }),
        }
    }

    fn parse_expression(&mut self) -> Result<Expr, ConditionError> {
        self.parse_or()
    }

    fn parse_or(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ConditionError> {
        let mut left = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.advance();
            let right = self.parse_not()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&Token::Not) {
            self.advance();
            let operand = self.parse_not()?;
            return Ok(Expr::Not(Box::new(operand)));
        }
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expr, ConditionError> {
        let left = self.parse_operand()?;
        let op = match self.peek() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            Some(Token::In) => CmpOp::In,
            Some(Token::Not) => {
                // `not` after an operand is only valid as `not in`.
                self.advance();
                self.consume(&Token::In)?;
                let right = self.parse_operand()?;
                return Ok(Expr::Compare(Box::new(left), CmpOp::NotIn, Box::new(right)));
            }
            _ => return Ok(left),
        };
        self.advance();
        let right = self.parse_operand()?;
        Ok(Expr::Compare(Box::new(left), op, Box::new(right)))
    }

    fn parse_operand(&mut self) -> Result<Expr, ConditionError> {
        if self.peek() == Some(&Token::Minus) {
            self.advance();
            let operand = self.parse_operand()?;
            return Ok(Expr::Neg(Box::new(operand)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expr, ConditionError> {
        let mut expr = self.parse_primary()?;
        while self.peek() == Some(&Token::LBracket) {
            self.advance();
            let index = self.parse_expression()?;
            self.consume(&Token::RBracket)?;
            expr = Expr::Index(Box::new(expr), Box::new(index));
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<Expr, ConditionError> {
        match self.advance() {
            Some(Token::Shared) => Ok(Expr::Shared),
            Some(Token::Literal(value)) => Ok(Expr::Literal(value)),
            Some(Token::LParen) => {
                let expr = self.parse_expression()?;
                self.consume(&Token::RParen)?;
                Ok(expr)
            }
            other => {
                Err(ConditionError::Parse { message: format!("unexpected token {other:?}") })
            }
        }
    }
}

fn eval(expr: &Expr, shared: &Map<String, Value>) -> Result<Value, ConditionError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Shared => Ok(Value::Object(shared.clone())),
        Expr::Index(base, index) => {
            let base = eval(base, shared)?;
            let index = eval(index, shared)?;
            index_value(&base, &index)
        }
        Expr::Not(operand) => Ok(Value::Bool(!truthy(&eval(operand, shared)?))),
        Expr::Neg(operand) => {
            let value = eval(operand, shared)?;
            match &value {
                Value::Number(n) => {
                    if let Some(i) = n.as_i64() {
                        Ok(Value::from(-i))
                    } else if let Some(f) = n.as_f64() {
                        Number::from_f64(-f).map(Value::Number).ok_or_else(|| {
                            ConditionError::Eval { message: format!("cannot negate {n}") }
                        })
                    } else {
                        Err(ConditionError::Eval { message: format!("cannot negate {n}") })
                    }
                }
                other => Err(ConditionError::Eval {
                    message: format!("cannot negate non-numeric value {other}"),
                }),
            }
        }
        Expr::And(left, right) => {
            let left = eval(left, shared)?;
            if !truthy(&left) {
                return Ok(left);
            }
            eval(right, shared)
        }
        Expr::Or(left, right) => {
            let left = eval(left, shared)?;
            if truthy(&left) {
                return Ok(left);
            }
            eval(right, shared)
        }
        Expr::Compare(left, op, right) => {
            let left = eval(left, shared)?;
            let right = eval(right, shared)?;
            compare(&left, op, &right).map(Value::Bool)
        }
    }
}

fn index_value(base: &Value, index: &Value) -> Result<Value, ConditionError> {
    match (base, index) {
        (Value::Object(entries), Value::String(key)) => {
            entries.get(key).cloned().ok_or_else(|| ConditionError::Eval {
                message: format!("key '{key}' not found"),
            })
        }
        (Value::Array(items), Value::Number(n)) => {
            let offset = n.as_i64().ok_or_else(|| ConditionError::Eval {
                message: format!("invalid array index {n}"),
            })?;
            resolve_offset(offset, items.len())
                .and_then(|i| items.get(i).cloned())
                .ok_or_else(|| ConditionError::Eval {
                    message: format!("array index {offset} out of range"),
                })
        }
        (Value::String(s), Value::Number(n)) => {
            let offset = n.as_i64().ok_or_else(|| ConditionError::Eval {
                message: format!("invalid string index {n}"),
            })?;
            let chars: Vec<char> = s.chars().collect();
            resolve_offset(offset, chars.len())
                .and_then(|i| chars.get(i).copied())
                .map(|c| Value::String(c.to_string()))
                .ok_or_else(|| ConditionError::Eval {
                    message: format!("string index {offset} out of range"),
                })
        }
        (base, index) => Err(ConditionError::Eval {
            message: format!("cannot index {base} with {index}"),
        }),
    }
}

fn resolve_offset(offset: i64, len: usize) -> Option<usize> {
    if offset >= 0 {
        usize::try_from(offset).ok()
    } else {
        let from_end = usize::try_from(-offset).ok()?;
        len.checked_sub(from_end)
    }
}

fn compare(left: &Value, op: &CmpOp, right: &Value) -> Result<bool, ConditionError> {
    match op {
        CmpOp::Eq => Ok(values_equal(left, right)),
        CmpOp::Ne => Ok(!values_equal(left, right)),
        CmpOp::In => contains(right, left),
        CmpOp::NotIn => contains(right, left).map(|found| !found),
        CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
            let ordering = order(left, right)?;
            Ok(match op {
                CmpOp::Lt => ordering.is_lt(),
                CmpOp::Le => ordering.is_le(),
                CmpOp::Gt => ordering.is_gt(),
                CmpOp::Ge => ordering.is_ge(),
                _ => unreachable!(),
            })
        }
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

fn order(left: &Value, right: &Value) -> Result<std::cmp::Ordering, ConditionError> {
    match (left, right) {
        (Value::Number(l), Value::Number(r)) => {
            let (l, r) = (l.as_f64(), r.as_f64());
            match (l, r) {
                (Some(l), Some(r)) => l.partial_cmp(&r).ok_or_else(|| ConditionError::Eval {
                    message: "numbers are not comparable".to_string(),
                }),
                _ => Err(ConditionError::Eval {
                    message: "numbers are not comparable".to_string(),
                }),
            }
        }
        (Value::String(l), Value::String(r)) => Ok(l.cmp(r)),
        (l, r) => Err(ConditionError::Eval { message: format!("cannot order {l} and {r}") }),
    }
}

fn contains(container: &Value, needle: &Value) -> Result<bool, ConditionError> {
    match container {
        Value::Array(items) => Ok(items.iter().any(|item| values_equal(item, needle))),
        Value::String(s) => match needle {
            Value::String(sub) => Ok(s.contains(sub.as_str())),
            other => Err(ConditionError::Eval {
                message: format!("cannot test membership of {other} in a string"),
            }),
        },
        Value::Object(entries) => match needle {
            Value::String(key) => Ok(entries.contains_key(key)),
            other => Err(ConditionError::Eval {
                message: format!("cannot test membership of {other} in an object"),
            }),
        },
        other => Err(ConditionError::Eval {
            message: format!("cannot test membership in {other}"),
        }),
    }
}
