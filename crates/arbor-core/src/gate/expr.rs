//! Sandboxed boolean expressions for expression gates.
//!
//! The language is deliberately tiny: comparisons and equality over dotted
//! paths into the gated value, boolean connectives, literals, and a single
//! whitelisted `len(..)` function. There is no assignment, no user function
//! call, and no I/O, so evaluation cannot have side effects.
//!
//! Grammar:
//!
//! ```text
//! expr   := or
//! or     := and ("||" and)*
//! and    := cmp ("&&" cmp)*
//! cmp    := unary (("==" | "!=" | "<" | "<=" | ">" | ">=") unary)?
//! unary  := "!" unary | primary
//! primary:= number | string | "true" | "false" | "null"
//!         | "len" "(" expr ")" | path | "(" expr ")"
//! path   := ident ("." (ident | digits))*
//! ```

use std::fmt;

use serde_json::Value;

/// Error from parsing or evaluating an expression.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExprError {
    #[error("parse error: {0}")]
    Parse(String),
    #[error("eval error: {0}")]
    Eval(String),
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Str(String),
    Ident(String),
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Not,
    LParen,
    RParen,
    Dot,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Number(n) => write!(f, "{n}"),
            Token::Str(s) => write!(f, "{s:?}"),
            Token::Ident(s) => write!(f, "{s}"),
            Token::Eq => f.write_str("=="),
            Token::Ne => f.write_str("!="),
            Token::Lt => f.write_str("<"),
            Token::Le => f.write_str("<="),
            Token::Gt => f.write_str(">"),
            Token::Ge => f.write_str(">="),
            Token::And => f.write_str("&&"),
            Token::Or => f.write_str("||"),
            Token::Not => f.write_str("!"),
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::Dot => f.write_str("."),
        }
    }
}

fn lex(input: &str) -> Result<Vec<Token>, ExprError> {
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
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Eq);
                    i += 2;
                } else {
                    return Err(ExprError::Parse("single '=' is not an operator".into()));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    tokens.push(Token::Not);
                    i += 1;
                }
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push(Token::And);
                    i += 2;
                } else {
                    return Err(ExprError::Parse("single '&' is not an operator".into()));
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push(Token::Or);
                    i += 2;
                } else {
                    return Err(ExprError::Parse("single '|' is not an operator".into()));
                }
            }
            '\'' | '"' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some(&ch) if ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(&ch) => {
                            s.push(ch);
                            i += 1;
                        }
                        None => {
                            return Err(ExprError::Parse("unterminated string literal".into()));
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    // A digit followed by '.' then a non-digit is a path
                    // segment boundary, not a decimal point.
                    if chars[i] == '.'
                        && !chars.get(i + 1).map(char::is_ascii_digit).unwrap_or(false)
                    {
                        break;
                    }
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n: f64 = text
                    .parse()
                    .map_err(|_| ExprError::Parse(format!("invalid number {text:?}")))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(Token::Ident(word));
            }
            other => {
                return Err(ExprError::Parse(format!("unexpected character {other:?}")));
            }
        }
    }

    Ok(tokens)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(Vec<String>),
    Not(Box<Expr>),
    Cmp(CmpOp, Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Len(Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: &Token) -> Result<(), ExprError> {
        match self.next() {
            Some(ref token) if token == expected => Ok(()),
            Some(token) => Err(ExprError::Parse(format!(
                "expected {expected}, found {token}"
            ))),
            None => Err(ExprError::Parse(format!(
                "expected {expected}, found end of input"
            ))),
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let right = self.parse_and()?;
            left = Expr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_cmp()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let right = self.parse_cmp()?;
            left = Expr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn parse_cmp(&mut self) -> Result<Expr, ExprError> {
        let left = self.parse_unary()?;
        let op = match self.peek() {
            Some(Token::Eq) => CmpOp::Eq,
            Some(Token::Ne) => CmpOp::Ne,
            Some(Token::Lt) => CmpOp::Lt,
            Some(Token::Le) => CmpOp::Le,
            Some(Token::Gt) => CmpOp::Gt,
            Some(Token::Ge) => CmpOp::Ge,
            _ => return Ok(left),
        };
        self.next();
        let right = self.parse_unary()?;
        Ok(Expr::Cmp(op, Box::new(left), Box::new(right)))
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Literal(
                serde_json::Number::from_f64(n)
                    .map(Value::Number)
                    .unwrap_or(Value::Null),
            )),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                self.expect(&Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(word)) => match word.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                "len" if self.peek() == Some(&Token::LParen) => {
                    self.next();
                    let inner = self.parse_or()?;
                    self.expect(&Token::RParen)?;
                    Ok(Expr::Len(Box::new(inner)))
                }
                _ => {
                    let mut segments = vec![word];
                    while self.peek() == Some(&Token::Dot) {
                        self.next();
                        match self.next() {
                            Some(Token::Ident(seg)) => segments.push(seg),
                            Some(Token::Number(n)) if n.fract() == 0.0 && n >= 0.0 => {
                                segments.push((n as u64).to_string());
                            }
                            other => {
                                return Err(ExprError::Parse(format!(
                                    "invalid path segment after '.': {:?}",
                                    other
                                )));
                            }
                        }
                    }
                    Ok(Expr::Path(segments))
                }
            },
            Some(token) => Err(ExprError::Parse(format!("unexpected token {token}"))),
            None => Err(ExprError::Parse("unexpected end of input".into())),
        }
    }
}

fn parse(input: &str) -> Result<Expr, ExprError> {
    let tokens = lex(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(ExprError::Parse(format!(
            "trailing input after expression at token {}",
            parser.pos
        )));
    }
    Ok(expr)
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

fn lookup<'a>(root: &'a Value, segments: &[String]) -> &'a Value {
    let mut current = root;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment).unwrap_or(&Value::Null),
            Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|index| items.get(index))
                .unwrap_or(&Value::Null),
            _ => &Value::Null,
        };
    }
    current
}

fn eval(expr: &Expr, root: &Value) -> Result<Value, ExprError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Path(segments) => Ok(lookup(root, segments).clone()),
        Expr::Not(inner) => match eval(inner, root)? {
            Value::Bool(b) => Ok(Value::Bool(!b)),
            other => Err(ExprError::Eval(format!(
                "cannot negate non-boolean {other}"
            ))),
        },
        Expr::And(lhs, rhs) => {
            // Short-circuit like the host language would.
            if !as_bool(&eval(lhs, root)?)? {
                return Ok(Value::Bool(false));
            }
            Ok(Value::Bool(as_bool(&eval(rhs, root)?)?))
        }
        Expr::Or(lhs, rhs) => {
            if as_bool(&eval(lhs, root)?)? {
                return Ok(Value::Bool(true));
            }
            Ok(Value::Bool(as_bool(&eval(rhs, root)?)?))
        }
        Expr::Len(inner) => {
            let value = eval(inner, root)?;
            let len = match &value {
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                other => {
                    return Err(ExprError::Eval(format!("len() of non-container {other}")));
                }
            };
            Ok(Value::Number(serde_json::Number::from(len as u64)))
        }
        Expr::Cmp(op, lhs, rhs) => {
            let left = eval(lhs, root)?;
            let right = eval(rhs, root)?;
            let result = match op {
                CmpOp::Eq => values_equal(&left, &right),
                CmpOp::Ne => !values_equal(&left, &right),
                CmpOp::Lt | CmpOp::Le | CmpOp::Gt | CmpOp::Ge => {
                    let (a, b) = match (left.as_f64(), right.as_f64()) {
                        (Some(a), Some(b)) => (a, b),
                        _ => {
                            return Err(ExprError::Eval(format!(
                                "cannot order {left} against {right}"
                            )));
                        }
                    };
                    match op {
                        CmpOp::Lt => a < b,
                        CmpOp::Le => a <= b,
                        CmpOp::Gt => a > b,
                        CmpOp::Ge => a >= b,
                        _ => unreachable!(),
                    }
                }
            };
            Ok(Value::Bool(result))
        }
    }
}

fn as_bool(value: &Value) -> Result<bool, ExprError> {
    match value {
        Value::Bool(b) => Ok(*b),
        other => Err(ExprError::Eval(format!(
            "expected boolean operand, got {other}"
        ))),
    }
}

/// Equality with numeric coercion: `1` equals `1.0`.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Parse and evaluate an expression against a value, requiring a boolean
/// result.
pub fn evaluate_bool(input: &str, root: &Value) -> Result<bool, ExprError> {
    let expr = parse(input)?;
    match eval(&expr, root)? {
        Value::Bool(b) => Ok(b),
        other => Err(ExprError::Eval(format!(
            "expression evaluated to non-boolean {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn numeric_comparison() {
        let value = json!({"price": 42});
        assert!(evaluate_bool("price > 100", &value).is_ok());
        assert!(!evaluate_bool("price > 100", &value).unwrap());
        assert!(evaluate_bool("price >= 42", &value).unwrap());
        assert!(evaluate_bool("price == 42.0", &value).unwrap());
    }

    #[test]
    fn boolean_connectives_short_circuit() {
        let value = json!({"count": 3, "label": "ok"});
        assert!(evaluate_bool("count >= 2 && label == 'ok'", &value).unwrap());
        assert!(evaluate_bool("count > 10 || label == 'ok'", &value).unwrap());
        // Left side false short-circuits; the right side would otherwise be
        // an ordering error against null.
        assert!(!evaluate_bool("count > 10 && missing > 1", &value).unwrap());
    }

    #[test]
    fn dotted_and_indexed_paths() {
        let value = json!({"user": {"age": 31}, "items": [{"id": "a"}, {"id": "b"}]});
        assert!(evaluate_bool("user.age >= 18", &value).unwrap());
        assert!(evaluate_bool("items.1.id == 'b'", &value).unwrap());
    }

    #[test]
    fn missing_path_is_null() {
        let value = json!({"a": 1});
        assert!(evaluate_bool("nope == null", &value).unwrap());
        assert!(!evaluate_bool("nope != null", &value).unwrap());
    }

    #[test]
    fn len_whitelist() {
        let value = json!({"tags": ["x", "y", "z"], "title": "hello"});
        assert!(evaluate_bool("len(tags) == 3", &value).unwrap());
        assert!(evaluate_bool("len(title) >= 5", &value).unwrap());
    }

    #[test]
    fn negation() {
        let value = json!({"done": false});
        assert!(evaluate_bool("!done", &value).unwrap());
    }

    #[test]
    fn non_boolean_result_is_an_error() {
        let value = json!({"x": 5});
        let err = evaluate_bool("x", &value).unwrap_err();
        assert!(matches!(err, ExprError::Eval(_)));
    }

    #[test]
    fn ordering_non_numbers_is_an_error() {
        let value = json!({"name": "zed"});
        let err = evaluate_bool("name > 3", &value).unwrap_err();
        assert!(matches!(err, ExprError::Eval(_)));
    }

    #[test]
    fn parse_errors() {
        let value = json!({});
        assert!(matches!(
            evaluate_bool("a = 1", &value),
            Err(ExprError::Parse(_))
        ));
        assert!(matches!(
            evaluate_bool("(a == 1", &value),
            Err(ExprError::Parse(_))
        ));
        assert!(matches!(
            evaluate_bool("a == 1 extra", &value),
            Err(ExprError::Parse(_))
        ));
    }

    #[test]
    fn no_function_calls_beyond_len() {
        let value = json!({});
        // `delete(x)` parses `delete` as a path, then chokes on '('.
        assert!(evaluate_bool("delete(x)", &value).is_err());
    }

    #[test]
    fn string_equality() {
        let value = json!({"status": "ready"});
        assert!(evaluate_bool("status == \"ready\"", &value).unwrap());
        assert!(evaluate_bool("status != 'done'", &value).unwrap());
    }
}
