//! Guard expression evaluation
//!
//! Connections carry optional guard expressions evaluated against the run's
//! variables and the last step output. The grammar is deliberately small:
//!
//! ```text
//! expr       := or
//! or         := and ('||' and)*
//! and        := unary ('&&' unary)*
//! unary      := '!' unary | comparison
//! comparison := operand (('==' | '!=' | '<' | '<=' | '>' | '>=') operand)?
//! operand    := literal | variable | '(' expr ')'
//! literal    := 'null' | 'true' | 'false' | number | 'single-quoted string'
//! variable   := ident ('.' ident)*        e.g.  score, user.tier, output.total
//! ```
//!
//! Resolution rules:
//!
//! - `output` (and dot paths under it) reads the last step output; every
//!   other root name reads the variables map, with dot paths descending
//!   into nested objects.
//! - A missing variable resolves to null. Null compares equal only to null;
//!   ordering against null is false.
//! - Numbers compare as f64; strings lexicographically; booleans by
//!   equality. Mismatched types: `==` is false, `!=` is true, ordering is
//!   false.
//! - A non-boolean expression result coerces by truthiness: null and empty
//!   string/array/object are false, zero is false, everything else true.

use crate::error::{FlowError, Result};
use serde_json::Value;
use std::collections::HashMap;

/// What a guard evaluates against: the variables map and the last output
#[derive(Debug, Clone, Copy)]
pub struct GuardContext<'a> {
    variables: &'a HashMap<String, Value>,
    last_output: Option<&'a Value>,
}

impl<'a> GuardContext<'a> {
    /// Context over the given variables with no step output yet
    pub fn new(variables: &'a HashMap<String, Value>) -> Self {
        Self {
            variables,
            last_output: None,
        }
    }

    /// Attach the last step output (readable as `output` in expressions)
    pub fn with_last_output(mut self, output: Option<&'a Value>) -> Self {
        self.last_output = output;
        self
    }

    fn resolve(&self, path: &[String]) -> Value {
        let (root, rest) = match path.split_first() {
            Some(split) => split,
            None => return Value::Null,
        };

        let mut current: &Value = if root == "output" {
            match self.last_output {
                Some(v) => v,
                None => return Value::Null,
            }
        } else {
            match self.variables.get(root) {
                Some(v) => v,
                None => return Value::Null,
            }
        };

        for segment in rest {
            match current.get(segment) {
                Some(v) => current = v,
                None => return Value::Null,
            }
        }
        current.clone()
    }
}

/// Evaluate a guard expression to a boolean
pub fn evaluate(expression: &str, ctx: &GuardContext<'_>) -> Result<bool> {
    let tokens = tokenize(expression)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        expression,
    };
    let value = parser.parse_or(ctx)?;
    if parser.pos != tokens.len() {
        return Err(FlowError::Guard(format!(
            "trailing input at token {} in '{}'",
            parser.pos, expression
        )));
    }
    Ok(truthy(&value))
}

/// Truthiness coercion for non-boolean guard results
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(Vec<String>),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
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
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
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
            '\'' => {
                let mut s = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            s.push(*ch);
                            i += 1;
                        }
                        None => {
                            return Err(FlowError::Guard(format!(
                                "unterminated string in '{}'",
                                input
                            )))
                        }
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == 'e')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| FlowError::Guard(format!("bad number '{}' in '{}'", text, input)))?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                match text.as_str() {
                    "true" => tokens.push(Token::True),
                    "false" => tokens.push(Token::False),
                    "null" => tokens.push(Token::Null),
                    _ => {
                        let path: Vec<String> = text.split('.').map(str::to_string).collect();
                        if path.iter().any(|p| p.is_empty()) {
                            return Err(FlowError::Guard(format!(
                                "malformed variable path '{}' in '{}'",
                                text, input
                            )));
                        }
                        tokens.push(Token::Ident(path));
                    }
                }
            }
            other => {
                return Err(FlowError::Guard(format!(
                    "unexpected character '{}' in '{}'",
                    other, input
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    expression: &'a str,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_or(&mut self, ctx: &GuardContext<'_>) -> Result<Value> {
        let mut left = self.parse_and(ctx)?;
        while self.peek() == Some(&Token::Or) {
            self.bump();
            let right = self.parse_and(ctx)?;
            left = Value::Bool(truthy(&left) || truthy(&right));
        }
        Ok(left)
    }

    fn parse_and(&mut self, ctx: &GuardContext<'_>) -> Result<Value> {
        let mut left = self.parse_unary(ctx)?;
        while self.peek() == Some(&Token::And) {
            self.bump();
            let right = self.parse_unary(ctx)?;
            left = Value::Bool(truthy(&left) && truthy(&right));
        }
        Ok(left)
    }

    fn parse_unary(&mut self, ctx: &GuardContext<'_>) -> Result<Value> {
        if self.peek() == Some(&Token::Not) {
            self.bump();
            let value = self.parse_unary(ctx)?;
            return Ok(Value::Bool(!truthy(&value)));
        }
        self.parse_comparison(ctx)
    }

    fn parse_comparison(&mut self, ctx: &GuardContext<'_>) -> Result<Value> {
        let left = self.parse_operand(ctx)?;
        let op = match self.peek() {
            Some(Token::Eq) => Cmp::Eq,
            Some(Token::Ne) => Cmp::Ne,
            Some(Token::Lt) => Cmp::Lt,
            Some(Token::Le) => Cmp::Le,
            Some(Token::Gt) => Cmp::Gt,
            Some(Token::Ge) => Cmp::Ge,
            _ => return Ok(left),
        };
        self.bump();
        let right = self.parse_operand(ctx)?;
        Ok(Value::Bool(compare(&left, &right, op)))
    }

    fn parse_operand(&mut self, ctx: &GuardContext<'_>) -> Result<Value> {
        match self.bump().cloned() {
            Some(Token::Null) => Ok(Value::Null),
            Some(Token::True) => Ok(Value::Bool(true)),
            Some(Token::False) => Ok(Value::Bool(false)),
            Some(Token::Number(n)) => serde_json::Number::from_f64(n)
                .map(Value::Number)
                .ok_or_else(|| {
                    FlowError::Guard(format!("non-finite number in '{}'", self.expression))
                }),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Ident(path)) => Ok(ctx.resolve(&path)),
            Some(Token::LParen) => {
                let value = self.parse_or(ctx)?;
                match self.bump() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err(FlowError::Guard(format!(
                        "missing ')' in '{}'",
                        self.expression
                    ))),
                }
            }
            other => Err(FlowError::Guard(format!(
                "unexpected token {:?} in '{}'",
                other, self.expression
            ))),
        }
    }
}

#[derive(Clone, Copy)]
enum Cmp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

fn compare(left: &Value, right: &Value, op: Cmp) -> bool {
    use std::cmp::Ordering;

    let ordering = match (left, right) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(a), Value::Bool(b)) => {
            if a == b {
                Some(Ordering::Equal)
            } else {
                // Booleans support ==/!= only; ordering stays undefined
                None
            }
        }
        (Value::Number(a), Value::Number(b)) => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };

    match (op, ordering) {
        (Cmp::Eq, Some(Ordering::Equal)) => true,
        (Cmp::Eq, _) => false,
        (Cmp::Ne, Some(Ordering::Equal)) => false,
        (Cmp::Ne, _) => true,
        (Cmp::Lt, Some(Ordering::Less)) => true,
        (Cmp::Le, Some(Ordering::Less | Ordering::Equal)) => true,
        (Cmp::Gt, Some(Ordering::Greater)) => true,
        (Cmp::Ge, Some(Ordering::Greater | Ordering::Equal)) => true,
        _ => false,
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    proptest! {
        /// Arbitrary input never panics the parser: it parses or it
        /// reports a Guard error.
        #[test]
        fn evaluation_never_panics(expr in ".{0,48}") {
            let vars = HashMap::new();
            let ctx = GuardContext::new(&vars);
            let _ = evaluate(&expr, &ctx);
        }

        /// Numeric comparisons agree with native integer ordering.
        #[test]
        fn numeric_comparisons_match_native_ordering(
            x in -1_000_000i64..1_000_000,
            bound in -1_000_000i64..1_000_000
        ) {
            let mut vars = HashMap::new();
            vars.insert("x".to_string(), json!(x));
            let ctx = GuardContext::new(&vars);

            prop_assert_eq!(evaluate(&format!("x < {}", bound), &ctx).unwrap(), x < bound);
            prop_assert_eq!(evaluate(&format!("x >= {}", bound), &ctx).unwrap(), x >= bound);
            prop_assert_eq!(evaluate(&format!("x == {}", bound), &ctx).unwrap(), x == bound);
            prop_assert_eq!(evaluate(&format!("x != {}", bound), &ctx).unwrap(), x != bound);
        }

        /// Double negation restores the original truth value.
        #[test]
        fn negation_is_involutive(flag in any::<bool>()) {
            let mut vars = HashMap::new();
            vars.insert("flag".to_string(), json!(flag));
            let ctx = GuardContext::new(&vars);

            prop_assert_eq!(evaluate("flag", &ctx).unwrap(), flag);
            prop_assert_eq!(evaluate("!!flag", &ctx).unwrap(), flag);
        }
    }
}
