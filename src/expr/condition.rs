// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
//! Sequence flow conditions.
//!
//! ```text
//! condition  := or
//! or         := and ( "||" and )*
//! and        := unary ( "&&" unary )*
//! unary      := "!" unary | "(" condition ")" | comparison
//! comparison := operand ( op operand )?
//! operand    := $.path | number | 'string' | "string" | true | false | null
//! op         := == | != | < | <= | > | >=
//! ```
//!
//! A bare operand must evaluate to a boolean. Conditions are parsed once at
//! deployment and evaluated against the variables visible to the gateway.

use std::cmp::Ordering;
use std::fmt;

use serde_json::Value;

use super::path::JsonPath;
use super::{Document, ProcessingFailure};
use crate::record::ErrorType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Path(JsonPath),
    Literal(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Or(Box<Condition>, Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
    Compare {
        left: Operand,
        op: CompareOp,
        right: Operand,
    },
    Truthy(Operand),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionParseError {
    pub expression: String,
    pub message: String,
}

impl fmt::Display for ConditionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid condition '{}': {}", self.expression, self.message)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(String),
    Number(f64),
    Str(String),
    True,
    False,
    Null,
    Op(CompareOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' | '|' => {
                if chars.get(i + 1) != Some(&c) {
                    return Err(format!("expected '{c}{c}' at {i}"));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            '=' | '!' | '<' | '>' => {
                let eq = chars.get(i + 1) == Some(&'=');
                let token = match (c, eq) {
                    ('=', true) => Token::Op(CompareOp::Eq),
                    ('=', false) => return Err(format!("expected '==' at {i}")),
                    ('!', true) => Token::Op(CompareOp::Ne),
                    ('!', false) => Token::Not,
                    ('<', true) => Token::Op(CompareOp::Le),
                    ('<', false) => Token::Op(CompareOp::Lt),
                    ('>', true) => Token::Op(CompareOp::Ge),
                    _ => Token::Op(CompareOp::Gt),
                };
                tokens.push(token);
                i += if eq { 2 } else { 1 };
            }
            '\'' | '"' => {
                let quote = c;
                let start = i + 1;
                let mut end = start;
                while end < chars.len() && chars[end] != quote {
                    end += 1;
                }
                if end == chars.len() {
                    return Err(format!("unterminated string at {i}"));
                }
                tokens.push(Token::Str(chars[start..end].iter().collect()));
                i = end + 1;
            }
            '$' => {
                let start = i;
                i += 1;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || matches!(chars[i], '.' | '_' | '-' | '[' | ']'))
                {
                    i += 1;
                }
                tokens.push(Token::Path(chars[start..i].iter().collect()));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || matches!(chars[i], '.' | 'e' | 'E')) {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| format!("invalid number '{text}'"))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() => {
                let start = i;
                while i < chars.len() && chars[i].is_alphanumeric() {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::True,
                    "false" => Token::False,
                    "null" => Token::Null,
                    _ => return Err(format!("unknown word '{word}'")),
                });
            }
            other => return Err(format!("unexpected character '{other}' at {i}")),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn or(&mut self) -> Result<Condition, String> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and()?;
            left = Condition::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Condition, String> {
        let mut left = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.unary()?;
            left = Condition::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Condition, String> {
        match self.peek() {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(Condition::Not(Box::new(self.unary()?)))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.or()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("expected ')'".to_string()),
                }
            }
            _ => self.comparison(),
        }
    }

    fn comparison(&mut self) -> Result<Condition, String> {
        let left = self.operand()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.operand()?;
            return Ok(Condition::Compare { left, op, right });
        }
        Ok(Condition::Truthy(left))
    }

    fn operand(&mut self) -> Result<Operand, String> {
        match self.advance() {
            Some(Token::Path(text)) => JsonPath::parse(&text)
                .map(Operand::Path)
                .map_err(|e| e.0),
            Some(Token::Number(n)) => serde_json::Number::from_f64(n)
                .map(|n| Operand::Literal(Value::Number(n)))
                .ok_or_else(|| format!("invalid number {n}")),
            Some(Token::Str(s)) => Ok(Operand::Literal(Value::String(s))),
            Some(Token::True) => Ok(Operand::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Operand::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Operand::Literal(Value::Null)),
            Some(other) => Err(format!("unexpected {other:?}")),
            None => Err("unexpected end of condition".to_string()),
        }
    }
}

fn condition_error(message: String) -> ProcessingFailure {
    ProcessingFailure::new(ErrorType::ConditionError, message)
}

pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "NULL",
        Value::Bool(_) => "BOOLEAN",
        Value::Number(_) => "NUMBER",
        Value::String(_) => "STRING",
        Value::Array(_) => "ARRAY",
        Value::Object(_) => "OBJECT",
    }
}

impl Condition {
    pub fn parse(expression: &str) -> Result<Self, ConditionParseError> {
        let error = |message: String| ConditionParseError {
            expression: expression.to_string(),
            message,
        };
        let tokens = tokenize(expression).map_err(error)?;
        if tokens.is_empty() {
            return Err(error("empty condition".to_string()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let condition = parser.or().map_err(error)?;
        if parser.pos < parser.tokens.len() {
            return Err(error(format!("unexpected {:?}", parser.tokens[parser.pos])));
        }
        Ok(condition)
    }

    pub fn evaluate(&self, variables: &Document) -> Result<bool, ProcessingFailure> {
        match self {
            Condition::Or(a, b) => Ok(a.evaluate(variables)? || b.evaluate(variables)?),
            Condition::And(a, b) => Ok(a.evaluate(variables)? && b.evaluate(variables)?),
            Condition::Not(inner) => Ok(!inner.evaluate(variables)?),
            Condition::Truthy(operand) => match resolve(operand, variables)? {
                Value::Bool(b) => Ok(b),
                other => Err(condition_error(format!(
                    "Expected boolean but found {} '{other}'",
                    type_name(&other)
                ))),
            },
            Condition::Compare { left, op, right } => {
                let left = resolve(left, variables)?;
                let right = resolve(right, variables)?;
                compare(&left, *op, &right)
            }
        }
    }
}

fn resolve(operand: &Operand, variables: &Document) -> Result<Value, ProcessingFailure> {
    match operand {
        Operand::Literal(value) => Ok(value.clone()),
        Operand::Path(path) => path
            .resolve(variables)
            .ok_or_else(|| condition_error(format!("No data found for query {path}."))),
    }
}

fn compare(left: &Value, op: CompareOp, right: &Value) -> Result<bool, ProcessingFailure> {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            a.partial_cmp(&b)
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) if matches!(op, CompareOp::Eq | CompareOp::Ne) => {
            Some(a.cmp(b))
        }
        (Value::Null, _) | (_, Value::Null) if matches!(op, CompareOp::Eq | CompareOp::Ne) => {
            let equal = left.is_null() && right.is_null();
            return Ok(equal == (op == CompareOp::Eq));
        }
        _ => {
            return Err(condition_error(format!(
                "Cannot compare values of different types: {} and {}",
                type_name(left),
                type_name(right)
            )))
        }
    };

    let Some(ordering) = ordering else {
        return Ok(op == CompareOp::Ne);
    };
    Ok(match op {
        CompareOp::Eq => ordering == Ordering::Equal,
        CompareOp::Ne => ordering != Ordering::Equal,
        CompareOp::Lt => ordering == Ordering::Less,
        CompareOp::Le => ordering != Ordering::Greater,
        CompareOp::Gt => ordering == Ordering::Greater,
        CompareOp::Ge => ordering != Ordering::Less,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(expression: &str, variables: Value) -> Result<bool, ProcessingFailure> {
        let doc = Document::from_value(variables).unwrap();
        Condition::parse(expression).unwrap().evaluate(&doc)
    }

    #[test]
    fn test_comparisons() {
        let vars = json!({"total": 120, "status": "open", "vip": true});
        assert!(eval("$.total > 100", vars.clone()).unwrap());
        assert!(eval("$.total <= 120", vars.clone()).unwrap());
        assert!(eval("$.status == 'open'", vars.clone()).unwrap());
        assert!(eval("$.status != \"closed\"", vars.clone()).unwrap());
        assert!(eval("$.vip", vars.clone()).unwrap());
        assert!(!eval("!$.vip", vars).unwrap());
    }

    #[test]
    fn test_boolean_operators_and_grouping() {
        let vars = json!({"a": 1, "b": 2});
        assert!(eval("$.a == 1 && $.b == 2", vars.clone()).unwrap());
        assert!(eval("$.a == 5 || $.b == 2", vars.clone()).unwrap());
        assert!(!eval("!($.a < $.b)", vars.clone()).unwrap());
        // short-circuit: the missing path is never read
        assert!(eval("$.a == 1 || $.missing > 3", vars).unwrap());
    }

    #[test]
    fn test_evaluation_failures_are_condition_errors() {
        let err = eval("$.missing > 3", json!({})).unwrap_err();
        assert_eq!(err.error_type, ErrorType::ConditionError);
        assert!(err.message.contains("$.missing"));

        let err = eval("$.name > 3", json!({"name": "x"})).unwrap_err();
        assert!(err.message.contains("different types"));

        assert!(eval("$.n", json!({"n": 1})).is_err());
    }

    #[test]
    fn test_null_equality() {
        assert!(eval("$.x == null", json!({"x": null})).unwrap());
        assert!(eval("$.x != null", json!({"x": 4})).unwrap());
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["", "$.a ==", "$.a = 1", "($.a == 1", "$.a == 1 )", "maybe", "'open"] {
            assert!(Condition::parse(bad).is_err(), "{bad} should not parse");
        }
    }
}
