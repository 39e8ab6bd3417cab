//! Predicates for Condition branches and Loop exit checks.
//!
//! Four kinds are supported: substring containment, regex match, length
//! comparison, and a small expression language:
//!
//! ```text
//! ExpressionExpr ::= Clause ( '&&' Clause )*
//! Clause         ::= Key Operator Literal
//! Key            ::= 'output' | 'input' | 'length'
//! Operator       ::= '=' | '!='
//! Literal        ::= QuotedString | BareWord
//! ```

use cascade_types::CascadeError;
use serde::{Deserialize, Serialize};

/// How a `LengthCompare` predicate compares the input length to its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LengthOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

/// A predicate evaluated against a node's resolved input text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Predicate {
    Contains { value: String },
    Regex { pattern: String },
    LengthCompare { op: LengthOp, value: usize },
    Expression { expr: String },
}

impl Predicate {
    /// Evaluate against `text`, with `input` as the session's initial input
    /// (available to `Expression` clauses).
    ///
    /// Invalid regexes and malformed expressions should be caught by
    /// validation; at evaluation time they conservatively yield `false`.
    pub fn evaluate(&self, text: &str, input: &str) -> bool {
        match self {
            Predicate::Contains { value } => text.contains(value.as_str()),
            Predicate::Regex { pattern } => match regex::Regex::new(pattern) {
                Ok(re) => re.is_match(text),
                Err(_) => false,
            },
            Predicate::LengthCompare { op, value } => {
                let len = text.chars().count();
                match op {
                    LengthOp::Lt => len < *value,
                    LengthOp::Le => len <= *value,
                    LengthOp::Gt => len > *value,
                    LengthOp::Ge => len >= *value,
                    LengthOp::Eq => len == *value,
                }
            }
            Predicate::Expression { expr } => match parse_expression(expr) {
                Ok(parsed) => evaluate_expression(&parsed, &|key| match key {
                    "output" => text.to_string(),
                    "input" => input.to_string(),
                    "length" => text.chars().count().to_string(),
                    _ => String::new(),
                }),
                Err(_) => false,
            },
        }
    }

    /// Syntax check used by the graph validator. Evaluation itself never fails.
    pub fn check(&self) -> Result<(), CascadeError> {
        match self {
            Predicate::Regex { pattern } => regex::Regex::new(pattern)
                .map(|_| ())
                .map_err(|e| make_error(&format!("invalid regex '{pattern}': {e}"))),
            Predicate::Expression { expr } => parse_expression(expr).map(|_| ()),
            _ => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// Expression mini-language
// ---------------------------------------------------------------------------

/// A parsed expression consisting of one or more clauses joined by `&&`.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpressionExpr {
    pub clauses: Vec<Clause>,
}

/// A single comparison clause: `key op value`.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub key: String,
    pub operator: Operator,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
}

/// Parse an expression string. An empty or whitespace-only input produces an
/// expression with zero clauses, which [`evaluate_expression`] treats as true.
pub fn parse_expression(input: &str) -> Result<ExpressionExpr, CascadeError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(ExpressionExpr {
            clauses: Vec::new(),
        });
    }

    let mut clauses = Vec::new();
    for part in trimmed.split("&&") {
        clauses.push(parse_clause(part.trim())?);
    }
    Ok(ExpressionExpr { clauses })
}

fn parse_clause(input: &str) -> Result<Clause, CascadeError> {
    if input.is_empty() {
        return Err(make_error("empty clause"));
    }

    let (key_end, operator, op_len) = find_operator(input)?;

    let key = input[..key_end].trim().to_string();
    if key.is_empty() {
        return Err(make_error("missing key before operator"));
    }
    if !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return Err(make_error(&format!("invalid key: '{key}'")));
    }

    let raw_value = input[key_end + op_len..].trim();
    if raw_value.is_empty() {
        return Err(make_error(&format!(
            "missing value after operator in '{input}'"
        )));
    }

    Ok(Clause {
        key,
        operator,
        value: strip_quotes(raw_value),
    })
}

fn find_operator(input: &str) -> Result<(usize, Operator, usize), CascadeError> {
    // Scan for `!=` or `=`, skipping quoted regions.
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'"' | b'\'' => {
                let quote = bytes[i];
                i += 1;
                while i < bytes.len() && bytes[i] != quote {
                    i += 1;
                }
                i += 1;
            }
            b'!' if i + 1 < bytes.len() && bytes[i + 1] == b'=' => {
                return Ok((i, Operator::NotEq, 2));
            }
            b'=' => {
                return Ok((i, Operator::Eq, 1));
            }
            _ => {
                i += 1;
            }
        }
    }
    Err(make_error(&format!("no operator found in '{input}'")))
}

fn strip_quotes(s: &str) -> String {
    if s.len() >= 2 {
        let bytes = s.as_bytes();
        if (bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\'')
        {
            return s[1..s.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn make_error(msg: &str) -> CascadeError {
    CascadeError::Validation(format!("expression parse error: {msg}"))
}

/// Evaluate a parsed expression. Keys absent from the resolver resolve to the
/// empty string. Zero clauses evaluate to `true`.
pub fn evaluate_expression(expr: &ExpressionExpr, resolve: &dyn Fn(&str) -> String) -> bool {
    expr.clauses.iter().all(|clause| {
        let actual = resolve(&clause.key);
        match clause.operator {
            Operator::Eq => actual == clause.value,
            Operator::NotEq => actual != clause.value,
        }
    })
}
