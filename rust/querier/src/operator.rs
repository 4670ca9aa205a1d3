//! Comparison operator normalization for the ClickHouse dialect.

use crate::error::{QuerierError, Result};
use serde::Serialize;
use std::borrow::Cow;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    NotEq,
    Lt,
    Lte,
    Gt,
    Gte,
    In,
    NotIn,
    Like,
    NotLike,
    Regexp,
    NotRegexp,
}

impl Operator {
    /// Parses a source operator token. `tag` only feeds the error message.
    pub fn parse(token: &str, tag: &str) -> Result<Self> {
        let normalized = token
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();

        match normalized.as_str() {
            "=" => Ok(Operator::Eq),
            "!=" | "<>" => Ok(Operator::NotEq),
            "<" => Ok(Operator::Lt),
            "<=" => Ok(Operator::Lte),
            ">" => Ok(Operator::Gt),
            ">=" => Ok(Operator::Gte),
            "in" => Ok(Operator::In),
            "not in" => Ok(Operator::NotIn),
            "like" => Ok(Operator::Like),
            "not like" => Ok(Operator::NotLike),
            "regexp" => Ok(Operator::Regexp),
            "not regexp" => Ok(Operator::NotRegexp),
            _ => Err(QuerierError::unsupported_operator(token.trim(), tag)),
        }
    }

    /// Target dialect token.
    pub fn dialect(self) -> &'static str {
        match self {
            Operator::Eq => "=",
            Operator::NotEq => "!=",
            Operator::Lt => "<",
            Operator::Lte => "<=",
            Operator::Gt => ">",
            Operator::Gte => ">=",
            Operator::In => "in",
            Operator::NotIn => "not in",
            Operator::Like => "ilike",
            Operator::NotLike => "not ilike",
            Operator::Regexp => "match",
            Operator::NotRegexp => "not match",
        }
    }

    pub fn is_regexp(self) -> bool {
        matches!(self, Operator::Regexp | Operator::NotRegexp)
    }

    pub fn is_like(self) -> bool {
        matches!(self, Operator::Like | Operator::NotLike)
    }

    pub fn is_list(self) -> bool {
        matches!(self, Operator::In | Operator::NotIn)
    }

    pub fn is_range(self) -> bool {
        matches!(
            self,
            Operator::Lt | Operator::Lte | Operator::Gt | Operator::Gte
        )
    }

    pub fn is_negative(self) -> bool {
        matches!(
            self,
            Operator::NotEq | Operator::NotIn | Operator::NotLike | Operator::NotRegexp
        )
    }

    /// The non-negated counterpart; subquery families wrap it in `not(...)`.
    pub fn positive(self) -> Self {
        match self {
            Operator::NotEq => Operator::Eq,
            Operator::NotIn => Operator::In,
            Operator::NotLike => Operator::Like,
            Operator::NotRegexp => Operator::Regexp,
            other => other,
        }
    }

    /// Rewrites `*` wildcards to `%` for the like family; other values pass untouched.
    pub fn rewrite_wildcards<'a>(self, value: &'a str) -> Cow<'a, str> {
        if self.is_like() && value.contains('*') {
            Cow::Owned(value.replace('*', "%"))
        } else {
            Cow::Borrowed(value)
        }
    }

    /// Renders `<subject> <op> <value>`, or `<op>(<subject>,<value>)` for regexp operators.
    pub fn compare(self, subject: &str, value: &str) -> String {
        if self.is_regexp() {
            format!("{}({subject},{value})", self.dialect())
        } else {
            format!("{subject} {} {value}", self.dialect())
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dialect())
    }
}

/// Wraps `predicate` in `not(...)` when `op` is negated.
pub fn negate_if(op: Operator, predicate: String) -> String {
    if op.is_negative() {
        format!("not({predicate})")
    } else {
        predicate
    }
}
