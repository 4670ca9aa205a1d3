//! Time-window extraction for the reserved `time` tag.

use crate::{
    encode::unquote,
    error::{QuerierError, Result},
    operator::Operator,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

pub const TIME_TAG: &str = "time";

/// Query window in unix seconds. The last write wins for each bound.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end: Option<i64>,
}

impl TimeWindow {
    pub fn add_start(&mut self, start: i64) {
        self.start = Some(start);
    }

    pub fn add_end(&mut self, end: i64) {
        self.end = Some(end);
    }

    /// Folds a `time <op> <value>` comparison into the window and returns its filter text.
    pub fn extract(&mut self, tag: &str, op: Operator, raw: &str) -> Result<String> {
        let seconds = parse_time_value(raw)
            .map_err(|reason| QuerierError::malformed(tag, raw, reason))?;
        match op {
            Operator::Gte => self.add_start(seconds),
            Operator::Lte => self.add_end(seconds),
            _ => {}
        }
        Ok(format!("{tag} {op} {}", raw.trim()))
    }
}

/// Integer, arithmetic expression or quoted datetime literal, in unix seconds.
pub fn parse_time_value(raw: &str) -> std::result::Result<i64, String> {
    let value = raw.trim();
    if let Ok(seconds) = value.parse::<i64>() {
        return Ok(seconds);
    }

    if value.starts_with('\'') || value.starts_with('"') {
        return parse_datetime(unquote(value)).map(|dt| dt.timestamp());
    }

    let result = Evaluator::new(value).evaluate()?;
    if !result.is_finite() {
        return Err("expression does not evaluate to a finite number".into());
    }
    Ok(result as i64)
}

fn parse_datetime(value: &str) -> std::result::Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(DateTime::<Utc>::from_naive_utc_and_offset(dt, Utc));
    }
    Err(format!("invalid time literal '{value}'"))
}

/// Deepest parenthesis or unary-minus nesting the evaluator accepts.
const MAX_NESTING: usize = 64;

/// Recursive-descent evaluator for `+ - * /` and parentheses.
struct Evaluator<'a> {
    input: &'a [u8],
    pos: usize,
    depth: usize,
}

impl<'a> Evaluator<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
            depth: 0,
        }
    }

    fn evaluate(mut self) -> std::result::Result<f64, String> {
        let value = self.expression()?;
        self.skip_whitespace();
        if self.pos != self.input.len() {
            return Err(format!("unexpected input at offset {}", self.pos));
        }
        Ok(value)
    }

    fn skip_whitespace(&mut self) {
        while self.pos < self.input.len() && self.input[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn peek(&mut self) -> Option<u8> {
        self.skip_whitespace();
        self.input.get(self.pos).copied()
    }

    fn expression(&mut self) -> std::result::Result<f64, String> {
        let mut value = self.term()?;
        while let Some(op @ (b'+' | b'-')) = self.peek() {
            self.pos += 1;
            let rhs = self.term()?;
            value = if op == b'+' { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    fn term(&mut self) -> std::result::Result<f64, String> {
        let mut value = self.factor()?;
        while let Some(op @ (b'*' | b'/')) = self.peek() {
            self.pos += 1;
            let rhs = self.factor()?;
            if op == b'*' {
                value *= rhs;
            } else {
                if rhs == 0.0 {
                    return Err("division by zero".into());
                }
                value /= rhs;
            }
        }
        Ok(value)
    }

    fn factor(&mut self) -> std::result::Result<f64, String> {
        match self.peek() {
            Some(b'-') => {
                self.pos += 1;
                self.descend()?;
                let value = self.factor();
                self.depth -= 1;
                Ok(-value?)
            }
            Some(b'(') => {
                self.pos += 1;
                self.descend()?;
                let value = self.expression();
                self.depth -= 1;
                let value = value?;
                if self.peek() != Some(b')') {
                    return Err("unbalanced parentheses".into());
                }
                self.pos += 1;
                Ok(value)
            }
            Some(ch) if ch.is_ascii_digit() || ch == b'.' => self.number(),
            Some(ch) => Err(format!("unexpected character '{}'", ch as char)),
            None => Err("unexpected end of expression".into()),
        }
    }

    fn descend(&mut self) -> std::result::Result<(), String> {
        if self.depth >= MAX_NESTING {
            return Err("expression nested too deeply".into());
        }
        self.depth += 1;
        Ok(())
    }

    fn number(&mut self) -> std::result::Result<f64, String> {
        let start = self.pos;
        while self.pos < self.input.len()
            && (self.input[self.pos].is_ascii_digit() || self.input[self.pos] == b'.')
        {
            self.pos += 1;
        }
        let text = std::str::from_utf8(&self.input[start..self.pos]).map_err(|err| err.to_string())?;
        text.parse::<f64>()
            .map_err(|_| format!("invalid number '{text}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_tracks_last_write_per_bound() {
        let mut window = TimeWindow::default();
        assert_eq!(
            window.extract("time", Operator::Gte, "100").unwrap(),
            "time >= 100"
        );
        window.extract("time", Operator::Gte, "200").unwrap();
        window.extract("time", Operator::Lte, "300").unwrap();
        assert_eq!(
            window,
            TimeWindow {
                start: Some(200),
                end: Some(300)
            }
        );
    }

    #[test]
    fn other_operators_leave_window_untouched() {
        let mut window = TimeWindow::default();
        assert_eq!(window.extract("time", Operator::Gt, "5").unwrap(), "time > 5");
        assert_eq!(window, TimeWindow::default());
    }

    #[test]
    fn deeply_nested_expression_is_malformed() {
        let raw = format!("{}1{}", "(".repeat(10_000), ")".repeat(10_000));
        let err = TimeWindow::default()
            .extract("time", Operator::Gte, &raw)
            .unwrap_err();
        assert!(matches!(
            err,
            QuerierError::MalformedLiteral { ref reason, .. } if reason == "expression nested too deeply"
        ));

        let negations = format!("{}5", "-".repeat(10_000));
        assert_eq!(
            parse_time_value(&negations).unwrap_err(),
            "expression nested too deeply"
        );
        assert_eq!(parse_time_value("((((1))))+--2").unwrap(), 3);
    }

    #[test]
    fn evaluates_arithmetic_at_compile_time() {
        assert_eq!(parse_time_value("1700000000 - 60*5").unwrap(), 1_699_999_700);
        assert_eq!(parse_time_value("(10 + 2) / 5").unwrap(), 2);
        assert_eq!(parse_time_value("-3 + 10").unwrap(), 7);
    }

    #[test]
    fn parses_quoted_datetimes() {
        assert_eq!(parse_time_value("'2024-01-01 00:00:00'").unwrap(), 1_704_067_200);
        assert_eq!(parse_time_value("'2024-01-01T00:00:00Z'").unwrap(), 1_704_067_200);
    }

    #[test]
    fn malformed_expression_is_reported() {
        let mut window = TimeWindow::default();
        let err = window.extract("time", Operator::Gte, "now() - 5").unwrap_err();
        assert!(matches!(err, QuerierError::MalformedLiteral { .. }));
        assert!(parse_time_value("(1 + 2").is_err());
        assert!(parse_time_value("4 / 0").is_err());
    }
}
