//! Parsing of `name=value` constant placeholder expressions.
//!
//! The literal decides the type:
//! - `true` / `false` (any case) is a bool
//! - a literal with `.`, `e` or `E` that parses as a float is a float
//! - a literal that parses as a 32-bit integer is an int
//!
//! Anything else is rejected.

use crate::core::error::ExpressionError;
use crate::core::types::{ConstantPlaceholder, ScalarValue};

/// Parse a single `name=value` expression.
pub fn parse_expression(expression: &str) -> Result<ConstantPlaceholder, ExpressionError> {
    let syntax = |reason: &str| ExpressionError::Syntax {
        expression: expression.to_string(),
        reason: reason.to_string(),
    };

    let (name, literal) = expression
        .split_once('=')
        .ok_or_else(|| syntax("expected name=value"))?;

    let name = name.trim();
    let literal = literal.trim();
    if name.is_empty() {
        return Err(syntax("placeholder name is empty"));
    }
    if literal.is_empty() {
        return Err(syntax("value is empty"));
    }

    let value = parse_literal(literal).ok_or_else(|| syntax("value is not an int, float or bool"))?;
    Ok(ConstantPlaceholder::new(name, value))
}

/// Parse a list of expressions, failing on the first malformed one.
pub fn parse_expressions<I, S>(expressions: I) -> Result<Vec<ConstantPlaceholder>, ExpressionError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    expressions
        .into_iter()
        .map(|e| parse_expression(e.as_ref()))
        .collect()
}

fn parse_literal(literal: &str) -> Option<ScalarValue> {
    if literal.eq_ignore_ascii_case("true") {
        return Some(ScalarValue::Bool(true));
    }
    if literal.eq_ignore_ascii_case("false") {
        return Some(ScalarValue::Bool(false));
    }

    let looks_float = literal.contains(['.', 'e', 'E']);
    if looks_float {
        return literal.parse::<f32>().ok().map(ScalarValue::Float);
    }

    literal.parse::<i32>().ok().map(ScalarValue::Int)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        let c = parse_expression("is_training=FALSE").unwrap();
        assert_eq!(c.name, "is_training");
        assert_eq!(c.value, ScalarValue::Bool(false));
        assert_eq!(parse_expression("flag=True").unwrap().value, ScalarValue::Bool(true));
    }

    #[test]
    fn test_parse_numbers() {
        assert_eq!(parse_expression("dropout=0.0").unwrap().value, ScalarValue::Float(0.0));
        assert_eq!(parse_expression("lr=1e-3").unwrap().value, ScalarValue::Float(1e-3));
        assert_eq!(parse_expression("k = -7").unwrap().value, ScalarValue::Int(-7));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in ["dropout", "=1", "x=", "x=abc", "x=1.2.3", "x=99999999999"] {
            let err = parse_expression(bad).unwrap_err();
            assert!(matches!(err, ExpressionError::Syntax { .. }), "{}", bad);
        }
    }

    #[test]
    fn test_parse_list_stops_on_first_error() {
        let parsed = parse_expressions(["a=1", "b=true"]).unwrap();
        assert_eq!(parsed.len(), 2);
        assert!(parse_expressions(["a=1", "b"]).is_err());
    }
}
