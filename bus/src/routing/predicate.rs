//! Predicate evaluation
//!
//! Walks the [`Predicate`] AST against a concrete message. Missing paths
//! are not errors: a leaf on a missing path is false (`neq` is true), so
//! routes can probe optional fields without blowing up. Errors are reserved
//! for genuinely malformed predicates - non-numeric ordering comparisons,
//! a non-array `in` operand, an uncompilable regex - and surface as
//! `PREDICATE_ERROR` through the engine.

use super::path;
use super::spec::Predicate;
use serde_json::Value;
use vayla_core::Message;

/// Evaluate `pred` against `message`
///
/// `Err` carries the malformation detail for the `PREDICATE_ERROR` report.
pub(crate) fn eval(pred: &Predicate, message: &Message) -> Result<bool, String> {
    match pred {
        Predicate::Eq { path, value } => {
            Ok(path::resolve(message, path).is_some_and(|v| json_eq(&v, value)))
        }
        Predicate::Neq { path, value } => Ok(match path::resolve(message, path) {
            Some(v) => !json_eq(&v, value),
            None => true,
        }),
        Predicate::Gt { path, value } => ordering(message, path, value, |o| o > 0.0),
        Predicate::Gte { path, value } => ordering(message, path, value, |o| o >= 0.0),
        Predicate::Lt { path, value } => ordering(message, path, value, |o| o < 0.0),
        Predicate::Lte { path, value } => ordering(message, path, value, |o| o <= 0.0),
        Predicate::In { path, value } => {
            let Some(candidates) = value.as_array() else {
                return Err("'in' requires an array value".into());
            };
            Ok(path::resolve(message, path)
                .is_some_and(|v| candidates.iter().any(|c| json_eq(&v, c))))
        }
        Predicate::Regex { path, value } => {
            let re = regex::Regex::new(value)
                .map_err(|e| format!("invalid regex '{value}': {e}"))?;
            Ok(path::resolve(message, path)
                .as_ref()
                .and_then(Value::as_str)
                .is_some_and(|s| re.is_match(s)))
        }
        Predicate::And { children } => {
            for child in children {
                if !eval(child, message)? {
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Predicate::Or { children } => {
            for child in children {
                if eval(child, message)? {
                    return Ok(true);
                }
            }
            Ok(false)
        }
        Predicate::Not { child } => Ok(!eval(child, message)?),
    }
}

/// JSON equality with cross-representation numeric comparison
///
/// `serde_json` treats `1` and `1.0` as different `Number`s; rule authors
/// do not.
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn ordering(
    message: &Message,
    path: &str,
    bound: &Value,
    accept: fn(f64) -> bool,
) -> Result<bool, String> {
    let Some(bound) = bound.as_f64() else {
        return Err("ordering comparison requires a numeric value".into());
    };
    let Some(actual) = path::resolve(message, path) else {
        return Ok(false);
    };
    let Some(actual) = actual.as_f64() else {
        return Err(format!("path '{path}' is not numeric"));
    };
    Ok(accept(actual - bound))
}
