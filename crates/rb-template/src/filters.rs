//! Lenient conversion filters
//!
//! Rule values come from devices and the message bus as loosely typed text,
//! so `int`, `float` and `bool` fall back to a default instead of failing.

use minijinja::value::ValueKind;
use minijinja::Value;

fn value_to_f64(value: &Value) -> Option<f64> {
    match value.kind() {
        ValueKind::Number => f64::try_from(value.clone())
            .ok()
            .or_else(|| value.as_i64().map(|i| i as f64)),
        ValueKind::Bool => Some(if value.is_true() { 1.0 } else { 0.0 }),
        ValueKind::String => value.as_str().and_then(|s| s.trim().parse::<f64>().ok()),
        _ => None,
    }
}

fn value_to_i64(value: &Value) -> Option<i64> {
    if let Some(i) = value.as_i64() {
        return Some(i);
    }
    if let Some(s) = value.as_str() {
        // Integer text first, then truncate a float
        if let Ok(i) = s.trim().parse::<i64>() {
            return Some(i);
        }
    }
    value_to_f64(value).map(|f| f as i64)
}

/// Convert to an integer, `default` (or 0) when that is impossible
pub fn to_int(value: Value, default: Option<Value>) -> Value {
    value_to_i64(&value)
        .or_else(|| default.as_ref().and_then(value_to_i64))
        .map_or(Value::from(0), Value::from)
}

/// Convert to a float, `default` (or 0.0) when that is impossible
pub fn to_float(value: Value, default: Option<Value>) -> Value {
    value_to_f64(&value)
        .or_else(|| default.as_ref().and_then(value_to_f64))
        .map_or(Value::from(0.0), Value::from)
}

/// Truthiness, accepting the usual switch words for strings
pub fn to_bool(value: Value) -> bool {
    if value.is_undefined() || value.is_none() {
        return false;
    }
    match value.as_str() {
        Some(s) => matches!(
            s.trim().to_lowercase().as_str(),
            "true" | "yes" | "on" | "1"
        ),
        None => value.is_true(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_int() {
        assert_eq!(to_int(Value::from("42"), None), Value::from(42));
        assert_eq!(to_int(Value::from(" 3.9 "), None), Value::from(3));
        assert_eq!(to_int(Value::from(true), None), Value::from(1));
        assert_eq!(to_int(Value::from("n/a"), None), Value::from(0));
        assert_eq!(
            to_int(Value::from("n/a"), Some(Value::from(-1))),
            Value::from(-1)
        );
    }

    #[test]
    fn test_to_float() {
        assert_eq!(to_float(Value::from("2.5"), None), Value::from(2.5));
        assert_eq!(to_float(Value::from(4), None), Value::from(4.0));
        assert_eq!(to_float(Value::from(()), None), Value::from(0.0));
    }

    #[test]
    fn test_to_bool() {
        assert!(to_bool(Value::from("ON")));
        assert!(to_bool(Value::from(1)));
        assert!(!to_bool(Value::from("off")));
        assert!(!to_bool(Value::from(())));
    }
}
