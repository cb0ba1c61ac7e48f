use serde_json::{Number, Value};
use staysync_core::Cast;

/// Applies a declared cast. Values that do not parse become null rather than
/// failing the record.
pub fn apply_cast(cast: Cast, value: Value) -> Value {
    match cast {
        Cast::AsIs => value,
        Cast::String => to_text(value),
        Cast::Integer => to_integer(&value).map_or(Value::Null, Value::from),
        Cast::Float => to_float(&value).map_or(Value::Null, float_value),
        Cast::Currency => to_currency(&value).map_or(Value::Null, float_value),
        Cast::Boolean => to_bool(&value).map_or(Value::Null, Value::Bool),
    }
}

fn float_value(f: f64) -> Value {
    Number::from_f64(f).map_or(Value::Null, Value::Number)
}

fn to_text(value: Value) -> Value {
    match value {
        Value::Null => Value::Null,
        Value::String(s) => Value::String(s),
        Value::Number(n) => Value::String(n.to_string()),
        Value::Bool(b) => Value::String(b.to_string()),
        other => Value::String(other.to_string()),
    }
}

/// 2^63; every whole float in `[-2^63, 2^63)` converts to i64 exactly.
const I64_BOUND: f64 = 9_223_372_036_854_775_808.0;

fn whole_number(f: f64) -> Option<i64> {
    (f.fract() == 0.0 && (-I64_BOUND..I64_BOUND).contains(&f)).then(|| f as i64)
}

fn to_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().and_then(whole_number)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| s.parse::<f64>().ok().and_then(whole_number))
        }
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn to_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// `"120.00 USD"`, `"$1,250.50"` and `42` all parse; the unit suffix is dropped.
fn to_currency(value: &Value) -> Option<f64> {
    match value {
        Value::String(s) => {
            let amount: String = s
                .split_whitespace()
                .next()?
                .chars()
                .filter(|c| *c != '$' && *c != ',')
                .collect();
            amount.parse::<f64>().ok().filter(|f| f.is_finite())
        }
        other => to_float(other),
    }
}

fn to_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => n.as_i64().map(|i| i != 0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "y" | "1" => Some(true),
            "false" | "f" | "no" | "n" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn currency_strips_unit_suffix() {
        assert_eq!(apply_cast(Cast::Currency, json!("120.00 USD")), json!(120.0));
        assert_eq!(apply_cast(Cast::Currency, json!("$1,250.50")), json!(1250.5));
        assert_eq!(apply_cast(Cast::Currency, json!(50)), json!(50.0));
        assert_eq!(apply_cast(Cast::Currency, json!("")), Value::Null);
        assert_eq!(apply_cast(Cast::Currency, json!("n/a")), Value::Null);
    }

    #[test]
    fn numeric_casts_turn_garbage_into_null() {
        assert_eq!(apply_cast(Cast::Integer, json!("8558")), json!(8558));
        assert_eq!(apply_cast(Cast::Integer, json!(3.0)), json!(3));
        assert_eq!(apply_cast(Cast::Integer, json!(2.5)), Value::Null);
        assert_eq!(apply_cast(Cast::Integer, json!("7.0")), json!(7));
        assert_eq!(apply_cast(Cast::Integer, json!(1e20)), Value::Null);
        assert_eq!(apply_cast(Cast::Integer, json!(u64::MAX)), Value::Null);
        assert_eq!(apply_cast(Cast::Integer, json!("-1e19")), Value::Null);
        assert_eq!(apply_cast(Cast::Integer, json!("inf")), Value::Null);
        assert_eq!(apply_cast(Cast::Integer, json!(i64::MIN)), json!(i64::MIN));
        assert_eq!(apply_cast(Cast::Float, json!("36.1627")), json!(36.1627));
        assert_eq!(apply_cast(Cast::Float, json!({"lat": 1})), Value::Null);
    }

    #[test]
    fn string_and_boolean_casts() {
        assert_eq!(apply_cast(Cast::String, json!(12345)), json!("12345"));
        assert_eq!(apply_cast(Cast::String, Value::Null), Value::Null);
        assert_eq!(apply_cast(Cast::Boolean, json!("Yes")), json!(true));
        assert_eq!(apply_cast(Cast::Boolean, json!(0)), json!(false));
        assert_eq!(apply_cast(Cast::Boolean, json!("maybe")), Value::Null);
        assert_eq!(apply_cast(Cast::AsIs, json!([1, 2])), json!([1, 2]));
    }
}
