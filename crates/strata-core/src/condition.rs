use std::collections::HashMap;

/// Evaluate an edge condition expression against execution data.
///
/// Supported expressions:
/// - `key == "value"` / `key != "value"`: string or numeric equality
/// - `key contains "substr"`: substring match
/// - `key >= 0.8`, `key <= 3`, `key > 1`, `key < 5`: numeric comparison
///
/// Returns `false` for unparseable expressions and missing keys.
pub fn evaluate_condition(expr: &str, context: &HashMap<String, serde_json::Value>) -> bool {
    let expr = expr.trim();

    if let Some((key, substr)) = parse_operator(expr, " contains ") {
        return context
            .get(key)
            .and_then(|v| v.as_str())
            .is_some_and(|s| s.contains(substr));
    }

    // Two-character operators must be tried before their one-character prefixes.
    for op in ["!=", ">=", "<=", "==", ">", "<"] {
        if let Some((key, value)) = parse_operator(expr, op) {
            let Some(actual) = context.get(key) else {
                return false;
            };
            return compare(actual, op, value);
        }
    }

    false
}

fn compare(actual: &serde_json::Value, op: &str, expected: &str) -> bool {
    let numeric = actual
        .as_f64()
        .zip(expected.parse::<f64>().ok());

    match (op, numeric) {
        (">=", Some((a, b))) => a >= b,
        ("<=", Some((a, b))) => a <= b,
        (">", Some((a, b))) => a > b,
        ("<", Some((a, b))) => a < b,
        ("==", Some((a, b))) => (a - b).abs() < f64::EPSILON,
        ("!=", Some((a, b))) => (a - b).abs() >= f64::EPSILON,
        ("==", None) => actual.as_str().is_some_and(|s| s == expected),
        ("!=", None) => actual.as_str().is_some_and(|s| s != expected),
        _ => false,
    }
}

/// Parse `key OP value` expressions, returning (key, value) with quotes stripped.
fn parse_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    let (key, val) = expr.split_once(op)?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key, val.trim().trim_matches('"')))
}
