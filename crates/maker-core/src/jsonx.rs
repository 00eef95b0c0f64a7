//! Small JSON helpers shared by binding learning and remediation arms.

use serde_json::Value;

/// Inputs above this size are never parsed as inline JSON.
const INLINE_JSON_CAP: usize = 20_000;

/// Parse a flag value that may itself be JSON.
///
/// Returns `None` for oversized input, non-JSON text, and scalar JSON; arms
/// introspect objects and arrays only.
pub fn parse_inline_json(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.len() > INLINE_JSON_CAP {
        return None;
    }
    if !(trimmed.starts_with('{') || trimmed.starts_with('[')) {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// Resolve a dotted path with optional indices against a JSON value.
///
/// Supported shapes: `Vpc.VpcId`, `Subnets[0].SubnetId`, `Reservations[0]`.
pub fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        let segment = segment.trim();
        if segment.is_empty() {
            return None;
        }
        let (field, indices) = split_indices(segment)?;
        if !field.is_empty() {
            current = current.get(field)?;
        }
        for idx in indices {
            current = current.get(idx)?;
        }
    }
    Some(current)
}

/// Scalar rendering of a JSON value for binding storage.
pub fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Convenience: look up `path` and render it as a scalar string.
pub fn extract_string(value: &Value, path: &str) -> Option<String> {
    lookup_path(value, path).and_then(value_to_string)
}

fn split_indices(segment: &str) -> Option<(&str, Vec<usize>)> {
    match segment.find('[') {
        None => Some((segment, Vec::new())),
        Some(pos) => {
            let field = &segment[..pos];
            let mut indices = Vec::new();
            let mut rest = &segment[pos..];
            while let Some(open) = rest.find('[') {
                let close = rest.find(']')?;
                if close < open {
                    return None;
                }
                let idx: usize = rest[open + 1..close].parse().ok()?;
                indices.push(idx);
                rest = &rest[close + 1..];
            }
            if !rest.is_empty() {
                return None;
            }
            Some((field, indices))
        }
    }
}
