//! Write-path sanitization: every document crossing into the store is
//! reduced to primitives, arrays, and maps before it reaches the driver.
//!
//! A write that serializes a struct directly to the driver without going
//! through [`sanitize_document`] is a defect, per the facade contract.

use serde::Serialize;
use serde_json::Value;

use crate::error::{CoordError, Result};

/// Serializes `doc` and recursively strips anything the store cannot
/// represent natively: `NaN`/`Infinity` floats collapse to `null`, and
/// every nested container is walked so no wrapper type survives into the
/// write. The result is a plain JSON object ready for the query channel.
pub fn sanitize_document<T: Serialize>(doc: &T) -> Result<serde_json::Map<String, Value>> {
    let value = serde_json::to_value(doc)?;
    let sanitized = sanitize_value(value);
    match sanitized {
        Value::Object(map) => Ok(map),
        other => Err(CoordError::semantic(format!(
            "document did not sanitize to an object: {other}"
        ))),
    }
}

fn sanitize_value(value: Value) -> Value {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) if !f.is_finite() => Value::Null,
            _ => Value::Number(n),
        },
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, sanitize_value(v)))
                .collect(),
        ),
        primitive => primitive,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[derive(Serialize)]
    struct Doc {
        name: String,
        score: f64,
        nested: Vec<f64>,
    }

    #[test]
    fn sanitizes_non_finite_floats_to_null() {
        let doc = Doc {
            name: "a".into(),
            score: f64::NAN,
            nested: vec![f64::INFINITY, 1.0],
        };
        let sanitized = sanitize_document(&doc).unwrap();
        assert_eq!(sanitized["score"], Value::Null);
        assert_eq!(sanitized["nested"][0], Value::Null);
        assert_eq!(sanitized["nested"][1], 1.0);
    }

    #[test]
    fn passes_through_plain_primitives() {
        let doc = Doc {
            name: "b".into(),
            score: 0.5,
            nested: vec![1.0, 2.0],
        };
        let sanitized = sanitize_document(&doc).unwrap();
        assert_eq!(sanitized["name"], "b");
        assert_eq!(sanitized["score"], 0.5);
    }
}
