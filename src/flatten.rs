use serde_json::{Map, Value};

/// Flatten a nested JSON object into a single-level map keyed by dotted paths.
///
/// Nested object keys are joined with `.`. An array at path `p` is emitted
/// under both `p` and `p[]`, and each element `i` is expanded with the
/// prefix `p[i]`. For example `{"a": {"b": 1}}` becomes `{"a.b": 1}`.
pub fn flatten(data: &Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in data {
        flatten_into(&mut out, key.clone(), value);
    }
    out
}

fn flatten_into(out: &mut Map<String, Value>, path: String, value: &Value) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten_into(out, format!("{path}.{key}"), child);
            }
        }
        Value::Array(items) => {
            let array = value.clone();
            out.insert(format!("{path}[]"), array.clone());
            for (i, child) in items.iter().enumerate() {
                flatten_into(out, format!("{path}[{i}]"), child);
            }
            out.insert(path, array);
        }
        scalar => {
            out.insert(path, scalar.clone());
        }
    }
}
