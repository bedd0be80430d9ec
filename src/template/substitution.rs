//! `{{variable}}` substitution for push content

use crate::notification::DataMap;

/// Replace every `{{name}}` in `text` with the matching variable.
///
/// Unknown placeholders are left untouched.
pub fn substitute_string(text: &str, variables: &DataMap) -> String {
    let mut result = text.to_string();

    for (key, value) in variables {
        let pattern = format!("{{{{{}}}}}", key);
        if !result.contains(&pattern) {
            continue;
        }
        let replacement = match value {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Null => String::new(),
            // For arrays and objects, use JSON representation
            _ => value.to_string(),
        };
        result = result.replace(&pattern, &replacement);
    }

    result
}

/// Substitute inside every string of a JSON value, keys included.
pub fn substitute_value(value: &serde_json::Value, variables: &DataMap) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) => serde_json::Value::String(substitute_string(s, variables)),
        serde_json::Value::Array(arr) => serde_json::Value::Array(
            arr.iter().map(|v| substitute_value(v, variables)).collect(),
        ),
        serde_json::Value::Object(obj) => serde_json::Value::Object(
            obj.iter()
                .map(|(k, v)| (substitute_string(k, variables), substitute_value(v, variables)))
                .collect(),
        ),
        // Numbers, booleans, null are passed through as-is
        _ => value.clone(),
    }
}

/// Substitute inside the values of a data map.
pub fn substitute_data(data: &DataMap, variables: &DataMap) -> DataMap {
    data.iter()
        .map(|(k, v)| (k.clone(), substitute_value(v, variables)))
        .collect()
}
