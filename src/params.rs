use std::collections::BTreeMap;

use anyhow::{Result, bail};
use serde_json::Value;

/// Turn `KEY=VALUE` arguments into a map.
///
/// With `as_json`, values that parse as JSON keep their JSON type and anything
/// else is kept as a string. Every malformed pair is reported in one error.
pub fn process_key_value_pairs(pairs: &[String], as_json: bool) -> Result<BTreeMap<String, Value>> {
    let mut invalid = Vec::new();
    let mut result = BTreeMap::new();

    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            invalid.push(pair.as_str());
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        if key.is_empty() || value.is_empty() {
            invalid.push(pair.as_str());
            continue;
        }

        let value = if as_json {
            serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()))
        } else {
            Value::String(value.to_string())
        };
        result.insert(key.to_string(), value);
    }

    if !invalid.is_empty() {
        let listed: Vec<String> = invalid.iter().map(|p| format!("'{}'", p)).collect();
        bail!("Invalid key value pairs: [{}]", listed.join(", "));
    }
    Ok(result)
}

/// Same as [`process_key_value_pairs`] without JSON parsing, as plain strings.
pub fn process_string_pairs(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    Ok(process_key_value_pairs(pairs, false)?
        .into_iter()
        .map(|(k, v)| match v {
            Value::String(s) => (k, s),
            other => (k, other.to_string()),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn plain_pairs_are_trimmed_and_split_once() {
        let out = process_string_pairs(&strings(&[" KEY = value ", "URL=http://x?a=b"])).unwrap();
        assert_eq!(out["KEY"], "value");
        assert_eq!(out["URL"], "http://x?a=b");
    }

    #[test]
    fn json_mode_keeps_types() {
        let out = process_key_value_pairs(
            &strings(&["n=1", "flag=true", "name=world", "items=[1, 2]", "quoted=\"x\""]),
            true,
        )
        .unwrap();
        assert_eq!(out["n"], json!(1));
        assert_eq!(out["flag"], json!(true));
        assert_eq!(out["name"], json!("world"));
        assert_eq!(out["items"], json!([1, 2]));
        assert_eq!(out["quoted"], json!("x"));
    }

    #[test]
    fn all_invalid_pairs_are_reported() {
        let err = process_key_value_pairs(&strings(&["novalue", "=x", "k=", "ok=1"]), false)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid key value pairs: ['novalue', '=x', 'k=']"
        );
    }

    #[test]
    fn empty_input_is_empty_map() {
        assert!(process_key_value_pairs(&[], true).unwrap().is_empty());
    }
}
