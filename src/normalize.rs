//! Decoding of the upstream legacy nutriments encoding.
//!
//! The `nutriments` column is a text rendering of a list of objects in a
//! Python-ish dialect rather than strict JSON: single-quoted strings, bare
//! identifiers in value position, and `None`/`NULL`/`none` sentinels. The
//! conversion here is a best-effort rewrite into JSON; a row that still
//! fails to parse degrades to an empty mapping and never fails the batch.

use regex::{Captures, Regex};
use serde_json::{Map, Value};
use std::sync::OnceLock;
use tracing::debug;

/// Longest excerpt of offending input included in debug logs.
const MAX_DEBUG_LEN: usize = 100;

/// Sentinel rewrites applied before bare-identifier quoting. Each pair keys
/// on the character before/after the token so identifiers that merely
/// contain "none" are left alone.
const NULL_REWRITES: &[(&str, &str)] = &[
    (" None", " null"),
    ("[None", "[null"),
    (",None", ",null"),
    ("None]", "null]"),
    ("None,", "null,"),
    (": None", ": null"),
    (" NULL", " null"),
    ("[NULL", "[null"),
    (",NULL", ",null"),
    ("NULL]", "null]"),
    ("NULL,", "null,"),
    (": NULL", ": null"),
    (" none", " null"),
    ("[none", "[null"),
    (",none", ",null"),
    ("none]", "null]"),
    ("none,", "null,"),
    (": none", ": null"),
];

/// Matches an unquoted value after a colon: a bare identifier that may start
/// with `%` and contain dashes, underscores, `%`, or spaces (`% vol`,
/// `saturated-fat`, `% DV`), terminated by a separator.
fn bare_value_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#": ([a-zA-Z%][a-zA-Z0-9\-_%\s]*)([ ,}\]])"#).unwrap())
}

/// Rewrites the legacy list text into parseable JSON. Does not validate;
/// the caller parses the result and falls back on failure.
pub fn legacy_list_to_json(input: &str) -> String {
    if input.is_empty() {
        return "[]".to_string();
    }

    let mut json = input.replace('\'', "\"");
    for (old, new) in NULL_REWRITES {
        json = json.replace(old, new);
    }

    bare_value_re()
        .replace_all(&json, |caps: &Captures| {
            let value = &caps[1];
            let suffix = &caps[2];
            if value == "null" {
                format!(": {value}{suffix}")
            } else {
                format!(": \"{value}\"{suffix}")
            }
        })
        .into_owned()
}

/// Decodes the raw nutriments column into a mapping keyed by each entry's
/// `name`. Entries without a non-empty `name` are dropped; any decode
/// failure yields an empty mapping.
pub fn decode_nutriments(raw: Option<&str>) -> Map<String, Value> {
    let Some(raw) = raw.filter(|s| !s.is_empty()) else {
        return Map::new();
    };

    let converted = legacy_list_to_json(raw);

    let parsed: Value = match serde_json::from_str(&converted) {
        Ok(v) => v,
        Err(e) => {
            debug!(
                error = %e,
                raw = excerpt(raw),
                converted = excerpt(&converted),
                "failed to parse nutriments"
            );
            return Map::new();
        }
    };

    let Value::Array(entries) = parsed else {
        debug!(raw = excerpt(raw), "nutriments did not decode to an array");
        return Map::new();
    };

    let mut by_name = Map::new();
    for entry in entries {
        let Value::Object(obj) = &entry else { continue };
        if let Some(name) = obj.get("name").and_then(Value::as_str) {
            if !name.is_empty() {
                by_name.insert(name.to_string(), entry);
            }
        }
    }
    by_name
}

fn excerpt(s: &str) -> String {
    if s.chars().count() <= MAX_DEBUG_LEN {
        s.to_string()
    } else {
        let head: String = s.chars().take(MAX_DEBUG_LEN).collect();
        format!("{head}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_input_becomes_empty_array() {
        assert_eq!(legacy_list_to_json(""), "[]");
    }

    #[test]
    fn single_quotes_become_double_quotes() {
        assert_eq!(
            legacy_list_to_json("[{'name': 'sodium', 'value': 10.0}]"),
            r#"[{"name": "sodium", "value": 10.0}]"#
        );
    }

    #[test]
    fn bare_identifiers_are_quoted() {
        assert_eq!(
            legacy_list_to_json("[{'name': sodium, 'unit': mg}]"),
            r#"[{"name": "sodium", "unit": "mg"}]"#
        );
    }

    #[test]
    fn null_sentinels_all_casings() {
        assert_eq!(
            legacy_list_to_json("[{'name': 'sodium', 'value': NULL, 'serving': None}]"),
            r#"[{"name": "sodium", "value": null, "serving": null}]"#
        );
        assert_eq!(
            legacy_list_to_json("[{'name': 'sodium', 'value': none, 'serving': null}]"),
            r#"[{"name": "sodium", "value": null, "serving": null}]"#
        );
    }

    #[test]
    fn dashed_names_and_percent_units() {
        assert_eq!(
            legacy_list_to_json("[{'name': fruits-vegetables-nuts-estimate, 'unit': percent}]"),
            r#"[{"name": "fruits-vegetables-nuts-estimate", "unit": "percent"}]"#
        );
        assert_eq!(
            legacy_list_to_json("[{'name': alcohol, 'unit': % vol}]"),
            r#"[{"name": "alcohol", "unit": "% vol"}]"#
        );
        assert_eq!(
            legacy_list_to_json("[{'name': saturated_fat, 'unit': % DV}]"),
            r#"[{"name": "saturated_fat", "unit": "% DV"}]"#
        );
    }

    #[test]
    fn mixed_types_and_real_world_row() {
        assert_eq!(
            legacy_list_to_json(
                "[{'name': energy, 'value': 1234, 'unit': kcal, 'per_100g': 1234.0, 'serving': NULL}]"
            ),
            r#"[{"name": "energy", "value": 1234, "unit": "kcal", "per_100g": 1234.0, "serving": null}]"#
        );
        assert_eq!(
            legacy_list_to_json(
                "[{'name': saturated-fat, 'value': 10.0, '100g': 10.0, 'serving': NULL, 'unit': g, 'prepared_value': NULL, 'prepared_100g': NULL, 'prepared_serving': NULL, 'prepared_unit': NULL}]"
            ),
            r#"[{"name": "saturated-fat", "value": 10.0, "100g": 10.0, "serving": null, "unit": "g", "prepared_value": null, "prepared_100g": null, "prepared_serving": null, "prepared_unit": null}]"#
        );
    }

    #[test]
    fn multiple_entries_and_null_elements() {
        assert_eq!(
            legacy_list_to_json(
                "[{'name': sodium, 'value': 50, 'unit': mg}, {'name': energy, 'value': 200, 'unit': kcal}]"
            ),
            r#"[{"name": "sodium", "value": 50, "unit": "mg"}, {"name": "energy", "value": 200, "unit": "kcal"}]"#
        );
        assert_eq!(
            legacy_list_to_json("[None, {'name': sodium, 'value': 10}]"),
            r#"[null, {"name": "sodium", "value": 10}]"#
        );
        assert_eq!(
            legacy_list_to_json("[{'name': sodium, 'value': 10}, None]"),
            r#"[{"name": "sodium", "value": 10}, null]"#
        );
        assert_eq!(
            legacy_list_to_json("[{'nested': [None, NULL, none]}]"),
            r#"[{"nested": [null, null, null]}]"#
        );
    }

    #[test]
    fn decode_groups_by_name() {
        let map = decode_nutriments(Some(
            "[{'name': sodium, 'value': 50, 'unit': mg}, {'name': energy, 'value': 200, 'unit': kcal}]",
        ));
        assert_eq!(map.len(), 2);
        assert_eq!(
            map["sodium"],
            json!({"name": "sodium", "value": 50, "unit": "mg"})
        );
        assert_eq!(
            map["energy"],
            json!({"name": "energy", "value": 200, "unit": "kcal"})
        );
    }

    #[test]
    fn decode_drops_unnamed_entries() {
        let map = decode_nutriments(Some(
            "[{'value': 10.0, 'unit': 'mg'}, {'name': 'sodium', 'value': 20.0}]",
        ));
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("sodium"));

        let map = decode_nutriments(Some(
            "[{'name': '', 'value': 10.0}, {'name': 'sodium', 'value': 20.0}]",
        ));
        assert_eq!(map.len(), 1);
        assert!(map.contains_key("sodium"));
    }

    #[test]
    fn decode_degrades_to_empty_on_garbage() {
        assert!(decode_nutriments(Some("invalid json")).is_empty());
        assert!(decode_nutriments(Some("")).is_empty());
        assert!(decode_nutriments(None).is_empty());
    }

    #[test]
    fn decode_is_idempotent_on_valid_json() {
        let first = decode_nutriments(Some("[{'name': sodium, 'value': 10.0, 'unit': mg}]"));
        let reencoded = serde_json::to_string(&first.values().collect::<Vec<_>>()).unwrap();
        let second = decode_nutriments(Some(&reencoded));
        assert_eq!(first, second);
    }
}
