//! Recursive JSON re-normalization for stored responses.
//!
//! Model output is frequently JSON that was serialized into a string, which was
//! then serialized again into the stored payload (sometimes more than once).
//! [`normalize`] peels those layers so exports and terminal views show the real
//! structure.

use serde_json::Value as JsonValue;

/// Recursively unwrap string values that themselves hold serialized JSON.
///
/// - arrays and objects are normalized element-wise;
/// - a string whose content parses as JSON is replaced by the (normalized)
///   parsed value, so `"42"` becomes `42` and `"null"` becomes `null`;
/// - a string that does not parse is kept verbatim.
///
/// Each unwrap descends into strictly shorter text, so recursion terminates.
pub fn normalize(value: JsonValue) -> JsonValue {
    match value {
        JsonValue::String(text) => unwrap_string(text),
        JsonValue::Array(items) => JsonValue::Array(items.into_iter().map(normalize).collect()),
        JsonValue::Object(map) => {
            JsonValue::Object(map.into_iter().map(|(k, v)| (k, normalize(v))).collect())
        }
        scalar => scalar,
    }
}

/// Parse a raw stored payload, falling back to the raw text when it is not JSON.
pub fn parse_stored(raw: &str) -> JsonValue {
    match serde_json::from_str::<JsonValue>(raw) {
        Ok(value) => normalize(value),
        Err(_) => JsonValue::String(raw.to_string()),
    }
}

fn unwrap_string(text: String) -> JsonValue {
    match serde_json::from_str::<JsonValue>(&text) {
        Ok(inner) => normalize(inner),
        Err(_) => JsonValue::String(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn wrap(value: &JsonValue) -> JsonValue {
        JsonValue::String(value.to_string())
    }

    #[test]
    fn unwraps_single_layer() {
        let stored = json!({"response": "{\"answer\": 4}"});
        assert_eq!(normalize(stored), json!({"response": {"answer": 4}}));
    }

    #[test]
    fn unwraps_two_and_three_layers() {
        let inner = json!({"items": [1, 2, {"deep": "x"}]});
        let twice = wrap(&wrap(&inner));
        assert_eq!(normalize(twice.clone()), inner);

        let thrice = wrap(&twice);
        assert_eq!(normalize(json!({"0": thrice})), json!({"0": inner}));
    }

    #[test]
    fn nested_string_inside_unwrapped_object_is_unwrapped() {
        let level2 = json!({"score": "[1,2,3]"});
        let stored = json!({"response": level2.to_string()});
        assert_eq!(normalize(stored), json!({"response": {"score": [1, 2, 3]}}));
    }

    #[test]
    fn plain_text_is_kept() {
        assert_eq!(normalize(json!("hello world")), json!("hello world"));
        assert_eq!(normalize(json!("{not json")), json!("{not json"));
    }

    #[test]
    fn scalar_strings_are_unwrapped() {
        assert_eq!(normalize(json!({"response": "42"})), json!({"response": 42}));
        assert_eq!(normalize(json!(["true", "null", "-1.5"])), json!([true, null, -1.5]));
        assert_eq!(normalize(json!("\"7\"")), json!(7));
        assert_eq!(normalize(json!("42 apples")), json!("42 apples"));
    }

    #[test]
    fn quoted_string_unwraps_to_inner_text() {
        assert_eq!(normalize(json!("\"ok\"")), json!("ok"));
        assert_eq!(normalize(json!("\"\\\"ok\\\"\"")), json!("ok"));
    }

    #[test]
    fn parse_stored_falls_back_to_raw() {
        assert_eq!(parse_stored("not json"), json!("not json"));
        assert_eq!(parse_stored("{\"a\":\"[1]\"}"), json!({"a": [1]}));
    }

    fn arb_json() -> impl Strategy<Value = JsonValue> {
        let leaf = prop_oneof![
            any::<bool>().prop_map(JsonValue::from),
            any::<i64>().prop_map(JsonValue::from),
            "[a-z ]{0,8}".prop_map(JsonValue::from),
        ];
        leaf.prop_recursive(4, 32, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(JsonValue::Array),
                prop::collection::btree_map("[a-z]{1,4}", inner, 0..4)
                    .prop_map(|m| JsonValue::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent(value in arb_json()) {
            let once = normalize(value);
            prop_assert_eq!(normalize(once.clone()), once);
        }

        #[test]
        fn wrapping_layers_are_peeled(value in arb_json(), layers in 1usize..4) {
            prop_assume!(value.is_object() || value.is_array());
            let mut wrapped = value.clone();
            for _ in 0..layers {
                wrapped = wrap(&wrapped);
            }
            prop_assert_eq!(normalize(wrapped), normalize(value));
        }
    }
}
