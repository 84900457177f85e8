//! Property-based test generators using proptest.

use docsync_store::Properties;
use proptest::prelude::*;
use serde_json::Value;

/// Strategy for document IDs.
pub fn doc_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_-]{0,15}").expect("Invalid regex")
}

/// Strategy for flat JSON property values.
pub fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        prop::string::string_regex("[ -~]{0,24}")
            .expect("Invalid regex")
            .prop_map(Value::from),
    ]
}

/// Strategy for document bodies.
pub fn properties_strategy() -> impl Strategy<Value = Properties> {
    prop::collection::btree_map(
        prop::string::string_regex("[a-z]{1,8}").expect("Invalid regex"),
        value_strategy(),
        0..6,
    )
    .prop_map(|map| map.into_iter().collect())
}

/// Strategy for a set of documents with distinct IDs, each tagged with
/// whether a test filter should let it through.
pub fn document_set_strategy(
    max: usize,
) -> impl Strategy<Value = Vec<(String, Properties, bool)>> {
    prop::collection::btree_map(
        doc_id_strategy(),
        (properties_strategy(), any::<bool>()),
        0..max,
    )
    .prop_map(|map| {
        map.into_iter()
            .map(|(id, (props, pass))| (id, props, pass))
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    proptest! {
        #[test]
        fn doc_ids_are_non_empty(id in doc_id_strategy()) {
            prop_assert!(!id.is_empty());
        }

        #[test]
        fn document_sets_have_unique_ids(docs in document_set_strategy(20)) {
            let mut ids: Vec<&String> = docs.iter().map(|(id, _, _)| id).collect();
            let before = ids.len();
            ids.dedup();
            prop_assert_eq!(before, ids.len());
        }
    }
}
