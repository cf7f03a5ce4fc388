//! Property-based test generators using proptest.
//!
//! Ids are drawn from a small pool so generated deletes and overwrites
//! actually hit earlier puts.

use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tenantdb_server::BatchOperation;

/// Strategy for generating valid database names.
pub fn database_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z][a-zA-Z0-9_-]{0,15}").expect("Invalid regex")
}

/// Strategy for generating document ids from a small, mixed-case pool.
pub fn document_id_strategy() -> impl Strategy<Value = String> {
    (prop::sample::select(vec!["users", "Users", "orders"]), 0u8..4)
        .prop_map(|(collection, n)| format!("{collection}/{n}"))
}

/// Strategy for generating small document bodies.
pub fn document_body_strategy() -> impl Strategy<Value = Value> {
    (any::<i32>(), prop::string::string_regex("[a-z]{0,8}").expect("Invalid regex"))
        .prop_map(|(n, s)| json!({ "n": n, "s": s }))
}

/// Strategy for generating puts and deletes.
pub fn batch_operation_strategy() -> impl Strategy<Value = BatchOperation> {
    prop_oneof![
        3 => (document_id_strategy(), document_body_strategy())
            .prop_map(|(id, data)| BatchOperation::Put { id, data }),
        1 => document_id_strategy().prop_map(|id| BatchOperation::Delete { id }),
    ]
}

/// Strategy for generating a sequence of operations.
pub fn operation_sequence_strategy(max_len: usize) -> impl Strategy<Value = Vec<BatchOperation>> {
    prop::collection::vec(batch_operation_strategy(), 1..=max_len)
}

/// Applies `ops` in order to a model keyed by lower-cased id.
pub fn apply_to_model(model: &mut BTreeMap<String, Value>, ops: &[BatchOperation]) {
    for op in ops {
        match op {
            BatchOperation::Put { id, data } => {
                model.insert(id.to_lowercase(), data.clone());
            }
            BatchOperation::Delete { id } => {
                model.remove(&id.to_lowercase());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tenantdb_server::DatabaseName;

    proptest! {
        #[test]
        fn generated_names_are_valid(name in database_name_strategy()) {
            prop_assert!(DatabaseName::new(&name).is_ok());
        }
    }

    #[test]
    fn model_is_case_insensitive() {
        let mut model = BTreeMap::new();
        apply_to_model(
            &mut model,
            &[
                BatchOperation::Put { id: "Users/1".into(), data: json!(1) },
                BatchOperation::Put { id: "users/1".into(), data: json!(2) },
                BatchOperation::Delete { id: "orders/1".into() },
            ],
        );
        assert_eq!(model.len(), 1);
        assert_eq!(model["users/1"], json!(2));
    }
}
