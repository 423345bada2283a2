//! Field-wise delta computation for updates
//!
//! A delta classifies a change as create/update/delete and, for updates,
//! records the `{old, new}` pair for every top-level field whose value
//! differs under canonical rendering.

use crate::canonical::canonically_equal;
use crate::entry::{ChangeDelta, FieldChange};
use serde_json::Value;
use std::collections::BTreeMap;

/// Compute the delta between two optional states
///
/// Returns `None` when both states are absent (nothing to record).
pub fn compute_delta(previous: Option<&Value>, new: Option<&Value>) -> Option<ChangeDelta> {
    match (previous, new) {
        (None, None) => None,
        (None, Some(_)) => Some(ChangeDelta::Create),
        (Some(_), None) => Some(ChangeDelta::Delete),
        (Some(prev), Some(next)) => Some(ChangeDelta::Update {
            changes: field_changes(prev, next),
        }),
    }
}

fn field_changes(prev: &Value, next: &Value) -> BTreeMap<String, FieldChange> {
    let mut changes = BTreeMap::new();
    match (prev.as_object(), next.as_object()) {
        (Some(prev_map), Some(next_map)) => {
            let mut keys: Vec<&String> = prev_map.keys().chain(next_map.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let old = prev_map.get(key).cloned().unwrap_or(Value::Null);
                let new = next_map.get(key).cloned().unwrap_or(Value::Null);
                if !canonically_equal(&old, &new) {
                    changes.insert(key.clone(), FieldChange { old, new });
                }
            }
        }
        // Non-object states diff as a single synthetic field
        _ => {
            if !canonically_equal(prev, next) {
                changes.insert(
                    "value".to_string(),
                    FieldChange {
                        old: prev.clone(),
                        new: next.clone(),
                    },
                );
            }
        }
    }
    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn create_and_delete_classify() {
        assert_eq!(
            compute_delta(None, Some(&json!({"a": 1}))),
            Some(ChangeDelta::Create)
        );
        assert_eq!(
            compute_delta(Some(&json!({"a": 1})), None),
            Some(ChangeDelta::Delete)
        );
        assert_eq!(compute_delta(None, None), None);
    }

    #[test]
    fn update_records_changed_fields_only() {
        let prev = json!({"name": "w1", "cpu": 8});
        let next = json!({"name": "w1", "cpu": 16});
        let Some(ChangeDelta::Update { changes }) = compute_delta(Some(&prev), Some(&next)) else {
            panic!("expected update delta");
        };
        assert_eq!(changes.len(), 1);
        let change = &changes["cpu"];
        assert_eq!(change.old, json!(8));
        assert_eq!(change.new, json!(16));
    }

    #[test]
    fn added_and_removed_fields_diff_against_null() {
        let prev = json!({"a": 1});
        let next = json!({"b": 2});
        let Some(ChangeDelta::Update { changes }) = compute_delta(Some(&prev), Some(&next)) else {
            panic!("expected update delta");
        };
        assert_eq!(changes["a"].old, json!(1));
        assert_eq!(changes["a"].new, Value::Null);
        assert_eq!(changes["b"].old, Value::Null);
        assert_eq!(changes["b"].new, json!(2));
    }

    #[test]
    fn identical_states_produce_empty_update() {
        let state = json!({"a": {"nested": true}});
        let Some(ChangeDelta::Update { changes }) = compute_delta(Some(&state), Some(&state))
        else {
            panic!("expected update delta");
        };
        assert!(changes.is_empty());
    }
}
