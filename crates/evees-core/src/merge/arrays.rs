//! Three-way rules for scalar values and ordered link lists.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which side wins when both sides changed a value differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// The perspective being merged into.
    To,
    /// The perspective being merged from.
    #[default]
    From,
}

/// Three-way merge of a single value.
///
/// If both sides agree, that value. If only one side moved away from the
/// ancestor, that side. If both moved to different values, `winner`.
#[must_use]
pub fn merge_scalar(ancestor: &Value, to: &Value, from: &Value, winner: Side) -> Value {
    if to == from || from == ancestor {
        return to.clone();
    }
    if to == ancestor {
        return from.clone();
    }
    match winner {
        Side::To => to.clone(),
        Side::From => from.clone(),
    }
}

/// Three-way merge of an ordered list of unique ids.
///
/// The result starts as `to` minus whatever `from` removed from `ancestor`.
/// Ids new in `from` are then inserted right after the nearest id preceding
/// them in `from` that is already in the result, or at the front if there is
/// none. Ids `to` removed stay removed.
#[must_use]
pub fn merge_ordered(ancestor: &[String], to: &[String], from: &[String]) -> Vec<String> {
    let ancestor_set: HashSet<&String> = ancestor.iter().collect();
    let from_set: HashSet<&String> = from.iter().collect();

    let mut merged: Vec<String> = to
        .iter()
        .filter(|id| !(ancestor_set.contains(id) && !from_set.contains(id)))
        .cloned()
        .collect();

    let mut cursor = 0;
    for id in from {
        if let Some(position) = merged.iter().position(|m| m == id) {
            cursor = position + 1;
        } else if !ancestor_set.contains(id) {
            merged.insert(cursor, id.clone());
            cursor += 1;
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn scalar_unchanged_on_both_sides() {
        let v = json!("same");
        assert_eq!(merge_scalar(&v, &v, &v, Side::From), v);
    }

    #[test]
    fn scalar_one_side_changed() {
        let (a, changed) = (json!(1), json!(2));
        assert_eq!(merge_scalar(&a, &a, &changed, Side::To), changed);
        assert_eq!(merge_scalar(&a, &changed, &a, Side::From), changed);
    }

    #[test]
    fn scalar_divergent_edit_uses_winner() {
        let (a, to, from) = (json!(1), json!(2), json!(3));
        assert_eq!(merge_scalar(&a, &to, &from, Side::From), from);
        assert_eq!(merge_scalar(&a, &to, &from, Side::To), to);
    }

    #[test]
    fn ordered_union_keeps_both_additions() {
        let merged = merge_ordered(&ids(&["a", "b"]), &ids(&["a", "b", "t"]), &ids(&["a", "f", "b"]));
        assert_eq!(merged, ids(&["a", "f", "b", "t"]));
    }

    #[test]
    fn ordered_removals_on_either_side_stick() {
        let merged = merge_ordered(&ids(&["a", "b", "c"]), &ids(&["a", "c"]), &ids(&["b", "c"]));
        assert_eq!(merged, ids(&["c"]));
    }

    #[test]
    fn ordered_insert_at_front() {
        let merged = merge_ordered(&ids(&["a"]), &ids(&["a"]), &ids(&["z", "a"]));
        assert_eq!(merged, ids(&["z", "a"]));
    }

    #[test]
    fn ordered_identical_sides() {
        let list = ids(&["x", "y"]);
        assert_eq!(merge_ordered(&[], &list, &list), list);
    }
}
