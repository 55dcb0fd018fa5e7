//! Per-type merge behaviour.
//!
//! Data objects name their type in a top-level `"type"` field. The registry
//! maps that discriminant to a [`MergeBehaviour`] which tells the merge which
//! fields hold ordered lists of child perspective ids. Objects with an
//! unknown or missing type fall back to [`PlainData`], whose fields all merge
//! as scalars.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

/// Field holding the type discriminant.
pub const TYPE_FIELD: &str = "type";

pub trait MergeBehaviour: Send + Sync {
    /// Discriminant this behaviour is registered under.
    fn kind(&self) -> &str;

    /// Fields holding ordered child perspective ids.
    fn link_fields(&self) -> &[&'static str];

    /// All child ids, across link fields, in field then list order.
    fn children(&self, data: &Value) -> Vec<String> {
        self.link_fields()
            .iter()
            .flat_map(|field| links(data, field))
            .collect()
    }
}

/// String entries of `data[field]`; anything else is ignored.
#[must_use]
pub fn links(data: &Value, field: &str) -> Vec<String> {
    data.get(field)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// Rich-text node: `{"type": "TextNode", "text": ..., "links": [...]}`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextNode;

impl MergeBehaviour for TextNode {
    fn kind(&self) -> &str {
        "TextNode"
    }

    fn link_fields(&self) -> &[&'static str] {
        &["links"]
    }
}

/// Anything without a registered type.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainData;

impl MergeBehaviour for PlainData {
    fn kind(&self) -> &str {
        ""
    }

    fn link_fields(&self) -> &[&'static str] {
        &[]
    }
}

/// Behaviours by type discriminant.
#[derive(Clone)]
pub struct BehaviourRegistry {
    behaviours: HashMap<String, Arc<dyn MergeBehaviour>>,
    fallback: Arc<dyn MergeBehaviour>,
}

impl std::fmt::Debug for BehaviourRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut kinds: Vec<&String> = self.behaviours.keys().collect();
        kinds.sort();
        f.debug_struct("BehaviourRegistry")
            .field("kinds", &kinds)
            .finish_non_exhaustive()
    }
}

impl Default for BehaviourRegistry {
    fn default() -> Self {
        Self::empty().with(TextNode)
    }
}

impl BehaviourRegistry {
    /// Registry with only the scalar fallback.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            behaviours: HashMap::new(),
            fallback: Arc::new(PlainData),
        }
    }

    #[must_use]
    pub fn with(mut self, behaviour: impl MergeBehaviour + 'static) -> Self {
        self.register(Arc::new(behaviour));
        self
    }

    pub fn register(&mut self, behaviour: Arc<dyn MergeBehaviour>) {
        self.behaviours
            .insert(behaviour.kind().to_string(), behaviour);
    }

    /// Behaviour for a data object, by its `"type"` field.
    #[must_use]
    pub fn resolve(&self, data: &Value) -> &dyn MergeBehaviour {
        data.get(TYPE_FIELD)
            .and_then(Value::as_str)
            .and_then(|kind| self.behaviours.get(kind))
            .map_or(self.fallback.as_ref(), |behaviour| behaviour.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn resolves_by_type_field() {
        let registry = BehaviourRegistry::default();
        let node = json!({"type": "TextNode", "text": "t", "links": ["a", "b"]});
        assert_eq!(registry.resolve(&node).kind(), "TextNode");
        assert_eq!(registry.resolve(&node).children(&node), vec!["a", "b"]);
    }

    #[test]
    fn unknown_type_falls_back() {
        let registry = BehaviourRegistry::default();
        let other = json!({"type": "Unknown", "links": ["a"]});
        assert_eq!(registry.resolve(&other).kind(), "");
        assert!(registry.resolve(&other).children(&other).is_empty());
        assert_eq!(registry.resolve(&json!(5)).kind(), "");
    }

    #[test]
    fn custom_behaviour_registration() {
        struct Board;
        impl MergeBehaviour for Board {
            fn kind(&self) -> &str {
                "Board"
            }
            fn link_fields(&self) -> &[&'static str] {
                &["columns", "cards"]
            }
        }

        let registry = BehaviourRegistry::empty().with(Board);
        let board = json!({"type": "Board", "columns": ["c1"], "cards": ["k1", 7]});
        assert_eq!(registry.resolve(&board).children(&board), vec!["c1", "k1"]);
    }
}
