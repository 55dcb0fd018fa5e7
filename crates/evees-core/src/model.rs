//! Perspective/commit data model.
//!
//! Everything here is plain data exchanged between layers. Field names
//! serialize in camelCase because the serialized form is what gets hashed:
//! two replicas must produce byte-identical objects for the same logical
//! commit or perspective.
//!
//! # Identity
//!
//! [`Perspective`] and [`Commit`] are immutable and identified by the hash of
//! their serialized form (see [`crate::hash`]). [`PerspectiveDetails`] is the
//! mutable state behind a perspective id and is never hashed.

use std::collections::BTreeSet;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{EveesError, Result};

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// An immutable object together with its content id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity<T = Value> {
    pub id: String,
    pub object: T,
}

impl Entity {
    /// Decode the JSON object into a typed entity.
    ///
    /// # Errors
    ///
    /// Returns [`EveesError::MalformedEntity`] if the object does not have the
    /// shape of `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<Entity<T>> {
        let object = serde_json::from_value(self.object.clone())
            .map_err(|e| EveesError::malformed(&self.id, e))?;
        Ok(Entity {
            id: self.id.clone(),
            object,
        })
    }
}

impl<T: Serialize> Entity<T> {
    /// Drop the static type, keeping the JSON form.
    ///
    /// # Errors
    ///
    /// Returns a serialization error if `T` cannot be represented as JSON.
    pub fn erase(&self) -> Result<Entity> {
        Ok(Entity {
            id: self.id.clone(),
            object: serde_json::to_value(&self.object)?,
        })
    }
}

/// An object submitted for storage, optionally with the id the caller
/// believes it has.
///
/// Stores never trust `id`: it is recomputed and compared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityCreate {
    pub object: Value,
    pub id: Option<String>,
}

impl From<Value> for EntityCreate {
    fn from(object: Value) -> Self {
        Self { object, id: None }
    }
}

impl From<Entity> for EntityCreate {
    fn from(entity: Entity) -> Self {
        Self {
            object: entity.object,
            id: Some(entity.id),
        }
    }
}

// ---------------------------------------------------------------------------
// Perspective
// ---------------------------------------------------------------------------

/// A durable name for an evolving piece of content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Perspective {
    /// Id of the remote authoritative for this perspective's details.
    pub remote: String,
    pub path: String,
    pub creator_id: String,
    /// Perspectives sharing a context are versions of the same thing.
    pub context: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<PerspectiveMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerspectiveMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forking: Option<ForkOf>,
}

/// Where a forked perspective was copied from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForkOf {
    pub perspective_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_id: Option<String>,
}

/// Inputs for deterministically deriving a [`Perspective`].
///
/// Missing fields are filled in by the remote that snaps it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialPerspective {
    pub creator_id: Option<String>,
    pub timestamp: Option<i64>,
    pub path: Option<String>,
    pub context: Option<String>,
    pub meta: Option<PerspectiveMeta>,
}

// ---------------------------------------------------------------------------
// PerspectiveDetails
// ---------------------------------------------------------------------------

/// Mutable resolution state of a perspective.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerspectiveDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub head_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guardian_id: Option<String>,
    /// Relative to the caller; never part of any content id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_update: Option<bool>,
}

impl PerspectiveDetails {
    /// Details pointing at `head_id` and nothing else.
    #[must_use]
    pub fn with_head(head_id: impl Into<String>) -> Self {
        Self {
            head_id: Some(head_id.into()),
            ..Self::default()
        }
    }

    /// Overlay `incoming` on `self`: each field keeps its current value when
    /// `incoming` leaves it unset.
    pub fn absorb(&mut self, incoming: &Self) {
        if incoming.head_id.is_some() {
            self.head_id.clone_from(&incoming.head_id);
        }
        if incoming.guardian_id.is_some() {
            self.guardian_id.clone_from(&incoming.guardian_id);
        }
        if incoming.can_update.is_some() {
            self.can_update = incoming.can_update;
        }
    }
}

// ---------------------------------------------------------------------------
// Commit
// ---------------------------------------------------------------------------

/// An immutable node of the history DAG.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    pub creators_ids: Vec<String>,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub parents_ids: Vec<String>,
    pub data_id: String,
    /// Commit whose lineage this one supersedes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forking: Option<String>,
}

impl Commit {
    /// Parent edges followed by the forking edge, if any.
    pub fn lineage(&self) -> impl Iterator<Item = &str> {
        self.parents_ids
            .iter()
            .map(String::as_str)
            .chain(self.forking.as_deref())
    }
}

// ---------------------------------------------------------------------------
// Index data
// ---------------------------------------------------------------------------

/// Added/removed members of a link set.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ArrayChanges {
    #[serde(default)]
    pub added: Vec<String>,
    #[serde(default)]
    pub removed: Vec<String>,
}

impl ArrayChanges {
    /// Changes turning `before` into `after`, in `after`/`before` order.
    #[must_use]
    pub fn between(before: &[String], after: &[String]) -> Self {
        let before_set: BTreeSet<&String> = before.iter().collect();
        let after_set: BTreeSet<&String> = after.iter().collect();
        Self {
            added: after
                .iter()
                .filter(|id| !before_set.contains(id))
                .cloned()
                .collect(),
            removed: before
                .iter()
                .filter(|id| !after_set.contains(id))
                .cloned()
                .collect(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Fold a later change set into this one.
    ///
    /// An id added later cancels an earlier removal and vice versa, so the
    /// result describes the net effect of both in sequence. For disjoint sets
    /// this is the plain union.
    pub fn merge(&mut self, later: &Self) {
        for id in &later.added {
            self.removed.retain(|r| r != id);
            if !self.added.contains(id) {
                self.added.push(id.clone());
            }
        }
        for id in &later.removed {
            self.added.retain(|a| a != id);
            if !self.removed.contains(id) {
                self.removed.push(id.clone());
            }
        }
    }
}

fn merge_optional(slot: &mut Option<ArrayChanges>, later: Option<&ArrayChanges>) {
    match (slot.as_mut(), later) {
        (Some(current), Some(later)) => current.merge(later),
        (None, Some(later)) => *slot = Some(later.clone()),
        (_, None) => {}
    }
}

/// Link deltas, per link kind.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkChanges {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<ArrayChanges>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_ecosystem: Option<ArrayChanges>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub links_to: Option<ArrayChanges>,
}

impl LinkChanges {
    /// Deep merge: each kind is merged set-wise rather than replaced.
    pub fn merge(&mut self, later: &Self) {
        merge_optional(&mut self.children, later.children.as_ref());
        merge_optional(&mut self.on_ecosystem, later.on_ecosystem.as_ref());
        merge_optional(&mut self.links_to, later.links_to.as_ref());
    }
}

/// Secondary-index deltas carried next to an update.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_changes: Option<LinkChanges>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

impl IndexData {
    /// Index data recording only a change of children.
    #[must_use]
    pub fn children(changes: ArrayChanges) -> Self {
        Self {
            link_changes: Some(LinkChanges {
                children: Some(changes),
                ..LinkChanges::default()
            }),
            text: None,
        }
    }

    /// Deep-merge `later` into `self`; a later `text` replaces an earlier one.
    pub fn merge(&mut self, later: &Self) {
        match (self.link_changes.as_mut(), later.link_changes.as_ref()) {
            (Some(current), Some(later)) => current.merge(later),
            (None, Some(later)) => self.link_changes = Some(later.clone()),
            (_, None) => {}
        }
        if later.text.is_some() {
            self.text.clone_from(&later.text);
        }
    }
}

// ---------------------------------------------------------------------------
// Mutations
// ---------------------------------------------------------------------------

/// A proposed transition of one perspective.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Update {
    pub perspective_id: String,
    pub details: PerspectiveDetails,
    /// Precondition: the head the writer saw.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_details: Option<PerspectiveDetails>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_perspective_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index_data: Option<IndexData>,
}

impl Update {
    /// Update moving `perspective_id` to `head_id`.
    #[must_use]
    pub fn head(perspective_id: impl Into<String>, head_id: impl Into<String>) -> Self {
        Self {
            perspective_id: perspective_id.into(),
            details: PerspectiveDetails::with_head(head_id),
            old_details: None,
            from_perspective_id: None,
            index_data: None,
        }
    }

    #[must_use]
    pub fn with_old_head(mut self, old_head: Option<String>) -> Self {
        self.old_details = Some(PerspectiveDetails {
            head_id: old_head,
            ..PerspectiveDetails::default()
        });
        self
    }

    #[must_use]
    pub fn with_index_data(mut self, index_data: IndexData) -> Self {
        self.index_data = Some(index_data);
        self
    }
}

/// A perspective being registered, optionally with its first update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPerspective {
    pub perspective: Entity<Perspective>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<Update>,
}

/// The atomic unit of change exchanged between layers.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EveesMutation {
    #[serde(default)]
    pub new_perspectives: Vec<NewPerspective>,
    #[serde(default)]
    pub updates: Vec<Update>,
    #[serde(default)]
    pub deleted_perspectives: Vec<String>,
    #[serde(default)]
    pub entities: Vec<Entity>,
}

impl EveesMutation {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.new_perspectives.is_empty()
            && self.updates.is_empty()
            && self.deleted_perspectives.is_empty()
            && self.entities.is_empty()
    }

    /// Append everything in `other`.
    pub fn extend(&mut self, other: Self) {
        self.new_perspectives.extend(other.new_perspectives);
        self.updates.extend(other.updates);
        self.deleted_perspectives.extend(other.deleted_perspectives);
        for entity in other.entities {
            if !self.entities.iter().any(|e| e.id == entity.id) {
                self.entities.push(entity);
            }
        }
    }

    /// Ids of every perspective the mutation touches, deduplicated, in order.
    #[must_use]
    pub fn perspective_ids(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        self.new_perspectives
            .iter()
            .map(|np| np.perspective.id.clone())
            .chain(self.updates.iter().map(|u| u.perspective_id.clone()))
            .chain(self.deleted_perspectives.iter().cloned())
            .filter(|id| seen.insert(id.clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlicePerspective {
    pub id: String,
    pub details: PerspectiveDetails,
}

/// Perspectives and entities returned alongside a read to warm caches.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Slice {
    pub perspectives: Vec<SlicePerspective>,
    pub entities: Vec<Entity>,
}

/// Options of [`crate::client::Client::get_perspective`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GetPerspectiveOptions {
    /// Depth of the sub-tree the caller wants pre-fetched. `None` is zero.
    pub levels: Option<u32>,
}

impl GetPerspectiveOptions {
    #[must_use]
    pub const fn levels(levels: u32) -> Self {
        Self {
            levels: Some(levels),
        }
    }

    #[must_use]
    pub fn depth(self) -> u32 {
        self.levels.unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PerspectiveGetResult {
    pub details: PerspectiveDetails,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slice: Option<Slice>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ids(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn commit_serializes_camel_case() {
        let commit = Commit {
            creators_ids: ids(&["alice"]),
            timestamp: 5,
            message: None,
            parents_ids: vec![],
            data_id: "d".into(),
            forking: None,
        };
        let value = serde_json::to_value(&commit).expect("serialize");
        assert_eq!(
            value,
            json!({"creatorsIds": ["alice"], "timestamp": 5, "parentsIds": [], "dataId": "d"})
        );
    }

    #[test]
    fn lineage_includes_forking() {
        let commit = Commit {
            creators_ids: vec![],
            timestamp: 0,
            message: None,
            parents_ids: ids(&["p1", "p2"]),
            data_id: "d".into(),
            forking: Some("f".into()),
        };
        assert_eq!(commit.lineage().collect::<Vec<_>>(), vec!["p1", "p2", "f"]);
    }

    #[test]
    fn details_absorb_keeps_omitted_fields() {
        let mut details = PerspectiveDetails {
            head_id: Some("h1".into()),
            guardian_id: Some("g".into()),
            can_update: Some(true),
        };
        details.absorb(&PerspectiveDetails::with_head("h2"));
        assert_eq!(details.head_id.as_deref(), Some("h2"));
        assert_eq!(details.guardian_id.as_deref(), Some("g"));
        assert_eq!(details.can_update, Some(true));
    }

    #[test]
    fn array_changes_between() {
        let changes = ArrayChanges::between(&ids(&["a", "b"]), &ids(&["b", "c"]));
        assert_eq!(changes.added, ids(&["c"]));
        assert_eq!(changes.removed, ids(&["a"]));
    }

    #[test]
    fn array_changes_merge_cancels() {
        let mut first = ArrayChanges {
            added: ids(&["a"]),
            removed: ids(&["x"]),
        };
        first.merge(&ArrayChanges {
            added: ids(&["x", "b"]),
            removed: ids(&["a"]),
        });
        assert_eq!(first.added, ids(&["x", "b"]));
        assert_eq!(first.removed, ids(&["a"]));
    }

    #[test]
    fn link_changes_deep_merge() {
        let mut index = IndexData::children(ArrayChanges {
            added: ids(&["c1"]),
            removed: vec![],
        });
        index.merge(&IndexData {
            link_changes: Some(LinkChanges {
                children: Some(ArrayChanges {
                    added: ids(&["c2"]),
                    removed: vec![],
                }),
                links_to: Some(ArrayChanges {
                    added: ids(&["l"]),
                    removed: vec![],
                }),
                on_ecosystem: None,
            }),
            text: Some("t".into()),
        });
        let links = index.link_changes.expect("links");
        assert_eq!(links.children.expect("children").added, ids(&["c1", "c2"]));
        assert_eq!(links.links_to.expect("links_to").added, ids(&["l"]));
        assert_eq!(index.text.as_deref(), Some("t"));
    }

    #[test]
    fn mutation_perspective_ids_dedup() {
        let mutation = EveesMutation {
            updates: vec![Update::head("p1", "h"), Update::head("p1", "h2")],
            deleted_perspectives: ids(&["p2"]),
            ..EveesMutation::default()
        };
        assert_eq!(mutation.perspective_ids(), ids(&["p1", "p2"]));
    }

    #[test]
    fn entity_decode_rejects_wrong_shape() {
        let entity = Entity {
            id: "x".into(),
            object: json!({"text": "not a commit"}),
        };
        assert!(entity.decode::<Commit>().is_err());
    }
}
