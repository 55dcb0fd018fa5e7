//! Recursive three-way merge of one perspective into another.
//!
//! `merge_perspectives(to, from)` folds the content of `from` into `to`:
//!
//! 1. A `from` without a head leaves `to` as is. A `to` without a head is
//!    fast-forwarded to `from`'s head; no commit is created.
//! 2. Both heads are resolved through `forking` edges to their latest
//!    non-fork commit. Equal resolved heads, or `from` already in `to`'s
//!    history, leave `to` unchanged.
//! 3. The data of the common ancestor, `to` and `from` are merged field by
//!    field. Fields the type's [`MergeBehaviour`] declares as links merge as
//!    ordered lists; everything else by the scalar rule.
//! 4. Children on both sides that are versions of the same thing (same
//!    perspective `context`) are identified, and with
//!    [`MergeConfig::recurse`] merged into each other first.
//! 5. A result equal to `to`'s data is a no-op; equal to `from`'s data with
//!    `to` in `from`'s history is a fast-forward; anything else becomes a
//!    merge commit whose parents are both resolved heads.
//!
//! Every change goes out as a single [`Update`] per perspective through
//! [`Client::update`], with the observed head as precondition.

use std::collections::{BTreeMap, HashMap, HashSet};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, trace};

use super::ancestor::CommitGraph;
use super::arrays::{Side, merge_ordered, merge_scalar};
use super::behaviour::{BehaviourRegistry, MergeBehaviour, links};
use crate::cas::CasStore;
use crate::client::{Client, head_of};
use crate::error::Result;
use crate::model::{
    ArrayChanges, Commit, Entity, EveesMutation, IndexData, Perspective, Update,
};

/// Merge settings, loaded from the `[merge]` config section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Merge matching children into each other before merging the parent.
    pub recurse: bool,
    /// Side whose value survives a divergent edit.
    pub winner: Side,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            recurse: true,
            winner: Side::default(),
        }
    }
}

/// What a merge did to the `to` perspective.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Nothing to merge; `to` keeps this head.
    Unchanged(Option<String>),
    /// `to` now points at `from`'s head.
    FastForward(String),
    /// `to` now points at a new merge commit.
    Merged(String),
}

impl MergeOutcome {
    /// Head of `to` after the merge.
    #[must_use]
    pub fn head(&self) -> Option<&str> {
        match self {
            Self::Unchanged(head) => head.as_deref(),
            Self::FastForward(head) | Self::Merged(head) => Some(head.as_str()),
        }
    }

    /// Whether the merge emitted an update.
    #[must_use]
    pub const fn changed(&self) -> bool {
        !matches!(self, Self::Unchanged(_))
    }
}

/// Children of `to` and `from` that are versions of the same thing.
#[derive(Debug, Default)]
struct ChildMatch {
    /// from child -> to child.
    mapping: HashMap<String, String>,
    /// (to child, from child), in `from` order.
    pairs: Vec<(String, String)>,
}

/// Merges perspectives through a client.
///
/// Borrowing the client keeps the strategy usable over any layer: a scratch
/// layered client for proposals, or the application's own client.
pub struct MergeStrategy<'a> {
    client: &'a dyn Client,
    behaviours: &'a BehaviourRegistry,
    config: MergeConfig,
    creator_id: String,
    timestamp: Option<i64>,
}

impl<'a> MergeStrategy<'a> {
    pub fn new(client: &'a dyn Client, behaviours: &'a BehaviourRegistry) -> Self {
        Self {
            client,
            behaviours,
            config: MergeConfig::default(),
            creator_id: String::new(),
            timestamp: None,
        }
    }

    #[must_use]
    pub const fn with_config(mut self, config: MergeConfig) -> Self {
        self.config = config;
        self
    }

    /// Author recorded on merge commits.
    #[must_use]
    pub fn with_creator(mut self, creator_id: impl Into<String>) -> Self {
        self.creator_id = creator_id.into();
        self
    }

    /// Fixed timestamp for merge commits instead of the wall clock.
    #[must_use]
    pub const fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Merge `from` into `to`.
    ///
    /// # Errors
    ///
    /// Fails if either perspective is unknown, a commit or data object cannot
    /// be fetched, or the client rejects the resulting update. Content
    /// conflicts are never errors.
    #[instrument(level = "info", skip(self))]
    pub async fn merge_perspectives(&self, to: &str, from: &str) -> Result<MergeOutcome> {
        let mut visited = HashSet::new();
        let outcome = self
            .merge_inner(to.to_string(), from.to_string(), &mut visited)
            .await?;
        info!(?outcome, perspectives = visited.len(), "merge finished");
        Ok(outcome)
    }

    fn merge_inner<'s>(
        &'s self,
        to: String,
        from: String,
        visited: &'s mut HashSet<(String, String)>,
    ) -> BoxFuture<'s, Result<MergeOutcome>> {
        async move {
            let to_head = head_of(self.client, &to).await?;
            if !visited.insert((to.clone(), from.clone())) {
                return Ok(MergeOutcome::Unchanged(to_head));
            }

            let Some(from_head) = head_of(self.client, &from).await? else {
                debug!(%to, %from, "source has no head");
                return Ok(MergeOutcome::Unchanged(to_head));
            };
            let Some(to_head) = to_head else {
                self.move_head(&to, None, &from_head, Some(&from), None, Vec::new())
                    .await?;
                return Ok(MergeOutcome::FastForward(from_head));
            };

            let store = self.client.store();
            let mut graph = CommitGraph::new(store.as_ref());
            let to_resolved = graph.latest_non_fork(&to_head).await?;
            let from_resolved = graph.latest_non_fork(&from_head).await?;
            if to_resolved == from_resolved
                || graph.is_ancestor_of(&from_resolved, &to_resolved, &[]).await?
            {
                return Ok(MergeOutcome::Unchanged(Some(to_head)));
            }

            let ancestor = graph
                .find_common_ancestor(&to_resolved, &from_resolved)
                .await?;
            let to_data_id = graph.commit(&to_resolved).await?.data_id.clone();
            let from_data_id = graph.commit(&from_resolved).await?.data_id.clone();
            let ancestor_data = match &ancestor {
                Some(id) => {
                    let data_id = graph.commit(id).await?.data_id.clone();
                    store.get_entity(&data_id).await?.object
                }
                None => Value::Null,
            };
            let to_data = store.get_entity(&to_data_id).await?.object;
            let from_data = store.get_entity(&from_data_id).await?.object;

            let behaviour = self.behaviour_for(&to_data, &from_data);
            let to_children = behaviour.children(&to_data);
            let from_children = behaviour.children(&from_data);
            let matched = match_children(store.as_ref(), &to_children, &from_children).await?;
            trace!(pairs = matched.pairs.len(), "matched children by context");

            if self.config.recurse {
                for (to_child, from_child) in &matched.pairs {
                    self.merge_inner(to_child.clone(), from_child.clone(), visited)
                        .await?;
                }
            }

            let merged = self.merge_data(
                &ancestor_data,
                &to_data,
                &from_data,
                behaviour,
                &matched.mapping,
            );

            if merged == to_data {
                return Ok(MergeOutcome::Unchanged(Some(to_head)));
            }
            let children_changes =
                ArrayChanges::between(&to_children, &behaviour.children(&merged));
            if merged == from_data && ancestor.as_deref() == Some(to_resolved.as_str()) {
                self.move_head(
                    &to,
                    Some(to_head),
                    &from_head,
                    Some(&from),
                    Some(children_changes),
                    Vec::new(),
                )
                .await?;
                return Ok(MergeOutcome::FastForward(from_head));
            }

            let data = store.hash_entity(merged).await?;
            let commit = Commit {
                creators_ids: vec![self.creator_id.clone()],
                timestamp: self
                    .timestamp
                    .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
                message: Some(format!("merge {from} into {to}")),
                parents_ids: vec![to_resolved, from_resolved],
                data_id: data.id.clone(),
                forking: None,
            };
            let commit = store.hash_entity(serde_json::to_value(&commit)?).await?;
            let commit_id = commit.id.clone();
            self.move_head(
                &to,
                Some(to_head),
                &commit_id,
                Some(&from),
                Some(children_changes),
                vec![data, commit],
            )
            .await?;
            debug!(%to, %from, head = %commit_id, "created merge commit");
            Ok(MergeOutcome::Merged(commit_id))
        }
        .boxed()
    }

    /// Emit the single update moving `to` to `head`.
    async fn move_head(
        &self,
        to: &str,
        old_head: Option<String>,
        head: &str,
        from: Option<&str>,
        children: Option<ArrayChanges>,
        entities: Vec<Entity>,
    ) -> Result<()> {
        let mut update = Update::head(to, head).with_old_head(old_head);
        update.from_perspective_id = from.map(str::to_string);
        if let Some(children) = children.filter(|c| !c.is_empty()) {
            update = update.with_index_data(IndexData::children(children));
        }
        self.client
            .update(EveesMutation {
                updates: vec![update],
                entities,
                ..EveesMutation::default()
            })
            .await
    }

    /// Behaviour by `to`'s type, or `from`'s when `to` declares none.
    fn behaviour_for(&self, to: &Value, from: &Value) -> &'a dyn MergeBehaviour {
        let behaviours: &'a BehaviourRegistry = self.behaviours;
        let resolved = behaviours.resolve(to);
        if resolved.kind().is_empty() {
            behaviours.resolve(from)
        } else {
            resolved
        }
    }

    fn merge_data(
        &self,
        ancestor: &Value,
        to: &Value,
        from: &Value,
        behaviour: &dyn MergeBehaviour,
        mapping: &HashMap<String, String>,
    ) -> Value {
        let (Value::Object(to_map), Value::Object(from_map)) = (to, from) else {
            return merge_scalar(ancestor, to, from, self.config.winner);
        };
        let empty = Map::new();
        let ancestor_map = ancestor.as_object().unwrap_or(&empty);

        let mut merged = Map::new();
        let keys = to_map
            .keys()
            .chain(from_map.keys().filter(|k| !to_map.contains_key(*k)));
        for key in keys {
            if behaviour.link_fields().contains(&key.as_str()) {
                let remap = |value: &Value| -> Vec<String> {
                    links(value, key)
                        .into_iter()
                        .map(|id| mapping.get(&id).cloned().unwrap_or(id))
                        .collect()
                };
                let list = merge_ordered(&remap(ancestor), &links(to, key), &remap(from));
                merged.insert(
                    key.clone(),
                    Value::Array(list.into_iter().map(Value::String).collect()),
                );
                continue;
            }

            let value = merge_scalar(
                ancestor_map.get(key).unwrap_or(&Value::Null),
                to_map.get(key).unwrap_or(&Value::Null),
                from_map.get(key).unwrap_or(&Value::Null),
                self.config.winner,
            );
            // A null produced by one side dropping the field drops it here too.
            let dropped =
                value.is_null() && !(to_map.contains_key(key) && from_map.contains_key(key));
            if !dropped {
                merged.insert(key.clone(), value);
            }
        }
        Value::Object(merged)
    }
}

/// Pair children of `from` with children of `to` sharing a context.
///
/// Links that do not resolve to a perspective are left unmatched.
async fn match_children(
    store: &dyn CasStore,
    to_children: &[String],
    from_children: &[String],
) -> Result<ChildMatch> {
    let mut matched = ChildMatch::default();
    if from_children.is_empty() || to_children.is_empty() {
        return Ok(matched);
    }

    let mut by_context: BTreeMap<String, String> = BTreeMap::new();
    for id in to_children {
        if let Some(perspective) = try_perspective(store, id).await? {
            by_context.entry(perspective.context).or_insert_with(|| id.clone());
        }
    }
    for id in from_children {
        if to_children.contains(id) {
            continue;
        }
        let Some(perspective) = try_perspective(store, id).await? else {
            continue;
        };
        if let Some(to_id) = by_context.get(&perspective.context) {
            matched.mapping.insert(id.clone(), to_id.clone());
            matched.pairs.push((to_id.clone(), id.clone()));
        }
    }
    Ok(matched)
}

async fn try_perspective(store: &dyn CasStore, id: &str) -> Result<Option<Perspective>> {
    let Some(entity) = store.try_get_entity(id).await? else {
        return Ok(None);
    };
    Ok(entity.decode::<Perspective>().ok().map(|p| p.object))
}
