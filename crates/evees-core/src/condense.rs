//! Squashing runs of commits into one equivalent update.
//!
//! A layered client that buffered many updates to the same perspective holds
//! a chain of commits nobody else has seen. Before shipping them, the chain
//! can be replaced by a single commit carrying the final data:
//!
//! ```text
//!   P <- C1 <- C2 <- C3        =>        P <- C'   (C'.dataId == C3.dataId)
//! ```
//!
//! Within the updates of one perspective:
//!
//! - a commit is a *tail* if it has no parent in the set (it links to outside
//!   history, or to none);
//! - a commit is a *head* if no commit in the set names it as a parent;
//! - each head absorbs every commit of the set in its history. The new
//!   commit's parents are the parents those commits have outside the set.
//!
//! The pure [`plan`] computes the chains; [`condense_updates`] fetches commits,
//! writes the squashed ones and rewrites the updates.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, info};

use crate::cas::{self, CasStore};
use crate::error::Result;
use crate::hash::Hasher;
use crate::model::{Commit, IndexData, Update};

/// One condensed run of commits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    /// Commit whose data the run ends with.
    pub head: String,
    /// Every commit of the set in `head`'s history, `head` included, in
    /// input order.
    pub members: Vec<String>,
    /// Parents of the members that lie outside the set, deduplicated.
    pub external_parents: Vec<String>,
    /// First `forking` edge of a member that leaves the set.
    pub external_forking: Option<String>,
}

impl Chain {
    /// Whether squashing changes anything.
    #[must_use]
    pub fn is_trivial(&self) -> bool {
        self.members.len() < 2
    }

    /// The replacement commit for this run.
    #[must_use]
    pub fn squash(&self, commits: &HashMap<String, Commit>) -> Option<Commit> {
        let head = commits.get(&self.head)?;
        let mut creators: Vec<String> = Vec::new();
        for member in self.members.iter().filter_map(|id| commits.get(id)) {
            for creator in &member.creators_ids {
                if !creators.contains(creator) {
                    creators.push(creator.clone());
                }
            }
        }
        Some(Commit {
            creators_ids: creators,
            timestamp: head.timestamp,
            message: head.message.clone(),
            parents_ids: self.external_parents.clone(),
            data_id: head.data_id.clone(),
            forking: self.external_forking.clone(),
        })
    }
}

/// Chains of `commits`, given in the order they were written.
///
/// Heads come out in input order. A commit reachable from two heads belongs
/// to both.
#[must_use]
pub fn plan(commits: &[(String, Commit)]) -> Vec<Chain> {
    let in_set: HashSet<&str> = commits.iter().map(|(id, _)| id.as_str()).collect();
    let by_id: HashMap<&str, &Commit> = commits.iter().map(|(id, c)| (id.as_str(), c)).collect();

    let mut has_children: HashSet<&str> = HashSet::new();
    for (_, commit) in commits {
        has_children.extend(commit.lineage().filter(|p| in_set.contains(p)));
    }

    commits
        .iter()
        .filter(|(id, _)| !has_children.contains(id.as_str()))
        .map(|(head, _)| {
            // Walk back from the head, staying inside the set.
            let mut reached: HashSet<&str> = HashSet::from([head.as_str()]);
            let mut stack = vec![head.as_str()];
            while let Some(current) = stack.pop() {
                let Some(commit) = by_id.get(current) else {
                    continue;
                };
                for parent in commit.lineage() {
                    if in_set.contains(parent) && reached.insert(parent) {
                        stack.push(parent);
                    }
                }
            }

            let members: Vec<String> = commits
                .iter()
                .filter(|(id, _)| reached.contains(id.as_str()))
                .map(|(id, _)| id.clone())
                .collect();

            let mut seen = BTreeSet::new();
            let mut external_parents = Vec::new();
            let mut external_forking = None;
            for member in members.iter().filter_map(|id| by_id.get(id.as_str())) {
                for parent in &member.parents_ids {
                    if !in_set.contains(parent.as_str()) && seen.insert(parent.clone()) {
                        external_parents.push(parent.clone());
                    }
                }
                if external_forking.is_none() {
                    external_forking = member
                        .forking
                        .clone()
                        .filter(|f| !in_set.contains(f.as_str()));
                }
            }

            Chain {
                head: head.clone(),
                members,
                external_parents,
                external_forking,
            }
        })
        .collect()
}

/// Rewrite `updates` so each perspective gets one update per condensed head.
///
/// Updates without a head (guardian changes and the like) pass through
/// untouched. Index data of every update folded into a chain is merged in
/// order. The precondition of the earliest folded update is kept, since that
/// is the head the base still has.
///
/// # Errors
///
/// Fails if a head commit cannot be fetched or the squashed commit cannot be
/// stored.
pub async fn condense_updates(
    store: &dyn CasStore,
    hasher: &Hasher,
    updates: Vec<Update>,
) -> Result<Vec<Update>> {
    // Group by perspective, keeping first-seen order.
    let mut order: Vec<String> = Vec::new();
    let mut groups: HashMap<String, Vec<(usize, Update)>> = HashMap::new();
    let mut passthrough: Vec<(usize, Update)> = Vec::new();
    for (position, update) in updates.into_iter().enumerate() {
        if update.details.head_id.is_none() {
            passthrough.push((position, update));
            continue;
        }
        if !groups.contains_key(&update.perspective_id) {
            order.push(update.perspective_id.clone());
        }
        groups
            .entry(update.perspective_id.clone())
            .or_default()
            .push((position, update));
    }

    let mut rewritten: Vec<(usize, Update)> = passthrough;
    let mut squashed = 0usize;
    for perspective_id in order {
        let Some(group) = groups.remove(&perspective_id) else {
            continue;
        };
        let (condensed, count) = condense_group(store, hasher, group).await?;
        squashed += count;
        rewritten.extend(condensed);
    }
    rewritten.sort_by_key(|(position, _)| *position);

    if squashed > 0 {
        info!(squashed, updates = rewritten.len(), "condensed commit chains");
    }
    Ok(rewritten.into_iter().map(|(_, update)| update).collect())
}

/// Condense the updates of one perspective. Returns the rewritten updates,
/// positioned at their head update, and how many commits were elided.
async fn condense_group(
    store: &dyn CasStore,
    hasher: &Hasher,
    group: Vec<(usize, Update)>,
) -> Result<(Vec<(usize, Update)>, usize)> {
    let mut commits: Vec<(String, Commit)> = Vec::new();
    let mut by_id: HashMap<String, Commit> = HashMap::new();
    for (_, update) in &group {
        let Some(head_id) = update.details.head_id.as_deref() else {
            continue;
        };
        if by_id.contains_key(head_id) {
            continue;
        }
        let commit = cas::load::<Commit>(store, head_id).await?.object;
        by_id.insert(head_id.to_string(), commit.clone());
        commits.push((head_id.to_string(), commit));
    }

    let mut out = Vec::new();
    let mut elided = 0;
    for chain in plan(&commits) {
        let folded: Vec<&(usize, Update)> = group
            .iter()
            .filter(|(_, u)| {
                u.details
                    .head_id
                    .as_ref()
                    .is_some_and(|h| chain.members.contains(h))
            })
            .collect();
        let Some((head_position, head_update)) = folded
            .iter()
            .rev()
            .find(|(_, u)| u.details.head_id.as_deref() == Some(chain.head.as_str()))
            .map(|(position, update)| (*position, update))
        else {
            continue;
        };

        if chain.is_trivial() {
            out.push((head_position, head_update.clone()));
            continue;
        }
        let Some(commit) = chain.squash(&by_id) else {
            continue;
        };

        let entity = hasher.entity(&commit)?;
        let stored = store.store_entity(entity.into()).await?;
        debug!(
            head = %chain.head,
            members = chain.members.len(),
            squashed = %stored.id,
            "squashed commit chain"
        );

        let mut index_data: Option<IndexData> = None;
        for (_, update) in &folded {
            if let Some(later) = &update.index_data {
                match index_data.as_mut() {
                    Some(current) => current.merge(later),
                    None => index_data = Some(later.clone()),
                }
            }
        }

        let mut update = head_update.clone();
        update.details.head_id = Some(stored.id);
        update.old_details = folded.first().and_then(|(_, u)| u.old_details.clone());
        update.index_data = index_data;
        elided += chain.members.len() - 1;
        out.push((head_position, update));
    }
    Ok((out, elided))
}
