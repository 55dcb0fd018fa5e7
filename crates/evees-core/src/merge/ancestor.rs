//! Ancestry queries over the commit DAG.
//!
//! Commits are fetched lazily from a [`CasStore`] and memoized for the
//! lifetime of one [`CommitGraph`], so a search never fetches a commit twice.
//! Both parent and `forking` edges count as ancestry.
//!
//! # Common ancestor
//!
//! A bidirectional BFS walks upward from both heads, alternating one step at
//! a time. The first commit seen by both walks is the common ancestor. The
//! cost is proportional to the commits since divergence, not to the history.
//!
//! - If one head is an ancestor of the other, that head is the answer.
//! - Identical heads are their own common ancestor.
//! - Disjoint histories have none.

use std::collections::{HashMap, HashSet, VecDeque};

use tracing::trace;

use crate::cas::{self, CasStore};
use crate::error::{EveesError, Result};
use crate::model::Commit;

/// Memoizing view of the commit DAG behind a store.
pub struct CommitGraph<'a> {
    store: &'a dyn CasStore,
    commits: HashMap<String, Commit>,
}

impl<'a> CommitGraph<'a> {
    pub fn new(store: &'a dyn CasStore) -> Self {
        Self {
            store,
            commits: HashMap::new(),
        }
    }

    /// Fetch (once) and decode a commit.
    pub async fn commit(&mut self, commit_id: &str) -> Result<&Commit> {
        if !self.commits.contains_key(commit_id) {
            let commit = cas::load::<Commit>(self.store, commit_id).await?.object;
            self.commits.insert(commit_id.to_string(), commit);
        }
        self.commits
            .get(commit_id)
            .ok_or_else(|| EveesError::EntityNotFound(commit_id.to_string()))
    }

    async fn lineage(&mut self, commit_id: &str) -> Result<Vec<String>> {
        Ok(self
            .commit(commit_id)
            .await?
            .lineage()
            .map(str::to_string)
            .collect())
    }

    /// Follow `forking` edges until a commit that does not fork.
    pub async fn latest_non_fork(&mut self, commit_id: &str) -> Result<String> {
        let mut visited = HashSet::new();
        let mut current = commit_id.to_string();
        while visited.insert(current.clone()) {
            let forking = self.commit(&current).await?.forking.clone();
            match forking {
                Some(forked) => current = forked,
                None => break,
            }
        }
        Ok(current)
    }

    /// Whether `candidate` is `commit_id` or one of its ancestors.
    ///
    /// Depth-first; commits in `stop_at` are visited but not expanded, so the
    /// search never crosses that boundary.
    pub async fn is_ancestor_of(
        &mut self,
        candidate: &str,
        commit_id: &str,
        stop_at: &[String],
    ) -> Result<bool> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut stack = vec![commit_id.to_string()];
        while let Some(current) = stack.pop() {
            if current == candidate {
                return Ok(true);
            }
            if !visited.insert(current.clone()) || stop_at.contains(&current) {
                continue;
            }
            let lineage = self.lineage(&current).await?;
            stack.extend(lineage.into_iter().filter(|id| !visited.contains(id)));
        }
        trace!(visited = visited.len(), "ancestor search exhausted");
        Ok(false)
    }

    /// Nearest common ancestor of two commits, if their histories meet.
    pub async fn find_common_ancestor(&mut self, a: &str, b: &str) -> Result<Option<String>> {
        if a == b {
            return Ok(Some(a.to_string()));
        }

        let mut visited_a: HashSet<String> = HashSet::from([a.to_string()]);
        let mut visited_b: HashSet<String> = HashSet::from([b.to_string()]);
        let mut queue_a: VecDeque<String> = VecDeque::from([a.to_string()]);
        let mut queue_b: VecDeque<String> = VecDeque::from([b.to_string()]);

        loop {
            if queue_a.is_empty() && queue_b.is_empty() {
                return Ok(None);
            }
            if let Some(found) = self.step(&mut queue_a, &mut visited_a, &visited_b).await? {
                return Ok(Some(found));
            }
            if let Some(found) = self.step(&mut queue_b, &mut visited_b, &visited_a).await? {
                return Ok(Some(found));
            }
        }
    }

    /// Dequeue one commit and enqueue its lineage. Returns a commit newly
    /// seen by this walk that the other walk has already seen.
    async fn step(
        &mut self,
        queue: &mut VecDeque<String>,
        visited: &mut HashSet<String>,
        other_visited: &HashSet<String>,
    ) -> Result<Option<String>> {
        let Some(current) = queue.pop_front() else {
            return Ok(None);
        };
        for parent in self.lineage(&current).await? {
            if visited.insert(parent.clone()) {
                if other_visited.contains(&parent) {
                    return Ok(Some(parent));
                }
                queue.push_back(parent);
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::CasCachedWithBase;
    use crate::hash::Hasher;

    // -------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------

    async fn commit(
        store: &CasCachedWithBase,
        tag: &str,
        parents: &[&str],
        forking: Option<&str>,
    ) -> String {
        let commit = Commit {
            creators_ids: vec!["alice".into()],
            timestamp: 0,
            message: Some(tag.into()),
            parents_ids: parents.iter().map(|p| (*p).to_string()).collect(),
            data_id: format!("data-{tag}"),
            forking: forking.map(str::to_string),
        };
        cas::put(store, &commit).await.expect("store commit").id
    }

    fn store() -> CasCachedWithBase {
        CasCachedWithBase::standalone(Hasher::default())
    }

    // -------------------------------------------------------------------
    // is_ancestor_of
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn commit_is_its_own_ancestor() {
        let store = store();
        let a = commit(&store, "a", &[], None).await;
        let mut graph = CommitGraph::new(&store);
        assert!(graph.is_ancestor_of(&a, &a, &[]).await.expect("search"));
    }

    #[tokio::test]
    async fn disjoint_branches_are_not_ancestors() {
        let store = store();
        let a = commit(&store, "a", &[], None).await;
        let b = commit(&store, "b", &[], None).await;
        let mut graph = CommitGraph::new(&store);
        assert!(!graph.is_ancestor_of(&a, &b, &[]).await.expect("search"));
        assert!(graph.find_common_ancestor(&a, &b).await.expect("lca").is_none());
    }

    #[tokio::test]
    async fn converging_branches_terminate() {
        //   root
        //   /  \
        //  l    r
        //   \  /
        //   merge
        let store = store();
        let root = commit(&store, "root", &[], None).await;
        let l = commit(&store, "l", &[&root], None).await;
        let r = commit(&store, "r", &[&root], None).await;
        let merge = commit(&store, "merge", &[&l, &r], None).await;
        let unrelated = commit(&store, "x", &[], None).await;

        let mut graph = CommitGraph::new(&store);
        assert!(graph.is_ancestor_of(&root, &merge, &[]).await.expect("root"));
        assert!(!graph.is_ancestor_of(&unrelated, &merge, &[]).await.expect("x"));
    }

    #[tokio::test]
    async fn stop_at_bounds_the_search() {
        let store = store();
        let root = commit(&store, "root", &[], None).await;
        let mid = commit(&store, "mid", &[&root], None).await;
        let tip = commit(&store, "tip", &[&mid], None).await;

        let mut graph = CommitGraph::new(&store);
        assert!(!graph
            .is_ancestor_of(&root, &tip, std::slice::from_ref(&mid))
            .await
            .expect("bounded"));
        assert!(graph
            .is_ancestor_of(&mid, &tip, std::slice::from_ref(&mid))
            .await
            .expect("boundary itself"));
    }

    #[tokio::test]
    async fn forking_edge_counts_as_ancestry() {
        let store = store();
        let original = commit(&store, "orig", &[], None).await;
        let fork = commit(&store, "fork", &[], Some(&original)).await;
        let mut graph = CommitGraph::new(&store);
        assert!(graph.is_ancestor_of(&original, &fork, &[]).await.expect("fork"));
        assert_eq!(
            graph.latest_non_fork(&fork).await.expect("resolve"),
            original
        );
    }

    // -------------------------------------------------------------------
    // find_common_ancestor
    // -------------------------------------------------------------------

    #[tokio::test]
    async fn common_ancestor_of_simple_fork() {
        let store = store();
        let root = commit(&store, "root", &[], None).await;
        let a = commit(&store, "a", &[&root], None).await;
        let left = commit(&store, "left", &[&a], None).await;
        let right = commit(&store, "right", &[&a], None).await;

        let mut graph = CommitGraph::new(&store);
        assert_eq!(
            graph.find_common_ancestor(&left, &right).await.expect("lca"),
            Some(a)
        );
    }

    #[tokio::test]
    async fn common_ancestor_when_one_side_is_ancestor() {
        let store = store();
        let root = commit(&store, "root", &[], None).await;
        let child = commit(&store, "child", &[&root], None).await;
        let grandchild = commit(&store, "grandchild", &[&child], None).await;

        let mut graph = CommitGraph::new(&store);
        assert_eq!(
            graph.find_common_ancestor(&root, &grandchild).await.expect("lca"),
            Some(root.clone())
        );
        assert_eq!(
            graph.find_common_ancestor(&grandchild, &root).await.expect("lca"),
            Some(root)
        );
    }

    #[tokio::test]
    async fn missing_commit_is_an_error() {
        let store = store();
        let mut graph = CommitGraph::new(&store);
        assert!(graph.is_ancestor_of("bx", "bmissing", &[]).await.is_err());
    }
}
