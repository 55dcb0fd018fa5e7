//! Remotes: the authoritative bottom of a client stack.
//!
//! # Sub-modules
//!
//! - [`memory`]: in-memory remote for tests and embedding.
//! - [`sqlite`]: persistent local remote on SQLite.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryRemote;
pub use sqlite::SqliteRemote;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;

use crate::cas::CasStore;
use crate::client::Client;
use crate::error::{EveesError, Result};
use crate::hash::Hasher;
use crate::model::{
    ArrayChanges, Commit, Entity, PartialPerspective, Perspective, PerspectiveDetails, Slice,
    SlicePerspective, Update,
};

/// A backend authoritative for the perspectives naming it.
#[async_trait]
pub trait RemoteEvees: Client {
    /// Id perspectives use in their `remote` field.
    fn id(&self) -> &str;

    fn hasher(&self) -> Hasher;

    /// Logged-in user, if any.
    fn user_id(&self) -> Option<String>;

    fn as_client(self: Arc<Self>) -> Arc<dyn Client>;

    /// Deterministically derive a perspective owned by this remote.
    ///
    /// Missing fields default to the logged-in user, the current time, an
    /// empty path and a context of `<creator>.<timestamp>`.
    async fn snap_perspective(&self, partial: PartialPerspective) -> Result<Entity<Perspective>> {
        let creator_id = partial
            .creator_id
            .or_else(|| self.user_id())
            .unwrap_or_default();
        let timestamp = partial
            .timestamp
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
        let context = partial
            .context
            .unwrap_or_else(|| format!("{creator_id}.{timestamp}"));
        let perspective = Perspective {
            remote: self.id().to_string(),
            path: partial.path.unwrap_or_default(),
            creator_id,
            context,
            timestamp,
            meta: partial.meta,
        };
        self.hasher().typed_entity(&perspective)
    }

    async fn is_logged(&self) -> bool {
        self.user_id().is_some()
    }

    async fn login(&self, user_id: &str) -> Result<()>;

    async fn logout(&self) -> Result<()>;

    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn ready(&self) -> Result<()> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Shared update semantics
// ---------------------------------------------------------------------------

/// Check `update`'s precondition against `current` and apply it.
///
/// `canUpdate` is caller-relative and never stored.
pub(crate) fn apply_update(current: &mut PerspectiveDetails, update: &Update) -> Result<()> {
    let stale = update
        .old_details
        .as_ref()
        .filter(|old| old.head_id != current.head_id);
    if let Some(old) = stale {
        return Err(EveesError::PreconditionFailed {
            perspective_id: update.perspective_id.clone(),
            expected: old.head_id.clone(),
            actual: current.head_id.clone(),
        });
    }
    current.absorb(&update.details);
    current.can_update = None;
    Ok(())
}

/// Children delta carried by an update, if any.
pub(crate) fn children_delta(update: &Update) -> Option<&ArrayChanges> {
    update
        .index_data
        .as_ref()
        .and_then(|index| index.link_changes.as_ref())
        .and_then(|links| links.children.as_ref())
}

/// Collect `depth` levels below `root`: nested perspectives' details, their
/// perspective entities, and every head commit and data object on the way.
///
/// `lookup` returns a perspective's details (if registered) and its children.
pub(crate) async fn build_slice<F>(
    store: &dyn CasStore,
    root: &str,
    depth: u32,
    lookup: F,
) -> Result<Slice>
where
    F: Fn(&str) -> Result<(Option<PerspectiveDetails>, Vec<String>)> + Send + Sync,
{
    let mut slice = Slice::default();
    let mut seen: HashSet<String> = HashSet::from([root.to_string()]);
    let mut frontier = vec![root.to_string()];

    for _ in 0..depth {
        if frontier.is_empty() {
            break;
        }
        let mut heads = Vec::new();
        let mut next = Vec::new();
        for id in &frontier {
            let (details, children) = lookup(id)?;
            heads.extend(details.and_then(|d| d.head_id));
            for child in children {
                if !seen.insert(child.clone()) {
                    continue;
                }
                if let (Some(details), _) = lookup(&child)? {
                    slice.perspectives.push(SlicePerspective {
                        id: child.clone(),
                        details,
                    });
                    next.push(child);
                }
            }
        }

        let commits = store.get_entities(&heads).await?;
        let data_ids: Vec<String> = commits
            .iter()
            .filter_map(|entity| entity.decode::<Commit>().ok())
            .map(|commit| commit.object.data_id)
            .collect();
        slice.entities.extend(commits);
        slice.entities.extend(store.get_entities(&data_ids).await?);
        slice.entities.extend(store.get_entities(&next).await?);
        frontier = next;
    }
    Ok(slice)
}
