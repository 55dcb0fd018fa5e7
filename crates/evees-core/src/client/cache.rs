//! Local perspective state for a layered client.
//!
//! Two kinds of state live here:
//!
//! - cached details, a read-through mirror of the base keyed by perspective
//!   id, each remembering how many levels of its sub-tree were fetched. An
//!   entry created by a local write before any read has no levels: it only
//!   holds the local fields, so reads still go to the base;
//! - the mutation buffer (new perspectives, updates, deletions) that a flush
//!   ships to the base.
//!
//! Buffered updates are folded into the cached details as they arrive so
//! reads observe local writes before they are flushed.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::model::{
    EveesMutation, IndexData, NewPerspective, PerspectiveDetails, PerspectiveGetResult, Update,
};

/// One cached perspective.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CachedPerspective {
    pub details: PerspectiveDetails,
    /// Depth of the sub-tree already cached below this perspective; `None`
    /// until the details have been read from the base.
    pub levels: Option<u32>,
    /// Index deltas accumulated from buffered updates.
    pub index_data: Option<IndexData>,
}

impl CachedPerspective {
    /// Whether these details answer a read `levels` deep.
    #[must_use]
    pub fn covers(&self, levels: u32) -> bool {
        self.levels.is_some_and(|cached| levels <= cached)
    }

    #[must_use]
    pub fn to_result(&self) -> PerspectiveGetResult {
        PerspectiveGetResult {
            details: self.details.clone(),
            slice: None,
        }
    }
}

pub trait ClientCache: Send + Sync {
    fn get_cached_perspective(&self, perspective_id: &str) -> Option<CachedPerspective>;

    /// Record details read from the base. Buffered local changes to the same
    /// perspective stay on top.
    fn set_cached_perspective(&self, perspective_id: &str, details: PerspectiveDetails, levels: u32);

    fn new_perspective(&self, new_perspective: NewPerspective);

    fn update_perspective(&self, update: Update);

    fn delete_perspective(&self, perspective_id: &str);

    fn is_deleted(&self, perspective_id: &str) -> bool;

    /// Whether the perspective was created locally and not yet flushed.
    fn is_new(&self, perspective_id: &str) -> bool;

    /// The buffered mutation, without entities.
    fn diff(&self) -> EveesMutation;

    /// Remove exactly what `flushed` shipped from the mutation buffer.
    /// Anything buffered after `flushed` was taken stays pending; cached
    /// details stay.
    fn clear_flushed(&self, flushed: &EveesMutation);

    /// Empty the mutation buffer; cached details stay.
    fn clear(&self) {
        self.clear_flushed(&self.diff());
    }

    /// Drop cached details of perspectives with nothing buffered.
    fn clear_cached(&self);

    /// Drop cached details of the given perspectives unless they have
    /// buffered changes.
    fn evict(&self, perspective_ids: &[String]);
}

// ---------------------------------------------------------------------------
// ClientCacheMemory
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct State {
    cached: HashMap<String, CachedPerspective>,
    /// Details written locally since the last flush, per perspective.
    local: HashMap<String, PerspectiveDetails>,
    new_perspectives: Vec<NewPerspective>,
    updates: Vec<Update>,
    deleted: Vec<String>,
}

impl State {
    fn has_pending(&self, perspective_id: &str) -> bool {
        self.local.contains_key(perspective_id)
            || self
                .new_perspectives
                .iter()
                .any(|np| np.perspective.id == perspective_id)
    }

    /// Recompute the per-perspective local state from what is still buffered.
    fn rebuild_pending(&mut self) {
        let mut local: HashMap<String, PerspectiveDetails> = HashMap::new();
        let mut index: HashMap<String, IndexData> = HashMap::new();
        let mut fold_index = |id: &str, incoming: Option<&IndexData>| {
            if let Some(incoming) = incoming {
                index.entry(id.to_string()).or_default().merge(incoming);
            }
        };

        for np in &self.new_perspectives {
            fold_index(
                &np.perspective.id,
                np.update.as_ref().and_then(|u| u.index_data.as_ref()),
            );
        }
        for update in &self.updates {
            local
                .entry(update.perspective_id.clone())
                .or_default()
                .absorb(&update.details);
            fold_index(&update.perspective_id, update.index_data.as_ref());
        }

        let still_new: HashSet<&str> = self
            .new_perspectives
            .iter()
            .map(|np| np.perspective.id.as_str())
            .collect();
        for (id, entry) in &mut self.cached {
            entry.index_data = index.remove(id);
            if entry.levels == Some(u32::MAX) && !still_new.contains(id.as_str()) {
                entry.levels = Some(0);
            }
        }
        self.local = local;
    }
}

/// Remove the first element equal to `item`.
fn remove_first<T: PartialEq>(items: &mut Vec<T>, item: &T) {
    if let Some(pos) = items.iter().position(|candidate| candidate == item) {
        items.remove(pos);
    }
}

#[derive(Debug, Default)]
pub struct ClientCacheMemory {
    state: Mutex<State>,
}

impl ClientCacheMemory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClientCache for ClientCacheMemory {
    fn get_cached_perspective(&self, perspective_id: &str) -> Option<CachedPerspective> {
        self.state.lock().cached.get(perspective_id).cloned()
    }

    fn set_cached_perspective(&self, perspective_id: &str, details: PerspectiveDetails, levels: u32) {
        let mut state = self.state.lock();
        let mut merged = details;
        if let Some(local) = state.local.get(perspective_id) {
            merged.absorb(local);
        }
        let entry = state.cached.entry(perspective_id.to_string()).or_default();
        entry.details = merged;
        entry.levels = Some(levels);
    }

    fn new_perspective(&self, new_perspective: NewPerspective) {
        let mut state = self.state.lock();
        let id = new_perspective.perspective.id.clone();
        let mut details = PerspectiveDetails {
            can_update: Some(true),
            ..PerspectiveDetails::default()
        };
        let mut index_data = None;
        if let Some(update) = &new_perspective.update {
            details.absorb(&update.details);
            index_data.clone_from(&update.index_data);
        }
        state.deleted.retain(|d| d != &id);
        state.new_perspectives.retain(|np| np.perspective.id != id);
        state.new_perspectives.push(new_perspective);
        // Nothing below a perspective created here exists anywhere else.
        state.cached.insert(
            id,
            CachedPerspective {
                details,
                levels: Some(u32::MAX),
                index_data,
            },
        );
    }

    fn update_perspective(&self, update: Update) {
        let mut state = self.state.lock();
        let id = update.perspective_id.clone();

        state
            .local
            .entry(id.clone())
            .or_default()
            .absorb(&update.details);

        // A perspective never read gets an entry without levels.
        let entry = state.cached.entry(id).or_default();
        entry.details.absorb(&update.details);
        if let Some(incoming) = &update.index_data {
            match entry.index_data.as_mut() {
                Some(current) => current.merge(incoming),
                None => entry.index_data = Some(incoming.clone()),
            }
        }

        // Arrival order is kept: condensation needs the whole chain.
        state.updates.push(update);
    }

    fn delete_perspective(&self, perspective_id: &str) {
        let mut state = self.state.lock();
        let was_new = state
            .new_perspectives
            .iter()
            .any(|np| np.perspective.id == perspective_id);

        state.cached.remove(perspective_id);
        state.local.remove(perspective_id);
        state.updates.retain(|u| u.perspective_id != perspective_id);

        if was_new {
            state
                .new_perspectives
                .retain(|np| np.perspective.id != perspective_id);
        } else if !state.deleted.iter().any(|d| d == perspective_id) {
            state.deleted.push(perspective_id.to_string());
        }
    }

    fn is_deleted(&self, perspective_id: &str) -> bool {
        self.state.lock().deleted.iter().any(|d| d == perspective_id)
    }

    fn is_new(&self, perspective_id: &str) -> bool {
        self.state
            .lock()
            .new_perspectives
            .iter()
            .any(|np| np.perspective.id == perspective_id)
    }

    fn diff(&self) -> EveesMutation {
        let state = self.state.lock();
        EveesMutation {
            new_perspectives: state.new_perspectives.clone(),
            updates: state.updates.clone(),
            deleted_perspectives: state.deleted.clone(),
            entities: Vec::new(),
        }
    }

    fn clear_flushed(&self, flushed: &EveesMutation) {
        let mut state = self.state.lock();
        for np in &flushed.new_perspectives {
            remove_first(&mut state.new_perspectives, np);
        }
        for update in &flushed.updates {
            remove_first(&mut state.updates, update);
        }
        state
            .deleted
            .retain(|id| !flushed.deleted_perspectives.contains(id));
        state.rebuild_pending();
    }

    fn clear_cached(&self) {
        let mut state = self.state.lock();
        let State { cached, local, new_perspectives, .. } = &mut *state;
        cached.retain(|id, _| {
            local.contains_key(id) || new_perspectives.iter().any(|np| &np.perspective.id == id)
        });
    }

    fn evict(&self, perspective_ids: &[String]) {
        let mut state = self.state.lock();
        for id in perspective_ids {
            if !state.has_pending(id) {
                state.cached.remove(id);
            }
        }
    }
}
