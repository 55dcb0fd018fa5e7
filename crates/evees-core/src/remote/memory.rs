//! In-memory remote.
//!
//! Holds perspective registrations, their details and a children index in one
//! lock; content lives in a standalone [`CasCachedWithBase`]. A mutation is
//! validated as a whole before any of it is applied, so a failed precondition
//! leaves the remote untouched.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use super::{RemoteEvees, apply_update, build_slice, children_delta};
use crate::cas::{CasCachedWithBase, CasStore};
use crate::client::{Client, EVENTS_CAPACITY};
use crate::error::{EveesError, Result};
use crate::hash::Hasher;
use crate::model::{
    EntityCreate, EveesMutation, GetPerspectiveOptions, Perspective, PerspectiveDetails,
    PerspectiveGetResult,
};

#[derive(Debug, Default)]
struct State {
    perspectives: HashMap<String, Perspective>,
    details: HashMap<String, PerspectiveDetails>,
    /// parent -> children, in insertion order.
    children: HashMap<String, Vec<String>>,
    user: Option<String>,
}

impl State {
    /// Creator of the perspective or of one of its guardians.
    fn can_update(&self, perspective_id: &str, user_id: &str) -> bool {
        let mut visited = HashSet::new();
        let mut current = Some(perspective_id.to_string());
        while let Some(id) = current {
            if !visited.insert(id.clone()) {
                return false;
            }
            if self
                .perspectives
                .get(&id)
                .is_some_and(|p| p.creator_id == user_id)
            {
                return true;
            }
            current = self.details.get(&id).and_then(|d| d.guardian_id.clone());
        }
        false
    }
}

pub struct MemoryRemote {
    id: String,
    hasher: Hasher,
    store: Arc<CasCachedWithBase>,
    state: Mutex<State>,
    events: broadcast::Sender<Vec<String>>,
}

impl std::fmt::Debug for MemoryRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRemote")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl MemoryRemote {
    pub fn new(id: impl Into<String>, hasher: Hasher) -> Self {
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        Self {
            id: id.into(),
            hasher,
            store: Arc::new(CasCachedWithBase::standalone(hasher)),
            state: Mutex::new(State::default()),
            events,
        }
    }

    /// Same as [`MemoryRemote::new`], logged in as `user_id`.
    pub fn with_user(id: impl Into<String>, hasher: Hasher, user_id: impl Into<String>) -> Self {
        let remote = Self::new(id, hasher);
        remote.state.lock().user = Some(user_id.into());
        remote
    }

    /// Perspectives registered under `context`, sorted by id.
    #[must_use]
    pub fn perspectives_with_context(&self, context: &str) -> Vec<String> {
        let state = self.state.lock();
        let mut ids: Vec<String> = state
            .perspectives
            .iter()
            .filter(|(_, p)| p.context == context)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Perspectives listing `child_id` among their children, sorted by id.
    #[must_use]
    pub fn ecosystem_parents(&self, child_id: &str) -> Vec<String> {
        let state = self.state.lock();
        let parents: BTreeSet<String> = state
            .children
            .iter()
            .filter(|(_, children)| children.iter().any(|c| c == child_id))
            .map(|(parent, _)| parent.clone())
            .collect();
        parents.into_iter().collect()
    }

    fn apply(&self, mutation: &EveesMutation) -> Result<()> {
        let mut state = self.state.lock();

        // Stage every touched perspective, validating in order.
        let mut staged: HashMap<String, PerspectiveDetails> = HashMap::new();
        for new_perspective in &mutation.new_perspectives {
            let mut details = PerspectiveDetails::default();
            if let Some(update) = &new_perspective.update {
                apply_update(&mut details, update)?;
            }
            staged.insert(new_perspective.perspective.id.clone(), details);
        }
        for update in &mutation.updates {
            let id = &update.perspective_id;
            if !staged.contains_key(id) {
                let current = state
                    .details
                    .get(id)
                    .cloned()
                    .ok_or_else(|| EveesError::PerspectiveNotFound(id.clone()))?;
                staged.insert(id.clone(), current);
            }
            if let Some(details) = staged.get_mut(id) {
                apply_update(details, update)?;
            }
        }

        // Commit.
        for new_perspective in &mutation.new_perspectives {
            state.perspectives.insert(
                new_perspective.perspective.id.clone(),
                new_perspective.perspective.object.clone(),
            );
        }
        state.details.extend(staged);
        let updates = mutation
            .new_perspectives
            .iter()
            .filter_map(|np| np.update.as_ref())
            .chain(&mutation.updates);
        for update in updates {
            if let Some(delta) = children_delta(update) {
                let children = state
                    .children
                    .entry(update.perspective_id.clone())
                    .or_default();
                children.retain(|c| !delta.removed.contains(c));
                for added in &delta.added {
                    if !children.contains(added) {
                        children.push(added.clone());
                    }
                }
            }
        }
        for perspective_id in &mutation.deleted_perspectives {
            state.perspectives.remove(perspective_id);
            state.details.remove(perspective_id);
            state.children.remove(perspective_id);
        }
        Ok(())
    }

    fn lookup(&self, perspective_id: &str) -> (Option<PerspectiveDetails>, Vec<String>) {
        let state = self.state.lock();
        (
            state.details.get(perspective_id).cloned(),
            state
                .children
                .get(perspective_id)
                .cloned()
                .unwrap_or_default(),
        )
    }
}

#[async_trait]
impl Client for MemoryRemote {
    fn store(&self) -> Arc<dyn CasStore> {
        self.store.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<String>> {
        self.events.subscribe()
    }

    async fn get_perspective(
        &self,
        perspective_id: &str,
        options: GetPerspectiveOptions,
    ) -> Result<PerspectiveGetResult> {
        let details = {
            let state = self.state.lock();
            let mut details = state
                .details
                .get(perspective_id)
                .cloned()
                .ok_or_else(|| EveesError::PerspectiveNotFound(perspective_id.to_string()))?;
            details.can_update = Some(
                state
                    .user
                    .as_deref()
                    .is_some_and(|user| state.can_update(perspective_id, user)),
            );
            details
        };

        let depth = options.depth();
        let slice = if depth == 0 {
            None
        } else {
            Some(
                build_slice(self.store.as_ref(), perspective_id, depth, |id| {
                    Ok(self.lookup(id))
                })
                .await?,
            )
        };
        Ok(PerspectiveGetResult { details, slice })
    }

    async fn update(&self, mutation: EveesMutation) -> Result<()> {
        let mut entities: Vec<EntityCreate> = mutation
            .entities
            .iter()
            .cloned()
            .map(EntityCreate::from)
            .collect();
        for new_perspective in &mutation.new_perspectives {
            entities.push(new_perspective.perspective.erase()?.into());
        }
        if !entities.is_empty() {
            self.store.store_entities(entities).await?;
            self.store.flush().await?;
        }

        self.apply(&mutation)?;

        let ids = mutation.perspective_ids();
        debug!(remote = %self.id, perspectives = ids.len(), "applied mutation");
        let _ = self.events.send(ids);
        Ok(())
    }

    async fn diff(&self) -> Result<EveesMutation> {
        Ok(EveesMutation::default())
    }

    async fn flush(&self) -> Result<()> {
        self.store.flush().await
    }

    async fn refresh(&self) -> Result<()> {
        Ok(())
    }

    async fn can_update(&self, perspective_id: &str, user_id: Option<&str>) -> Result<bool> {
        let state = self.state.lock();
        let user = user_id.map(str::to_string).or_else(|| state.user.clone());
        Ok(user.is_some_and(|user| state.can_update(perspective_id, &user)))
    }

    async fn get_user_perspectives(&self, perspective_id: &str) -> Result<Vec<String>> {
        let state = self.state.lock();
        let Some(user) = state.user.clone() else {
            return Ok(Vec::new());
        };
        let context = state
            .perspectives
            .get(perspective_id)
            .map(|p| p.context.clone())
            .ok_or_else(|| EveesError::PerspectiveNotFound(perspective_id.to_string()))?;
        let mut ids: Vec<String> = state
            .perspectives
            .iter()
            .filter(|(id, p)| {
                p.context == context && p.creator_id == user && id.as_str() != perspective_id
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl RemoteEvees for MemoryRemote {
    fn id(&self) -> &str {
        &self.id
    }

    fn hasher(&self) -> Hasher {
        self.hasher
    }

    fn user_id(&self) -> Option<String> {
        self.state.lock().user.clone()
    }

    fn as_client(self: Arc<Self>) -> Arc<dyn Client> {
        self
    }

    async fn login(&self, user_id: &str) -> Result<()> {
        self.state.lock().user = Some(user_id.to_string());
        Ok(())
    }

    async fn logout(&self) -> Result<()> {
        self.state.lock().user = None;
        Ok(())
    }
}
