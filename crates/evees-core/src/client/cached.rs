//! A [`ClientCache`] layered over a base [`Client`].
//!
//! Content goes through a [`CasCachedWithBase`] over the base client's store;
//! perspective mutations are buffered in the cache. [`Client::flush`] ships
//! both in a fixed order: entities first, then pointers, so the base never
//! holds a head it cannot resolve.
//!
//! Flushes are serialized. Each one ships a snapshot of the buffers and then
//! removes exactly that snapshot, so writes arriving while the base is being
//! awaited are kept for the next flush.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, instrument};

use super::{
    CachedPerspective, Client, ClientCache, ClientCacheMemory, EVENTS_CAPACITY, FlushOptions,
};
use crate::cas::{CasCachedWithBase, CasStore};
use crate::condense;
use crate::error::{EveesError, Result};
use crate::hash::Hasher;
use crate::model::{
    EntityCreate, EveesMutation, GetPerspectiveOptions, PerspectiveGetResult,
};

/// Mutation-buffering client.
pub struct ClientCachedWithBase {
    name: String,
    base: Arc<dyn Client>,
    cache: Arc<dyn ClientCache>,
    store: Arc<CasCachedWithBase>,
    hasher: Hasher,
    events: broadcast::Sender<Vec<String>>,
    base_events: Mutex<broadcast::Receiver<Vec<String>>>,
    flushing: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for ClientCachedWithBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientCachedWithBase")
            .field("name", &self.name)
            .field("store", &self.store)
            .finish_non_exhaustive()
    }
}

impl ClientCachedWithBase {
    /// Layer an in-memory cache over `base`.
    pub fn new(base: Arc<dyn Client>, hasher: Hasher, name: impl Into<String>) -> Self {
        Self::with_cache(base, Arc::new(ClientCacheMemory::new()), hasher, name)
    }

    pub fn with_cache(
        base: Arc<dyn Client>,
        cache: Arc<dyn ClientCache>,
        hasher: Hasher,
        name: impl Into<String>,
    ) -> Self {
        let store = Arc::new(CasCachedWithBase::over(base.store(), hasher));
        let base_events = Mutex::new(base.subscribe());
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);
        Self {
            name: name.into(),
            base,
            cache,
            store,
            hasher,
            events,
            base_events,
            flushing: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn base(&self) -> &Arc<dyn Client> {
        &self.base
    }

    /// Evict details the base reported as changed.
    fn drain_base_events(&self) {
        let mut receiver = self.base_events.lock();
        loop {
            match receiver.try_recv() {
                Ok(ids) => self.cache.evict(&ids),
                Err(TryRecvError::Lagged(skipped)) => {
                    debug!(client = %self.name, skipped, "notifications lagged, dropping cached details");
                    self.cache.clear_cached();
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
    }

    fn cached(&self, perspective_id: &str, levels: u32) -> Option<CachedPerspective> {
        self.cache
            .get_cached_perspective(perspective_id)
            .filter(|cached| cached.covers(levels))
    }

    fn emit(&self, ids: Vec<String>) {
        if !ids.is_empty() {
            // No subscribers is fine.
            let _ = self.events.send(ids);
        }
    }
}

#[async_trait]
impl Client for ClientCachedWithBase {
    fn store(&self) -> Arc<dyn CasStore> {
        self.store.clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<String>> {
        self.events.subscribe()
    }

    #[instrument(level = "trace", skip(self, options), fields(client = %self.name))]
    async fn get_perspective(
        &self,
        perspective_id: &str,
        options: GetPerspectiveOptions,
    ) -> Result<PerspectiveGetResult> {
        self.drain_base_events();

        if self.cache.is_deleted(perspective_id) {
            return Err(EveesError::PerspectiveNotFound(perspective_id.to_string()));
        }
        let levels = options.depth();
        if let Some(hit) = self.cached(perspective_id, levels) {
            return Ok(hit.to_result());
        }

        debug!(levels, "perspective cache miss, asking base");
        let fetched = self.base.get_perspective(perspective_id, options).await?;

        if let Some(slice) = &fetched.slice {
            self.store.cache_entities(slice.entities.clone()).await?;
            for nested in &slice.perspectives {
                if nested.id != perspective_id {
                    self.cache
                        .set_cached_perspective(&nested.id, nested.details.clone(), 0);
                }
            }
        }
        self.cache
            .set_cached_perspective(perspective_id, fetched.details.clone(), levels);

        let details = self
            .cache
            .get_cached_perspective(perspective_id)
            .map_or(fetched.details, |cached| cached.details);
        Ok(PerspectiveGetResult {
            details,
            slice: fetched.slice,
        })
    }

    #[instrument(level = "debug", skip_all, fields(client = %self.name))]
    async fn update(&self, mutation: EveesMutation) -> Result<()> {
        let ids = mutation.perspective_ids();
        let EveesMutation {
            new_perspectives,
            updates,
            deleted_perspectives,
            entities,
        } = mutation;

        if !entities.is_empty() {
            self.store
                .store_entities(entities.into_iter().map(EntityCreate::from).collect())
                .await?;
        }
        for new_perspective in new_perspectives {
            self.store
                .store_entity(new_perspective.perspective.erase()?.into())
                .await?;
            self.cache.new_perspective(new_perspective);
        }
        for update in updates {
            self.cache.update_perspective(update);
        }
        for perspective_id in &deleted_perspectives {
            self.cache.delete_perspective(perspective_id);
        }

        self.emit(ids);
        Ok(())
    }

    async fn diff(&self) -> Result<EveesMutation> {
        let mut mutation = self.cache.diff();
        mutation.entities = self.store.diff();
        Ok(mutation)
    }

    async fn flush(&self) -> Result<()> {
        self.flush_with(FlushOptions::default()).await
    }

    #[instrument(level = "debug", skip_all, fields(client = %self.name, condensate = options.condensate))]
    async fn flush_with(&self, options: FlushOptions) -> Result<()> {
        let _flushing = self.flushing.lock().await;
        let snapshot = self.cache.diff();
        if snapshot.is_empty() && self.store.diff().is_empty() {
            return Ok(());
        }

        let mut mutation = snapshot.clone();
        if options.condensate && mutation.updates.len() > 1 {
            let before = mutation.updates.len();
            mutation.updates =
                condense::condense_updates(self.store.as_ref(), &self.hasher, mutation.updates)
                    .await?;
            debug!(before, after = mutation.updates.len(), "condensed buffered updates");
        }

        self.store.flush().await?;
        let ids = mutation.perspective_ids();
        if !mutation.is_empty() {
            self.base.update(mutation).await?;
        }
        self.base.flush().await?;
        self.cache.clear_flushed(&snapshot);

        debug!(perspectives = ids.len(), "flushed to base");
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        self.cache.clear_cached();
        self.base.refresh().await
    }

    async fn can_update(&self, perspective_id: &str, user_id: Option<&str>) -> Result<bool> {
        if user_id.is_none() {
            if self.cache.is_new(perspective_id) {
                return Ok(true);
            }
            if let Some(can_update) = self
                .cache
                .get_cached_perspective(perspective_id)
                .and_then(|cached| cached.details.can_update)
            {
                return Ok(can_update);
            }
        }
        self.base.can_update(perspective_id, user_id).await
    }

    async fn get_user_perspectives(&self, perspective_id: &str) -> Result<Vec<String>> {
        self.base.get_user_perspectives(perspective_id).await
    }
}
