//! Routing of perspective operations to the remote that owns them.
//!
//! Ownership is read from the `remote` field of the [`Perspective`] entity.
//! While splitting a mutation, perspectives created by that same mutation are
//! not yet stored anywhere, so lookups go through an overlay of the
//! mutation's inline entities first.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

use super::{Client, EVENTS_CAPACITY, FlushOptions};
use crate::cas::{CasRouter, CasStore};
use crate::error::{EveesError, Result};
use crate::hash::Hasher;
use crate::model::{
    Entity, EveesMutation, GetPerspectiveOptions, Perspective, PerspectiveGetResult,
};
use crate::remote::RemoteEvees;

/// A [`Client`] dispatching to registered remotes by ownership.
pub struct BaseRouter {
    remotes: BTreeMap<String, Arc<dyn RemoteEvees>>,
    store: Arc<CasRouter>,
    events: broadcast::Sender<Vec<String>>,
}

impl std::fmt::Debug for BaseRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseRouter")
            .field("remotes", &self.remotes.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl BaseRouter {
    /// Route over `remotes`. The first remote is the default content store.
    ///
    /// When called inside a tokio runtime, each remote's notifications are
    /// forwarded to this router's subscribers.
    #[must_use]
    pub fn new(remotes: Vec<Arc<dyn RemoteEvees>>, hasher: Hasher, timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(EVENTS_CAPACITY);

        let mut store = CasRouter::new(hasher).with_timeout(timeout);
        for remote in &remotes {
            store = store.with_source(remote.id(), remote.store());
        }

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            for remote in &remotes {
                let mut receiver = remote.subscribe();
                let sender = events.clone();
                handle.spawn(async move {
                    loop {
                        match receiver.recv().await {
                            Ok(ids) => {
                                let _ = sender.send(ids);
                            }
                            Err(RecvError::Lagged(_)) => {}
                            Err(RecvError::Closed) => break,
                        }
                    }
                });
            }
        }

        let remotes = remotes
            .into_iter()
            .map(|remote| (remote.id().to_string(), remote))
            .collect();
        Self {
            remotes,
            store: Arc::new(store),
            events,
        }
    }

    #[must_use]
    pub fn remote(&self, id: &str) -> Option<&Arc<dyn RemoteEvees>> {
        self.remotes.get(id)
    }

    /// Id of the remote authoritative for `perspective_id`.
    pub async fn remote_of(
        &self,
        perspective_id: &str,
        overlay: &HashMap<String, Entity>,
    ) -> Result<String> {
        let entity = match overlay.get(perspective_id) {
            Some(entity) => entity.clone(),
            None => self.store.get_entity(perspective_id).await?,
        };
        let perspective: Entity<Perspective> = entity.decode()?;
        self.registered(perspective_id, perspective.object.remote)
    }

    fn registered(&self, perspective_id: &str, remote: String) -> Result<String> {
        if self.remotes.contains_key(&remote) {
            Ok(remote)
        } else {
            Err(EveesError::UnresolvableRemote {
                perspective_id: perspective_id.to_string(),
                remote,
            })
        }
    }

    async fn owner(&self, perspective_id: &str) -> Result<&Arc<dyn RemoteEvees>> {
        let remote = self.remote_of(perspective_id, &HashMap::new()).await?;
        self.remotes
            .get(&remote)
            .ok_or_else(|| EveesError::UnresolvableRemote {
                perspective_id: perspective_id.to_string(),
                remote,
            })
    }

    /// Partition a mutation by owning remote.
    ///
    /// Every sub-mutation carries all of the mutation's inline entities.
    pub async fn split_mutation(
        &self,
        mutation: EveesMutation,
    ) -> Result<BTreeMap<String, EveesMutation>> {
        let mut overlay: HashMap<String, Entity> = mutation
            .entities
            .iter()
            .map(|e| (e.id.clone(), e.clone()))
            .collect();
        for new_perspective in &mutation.new_perspectives {
            overlay.insert(
                new_perspective.perspective.id.clone(),
                new_perspective.perspective.erase()?,
            );
        }

        let mut split: BTreeMap<String, EveesMutation> = BTreeMap::new();
        let entities = &mutation.entities;

        for new_perspective in &mutation.new_perspectives {
            let remote = self.registered(
                &new_perspective.perspective.id,
                new_perspective.perspective.object.remote.clone(),
            )?;
            slot(&mut split, remote, entities)
                .new_perspectives
                .push(new_perspective.clone());
        }
        for update in &mutation.updates {
            let remote = self.remote_of(&update.perspective_id, &overlay).await?;
            slot(&mut split, remote, entities).updates.push(update.clone());
        }
        for perspective_id in &mutation.deleted_perspectives {
            let remote = self.remote_of(perspective_id, &overlay).await?;
            slot(&mut split, remote, entities)
                .deleted_perspectives
                .push(perspective_id.clone());
        }
        Ok(split)
    }
}

fn slot<'a>(
    split: &'a mut BTreeMap<String, EveesMutation>,
    remote: String,
    entities: &[Entity],
) -> &'a mut EveesMutation {
    split.entry(remote).or_insert_with(|| EveesMutation {
        entities: entities.to_vec(),
        ..EveesMutation::default()
    })
}

#[async_trait]
impl Client for BaseRouter {
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
        self.owner(perspective_id)
            .await?
            .get_perspective(perspective_id, options)
            .await
    }

    async fn update(&self, mutation: EveesMutation) -> Result<()> {
        let split = self.split_mutation(mutation).await?;
        debug!(remotes = split.len(), "dispatching mutation");

        let dispatches = split.into_iter().filter_map(|(remote_id, sub)| {
            let remote = self.remotes.get(&remote_id)?;
            Some(async move { (remote_id, remote.update(sub).await) })
        });
        let mut first_error = None;
        for (remote_id, result) in join_all(dispatches).await {
            if let Err(err) = result {
                warn!(remote = %remote_id, error = %err, "remote rejected sub-mutation");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn diff(&self) -> Result<EveesMutation> {
        let mut mutation = EveesMutation::default();
        for remote in self.remotes.values() {
            mutation.extend(remote.diff().await?);
        }
        Ok(mutation)
    }

    async fn flush(&self) -> Result<()> {
        self.flush_with(FlushOptions::default()).await
    }

    async fn flush_with(&self, options: FlushOptions) -> Result<()> {
        let results = join_all(self.remotes.values().map(|r| r.flush_with(options))).await;
        results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }

    async fn refresh(&self) -> Result<()> {
        for remote in self.remotes.values() {
            remote.refresh().await?;
        }
        Ok(())
    }

    async fn can_update(&self, perspective_id: &str, user_id: Option<&str>) -> Result<bool> {
        self.owner(perspective_id)
            .await?
            .can_update(perspective_id, user_id)
            .await
    }

    async fn get_user_perspectives(&self, perspective_id: &str) -> Result<Vec<String>> {
        self.owner(perspective_id)
            .await?
            .get_user_perspectives(perspective_id)
            .await
    }
}
