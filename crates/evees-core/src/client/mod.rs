//! Perspective clients.
//!
//! A [`Client`] resolves perspective ids to their [`PerspectiveDetails`] and
//! accepts [`EveesMutation`]s. Clients stack the same way stores do:
//!
//! - [`cached::ClientCachedWithBase`] buffers mutations in a [`ClientCache`]
//!   and ships them to its base client on flush.
//! - [`router::BaseRouter`] splits a mutation by owning remote and dispatches
//!   one sub-mutation per remote.
//! - Remotes (see [`crate::remote`]) are the bottom of the stack.
//!
//! Every client broadcasts the ids of perspectives it changed; layered
//! clients subscribe to their base and evict stale details.

pub mod cache;
pub mod cached;
pub mod router;

pub use cache::{CachedPerspective, ClientCache, ClientCacheMemory};
pub use cached::ClientCachedWithBase;
pub use router::BaseRouter;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::cas::{self, CasStore};
use crate::error::Result;
use crate::model::{
    Commit, Entity, EveesMutation, GetPerspectiveOptions, NewPerspective, Perspective,
    PerspectiveDetails, PerspectiveGetResult, Update,
};

/// Capacity of every "perspectives updated" channel.
pub const EVENTS_CAPACITY: usize = 256;

/// Options of [`Client::flush_with`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushOptions {
    /// Squash buffered update chains into one commit per head before shipping.
    pub condensate: bool,
}

#[async_trait]
pub trait Client: Send + Sync {
    /// Content store used by this client.
    fn store(&self) -> Arc<dyn CasStore>;

    /// Stream of perspective ids changed through this client.
    fn subscribe(&self) -> broadcast::Receiver<Vec<String>>;

    async fn get_perspective(
        &self,
        perspective_id: &str,
        options: GetPerspectiveOptions,
    ) -> Result<PerspectiveGetResult>;

    /// Apply a mutation. Layered clients buffer it until [`Client::flush`].
    async fn update(&self, mutation: EveesMutation) -> Result<()>;

    async fn new_perspective(&self, new_perspective: NewPerspective) -> Result<()> {
        self.update(EveesMutation {
            new_perspectives: vec![new_perspective],
            ..EveesMutation::default()
        })
        .await
    }

    async fn update_perspective(&self, update: Update) -> Result<()> {
        self.update(EveesMutation {
            updates: vec![update],
            ..EveesMutation::default()
        })
        .await
    }

    async fn delete_perspective(&self, perspective_id: &str) -> Result<()> {
        self.update(EveesMutation {
            deleted_perspectives: vec![perspective_id.to_string()],
            ..EveesMutation::default()
        })
        .await
    }

    /// Everything buffered and not yet flushed.
    async fn diff(&self) -> Result<EveesMutation>;

    async fn flush(&self) -> Result<()>;

    async fn flush_with(&self, options: FlushOptions) -> Result<()> {
        let _ = options;
        self.flush().await
    }

    /// Drop cached details so the next read goes to the base.
    async fn refresh(&self) -> Result<()>;

    /// Whether `user_id` (or the logged-in user) may update the perspective.
    async fn can_update(&self, perspective_id: &str, user_id: Option<&str>) -> Result<bool>;

    /// Perspectives of the same context owned by the logged-in user.
    async fn get_user_perspectives(&self, perspective_id: &str) -> Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// Helpers shared by the facade, merge and condensation
// ---------------------------------------------------------------------------

/// Current head of a perspective, if any.
pub async fn head_of(client: &dyn Client, perspective_id: &str) -> Result<Option<String>> {
    Ok(client
        .get_perspective(perspective_id, GetPerspectiveOptions::default())
        .await?
        .details
        .head_id)
}

pub async fn load_perspective(
    client: &dyn Client,
    perspective_id: &str,
) -> Result<Entity<Perspective>> {
    cas::load(client.store().as_ref(), perspective_id).await
}

pub async fn load_commit(client: &dyn Client, commit_id: &str) -> Result<Entity<Commit>> {
    cas::load(client.store().as_ref(), commit_id).await
}

/// Details for a perspective, with its head commit decoded when present.
pub async fn resolve_head(
    client: &dyn Client,
    perspective_id: &str,
) -> Result<(PerspectiveDetails, Option<Entity<Commit>>)> {
    let details = client
        .get_perspective(perspective_id, GetPerspectiveOptions::default())
        .await?
        .details;
    let head = match &details.head_id {
        Some(head_id) => Some(load_commit(client, head_id).await?),
        None => None,
    };
    Ok((details, head))
}
