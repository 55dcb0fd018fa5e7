//! Content-addressable storage.
//!
//! # Sub-modules
//!
//! - [`cache`]: the two-partition local cache ([`CasCache`], [`CasCacheMemory`]).
//! - [`cached`]: a cache layered over an optional base store
//!   ([`CasCachedWithBase`]); read-through, write-buffered, fail-fast on short
//!   reads.
//! - [`router`]: best-effort fan-out reads across named stores ([`CasRouter`]).
//!
//! # Contract
//!
//! Ids are never trusted: every store that accepts an object recomputes its id
//! and rejects a mismatch with [`EveesError::HashMismatch`].

pub mod cache;
pub mod cached;
pub mod router;

pub use cache::{CasCache, CasCacheMemory};
pub use cached::CasCachedWithBase;
pub use router::{CasRouter, RoutedEntities, SourceOutcome};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{EveesError, Result};
use crate::hash::Hasher;
use crate::model::{Entity, EntityCreate};

/// The store contract shared by caches, remotes and routers.
#[async_trait]
pub trait CasStore: Send + Sync {
    /// Record entities known to exist durably elsewhere.
    async fn cache_entities(&self, entities: Vec<Entity>) -> Result<()>;

    /// Hash and store objects. Returned entities are in input order.
    async fn store_entities(&self, objects: Vec<EntityCreate>) -> Result<Vec<Entity>>;

    /// Compute ids without storing anything.
    async fn hash_entities(&self, objects: Vec<Value>) -> Result<Vec<Entity>>;

    /// Fetch entities by id. Stores may return fewer entities than asked for;
    /// it is up to the layer above to decide whether that is an error.
    ///
    /// Layered stores answer in request order with one entity per requested
    /// occurrence, so a repeated id comes back repeated.
    async fn get_entities(&self, hashes: &[String]) -> Result<Vec<Entity>>;

    /// Make buffered writes durable.
    async fn flush(&self) -> Result<()>;

    async fn store_entity(&self, object: EntityCreate) -> Result<Entity> {
        let mut stored = self.store_entities(vec![object]).await?;
        stored
            .pop()
            .ok_or_else(|| EveesError::remote("store", "store_entities returned nothing"))
    }

    async fn hash_entity(&self, object: Value) -> Result<Entity> {
        let mut hashed = self.hash_entities(vec![object]).await?;
        hashed
            .pop()
            .ok_or_else(|| EveesError::remote("store", "hash_entities returned nothing"))
    }

    /// Fetch one entity; absence is [`EveesError::EntityNotFound`].
    async fn get_entity(&self, hash: &str) -> Result<Entity> {
        self.try_get_entity(hash)
            .await?
            .ok_or_else(|| EveesError::EntityNotFound(hash.to_string()))
    }

    async fn try_get_entity(&self, hash: &str) -> Result<Option<Entity>> {
        let entities = self.get_entities(&[hash.to_string()]).await?;
        Ok(entities.into_iter().find(|e| e.id == hash))
    }
}

/// Fetch and decode one entity.
///
/// # Errors
///
/// [`EveesError::EntityNotFound`] if absent, [`EveesError::MalformedEntity`]
/// if it does not decode as `T`.
pub async fn load<T: DeserializeOwned>(store: &dyn CasStore, hash: &str) -> Result<Entity<T>> {
    store.get_entity(hash).await?.decode()
}

/// Serialize and store one object.
///
/// # Errors
///
/// Propagates serialization and store failures.
pub async fn put<T: Serialize + Sync>(store: &dyn CasStore, object: &T) -> Result<Entity> {
    let value = serde_json::to_value(object)?;
    store.store_entity(value.into()).await
}

/// Verify (or compute) the id of each object.
///
/// # Errors
///
/// Returns [`EveesError::HashMismatch`] for the first object whose asserted id
/// differs from its computed one.
pub fn verify_all(hasher: &Hasher, objects: Vec<EntityCreate>) -> Result<Vec<Entity>> {
    objects
        .into_iter()
        .map(|create| {
            let computed = hasher.hash_value(&create.object);
            match create.id {
                Some(asserted) if asserted != computed => {
                    return Err(EveesError::HashMismatch { asserted, computed });
                }
                _ => {}
            }
            Ok(Entity {
                id: computed,
                object: create.object,
            })
        })
        .collect()
}

/// Order `found` by `requested`: one entry per requested occurrence, ids
/// that were not requested dropped.
pub(crate) fn in_request_order(requested: &[String], found: Vec<Entity>) -> Vec<Entity> {
    let by_id: std::collections::HashMap<String, Entity> =
        found.into_iter().map(|e| (e.id.clone(), e)).collect();
    requested.iter().filter_map(|h| by_id.get(h).cloned()).collect()
}
