//! A [`CasCache`] layered over an optional base store.
//!
//! Reads go to the cache first and fall through to the base in one batched
//! request. Writes land in the cache's "new" partition and reach the base only
//! on [`CasStore::flush`], which is the single point where local writes become
//! durable.
//!
//! The base is authoritative: if it returns fewer entities than asked for,
//! the whole read fails with [`EveesError::ShortRead`].

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, instrument};

use super::{CasCache, CasCacheMemory, CasStore, in_request_order, verify_all};
use crate::error::{EveesError, Result};
use crate::hash::Hasher;
use crate::model::{Entity, EntityCreate};

/// Read-through, write-buffered store.
pub struct CasCachedWithBase {
    cache: Arc<dyn CasCache>,
    base: Option<Arc<dyn CasStore>>,
    hasher: Hasher,
}

impl std::fmt::Debug for CasCachedWithBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CasCachedWithBase")
            .field("has_base", &self.base.is_some())
            .field("hasher", &self.hasher)
            .finish_non_exhaustive()
    }
}

impl CasCachedWithBase {
    pub fn new(cache: Arc<dyn CasCache>, base: Option<Arc<dyn CasStore>>, hasher: Hasher) -> Self {
        Self {
            cache,
            base,
            hasher,
        }
    }

    /// In-memory cache over `base`.
    pub fn over(base: Arc<dyn CasStore>, hasher: Hasher) -> Self {
        Self::new(Arc::new(CasCacheMemory::new()), Some(base), hasher)
    }

    /// In-memory store with no base; flushing only promotes entities.
    #[must_use]
    pub fn standalone(hasher: Hasher) -> Self {
        Self::new(Arc::new(CasCacheMemory::new()), None, hasher)
    }

    /// Entities written locally and not yet flushed.
    #[must_use]
    pub fn diff(&self) -> Vec<Entity> {
        self.cache.diff()
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<dyn CasCache> {
        &self.cache
    }

    #[must_use]
    pub const fn hasher(&self) -> &Hasher {
        &self.hasher
    }

    fn lookup(&self, hash: &str) -> Option<Entity> {
        self.cache
            .get_new_entity(hash)
            .or_else(|| self.cache.get_cached_entity(hash))
    }
}

#[async_trait]
impl CasStore for CasCachedWithBase {
    async fn cache_entities(&self, entities: Vec<Entity>) -> Result<()> {
        let verified = verify_all(
            &self.hasher,
            entities.into_iter().map(EntityCreate::from).collect(),
        )?;
        for entity in verified {
            self.cache.cache_entity(entity);
        }
        Ok(())
    }

    async fn store_entities(&self, objects: Vec<EntityCreate>) -> Result<Vec<Entity>> {
        let entities = verify_all(&self.hasher, objects)?;
        for entity in &entities {
            self.cache.put_entity(entity.clone());
        }
        Ok(entities)
    }

    async fn hash_entities(&self, objects: Vec<Value>) -> Result<Vec<Entity>> {
        verify_all(
            &self.hasher,
            objects.into_iter().map(EntityCreate::from).collect(),
        )
    }

    #[instrument(level = "trace", skip_all, fields(requested = hashes.len()))]
    async fn get_entities(&self, hashes: &[String]) -> Result<Vec<Entity>> {
        let mut found = Vec::with_capacity(hashes.len());
        let mut missing: Vec<String> = Vec::new();
        for hash in hashes {
            // Lookups return owned clones; callers cannot alias cached state.
            match self.lookup(hash) {
                Some(entity) => found.push(entity),
                None if !missing.contains(hash) => missing.push(hash.clone()),
                None => {}
            }
        }

        if missing.is_empty() {
            return Ok(found);
        }

        let Some(base) = &self.base else {
            debug!(missing = missing.len(), "cache miss with no base");
            return Ok(found);
        };

        debug!(hits = found.len(), misses = missing.len(), "fetching misses from base");
        let fetched = base.get_entities(&missing).await?;
        let fetched = in_request_order(&missing, fetched);
        if fetched.len() < missing.len() {
            return Err(EveesError::ShortRead {
                requested: missing.len(),
                received: fetched.len(),
            });
        }

        for entity in &fetched {
            self.cache.cache_entity(entity.clone());
        }
        found.extend(fetched);
        Ok(in_request_order(hashes, found))
    }

    #[instrument(level = "debug", skip_all)]
    async fn flush(&self) -> Result<()> {
        let pending = self.cache.diff();
        if pending.is_empty() {
            return Ok(());
        }

        if let Some(base) = &self.base {
            base.store_entities(pending.iter().cloned().map(EntityCreate::from).collect())
                .await?;
        }

        // Promote only after the base accepted the whole batch, and only what
        // was shipped: writes made while awaiting the base stay pending.
        let ids: Vec<String> = pending.into_iter().map(|e| e.id).collect();
        self.cache.promote(&ids);
        debug!(count = ids.len(), "flushed entities");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    // -----------------------------------------------------------------------
    // Test base that records calls and can be told to drop results
    // -----------------------------------------------------------------------

    #[derive(Default)]
    struct RecordingBase {
        inner: CasCacheMemory,
        get_calls: Mutex<Vec<Vec<String>>>,
        store_calls: Mutex<usize>,
        drop_results: bool,
        store_delay: Option<std::time::Duration>,
    }

    #[async_trait]
    impl CasStore for RecordingBase {
        async fn cache_entities(&self, _entities: Vec<Entity>) -> Result<()> {
            Ok(())
        }

        async fn store_entities(&self, objects: Vec<EntityCreate>) -> Result<Vec<Entity>> {
            *self.store_calls.lock() += 1;
            if let Some(delay) = self.store_delay {
                tokio::time::sleep(delay).await;
            }
            let entities = verify_all(&Hasher::default(), objects)?;
            for entity in &entities {
                self.inner.cache_entity(entity.clone());
            }
            Ok(entities)
        }

        async fn hash_entities(&self, objects: Vec<Value>) -> Result<Vec<Entity>> {
            verify_all(
                &Hasher::default(),
                objects.into_iter().map(EntityCreate::from).collect(),
            )
        }

        async fn get_entities(&self, hashes: &[String]) -> Result<Vec<Entity>> {
            self.get_calls.lock().push(hashes.to_vec());
            let mut out: Vec<Entity> = hashes
                .iter()
                .filter_map(|h| self.inner.get_cached_entity(h))
                .collect();
            if self.drop_results {
                out.pop();
            }
            Ok(out)
        }

        async fn flush(&self) -> Result<()> {
            Ok(())
        }
    }

    fn seeded_base(values: &[Value], drop_results: bool) -> (Arc<RecordingBase>, Vec<String>) {
        let hasher = Hasher::default();
        let base = RecordingBase {
            drop_results,
            ..RecordingBase::default()
        };
        let ids = values
            .iter()
            .map(|v| {
                let entity = hasher.entity(v).expect("hash");
                base.inner.cache_entity(entity.clone());
                entity.id
            })
            .collect();
        (Arc::new(base), ids)
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn round_trip_before_flush() {
        let store = CasCachedWithBase::standalone(Hasher::default());
        let stored = store
            .store_entity(json!({"text": "hello"}).into())
            .await
            .expect("store");
        let fetched = store.get_entity(&stored.id).await.expect("get");
        assert_eq!(fetched.object, json!({"text": "hello"}));
    }

    #[tokio::test]
    async fn asserted_id_mismatch_is_rejected() {
        let store = CasCachedWithBase::standalone(Hasher::default());
        let err = store
            .store_entity(EntityCreate {
                object: json!({"text": "hello"}),
                id: Some("bogus".into()),
            })
            .await
            .expect_err("mismatch");
        assert!(matches!(err, EveesError::HashMismatch { .. }));
        assert!(store.diff().is_empty());
    }

    #[tokio::test]
    async fn misses_are_fetched_in_one_batch_and_cached() {
        let (base, ids) = seeded_base(&[json!(1), json!(2), json!(3)], false);
        let store = CasCachedWithBase::over(base.clone(), Hasher::default());
        let local = store.store_entity(json!(4).into()).await.expect("store");

        let mut request = ids.clone();
        request.push(local.id.clone());
        let got = store.get_entities(&request).await.expect("get");

        assert_eq!(got.len(), 4);
        assert_eq!(
            got.iter().map(|e| e.id.clone()).collect::<Vec<_>>(),
            request
        );
        assert_eq!(base.get_calls.lock().len(), 1);
        assert_eq!(base.get_calls.lock()[0], ids);

        // Second read is served from the cache.
        store.get_entities(&ids).await.expect("get again");
        assert_eq!(base.get_calls.lock().len(), 1);
    }

    #[tokio::test]
    async fn short_read_from_base_fails_the_call() {
        let (base, ids) = seeded_base(&[json!(1), json!(2)], true);
        let store = CasCachedWithBase::over(base, Hasher::default());

        let err = store.get_entities(&ids).await.expect_err("short read");
        assert!(matches!(
            err,
            EveesError::ShortRead {
                requested: 2,
                received: 1
            }
        ));
    }

    #[tokio::test]
    async fn flush_persists_then_promotes() {
        let (base, _) = seeded_base(&[], false);
        let store = CasCachedWithBase::over(base.clone(), Hasher::default());
        let a = store.store_entity(json!("a").into()).await.expect("a");
        store.store_entity(json!("b").into()).await.expect("b");

        store.flush().await.expect("flush");

        assert!(store.diff().is_empty());
        assert_eq!(*base.store_calls.lock(), 1);
        assert!(store.cache().get_cached_entity(&a.id).is_some());
        assert!(base.inner.get_cached_entity(&a.id).is_some());

        // Nothing pending: no further base call.
        store.flush().await.expect("flush again");
        assert_eq!(*base.store_calls.lock(), 1);
    }

    #[tokio::test]
    async fn writes_during_flush_stay_pending() {
        let base = Arc::new(RecordingBase {
            store_delay: Some(std::time::Duration::from_millis(50)),
            ..RecordingBase::default()
        });
        let store = CasCachedWithBase::over(base.clone(), Hasher::default());
        let early = store.store_entity(json!("early").into()).await.expect("early");

        let (flushed, late) = tokio::join!(store.flush(), async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            store.store_entity(json!("late").into()).await
        });
        flushed.expect("flush");
        let late = late.expect("late");

        assert!(base.inner.get_cached_entity(&early.id).is_some());
        assert!(base.inner.get_cached_entity(&late.id).is_none());
        assert_eq!(
            store.diff().into_iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![late.id.clone()]
        );

        store.flush().await.expect("second flush");
        assert!(base.inner.get_cached_entity(&late.id).is_some());
        assert!(store.diff().is_empty());
    }

    #[tokio::test]
    async fn repeated_ids_come_back_per_occurrence() {
        let (base, ids) = seeded_base(&[json!(1)], false);
        let store = CasCachedWithBase::over(base.clone(), Hasher::default());
        let local = store.store_entity(json!(2).into()).await.expect("store");

        let request = vec![ids[0].clone(), local.id.clone(), ids[0].clone(), local.id];
        let got = store.get_entities(&request).await.expect("get");

        assert_eq!(
            got.iter().map(|e| e.id.clone()).collect::<Vec<_>>(),
            request
        );
        assert_eq!(base.get_calls.lock()[0], vec![ids[0].clone()]);
    }
}
