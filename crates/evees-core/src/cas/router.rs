//! Best-effort reads across several named stores.
//!
//! Every source is queried concurrently on its own task. The read resolves as
//! soon as the union of answers covers every requested hash, or once every
//! source has answered, failed or timed out. Sources still running at that
//! point are left alone; whatever they send later is dropped with the channel.
//!
//! A failing source is treated as "had nothing". Partial results are not an
//! error here, unlike [`super::CasCachedWithBase`]; callers that need to know
//! why something is missing look at [`RoutedEntities::outcomes`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use super::{CasStore, in_request_order, verify_all};
use crate::error::{EveesError, Result};
use crate::hash::Hasher;
use crate::model::{Entity, EntityCreate};

/// Default per-source timeout.
pub const DEFAULT_SOURCE_TIMEOUT: Duration = Duration::from_secs(10);

/// What one source contributed to a routed read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceOutcome {
    /// Answered with this many verified entities that were asked for.
    Found(usize),
    /// Answered with nothing useful.
    Empty,
    /// Returned an error.
    Failed(String),
    /// Did not answer within the timeout.
    TimedOut,
    /// Still running when the read resolved.
    Pending,
}

/// Result of [`CasRouter::fetch`].
#[derive(Debug, Clone, Default)]
pub struct RoutedEntities {
    /// Found entities, in request order.
    pub entities: Vec<Entity>,
    /// Per-source outcome, keyed by source name.
    pub outcomes: BTreeMap<String, SourceOutcome>,
}

impl RoutedEntities {
    /// Requested hashes nobody returned.
    #[must_use]
    pub fn missing<'a>(&self, requested: &'a [String]) -> Vec<&'a str> {
        let found: HashSet<&str> = self.entities.iter().map(|e| e.id.as_str()).collect();
        requested
            .iter()
            .map(String::as_str)
            .filter(|h| !found.contains(h))
            .collect()
    }
}

type SourceReply = (String, std::result::Result<Result<Vec<Entity>>, tokio::time::error::Elapsed>);

/// Fan-out reader over named [`CasStore`]s.
///
/// Writes go to the first registered source, which acts as the default
/// store; `flush` reaches every source.
pub struct CasRouter {
    sources: Vec<(String, Arc<dyn CasStore>)>,
    timeout: Duration,
    hasher: Hasher,
}

impl std::fmt::Debug for CasRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CasRouter")
            .field(
                "sources",
                &self.sources.iter().map(|(n, _)| n).collect::<Vec<_>>(),
            )
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl CasRouter {
    #[must_use]
    pub fn new(hasher: Hasher) -> Self {
        Self {
            sources: Vec::new(),
            timeout: DEFAULT_SOURCE_TIMEOUT,
            hasher,
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Register a source. The first one registered receives writes.
    #[must_use]
    pub fn with_source(mut self, name: impl Into<String>, store: Arc<dyn CasStore>) -> Self {
        self.sources.push((name.into(), store));
        self
    }

    #[must_use]
    pub fn source_names(&self) -> Vec<&str> {
        self.sources.iter().map(|(n, _)| n.as_str()).collect()
    }

    fn default_source(&self) -> Result<&Arc<dyn CasStore>> {
        self.sources
            .first()
            .map(|(_, s)| s)
            .ok_or_else(|| EveesError::remote("router", "no sources registered"))
    }

    /// Query every source and collect what they return.
    #[instrument(level = "debug", skip_all, fields(requested = hashes.len(), sources = self.sources.len()))]
    pub async fn fetch(&self, hashes: &[String]) -> RoutedEntities {
        let mut outcomes: BTreeMap<String, SourceOutcome> = self
            .sources
            .iter()
            .map(|(name, _)| (name.clone(), SourceOutcome::Pending))
            .collect();
        if hashes.is_empty() {
            return RoutedEntities {
                entities: Vec::new(),
                outcomes,
            };
        }

        let wanted: HashSet<&str> = hashes.iter().map(String::as_str).collect();
        let (tx, mut rx) = mpsc::unbounded_channel::<SourceReply>();
        for (name, store) in &self.sources {
            let tx = tx.clone();
            let name = name.clone();
            let store = Arc::clone(store);
            let request = hashes.to_vec();
            let timeout = self.timeout;
            // Not cancelled on early resolution; a late send just fails.
            tokio::spawn(async move {
                let reply = tokio::time::timeout(timeout, store.get_entities(&request)).await;
                let _ = tx.send((name, reply));
            });
        }
        drop(tx);

        let mut found: HashMap<String, Entity> = HashMap::new();
        while found.len() < wanted.len() {
            let Some((name, reply)) = rx.recv().await else {
                break;
            };
            let outcome = match reply {
                Err(_) => {
                    warn!(source = %name, "source timed out");
                    SourceOutcome::TimedOut
                }
                Ok(Err(err)) => {
                    warn!(source = %name, error = %err, "source failed, treating as empty");
                    SourceOutcome::Failed(err.to_string())
                }
                Ok(Ok(entities)) => {
                    let mut useful = 0;
                    for entity in entities {
                        if !wanted.contains(entity.id.as_str()) {
                            continue;
                        }
                        if self.hasher.hash_value(&entity.object) != entity.id {
                            warn!(source = %name, id = %entity.id, "dropping entity with wrong hash");
                            continue;
                        }
                        useful += 1;
                        found.entry(entity.id.clone()).or_insert(entity);
                    }
                    if useful == 0 {
                        SourceOutcome::Empty
                    } else {
                        SourceOutcome::Found(useful)
                    }
                }
            };
            outcomes.insert(name, outcome);
        }

        debug!(
            found = found.len(),
            missing = wanted.len() - found.len(),
            "routed read resolved"
        );
        RoutedEntities {
            entities: in_request_order(hashes, found.into_values().collect()),
            outcomes,
        }
    }
}

#[async_trait]
impl CasStore for CasRouter {
    async fn cache_entities(&self, entities: Vec<Entity>) -> Result<()> {
        self.default_source()?.cache_entities(entities).await
    }

    async fn store_entities(&self, objects: Vec<EntityCreate>) -> Result<Vec<Entity>> {
        self.default_source()?.store_entities(objects).await
    }

    async fn hash_entities(&self, objects: Vec<Value>) -> Result<Vec<Entity>> {
        verify_all(
            &self.hasher,
            objects.into_iter().map(EntityCreate::from).collect(),
        )
    }

    async fn get_entities(&self, hashes: &[String]) -> Result<Vec<Entity>> {
        Ok(self.fetch(hashes).await.entities)
    }

    async fn flush(&self) -> Result<()> {
        let results =
            futures::future::join_all(self.sources.iter().map(|(_, store)| store.flush())).await;
        results.into_iter().collect::<Result<Vec<()>>>()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cas::CasCachedWithBase;
    use serde_json::json;

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    struct Failing;

    #[async_trait]
    impl CasStore for Failing {
        async fn cache_entities(&self, _: Vec<Entity>) -> Result<()> {
            Ok(())
        }
        async fn store_entities(&self, _: Vec<EntityCreate>) -> Result<Vec<Entity>> {
            Err(EveesError::remote("failing", "down"))
        }
        async fn hash_entities(&self, _: Vec<Value>) -> Result<Vec<Entity>> {
            Ok(Vec::new())
        }
        async fn get_entities(&self, _: &[String]) -> Result<Vec<Entity>> {
            Err(EveesError::remote("failing", "down"))
        }
        async fn flush(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Never answers a read.
    struct Silent;

    #[async_trait]
    impl CasStore for Silent {
        async fn cache_entities(&self, _: Vec<Entity>) -> Result<()> {
            Ok(())
        }
        async fn store_entities(&self, _: Vec<EntityCreate>) -> Result<Vec<Entity>> {
            Ok(Vec::new())
        }
        async fn hash_entities(&self, _: Vec<Value>) -> Result<Vec<Entity>> {
            Ok(Vec::new())
        }
        async fn get_entities(&self, _: &[String]) -> Result<Vec<Entity>> {
            std::future::pending().await
        }
        async fn flush(&self) -> Result<()> {
            Ok(())
        }
    }

    async fn store_with(values: &[Value]) -> (Arc<dyn CasStore>, Vec<String>) {
        let store = CasCachedWithBase::standalone(Hasher::default());
        let stored = store
            .store_entities(values.iter().cloned().map(EntityCreate::from).collect())
            .await
            .expect("store");
        (Arc::new(store), stored.into_iter().map(|e| e.id).collect())
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn resolves_once_union_covers_request() {
        let (r1, mut ids) = store_with(&[json!("one"), json!("two")]).await;
        let (r2, ids2) = store_with(&[json!("three")]).await;
        ids.extend(ids2);

        let router = CasRouter::new(Hasher::default())
            .with_timeout(Duration::from_secs(3600))
            .with_source("r1", r1)
            .with_source("r2", r2)
            .with_source("r3", Arc::new(Silent));

        let routed = router.fetch(&ids).await;

        assert_eq!(
            routed.entities.iter().map(|e| e.id.clone()).collect::<Vec<_>>(),
            ids
        );
        assert_eq!(routed.outcomes["r1"], SourceOutcome::Found(2));
        assert_eq!(routed.outcomes["r2"], SourceOutcome::Found(1));
        assert_eq!(routed.outcomes["r3"], SourceOutcome::Pending);
    }

    #[tokio::test]
    async fn failing_source_counts_as_absent() {
        let (r1, ids) = store_with(&[json!("one")]).await;
        let mut request = ids.clone();
        request.push("bmissing".into());

        let router = CasRouter::new(Hasher::default())
            .with_source("ok", r1)
            .with_source("down", Arc::new(Failing));

        let entities = router.get_entities(&request).await.expect("partial is ok");
        assert_eq!(entities.len(), 1);

        let routed = router.fetch(&request).await;
        assert!(matches!(routed.outcomes["down"], SourceOutcome::Failed(_)));
        assert_eq!(routed.missing(&request), vec!["bmissing"]);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_source_times_out() {
        let router = CasRouter::new(Hasher::default())
            .with_timeout(Duration::from_millis(50))
            .with_source("silent", Arc::new(Silent));

        let routed = router.fetch(&["bx".to_string()]).await;
        assert!(routed.entities.is_empty());
        assert_eq!(routed.outcomes["silent"], SourceOutcome::TimedOut);
    }

    #[tokio::test]
    async fn writes_go_to_first_source() {
        let (first, _) = store_with(&[]).await;
        let router = CasRouter::new(Hasher::default())
            .with_source("first", Arc::clone(&first))
            .with_source("down", Arc::new(Failing));

        let stored = router
            .store_entity(json!({"k": 1}).into())
            .await
            .expect("store");
        assert!(first.try_get_entity(&stored.id).await.expect("get").is_some());
    }
}
