//! Two-partition entity cache.
//!
//! - **cached**: entities known to be durable in the base. Read-through
//!   mirror; safe to drop at any time.
//! - **new**: entities written locally and not yet flushed. Dropping one loses
//!   data, so eviction never touches this partition.
//!
//! The cache is single-writer: every operation takes the internal lock for its
//! whole duration and never across an `.await`.

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::Mutex;
use serde_json::Value;

use crate::model::Entity;

/// Local entity cache used by [`super::CasCachedWithBase`].
pub trait CasCache: Send + Sync {
    /// Look up an entity in the "cached" partition.
    fn get_cached_entity(&self, hash: &str) -> Option<Entity>;

    /// Look up an entity in the "new" partition.
    fn get_new_entity(&self, hash: &str) -> Option<Entity>;

    /// Record an entity as durable in the base.
    fn cache_entity(&self, entity: Entity);

    /// Buffer a locally created entity.
    fn put_entity(&self, entity: Entity);

    /// Everything in the "new" partition, ordered by id.
    fn diff(&self) -> Vec<Entity>;

    /// Empty the "new" partition.
    fn clear(&self);

    /// Move exactly `ids` from "new" to "cached". Ids not pending are skipped;
    /// anything buffered after the caller took its snapshot stays in "new".
    fn promote(&self, ids: &[String]);

    /// Drop "cached" entities not reachable from `roots`. Returns how many
    /// were dropped.
    fn evict_unreachable(&self, roots: &[String]) -> usize;
}

// ---------------------------------------------------------------------------
// CasCacheMemory
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct Partitions {
    cached: HashMap<String, Entity>,
    new: BTreeMap<String, Entity>,
}

/// In-memory [`CasCache`].
#[derive(Debug, Default)]
pub struct CasCacheMemory {
    partitions: Mutex<Partitions>,
}

impl CasCacheMemory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entities in the "cached" partition.
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.partitions.lock().cached.len()
    }
}

impl CasCache for CasCacheMemory {
    fn get_cached_entity(&self, hash: &str) -> Option<Entity> {
        self.partitions.lock().cached.get(hash).cloned()
    }

    fn get_new_entity(&self, hash: &str) -> Option<Entity> {
        self.partitions.lock().new.get(hash).cloned()
    }

    fn cache_entity(&self, entity: Entity) {
        self.partitions
            .lock()
            .cached
            .insert(entity.id.clone(), entity);
    }

    fn put_entity(&self, entity: Entity) {
        self.partitions.lock().new.insert(entity.id.clone(), entity);
    }

    fn diff(&self) -> Vec<Entity> {
        self.partitions.lock().new.values().cloned().collect()
    }

    fn clear(&self) {
        self.partitions.lock().new.clear();
    }

    fn promote(&self, ids: &[String]) {
        let mut partitions = self.partitions.lock();
        for id in ids {
            if let Some(entity) = partitions.new.remove(id) {
                partitions.cached.insert(entity.id.clone(), entity);
            }
        }
    }

    fn evict_unreachable(&self, roots: &[String]) -> usize {
        let mut partitions = self.partitions.lock();

        let mut reachable: HashSet<String> = HashSet::new();
        let mut stack: Vec<String> = roots.to_vec();
        while let Some(id) = stack.pop() {
            if !reachable.insert(id.clone()) {
                continue;
            }
            let object = partitions
                .cached
                .get(&id)
                .or_else(|| partitions.new.get(&id))
                .map(|e| &e.object);
            if let Some(object) = object {
                collect_references(object, &mut |candidate| {
                    if partitions.cached.contains_key(candidate)
                        || partitions.new.contains_key(candidate)
                    {
                        stack.push(candidate.to_string());
                    }
                });
            }
        }

        let before = partitions.cached.len();
        partitions.cached.retain(|id, _| reachable.contains(id));
        let evicted = before - partitions.cached.len();
        if evicted > 0 {
            tracing::debug!(evicted, kept = partitions.cached.len(), "evicted unreachable entities");
        }
        evicted
    }
}

/// Visit every string leaf of `value`; those naming another entity are edges.
fn collect_references(value: &Value, visit: &mut impl FnMut(&str)) {
    match value {
        Value::String(s) => visit(s),
        Value::Array(items) => items.iter().for_each(|v| collect_references(v, visit)),
        Value::Object(map) => map.values().for_each(|v| collect_references(v, visit)),
        _ => {}
    }
}
