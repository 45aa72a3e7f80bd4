use std::collections::{BTreeMap, HashMap};

use crate::types::{EntityId, NodeId};

/// LRU-bounded map of entity to last-known current node. Cached entries
/// may go stale; the routing layer self-heals on delivery. The directory
/// on an entity's home node never lives here.
pub struct LocationCache {
    capacity: usize,
    entries: HashMap<EntityId, (NodeId, u64)>,
    recency: BTreeMap<u64, EntityId>,
    tick: u64,
}

impl LocationCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
            tick: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Looks up and refreshes recency.
    pub fn get(&mut self, entity: EntityId) -> Option<NodeId> {
        let tick = self.next_tick();
        match self.entries.get_mut(&entity) {
            Some((node, last)) => {
                self.recency.remove(last);
                *last = tick;
                let node = *node;
                self.recency.insert(tick, entity);
                Some(node)
            }
            None => None,
        }
    }

    pub fn insert(&mut self, entity: EntityId, node: NodeId) {
        let tick = self.next_tick();
        if let Some((_, last)) = self.entries.get(&entity) {
            self.recency.remove(last);
        } else if self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.entries.insert(entity, (node, tick));
        self.recency.insert(tick, entity);
    }

    pub fn remove(&mut self, entity: EntityId) {
        if let Some((_, last)) = self.entries.remove(&entity) {
            self.recency.remove(&last);
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
    }

    fn evict_oldest(&mut self) {
        if let Some((&tick, &entity)) = self.recency.iter().next() {
            self.recency.remove(&tick);
            self.entries.remove(&entity);
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ClassId;

    fn entity(index: u64) -> EntityId {
        EntityId::new(ClassId(0), index)
    }

    #[test]
    fn insert_and_get() {
        let mut cache = LocationCache::new(4);
        cache.insert(entity(1), NodeId(3));
        assert_eq!(cache.get(entity(1)), Some(NodeId(3)));
        assert_eq!(cache.get(entity(2)), None);
    }

    #[test]
    fn capacity_evicts_least_recently_used() {
        let mut cache = LocationCache::new(2);
        cache.insert(entity(1), NodeId(1));
        cache.insert(entity(2), NodeId(2));
        // touch 1 so 2 becomes the eviction candidate
        assert!(cache.get(entity(1)).is_some());
        cache.insert(entity(3), NodeId(3));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(entity(2)), None);
        assert_eq!(cache.get(entity(1)), Some(NodeId(1)));
        assert_eq!(cache.get(entity(3)), Some(NodeId(3)));
    }

    #[test]
    fn reinsert_updates_value_without_growth() {
        let mut cache = LocationCache::new(2);
        cache.insert(entity(1), NodeId(1));
        cache.insert(entity(1), NodeId(5));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(entity(1)), Some(NodeId(5)));
    }

    #[test]
    fn remove_and_clear() {
        let mut cache = LocationCache::new(2);
        cache.insert(entity(1), NodeId(1));
        cache.remove(entity(1));
        assert!(cache.is_empty());
        cache.insert(entity(2), NodeId(2));
        cache.clear();
        assert!(cache.is_empty());
    }
}
