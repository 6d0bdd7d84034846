//! State shared across worker, fan-out and maintenance threads.

use std::collections::HashMap;
use std::hash::BuildHasher;
use std::sync::Arc;

use ahash::RandomState;
use parking_lot::RwLock;

use plume_core::error::Result;

use crate::config::Config;
use crate::retained::RetainedStore;
use crate::session::Session;
use crate::subscription::SubscriptionStore;
use crate::sys_tree::BrokerMetrics;

/// Session index: a pool of reader-writer locks keyed by a hash of the
/// client id partitions contention across connecting/disconnecting clients.
pub struct SessionTable {
    shards: Vec<RwLock<HashMap<String, Arc<Session>>>>,
    hasher: RandomState,
}

impl SessionTable {
    pub fn new(num_shards: usize) -> Self {
        let num_shards = num_shards.max(1);
        Self {
            shards: (0..num_shards).map(|_| RwLock::new(HashMap::new())).collect(),
            hasher: RandomState::new(),
        }
    }

    #[inline]
    fn shard(&self, client_id: &str) -> &RwLock<HashMap<String, Arc<Session>>> {
        let idx = self.hasher.hash_one(client_id) as usize % self.shards.len();
        &self.shards[idx]
    }

    pub fn get(&self, client_id: &str) -> Option<Arc<Session>> {
        self.shard(client_id).read().get(client_id).cloned()
    }

    pub fn set(&self, client_id: &str, session: Arc<Session>) {
        self.shard(client_id)
            .write()
            .insert(client_id.to_string(), session);
    }

    pub fn remove(&self, client_id: &str) -> Option<Arc<Session>> {
        self.shard(client_id).write().remove(client_id)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Everything the threads share.
pub struct SharedState {
    pub sessions: SessionTable,
    pub subscriptions: RwLock<SubscriptionStore>,
    pub retained: RetainedStore,
    pub metrics: BrokerMetrics,
}

impl SharedState {
    pub fn new(config: &Config) -> Result<Self> {
        let retained = Self::open_retained(config)?;

        Ok(Self {
            sessions: SessionTable::new(config.session.lock_shards),
            subscriptions: RwLock::new(SubscriptionStore::new()),
            retained,
            metrics: BrokerMetrics::new(),
        })
    }

    #[cfg(feature = "persistence")]
    fn open_retained(config: &Config) -> Result<RetainedStore> {
        if config.persistence.enabled {
            let storage = crate::retained::FjallStorage::open(&config.persistence.path)?;
            return Ok(RetainedStore::new(Box::new(storage)));
        }
        Ok(RetainedStore::in_memory())
    }

    #[cfg(not(feature = "persistence"))]
    fn open_retained(config: &Config) -> Result<RetainedStore> {
        if config.persistence.enabled {
            log::warn!("persistence configured but this build lacks the 'persistence' feature; retained messages stay in memory");
        }
        Ok(RetainedStore::in_memory())
    }
}

pub type SharedStateHandle = Arc<SharedState>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_table_get_set_remove() {
        let table = SessionTable::new(64);
        assert!(table.get("a").is_none());

        let session = Arc::new(Session::new("a", 1, 10));
        table.set("a", Arc::clone(&session));
        assert!(Arc::ptr_eq(&table.get("a").unwrap(), &session));
        assert_eq!(table.len(), 1);

        let removed = table.remove("a").unwrap();
        assert!(Arc::ptr_eq(&removed, &session));
        assert!(table.is_empty());
    }

    #[test]
    fn test_session_table_many_clients() {
        let table = SessionTable::new(4);
        for i in 0..100 {
            let id = format!("client-{}", i);
            table.set(&id, Arc::new(Session::new(&id, i, 10)));
        }
        assert_eq!(table.len(), 100);
        for i in 0..100 {
            assert!(table.get(&format!("client-{}", i)).is_some());
        }
    }
}
