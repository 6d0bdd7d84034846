//! Retained message store.
//!
//! The store persists the latest retained PUBLISH per topic behind a small
//! key/value contract. Values are the exact byte encoding of the PUBLISH
//! packet (fixed header included), decoded again on delivery. The default
//! backend is in-memory; the `persistence` feature adds an fjall-backed one
//! that survives restarts.

use std::collections::HashMap;

use parking_lot::RwLock;

use plume_core::error::Result;
use plume_core::packet::{self, Packet, Publish};

use crate::subscription::topic_matches_filter;

/// Key/value contract the retained store runs on.
pub trait Storage: Send + Sync {
    fn put(&self, topic: &str, value: &[u8]) -> Result<()>;
    fn get(&self, topic: &str) -> Result<Option<Vec<u8>>>;
    fn delete(&self, topic: &str) -> Result<()>;
    /// Snapshot of all entries. The store is small (one entry per retained
    /// topic) and scans are rare, so a copy keeps the contract simple.
    fn iterate(&self) -> Result<Vec<(String, Vec<u8>)>>;
}

/// Default in-memory backend.
pub struct MemStorage {
    map: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for MemStorage {
    fn put(&self, topic: &str, value: &[u8]) -> Result<()> {
        self.map.write().insert(topic.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, topic: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.map.read().get(topic).cloned())
    }

    fn delete(&self, topic: &str) -> Result<()> {
        self.map.write().remove(topic);
        Ok(())
    }

    fn iterate(&self) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .map
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// fjall-backed storage, used when `[persistence]` is enabled.
#[cfg(feature = "persistence")]
pub use self::fjall_storage::FjallStorage;

#[cfg(feature = "persistence")]
mod fjall_storage {
    use super::Storage;
    use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};
    use plume_core::error::{Error, Result};
    use std::path::Path;

    pub struct FjallStorage {
        keyspace: Keyspace,
        retained: PartitionHandle,
    }

    impl FjallStorage {
        pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
            let keyspace = Config::new(path)
                .open()
                .map_err(|e| Error::Internal(format!("open retained store: {}", e)))?;
            let retained = keyspace
                .open_partition("retained", PartitionCreateOptions::default())
                .map_err(|e| Error::Internal(format!("open retained partition: {}", e)))?;
            log::info!("retained store opened");
            Ok(Self { keyspace, retained })
        }

        /// Flush pending writes; called on graceful shutdown.
        pub fn sync(&self) -> Result<()> {
            self.keyspace
                .persist(PersistMode::SyncAll)
                .map_err(|e| Error::Internal(format!("sync retained store: {}", e)))
        }
    }

    impl Storage for FjallStorage {
        fn put(&self, topic: &str, value: &[u8]) -> Result<()> {
            self.retained
                .insert(topic, value)
                .map_err(|e| Error::Internal(format!("retained put: {}", e)))
        }

        fn get(&self, topic: &str) -> Result<Option<Vec<u8>>> {
            self.retained
                .get(topic)
                .map(|v| v.map(|slice| slice.to_vec()))
                .map_err(|e| Error::Internal(format!("retained get: {}", e)))
        }

        fn delete(&self, topic: &str) -> Result<()> {
            self.retained
                .remove(topic)
                .map_err(|e| Error::Internal(format!("retained delete: {}", e)))
        }

        fn iterate(&self) -> Result<Vec<(String, Vec<u8>)>> {
            let mut out = Vec::new();
            for kv in self.retained.iter() {
                let (key, value) =
                    kv.map_err(|e| Error::Internal(format!("retained iterate: {}", e)))?;
                out.push((String::from_utf8_lossy(&key).into_owned(), value.to_vec()));
            }
            Ok(out)
        }
    }
}

/// The broker-facing retained store.
pub struct RetainedStore {
    storage: Box<dyn Storage>,
}

impl RetainedStore {
    pub fn new(storage: Box<dyn Storage>) -> Self {
        Self { storage }
    }

    pub fn in_memory() -> Self {
        Self::new(Box::new(MemStorage::new()))
    }

    /// Store the latest retained publish for its topic.
    pub fn store(&self, publish: &Publish) -> Result<()> {
        let stored = Publish {
            dup: false,
            qos: publish.qos,
            retain: true,
            topic: publish.topic.clone(),
            // re-identified per subscriber at delivery time
            packet_id: None,
            payload: publish.payload.clone(),
        };
        let mut value = Vec::with_capacity(stored.topic.len() + stored.payload.len() + 8);
        packet::encode_publish(&stored, &mut value);
        self.storage.put(publish.topic_str(), &value)
    }

    pub fn remove(&self, topic: &str) -> Result<()> {
        self.storage.delete(topic)
    }

    /// The retained publish stored for one exact topic, if any.
    pub fn get(&self, topic: &str) -> Option<Publish> {
        match self.storage.get(topic) {
            Ok(Some(value)) => match packet::decode_packet(&value, 0) {
                Ok(Some((Packet::Publish(publish), _))) => Some(publish),
                _ => None,
            },
            Ok(None) => None,
            Err(e) => {
                log::warn!("retained get for {:?} failed: {}", topic, e);
                None
            }
        }
    }

    /// Every retained publish whose topic matches the filter, decoded.
    /// [MQTT-4.7.2-1] a wildcard-led filter never yields '$'-led topics.
    pub fn matching(&self, filter: &str) -> Vec<Publish> {
        let wildcard_led = filter.starts_with('+') || filter.starts_with('#');

        let entries = match self.storage.iterate() {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("retained scan failed: {}", e);
                return Vec::new();
            }
        };

        let mut result = Vec::new();
        for (topic, value) in entries {
            if wildcard_led && topic.starts_with('$') {
                continue;
            }
            if !topic_matches_filter(&topic, filter) {
                continue;
            }
            match packet::decode_packet(&value, 0) {
                Ok(Some((Packet::Publish(publish), _))) => result.push(publish),
                other => {
                    log::warn!(
                        "dropping undecodable retained entry for {:?}: {:?}",
                        topic,
                        other.err()
                    );
                    let _ = self.storage.delete(&topic);
                }
            }
        }
        result
    }

    pub fn len(&self) -> usize {
        self.storage.iterate().map(|v| v.len()).unwrap_or(0)
    }
}


#[cfg(all(test, feature = "persistence"))]
mod fjall_tests {
    use super::*;
    use bytes::Bytes;
    use plume_core::packet::QoS;
    use tempfile::tempdir;

    #[test]
    fn test_survives_reopen() {
        let dir = tempdir().unwrap();

        {
            let store = RetainedStore::new(Box::new(FjallStorage::open(dir.path()).unwrap()));
            store
                .store(&Publish {
                    dup: false,
                    qos: QoS::AtLeastOnce,
                    retain: true,
                    topic: Bytes::from_static(b"persist/me"),
                    packet_id: None,
                    payload: Bytes::from_static(b"still here"),
                })
                .unwrap();
        }

        let store = RetainedStore::new(Box::new(FjallStorage::open(dir.path()).unwrap()));
        let found = store.matching("persist/#");
        assert_eq!(found.len(), 1);
        assert_eq!(&found[0].payload[..], b"still here");
    }
}
