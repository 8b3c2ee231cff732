use scc::HashMap;

use crate::key::DHTKey;

/// Identifier-keyed byte blobs written by Store requests.
///
/// Locking is per entry, so concurrent handlers touching different keys never
/// wait on each other.
#[derive(Default)]
pub struct ValueStore {
    map: HashMap<DHTKey, Vec<u8>>,
}

impl ValueStore {
    pub fn new() -> Self {
        ValueStore::default()
    }

    /// Stores `value` under `key`, replacing whatever was there.
    pub async fn insert(&self, key: DHTKey, value: Vec<u8>) {
        self.map.upsert_async(key, value).await;
    }

    pub async fn get(&self, key: &DHTKey) -> Option<Vec<u8>> {
        self.map.read_async(key, |_, v| v.clone()).await
    }

    pub async fn contains(&self, key: &DHTKey) -> bool {
        self.map.contains_async(key).await
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
