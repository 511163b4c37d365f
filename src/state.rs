/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Types and methods used to access and mutate the persistent state a
//! replica keeps for crash recovery.
//!
//! State may be stored in any key-value store of the library user's choosing,
//! as long as that KV store can provide a type that implements [KVStore].
//! [ReplicaStore] layers the persistence-level policy on top: a write
//! requested at level L is performed iff the configured level admits it, and
//! the *critical* keys (`view`, `lockedBlock`, `committedBlocks`) are always
//! written synchronously, before the state change they protect becomes
//! observable through any outgoing message. The safety argument depends on
//! those writes, so a failing critical write must halt the replica — a
//! [KVStore] implementation is expected to panic rather than lose one.

use std::sync::Mutex;

use borsh::{BorshDeserialize, BorshSerialize};

pub trait KVGet {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
}

pub trait KVStore: KVGet + Clone + Send + 'static {
    type WriteBatch: WriteBatch;

    fn write(&mut self, wb: Self::WriteBatch);
    fn clear(&mut self);
}

pub trait WriteBatch {
    fn new() -> Self;
    fn set(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}

/// How much of the replica state is made durable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PersistLevel {
    All = 1,
    Critical = 2,
    None = 3,
}

impl PersistLevel {
    pub fn from_config(level: u8) -> Option<PersistLevel> {
        match level {
            1 => Some(PersistLevel::All),
            2 => Some(PersistLevel::Critical),
            3 => Some(PersistLevel::None),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub enum StateError {
    /// The configured level never persists this key.
    NotPersisted,
    /// The key is absent from the store.
    Missing,
    /// The stored bytes did not deserialize into the requested type.
    Corrupt,
}

/// Locations of the replica state variables in the KV store.
pub(crate) mod paths {
    // Critical keys.
    pub(crate) const VIEW: [u8; 1] = [0];
    pub(crate) const LOCKED_BLOCK: [u8; 1] = [1];
    pub(crate) const COMMITTED_BLOCKS: [u8; 1] = [2];

    // Persist-all keys.
    pub(crate) const SEQUENCE: [u8; 1] = [3];
    pub(crate) const CUR_BLOCK: [u8; 1] = [4];
    pub(crate) const CUR_HASH: [u8; 1] = [5];
    pub(crate) const VOTED_BLOCKS: [u8; 1] = [6];
    pub(crate) const AWAITING_BLOCKS: [u8; 1] = [7];
    pub(crate) const AWAITING_DECISION: [u8; 1] = [8];
    pub(crate) const AWAITING_DECISION_COPY: [u8; 1] = [9];
    pub(crate) const QUEUE: [u8; 1] = [10];

    pub(crate) fn is_critical(key: &[u8]) -> bool {
        key == VIEW || key == LOCKED_BLOCK || key == COMMITTED_BLOCKS
    }
}

/// A write/read handle into the replica's KV store that applies the
/// persistence-level policy.
pub struct ReplicaStore<K: KVStore> {
    kv: Mutex<K>,
    level: PersistLevel,
}

impl<K: KVStore> ReplicaStore<K> {
    pub fn new(kv_store: K, level: PersistLevel) -> ReplicaStore<K> {
        ReplicaStore {
            kv: Mutex::new(kv_store),
            level,
        }
    }

    pub fn level(&self) -> PersistLevel {
        self.level
    }

    /// Writes `value` under `key` iff the configured level is at most
    /// `level`. Critical-key writes are durable before this returns.
    pub fn persist<T: BorshSerialize>(&self, key: &[u8], value: &T, level: PersistLevel) {
        if (self.level as u8) > (level as u8) {
            return;
        }
        let bytes = value
            .try_to_vec()
            .expect("serializing a state variable cannot fail");
        let mut wb = K::WriteBatch::new();
        wb.set(key, &bytes);
        self.kv.lock().unwrap().write(wb);
    }

    /// Reads `key` back into a `T`. Honors the level policy in reverse: at
    /// level Critical only the critical keys are recoverable.
    pub fn recover<T: BorshDeserialize>(&self, key: &[u8]) -> Result<T, StateError> {
        match self.level {
            PersistLevel::None => return Err(StateError::NotPersisted),
            PersistLevel::Critical if !paths::is_critical(key) => {
                return Err(StateError::NotPersisted)
            }
            _ => {}
        }
        let bytes = self
            .kv
            .lock()
            .unwrap()
            .get(key)
            .ok_or(StateError::Missing)?;
        T::try_from_slice(&bytes).map_err(|_| StateError::Corrupt)
    }
}

#[cfg(test)]
pub(crate) mod mem_db {
    //! An in-memory [KVStore] used across the test suite.

    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex};

    use super::{KVGet, KVStore, WriteBatch};

    #[derive(Clone, Default)]
    pub(crate) struct MemDB(Arc<Mutex<HashMap<Vec<u8>, Vec<u8>>>>);

    impl MemDB {
        pub(crate) fn new() -> MemDB {
            MemDB::default()
        }
    }

    impl KVGet for MemDB {
        fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
            self.0.lock().unwrap().get(key).cloned()
        }
    }

    impl KVStore for MemDB {
        type WriteBatch = MemWriteBatch;

        fn write(&mut self, wb: MemWriteBatch) {
            let mut map = self.0.lock().unwrap();
            for (key, value) in wb.insertions {
                map.insert(key, value);
            }
            for key in wb.deletions {
                map.remove(&key);
            }
        }

        fn clear(&mut self) {
            self.0.lock().unwrap().clear();
        }
    }

    #[derive(Default)]
    pub(crate) struct MemWriteBatch {
        insertions: HashMap<Vec<u8>, Vec<u8>>,
        deletions: HashSet<Vec<u8>>,
    }

    impl WriteBatch for MemWriteBatch {
        fn new() -> Self {
            MemWriteBatch::default()
        }

        fn set(&mut self, key: &[u8], value: &[u8]) {
            let _ = self.deletions.remove(key);
            self.insertions.insert(key.to_vec(), value.to_vec());
        }

        fn delete(&mut self, key: &[u8]) {
            let _ = self.insertions.remove(key);
            self.deletions.insert(key.to_vec());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mem_db::MemDB;
    use super::*;
    use crate::types::ViewNumber;

    #[test]
    fn persist_honors_the_level_policy() {
        let store = ReplicaStore::new(MemDB::new(), PersistLevel::Critical);

        store.persist(&paths::VIEW, &ViewNumber::new(7), PersistLevel::Critical);
        store.persist(&paths::SEQUENCE, &42u64, PersistLevel::All);

        let view: ViewNumber = store.recover(&paths::VIEW).unwrap();
        assert_eq!(view, ViewNumber::new(7));
        // The sequence write was requested at level All but the store only
        // keeps critical keys.
        assert!(matches!(
            store.recover::<u64>(&paths::SEQUENCE),
            Err(StateError::NotPersisted)
        ));
    }

    #[test]
    fn no_persist_stores_nothing() {
        let store = ReplicaStore::new(MemDB::new(), PersistLevel::None);
        store.persist(&paths::VIEW, &ViewNumber::new(1), PersistLevel::Critical);
        assert!(matches!(
            store.recover::<ViewNumber>(&paths::VIEW),
            Err(StateError::NotPersisted)
        ));
    }

    #[test]
    fn persist_all_round_trips_every_key() {
        let store = ReplicaStore::new(MemDB::new(), PersistLevel::All);
        store.persist(&paths::SEQUENCE, &9u64, PersistLevel::All);
        assert_eq!(store.recover::<u64>(&paths::SEQUENCE).unwrap(), 9);
        assert!(matches!(
            store.recover::<u64>(&paths::CUR_HASH),
            Err(StateError::Missing)
        ));
    }
}
