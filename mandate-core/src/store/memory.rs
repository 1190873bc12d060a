//! In-memory registry stores.
//!
//! All four stores sit on [`ShardedMap`]: a fixed set of shards, each a
//! `RwLock<HashMap<K, Arc<Mutex<V>>>>`. A per-key operation takes a shard
//! read lock just long enough to clone the entry handle, then locks only that
//! entry. Requests for different keys never wait on each other's entry
//! locks, and sweeps skip entries that are currently held.

use super::{BudgetStore, KeyStore, NonceStore, RevocationStore};
use crate::budget::BudgetAccount;
use crate::error::{Error, Result};
use crate::identity::EntityId;
use crate::keys::KeyRing;
use crate::nonce::NonceRecord;
use crate::payload::ContentHash;
use crate::revocation::RevocationRecord;
use std::borrow::Borrow;
use std::collections::hash_map::RandomState;
use std::collections::HashMap;
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::sync::{Arc, Mutex, RwLock};

const SHARD_COUNT: usize = 16;

type Shard<K, V> = RwLock<HashMap<K, Arc<Mutex<V>>>>;

/// Concurrent map with per-entry locking.
pub struct ShardedMap<K, V> {
    name: &'static str,
    hasher: RandomState,
    shards: Vec<Shard<K, V>>,
}

impl<K, V> fmt::Debug for ShardedMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardedMap")
            .field("name", &self.name)
            .field("shards", &self.shards.len())
            .finish()
    }
}

impl<K: Hash + Eq + Clone, V> ShardedMap<K, V> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            hasher: RandomState::new(),
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard<Q>(&self, key: &Q) -> &Shard<K, V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let index = self.hasher.hash_one(key) as usize % self.shards.len();
        &self.shards[index]
    }

    fn poisoned(&self) -> Error {
        Error::StorePoisoned(self.name)
    }

    fn entry<Q>(&self, key: &Q) -> Result<Option<Arc<Mutex<V>>>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let guard = self.shard(key).read().map_err(|_| self.poisoned())?;
        Ok(guard.get(key).cloned())
    }

    /// Insert `value` unless `key` is present. Returns the existing entry
    /// handle when there is one.
    pub fn insert_if_absent(&self, key: K, value: V) -> Result<Option<Arc<Mutex<V>>>> {
        let mut guard = self.shard(&key).write().map_err(|_| self.poisoned())?;
        if let Some(existing) = guard.get(&key) {
            return Ok(Some(existing.clone()));
        }
        guard.insert(key, Arc::new(Mutex::new(value)));
        Ok(None)
    }

    /// Run `f` with exclusive access to the entry. `None` if absent.
    pub fn update<Q, R>(&self, key: &Q, f: impl FnOnce(&mut V) -> R) -> Result<Option<R>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let Some(entry) = self.entry(key)? else {
            return Ok(None);
        };
        let mut value = entry.lock().map_err(|_| self.poisoned())?;
        Ok(Some(f(&mut *value)))
    }

    /// Run `f` with shared access to the entry. `None` if absent.
    pub fn view<Q, R>(&self, key: &Q, f: impl FnOnce(&V) -> R) -> Result<Option<R>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.update(key, |v| f(v))
    }

    pub fn contains<Q>(&self, key: &Q) -> Result<bool>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        Ok(self.entry(key)?.is_some())
    }

    /// Remove entries for which `keep` returns false.
    ///
    /// Candidates are collected under a shard read lock, then removed under a
    /// short write lock after re-checking. Entries locked by someone else are
    /// left for the next sweep.
    pub fn retain(&self, mut keep: impl FnMut(&V) -> bool) -> Result<usize> {
        let mut removed = 0;
        for shard in &self.shards {
            let mut doomed: Vec<K> = Vec::new();
            {
                let guard = shard.read().map_err(|_| self.poisoned())?;
                for (k, entry) in guard.iter() {
                    if let Ok(v) = entry.try_lock() {
                        if !keep(&*v) {
                            doomed.push(k.clone());
                        }
                    }
                }
            }
            if doomed.is_empty() {
                continue;
            }

            let mut guard = shard.write().map_err(|_| self.poisoned())?;
            for key in doomed {
                let still_doomed = guard
                    .get(&key)
                    .is_some_and(|entry| matches!(entry.try_lock(), Ok(v) if !keep(&*v)));
                if still_doomed {
                    guard.remove(&key);
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    pub fn keys(&self) -> Result<Vec<K>> {
        let mut keys = Vec::new();
        for shard in &self.shards {
            let guard = shard.read().map_err(|_| self.poisoned())?;
            keys.extend(guard.keys().cloned());
        }
        Ok(keys)
    }

    /// Clone every value, locking entries one at a time.
    pub fn values(&self) -> Result<Vec<V>>
    where
        V: Clone,
    {
        let mut handles = Vec::new();
        for shard in &self.shards {
            let guard = shard.read().map_err(|_| self.poisoned())?;
            handles.extend(guard.values().cloned());
        }
        handles
            .iter()
            .map(|h| h.lock().map(|v| v.clone()).map_err(|_| self.poisoned()))
            .collect()
    }

    pub fn len(&self) -> Result<usize> {
        let mut len = 0;
        for shard in &self.shards {
            len += shard.read().map_err(|_| self.poisoned())?.len();
        }
        Ok(len)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

// ============================================================================
// Nonces
// ============================================================================

#[derive(Debug)]
pub struct MemoryNonceStore {
    map: ShardedMap<String, NonceRecord>,
}

impl MemoryNonceStore {
    pub fn new() -> Self {
        Self {
            map: ShardedMap::new("nonce"),
        }
    }
}

impl Default for MemoryNonceStore {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceStore for MemoryNonceStore {
    fn insert(&self, record: NonceRecord) -> Result<bool> {
        Ok(self
            .map
            .insert_if_absent(record.value.clone(), record)?
            .is_none())
    }

    fn update(
        &self,
        value: &str,
        f: &mut dyn FnMut(&mut NonceRecord) -> Result<()>,
    ) -> Result<bool> {
        match self.map.update(value, |r| f(r))? {
            Some(result) => result.map(|_| true),
            None => Ok(false),
        }
    }

    fn retain(&self, keep: &mut dyn FnMut(&NonceRecord) -> bool) -> Result<usize> {
        self.map.retain(|r| keep(r))
    }

    fn len(&self) -> Result<usize> {
        self.map.len()
    }
}

// ============================================================================
// Key rings
// ============================================================================

#[derive(Debug)]
pub struct MemoryKeyStore {
    map: ShardedMap<EntityId, KeyRing>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self {
            map: ShardedMap::new("keys"),
        }
    }
}

impl Default for MemoryKeyStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyStore for MemoryKeyStore {
    fn insert(&self, ring: KeyRing) -> Result<bool> {
        Ok(self
            .map
            .insert_if_absent(ring.entity().clone(), ring)?
            .is_none())
    }

    fn update(
        &self,
        entity: &EntityId,
        f: &mut dyn FnMut(&mut KeyRing) -> Result<()>,
    ) -> Result<bool> {
        match self.map.update(entity, |ring| f(ring))? {
            Some(result) => result.map(|_| true),
            None => Ok(false),
        }
    }

    fn read(&self, entity: &EntityId, f: &mut dyn FnMut(&KeyRing)) -> Result<bool> {
        Ok(self.map.view(entity, |ring| f(ring))?.is_some())
    }

    fn entities(&self) -> Result<Vec<EntityId>> {
        self.map.keys()
    }
}

// ============================================================================
// Revocations
// ============================================================================

#[derive(Debug)]
pub struct MemoryRevocationStore {
    map: ShardedMap<ContentHash, RevocationRecord>,
}

impl MemoryRevocationStore {
    pub fn new() -> Self {
        Self {
            map: ShardedMap::new("revocation"),
        }
    }
}

impl Default for MemoryRevocationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RevocationStore for MemoryRevocationStore {
    fn insert_if_absent(&self, record: RevocationRecord) -> Result<Option<RevocationRecord>> {
        match self.map.insert_if_absent(record.delegation_hash, record)? {
            Some(existing) => {
                let existing = existing
                    .lock()
                    .map_err(|_| Error::StorePoisoned("revocation"))?;
                Ok(Some(existing.clone()))
            }
            None => Ok(None),
        }
    }

    fn get(&self, hash: &ContentHash) -> Result<Option<RevocationRecord>> {
        self.map.view(hash, |r| r.clone())
    }

    fn contains(&self, hash: &ContentHash) -> Result<bool> {
        self.map.contains(hash)
    }

    fn all(&self) -> Result<Vec<RevocationRecord>> {
        self.map.values()
    }

    fn len(&self) -> Result<usize> {
        self.map.len()
    }
}

// ============================================================================
// Budgets
// ============================================================================

#[derive(Debug)]
pub struct MemoryBudgetStore {
    map: ShardedMap<EntityId, BudgetAccount>,
}

impl MemoryBudgetStore {
    pub fn new() -> Self {
        Self {
            map: ShardedMap::new("budget"),
        }
    }
}

impl Default for MemoryBudgetStore {
    fn default() -> Self {
        Self::new()
    }
}

impl BudgetStore for MemoryBudgetStore {
    fn insert(&self, account: BudgetAccount) -> Result<bool> {
        Ok(self
            .map
            .insert_if_absent(account.entity.clone(), account)?
            .is_none())
    }

    fn update(
        &self,
        entity: &EntityId,
        f: &mut dyn FnMut(&mut BudgetAccount) -> Result<()>,
    ) -> Result<bool> {
        match self.map.update(entity, |account| f(account))? {
            Some(result) => result.map(|_| true),
            None => Ok(false),
        }
    }

    fn get(&self, entity: &EntityId) -> Result<Option<BudgetAccount>> {
        self.map.view(entity, |a| a.clone())
    }

    fn entities(&self) -> Result<Vec<EntityId>> {
        self.map.keys()
    }
}
