//! Registry storage.
//!
//! The engine mutates four shared registries: nonces, key rings, revocation
//! records and budget accounts. Each is a trait here so durable backends can
//! be swapped in. Implementations must make every method atomic per key:
//! an `update` closure runs while the entry is exclusively held, and
//! concurrent calls for different keys must not serialize behind each other.
//!
//! [`memory`] holds the in-process implementations.

pub mod memory;

use crate::budget::BudgetAccount;
use crate::error::Result;
use crate::identity::EntityId;
use crate::keys::KeyRing;
use crate::nonce::NonceRecord;
use crate::payload::ContentHash;
use crate::revocation::RevocationRecord;
use std::fmt::Debug;

pub use memory::{
    MemoryBudgetStore, MemoryKeyStore, MemoryNonceStore, MemoryRevocationStore, ShardedMap,
};

/// Storage for issued nonces, keyed by nonce value.
pub trait NonceStore: Send + Sync + Debug {
    /// Insert a new record. Returns `false` if the value already exists.
    fn insert(&self, record: NonceRecord) -> Result<bool>;

    /// Atomically modify a record. Returns `false` if no record exists.
    fn update(
        &self,
        value: &str,
        f: &mut dyn FnMut(&mut NonceRecord) -> Result<()>,
    ) -> Result<bool>;

    /// Drop every record for which `keep` returns false. Entries held by an
    /// in-flight request are skipped. Returns the number removed.
    fn retain(&self, keep: &mut dyn FnMut(&NonceRecord) -> bool) -> Result<usize>;

    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Storage for per-entity key rings.
pub trait KeyStore: Send + Sync + Debug {
    /// Insert a new ring. Returns `false` if the entity already exists.
    fn insert(&self, ring: KeyRing) -> Result<bool>;

    /// Atomically modify a ring. Returns `false` if the entity is unknown.
    fn update(
        &self,
        entity: &EntityId,
        f: &mut dyn FnMut(&mut KeyRing) -> Result<()>,
    ) -> Result<bool>;

    /// Read a ring under its lock. Returns `false` if the entity is unknown.
    fn read(&self, entity: &EntityId, f: &mut dyn FnMut(&KeyRing)) -> Result<bool>;

    fn entities(&self) -> Result<Vec<EntityId>>;
}

/// Storage for revocation records, keyed by delegation content hash.
///
/// Records are permanent: there is no removal method.
pub trait RevocationStore: Send + Sync + Debug {
    /// Insert unless a record for the same hash exists. Returns the existing
    /// record when there is one, `None` when `record` was stored.
    fn insert_if_absent(&self, record: RevocationRecord) -> Result<Option<RevocationRecord>>;

    fn get(&self, hash: &ContentHash) -> Result<Option<RevocationRecord>>;

    fn contains(&self, hash: &ContentHash) -> Result<bool>;

    fn all(&self) -> Result<Vec<RevocationRecord>>;

    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Storage for budget accounts.
pub trait BudgetStore: Send + Sync + Debug {
    /// Insert a new account. Returns `false` if the entity already has one.
    fn insert(&self, account: BudgetAccount) -> Result<bool>;

    /// Atomically modify an account. Returns `false` if there is none.
    fn update(
        &self,
        entity: &EntityId,
        f: &mut dyn FnMut(&mut BudgetAccount) -> Result<()>,
    ) -> Result<bool>;

    fn get(&self, entity: &EntityId) -> Result<Option<BudgetAccount>>;

    fn entities(&self) -> Result<Vec<EntityId>>;
}
