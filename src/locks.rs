//! # Key Locks
//!
//! Scoped exclusive ownership over sets of lock keys. A reconciliation holds
//! the keys for its email and phone, and then the keys for every cluster root
//! it touches, until its guards drop.
//!
//! A set is granted all-or-nothing, so two callers never hold parts of each
//! other's sets. Callers always take attribute keys before cluster keys.

use crate::model::ContactId;
use anyhow::{bail, Result};
use hashbrown::HashSet;
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeSet;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LockKey {
    Email(String),
    Phone(String),
    Cluster(ContactId),
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockKey::Email(email) => write!(f, "email:{email}"),
            LockKey::Phone(phone) => write!(f, "phone:{phone}"),
            LockKey::Cluster(id) => write!(f, "cluster:{id}"),
        }
    }
}

#[derive(Debug, Default)]
pub struct KeyLocks {
    held: Mutex<HashSet<LockKey>>,
    released: Condvar,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until every key is free, then take them all.
    ///
    /// Fails if the keys cannot be taken within `timeout`.
    pub fn acquire(
        &self,
        keys: impl IntoIterator<Item = LockKey>,
        timeout: Duration,
    ) -> Result<KeyLockGuard<'_>> {
        let keys: Vec<LockKey> = keys.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock();
        while keys.iter().any(|key| held.contains(key)) {
            if self.released.wait_until(&mut held, deadline).timed_out()
                && keys.iter().any(|key| held.contains(key))
            {
                let busy: Vec<String> = keys
                    .iter()
                    .filter(|key| held.contains(*key))
                    .map(ToString::to_string)
                    .collect();
                bail!(
                    "timed out after {}ms waiting for {}",
                    timeout.as_millis(),
                    busy.join(", ")
                );
            }
        }
        held.extend(keys.iter().cloned());
        Ok(KeyLockGuard { locks: self, keys })
    }

    /// Number of keys currently held.
    pub fn held_count(&self) -> usize {
        self.held.lock().len()
    }
}

/// Releases its keys on drop.
#[must_use = "keys are released as soon as the guard is dropped"]
pub struct KeyLockGuard<'a> {
    locks: &'a KeyLocks,
    keys: Vec<LockKey>,
}

impl KeyLockGuard<'_> {
    pub fn keys(&self) -> &[LockKey] {
        &self.keys
    }
}

impl fmt::Debug for KeyLockGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyLockGuard")
            .field("keys", &self.keys)
            .finish()
    }
}

impl Drop for KeyLockGuard<'_> {
    fn drop(&mut self) {
        if self.keys.is_empty() {
            return;
        }
        let mut held = self.locks.held.lock();
        for key in &self.keys {
            held.remove(key);
        }
        drop(held);
        self.locks.released.notify_all();
    }
}
