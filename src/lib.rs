//! # Identirust
//!
//! Contact identity reconciliation. Each observation of an email, a phone
//! number or both is linked into the cluster of contacts it shares an attribute
//! with. Clusters bridged by one observation are merged under their oldest
//! primary contact.
//!
//! Matching is exact equality on the stored values; nothing is deleted, only
//! added or re-linked.

pub mod clock;
pub mod config;
pub mod consolidate;
pub mod error;
pub mod locks;
pub mod matcher;
pub mod merger;
pub mod model;
pub mod persistence;
pub mod recorder;
pub mod resolver;
pub mod server;
pub mod store;
pub mod test_support;
pub mod validation;

// Re-export main types for convenience
pub use config::{IdentConfig, ReconcileTuning};
pub use error::{ReconcileError, ReconcileResult};
pub use model::{
    ConsolidatedContact, Contact, ContactId, IdentifyResponse, LinkPrecedence, NewContact,
    Observation,
};
pub use persistence::{PersistentOpenOptions, PersistentStore};
pub use store::{ContactStore, MemoryStore};

use anyhow::anyhow;
use locks::{KeyLocks, LockKey};
use tracing::{debug, error, info, instrument, warn};

/// Main API for contact reconciliation.
///
/// Safe to share between threads; concurrent calls touching the same email,
/// phone number or cluster are serialized.
pub struct Identirust {
    store: Box<dyn ContactStore>,
    locks: KeyLocks,
    tuning: ReconcileTuning,
}

impl Identirust {
    /// Create an instance over an empty in-memory store.
    pub fn new() -> Self {
        Self::with_store(MemoryStore::new())
    }

    /// Create an instance with a custom store implementation.
    pub fn with_store<S>(store: S) -> Self
    where
        S: ContactStore + 'static,
    {
        Self::with_store_and_tuning(store, ReconcileTuning::default())
    }

    pub fn with_store_and_tuning<S>(store: S, tuning: ReconcileTuning) -> Self
    where
        S: ContactStore + 'static,
    {
        Self {
            store: Box::new(store),
            locks: KeyLocks::new(),
            tuning,
        }
    }

    pub fn store(&self) -> &dyn ContactStore {
        self.store.as_ref()
    }

    pub fn tuning(&self) -> &ReconcileTuning {
        &self.tuning
    }

    /// Number of stored contacts.
    pub fn contact_count(&self) -> usize {
        self.store.len()
    }

    /// Get a contact by id from the underlying store.
    pub fn get_contact(&self, id: ContactId) -> ReconcileResult<Option<Contact>> {
        Ok(self.store.get(id)?)
    }

    /// Create a durable checkpoint of the underlying store, if supported.
    pub fn checkpoint(&self, path: &std::path::Path) -> ReconcileResult<()> {
        Ok(self.store.checkpoint(path)?)
    }

    /// Reconcile one observation and return the consolidated identity it belongs to.
    ///
    /// Syntax validation is the caller's job (see [`validation`]); only an
    /// observation with neither attribute is rejected here.
    #[instrument(skip_all, fields(%observation), level = "debug")]
    pub fn identify(&self, observation: &Observation) -> ReconcileResult<IdentifyResponse> {
        if observation.is_empty() {
            return Err(ReconcileError::invalid_input(
                "at least one of email or phoneNumber is required",
            ));
        }
        let result = self.reconcile(observation);
        if let Err(ReconcileError::InvariantViolation(message)) = &result {
            error!(%observation, %message, "contact invariant violated");
        }
        result
    }

    fn reconcile(&self, observation: &Observation) -> ReconcileResult<IdentifyResponse> {
        let store = self.store.as_ref();
        let timeout = self.tuning.lock_timeout();
        let _attributes = self.locks.acquire(attribute_keys(observation), timeout)?;

        let mut attempt = 0u32;
        let (matches, resolution, _clusters) = loop {
            let matches = matcher::find_matches(store, observation)?;
            if matches.is_empty() {
                return self.create_primary(observation);
            }
            let clusters = self.locks.acquire(
                resolver::claimed_root_ids(&matches)?
                    .into_iter()
                    .map(LockKey::Cluster),
                timeout,
            )?;
            let current = matcher::find_matches(store, observation)?;
            if matcher::same_shape(&matches, &current) {
                // Roots are only read once their clusters are locked.
                let resolution = resolver::resolve(store, &current)?;
                break (current, resolution, clusters);
            }
            drop(clusters);
            attempt += 1;
            if attempt > self.tuning.max_lock_retries {
                return Err(anyhow!(
                    "clusters for {observation} kept changing after {attempt} attempts"
                )
                .into());
            }
            warn!(attempt, "matched clusters changed while waiting for locks, retrying");
        };
        debug!(
            matched = matches.len(),
            primary = %resolution.primary.id,
            merge = resolution.needs_merge(),
            "matched existing contacts"
        );

        let canonical = if resolution.needs_merge() {
            let (canonical, _report) = merger::merge_clusters(
                store,
                &resolution.primary,
                &resolution.other_primaries,
            )?;
            self.verify_single_primary(observation, canonical.id)?;
            canonical
        } else {
            resolution.primary
        };

        recorder::record_if_new(store, &matches, observation, canonical.id)?;

        let cluster = store.find_cluster(canonical.id)?;
        Ok(IdentifyResponse {
            contact: consolidate::consolidate(&canonical, &cluster),
        })
    }

    fn create_primary(&self, observation: &Observation) -> ReconcileResult<IdentifyResponse> {
        let created = self.store.create(NewContact::primary(observation))?;
        info!(id = %created.id, "created primary contact");
        Ok(IdentifyResponse {
            contact: consolidate::consolidate(&created, std::slice::from_ref(&created)),
        })
    }

    /// After a merge no other live primary may share the observation's attributes.
    fn verify_single_primary(
        &self,
        observation: &Observation,
        canonical: ContactId,
    ) -> ReconcileResult<()> {
        let others = self.store.find_other_primaries(
            observation.email_ref(),
            observation.phone_ref(),
            canonical,
        )?;
        if others.is_empty() {
            return Ok(());
        }
        let ids: Vec<String> = others.iter().map(|c| c.id.to_string()).collect();
        Err(ReconcileError::invariant(format!(
            "merge into {canonical} left primaries {} sharing {observation}",
            ids.join(", ")
        )))
    }
}

impl Default for Identirust {
    fn default() -> Self {
        Self::new()
    }
}

fn attribute_keys(observation: &Observation) -> Vec<LockKey> {
    observation
        .email
        .iter()
        .map(|email| LockKey::Email(email.clone()))
        .chain(
            observation
                .phone_number
                .iter()
                .map(|phone| LockKey::Phone(phone.clone())),
        )
        .collect()
}
