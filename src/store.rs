//! # Store Module
//!
//! The contact store interface consumed by reconciliation, plus an in-memory
//! implementation with email, phone and link indexes.

use crate::clock::{Clock, SystemClock, Timestamp};
use crate::model::{by_creation, Contact, ContactId, LinkPrecedence, NewContact};
use anyhow::{anyhow, bail, Result};
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

/// Durable keyed storage of contacts.
///
/// All `find_*` operations exclude logically deleted contacts and return
/// contacts ascending by `(created_at, id)`.
pub trait ContactStore: Send + Sync {
    /// Contacts whose email equals `email` or whose phone equals `phone`.
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Vec<Contact>>;

    /// Primary contacts sharing `email` or `phone`, other than `exclude_id`.
    fn find_other_primaries(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
        exclude_id: ContactId,
    ) -> Result<Vec<Contact>> {
        Ok(self
            .find_by_email_or_phone(email, phone)?
            .into_iter()
            .filter(|contact| contact.is_primary() && contact.id != exclude_id)
            .collect())
    }

    /// The primary plus every secondary linked to it.
    fn find_cluster(&self, primary_id: ContactId) -> Result<Vec<Contact>>;

    /// Lookup by id. Deleted contacts are returned as stored.
    fn get(&self, id: ContactId) -> Result<Option<Contact>>;

    /// Insert a new contact, assigning its id and timestamps.
    fn create(&self, contact: NewContact) -> Result<Contact>;

    /// Upsert one contact by id.
    fn save(&self, contact: Contact) -> Result<Contact> {
        self.save_all(vec![contact])?
            .pop()
            .ok_or_else(|| anyhow!("save returned no contact"))
    }

    /// Upsert several contacts as one atomic unit: either all are visible or none.
    ///
    /// `updated_at` is refreshed on every existing contact. Email, phone and
    /// `created_at` of an existing contact cannot change.
    fn save_all(&self, contacts: Vec<Contact>) -> Result<Vec<Contact>>;

    /// Every stored contact, deleted ones included, ascending by creation.
    fn all(&self) -> Result<Vec<Contact>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create a durable snapshot of the store, if supported.
    fn checkpoint(&self, _path: &Path) -> Result<()> {
        bail!("checkpoint is not supported by this store")
    }
}

impl<S: ContactStore + ?Sized> ContactStore for Arc<S> {
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Vec<Contact>> {
        (**self).find_by_email_or_phone(email, phone)
    }

    fn find_other_primaries(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
        exclude_id: ContactId,
    ) -> Result<Vec<Contact>> {
        (**self).find_other_primaries(email, phone, exclude_id)
    }

    fn find_cluster(&self, primary_id: ContactId) -> Result<Vec<Contact>> {
        (**self).find_cluster(primary_id)
    }

    fn get(&self, id: ContactId) -> Result<Option<Contact>> {
        (**self).get(id)
    }

    fn create(&self, contact: NewContact) -> Result<Contact> {
        (**self).create(contact)
    }

    fn save(&self, contact: Contact) -> Result<Contact> {
        (**self).save(contact)
    }

    fn save_all(&self, contacts: Vec<Contact>) -> Result<Vec<Contact>> {
        (**self).save_all(contacts)
    }

    fn all(&self) -> Result<Vec<Contact>> {
        (**self).all()
    }

    fn len(&self) -> usize {
        (**self).len()
    }

    fn is_empty(&self) -> bool {
        (**self).is_empty()
    }

    fn checkpoint(&self, path: &Path) -> Result<()> {
        (**self).checkpoint(path)
    }
}

/// Check that precedence and link agree: secondaries point elsewhere, primaries point nowhere.
pub(crate) fn check_link_shape(
    id: Option<ContactId>,
    precedence: LinkPrecedence,
    linked_id: Option<ContactId>,
) -> Result<()> {
    match (precedence, linked_id) {
        (LinkPrecedence::Primary, None) => Ok(()),
        (LinkPrecedence::Primary, Some(target)) => {
            bail!("primary contact cannot be linked (linked_id {target})")
        }
        (LinkPrecedence::Secondary, None) => bail!("secondary contact requires a linked_id"),
        (LinkPrecedence::Secondary, Some(target)) if Some(target) == id => {
            bail!("contact {target} cannot link to itself")
        }
        (LinkPrecedence::Secondary, Some(_)) => Ok(()),
    }
}

/// Validate an update against the stored version and stamp `updated_at`.
pub(crate) fn prepare_update(
    existing: Option<&Contact>,
    mut incoming: Contact,
    now: Timestamp,
) -> Result<Contact> {
    check_link_shape(
        Some(incoming.id),
        incoming.link_precedence,
        incoming.linked_id,
    )?;
    if let Some(existing) = existing {
        if existing.email != incoming.email || existing.phone_number != incoming.phone_number {
            bail!("contact {}: email and phone number are immutable", existing.id);
        }
        if existing.created_at != incoming.created_at {
            bail!("contact {}: created_at is immutable", existing.id);
        }
        incoming.updated_at = now.max(existing.updated_at);
    }
    Ok(incoming)
}

#[derive(Debug, Default)]
struct MemoryInner {
    contacts: HashMap<ContactId, Contact>,
    by_email: HashMap<String, BTreeSet<ContactId>>,
    by_phone: HashMap<String, BTreeSet<ContactId>>,
    by_link: HashMap<ContactId, BTreeSet<ContactId>>,
    next_id: u64,
}

impl MemoryInner {
    fn insert(&mut self, contact: Contact) {
        if let Some(email) = &contact.email {
            self.by_email
                .entry(email.clone())
                .or_default()
                .insert(contact.id);
        }
        if let Some(phone) = &contact.phone_number {
            self.by_phone
                .entry(phone.clone())
                .or_default()
                .insert(contact.id);
        }
        if let Some(linked) = contact.linked_id {
            self.by_link.entry(linked).or_default().insert(contact.id);
        }
        self.next_id = self.next_id.max(contact.id.0 + 1);
        self.contacts.insert(contact.id, contact);
    }

    fn replace(&mut self, contact: Contact) {
        let previous_link = self
            .contacts
            .get(&contact.id)
            .and_then(|existing| existing.linked_id);
        if previous_link != contact.linked_id {
            if let Some(previous) = previous_link {
                if let Some(members) = self.by_link.get_mut(&previous) {
                    members.remove(&contact.id);
                    if members.is_empty() {
                        self.by_link.remove(&previous);
                    }
                }
            }
            if let Some(linked) = contact.linked_id {
                self.by_link.entry(linked).or_default().insert(contact.id);
            }
        }
        self.contacts.insert(contact.id, contact);
    }

    fn live(&self, ids: impl IntoIterator<Item = ContactId>) -> Vec<Contact> {
        let mut contacts: Vec<Contact> = ids
            .into_iter()
            .filter_map(|id| self.contacts.get(&id))
            .filter(|contact| !contact.is_deleted())
            .cloned()
            .collect();
        contacts.sort_by(by_creation);
        contacts
    }
}

/// In-memory contact store.
#[derive(Debug)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create an empty store backed by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: RwLock::new(MemoryInner {
                next_id: 1,
                ..MemoryInner::default()
            }),
            clock,
        }
    }

    /// Id the next created contact will receive.
    pub fn next_id(&self) -> ContactId {
        ContactId(self.inner.read().next_id)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ContactStore for MemoryStore {
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Vec<Contact>> {
        let inner = self.inner.read();
        let mut ids = BTreeSet::new();
        if let Some(matches) = email.and_then(|email| inner.by_email.get(email)) {
            ids.extend(matches.iter().copied());
        }
        if let Some(matches) = phone.and_then(|phone| inner.by_phone.get(phone)) {
            ids.extend(matches.iter().copied());
        }
        Ok(inner.live(ids))
    }

    fn find_cluster(&self, primary_id: ContactId) -> Result<Vec<Contact>> {
        let inner = self.inner.read();
        let members = inner
            .by_link
            .get(&primary_id)
            .into_iter()
            .flat_map(|members| members.iter().copied());
        Ok(inner.live(std::iter::once(primary_id).chain(members)))
    }

    fn get(&self, id: ContactId) -> Result<Option<Contact>> {
        Ok(self.inner.read().contacts.get(&id).cloned())
    }

    fn create(&self, contact: NewContact) -> Result<Contact> {
        check_link_shape(None, contact.link_precedence, contact.linked_id)?;
        let mut inner = self.inner.write();
        let now = self.clock.now();
        let stored = Contact {
            id: ContactId(inner.next_id),
            email: contact.email,
            phone_number: contact.phone_number,
            linked_id: contact.linked_id,
            link_precedence: contact.link_precedence,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        inner.insert(stored.clone());
        Ok(stored)
    }

    fn save_all(&self, contacts: Vec<Contact>) -> Result<Vec<Contact>> {
        let mut inner = self.inner.write();
        let now = self.clock.now();
        // Validate everything before touching the maps so a rejected batch leaves no trace.
        let prepared = contacts
            .into_iter()
            .map(|contact| {
                let existing = inner.contacts.get(&contact.id);
                prepare_update(existing, contact, now).map(|c| (existing.is_some(), c))
            })
            .collect::<Result<Vec<_>>>()?;
        let mut saved = Vec::with_capacity(prepared.len());
        for (exists, contact) in prepared {
            if exists {
                inner.replace(contact.clone());
            } else {
                inner.insert(contact.clone());
            }
            saved.push(contact);
        }
        Ok(saved)
    }

    fn all(&self) -> Result<Vec<Contact>> {
        let inner = self.inner.read();
        let mut contacts: Vec<Contact> = inner.contacts.values().cloned().collect();
        contacts.sort_by(by_creation);
        Ok(contacts)
    }

    fn len(&self) -> usize {
        self.inner.read().contacts.len()
    }
}
