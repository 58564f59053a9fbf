//! # Persistent Store
//!
//! RocksDB-backed `ContactStore`. Contacts live in their own column family
//! keyed by big-endian id; email, phone and link lookups go through prefix
//! indexes. Every create and every `save_all` is a single `WriteBatch`, so a
//! merge is either fully applied or not at all.

use crate::clock::{Clock, SystemClock, Timestamp};
use crate::config::DEFAULT_CACHE_CAPACITY;
use crate::model::{by_creation, Contact, ContactId, NewContact};
use crate::store::{check_link_shape, prepare_update, ContactStore};
use anyhow::{anyhow, Result};
use lru::LruCache;
use parking_lot::Mutex;
use rocksdb::{
    checkpoint::Checkpoint, ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode,
    Options, WriteBatch, DB,
};
use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

const CF_CONTACTS: &str = "contacts";
const CF_METADATA: &str = "metadata";
const CF_INDEX_EMAIL: &str = "index_email";
const CF_INDEX_PHONE: &str = "index_phone";
const CF_INDEX_LINK: &str = "index_link";

const KEY_NEXT_CONTACT_ID: &[u8] = b"next_contact_id";
const KEY_MANIFEST: &[u8] = b"manifest";

const STORAGE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StorageManifest {
    format_version: u32,
    app_version: String,
}

#[derive(Debug, Clone, Copy)]
pub struct PersistentOpenOptions {
    pub repair: bool,
    pub cache_capacity: usize,
}

impl Default for PersistentOpenOptions {
    fn default() -> Self {
        Self {
            repair: false,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

/// Writer-side state, guarded by one mutex so id assignment and batches are serialized.
#[derive(Debug)]
struct WriteState {
    next_id: u64,
    /// Highest timestamp issued so far; keeps creation order stable across restarts.
    last_timestamp: Timestamp,
}

pub struct PersistentStore {
    db: DB,
    cache: Mutex<LruCache<ContactId, Contact>>,
    writer: Mutex<WriteState>,
    clock: Arc<dyn Clock>,
    len: AtomicUsize,
}

impl PersistentStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, PersistentOpenOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: PersistentOpenOptions,
    ) -> Result<Self> {
        Self::open_with_clock(path, options, Arc::new(SystemClock::new()))
    }

    pub fn open_with_clock(
        path: impl AsRef<Path>,
        options: PersistentOpenOptions,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        if options.repair {
            repair_db(path.as_ref())?;
        }
        let db = open_db(path.as_ref())?;
        validate_or_init_manifest(&db)?;

        let (count, max_id, last_timestamp) = scan_contacts(&db)?;
        let stored_next = load_metadata::<u64>(&db, KEY_NEXT_CONTACT_ID)?.unwrap_or(1);
        let next_id = stored_next.max(max_id + 1);
        info!(
            path = %path.as_ref().display(),
            contacts = count,
            next_id,
            "opened persistent contact store"
        );

        let capacity = NonZeroUsize::new(options.cache_capacity.max(1))
            .ok_or_else(|| anyhow!("cache capacity must be positive"))?;
        Ok(Self {
            db,
            cache: Mutex::new(LruCache::new(capacity)),
            writer: Mutex::new(WriteState {
                next_id,
                last_timestamp,
            }),
            clock,
            len: AtomicUsize::new(count),
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| anyhow!("missing {name} column family"))
    }

    /// Read-through lookup. The cache lock is held across the DB read so a
    /// concurrent writer cannot be overtaken by a stale fill.
    fn load_contact(&self, id: ContactId) -> Result<Option<Contact>> {
        let mut cache = self.cache.lock();
        self.load_cached(&mut cache, id)
    }

    fn load_cached(
        &self,
        cache: &mut LruCache<ContactId, Contact>,
        id: ContactId,
    ) -> Result<Option<Contact>> {
        if let Some(contact) = cache.get(&id) {
            return Ok(Some(contact.clone()));
        }
        let contacts_cf = self.cf(CF_CONTACTS)?;
        let Some(bytes) = self.db.get_cf(contacts_cf, id.0.to_be_bytes())? else {
            return Ok(None);
        };
        let contact: Contact = bincode::deserialize(&bytes)?;
        cache.put(id, contact.clone());
        Ok(Some(contact))
    }

    fn scan_ids(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<ContactId>> {
        let cf = self.cf(cf_name)?;
        let mut ids = Vec::new();
        for entry in self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward))
        {
            let (key, _) = entry?;
            if !key.starts_with(prefix) {
                break;
            }
            if let Some(id) = decode_trailing_id(&key) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Loads every id under one cache lock, so the result never mixes
    /// contacts from before and after a committed batch.
    fn live_contacts(&self, ids: impl IntoIterator<Item = ContactId>) -> Result<Vec<Contact>> {
        let mut cache = self.cache.lock();
        let mut contacts = Vec::new();
        for id in ids {
            if let Some(contact) = self.load_cached(&mut cache, id)? {
                if !contact.is_deleted() {
                    contacts.push(contact);
                }
            }
        }
        contacts.sort_by(by_creation);
        Ok(contacts)
    }

    fn put_contact(&self, batch: &mut WriteBatch, contact: &Contact) -> Result<()> {
        let bytes = bincode::serialize(contact)?;
        batch.put_cf(self.cf(CF_CONTACTS)?, contact.id.0.to_be_bytes(), bytes);
        Ok(())
    }

    fn index_attributes(&self, batch: &mut WriteBatch, contact: &Contact) -> Result<()> {
        if let Some(email) = &contact.email {
            batch.put_cf(
                self.cf(CF_INDEX_EMAIL)?,
                encode_string_index(email, contact.id),
                [],
            );
        }
        if let Some(phone) = &contact.phone_number {
            batch.put_cf(
                self.cf(CF_INDEX_PHONE)?,
                encode_string_index(phone, contact.id),
                [],
            );
        }
        Ok(())
    }

    fn index_link(
        &self,
        batch: &mut WriteBatch,
        id: ContactId,
        previous: Option<ContactId>,
        current: Option<ContactId>,
    ) -> Result<()> {
        if previous == current {
            return Ok(());
        }
        let link_cf = self.cf(CF_INDEX_LINK)?;
        if let Some(previous) = previous {
            batch.delete_cf(link_cf, encode_link_index(previous, id));
        }
        if let Some(current) = current {
            batch.put_cf(link_cf, encode_link_index(current, id), []);
        }
        Ok(())
    }

    fn put_next_id(&self, batch: &mut WriteBatch, next_id: u64) -> Result<()> {
        batch.put_cf(
            self.cf(CF_METADATA)?,
            KEY_NEXT_CONTACT_ID,
            bincode::serialize(&next_id)?,
        );
        Ok(())
    }

    /// Write the batch and refresh the cache as one step with respect to readers.
    fn commit(&self, batch: WriteBatch, contacts: &[Contact]) -> Result<()> {
        let mut cache = self.cache.lock();
        self.db.write(batch)?;
        for contact in contacts {
            cache.put(contact.id, contact.clone());
        }
        Ok(())
    }

    fn issue_timestamp(&self, state: &mut WriteState) -> Timestamp {
        let now = self.clock.now().max(state.last_timestamp);
        state.last_timestamp = now;
        now
    }
}

impl ContactStore for PersistentStore {
    fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Vec<Contact>> {
        let mut ids = BTreeSet::new();
        if let Some(email) = email {
            ids.extend(self.scan_ids(CF_INDEX_EMAIL, &encode_string_prefix(email))?);
        }
        if let Some(phone) = phone {
            ids.extend(self.scan_ids(CF_INDEX_PHONE, &encode_string_prefix(phone))?);
        }
        self.live_contacts(ids)
    }

    fn find_cluster(&self, primary_id: ContactId) -> Result<Vec<Contact>> {
        let members = self.scan_ids(CF_INDEX_LINK, &primary_id.0.to_be_bytes())?;
        let mut contacts = self.live_contacts(std::iter::once(primary_id).chain(members))?;
        // The record, not the index, is authoritative for membership.
        contacts.retain(|contact| contact.id == primary_id || contact.linked_id == Some(primary_id));
        Ok(contacts)
    }

    fn get(&self, id: ContactId) -> Result<Option<Contact>> {
        self.load_contact(id)
    }

    fn create(&self, contact: NewContact) -> Result<Contact> {
        check_link_shape(None, contact.link_precedence, contact.linked_id)?;
        let mut state = self.writer.lock();
        let now = self.issue_timestamp(&mut state);
        let stored = Contact {
            id: ContactId(state.next_id),
            email: contact.email,
            phone_number: contact.phone_number,
            linked_id: contact.linked_id,
            link_precedence: contact.link_precedence,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        let mut batch = WriteBatch::default();
        self.put_contact(&mut batch, &stored)?;
        self.index_attributes(&mut batch, &stored)?;
        self.index_link(&mut batch, stored.id, None, stored.linked_id)?;
        self.put_next_id(&mut batch, state.next_id + 1)?;
        self.commit(batch, std::slice::from_ref(&stored))?;

        state.next_id += 1;
        self.len.fetch_add(1, Ordering::Relaxed);
        debug!(id = %stored.id, "persisted new contact");
        Ok(stored)
    }

    fn save_all(&self, contacts: Vec<Contact>) -> Result<Vec<Contact>> {
        let mut state = self.writer.lock();
        let now = self.issue_timestamp(&mut state);

        let mut batch = WriteBatch::default();
        let mut saved = Vec::with_capacity(contacts.len());
        let mut inserted = 0usize;
        let mut next_id = state.next_id;
        for contact in contacts {
            let existing = self.load_contact(contact.id)?;
            let contact = prepare_update(existing.as_ref(), contact, now)?;
            self.put_contact(&mut batch, &contact)?;
            match &existing {
                Some(existing) => {
                    self.index_link(&mut batch, contact.id, existing.linked_id, contact.linked_id)?
                }
                None => {
                    self.index_attributes(&mut batch, &contact)?;
                    self.index_link(&mut batch, contact.id, None, contact.linked_id)?;
                    next_id = next_id.max(contact.id.0 + 1);
                    inserted += 1;
                }
            }
            saved.push(contact);
        }
        if next_id != state.next_id {
            self.put_next_id(&mut batch, next_id)?;
        }
        self.commit(batch, &saved)?;

        state.next_id = next_id;
        self.len.fetch_add(inserted, Ordering::Relaxed);
        Ok(saved)
    }

    fn all(&self) -> Result<Vec<Contact>> {
        let contacts_cf = self.cf(CF_CONTACTS)?;
        let mut contacts = Vec::new();
        for entry in self.db.iterator_cf(contacts_cf, IteratorMode::Start) {
            let (_key, value) = entry?;
            contacts.push(bincode::deserialize::<Contact>(&value)?);
        }
        contacts.sort_by(by_creation);
        Ok(contacts)
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    fn checkpoint(&self, path: &Path) -> Result<()> {
        let checkpoint = Checkpoint::new(&self.db)?;
        checkpoint.create_checkpoint(path)?;
        Ok(())
    }
}

impl Drop for PersistentStore {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn open_db(path: &Path) -> Result<DB> {
    let mut options = Options::default();
    options.create_if_missing(true);
    options.create_missing_column_families(true);
    options.set_paranoid_checks(true);
    let cfs = vec![
        ColumnFamilyDescriptor::new(CF_CONTACTS, Options::default()),
        ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
        ColumnFamilyDescriptor::new(CF_INDEX_EMAIL, Options::default()),
        ColumnFamilyDescriptor::new(CF_INDEX_PHONE, Options::default()),
        ColumnFamilyDescriptor::new(CF_INDEX_LINK, Options::default()),
    ];
    Ok(DB::open_cf_descriptors(&options, path, cfs)?)
}

fn repair_db(path: &Path) -> Result<()> {
    let mut options = Options::default();
    options.create_if_missing(true);
    DB::repair(&options, path)?;
    Ok(())
}

/// Count contacts and find the highest id and timestamp on disk.
fn scan_contacts(db: &DB) -> Result<(usize, u64, Timestamp)> {
    let contacts_cf = db
        .cf_handle(CF_CONTACTS)
        .ok_or_else(|| anyhow!("missing contacts column family"))?;
    let mut count = 0usize;
    let mut max_id = 0u64;
    let mut last_timestamp = Timestamp::MIN;
    for entry in db.iterator_cf(contacts_cf, IteratorMode::Start) {
        let (_key, value) = entry?;
        let contact: Contact = bincode::deserialize(&value)?;
        count += 1;
        max_id = max_id.max(contact.id.0);
        last_timestamp = last_timestamp.max(contact.updated_at.max(contact.created_at));
    }
    Ok((count, max_id, last_timestamp))
}

// Attribute index keys: u32 length | value bytes | u64 contact id.
// The length prefix keeps "ab" from matching a scan for "a".
fn encode_string_prefix(value: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(4 + value.len() + 8);
    key.extend_from_slice(&(value.len() as u32).to_be_bytes());
    key.extend_from_slice(value.as_bytes());
    key
}

fn encode_string_index(value: &str, id: ContactId) -> Vec<u8> {
    let mut key = encode_string_prefix(value);
    key.extend_from_slice(&id.0.to_be_bytes());
    key
}

fn encode_link_index(primary: ContactId, member: ContactId) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&primary.0.to_be_bytes());
    key.extend_from_slice(&member.0.to_be_bytes());
    key
}

fn decode_trailing_id(key: &[u8]) -> Option<ContactId> {
    if key.len() < 8 {
        return None;
    }
    let bytes: [u8; 8] = key[key.len() - 8..].try_into().ok()?;
    Some(ContactId(u64::from_be_bytes(bytes)))
}

fn validate_or_init_manifest(db: &DB) -> Result<()> {
    let metadata_cf = db
        .cf_handle(CF_METADATA)
        .ok_or_else(|| anyhow!("missing metadata column family"))?;
    if let Some(bytes) = db.get_cf(metadata_cf, KEY_MANIFEST)? {
        let manifest: StorageManifest = bincode::deserialize(&bytes)?;
        if manifest.format_version != STORAGE_FORMAT_VERSION {
            return Err(anyhow!(
                "storage format version mismatch: expected {}, found {}",
                STORAGE_FORMAT_VERSION,
                manifest.format_version
            ));
        }
        return Ok(());
    }

    let manifest = StorageManifest {
        format_version: STORAGE_FORMAT_VERSION,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let bytes = bincode::serialize(&manifest)?;
    db.put_cf(metadata_cf, KEY_MANIFEST, bytes)?;
    Ok(())
}

fn load_metadata<T: serde::de::DeserializeOwned>(db: &DB, key: &[u8]) -> Result<Option<T>> {
    let metadata_cf = db
        .cf_handle(CF_METADATA)
        .ok_or_else(|| anyhow!("missing metadata column family"))?;
    if let Some(bytes) = db.get_cf(metadata_cf, key)? {
        Ok(Some(bincode::deserialize(&bytes)?))
    } else {
        Ok(None)
    }
}
