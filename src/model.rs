//! # Data Model
//!
//! Contacts, the observations that feed reconciliation, and the consolidated
//! identity returned to callers.

use crate::clock::{format_timestamp, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Store-assigned contact identifier. Strictly increasing in creation order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ContactId(pub u64);

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a contact within its cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkPrecedence {
    Primary,
    Secondary,
}

impl fmt::Display for LinkPrecedence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkPrecedence::Primary => write!(f, "primary"),
            LinkPrecedence::Secondary => write!(f, "secondary"),
        }
    }
}

/// A stored contact fragment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    /// Set iff `link_precedence` is `Secondary`.
    pub linked_id: Option<ContactId>,
    pub link_precedence: LinkPrecedence,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub deleted_at: Option<Timestamp>,
}

impl Contact {
    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    /// Total creation order key: timestamp first, insertion order on ties.
    pub fn creation_key(&self) -> (Timestamp, ContactId) {
        (self.created_at, self.id)
    }

    /// Demote to a secondary of `primary`.
    pub(crate) fn link_to(&mut self, primary: ContactId) {
        self.link_precedence = LinkPrecedence::Secondary;
        self.linked_id = Some(primary);
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "contact {} ({}{}) email={} phone={} created={}",
            self.id,
            self.link_precedence,
            self.linked_id
                .map(|id| format!(" -> {id}"))
                .unwrap_or_default(),
            self.email.as_deref().unwrap_or("-"),
            self.phone_number.as_deref().unwrap_or("-"),
            format_timestamp(self.created_at),
        )
    }
}

/// Orders contacts ascending by `(created_at, id)`.
pub fn by_creation(a: &Contact, b: &Contact) -> Ordering {
    a.creation_key().cmp(&b.creation_key())
}

/// Contact fields supplied by the caller of `ContactStore::create`; the store
/// assigns the id and timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContact {
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub linked_id: Option<ContactId>,
    pub link_precedence: LinkPrecedence,
}

impl NewContact {
    pub fn primary(observation: &Observation) -> Self {
        Self {
            email: observation.email.clone(),
            phone_number: observation.phone_number.clone(),
            linked_id: None,
            link_precedence: LinkPrecedence::Primary,
        }
    }

    pub fn secondary(observation: &Observation, primary: ContactId) -> Self {
        Self {
            email: observation.email.clone(),
            phone_number: observation.phone_number.clone(),
            linked_id: Some(primary),
            link_precedence: LinkPrecedence::Secondary,
        }
    }
}

/// One incoming `(email?, phoneNumber?)` fact.
///
/// Values are kept verbatim; matching is exact equality. Blank strings are
/// treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Observation {
    pub email: Option<String>,
    pub phone_number: Option<String>,
}

impl Observation {
    pub fn new(email: Option<String>, phone_number: Option<String>) -> Self {
        Self {
            email: non_blank(email),
            phone_number: non_blank(phone_number),
        }
    }

    pub fn email(email: impl Into<String>) -> Self {
        Self::new(Some(email.into()), None)
    }

    pub fn phone(phone_number: impl Into<String>) -> Self {
        Self::new(None, Some(phone_number.into()))
    }

    pub fn both(email: impl Into<String>, phone_number: impl Into<String>) -> Self {
        Self::new(Some(email.into()), Some(phone_number.into()))
    }

    pub fn is_empty(&self) -> bool {
        self.email.is_none() && self.phone_number.is_none()
    }

    pub fn email_ref(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn phone_ref(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "(email={}, phone={})",
            self.email.as_deref().unwrap_or("-"),
            self.phone_number.as_deref().unwrap_or("-")
        )
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Externally visible summary of one identity cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsolidatedContact {
    pub primary_contact_id: ContactId,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub secondary_contact_ids: Vec<ContactId>,
}

/// Reconciliation result, shaped as `{ "contact": { ... } }` on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyResponse {
    pub contact: ConsolidatedContact,
}
