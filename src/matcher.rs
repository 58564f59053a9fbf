//! Candidate lookup: every live contact sharing the observation's email or phone.

use crate::model::{Contact, Observation};
use crate::store::ContactStore;
use anyhow::Result;

/// Contacts whose email or phone equals the observation's, ascending by creation.
///
/// Returns an empty set for an observation with no attributes.
pub fn find_matches(store: &dyn ContactStore, observation: &Observation) -> Result<Vec<Contact>> {
    if observation.is_empty() {
        return Ok(Vec::new());
    }
    store.find_by_email_or_phone(observation.email_ref(), observation.phone_ref())
}

/// Same `(id, precedence, link)` shape for two match sets.
///
/// Used to detect that a match set changed while waiting for cluster locks.
pub fn same_shape(left: &[Contact], right: &[Contact]) -> bool {
    left.len() == right.len()
        && left.iter().zip(right).all(|(l, r)| {
            l.id == r.id && l.link_precedence == r.link_precedence && l.linked_id == r.linked_id
        })
}
