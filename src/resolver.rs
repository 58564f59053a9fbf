//! # Cluster Resolver
//!
//! Lifts a match set to the cluster roots it touches and picks the canonical
//! primary: the root with the smallest `(created_at, id)`. Every other root is
//! a separate cluster that has to be merged into it.

use crate::error::{ReconcileError, ReconcileResult};
use crate::model::{by_creation, Contact, ContactId};
use crate::store::ContactStore;
use hashbrown::HashMap;
use std::collections::BTreeSet;
use tracing::debug;

/// Outcome of resolving one match set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Canonical primary for this reconciliation.
    pub primary: Contact,
    /// Other live primaries reached by the match set, ascending by creation.
    pub other_primaries: Vec<Contact>,
}

impl Resolution {
    pub fn needs_merge(&self) -> bool {
        !self.other_primaries.is_empty()
    }
}

/// Ids of the roots the contacts in `matches` point at, ascending and deduplicated.
///
/// Read from the matches alone, without loading the roots, so it can name the
/// cluster locks before any root is read. A root may have been demoted since
/// `matches` was read; that shows up as a changed match set once the locks are held.
pub fn claimed_root_ids(matches: &[Contact]) -> ReconcileResult<Vec<ContactId>> {
    let mut ids = BTreeSet::new();
    for contact in matches {
        let root = if contact.is_primary() {
            contact.id
        } else {
            contact.linked_id.ok_or_else(|| {
                ReconcileError::invariant(format!(
                    "secondary contact {} has no linked_id",
                    contact.id
                ))
            })?
        };
        ids.insert(root);
    }
    Ok(ids.into_iter().collect())
}

/// Root contact of every cluster touched by `matches`, ascending by creation.
///
/// Primaries in the set are their own roots. A secondary's root is loaded by
/// `linked_id` and must be a live primary.
pub fn cluster_roots(
    store: &dyn ContactStore,
    matches: &[Contact],
) -> ReconcileResult<Vec<Contact>> {
    let mut roots: HashMap<ContactId, Contact> = HashMap::new();
    for contact in matches.iter().filter(|c| c.is_primary()) {
        roots.insert(contact.id, contact.clone());
    }
    for contact in matches.iter().filter(|c| !c.is_primary()) {
        let root_id = contact.linked_id.ok_or_else(|| {
            ReconcileError::invariant(format!("secondary contact {} has no linked_id", contact.id))
        })?;
        if roots.contains_key(&root_id) {
            continue;
        }
        let root = store.get(root_id)?.ok_or_else(|| {
            ReconcileError::invariant(format!(
                "contact {} links to missing contact {root_id}",
                contact.id
            ))
        })?;
        if root.is_deleted() || !root.is_primary() {
            return Err(ReconcileError::invariant(format!(
                "contact {} links to {root_id}, which is not a live primary",
                contact.id
            )));
        }
        roots.insert(root_id, root);
    }

    let mut roots: Vec<Contact> = roots.into_values().collect();
    roots.sort_by(by_creation);
    Ok(roots)
}

/// Resolve a non-empty match set into its canonical primary and the clusters to merge.
///
/// Every link must hold, so call it with the claimed clusters locked.
pub fn resolve(store: &dyn ContactStore, matches: &[Contact]) -> ReconcileResult<Resolution> {
    let mut roots = cluster_roots(store, matches)?.into_iter();
    let primary = roots
        .next()
        .ok_or_else(|| ReconcileError::invariant("cannot resolve an empty match set"))?;
    let other_primaries: Vec<Contact> = roots.collect();
    debug!(
        primary = %primary.id,
        others = other_primaries.len(),
        matched = matches.len(),
        "resolved cluster"
    );
    Ok(Resolution {
        primary,
        other_primaries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{NewContact, Observation};
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn store() -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        (MemoryStore::with_clock(clock.clone()), clock)
    }

    #[test]
    fn single_primary_resolves_to_itself() {
        let (store, _) = store();
        let a = store
            .create(NewContact::primary(&Observation::email("a@x.io")))
            .unwrap();
        let resolution = resolve(&store, std::slice::from_ref(&a)).unwrap();
        assert_eq!(resolution.primary, a);
        assert!(!resolution.needs_merge());
    }

    #[test]
    fn earliest_primary_wins() {
        let (store, clock) = store();
        clock.set(100);
        let younger_seen_first = store
            .create(NewContact::primary(&Observation::phone("2")))
            .unwrap();
        clock.set(10);
        let older = store
            .create(NewContact::primary(&Observation::email("a@x.io")))
            .unwrap();
        assert!(older.id > younger_seen_first.id);

        let resolution =
            resolve(&store, &[younger_seen_first.clone(), older.clone()]).unwrap();
        assert_eq!(resolution.primary.id, older.id);
        assert_eq!(resolution.other_primaries, vec![younger_seen_first]);
    }

    #[test]
    fn equal_timestamps_break_ties_by_id() {
        let (store, _) = store();
        let first = store
            .create(NewContact::primary(&Observation::email("a@x.io")))
            .unwrap();
        let second = store
            .create(NewContact::primary(&Observation::phone("1")))
            .unwrap();
        assert_eq!(first.created_at, second.created_at);

        let resolution = resolve(&store, &[second.clone(), first.clone()]).unwrap();
        assert_eq!(resolution.primary.id, first.id);
        assert_eq!(resolution.other_primaries, vec![second]);
    }

    #[test]
    fn secondary_match_lifts_to_its_primary() {
        let (store, clock) = store();
        let a = store
            .create(NewContact::primary(&Observation::email("a@x.io")))
            .unwrap();
        clock.advance(1);
        let a_child = store
            .create(NewContact::secondary(&Observation::phone("7"), a.id))
            .unwrap();
        clock.advance(1);
        let b = store
            .create(NewContact::primary(&Observation::email("b@x.io")))
            .unwrap();

        let resolution = resolve(&store, &[a_child, b.clone()]).unwrap();
        assert_eq!(resolution.primary.id, a.id);
        assert_eq!(resolution.other_primaries, vec![b]);
    }

    #[test]
    fn dangling_link_is_an_invariant_violation() {
        let (store, _) = store();
        let orphan = store
            .create(NewContact::secondary(&Observation::phone("7"), ContactId(99)))
            .unwrap();
        let err = resolve(&store, &[orphan]).unwrap_err();
        assert!(matches!(err, ReconcileError::InvariantViolation(_)));
    }

    #[test]
    fn chained_link_is_an_invariant_violation() {
        let (store, _) = store();
        let a = store
            .create(NewContact::primary(&Observation::email("a@x.io")))
            .unwrap();
        let middle = store
            .create(NewContact::secondary(&Observation::phone("1"), a.id))
            .unwrap();
        let tail = store
            .create(NewContact::secondary(&Observation::phone("2"), middle.id))
            .unwrap();
        let err = resolve(&store, &[tail]).unwrap_err();
        assert!(matches!(err, ReconcileError::InvariantViolation(_)));
    }

    #[test]
    fn claimed_roots_come_from_links_without_reads() {
        let (store, clock) = store();
        let a = store
            .create(NewContact::primary(&Observation::email("a@x.io")))
            .unwrap();
        clock.advance(1);
        let b = store
            .create(NewContact::primary(&Observation::phone("222222")))
            .unwrap();
        clock.advance(1);
        let b_child = store
            .create(NewContact::secondary(&Observation::email("e5@x.io"), b.id))
            .unwrap();
        let a_child = store
            .create(NewContact::secondary(&Observation::phone("1"), a.id))
            .unwrap();

        let claimed = claimed_root_ids(&[b_child.clone(), a_child, a.clone()]).unwrap();
        assert_eq!(claimed, vec![a.id, b.id]);

        // A demoted root is still claimed; only resolving it fails.
        let mut demoted = b.clone();
        demoted.link_to(a.id);
        store.save(demoted).unwrap();
        assert_eq!(
            claimed_root_ids(std::slice::from_ref(&b_child)).unwrap(),
            vec![b.id]
        );
        let err = resolve(&store, &[b_child]).unwrap_err();
        assert!(matches!(err, ReconcileError::InvariantViolation(_)));
    }

    #[test]
    fn empty_match_set_is_rejected() {
        let (store, _) = store();
        assert!(resolve(&store, &[]).is_err());
    }
}
