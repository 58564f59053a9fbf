//! # Cluster Merger
//!
//! Union-by-earliest-root over contact clusters. Every cluster other than the
//! one rooted at the oldest primary is folded into it: the younger root is
//! demoted and each of its secondaries is re-pointed at the elder root, so the
//! result is a flat star with no link chains. All changes go to the store in a
//! single `save_all`.

use crate::error::{ReconcileError, ReconcileResult};
use crate::model::{by_creation, Contact, ContactId};
use crate::store::ContactStore;
use tracing::info;

/// Contacts changed by one merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub canonical: ContactId,
    /// Former primaries, now secondaries of `canonical`.
    pub demoted: Vec<ContactId>,
    /// Former secondaries of a demoted primary, re-pointed at `canonical`.
    pub relinked: Vec<ContactId>,
}

/// Oldest of the given primaries.
pub fn elect_canonical<'a>(primary: &'a Contact, others: &'a [Contact]) -> &'a Contact {
    std::iter::once(primary)
        .chain(others)
        .min_by(|a, b| by_creation(a, b))
        .unwrap_or(primary)
}

/// Every contact update needed to fold the clusters rooted at `roots` into `canonical`.
///
/// Loads each younger cluster fresh from the store so that secondaries created
/// since the match set was read are carried along.
pub fn plan_merge(
    store: &dyn ContactStore,
    canonical: &Contact,
    roots: &[Contact],
) -> ReconcileResult<(Vec<Contact>, MergeReport)> {
    let mut updates = Vec::new();
    let mut report = MergeReport {
        canonical: canonical.id,
        demoted: Vec::new(),
        relinked: Vec::new(),
    };
    for root in roots.iter().filter(|root| root.id != canonical.id) {
        let cluster = store.find_cluster(root.id)?;
        let current_root = cluster
            .iter()
            .find(|contact| contact.id == root.id)
            .ok_or_else(|| {
                ReconcileError::invariant(format!("primary {} vanished before merge", root.id))
            })?;
        if !current_root.is_primary() {
            return Err(ReconcileError::invariant(format!(
                "contact {} is no longer primary at merge time",
                root.id
            )));
        }
        for mut member in cluster {
            if member.id == root.id {
                report.demoted.push(member.id);
            } else {
                report.relinked.push(member.id);
            }
            member.link_to(canonical.id);
            updates.push(member);
        }
    }
    Ok((updates, report))
}

/// Merge the clusters rooted at `primary` and `others` into the one rooted at the oldest.
pub fn merge_clusters(
    store: &dyn ContactStore,
    primary: &Contact,
    others: &[Contact],
) -> ReconcileResult<(Contact, MergeReport)> {
    let canonical = elect_canonical(primary, others).clone();
    let roots: Vec<Contact> = std::iter::once(primary.clone())
        .chain(others.iter().cloned())
        .collect();
    let (updates, report) = plan_merge(store, &canonical, &roots)?;
    if updates.is_empty() {
        return Ok((canonical, report));
    }
    store.save_all(updates)?;
    info!(
        canonical = %canonical.id,
        demoted = ?report.demoted,
        relinked = report.relinked.len(),
        "merged contact clusters"
    );
    Ok((canonical, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::model::{LinkPrecedence, NewContact, Observation};
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn store() -> (MemoryStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        (MemoryStore::with_clock(clock.clone()), clock)
    }

    #[test]
    fn elect_prefers_oldest_even_when_passed_as_other() {
        let (store, clock) = store();
        clock.set(50);
        let young = store
            .create(NewContact::primary(&Observation::email("y@x.io")))
            .unwrap();
        clock.set(5);
        let old = store
            .create(NewContact::primary(&Observation::email("o@x.io")))
            .unwrap();
        let others = [old.clone()];
        assert_eq!(elect_canonical(&young, &others).id, old.id);
    }

    #[test]
    fn merge_flattens_younger_cluster() {
        let (store, clock) = store();
        let a = store
            .create(NewContact::primary(&Observation::email("a@x.io")))
            .unwrap();
        clock.advance(1);
        let b = store
            .create(NewContact::primary(&Observation::phone("2")))
            .unwrap();
        clock.advance(1);
        let b1 = store
            .create(NewContact::secondary(&Observation::both("b1@x.io", "2"), b.id))
            .unwrap();
        clock.advance(1);
        let b2 = store
            .create(NewContact::secondary(&Observation::both("b2@x.io", "2"), b.id))
            .unwrap();

        let (canonical, report) = merge_clusters(&store, &a, &[b.clone()]).unwrap();
        assert_eq!(canonical.id, a.id);
        assert_eq!(report.canonical, a.id);
        assert_eq!(report.demoted, vec![b.id]);
        assert_eq!(report.relinked, vec![b1.id, b2.id]);

        for id in [b.id, b1.id, b2.id] {
            let contact = store.get(id).unwrap().unwrap();
            assert_eq!(contact.link_precedence, LinkPrecedence::Secondary);
            assert_eq!(contact.linked_id, Some(a.id));
        }
        assert!(store.find_cluster(b.id).unwrap().len() == 1);
        assert_eq!(store.find_cluster(a.id).unwrap().len(), 4);
    }

    #[test]
    fn merge_targets_oldest_when_primary_is_younger() {
        let (store, clock) = store();
        clock.set(10);
        let old = store
            .create(NewContact::primary(&Observation::email("o@x.io")))
            .unwrap();
        clock.set(20);
        let young = store
            .create(NewContact::primary(&Observation::phone("3")))
            .unwrap();

        let (canonical, report) = merge_clusters(&store, &young, &[old.clone()]).unwrap();
        assert_eq!(canonical.id, old.id);
        assert_eq!(report.demoted, vec![young.id]);
        assert!(store.get(old.id).unwrap().unwrap().is_primary());
        assert_eq!(store.get(young.id).unwrap().unwrap().linked_id, Some(old.id));
    }

    #[test]
    fn merging_three_clusters_leaves_one_primary() {
        let (store, clock) = store();
        let mut roots = Vec::new();
        for i in 0..3 {
            clock.advance(1);
            let root = store
                .create(NewContact::primary(&Observation::email(format!("{i}@x.io"))))
                .unwrap();
            store
                .create(NewContact::secondary(&Observation::phone(format!("{i}")), root.id))
                .unwrap();
            roots.push(root);
        }

        let others = [roots[0].clone(), roots[2].clone()];
        let (canonical, report) = merge_clusters(&store, &roots[1], &others).unwrap();
        assert_eq!(canonical.id, roots[0].id);
        assert_eq!(report.demoted.len(), 2);
        assert_eq!(report.relinked.len(), 2);

        let primaries: Vec<Contact> = store
            .all()
            .unwrap()
            .into_iter()
            .filter(|c| c.is_primary())
            .collect();
        assert_eq!(primaries.len(), 1);
        assert!(store
            .all()
            .unwrap()
            .iter()
            .filter(|c| !c.is_primary())
            .all(|c| c.linked_id == Some(roots[0].id)));
    }

    #[test]
    fn stale_root_is_an_invariant_violation() {
        let (store, clock) = store();
        let a = store
            .create(NewContact::primary(&Observation::email("a@x.io")))
            .unwrap();
        clock.advance(1);
        let b = store
            .create(NewContact::primary(&Observation::email("b@x.io")))
            .unwrap();
        clock.advance(1);
        let c = store
            .create(NewContact::primary(&Observation::email("c@x.io")))
            .unwrap();
        let mut demoted = c.clone();
        demoted.link_to(b.id);
        store.save(demoted).unwrap();

        let err = merge_clusters(&store, &a, &[c]).unwrap_err();
        assert!(matches!(err, ReconcileError::InvariantViolation(_)));
        assert!(store.get(b.id).unwrap().unwrap().is_primary());
    }
}
