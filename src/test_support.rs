//! Seeded observation generators and a whole-store invariant check, shared by
//! tests and benches.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;

use crate::model::{by_creation, Contact, ContactId, LinkPrecedence, Observation};
use crate::store::ContactStore;

/// Emails and phones drawn from when an observation overlaps earlier ones.
const SHARED_POOL: u32 = 64;

/// Generate `count` observations. With `overlap_probability` each attribute is
/// taken from a small shared pool, otherwise it is unique to the observation.
pub fn generate_observations(count: u32, overlap_probability: f64, seed: u64) -> Vec<Observation> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut observations = Vec::with_capacity(count as usize);

    for i in 1..=count {
        let email = if rng.random_bool(overlap_probability) {
            format!("shared_{:03}@example.com", rng.random_range(0..SHARED_POOL))
        } else {
            format!("person_{:06}@example.com", i)
        };
        let phone = if rng.random_bool(overlap_probability) {
            format!("555{:04}", rng.random_range(0..SHARED_POOL))
        } else {
            format!("9{:09}", i)
        };

        let observation = match rng.random_range(0..4) {
            0 => Observation::email(email),
            1 => Observation::phone(phone),
            _ => Observation::both(email, phone),
        };
        observations.push(observation);
    }

    observations
}

/// Check the linkage invariants over every live contact in `store`:
/// primaries carry no link, secondaries link to a live primary, and each
/// primary is the earliest contact of its cluster.
pub fn check_invariants(store: &dyn ContactStore) -> Result<(), String> {
    let contacts = store.all().map_err(|e| format!("{e:#}"))?;
    let by_id: BTreeMap<ContactId, &Contact> = contacts.iter().map(|c| (c.id, c)).collect();
    let mut clusters: BTreeMap<ContactId, Vec<&Contact>> = BTreeMap::new();

    for contact in contacts.iter().filter(|c| !c.is_deleted()) {
        match (contact.link_precedence, contact.linked_id) {
            (LinkPrecedence::Primary, None) => {
                clusters.entry(contact.id).or_default().push(contact);
            }
            (LinkPrecedence::Primary, Some(linked)) => {
                return Err(format!("primary {} links to {linked}", contact.id));
            }
            (LinkPrecedence::Secondary, None) => {
                return Err(format!("secondary {} has no link", contact.id));
            }
            (LinkPrecedence::Secondary, Some(linked)) => match by_id.get(&linked) {
                Some(root) if root.is_primary() && !root.is_deleted() => {
                    clusters.entry(linked).or_default().push(contact);
                }
                Some(_) => {
                    return Err(format!(
                        "secondary {} links to {linked}, which is not a live primary",
                        contact.id
                    ));
                }
                None => {
                    return Err(format!("secondary {} links to missing {linked}", contact.id));
                }
            },
        }
    }

    for (primary, members) in clusters {
        let earliest = members
            .iter()
            .copied()
            .min_by(|a, b| by_creation(a, b))
            .map(|c| c.id);
        if earliest != Some(primary) {
            return Err(format!(
                "cluster {primary} has an earlier member {}",
                earliest.map(|id| id.to_string()).unwrap_or_default()
            ));
        }
    }

    Ok(())
}
