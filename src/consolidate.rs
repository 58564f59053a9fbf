//! Projection of a cluster into the externally visible identity summary.

use crate::model::{by_creation, ConsolidatedContact, Contact};
use hashbrown::HashSet;

/// Build the summary for `cluster` rooted at `primary`.
///
/// The primary's own email and phone lead their lists; the remaining values
/// follow in first-seen order over the cluster sorted by creation. Secondary
/// ids are listed in creation order. Deleted contacts are skipped.
pub fn consolidate(primary: &Contact, cluster: &[Contact]) -> ConsolidatedContact {
    let mut members: Vec<&Contact> = cluster.iter().filter(|c| !c.is_deleted()).collect();
    members.sort_by(|a, b| by_creation(a, b));

    let emails = ordered_distinct(
        primary.email.as_deref(),
        members.iter().filter_map(|c| c.email.as_deref()),
    );
    let phone_numbers = ordered_distinct(
        primary.phone_number.as_deref(),
        members.iter().filter_map(|c| c.phone_number.as_deref()),
    );
    let secondary_contact_ids = members
        .iter()
        .filter(|c| !c.is_primary() && c.id != primary.id)
        .map(|c| c.id)
        .collect();

    ConsolidatedContact {
        primary_contact_id: primary.id,
        emails,
        phone_numbers,
        secondary_contact_ids,
    }
}

fn ordered_distinct<'a>(
    lead: Option<&'a str>,
    values: impl Iterator<Item = &'a str>,
) -> Vec<String> {
    let mut seen = HashSet::new();
    lead.into_iter()
        .chain(values)
        .filter(|value| !value.is_empty())
        .filter(|value| seen.insert(*value))
        .map(str::to_string)
        .collect()
}
