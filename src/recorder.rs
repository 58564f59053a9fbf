//! Fact recording: persist an observation as a secondary when it adds information.

use crate::model::{Contact, ContactId, NewContact, Observation};
use crate::store::ContactStore;
use anyhow::Result;
use tracing::info;

/// True iff the observation carries an email or phone absent from `matches`.
pub fn has_new_info(matches: &[Contact], observation: &Observation) -> bool {
    let new_email = observation.email_ref().is_some_and(|email| {
        !matches
            .iter()
            .any(|contact| contact.email.as_deref() == Some(email))
    });
    let new_phone = observation.phone_ref().is_some_and(|phone| {
        !matches
            .iter()
            .any(|contact| contact.phone_number.as_deref() == Some(phone))
    });
    new_email || new_phone
}

/// Insert the observation as a secondary of `primary` if it adds information.
///
/// Returns the created contact, or `None` when nothing was written.
pub fn record_if_new(
    store: &dyn ContactStore,
    matches: &[Contact],
    observation: &Observation,
    primary: ContactId,
) -> Result<Option<Contact>> {
    if !has_new_info(matches, observation) {
        return Ok(None);
    }
    let created = store.create(NewContact::secondary(observation, primary))?;
    info!(
        id = %created.id,
        primary = %primary,
        "recorded new secondary contact"
    );
    Ok(Some(created))
}
