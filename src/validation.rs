//! Request validation for the identify boundary.
//!
//! Syntax checks only; matching never normalizes values.

use crate::error::{ReconcileError, ReconcileResult};
use crate::model::Observation;
use once_cell::sync::Lazy;
use regex::Regex;

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern compiles")
});

/// Optional leading `+`, then digits with single spaces or dashes between them.
static PHONE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\+?[0-9]+(?:[ \-][0-9]+)*$").expect("phone pattern compiles"));

pub const MAX_EMAIL_LEN: usize = 254;
pub const MIN_PHONE_DIGITS: usize = 6;
pub const MAX_PHONE_DIGITS: usize = 20;

pub fn validate_email(email: &str) -> ReconcileResult<()> {
    if email.len() > MAX_EMAIL_LEN {
        return Err(ReconcileError::invalid_input(format!(
            "email must be at most {MAX_EMAIL_LEN} characters"
        )));
    }
    if !EMAIL_RE.is_match(email) {
        return Err(ReconcileError::invalid_input(format!(
            "email {email:?} is not a valid address"
        )));
    }
    Ok(())
}

pub fn validate_phone(phone: &str) -> ReconcileResult<()> {
    let digits = phone.chars().filter(char::is_ascii_digit).count();
    if !PHONE_RE.is_match(phone) || !(MIN_PHONE_DIGITS..=MAX_PHONE_DIGITS).contains(&digits) {
        return Err(ReconcileError::invalid_input(format!(
            "phoneNumber {phone:?} must contain {MIN_PHONE_DIGITS}-{MAX_PHONE_DIGITS} digits"
        )));
    }
    Ok(())
}

/// Require at least one attribute and check the syntax of each one present.
pub fn validate_observation(observation: &Observation) -> ReconcileResult<()> {
    if observation.is_empty() {
        return Err(ReconcileError::invalid_input(
            "at least one of email or phoneNumber is required",
        ));
    }
    if let Some(email) = observation.email_ref() {
        validate_email(email)?;
    }
    if let Some(phone) = observation.phone_ref() {
        validate_phone(phone)?;
    }
    Ok(())
}
