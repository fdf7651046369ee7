//! # Classify
//!
//! Decides whether an inbound analytics event should update a Zendesk user and, if so,
//! which email address identifies that user.
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use thiserror::Error;
use zendesk_common::config::SessionConfig;

static EMAIL_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"^(([^<>()\[\]\\.,;:\s@"]+(\.[^<>()\[\]\\.,;:\s@"]+)*)|(".+"))@((\[[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}\.[0-9]{1,3}\])|(([a-zA-Z\-0-9]+\.)+[a-zA-Z]{2,}))$"#,
    )
    .expect("email pattern must compile")
});

/// An event as delivered by the analytics event stream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct InboundEvent {
    pub event: String,
    pub distinct_id: String,
    #[serde(default)]
    pub sent_at: Option<Value>,
    #[serde(default, rename = "$set")]
    pub set: Option<Map<String, Value>>,
    #[serde(default)]
    pub properties: Option<Map<String, Value>>,
}

/// Why an event was not forwarded. None of these are failures.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationSkip {
    #[error("event {0} is not a triggering event")]
    NotTriggering(String),
    #[error("no email found on event")]
    NoEmail,
    #[error("email domain {0} is ignored")]
    IgnoredDomain(String),
}

impl ValidationSkip {
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationSkip::NotTriggering(_) => "not_triggering",
            ValidationSkip::NoEmail => "no_email",
            ValidationSkip::IgnoredDomain(_) => "ignored_domain",
        }
    }
}

/// Case-insensitive syntactic check, local part and domain only.
pub fn is_email(candidate: &str) -> bool {
    EMAIL_PATTERN.is_match(&candidate.to_lowercase())
}

/// Candidate email in order of precedence: the distinct id, `$set.email`, then
/// `properties.email`. Only a missing `email` key moves on to the next bag; an `email`
/// that is present but not an address ends the search.
pub fn extract_email(event: &InboundEvent) -> Option<&str> {
    if is_email(&event.distinct_id) {
        return Some(&event.distinct_id);
    }

    let candidate = [event.set.as_ref(), event.properties.as_ref()]
        .into_iter()
        .flatten()
        .find_map(|bag| bag.get("email"))?;

    candidate.as_str().filter(|email| is_email(email))
}

pub fn classify(event: &InboundEvent, session: &SessionConfig) -> Result<String, ValidationSkip> {
    if !session.triggering_events.contains(&event.event) {
        return Err(ValidationSkip::NotTriggering(event.event.clone()));
    }

    let email = extract_email(event).ok_or(ValidationSkip::NoEmail)?;

    let domain = email.split_once('@').map_or("", |(_, domain)| domain);
    if session.ignored_email_domains.contains(domain) {
        return Err(ValidationSkip::IgnoredDomain(domain.to_owned()));
    }

    Ok(email.to_owned())
}
