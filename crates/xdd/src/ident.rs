//! Identifier minting for requirements, acceptance criteria, and changelog
//! events.
//!
//! Tokens are drawn from the thread-local CSPRNG over a 64-symbol URL-safe
//! alphabet. At 12 symbols that is 72 bits of entropy, far beyond what a
//! single project (at most a few thousand events) can collide on.

use rand::Rng;

use crate::types::{CriterionId, EventId, RequirementId, ValidationError, validate_category};

const ALPHABET: &[u8; 64] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789_-";

/// Token length used for freshly minted identifiers.
pub const TOKEN_LEN: usize = 12;

fn token() -> String {
    let mut rng = rand::rng();
    (0..TOKEN_LEN)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}

/// Mint a requirement identifier embedding `category`.
///
/// Fails only if the category itself is not 1-20 uppercase alphanumerics.
pub fn new_requirement_id(category: &str) -> Result<RequirementId, ValidationError> {
    validate_category(category)?;
    let id = format!("REQ-{category}-{}", token());
    Ok(RequirementId::parse(id).expect("minted requirement id matches its own grammar"))
}

/// Mint an acceptance-criterion identifier.
pub fn new_criterion_id() -> CriterionId {
    CriterionId::parse(format!("AC-{}", token()))
        .expect("minted criterion id matches its own grammar")
}

/// Mint a changelog event identifier.
pub fn new_event_id() -> EventId {
    EventId::parse(format!("EVT-{}", token())).expect("minted event id matches its own grammar")
}
