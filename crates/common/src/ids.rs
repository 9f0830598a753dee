//! ULID generation for jobs, results, and deliveries.
//!
//! ULIDs sort lexicographically in creation order, which is what the
//! incremental result-streaming path relies on: `id > last_seen_id` in id
//! order is exactly "everything completed since the last poll".

use ulid::Ulid;

/// Generate a new ULID string (26 chars, Crockford base32, uppercase).
#[must_use]
pub fn new_id() -> String {
    Ulid::new().to_string()
}

/// Check that a string parses as a ULID. Used to validate `after` cursors
/// from query parameters before they reach a store query.
#[must_use]
pub fn is_valid(id: &str) -> bool {
    Ulid::from_string(id).is_ok()
}
