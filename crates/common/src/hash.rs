//! Hashing helpers shared by auth and key-suspension code.

use sha2::{Digest, Sha256};

/// SHA-256 of the input, hex-encoded.
///
/// API keys are never stored or logged in the clear; lookups and
/// rate-limit suspension records are keyed by this digest.
#[must_use]
pub fn sha256_hex(input: &str) -> String {
    let digest = Sha256::digest(input.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_vector() {
        // sha256("abc")
        assert_eq!(
            sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn distinct_inputs_distinct_digests() {
        assert_ne!(sha256_hex("rf_live_a"), sha256_hex("rf_live_b"));
    }
}
