//! Canonical byte encoding for hashed record fields.
//!
//! The content hash of a record is computed over this encoding, so it must
//! be deterministic across platforms and releases: fixed field order, fixed
//! integer widths, length-prefixed variable fields, and an explicit encoding
//! version embedded at the front.
//!
//! # Encoding (version 1)
//!
//! ```text
//! u16  encoding version (big-endian)
//! u32  record_type length || record_type bytes
//! u32  schema_version
//! u32  payload length || payload bytes
//! 32B  prior_hash
//! ```
//!
//! Length prefixes prevent canonicalization collision attacks: `("ab", "c")`
//! and `("a", "bc")` never encode to the same bytes.
//!
//! # Fail-closed
//!
//! Malformed input is rejected, never hashed with substitute or default
//! values: an empty record type, an oversized record type, or an oversized
//! payload all return an error before any hashing happens.

use thiserror::Error;

use crate::crypto::{HASH_SIZE, Hash};

/// Version of the canonical encoding produced by this module.
pub const ENCODING_VERSION: u16 = 1;

/// Maximum length of a record type name in bytes.
pub const MAX_RECORD_TYPE_LEN: usize = 256;

/// Maximum payload size in bytes (16 MiB).
pub const MAX_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Errors that can occur while canonicalizing record fields.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CanonicalError {
    /// The record type name is empty.
    #[error("record type must not be empty")]
    EmptyRecordType,

    /// The record type name exceeds the maximum length.
    #[error("record type exceeds max length: {actual} > {max}")]
    RecordTypeTooLong {
        /// Actual length of the record type in bytes.
        actual: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// The payload exceeds the maximum size.
    #[error("payload exceeds max size: {actual} > {max}")]
    PayloadTooLarge {
        /// Actual payload size in bytes.
        actual: usize,
        /// Maximum allowed size.
        max: usize,
    },
}

/// Produces the canonical bytes for the hashed fields of a record.
///
/// # Errors
///
/// Fails closed on malformed input; see [`CanonicalError`].
#[allow(clippy::cast_possible_truncation)] // lengths are bounds-checked above the casts
pub fn canonical_record_bytes(
    record_type: &str,
    schema_version: u32,
    payload: &[u8],
    prior_hash: &Hash,
) -> Result<Vec<u8>, CanonicalError> {
    if record_type.is_empty() {
        return Err(CanonicalError::EmptyRecordType);
    }
    if record_type.len() > MAX_RECORD_TYPE_LEN {
        return Err(CanonicalError::RecordTypeTooLong {
            actual: record_type.len(),
            max: MAX_RECORD_TYPE_LEN,
        });
    }
    if payload.len() > MAX_PAYLOAD_BYTES {
        return Err(CanonicalError::PayloadTooLarge {
            actual: payload.len(),
            max: MAX_PAYLOAD_BYTES,
        });
    }

    let capacity = 2 + 4 + record_type.len() + 4 + 4 + payload.len() + HASH_SIZE;
    let mut bytes = Vec::with_capacity(capacity);

    bytes.extend_from_slice(&ENCODING_VERSION.to_be_bytes());

    bytes.extend_from_slice(&(record_type.len() as u32).to_be_bytes());
    bytes.extend_from_slice(record_type.as_bytes());

    bytes.extend_from_slice(&schema_version.to_be_bytes());

    bytes.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    bytes.extend_from_slice(payload);

    bytes.extend_from_slice(prior_hash);

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::crypto::ChainHasher;

    #[test]
    fn encoding_is_deterministic() {
        let prior = ChainHasher::GENESIS_PRIOR_HASH;
        let a = canonical_record_bytes("motion.filed", 1, b"payload", &prior).unwrap();
        let b = canonical_record_bytes("motion.filed", 1, b"payload", &prior).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn encoding_embeds_version() {
        let prior = ChainHasher::GENESIS_PRIOR_HASH;
        let bytes = canonical_record_bytes("t", 1, b"", &prior).unwrap();
        assert_eq!(&bytes[..2], &ENCODING_VERSION.to_be_bytes());
    }

    #[test]
    fn empty_record_type_fails_closed() {
        let prior = ChainHasher::GENESIS_PRIOR_HASH;
        assert_eq!(
            canonical_record_bytes("", 1, b"payload", &prior),
            Err(CanonicalError::EmptyRecordType)
        );
    }

    #[test]
    fn oversized_record_type_fails_closed() {
        let prior = ChainHasher::GENESIS_PRIOR_HASH;
        let long = "x".repeat(MAX_RECORD_TYPE_LEN + 1);
        assert!(matches!(
            canonical_record_bytes(&long, 1, b"", &prior),
            Err(CanonicalError::RecordTypeTooLong { .. })
        ));
    }

    #[test]
    fn length_prefixing_prevents_field_collisions() {
        let prior = ChainHasher::GENESIS_PRIOR_HASH;
        // "ab" + payload "c" vs "a" + payload "bc" must differ.
        let a = canonical_record_bytes("ab", 1, b"c", &prior).unwrap();
        let b = canonical_record_bytes("a", 1, b"bc", &prior).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn prior_hash_changes_encoding() {
        let a = canonical_record_bytes("t", 1, b"p", &ChainHasher::GENESIS_PRIOR_HASH).unwrap();
        let b = canonical_record_bytes("t", 1, b"p", &[9u8; HASH_SIZE]).unwrap();
        assert_ne!(a, b);
        assert_ne!(ChainHasher::content_hash(&a), ChainHasher::content_hash(&b));
    }

    proptest! {
        #[test]
        fn distinct_fields_never_collide(
            type_a in "[a-z.]{1,24}",
            type_b in "[a-z.]{1,24}",
            version_a in 1u32..64,
            version_b in 1u32..64,
            payload_a in proptest::collection::vec(any::<u8>(), 0..128),
            payload_b in proptest::collection::vec(any::<u8>(), 0..128),
        ) {
            let prior = ChainHasher::GENESIS_PRIOR_HASH;
            let a = canonical_record_bytes(&type_a, version_a, &payload_a, &prior).unwrap();
            let b = canonical_record_bytes(&type_b, version_b, &payload_b, &prior).unwrap();

            let same_input =
                type_a == type_b && version_a == version_b && payload_a == payload_b;
            prop_assert_eq!(a == b, same_input);
        }
    }
}
