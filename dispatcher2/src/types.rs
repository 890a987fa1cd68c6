//! Common type definitions.
//!
//! This module defines:
//! - Type aliases for entity IDs (RequestId, ServerId, ScheduleId, UserId)
//! - The uid format used for externally visible identifiers
//!
//! # ID Types
//!
//! Rows are keyed by store-assigned 64-bit ids; requests and servers also
//! carry an externally visible 11-character alphanumeric `uid`. Generated
//! uids always start with an uppercase letter.

use rand::Rng;

// Type aliases for IDs
pub type RequestId = i64;
pub type ServerId = i64;
pub type ScheduleId = i64;
pub type UserId = i64;

const UID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const UID_UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const UID_LENGTH: usize = 11;

/// Generate a fresh uid: 11 alphanumeric characters, first one an uppercase
/// letter.
pub fn generate_uid() -> String {
    let mut rng = rand::thread_rng();
    let mut uid = String::with_capacity(UID_LENGTH);
    uid.push(UID_UPPER[rng.gen_range(0..UID_UPPER.len())] as char);
    for _ in 1..UID_LENGTH {
        uid.push(UID_ALPHABET[rng.gen_range(0..UID_ALPHABET.len())] as char);
    }
    uid
}

/// Whether a caller-supplied uid is acceptable (`^[A-Za-z0-9]{11}$`). Callers
/// that fail this get a fresh uid assigned instead.
pub fn is_valid_uid(uid: &str) -> bool {
    uid.len() == UID_LENGTH && uid.bytes().all(|b| b.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_uid_matches_format() {
        for _ in 0..100 {
            let uid = generate_uid();
            assert_eq!(uid.len(), UID_LENGTH);
            assert!(uid.chars().next().unwrap().is_ascii_uppercase());
            assert!(is_valid_uid(&uid), "generated uid should validate: {uid}");
        }
    }

    #[test]
    fn uid_validation_rejects_bad_input() {
        assert!(is_valid_uid("AbCdEf12345"));
        assert!(!is_valid_uid(""));
        assert!(!is_valid_uid("short"));
        assert!(!is_valid_uid("toolongbyfar1"));
        assert!(!is_valid_uid("has space 1"));
        assert!(!is_valid_uid("with-dash12"));
    }
}
