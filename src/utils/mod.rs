//! Utility functions and helpers

pub mod certificates;
pub mod duration;

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Length of the hex hash suffix used in generated resource names
pub const SHORT_HASH_LEN: usize = 10;

/// Generate a new UUID v4 as a string
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// SHA-256 over the given parts, hex encoded and truncated to [`SHORT_HASH_LEN`].
///
/// Parts are separated with a NUL byte so `("ab", "c")` and `("a", "bc")` differ.
pub fn short_hash<I, S>(parts: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_ref());
        hasher.update([0u8]);
    }
    let mut digest = hex::encode(hasher.finalize());
    digest.truncate(SHORT_HASH_LEN);
    digest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_hash_is_stable_and_separated() {
        let a = short_hash(["ab", "c"]);
        assert_eq!(a.len(), SHORT_HASH_LEN);
        assert_eq!(a, short_hash(["ab", "c"]));
        assert_ne!(a, short_hash(["a", "bc"]));
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(generate_id(), generate_id());
    }
}
