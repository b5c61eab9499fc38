//! Maps a key to one of the cluster's 16,384 hash slots, honoring the
//! `{tag}` hash-tag convention that lets related keys be co-located.
use crc32fast::Hasher;

pub const SLOT_COUNT: u16 = 16384;

/// Computes the slot for `key`.
///
/// If `key` contains `{` followed later by `}` with at least one byte
/// between them, only the substring inside the first such pair is hashed
/// (the hash tag). Otherwise the whole key is hashed. This lets a caller
/// force `"user{42}:profile"` and `"user{42}:sessions"` onto the same node.
pub fn slot(key: &str) -> u16 {
    let hashed = hash_tag(key).unwrap_or(key);
    (crc32(hashed.as_bytes()) % u32::from(SLOT_COUNT)) as u16
}

fn hash_tag(key: &str) -> Option<&str> {
    let open = key.find('{')?;
    let rest = &key[open + 1..];
    let close = rest.find('}')?;
    if close == 0 {
        return None;
    }
    Some(&rest[..close])
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_is_within_range() {
        for key in ["a", "", "some long key with spaces", "\u{1F600}"] {
            assert!(slot(key) < SLOT_COUNT);
        }
    }

    #[test]
    fn same_key_hashes_deterministically() {
        assert_eq!(slot("foo"), slot("foo"));
    }

    #[test]
    fn hash_tag_forces_colocation() {
        assert_eq!(slot("user{42}:a"), slot("x{42}y"));
        assert_ne!(slot("user{42}:a"), slot("user{43}:a"));
    }

    #[test]
    fn only_first_tag_pair_counts() {
        // The second `{..}` is part of the hashed body when there's no
        // matching close for the first, and is otherwise ignored.
        assert_eq!(slot("a{1}{2}"), slot("1"));
    }

    #[test]
    fn missing_closing_brace_hashes_whole_key() {
        assert_ne!(slot("a{bc"), slot("bc"));
    }

    #[test]
    fn adjacent_braces_hash_whole_key() {
        // `{}` has no body between the braces, so the rule does not apply.
        let whole = slot("k{}");
        assert_ne!(whole, slot(""));
    }
}
