//! Record identifiers

use rand::RngCore;

use crate::{Error, Result};

/// Length of experiment and checkpoint IDs in hex characters
pub const ID_LEN: usize = 64;

/// Length of the abbreviated IDs shown to humans
pub const SHORT_ID_LEN: usize = 7;

/// Generate a fresh 64-hex-character random ID
pub fn random_id() -> String {
    let mut bytes = [0u8; ID_LEN / 2];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Returns true if `s` looks like a full record ID
pub fn is_valid_id(s: &str) -> bool {
    s.len() == ID_LEN && is_hex(s)
}

/// Returns true if `s` is non-empty lowercase hex
pub fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Resolve `prefix` against `ids`, requiring exactly one match
pub fn resolve_prefix<'a, I>(ids: I, prefix: &str) -> Result<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut matches = ids.into_iter().filter(|id| id.starts_with(prefix));
    let first = matches
        .next()
        .ok_or_else(|| Error::does_not_exist(prefix.to_string()))?;
    let rest = matches.count();
    if rest > 0 {
        return Err(Error::AmbiguousPrefix {
            prefix: prefix.to_string(),
            matches: rest + 1,
        });
    }
    Ok(first.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_id() {
        let a = random_id();
        let b = random_id();
        assert!(is_valid_id(&a));
        assert!(is_valid_id(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_is_hex() {
        assert!(is_hex("0a9f"));
        assert!(!is_hex(""));
        assert!(!is_hex("0A9F"));
        assert!(!is_hex("xyz"));
    }

    #[test]
    fn test_resolve_prefix() {
        let ids = ["abc123", "abd456", "ff0000"];

        assert_eq!(resolve_prefix(ids, "abc").unwrap(), "abc123");
        assert_eq!(resolve_prefix(ids, "ff").unwrap(), "ff0000");

        let err = resolve_prefix(ids, "ab").unwrap_err();
        assert!(matches!(err, Error::AmbiguousPrefix { matches: 2, .. }));

        let err = resolve_prefix(ids, "00").unwrap_err();
        assert!(matches!(err, Error::DoesNotExist { .. }));
    }
}
