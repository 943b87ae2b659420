//! Key encoding.
//!
//! Every table key is a byte string whose unsigned lexicographic order
//! matches the order scans need:
//!
//! ```text
//! version key   <path key> 0x00 <timestamp: u64 BE>
//! path key      <utf-8 path>                      (≤ 400 bytes)
//!               0xFF 0xFE <sha-256 of path>        (longer paths)
//! pair key      <first: utf-8, no NUL> 0x00 <second bytes>
//! queue key     <due: u64 BE> <sha-256 of path>
//! ```
//!
//! `0xFF 0xFE` can never start a UTF-8 string, so hashed path keys cannot
//! collide with direct ones. A timestamp of `u64::MAX` is reserved as the
//! "no timestamp" sentinel used by lookups that match any version.

use crate::clock::Timestamp;
use crate::error::{CoreError, CoreResult};
use keeper_storage::KeyRange;
use sha2::{Digest, Sha256};
use std::ops::Bound;

/// Paths longer than this many bytes are stored under their hash.
pub const MAX_DIRECT_PATH_LEN: usize = 400;

/// Leading bytes of a hashed path key.
pub const HASHED_MARKER: [u8; 2] = [0xFF, 0xFE];

/// Timestamp sentinel meaning "no timestamp" or "match any".
pub const NO_TIMESTAMP: Timestamp = Timestamp::MAX;

const SEPARATOR: u8 = 0x00;
const TIMESTAMP_LEN: usize = 8;
const HASH_LEN: usize = 32;

/// The key form of a path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PathKey {
    /// The path itself.
    Direct(String),
    /// SHA-256 of a path longer than [`MAX_DIRECT_PATH_LEN`]. The record's
    /// value carries the true path.
    Hashed([u8; HASH_LEN]),
}

impl PathKey {
    /// Returns the key form of `path`.
    #[must_use]
    pub fn for_path(path: &str) -> Self {
        if path.len() > MAX_DIRECT_PATH_LEN {
            Self::Hashed(sha256(path.as_bytes()))
        } else {
            Self::Direct(path.to_owned())
        }
    }

    /// Returns true if this is the key form of `path`.
    #[must_use]
    pub fn matches(&self, path: &str) -> bool {
        match self {
            Self::Direct(direct) => direct == path,
            Self::Hashed(hash) => path.len() > MAX_DIRECT_PATH_LEN && *hash == sha256(path.as_bytes()),
        }
    }

    /// Returns true for hashed keys.
    #[must_use]
    pub fn is_hashed(&self) -> bool {
        matches!(self, Self::Hashed(_))
    }

    /// Appends the encoded key to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Direct(path) => out.extend_from_slice(path.as_bytes()),
            Self::Hashed(hash) => {
                out.extend_from_slice(&HASHED_MARKER);
                out.extend_from_slice(hash);
            }
        }
    }

    /// Returns the encoded key.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    /// Decodes a path key.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidKey`] for malformed hashed keys or
    /// non-UTF-8 direct keys.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        if let Some(hash) = bytes.strip_prefix(&HASHED_MARKER) {
            let hash: [u8; HASH_LEN] = hash
                .try_into()
                .map_err(|_| CoreError::invalid_key(format!("hashed path key of {} bytes", bytes.len())))?;
            return Ok(Self::Hashed(hash));
        }
        let path = std::str::from_utf8(bytes)
            .map_err(|err| CoreError::invalid_key(format!("path key is not UTF-8: {err}")))?;
        Ok(Self::Direct(path.to_owned()))
    }
}

/// A `(path, timestamp)` key of a versioned entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionKey {
    /// Key form of the path.
    pub path: PathKey,
    /// Timestamp, or `None` for the sentinel.
    pub timestamp: Option<Timestamp>,
}

impl VersionKey {
    /// Creates the key of `path` at `timestamp`.
    #[must_use]
    pub fn new(path: &str, timestamp: Option<Timestamp>) -> Self {
        Self {
            path: PathKey::for_path(path),
            timestamp,
        }
    }

    /// Encodes the key.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(MAX_DIRECT_PATH_LEN + 1 + TIMESTAMP_LEN);
        self.path.encode_into(&mut out);
        out.push(SEPARATOR);
        out.extend_from_slice(&self.timestamp.unwrap_or(NO_TIMESTAMP).to_be_bytes());
        out
    }

    /// Decodes a key, working from the end so paths may contain NUL.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidKey`] if the key is too short, lacks the
    /// separator or carries a malformed path.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        let Some(split) = bytes.len().checked_sub(TIMESTAMP_LEN + 1) else {
            return Err(CoreError::invalid_key("version key too short"));
        };
        if bytes[split] != SEPARATOR {
            return Err(CoreError::invalid_key("version key lacks separator"));
        }
        let mut timestamp = [0u8; TIMESTAMP_LEN];
        timestamp.copy_from_slice(&bytes[split + 1..]);
        let timestamp = Timestamp::from_be_bytes(timestamp);
        Ok(Self {
            path: PathKey::decode(&bytes[..split])?,
            timestamp: (timestamp != NO_TIMESTAMP).then_some(timestamp),
        })
    }
}

/// Encodes the key of `path` at `timestamp`.
#[must_use]
pub fn version_key(path: &str, timestamp: Timestamp) -> Vec<u8> {
    VersionKey::new(path, Some(timestamp)).encode()
}

/// Returns the range holding every version of `path` with a timestamp
/// `≤ up_to` (all versions for `None`).
///
/// Paths containing NUL can share this range with longer paths; callers
/// compare the decoded path.
#[must_use]
pub fn version_range(path: &str, up_to: Option<Timestamp>) -> KeyRange {
    let mut start = PathKey::for_path(path).to_bytes();
    start.push(SEPARATOR);
    let mut end = start.clone();
    start.extend_from_slice(&0u64.to_be_bytes());
    end.extend_from_slice(&up_to.unwrap_or(NO_TIMESTAMP).to_be_bytes());
    KeyRange::inclusive(start, end)
}

/// Computes the smallest key greater than every key starting with `prefix`.
///
/// Increments the last byte, carrying into earlier bytes past `0xFF`.
/// Returns `None` when `prefix` is empty or all `0xFF`: the range is then
/// unbounded above.
#[must_use]
pub fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(last) = bound.pop() {
        if last < u8::MAX {
            bound.push(last + 1);
            return Some(bound);
        }
    }
    None
}

/// Returns the range of every key starting with `prefix`.
///
/// Scan it [`Descending`](keeper_storage::Direction::Descending) to visit
/// the keys newest-to-oldest.
#[must_use]
pub fn prefix_range(prefix: &[u8]) -> KeyRange {
    let end = match prefix_upper_bound(prefix) {
        Some(bound) => Bound::Excluded(bound),
        None => Bound::Unbounded,
    };
    KeyRange::new(Bound::Included(prefix.to_vec()), end)
}

/// Returns the range of every hashed path key.
#[must_use]
pub fn hashed_paths_range() -> KeyRange {
    prefix_range(&HASHED_MARKER)
}

/// Encodes a two-part key.
///
/// # Errors
///
/// Returns [`CoreError::InvalidKey`] if `first` contains a NUL byte.
pub fn pair_key(first: &str, second: &[u8]) -> CoreResult<Vec<u8>> {
    let mut out = pair_prefix(first)?;
    out.extend_from_slice(second);
    Ok(out)
}

/// Returns the prefix shared by every pair key starting with `first`.
///
/// # Errors
///
/// Returns [`CoreError::InvalidKey`] if `first` contains a NUL byte.
pub fn pair_prefix(first: &str) -> CoreResult<Vec<u8>> {
    if first.as_bytes().contains(&SEPARATOR) {
        return Err(CoreError::invalid_key(format!(
            "leading key part contains NUL: {first:?}"
        )));
    }
    let mut out = Vec::with_capacity(first.len() + 1);
    out.extend_from_slice(first.as_bytes());
    out.push(SEPARATOR);
    Ok(out)
}

/// Splits a pair key on its first NUL byte.
///
/// # Errors
///
/// Returns [`CoreError::InvalidKey`] if there is no separator or the first
/// part is not UTF-8.
pub fn decode_pair(bytes: &[u8]) -> CoreResult<(String, Vec<u8>)> {
    let split = bytes
        .iter()
        .position(|&b| b == SEPARATOR)
        .ok_or_else(|| CoreError::invalid_key("pair key lacks separator"))?;
    let first = std::str::from_utf8(&bytes[..split])
        .map_err(|err| CoreError::invalid_key(format!("pair key is not UTF-8: {err}")))?;
    Ok((first.to_owned(), bytes[split + 1..].to_vec()))
}

/// Hash identifying a path in the pending update tables.
#[must_use]
pub fn path_hash(path: &str) -> [u8; HASH_LEN] {
    sha256(path.as_bytes())
}

/// Encodes a pending update queue key.
#[must_use]
pub fn queue_key(due: Timestamp, hash: &[u8; HASH_LEN]) -> Vec<u8> {
    let mut out = Vec::with_capacity(TIMESTAMP_LEN + HASH_LEN);
    out.extend_from_slice(&due.to_be_bytes());
    out.extend_from_slice(hash);
    out
}

/// Decodes a pending update queue key.
///
/// # Errors
///
/// Returns [`CoreError::InvalidKey`] if the key has the wrong length.
pub fn decode_queue_key(bytes: &[u8]) -> CoreResult<(Timestamp, [u8; HASH_LEN])> {
    if bytes.len() != TIMESTAMP_LEN + HASH_LEN {
        return Err(CoreError::invalid_key(format!(
            "queue key of {} bytes",
            bytes.len()
        )));
    }
    let mut due = [0u8; TIMESTAMP_LEN];
    due.copy_from_slice(&bytes[..TIMESTAMP_LEN]);
    let mut hash = [0u8; HASH_LEN];
    hash.copy_from_slice(&bytes[TIMESTAMP_LEN..]);
    Ok((Timestamp::from_be_bytes(due), hash))
}

fn sha256(bytes: &[u8]) -> [u8; HASH_LEN] {
    Sha256::digest(bytes).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn short_paths_stay_direct() {
        let key = PathKey::for_path("/etc/hosts");
        assert_eq!(key, PathKey::Direct("/etc/hosts".into()));
        assert_eq!(key.to_bytes(), b"/etc/hosts");
    }

    #[test]
    fn long_paths_are_hashed() {
        let at_limit = "a".repeat(MAX_DIRECT_PATH_LEN);
        assert!(!PathKey::for_path(&at_limit).is_hashed());

        let over = "a".repeat(MAX_DIRECT_PATH_LEN + 1);
        let key = PathKey::for_path(&over);
        assert!(key.is_hashed());
        assert!(key.matches(&over));
        assert!(!key.matches(&at_limit));
        assert_eq!(key.to_bytes().len(), 2 + HASH_LEN);
        assert_eq!(&key.to_bytes()[..2], &HASHED_MARKER);
    }

    #[test]
    fn empty_path_is_distinct_from_sentinel() {
        let key = VersionKey::new("", None);
        let decoded = VersionKey::decode(&key.encode()).unwrap();
        assert_eq!(decoded.path, PathKey::Direct(String::new()));
        assert_eq!(decoded.timestamp, None);

        let at_zero = version_key("", 0);
        assert_ne!(at_zero, key.encode());
        assert_eq!(VersionKey::decode(&at_zero).unwrap().timestamp, Some(0));
    }

    #[test]
    fn versions_sort_by_timestamp() {
        assert!(version_key("/a", 100) < version_key("/a", 200));
        assert!(version_key("/a", u64::MAX - 1) < version_key("/a/", 0));
    }

    #[test]
    fn upper_bound_carries_through_max_bytes() {
        assert_eq!(prefix_upper_bound(b"ab"), Some(b"ac".to_vec()));
        assert_eq!(prefix_upper_bound(&[0x01, 0xFF]), Some(vec![0x02]));
        assert_eq!(prefix_upper_bound(&[0x7F]), Some(vec![0x80]));
        assert_eq!(prefix_upper_bound(&[0x80]), Some(vec![0x81]));
        assert_eq!(prefix_upper_bound(&[0xFF, 0xFF]), None);
        assert_eq!(prefix_upper_bound(&[]), None);
    }

    #[test]
    fn pair_keys_split_on_first_nul() {
        let key = pair_key("set-1", b"x\0y").unwrap();
        assert_eq!(decode_pair(&key).unwrap(), ("set-1".to_owned(), b"x\0y".to_vec()));
        assert!(pair_key("bad\0first", b"x").is_err());
        assert!(decode_pair(b"no-separator").is_err());
    }

    #[test]
    fn queue_keys_order_by_due_time() {
        let early = queue_key(5, &path_hash("/z"));
        let late = queue_key(6, &path_hash("/a"));
        assert!(early < late);
        assert_eq!(decode_queue_key(&late).unwrap(), (6, path_hash("/a")));
        assert!(decode_queue_key(b"short").is_err());
    }

    fn path_strategy() -> impl Strategy<Value = String> {
        prop_oneof![
            "[/a-z\\x00é]{0,40}",
            "/[a-z]{390,420}",
        ]
    }

    proptest! {
        #[test]
        fn version_key_round_trips(path in path_strategy(), ts in prop::option::of(0u64..u64::MAX)) {
            let key = VersionKey::new(&path, ts);
            let decoded = VersionKey::decode(&key.encode()).unwrap();
            prop_assert!(decoded.path.matches(&path));
            prop_assert_eq!(decoded, key);
        }

        #[test]
        fn prefix_range_selects_exactly_the_prefixed_keys(
            prefix in prop::collection::vec(any::<u8>(), 0..4),
            keys in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..6), 0..64),
        ) {
            let range = prefix_range(&prefix);
            for key in &keys {
                prop_assert_eq!(range.contains(key), key.starts_with(&prefix), "key {:?}", key);
            }
        }

        #[test]
        fn prefix_range_with_trailing_max_bytes(
            head in prop::collection::vec(any::<u8>(), 0..3),
            tail in 1usize..3,
            keys in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..6), 0..64),
        ) {
            let mut prefix = head;
            prefix.extend(std::iter::repeat(0xFF).take(tail));
            let range = prefix_range(&prefix);
            for key in &keys {
                let mut probe = prefix.clone();
                probe.extend_from_slice(key);
                prop_assert!(range.contains(&probe));
                prop_assert_eq!(range.contains(key), key.starts_with(&prefix));
            }
        }
    }
}
