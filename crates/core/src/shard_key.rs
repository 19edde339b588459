//! Shard document ids
//!
//! Shard ids are opaque strings chosen by writers. Partial documents share
//! the same collection and are told apart by their id: the logical prefix
//! is left-padded with `\t` to five characters. `\t` sorts before every
//! printable character, so all partials of a counter sort before its plain
//! shards in a range query, and classification needs no extra field.
//!
//! `ShardKey` is the decoded form. Encoding happens only at the document
//! id boundary.

use std::fmt;

/// Left-pad marker for partial ids
pub const PARTIAL_MARKER: char = '\t';

/// Encoded length of a partial id
pub const PARTIAL_ID_LEN: usize = 5;

/// Longest prefix a partial may carry
pub const MAX_PARTIAL_PREFIX: usize = 4;

/// Decoded shard document id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ShardKey {
    /// A writer-owned shard
    Plain(String),
    /// An intermediate aggregation document for a key prefix
    Partial(String),
}

impl ShardKey {
    /// Classify and decode a document id.
    pub fn decode(id: &str) -> Self {
        if id.starts_with(PARTIAL_MARKER) {
            ShardKey::Partial(id.trim_start_matches(PARTIAL_MARKER).to_string())
        } else {
            ShardKey::Plain(id.to_string())
        }
    }

    /// Partial key for the first `len` characters of a logical key.
    pub fn partial_for(logical: &str, len: usize) -> Self {
        let len = len.min(MAX_PARTIAL_PREFIX);
        ShardKey::Partial(logical.chars().take(len).collect())
    }

    /// Encode back to a document id.
    pub fn encode(&self) -> String {
        match self {
            ShardKey::Plain(id) => id.clone(),
            ShardKey::Partial(prefix) => {
                let chars = prefix.chars().count();
                let mut id = String::with_capacity(PARTIAL_ID_LEN.max(chars) + prefix.len());
                for _ in chars..PARTIAL_ID_LEN {
                    id.push(PARTIAL_MARKER);
                }
                id.push_str(prefix);
                id
            }
        }
    }

    /// Logical value with the marker stripped
    pub fn logical(&self) -> &str {
        match self {
            ShardKey::Plain(id) | ShardKey::Partial(id) => id,
        }
    }

    /// Number of characters in the logical value
    pub fn logical_len(&self) -> usize {
        self.logical().chars().count()
    }

    /// Whether this is a partial
    pub fn is_partial(&self) -> bool {
        matches!(self, ShardKey::Partial(_))
    }
}

impl fmt::Display for ShardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardKey::Plain(id) => write!(f, "shard({})", id),
            ShardKey::Partial(prefix) => write!(f, "partial({})", prefix),
        }
    }
}

/// Whether a document id names a partial
pub fn is_partial_id(id: &str) -> bool {
    id.starts_with(PARTIAL_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_plain() {
        let key = ShardKey::decode("3f2a9c");
        assert_eq!(key, ShardKey::Plain("3f2a9c".to_string()));
        assert!(!key.is_partial());
    }

    #[test]
    fn test_decode_partial() {
        let key = ShardKey::decode("\t\t\tab");
        assert_eq!(key, ShardKey::Partial("ab".to_string()));
        assert_eq!(key.logical_len(), 2);
    }

    #[test]
    fn test_encode_pads_to_five() {
        assert_eq!(ShardKey::Partial("ab".into()).encode(), "\t\t\tab");
        assert_eq!(ShardKey::Partial("abcd".into()).encode(), "\tabcd");
        assert_eq!(ShardKey::Partial(String::new()).encode(), "\t\t\t\t\t");
        assert_eq!(ShardKey::Plain("xyz".into()).encode(), "xyz");
    }

    #[test]
    fn test_partial_for_caps_prefix() {
        let key = ShardKey::partial_for("abcdefgh", 7);
        assert_eq!(key, ShardKey::Partial("abcd".to_string()));
        assert_eq!(ShardKey::partial_for("abcdefgh", 2).encode(), "\t\t\tab");
    }

    #[test]
    fn test_encode_decode_identity() {
        for id in ["\t\t\t\ta", "\t\tabc", "plain-id", "\t\t\t\t\t"] {
            assert_eq!(ShardKey::decode(id).encode(), id);
        }
    }

    #[test]
    fn test_is_partial_id() {
        assert!(is_partial_id("\t\t\tab"));
        assert!(!is_partial_id("ab"));
    }
}
