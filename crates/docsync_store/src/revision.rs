//! Revision identifiers.
//!
//! A revision ID has the form `<generation>-<digest>`. The generation is the
//! depth of the revision in the document's history; the digest is a SHA-256
//! over the parent revision, the deletion flag and the canonical JSON body,
//! so two stores that make the same edit to the same parent agree on the ID.

use crate::document::Properties;
use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Number of ancestor revisions kept with each stored revision.
pub const MAX_HISTORY: usize = 20;

/// Identifier of one revision of a document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RevisionId {
    generation: u64,
    digest: String,
}

impl RevisionId {
    /// Computes the ID of a revision with the given parent and content.
    pub fn compute(parent: Option<&RevisionId>, deleted: bool, body: &Properties) -> Self {
        let mut hasher = Sha256::new();
        if let Some(parent) = parent {
            hasher.update(parent.to_string().as_bytes());
        }
        hasher.update([u8::from(deleted)]);
        // serde_json maps are key-ordered, so this is canonical.
        if let Ok(encoded) = serde_json::to_vec(body) {
            hasher.update(&encoded);
        }
        let digest = hasher.finalize();
        let digest: String = digest[..16].iter().map(|b| format!("{b:02x}")).collect();

        Self {
            generation: parent.map(|p| p.generation + 1).unwrap_or(1),
            digest,
        }
    }

    /// Returns the generation number.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns the digest part.
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl fmt::Display for RevisionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.digest)
    }
}

impl FromStr for RevisionId {
    type Err = StoreError;

    fn from_str(s: &str) -> StoreResult<Self> {
        let (generation, digest) = s
            .split_once('-')
            .ok_or_else(|| StoreError::InvalidRevision(s.to_string()))?;
        let generation: u64 = generation
            .parse()
            .map_err(|_| StoreError::InvalidRevision(s.to_string()))?;
        if generation == 0 || digest.is_empty() {
            return Err(StoreError::InvalidRevision(s.to_string()));
        }
        Ok(Self {
            generation,
            digest: digest.to_string(),
        })
    }
}

impl TryFrom<String> for RevisionId {
    type Error = StoreError;

    fn try_from(value: String) -> StoreResult<Self> {
        value.parse()
    }
}

impl From<RevisionId> for String {
    fn from(rev: RevisionId) -> Self {
        rev.to_string()
    }
}

impl Ord for RevisionId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.generation
            .cmp(&other.generation)
            .then_with(|| self.digest.cmp(&other.digest))
    }
}

impl PartialOrd for RevisionId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn body(value: serde_json::Value) -> Properties {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn compute_is_deterministic() {
        let a = RevisionId::compute(None, false, &body(json!({"name": "Cat"})));
        let b = RevisionId::compute(None, false, &body(json!({"name": "Cat"})));
        assert_eq!(a, b);
        assert_eq!(a.generation(), 1);
    }

    #[test]
    fn child_has_next_generation() {
        let parent = RevisionId::compute(None, false, &body(json!({"n": 1})));
        let child = RevisionId::compute(Some(&parent), false, &body(json!({"n": 2})));
        assert_eq!(child.generation(), 2);
        assert!(child > parent);
    }

    #[test]
    fn deletion_changes_digest() {
        let props = body(json!({}));
        let live = RevisionId::compute(None, false, &props);
        let dead = RevisionId::compute(None, true, &props);
        assert_ne!(live, dead);
    }

    #[test]
    fn parse_display() {
        let rev: RevisionId = "3-abcdef".parse().unwrap();
        assert_eq!(rev.generation(), 3);
        assert_eq!(rev.digest(), "abcdef");
        assert_eq!(rev.to_string(), "3-abcdef");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("abc".parse::<RevisionId>().is_err());
        assert!("0-abc".parse::<RevisionId>().is_err());
        assert!("x-abc".parse::<RevisionId>().is_err());
        assert!("2-".parse::<RevisionId>().is_err());
    }

    #[test]
    fn serde_as_string() {
        let rev: RevisionId = "2-beef".parse().unwrap();
        let encoded = serde_json::to_string(&rev).unwrap();
        assert_eq!(encoded, "\"2-beef\"");
        let decoded: RevisionId = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, rev);
    }

    proptest! {
        #[test]
        fn ordering_follows_generation(g1 in 1u64..1000, g2 in 1u64..1000) {
            let a: RevisionId = format!("{g1}-aa").parse().unwrap();
            let b: RevisionId = format!("{g2}-aa").parse().unwrap();
            prop_assert_eq!(a.cmp(&b), g1.cmp(&g2));
        }
    }
}
