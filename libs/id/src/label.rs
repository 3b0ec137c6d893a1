//! Correlation labels.
//!
//! A label is the only key that ties a compute instance to the worker
//! registration it eventually produces. Labels are drawn at random from a
//! base-36 alphabet; an allocator additionally guarantees that a label is
//! never handed out twice during one run.

use std::collections::HashSet;

use rand::Rng;

use crate::IdError;

/// Characters a label is drawn from.
pub const LABEL_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Number of characters in a label (36^8 ≈ 2.8e12 distinct values).
pub const LABEL_LEN: usize = 8;

/// A short random correlation token.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Label(String);

impl Label {
    /// Parses a label, checking length and alphabet.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        if s.len() != LABEL_LEN {
            return Err(IdError::InvalidLabel {
                label: s.to_string(),
                reason: "wrong length",
            });
        }
        if !s.bytes().all(|b| LABEL_ALPHABET.contains(&b)) {
            return Err(IdError::InvalidLabel {
                label: s.to_string(),
                reason: "characters outside [0-9a-z]",
            });
        }
        Ok(Self(s.to_string()))
    }

    /// Draws one label at random.
    pub fn random<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let s: String = (0..LABEL_LEN)
            .map(|_| LABEL_ALPHABET[rng.random_range(0..LABEL_ALPHABET.len())] as char)
            .collect();
        Self(s)
    }

    /// Returns the label as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::str::FromStr for Label {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for Label {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl serde::Serialize for Label {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Label {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

/// Hands out labels for one provisioning run.
///
/// Every label returned by [`generate`](Self::generate) is distinct from every
/// other label this allocator has produced, so a retry can never reuse the
/// label of a torn-down straggler whose registration might still show up late.
/// Concurrent runs each own their allocator.
#[derive(Debug, Default)]
pub struct LabelAllocator {
    issued: HashSet<Label>,
}

impl LabelAllocator {
    /// Creates an allocator with an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Generates `n` fresh labels in draw order.
    pub fn generate(&mut self, n: usize) -> Vec<Label> {
        let mut rng = rand::rng();
        let mut labels = Vec::with_capacity(n);
        while labels.len() < n {
            let label = Label::random(&mut rng);
            // Redraw on the (rare) collision with anything issued earlier.
            if self.issued.insert(label.clone()) {
                labels.push(label);
            }
        }
        labels
    }

    /// Number of labels issued so far.
    pub fn issued_count(&self) -> usize {
        self.issued.len()
    }

    /// Whether this allocator produced `label`.
    pub fn was_issued(&self, label: &Label) -> bool {
        self.issued.contains(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_generate_count_and_format() {
        let mut allocator = LabelAllocator::new();
        let labels = allocator.generate(25);
        assert_eq!(labels.len(), 25);
        for label in &labels {
            assert_eq!(label.as_str().len(), LABEL_LEN);
            assert!(Label::parse(label.as_str()).is_ok());
        }
    }

    #[test]
    fn test_generate_zero() {
        let mut allocator = LabelAllocator::new();
        assert!(allocator.generate(0).is_empty());
        assert_eq!(allocator.issued_count(), 0);
    }

    #[test]
    fn test_ten_thousand_labels_are_distinct() {
        let mut allocator = LabelAllocator::new();
        let labels = allocator.generate(10_000);
        let unique: HashSet<_> = labels.iter().collect();
        assert_eq!(unique.len(), 10_000);
    }

    #[test]
    fn test_successive_batches_never_overlap() {
        let mut allocator = LabelAllocator::new();
        let first = allocator.generate(500);
        let second = allocator.generate(500);
        let first: HashSet<_> = first.into_iter().collect();
        assert!(second.iter().all(|l| !first.contains(l)));
        assert_eq!(allocator.issued_count(), 1000);
        assert!(second.iter().all(|l| allocator.was_issued(l)));
    }

    #[test]
    fn test_parse_rejects_bad_labels() {
        assert!(Label::parse("").unwrap_err().is_empty());
        assert!(Label::parse("abc").unwrap_err().is_label_error());
        assert!(Label::parse("ABCDEFGH").unwrap_err().is_label_error());
        assert!(Label::parse("abcd-fgh").unwrap_err().is_label_error());
    }

    #[test]
    fn test_label_json_roundtrip() {
        let label = Label::parse("k3v9q0zx").unwrap();
        let json = serde_json::to_string(&label).unwrap();
        assert_eq!(json, "\"k3v9q0zx\"");
        let parsed: Label = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, label);
    }

    proptest! {
        #[test]
        fn prop_generated_labels_distinct_and_parseable(n in 0usize..2_000) {
            let mut allocator = LabelAllocator::new();
            let labels = allocator.generate(n);
            prop_assert_eq!(labels.len(), n);
            let unique: HashSet<_> = labels.iter().collect();
            prop_assert_eq!(unique.len(), n);
            for label in &labels {
                prop_assert!(Label::parse(label.as_str()).is_ok());
            }
        }
    }
}
