//! String collation
//!
//! A collation decides how strings compare for sorting, grouping and index order.
//! `None` everywhere in the API means the simple (byte-wise) collation.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Locale + strength collation spec.
///
/// Strength 1 and 2 compare case-insensitively. Strength 3 and above compare
/// case-insensitively first and break ties by case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Collation {
    pub locale: String,
    #[serde(default = "default_strength")]
    pub strength: u8,
}

fn default_strength() -> u8 {
    3
}

impl Collation {
    pub fn new(locale: impl Into<String>, strength: u8) -> Self {
        Self {
            locale: locale.into(),
            strength,
        }
    }

    /// `{locale: "simple"}` is an explicit request for the simple collation.
    pub fn normalize(collation: Option<Collation>) -> Option<Collation> {
        collation.filter(|c| c.locale != "simple")
    }

    pub fn compare_strings(&self, a: &str, b: &str) -> Ordering {
        let folded = a
            .chars()
            .flat_map(char::to_lowercase)
            .cmp(b.chars().flat_map(char::to_lowercase));

        if folded != Ordering::Equal || self.strength <= 2 {
            folded
        } else {
            a.cmp(b)
        }
    }
}

/// Compare two strings under an optional collation.
pub fn compare_strings(a: &str, b: &str, collation: Option<&Collation>) -> Ordering {
    match collation {
        Some(c) => c.compare_strings(a, b),
        None => a.cmp(b),
    }
}

/// Two collations are interchangeable only if both are simple or both are identical.
pub fn collations_match(a: Option<&Collation>, b: Option<&Collation>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_is_bytewise() {
        assert_eq!(compare_strings("B", "a", None), Ordering::Less);
        assert_eq!(compare_strings("a", "a", None), Ordering::Equal);
    }

    #[test]
    fn test_case_insensitive_strength() {
        let en2 = Collation::new("en_US", 2);
        assert_eq!(en2.compare_strings("foo", "FOO"), Ordering::Equal);
        assert_eq!(en2.compare_strings("B", "a"), Ordering::Greater);

        let en3 = Collation::new("en_US", 3);
        assert_ne!(en3.compare_strings("foo", "FOO"), Ordering::Equal);
        assert_eq!(en3.compare_strings("apple", "Banana"), Ordering::Less);
    }

    #[test]
    fn test_matching() {
        let en = Collation::new("en_US", 2);
        assert!(collations_match(None, None));
        assert!(collations_match(Some(&en), Some(&en.clone())));
        assert!(!collations_match(Some(&en), None));
        assert!(!collations_match(Some(&en), Some(&Collation::new("en_US", 3))));
        assert_eq!(Collation::normalize(Some(Collation::new("simple", 3))), None);
    }
}
