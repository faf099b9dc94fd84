//! Views: named projections of an entry.
//!
//! A [`View`] is a tuple of independent, optional dimensions. Values are
//! trimmed and lowercased when set, and empty values are dropped, so two
//! views built from the same dimensions in any order compare equal and map
//! to the same [`ViewKey`].
//!
//! Values end up in storage paths, so a usable view only carries values
//! made of `a-z`, `0-9`, `-` and `_`; see [`View::validate`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AfsError;

/// A view dimension, in canonical key order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dimension {
    /// Target language (e.g. `en`, `zh`)
    Language,
    /// Output format (e.g. `png`, `md`)
    Format,
    /// Driver-specific variant (e.g. `thumbnail`)
    Variant,
    /// Generation policy hint
    Policy,
}

impl Dimension {
    /// All dimensions in canonical order.
    pub const ALL: [Dimension; 4] = [
        Dimension::Language,
        Dimension::Format,
        Dimension::Variant,
        Dimension::Policy,
    ];

    /// The dimension's name as used in view keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            Dimension::Language => "language",
            Dimension::Format => "format",
            Dimension::Variant => "variant",
            Dimension::Policy => "policy",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dimension {
    type Err = AfsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "language" => Ok(Dimension::Language),
            "format" => Ok(Dimension::Format),
            "variant" => Ok(Dimension::Variant),
            "policy" => Ok(Dimension::Policy),
            other => Err(AfsError::Validation(format!(
                "unknown view dimension: {other}"
            ))),
        }
    }
}

/// A requested projection of an entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct View {
    values: [Option<String>; 4],
}

impl View {
    /// Create an empty view.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a view from `(name, value)` pairs supplied in any order.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self, AfsError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut view = View::new();
        for (name, value) in pairs {
            let dim: Dimension = name.as_ref().parse()?;
            view.set(dim, value.as_ref());
        }
        view.validate()?;
        Ok(view)
    }

    /// Parse a `name=value;name=value` string. Dimension order is irrelevant.
    pub fn parse(s: &str) -> Result<Self, AfsError> {
        let pairs = s
            .split(';')
            .filter(|part| !part.trim().is_empty())
            .map(|part| {
                part.split_once('=')
                    .ok_or_else(|| AfsError::Validation(format!("malformed view part: {part}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_pairs(pairs)
    }

    /// Set a dimension. Blank values clear it.
    pub fn set(&mut self, dim: Dimension, value: &str) {
        let value = value.trim().to_lowercase();
        self.values[dim.index()] = (!value.is_empty()).then_some(value);
    }

    /// Builder-style [`View::set`].
    pub fn with(mut self, dim: Dimension, value: &str) -> Self {
        self.set(dim, value);
        self
    }

    /// Shorthand for a language-only view.
    pub fn language(value: &str) -> Self {
        View::new().with(Dimension::Language, value)
    }

    /// Get a dimension's normalized value.
    pub fn get(&self, dim: Dimension) -> Option<&str> {
        self.values[dim.index()].as_deref()
    }

    /// Present dimensions in canonical order.
    pub fn dimensions(&self) -> impl Iterator<Item = (Dimension, &str)> {
        Dimension::ALL
            .into_iter()
            .filter_map(|dim| self.get(dim).map(|v| (dim, v)))
    }

    /// Reject values that could not appear as a single path segment.
    pub fn validate(&self) -> Result<(), AfsError> {
        for (dim, value) in self.dimensions() {
            let valid = value
                .bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-' || b == b'_');
            if !valid {
                return Err(AfsError::Validation(format!(
                    "invalid {dim} value {value:?}: expected a-z, 0-9, '-' or '_'"
                )));
            }
        }
        Ok(())
    }

    /// Whether no dimension is set.
    pub fn is_empty(&self) -> bool {
        self.values.iter().all(Option::is_none)
    }

    /// Canonical key for this view.
    pub fn key(&self) -> ViewKey {
        normalize_view_key(self)
    }
}

/// Canonical, order-independent encoding of a [`View`].
///
/// Dimensions appear in the fixed order language, format, variant, policy as
/// `name=value`, joined by `;`. The empty view maps to the empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ViewKey(String);

impl ViewKey {
    /// Wrap a key read back from storage.
    pub fn from_stored(key: impl Into<String>) -> Self {
        ViewKey(key.into())
    }

    /// The key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Decode the key back into a view.
    pub fn to_view(&self) -> Result<View, AfsError> {
        View::parse(&self.0)
    }
}

impl fmt::Display for ViewKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute the canonical key of a view.
pub fn normalize_view_key(view: &View) -> ViewKey {
    let key = view
        .dimensions()
        .map(|(dim, value)| format!("{}={}", dim.as_str(), value))
        .collect::<Vec<_>>()
        .join(";");
    ViewKey(key)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_order_independent_and_case_folded() {
        let a = View::from_pairs([("format", "PNG"), ("language", "EN")]).unwrap();
        let b = View::from_pairs([("language", "en"), ("format", "png")]).unwrap();
        assert_eq!(a, b);
        assert_eq!(normalize_view_key(&a), normalize_view_key(&b));
        assert_eq!(a.key().as_str(), "language=en;format=png");
    }

    #[test]
    fn test_key_for_every_permutation() {
        let pairs = [
            ("policy", " Draft "),
            ("variant", "Thumb"),
            ("format", "webp"),
            ("language", "ZH"),
        ];
        let expected = "language=zh;format=webp;variant=thumb;policy=draft";
        // Rotations and reversals cover every position for every dimension
        for shift in 0..pairs.len() {
            let mut rotated = pairs.to_vec();
            rotated.rotate_left(shift);
            let view = View::from_pairs(rotated.iter().copied()).unwrap();
            assert_eq!(view.key().as_str(), expected);
            rotated.reverse();
            let view = View::from_pairs(rotated.iter().copied()).unwrap();
            assert_eq!(view.key().as_str(), expected);
        }
    }

    #[test]
    fn test_empty_view_key() {
        assert_eq!(View::new().key().as_str(), "");
        let blank = View::from_pairs([("language", "   ")]).unwrap();
        assert!(blank.is_empty());
        assert_eq!(blank.key().as_str(), "");
    }

    #[test]
    fn test_unknown_dimension_rejected() {
        assert!(View::from_pairs([("colour", "red")]).is_err());
    }

    #[test]
    fn test_values_must_be_single_segments() {
        for bad in ["en/x", "..", "../en", "e.n", "en\tx", "fr;format=png", "ü"] {
            assert!(
                matches!(View::from_pairs([("language", bad)]), Err(AfsError::Validation(_))),
                "{bad:?} accepted"
            );
        }
        assert!(View::parse("language=en/x").is_err());
        assert!(View::language("en/x").validate().is_err());
        assert!(View::parse("language=zh-hans;variant=thumb_2").is_ok());
    }

    #[test]
    fn test_parse_round_trip() {
        let view = View::parse("format=png; language=en").unwrap();
        assert_eq!(view.get(Dimension::Language), Some("en"));
        assert_eq!(view.key().to_view().unwrap(), view);
        assert!(View::parse("language").is_err());
    }
}
