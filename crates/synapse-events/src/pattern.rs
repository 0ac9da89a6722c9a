//! Subscription patterns and the matcher.
//!
//! Names and patterns are dot-segmented. Every segment is a non-empty
//! `[A-Za-z0-9_]+` token. In a pattern, the segment `any` matches exactly one
//! event segment at the same position. Segment counts must be equal for a
//! match: `any.critical` matches `system.critical` but never
//! `system.alerts.critical`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use synapse_core::{BusError, BusResult};

use crate::envelope::EventName;

/// The single-segment wildcard token.
pub const WILDCARD: &str = "any";

/// Check a dot-segmented identifier, returning the rejection reason.
pub(crate) fn check_segments(text: &str) -> Result<(), String> {
    if text.is_empty() {
        return Err("must not be empty".to_string());
    }

    for (position, segment) in text.split('.').enumerate() {
        if segment.is_empty() {
            return Err(format!("empty segment at position {position}"));
        }
        if let Some(bad) = segment
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_'))
        {
            return Err(format!(
                "segment '{segment}' contains '{bad}'; only letters, digits and '_' are allowed"
            ));
        }
    }

    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Segment {
    Literal(String),
    Any,
}

/// A validated subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pattern {
    text: String,
    segments: Vec<Segment>,
}

impl Pattern {
    /// Parse and validate a pattern.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidPattern`] for empty patterns, empty
    /// segments, or segments with characters outside `[A-Za-z0-9_]`.
    pub fn parse(text: &str) -> BusResult<Self> {
        check_segments(text).map_err(|reason| BusError::InvalidPattern {
            pattern: text.to_string(),
            reason,
        })?;

        let segments = text
            .split('.')
            .map(|s| {
                if s == WILDCARD {
                    Segment::Any
                } else {
                    Segment::Literal(s.to_string())
                }
            })
            .collect();

        Ok(Self {
            text: text.to_string(),
            segments,
        })
    }

    /// The pattern text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Number of segments.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Number of `any` segments.
    #[must_use]
    pub fn wildcard_count(&self) -> usize {
        self.segments
            .iter()
            .filter(|s| matches!(s, Segment::Any))
            .count()
    }

    /// Whether the pattern has no wildcard and so matches one name only.
    #[must_use]
    pub fn is_literal(&self) -> bool {
        self.wildcard_count() == 0
    }

    /// The first segment when it is a literal, `None` when it is `any`.
    #[must_use]
    pub fn first_literal(&self) -> Option<&str> {
        match self.segments.first() {
            Some(Segment::Literal(s)) => Some(s),
            _ => None,
        }
    }

    /// Whether this pattern matches the event name.
    #[must_use]
    pub fn matches(&self, name: &EventName) -> bool {
        if self.segments.len() != name.segment_count() {
            return false;
        }

        self.segments
            .iter()
            .zip(name.segments())
            .all(|(pattern, event)| match pattern {
                Segment::Any => true,
                Segment::Literal(literal) => literal == event,
            })
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for Pattern {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Pattern {
    type Error = BusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Pattern> for String {
    fn from(pattern: Pattern) -> Self {
        pattern.text
    }
}

/// Decide whether `pattern` matches `name`.
#[must_use]
pub fn matches(pattern: &Pattern, name: &EventName) -> bool {
    pattern.matches(name)
}

/// Match raw, unvalidated strings.
///
/// Empty inputs and inputs with empty segments never match. No other
/// validation is applied, so this is meant for diagnostics and tests rather
/// than the dispatch path.
#[must_use]
pub fn matches_str(pattern: &str, name: &str) -> bool {
    if pattern.is_empty() || name.is_empty() {
        return false;
    }

    let pattern_segments: Vec<&str> = pattern.split('.').collect();
    let name_segments: Vec<&str> = name.split('.').collect();

    if pattern_segments.len() != name_segments.len()
        || pattern_segments.iter().any(|s| s.is_empty())
        || name_segments.iter().any(|s| s.is_empty())
    {
        return false;
    }

    pattern_segments
        .iter()
        .zip(&name_segments)
        .all(|(p, n)| *p == WILDCARD || p == n)
}
