//! Coordinate Model - Hierarchical Asset Addresses
//!
//! A coordinate is `Category.Domain.Attribute.State[.qualifier...]`.
//! Equality and hashing are defined over the canonical string, so two
//! coordinates that print the same are the same address.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use crate::error::{CoreError, Result};
use crate::schema::{Attribute, Category, Domain, State};

pub const SEPARATOR: char = '.';
pub const FIXED_SEGMENTS: usize = 4;

/// Tail segments starting with this character are directives.
pub const DIRECTIVE_PREFIX: char = '@';
pub const IMPORT_DIRECTIVE: &str = "@import";
pub const REF_DIRECTIVE: &str = "@ref:";
/// Separates the parent's segments inside a `@ref:` directive.
pub const REF_SEPARATOR: char = ':';

#[derive(Clone)]
pub struct Coordinate {
    category: Category,
    domain: Domain,
    attribute: Attribute,
    state: State,
    tail: Vec<String>,
    canonical: String,
}

/// A qualifier segment with special meaning to the validator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive<'a> {
    /// Explicit import; the record did not pass through its predecessor states here.
    Import,
    /// Reference to a parent coordinate, segments joined by `:`.
    Ref(&'a str),
    Unknown(&'a str),
}

impl Coordinate {
    pub fn new<I, S>(
        category: Category,
        domain: Domain,
        attribute: Attribute,
        state: State,
        tail: I,
    ) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tail: Vec<String> = tail.into_iter().map(Into::into).collect();
        if let Some(bad) = tail.iter().find(|s| s.contains(SEPARATOR)) {
            return Err(CoreError::malformed(
                bad,
                format!("qualifier segment may not contain '{}'", SEPARATOR),
            ));
        }
        Ok(Self::assemble(category, domain, attribute, state, tail))
    }

    fn assemble(
        category: Category,
        domain: Domain,
        attribute: Attribute,
        state: State,
        tail: Vec<String>,
    ) -> Self {
        let mut canonical = format!("{}.{}.{}.{}", category, domain, attribute, state);
        for segment in &tail {
            canonical.push(SEPARATOR);
            canonical.push_str(segment);
        }
        Self {
            category,
            domain,
            attribute,
            state,
            tail,
            canonical,
        }
    }

    /// Parse a coordinate string. Fixed segments must match their
    /// vocabulary exactly (case-sensitive). Qualifier content is checked
    /// by the validator, not here.
    pub fn parse(text: &str) -> Result<Self> {
        let segments: Vec<&str> = text.split(SEPARATOR).collect();
        if segments.len() < FIXED_SEGMENTS {
            return Err(CoreError::malformed(
                text,
                format!(
                    "expected at least {} segments, found {}",
                    FIXED_SEGMENTS,
                    segments.len()
                ),
            ));
        }

        let category = Category::parse(segments[0])
            .ok_or_else(|| CoreError::malformed(text, format!("unknown category '{}'", segments[0])))?;
        let domain = Domain::parse(segments[1])
            .ok_or_else(|| CoreError::malformed(text, format!("unknown domain '{}'", segments[1])))?;
        let attribute = Attribute::parse(segments[2]).ok_or_else(|| {
            CoreError::malformed(text, format!("unknown attribute '{}'", segments[2]))
        })?;
        let state = State::parse(segments[3])
            .ok_or_else(|| CoreError::malformed(text, format!("unknown state '{}'", segments[3])))?;

        let tail = segments[FIXED_SEGMENTS..].iter().map(|s| s.to_string()).collect();
        Ok(Self::assemble(category, domain, attribute, state, tail))
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    pub fn attribute(&self) -> Attribute {
        self.attribute
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn tail(&self) -> &[String] {
        &self.tail
    }

    pub fn as_str(&self) -> &str {
        &self.canonical
    }

    /// Storage lookup key: fixed segments lower-cased, tail verbatim.
    pub fn key(&self) -> String {
        let mut key = self.fixed_key_prefix(FIXED_SEGMENTS);
        for segment in &self.tail {
            key.push(SEPARATOR);
            key.push_str(segment);
        }
        key
    }

    fn fixed_key_prefix(&self, count: usize) -> String {
        [
            self.category.as_str(),
            self.domain.as_str(),
            self.attribute.as_str(),
            self.state.as_str(),
        ][..count]
            .iter()
            .map(|s| s.to_ascii_lowercase())
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Canonical form with the State segment removed. Records that differ
    /// only in state share an address.
    pub fn address(&self) -> String {
        let mut address = format!("{}.{}.{}", self.category, self.domain, self.attribute);
        for segment in &self.tail {
            address.push(SEPARATOR);
            address.push_str(segment);
        }
        address
    }

    /// Same address, different state.
    pub fn with_state(&self, state: State) -> Self {
        Self::assemble(self.category, self.domain, self.attribute, state, self.tail.clone())
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> + '_ {
        self.canonical.split(SEPARATOR)
    }

    /// Number of leading segments shared with `other`.
    pub fn shared_prefix_len(&self, other: &Coordinate) -> usize {
        self.segments()
            .zip(other.segments())
            .take_while(|(a, b)| a == b)
            .count()
    }

    pub fn directives(&self) -> impl Iterator<Item = Directive<'_>> + '_ {
        self.tail
            .iter()
            .filter(|s| s.starts_with(DIRECTIVE_PREFIX))
            .map(|s| {
                if s == IMPORT_DIRECTIVE {
                    Directive::Import
                } else if let Some(target) = s.strip_prefix(REF_DIRECTIVE) {
                    Directive::Ref(target)
                } else {
                    Directive::Unknown(s)
                }
            })
    }

    pub fn is_import(&self) -> bool {
        self.directives().any(|d| d == Directive::Import)
    }

    /// The parent named by the first `@ref:` directive, if any.
    pub fn parent_ref(&self) -> Option<Result<Coordinate>> {
        self.directives().find_map(|d| match d {
            Directive::Ref(target) => Some(parse_ref_target(target)),
            _ => None,
        })
    }
}

pub(crate) fn parse_ref_target(target: &str) -> Result<Coordinate> {
    let text = target.replace(REF_SEPARATOR, &SEPARATOR.to_string());
    Coordinate::parse(&text)
}

impl PartialEq for Coordinate {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for Coordinate {}

impl Hash for Coordinate {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical.hash(state);
    }
}

impl PartialOrd for Coordinate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Coordinate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical.cmp(&other.canonical)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical)
    }
}

impl fmt::Debug for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Coordinate({})", self.canonical)
    }
}

impl FromStr for Coordinate {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Coordinate::parse(s)
    }
}

impl Serialize for Coordinate {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical)
    }
}

impl<'de> Deserialize<'de> for Coordinate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        Coordinate::parse(&text).map_err(serde::de::Error::custom)
    }
}

/// A leading run of coordinate segments used for range scans.
///
/// Fixed segments match case-insensitively; qualifier segments verbatim.
/// Matching is segment-aligned: `Music.Vo` does not match `Music.Vocal`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatePrefix {
    key: String,
}

impl CoordinatePrefix {
    /// The empty prefix, matching every coordinate.
    pub fn all() -> Self {
        Self { key: String::new() }
    }

    pub fn parse(text: &str) -> Result<Self> {
        if text.is_empty() {
            return Ok(Self::all());
        }

        let mut parts = Vec::new();
        for (i, segment) in text.split(SEPARATOR).enumerate() {
            let known = match i {
                0 => Category::parse_ignore_case(segment).map(|v| v.as_str()),
                1 => Domain::parse_ignore_case(segment).map(|v| v.as_str()),
                2 => Attribute::parse_ignore_case(segment).map(|v| v.as_str()),
                3 => State::parse_ignore_case(segment).map(|v| v.as_str()),
                _ => {
                    parts.push(segment.to_string());
                    continue;
                }
            };
            let name = known.ok_or_else(|| {
                CoreError::malformed(text, format!("unknown segment '{}' at position {}", segment, i))
            })?;
            parts.push(name.to_ascii_lowercase());
        }

        Ok(Self { key: parts.join(".") })
    }

    /// Prefix covering the first `segments` segments of `coordinate`.
    pub fn of(coordinate: &Coordinate, segments: usize) -> Self {
        if segments == 0 {
            return Self::all();
        }
        let key = coordinate.key();
        let cut = key
            .match_indices(SEPARATOR)
            .nth(segments - 1)
            .map(|(i, _)| i)
            .unwrap_or(key.len());
        Self {
            key: key[..cut].to_string(),
        }
    }

    /// The normalized key prefix; scans start at the first key `>=` this.
    pub fn as_key(&self) -> &str {
        &self.key
    }

    pub fn matches_key(&self, key: &str) -> bool {
        if self.key.is_empty() {
            return true;
        }
        match key.strip_prefix(self.key.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with(SEPARATOR),
            None => false,
        }
    }

    pub fn matches(&self, coordinate: &Coordinate) -> bool {
        self.matches_key(&coordinate.key())
    }
}

impl FromStr for CoordinatePrefix {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        CoordinatePrefix::parse(s)
    }
}
