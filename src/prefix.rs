//! The five-hex-digit keyspace that partitions the whole dataset.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::FusedIterator;
use std::str::FromStr;

/// Number of hex digits in a prefix.
pub const PREFIX_LEN: usize = 5;

/// Number of distinct prefixes (16^5).
pub const PREFIX_COUNT: u32 = 1 << (4 * PREFIX_LEN as u32);

/// A range partition key, `00000` to `FFFFF`.
///
/// Stored as its numeric value; always rendered as five uppercase hex digits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Prefix(u32);

impl Prefix {
    /// Returns the prefix with the given numeric value, if it is in range.
    pub fn from_index(index: u32) -> Option<Self> {
        (index < PREFIX_COUNT).then_some(Self(index))
    }

    /// Numeric value of the prefix.
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:05X}", self.0)
    }
}

impl FromStr for Prefix {
    type Err = SyncError;

    /// Parses five hex digits, either case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != PREFIX_LEN || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(SyncError::InvalidPrefix(s.to_string()));
        }
        u32::from_str_radix(s, 16)
            .map(Self)
            .map_err(|_| SyncError::InvalidPrefix(s.to_string()))
    }
}

impl From<Prefix> for String {
    fn from(prefix: Prefix) -> Self {
        prefix.to_string()
    }
}

impl TryFrom<String> for Prefix {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Lazy, ordered enumeration of every prefix.
///
/// Yields `00000` through `FFFFF` exactly once each. A fresh `PrefixSpace`
/// always starts over, so an interrupted enumeration is restarted by creating
/// a new one (optionally with [`PrefixSpace::starting_at`]).
///
/// # Example
///
/// ```
/// use pwnsync::PrefixSpace;
///
/// let first: Vec<String> = PrefixSpace::new().take(2).map(|p| p.to_string()).collect();
/// assert_eq!(first, ["00000", "00001"]);
/// ```
#[derive(Debug, Clone)]
pub struct PrefixSpace {
    next: u32,
}

impl PrefixSpace {
    pub fn new() -> Self {
        Self { next: 0 }
    }

    /// Enumerates from `start` (inclusive) to `FFFFF`.
    pub fn starting_at(start: Prefix) -> Self {
        Self { next: start.index() }
    }
}

impl Default for PrefixSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl Iterator for PrefixSpace {
    type Item = Prefix;

    fn next(&mut self) -> Option<Prefix> {
        let prefix = Prefix::from_index(self.next)?;
        self.next += 1;
        Some(prefix)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = PREFIX_COUNT.saturating_sub(self.next) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for PrefixSpace {}

impl FusedIterator for PrefixSpace {}
