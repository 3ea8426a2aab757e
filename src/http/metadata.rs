//! Call metadata
//!
//! This module provides the ordered key/value collection carried by HTTP/2
//! header blocks: the initial metadata of a call and its trailing metadata.
//! Names are stored lowercased as HTTP/2 requires; values are raw bytes.

use bytes::Bytes;
use std::fmt;

/// Per-entry overhead used by HPACK size accounting (RFC 7541 Section 4.1)
const ENTRY_OVERHEAD: usize = 32;

/// Metadata collection
///
/// Entries are stored in insertion order and support:
/// - Case-insensitive name lookups
/// - Multiple values for the same name
/// - Iteration over all entries
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, Bytes)>,
}

impl Metadata {
    /// Create a new empty metadata collection
    pub fn new() -> Self {
        Metadata {
            entries: Vec::new(),
        }
    }

    /// Insert an entry
    ///
    /// If an entry with the same name already exists, this adds another
    /// value rather than replacing it.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Bytes>) {
        let mut name = name.into();
        name.make_ascii_lowercase();
        self.entries.push((name, value.into()));
    }

    /// Get the first value for a name (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
    }

    /// Get the first value for a name as UTF-8
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(|v| std::str::from_utf8(v).ok())
    }

    /// Get all values for a name (case-insensitive)
    pub fn get_all(&self, name: &str) -> Vec<&Bytes> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v)
            .collect()
    }

    /// Check if an entry exists
    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Remove all instances of a name, returning how many were removed
    pub fn remove(&mut self, name: &str) -> usize {
        let initial_len = self.entries.len();
        self.entries.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        initial_len - self.entries.len()
    }

    /// Get the number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if there are no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over all entries
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Bytes)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    /// Uncompressed size as counted against SETTINGS_MAX_HEADER_LIST_SIZE
    pub fn encoded_size(&self) -> usize {
        self.entries
            .iter()
            .map(|(n, v)| n.len() + v.len() + ENTRY_OVERHEAD)
            .sum()
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in &self.entries {
            writeln!(f, "{}: {}", name, String::from_utf8_lossy(value))?;
        }
        Ok(())
    }
}

impl<N: Into<String>, V: Into<Bytes>> FromIterator<(N, V)> for Metadata {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut metadata = Metadata::new();
        for (name, value) in iter {
            metadata.insert(name, value);
        }
        metadata
    }
}
