use std::collections::HashSet;
use std::path::Path;

/// Device paths present in the namespace at one instant.
///
/// Paths keep the order they were enumerated in. A snapshot is never mutated
/// after it is taken; take a new one instead.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortSnapshot {
    paths: Vec<String>,
}

impl PortSnapshot {
    /// Snapshot over the given paths, in order. Duplicates are dropped.
    pub fn new<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let paths = paths
            .into_iter()
            .map(Into::into)
            .filter(|p| seen.insert(p.clone()))
            .collect();
        Self { paths }
    }

    /// Empty snapshot (nothing attached, or not running on hardware).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Paths in enumeration order.
    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// Iterate over paths in enumeration order.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.paths.iter().map(String::as_str)
    }

    /// Whether `path` was present.
    pub fn contains(&self, path: &str) -> bool {
        self.paths.iter().any(|p| p == path)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Whether the namespace was empty.
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Paths present here but not in `before`.
    pub fn new_since(&self, before: &PortSnapshot) -> Vec<String> {
        new_ports(before, self)
    }

    /// First path present here but not in `before`.
    ///
    /// When several devices appeared at once the first in enumeration order
    /// wins. Two modules re-enumerating in the same window can therefore be
    /// confused; callers that care must check [`PortSnapshot::new_since`].
    pub fn first_new_since(&self, before: &PortSnapshot) -> Option<String> {
        self.new_since(before).into_iter().next()
    }

    /// Paths whose final component ends with `suffix`.
    pub fn with_suffix(&self, suffix: &str) -> Vec<String> {
        self.paths
            .iter()
            .filter(|p| {
                Path::new(p.as_str())
                    .file_name()
                    .map(|name| name.to_string_lossy().ends_with(suffix))
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }
}

impl<'a> IntoIterator for &'a PortSnapshot {
    type Item = &'a String;
    type IntoIter = std::slice::Iter<'a, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.paths.iter()
    }
}

/// Ports in `after` that are not in `before`, in `after`'s order.
///
/// An empty result means no new device appeared. More than one result is
/// ambiguous; the crate-wide policy is to take the first, see
/// [`PortSnapshot::first_new_since`].
pub fn new_ports(before: &PortSnapshot, after: &PortSnapshot) -> Vec<String> {
    let known: HashSet<&str> = before.iter().collect();
    after
        .iter()
        .filter(|p| !known.contains(p))
        .map(str::to_string)
        .collect()
}
