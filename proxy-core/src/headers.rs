//! Component B: a case-insensitive, multi-valued, order-preserving header
//! bag.

use std::fmt;

/// One `(name, value)` pair as it arrived off the wire (or was set by a
/// filter). Name casing is preserved for re-serialization; comparisons
/// against it are always case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    name: String,
    value: String,
}

/// An ordered multimap of case-insensitive header names to ordered values.
/// Duplicate names are preserved in the order they were appended; iteration
/// walks the whole bag in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<Entry>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First value for `name`, case-insensitive, or `None` if absent.
    pub fn get_first(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
            .map(|e| e.value.as_str())
    }

    /// All values for `name`, in insertion order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.name.eq_ignore_ascii_case(name))
            .map(|e| e.value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e.name.eq_ignore_ascii_case(name))
    }

    /// Removes every existing value for `name` and inserts a single new
    /// value at the position of the first removed entry (or at the end if
    /// `name` was absent).
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let first_idx = self.entries.iter().position(|e| e.name.eq_ignore_ascii_case(&name));
        self.entries.retain(|e| !e.name.eq_ignore_ascii_case(&name));
        let entry = Entry { name, value: value.into() };
        match first_idx {
            Some(idx) if idx <= self.entries.len() => self.entries.insert(idx, entry),
            _ => self.entries.push(entry),
        }
    }

    /// Appends another value for `name` without disturbing existing ones.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.push(Entry { name: name.into(), value: value.into() });
    }

    /// Removes every value for `name`, returning whatever was removed.
    pub fn remove(&mut self, name: &str) -> Vec<String> {
        let mut removed = Vec::new();
        self.entries.retain(|e| {
            if e.name.eq_ignore_ascii_case(name) {
                removed.push(e.value.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|e| (e.name.as_str(), e.value.as_str()))
    }

    /// Names present, de-duplicated, in order of first appearance.
    pub fn names(&self) -> Vec<&str> {
        let mut seen: Vec<&str> = Vec::new();
        for e in &self.entries {
            if !seen.iter().any(|n| n.eq_ignore_ascii_case(e.name.as_str())) {
                seen.push(e.name.as_str());
            }
        }
        seen
    }
}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.iter() {
            write!(f, "{name}: {value}\r\n")?;
        }
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Headers {
    type Item = (&'a str, &'a str);
    type IntoIter = Box<dyn Iterator<Item = (&'a str, &'a str)> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preserves_insertion_order_across_distinct_names() {
        let mut h = Headers::new();
        h.append("Host", "example.com");
        h.append("Accept", "*/*");
        h.append("X-Foo", "1");
        let names: Vec<&str> = h.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["Host", "Accept", "X-Foo"]);
    }

    #[test]
    fn get_is_case_insensitive() {
        let mut h = Headers::new();
        h.append("Content-Type", "text/plain");
        assert_eq!(h.get_first("content-type"), Some("text/plain"));
        assert_eq!(h.get_first("CONTENT-TYPE"), Some("text/plain"));
    }

    #[test]
    fn duplicates_preserved_in_order() {
        let mut h = Headers::new();
        h.append("Via", "1.1 a");
        h.append("Via", "1.1 b");
        let all: Vec<&str> = h.get_all("via").collect();
        assert_eq!(all, vec!["1.1 a", "1.1 b"]);
    }

    #[test]
    fn set_replaces_all_existing_values_at_first_position() {
        let mut h = Headers::new();
        h.append("X-A", "1");
        h.append("Via", "old-1");
        h.append("Via", "old-2");
        h.append("X-B", "2");
        h.set("Via", "new");
        let names: Vec<&str> = h.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["X-A", "Via", "X-B"]);
        assert_eq!(h.get_all("via").collect::<Vec<_>>(), vec!["new"]);
    }

    #[test]
    fn remove_returns_removed_values() {
        let mut h = Headers::new();
        h.append("X-Foo", "1");
        h.append("X-Foo", "2");
        let removed = h.remove("x-foo");
        assert_eq!(removed, vec!["1", "2"]);
        assert!(!h.contains("X-Foo"));
    }

    #[test]
    fn names_deduplicates_preserving_first_occurrence_order() {
        let mut h = Headers::new();
        h.append("Via", "a");
        h.append("X-Foo", "1");
        h.append("Via", "b");
        assert_eq!(h.names(), vec!["Via", "X-Foo"]);
    }
}
