//! Storage entry and transaction types.

use serde::Deserialize;
use serde::Serialize;

/// The unit of physical storage: a path-shaped key and an opaque value.
///
/// Keys are non-empty strings; `/` acts as a logical separator for
/// [`list`](crate::Backend::list) folder computation. Lexicographic key order
/// is the iteration order for prefix scans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub key: String,
    pub value: Vec<u8>,
}

impl Entry {
    pub fn new(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Mutation kind inside a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Put,
    Delete,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operation::Put => write!(f, "put"),
            Operation::Delete => write!(f, "delete"),
        }
    }
}

/// One operation of an atomic transaction: apply all or none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnEntry {
    pub operation: Operation,
    pub entry: Entry,
}

impl TxnEntry {
    pub fn put(entry: Entry) -> Self {
        Self {
            operation: Operation::Put,
            entry,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            operation: Operation::Delete,
            entry: Entry::new(key, Vec::new()),
        }
    }
}

/// Fold one prefix-stripped key into a list result.
///
/// Keys must be visited in lexicographic order. A remainder containing `/`
/// contributes its first segment plus the separator, deduplicated against the
/// previous emission; a plain remainder is a leaf and is emitted as-is.
pub fn list_push_name(names: &mut Vec<String>, stripped: &str) {
    match stripped.find('/') {
        None => names.push(stripped.to_string()),
        Some(i) => {
            let folder = &stripped[..=i];
            if names.last().map(String::as_str) != Some(folder) {
                names.push(folder.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_push_collapses_folders() {
        let mut names = Vec::new();
        for key in ["bar", "foo/a", "foo/b", "foo/c/d", "zip"] {
            list_push_name(&mut names, key);
        }
        assert_eq!(names, vec!["bar", "foo/", "zip"]);
    }

    #[test]
    fn list_push_keeps_leaves_and_folders_apart() {
        let mut names = Vec::new();
        for key in ["foo", "foo/bar"] {
            list_push_name(&mut names, key);
        }
        assert_eq!(names, vec!["foo", "foo/"]);
    }
}
