//! The set of source objects waiting to be archived.

use std::collections::{HashMap, HashSet};

use crate::error::{Error, Result};

/// One source object and the path it gets inside the archive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceEntry {
    pub member: String,
    pub key: String,
}

impl SourceEntry {
    pub fn new(member: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            member: member.into(),
            key: key.into(),
        }
    }

    /// Name of the JSON sidecar holding this object's metadata.
    pub fn sidecar_member(&self) -> String {
        format!("{}.metadata.json", self.member)
    }
}

/// Normalises a target folder inside the archive: empty, or ending in `/`.
pub fn folder_prefix(folder: &str) -> String {
    if folder.is_empty() || folder.ends_with('/') {
        folder.to_string()
    } else {
        format!("{folder}/")
    }
}

/// Member path for a single key: the last path component of the key, placed under `folder`.
pub fn member_for_key(key: &str, folder: &str) -> String {
    let name = key.rsplit('/').next().unwrap_or(key);
    format!("{}{name}", folder_prefix(folder))
}

/// Member path for a key found by listing `prefix`.
///
/// With `preserve_paths` the part of the key below `prefix` is kept (without a leading `/`, tar
/// members are relative), otherwise only the file name is.
pub fn member_for_listed_key(key: &str, prefix: &str, folder: &str, preserve_paths: bool) -> String {
    if preserve_paths {
        let relative = key.strip_prefix(prefix).unwrap_or(key).trim_start_matches('/');
        format!("{}{relative}", folder_prefix(folder))
    } else {
        member_for_key(key, folder)
    }
}

/// Registered entries in registration order, indexed by member name for duplicate checks.
#[derive(Debug, Default)]
pub struct PendingKeySet {
    entries: Vec<SourceEntry>,
    by_member: HashMap<String, HashSet<String>>,
}

impl PendingKeySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry.  Returns `false` if exactly this entry was already registered.
    ///
    /// A member name that is already mapped to a different key is rejected with
    /// [`Error::DuplicateMember`] unless `allow_dups` is set.
    pub fn insert(&mut self, entry: SourceEntry, allow_dups: bool) -> Result<bool> {
        let keys = self.by_member.entry(entry.member.clone()).or_default();
        if keys.contains(&entry.key) {
            return Ok(false);
        }
        if !allow_dups {
            if let Some(existing) = keys.iter().next() {
                return Err(Error::DuplicateMember {
                    member: entry.member,
                    existing: existing.clone(),
                    key: entry.key,
                });
            }
        }

        keys.insert(entry.key.clone());
        self.entries.push(entry);
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &SourceEntry> {
        self.entries.iter()
    }

    /// Removes and returns every entry, leaving the set empty.
    pub fn drain(&mut self) -> Vec<SourceEntry> {
        self.by_member.clear();
        std::mem::take(&mut self.entries)
    }
}

#[cfg(test)]
mod test {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn test_member_paths() {
        assert_eq!(member_for_key("this_is_a/test.file", ""), "test.file");
        assert_eq!(member_for_key("plain", "out"), "out/plain");
        assert_eq!(member_for_key("a/b/c.txt", "out/"), "out/c.txt");

        assert_eq!(
            member_for_listed_key("some_folder/a/b.txt", "some_folder", "", true),
            "a/b.txt"
        );
        assert_eq!(
            member_for_listed_key("some_folder/a/b.txt", "some_folder/", "dest", true),
            "dest/a/b.txt"
        );
        assert_eq!(
            member_for_listed_key("some_folder/a/b.txt", "some_folder", "dest", false),
            "dest/b.txt"
        );
    }

    #[test]
    fn test_same_pair_is_idempotent() {
        let mut set = PendingKeySet::new();
        assert!(set.insert(SourceEntry::new("test.file", "this_is_a/test.file"), false).unwrap());
        assert!(!set.insert(SourceEntry::new("test.file", "this_is_a/test.file"), false).unwrap());
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_conflicting_member_rejected() {
        let mut set = PendingKeySet::new();
        set.insert(SourceEntry::new("test.file", "this_is_a/test.file"), false)
            .unwrap();
        let err = set
            .insert(SourceEntry::new("test.file", "this_is_another/test.file"), false)
            .unwrap_err();
        match err {
            Error::DuplicateMember {
                member,
                existing,
                key,
            } => {
                assert_eq!(member, "test.file");
                assert_eq!(existing, "this_is_a/test.file");
                assert_eq!(key, "this_is_another/test.file");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_conflicting_member_allowed() {
        let mut set = PendingKeySet::new();
        set.insert(SourceEntry::new("test.file", "a/test.file"), true)
            .unwrap();
        set.insert(SourceEntry::new("test.file", "b/test.file"), true)
            .unwrap();
        assert_eq!(set.len(), 2);

        let drained = set.drain();
        assert_eq!(
            drained,
            vec![
                SourceEntry::new("test.file", "a/test.file"),
                SourceEntry::new("test.file", "b/test.file"),
            ]
        );
        assert!(set.is_empty());
    }

    #[test]
    fn test_sidecar_name() {
        assert_eq!(
            SourceEntry::new("dir/thing1.txt", "k").sidecar_member(),
            "dir/thing1.txt.metadata.json"
        );
    }
}
