//! An in-memory directory tree for driving scans.

use keeper_core::{join_path, ChildStatus, CoreResult, ScanSource, SourceEntry};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::io;

/// A directory tree held in memory.
///
/// Files resolve as included unless marked excluded. Every
/// [`ScanSource::process_file`] call is recorded.
#[derive(Debug, Default)]
pub struct MemoryTree {
    dirs: BTreeMap<String, Vec<SourceEntry>>,
    excluded: BTreeSet<String>,
    processed: Mutex<Vec<String>>,
}

impl MemoryTree {
    /// Creates a tree holding the empty directory `root`.
    pub fn new(root: &str) -> Self {
        let mut tree = Self::default();
        tree.dirs.insert(root.to_owned(), Vec::new());
        tree
    }

    /// Adds a directory, creating missing parents.
    pub fn add_dir(&mut self, path: &str) {
        if self.dirs.contains_key(path) {
            return;
        }
        self.dirs.insert(path.to_owned(), Vec::new());
        if let Some((parent, name)) = split(path) {
            self.add_dir(parent);
            self.link(parent, SourceEntry::dir(name));
        }
    }

    /// Adds a file, creating missing parent directories.
    pub fn add_file(&mut self, path: &str) {
        if let Some((parent, name)) = split(path) {
            self.add_dir(parent);
            self.link(parent, SourceEntry::file(name));
        }
    }

    /// Adds a file that resolves as excluded.
    pub fn add_excluded_file(&mut self, path: &str) {
        self.add_file(path);
        self.excluded.insert(path.to_owned());
    }

    /// Removes a directory and everything below it.
    pub fn remove_dir(&mut self, path: &str) {
        let below = format!("{path}/");
        self.dirs.retain(|dir, _| dir != path && !dir.starts_with(&below));
        if let Some((parent, name)) = split(path) {
            if let Some(children) = self.dirs.get_mut(parent) {
                children.retain(|child| child.name != name);
            }
        }
    }

    /// Returns every directory path.
    pub fn directories(&self) -> impl Iterator<Item = &str> {
        self.dirs.keys().map(String::as_str)
    }

    /// Returns the files processed so far, in call order.
    pub fn processed(&self) -> Vec<String> {
        self.processed.lock().clone()
    }

    fn link(&mut self, parent: &str, entry: SourceEntry) {
        let children = self.dirs.entry(parent.to_owned()).or_default();
        if !children.iter().any(|child| child.name == entry.name) {
            children.push(entry);
        }
    }
}

fn split(path: &str) -> Option<(&str, &str)> {
    let (parent, name) = path.rsplit_once('/')?;
    if name.is_empty() {
        return None;
    }
    Some((if parent.is_empty() { "/" } else { parent }, name))
}

impl ScanSource for MemoryTree {
    fn list(&self, path: &str) -> io::Result<Vec<SourceEntry>> {
        self.dirs
            .get(path)
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, path.to_owned()))
    }

    fn process_file(&self, path: &str) -> CoreResult<ChildStatus> {
        self.processed.lock().push(path.to_owned());
        Ok(if self.excluded.contains(path) {
            ChildStatus::Excluded
        } else {
            ChildStatus::Included
        })
    }
}

/// Lists every file of `tree` below `root`, depth first.
pub fn files_below(tree: &MemoryTree, root: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut stack = vec![root.to_owned()];
    while let Some(dir) = stack.pop() {
        for entry in tree.list(&dir).unwrap_or_default() {
            let path = join_path(&dir, &entry.name);
            if entry.directory {
                stack.push(path);
            } else {
                out.push(path);
            }
        }
    }
    out.sort();
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn files_create_their_parents() {
        let mut tree = MemoryTree::new("/r");
        tree.add_file("/r/a/b/c.txt");
        tree.add_excluded_file("/r/x.tmp");

        let dirs: Vec<_> = tree.directories().collect();
        assert_eq!(dirs, vec!["/r", "/r/a", "/r/a/b"]);
        assert_eq!(files_below(&tree, "/r"), vec!["/r/a/b/c.txt", "/r/x.tmp"]);
        assert_eq!(tree.process_file("/r/x.tmp").unwrap(), ChildStatus::Excluded);
        assert_eq!(tree.processed(), vec!["/r/x.tmp"]);

        tree.remove_dir("/r/a");
        assert_eq!(files_below(&tree, "/r"), vec!["/r/x.tmp"]);
        assert!(tree.list("/r/a/b").is_err());
    }
}
