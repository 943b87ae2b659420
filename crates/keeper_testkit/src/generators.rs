//! Property-based test generators using proptest.
//!
//! Provides strategies for paths, key prefixes and directory trees.

use crate::tree::MemoryTree;
use keeper_core::key::MAX_DIRECT_PATH_LEN;
use proptest::prelude::*;

/// Strategy for one path segment.
pub fn segment_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z0-9._-]{1,8}").expect("Invalid regex")
}

/// Strategy for absolute paths of one to six segments.
pub fn path_strategy() -> impl Strategy<Value = String> {
    prop::collection::vec(segment_strategy(), 1..6)
        .prop_map(|segments| format!("/{}", segments.join("/")))
}

/// Strategy for paths too long to be stored directly.
pub fn long_path_strategy() -> impl Strategy<Value = String> {
    (path_strategy(), MAX_DIRECT_PATH_LEN..MAX_DIRECT_PATH_LEN + 200)
        .prop_map(|(base, len)| format!("{base}/{}", "l".repeat(len)))
}

/// Strategy for any path, occasionally long or holding a NUL.
pub fn any_path_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        6 => path_strategy(),
        1 => long_path_strategy(),
        1 => path_strategy().prop_map(|p| format!("{p}\0x")),
    ]
}

/// Strategy for byte prefixes biased towards `0xFF` tails.
pub fn byte_prefix_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 0..6),
        (prop::collection::vec(any::<u8>(), 0..4), 1..4usize).prop_map(|(mut bytes, tail)| {
            bytes.extend(std::iter::repeat(u8::MAX).take(tail));
            bytes
        }),
    ]
}

/// A generated directory tree: files relative to a root, each with whether
/// it resolves as excluded.
#[derive(Debug, Clone)]
pub struct TreeSpec {
    /// Relative file paths and exclusion flags.
    pub files: Vec<(String, bool)>,
}

impl TreeSpec {
    /// Builds the tree under `root`.
    pub fn build(&self, root: &str) -> MemoryTree {
        let mut tree = MemoryTree::new(root);
        for (file, excluded) in &self.files {
            let path = format!("{root}/{file}");
            if *excluded {
                tree.add_excluded_file(&path);
            } else {
                tree.add_file(&path);
            }
        }
        tree
    }
}

/// Strategy for small directory trees up to three levels deep.
pub fn tree_strategy() -> impl Strategy<Value = TreeSpec> {
    let dir = prop::sample::select(vec!["a", "b", "c"]);
    let file = prop::sample::select(vec!["x", "y", "z"]);
    prop::collection::vec(
        (prop::collection::vec(dir, 0..3), file, prop::bool::weighted(0.2)),
        1..12,
    )
    .prop_map(|entries| {
        let mut files: Vec<(String, bool)> = Vec::new();
        for (dirs, file, excluded) in entries {
            let mut path = dirs.join("/");
            if !path.is_empty() {
                path.push('/');
            }
            path.push_str(file);
            path.push_str(".f");
            if !files.iter().any(|(existing, _)| *existing == path) {
                files.push((path, excluded));
            }
        }
        TreeSpec { files }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::strategy::ValueTree;
    use proptest::test_runner::TestRunner;

    #[test]
    fn generated_trees_build() {
        let mut runner = TestRunner::default();
        for _ in 0..16 {
            let spec = tree_strategy().new_tree(&mut runner).unwrap().current();
            let tree = spec.build("/r");
            assert_eq!(crate::tree::files_below(&tree, "/r").len(), spec.files.len());
        }
    }

    proptest! {
        #[test]
        fn long_paths_exceed_the_direct_limit(path in long_path_strategy()) {
            prop_assert!(path.len() > MAX_DIRECT_PATH_LEN);
        }
    }
}
