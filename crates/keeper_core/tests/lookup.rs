//! Point-in-time lookups against a persistent store.

use keeper_core::key::prefix_range;
use keeper_core::{
    CoreError, Direction, DirectorySnapshot, FileVersion, ManualClock, RepositoryConfig, Table,
};
use keeper_storage::{InMemoryEngine, StorageEngine};
use keeper_testkit::{
    any_path_strategy, byte_prefix_strategy, open_lmdb, TestRepository, START_TIME,
};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use tempfile::TempDir;

#[test]
fn versions_resolve_by_time_and_prefix() {
    let repo = TestRepository::lmdb();
    repo.put_file_version(&FileVersion::new("/a/b.txt", 100, 10)).unwrap();
    repo.put_file_version(&FileVersion::new("/a/b.txt", 200, 20)).unwrap();
    repo.put_file_version(&FileVersion::new("/ab/c.txt", 100, 1)).unwrap();

    let at = |t| repo.file_version("/a/b.txt", t).unwrap().map(|v| v.length);
    assert_eq!(at(Some(150)), Some(10));
    assert_eq!(at(Some(200)), Some(20));
    assert_eq!(at(None), Some(20));
    assert_eq!(at(Some(99)), None);

    let listed = repo.files_with_prefix("/a/", Direction::Ascending).unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].length, 20);
    assert_eq!(repo.files_with_prefix("/a", Direction::Descending).unwrap().len(), 2);
}

#[test]
fn long_paths_are_found_by_lookup_and_prefix() {
    let repo = TestRepository::lmdb();
    let dir = format!("/{}", "d".repeat(600));
    let first = format!("{dir}/one");
    let second = format!("{dir}/two");
    repo.put_file_version(&FileVersion::new(first.clone(), 100, 1)).unwrap();
    repo.put_file_version(&FileVersion::new(second.clone(), 100, 2)).unwrap();
    repo.put_file_version(&FileVersion::new(second.clone(), 300, 3)).unwrap();

    assert_eq!(repo.file_version(&first, None).unwrap().map(|v| v.length), Some(1));
    assert_eq!(repo.file_version(&second, Some(200)).unwrap().map(|v| v.length), Some(2));

    let listed = repo.files_with_prefix(&format!("{dir}/"), Direction::Ascending).unwrap();
    let paths: Vec<_> = listed.iter().map(|v| v.path.as_str()).collect();
    assert_eq!(paths, vec![first.as_str(), second.as_str()]);
    assert_eq!(listed[1].length, 3);
}

#[test]
fn entities_survive_reopening() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("repo");
    let clock = Arc::new(ManualClock::new(START_TIME));

    {
        let repo = open_lmdb(&path, RepositoryConfig::default(), clock.clone());
        repo.put_file_version(&FileVersion::new("/x", 100, 7)).unwrap();
        repo.put_directory(&DirectorySnapshot::new("/", 100, ["x"])).unwrap();
        repo.close().unwrap();
    }

    let repo = open_lmdb(&path, RepositoryConfig::default(), clock.clone());
    assert_eq!(repo.file_version("/x", None).unwrap().map(|v| v.length), Some(7));
    assert_eq!(
        repo.directory_children_at("/", None).unwrap().into_iter().collect::<Vec<_>>(),
        vec!["x".to_owned()]
    );
    repo.close().unwrap();

    let reader = open_lmdb(&path, RepositoryConfig::default().read_only(true), clock);
    assert!(reader.is_read_only());
    assert!(reader.has_file("/x").unwrap());
    assert!(matches!(
        reader.put_file_version(&FileVersion::new("/y", 100, 1)),
        Err(CoreError::ReadOnly)
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn lookup_returns_the_latest_version_at_or_before(
        path in any_path_strategy(),
        writes in prop::collection::vec((1u64..1_000, 0u64..100), 1..12),
        probes in prop::collection::vec(0u64..1_100, 1..8),
    ) {
        let repo = TestRepository::memory();
        let mut model = BTreeMap::new();
        for (added, length) in writes {
            repo.put_file_version(&FileVersion::new(path.clone(), added, length)).unwrap();
            model.insert(added, length);
        }

        for at in probes {
            let expected = model.range(..=at).next_back().map(|(_, length)| *length);
            let found = repo.file_version(&path, Some(at)).unwrap();
            prop_assert_eq!(found.as_ref().map(|v| v.length), expected);
            if let Some(version) = found {
                prop_assert_eq!(version.path, path.clone());
            }
        }
    }

    #[test]
    fn prefix_ranges_select_exactly_the_prefixed_keys(
        prefix in byte_prefix_strategy(),
        keys in prop::collection::btree_set(prop::collection::vec(any::<u8>(), 0..8), 0..40),
    ) {
        let engine = InMemoryEngine::new();
        let mut stored: Vec<Vec<u8>> = keys.into_iter().collect();
        let mut extended = prefix.clone();
        extended.push(0);
        stored.extend([prefix.clone(), extended]);
        for key in &stored {
            engine.put(Table::Blocks, key, b"v").unwrap();
        }

        let found: Vec<_> = engine
            .scan(Table::Blocks, &prefix_range(&prefix), Direction::Ascending, usize::MAX)
            .unwrap()
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        let mut expected: Vec<_> = stored.into_iter().filter(|key| key.starts_with(&prefix)).collect();
        expected.sort();
        expected.dedup();
        prop_assert_eq!(found, expected);
    }
}
