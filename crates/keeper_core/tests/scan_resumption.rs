//! A scan stopped after any step and resumed ends where an uninterrupted
//! scan ends.

use keeper_core::{
    ActiveScan, BackupSet, Direction, IncludeRules, ManualClock, Repository, RepositoryConfig,
    ScanOutcome,
};
use keeper_storage::InMemoryFactory;
use keeper_testkit::{tree_strategy, MemoryTree, TestRepository, TreeSpec};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use tempfile::tempdir;

type Snapshots = BTreeSet<(String, Vec<String>)>;

fn set() -> BackupSet {
    BackupSet::new("set", IncludeRules::new(["/r"]))
}

fn snapshots(repo: &Repository) -> Snapshots {
    repo.directories_with_prefix("/r", Direction::Ascending)
        .unwrap()
        .into_iter()
        .map(|s| (s.path, s.children.into_iter().collect()))
        .collect()
}

fn uninterrupted(tree: &MemoryTree) -> (Snapshots, usize) {
    let repo = TestRepository::memory();
    let mut scan = ActiveScan::start(&repo, set(), tree).unwrap();
    assert_eq!(scan.run().unwrap(), ScanOutcome::Complete);
    (snapshots(&repo), scan.stats().resolved)
}

/// Stops the first run after `steps` children, then resumes to the end.
fn interrupted_after(tree: &MemoryTree, steps: usize) -> Snapshots {
    let repo = TestRepository::memory();
    let mut polls = 0;
    let outcome = ActiveScan::start(&repo, set(), tree)
        .unwrap()
        .run_with(|| {
            polls += 1;
            polls > steps
        })
        .unwrap();
    if outcome == ScanOutcome::Interrupted {
        let mut resumed = ActiveScan::start(&repo, set(), tree).unwrap();
        assert_eq!(resumed.run().unwrap(), ScanOutcome::Complete);
    }
    assert!(repo.active_paths("set").unwrap().is_empty());
    snapshots(&repo)
}

fn check(spec: &TreeSpec) {
    let tree = spec.build("/r");
    let (expected, steps) = uninterrupted(&tree);
    for k in 0..=steps {
        assert_eq!(interrupted_after(&tree, k), expected, "stopped after {k} steps");
    }
}

#[test]
fn fixed_tree_resumes_at_every_step() {
    check(&TreeSpec {
        files: vec![
            ("a/x.f".into(), false),
            ("a/b/y.f".into(), true),
            ("a/b/c/z.f".into(), false),
            ("x.f".into(), false),
            ("c/y.f".into(), true),
        ],
    });
}

#[test]
fn resumes_after_reopening_the_repository() {
    let temp = tempdir().unwrap();
    let factory = Arc::new(InMemoryFactory::new());
    let clock = Arc::new(ManualClock::new(5_000));
    let open = || {
        Repository::open_with(
            temp.path().join("repo"),
            RepositoryConfig::default(),
            factory.clone(),
            clock.clone(),
        )
        .unwrap()
    };

    let mut tree = MemoryTree::new("/r");
    tree.add_file("/r/a/x.f");
    tree.add_file("/r/a/y.f");
    tree.add_file("/r/b/z.f");

    {
        let repo = open();
        let mut polls = 0;
        let outcome = ActiveScan::start(&repo, set(), &tree)
            .unwrap()
            .run_with(|| {
                polls += 1;
                polls > 3
            })
            .unwrap();
        assert_eq!(outcome, ScanOutcome::Interrupted);
        repo.close().unwrap();
    }

    let repo = open();
    let mut scan = ActiveScan::start(&repo, set(), &tree).unwrap();
    assert!(scan.stats().resumed > 0);
    assert_eq!(scan.run().unwrap(), ScanOutcome::Complete);
    assert_eq!(
        snapshots(&repo),
        Snapshots::from([
            ("/r".to_owned(), vec!["a".to_owned(), "b".to_owned()]),
            ("/r/a".to_owned(), vec!["x.f".to_owned(), "y.f".to_owned()]),
            ("/r/b".to_owned(), vec!["z.f".to_owned()]),
        ])
    );
    assert_eq!(tree.processed().iter().filter(|p| p.as_str() == "/r/a/x.f").count(), 1);
}

#[test]
fn removed_directories_are_dropped_on_resume() {
    let repo = TestRepository::memory();
    let mut tree = MemoryTree::new("/r");
    tree.add_file("/r/a/deep/x.f");
    tree.add_file("/r/keep.f");

    let mut polls = 0;
    ActiveScan::start(&repo, set(), &tree)
        .unwrap()
        .run_with(|| {
            polls += 1;
            polls > 2
        })
        .unwrap();
    assert!(repo.active_path("set", "/r/a/deep").unwrap().is_some());

    tree.remove_dir("/r/a");
    let rules = IncludeRules::new(["/r"]).exclude("/r/a").unwrap();
    let mut scan = ActiveScan::start(&repo, BackupSet::new("set", rules), &tree).unwrap();
    assert_eq!(scan.stats().discarded, 2);
    assert_eq!(scan.run().unwrap(), ScanOutcome::Complete);
    assert_eq!(
        snapshots(&repo),
        Snapshots::from([("/r".to_owned(), vec!["keep.f".to_owned()])])
    );
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn generated_trees_resume_at_every_step(spec in tree_strategy()) {
        check(&spec);
    }
}
