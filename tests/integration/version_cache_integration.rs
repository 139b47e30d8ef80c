//! Version Cache Integration Tests
//!
//! Retention and persistence behaviour of the on-disk version cache, driven by a manual clock.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;
use tokio_test::assert_ok;

use plugin_runtime::cache::{CacheConfig, TestResults, VersionCache};
use plugin_runtime::clock::{Clock, ManualClock};

fn write_source(dir: &Path, body: &str) {
    fs::create_dir_all(dir.join("lib")).unwrap();
    fs::write(dir.join("plugin.py"), body).unwrap();
    fs::write(dir.join("lib").join("helpers.py"), "def helper():\n    return 1\n").unwrap();
}

fn open(root: &Path, clock: Arc<ManualClock>) -> VersionCache {
    let config = CacheConfig::default().with_root(root);
    assert_ok!(VersionCache::open(root, config, clock))
}

#[test]
fn test_five_versions_ten_days_apart_keep_three_newest() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("source");
    write_source(&source, "print('v')");

    let clock = Arc::new(ManualClock::starting_now());
    let cache = open(&temp.path().join("cache"), clock.clone());

    let mut created = Vec::new();
    for i in 0..5 {
        if i > 0 {
            clock.advance_days(10);
        }
        let versioned = assert_ok!(cache.cache_version(
            "summarize",
            &source,
            TestResults::new(9, 10),
            ["tokenizer"],
            "summarizer",
        ));
        created.push((versioned, clock.now()));
    }
    assert_eq!(created[4].0, "summarize_v5");

    let stats = cache.cleanup("summarize");

    assert_eq!(stats.total_plugins, 5);
    assert_eq!(stats.removed_plugins, 2);
    assert_eq!(stats.failed_removals, 0);
    assert_eq!(stats.removed_plugins + stats.kept_plugins(), stats.total_plugins);
    assert!(stats.bytes_freed > 0);
    assert_eq!(stats.oldest_kept, Some(created[2].1));
    assert_eq!(stats.newest_removed, Some(created[1].1));

    let remaining: Vec<String> = cache.list_versions("summarize").into_iter().map(|m| m.version).collect();
    assert_eq!(remaining, vec!["summarize_v3", "summarize_v4", "summarize_v5"]);
    assert!(cache.version_path("summarize_v1").is_none());
    assert!(!temp.path().join("cache").join("versions").join("summarize_v1").exists());
    assert_eq!(cache.get_latest("summarize").as_deref(), Some("summarize_v5"));
}

#[test]
fn test_low_success_rate_evicted_within_count_limit() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("source");
    write_source(&source, "print('x')");

    let clock = Arc::new(ManualClock::starting_now());
    let cache = open(&temp.path().join("cache"), clock.clone());

    assert_ok!(cache.cache_version("fetch", &source, TestResults::new(10, 10), Vec::<String>::new(), ""));
    assert_ok!(cache.cache_version("fetch", &source, TestResults::new(1, 10), Vec::<String>::new(), ""));

    let stats = cache.cleanup("fetch");
    assert_eq!(stats.removed_plugins, 1);
    assert_eq!(cache.get_latest("fetch").as_deref(), Some("fetch_v1"));

    // Numbers are never reused after deletion
    let next = assert_ok!(cache.cache_version("fetch", &source, TestResults::new(5, 5), Vec::<String>::new(), ""));
    assert_eq!(next, "fetch_v3");
}

#[test]
fn test_metadata_round_trip_through_fresh_instance() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("source");
    write_source(&source, "print('round trip')");
    let root = temp.path().join("cache");

    let clock = Arc::new(ManualClock::starting_now());
    let original = {
        let cache = open(&root, clock.clone());
        let versioned = assert_ok!(cache.cache_version(
            "extract",
            &source,
            TestResults::new(3, 4),
            ["http", "html"],
            "extracts text",
        ));
        clock.advance_days(1);
        assert_ok!(cache.record_usage(&versioned));
        cache.get_metadata(&versioned).unwrap()
    };

    let reopened = open(&root, clock.clone());
    let reloaded = reopened.get_metadata("extract_v1").unwrap();

    assert_eq!(reloaded.success_rate, original.success_rate);
    assert_eq!(reloaded.success_rate, 0.75);
    assert_eq!(reloaded.dependencies, original.dependencies);
    assert_eq!(reloaded.created_at, original.created_at);
    assert_eq!(reloaded.last_used, original.last_used);
    assert!(reopened.version_path("extract_v1").unwrap().join("lib").join("helpers.py").exists());

    let next = assert_ok!(reopened.cache_version("extract", &source, TestResults::new(1, 1), ["http"], ""));
    assert_eq!(next, "extract_v2");
}

#[test]
fn test_cleanup_failed_keeps_newest_per_goal() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("source");
    write_source(&source, "raise Exception()");

    let clock = Arc::new(ManualClock::starting_now());
    let cache = open(&temp.path().join("cache"), clock.clone());

    let mut failed = Vec::new();
    for goal in ["goal_a", "goal_b"] {
        for _ in 0..3 {
            clock.advance_days(1);
            failed.push(assert_ok!(cache.cache_version(goal, &source, TestResults::new(0, 1), Vec::<String>::new(), "")));
        }
    }

    let untouched = cache.cleanup_failed(&failed, 10);
    assert_eq!(untouched.removed_plugins, 0);

    let stats = cache.cleanup_failed(&failed, 2);
    assert_eq!(stats.total_plugins, 6);
    assert_eq!(stats.removed_plugins, 4);
    assert_eq!(cache.list_versions("goal_a").len(), 1);
    assert_eq!(cache.get_latest("goal_a").as_deref(), Some("goal_a_v3"));
    assert_eq!(cache.get_latest("goal_b").as_deref(), Some("goal_b_v3"));
}

#[test]
fn test_corrupt_metadata_starts_empty() {
    let temp = TempDir::new().unwrap();
    let root = temp.path().join("cache");
    fs::create_dir_all(&root).unwrap();
    fs::write(root.join("metadata.json"), "{ not json").unwrap();

    let cache = open(&root, Arc::new(ManualClock::starting_now()));
    assert!(cache.list_versions("anything").is_empty());
}
