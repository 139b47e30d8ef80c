//! Retention policy for cached versions

use std::collections::HashSet;
use std::time::Duration;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use super::metadata::PluginVersionMetadata;

/// Why a version was selected for eviction; several reasons may apply at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// Outside the newest `max_versions`
    ExceedsMaxVersions,
    LowSuccessRate,
    Unused,
    /// Superseded by a newer instance from the same origin
    Superseded,
}

/// A version chosen for removal
#[derive(Debug, Clone, PartialEq)]
pub struct Eviction {
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub reasons: Vec<EvictionReason>,
}

/// Summary of one cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupStats {
    /// Versions considered
    pub total_plugins: usize,
    /// Versions actually evicted
    pub removed_plugins: usize,
    /// Evictions that failed and were left in place
    pub failed_removals: usize,
    pub bytes_freed: u64,
    pub oldest_kept: Option<DateTime<Utc>>,
    pub newest_removed: Option<DateTime<Utc>>,
}

impl CleanupStats {
    pub fn kept_plugins(&self) -> usize {
        self.total_plugins - self.removed_plugins
    }

    pub(crate) fn record_removed(&mut self, created_at: DateTime<Utc>, bytes: u64) {
        self.removed_plugins += 1;
        self.bytes_freed += bytes;
        self.newest_removed = Some(self.newest_removed.map_or(created_at, |t| t.max(created_at)));
    }

    pub(crate) fn record_kept(&mut self, created_at: DateTime<Utc>) {
        self.oldest_kept = Some(self.oldest_kept.map_or(created_at, |t| t.min(created_at)));
    }
}

/// Newest first; ties broken by version number
fn newest_first(versions: &mut [&PluginVersionMetadata]) {
    versions.sort_by(|a, b| {
        b.created_at.cmp(&a.created_at).then(b.version_number.cmp(&a.version_number))
    });
}

/// Choose which versions of one plugin to evict
pub fn select_evictions(
    versions: &[&PluginVersionMetadata],
    max_versions: usize,
    min_success_rate: f64,
    unused_threshold: Duration,
    now: DateTime<Utc>,
) -> Vec<Eviction> {
    let mut ordered = versions.to_vec();
    newest_first(&mut ordered);

    ordered.iter().enumerate()
        .filter_map(|(rank, meta)| {
            let mut reasons = Vec::new();
            if rank >= max_versions {
                reasons.push(EvictionReason::ExceedsMaxVersions);
            }
            if meta.success_rate < min_success_rate {
                reasons.push(EvictionReason::LowSuccessRate);
            }
            let unused = (now - meta.last_used).to_std()
                .map(|idle| idle > unused_threshold)
                .unwrap_or(false);
            if unused {
                reasons.push(EvictionReason::Unused);
            }

            (!reasons.is_empty()).then(|| Eviction {
                version: meta.version.clone(),
                created_at: meta.created_at,
                reasons,
            })
        })
        .collect()
}

/// Keep the most recent instance per origin name, evicting the rest; duplicates count once
pub fn select_superseded(instances: &[&PluginVersionMetadata]) -> Vec<Eviction> {
    let mut ordered = instances.to_vec();
    newest_first(&mut ordered);
    let mut versions = HashSet::new();
    ordered.retain(|&meta| versions.insert(meta.version.as_str()));

    let mut names = HashSet::new();
    ordered.into_iter()
        .filter(|&meta| !names.insert(meta.name.as_str()))
        .map(|meta| Eviction {
            version: meta.version.clone(),
            created_at: meta.created_at,
            reasons: vec![EvictionReason::Superseded],
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use chrono::Duration as ChronoDuration;
    use crate::cache::metadata::TestResults;

    fn meta(name: &str, n: u64, created: DateTime<Utc>, last_used: DateTime<Utc>, rate: f64) -> PluginVersionMetadata {
        PluginVersionMetadata {
            name: name.to_string(),
            version: format!("{}_v{}", name, n),
            version_number: n,
            created_at: created,
            last_used,
            success_rate: rate,
            test_results: TestResults::new(1, 1),
            dependencies: BTreeSet::new(),
            description: String::new(),
            size_bytes: 0,
        }
    }

    const THIRTY_DAYS: Duration = Duration::from_secs(30 * 24 * 3600);

    #[test]
    fn test_keeps_newest_within_count() {
        let now = Utc::now();
        let versions: Vec<_> = (1..=5)
            .map(|n| {
                let created = now - ChronoDuration::days(10 * (5 - n as i64));
                meta("p", n, created, now, 1.0)
            })
            .collect();
        let refs: Vec<_> = versions.iter().collect();

        let evicted = select_evictions(&refs, 3, 0.5, THIRTY_DAYS, now);
        let names: Vec<_> = evicted.iter().map(|e| e.version.as_str()).collect();
        assert_eq!(names, vec!["p_v2", "p_v1"]);
        assert!(evicted.iter().all(|e| e.reasons == vec![EvictionReason::ExceedsMaxVersions]));
    }

    #[test]
    fn test_reasons_are_not_exclusive() {
        let now = Utc::now();
        let stale_and_bad = meta("p", 1, now - ChronoDuration::days(60), now - ChronoDuration::days(45), 0.2);
        let fresh = meta("p", 2, now, now, 0.9);

        let evicted = select_evictions(&[&stale_and_bad, &fresh], 3, 0.5, THIRTY_DAYS, now);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].reasons, vec![EvictionReason::LowSuccessRate, EvictionReason::Unused]);
    }

    #[test]
    fn test_exactly_threshold_is_not_unused() {
        let now = Utc::now();
        let edge = meta("p", 1, now - ChronoDuration::days(30), now - ChronoDuration::days(30), 1.0);
        assert!(select_evictions(&[&edge], 3, 0.5, THIRTY_DAYS, now).is_empty());
    }

    #[test]
    fn test_superseded_keeps_latest_per_name() {
        let now = Utc::now();
        let a1 = meta("goal_a", 1, now - ChronoDuration::hours(3), now, 0.0);
        let a2 = meta("goal_a", 2, now - ChronoDuration::hours(1), now, 0.0);
        let b1 = meta("goal_b", 1, now - ChronoDuration::hours(2), now, 0.0);

        let evicted = select_superseded(&[&a1, &b1, &a2]);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].version, "goal_a_v1");
    }

    #[test]
    fn test_superseded_ignores_duplicate_instances() {
        let now = Utc::now();
        let a1 = meta("goal_a", 1, now - ChronoDuration::hours(2), now, 0.0);
        let a2 = meta("goal_a", 2, now - ChronoDuration::hours(1), now, 0.0);

        let evicted = select_superseded(&[&a1, &a2, &a2, &a1]);
        let versions: Vec<_> = evicted.iter().map(|e| e.version.as_str()).collect();
        assert_eq!(versions, vec!["goal_a_v1"]);
    }

    #[test]
    fn test_stats_bookkeeping() {
        let now = Utc::now();
        let mut stats = CleanupStats { total_plugins: 4, ..Default::default() };
        stats.record_removed(now - ChronoDuration::days(3), 10);
        stats.record_removed(now - ChronoDuration::days(1), 5);
        stats.record_kept(now);
        stats.record_kept(now - ChronoDuration::hours(1));

        assert_eq!(stats.removed_plugins, 2);
        assert_eq!(stats.kept_plugins(), 2);
        assert_eq!(stats.bytes_freed, 15);
        assert_eq!(stats.newest_removed, Some(now - ChronoDuration::days(1)));
        assert_eq!(stats.oldest_kept, Some(now - ChronoDuration::hours(1)));
    }
}
