//! Idle-entry pruning for one function namespace
//!
//! Works against any [`Cache`]: entries are ranked by last access (never
//! accessed counts as oldest), the most recent `keep_most_recent` are always
//! kept, and the rest are evicted once idle longer than `max_idle`.

use crate::cache::Cache;
use crate::keys::{FunctionKey, InputKey};
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Which entries [`prune`] may evict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrunePolicy {
    /// Evict entries not accessed for longer than this; `None` evicts
    /// everything beyond `keep_most_recent`
    pub max_idle: Option<Duration>,
    /// Always keep at least this many of the most recently accessed entries
    pub keep_most_recent: usize,
}

impl Default for PrunePolicy {
    fn default() -> Self {
        Self {
            max_idle: Some(Duration::from_secs(30 * 24 * 60 * 60)), // 30 days
            keep_most_recent: 3,
        }
    }
}

/// Outcome of a [`prune`] run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruneReport {
    /// Entries that were evicted
    pub evicted: Vec<InputKey>,
    /// Number of entries left in place
    pub kept: usize,
}

/// Evict idle entries of `function_key` according to `policy`
///
/// `now` is the reference time for idleness.
pub fn prune<C: Cache + ?Sized>(
    cache: &C,
    function_key: &FunctionKey,
    policy: &PrunePolicy,
    now: DateTime<Utc>,
) -> Result<PruneReport> {
    let mut ranked: Vec<(Option<DateTime<Utc>>, InputKey)> = Vec::new();
    for key in cache.list(function_key)? {
        ranked.push((cache.get_last_accessed(&key)?, key));
    }
    // Most recent first; None sorts below any timestamp
    ranked.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

    let cutoff = policy
        .max_idle
        .and_then(|idle| chrono::Duration::from_std(idle).ok())
        .and_then(|idle| now.checked_sub_signed(idle));

    let mut report = PruneReport::default();
    for (position, (accessed, key)) in ranked.into_iter().enumerate() {
        let idle = match (policy.max_idle, cutoff, accessed) {
            (None, _, _) | (Some(_), Some(_), None) => true,
            (Some(_), Some(cutoff), Some(at)) => at < cutoff,
            // Idle window larger than representable time: nothing is idle
            (Some(_), None, _) => false,
        };
        if position < policy.keep_most_recent || !idle {
            report.kept += 1;
            continue;
        }
        cache.evict(&key)?;
        report.evicted.push(key);
    }

    debug!(
        function = %function_key,
        evicted = report.evicted.len(),
        kept = report.kept,
        "Pruned cache entries"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCache;
    use crate::metadata::Metadata;

    fn populate(cache: &MemoryCache, function: &FunctionKey, ids: &[&str]) {
        for id in ids {
            cache
                .write(id.as_bytes(), &Metadata::new(), &function.input(*id).unwrap())
                .unwrap();
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = PrunePolicy::default();
        assert_eq!(policy.max_idle, Some(Duration::from_secs(2_592_000)));
        assert_eq!(policy.keep_most_recent, 3);
    }

    #[test]
    fn test_nothing_idle_keeps_everything() {
        let cache = MemoryCache::new();
        let f = FunctionKey::new("f").unwrap();
        populate(&cache, &f, &["a", "b", "c", "d"]);

        let policy = PrunePolicy {
            max_idle: Some(Duration::from_secs(3600)),
            keep_most_recent: 0,
        };
        let report = prune(&cache, &f, &policy, Utc::now()).unwrap();

        assert!(report.evicted.is_empty());
        assert_eq!(report.kept, 4);
    }

    #[test]
    fn test_everything_idle_keeps_most_recent() {
        let cache = MemoryCache::new();
        let f = FunctionKey::new("f").unwrap();
        populate(&cache, &f, &["a", "b", "c"]);
        // "a" becomes the most recently accessed
        cache.read(&f.input("a").unwrap()).unwrap();

        let policy = PrunePolicy {
            max_idle: Some(Duration::from_secs(60)),
            keep_most_recent: 1,
        };
        let later = Utc::now() + chrono::Duration::hours(1);
        let report = prune(&cache, &f, &policy, later).unwrap();

        assert_eq!(report.kept, 1);
        assert_eq!(report.evicted.len(), 2);
        assert_eq!(cache.list(&f).unwrap(), vec![f.input("a").unwrap()]);
    }

    #[test]
    fn test_no_idle_limit_trims_to_count() {
        let cache = MemoryCache::new();
        let f = FunctionKey::new("f").unwrap();
        populate(&cache, &f, &["a", "b", "c", "d", "e"]);

        let policy = PrunePolicy {
            max_idle: None,
            keep_most_recent: 2,
        };
        let report = prune(&cache, &f, &policy, Utc::now()).unwrap();

        assert_eq!(report.kept, 2);
        assert_eq!(report.evicted.len(), 3);
        assert_eq!(cache.list(&f).unwrap().len(), 2);
    }

    #[test]
    fn test_empty_namespace() {
        let cache = MemoryCache::new();
        let f = FunctionKey::new("f").unwrap();
        let report = prune(&cache, &f, &PrunePolicy::default(), Utc::now()).unwrap();
        assert_eq!(report, PruneReport::default());
    }
}
