//! Orphan Manager
//!
//! Holds visits whose opener tab has not been observed yet, so they can be
//! reparented once it appears. Orphans are bounded two ways: at most
//! [`MAX_RETRIES`] retry attempts and at most [`ORPHAN_TTL_SECS`] seconds of
//! age. An orphan that exceeds either bound is handed back to the caller to
//! be enqueued as a root visit; nothing is ever silently lost.
//!
//! Cardinality is small (active tabs), so a plain map of small lists keyed
//! by opener tab id is enough. Every public call sweeps expired entries
//! first.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::model::Visit;

/// Retry attempts before an orphan is given up on.
pub const MAX_RETRIES: u32 = 5;

/// Seconds an orphan may wait for its opener.
pub const ORPHAN_TTL_SECS: i64 = 60;

/// Seconds between retry scans (driven by the queue's ticker).
pub const RETRY_INTERVAL_SECS: u64 = 5;

// ============================================================================
// TYPES
// ============================================================================

/// A visit waiting for its opener tab to appear.
#[derive(Debug, Clone)]
pub struct Orphan {
    pub visit: Visit,
    pub opener_tab_id: i64,
    pub arrival_time: DateTime<Utc>,
    pub retry_count: u32,
}

impl Orphan {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        now - self.arrival_time > Duration::seconds(ORPHAN_TTL_SECS)
    }
}

/// Counters for the status surface.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanStats {
    pub waiting: usize,
    pub reparented: u64,
    pub expired: u64,
    pub retry_exhausted: u64,
}

// ============================================================================
// MANAGER
// ============================================================================

/// Exclusive owner of all pending orphans.
#[derive(Debug, Default)]
pub struct OrphanManager {
    by_opener: HashMap<i64, Vec<Orphan>>,
    reparented: u64,
    expired: u64,
    retry_exhausted: u64,
}

impl OrphanManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a visit that cites an opener we have not seen.
    pub fn add(&mut self, visit: Visit, opener_tab_id: i64) -> Vec<Orphan> {
        let swept = self.sweep_expired();
        self.by_opener.entry(opener_tab_id).or_default().push(Orphan {
            visit,
            opener_tab_id,
            arrival_time: Utc::now(),
            retry_count: 0,
        });
        swept
    }

    /// Remove and return every orphan waiting on the given opener tab.
    pub fn take_for(&mut self, opener_tab_id: i64) -> (Vec<Orphan>, Vec<Orphan>) {
        let swept = self.sweep_expired();
        let taken = self.by_opener.remove(&opener_tab_id).unwrap_or_default();
        self.reparented += taken.len() as u64;
        (taken, swept)
    }

    /// Orphans still within both bounds, cloned for inspection by the retry
    /// scan.
    pub fn retryable(&mut self) -> (Vec<Orphan>, Vec<Orphan>) {
        let swept = self.sweep_expired();
        let retryable = self
            .by_opener
            .values()
            .flatten()
            .filter(|o| o.retry_count < MAX_RETRIES)
            .cloned()
            .collect();
        (retryable, swept)
    }

    /// Count one failed retry. When the limit is hit the orphan is removed
    /// and returned so the caller can persist it as a root.
    pub fn bump(&mut self, opener_tab_id: i64, visit_id: &str) -> Option<Orphan> {
        let orphans = self.by_opener.get_mut(&opener_tab_id)?;
        let idx = orphans.iter().position(|o| o.visit.id == visit_id)?;

        orphans[idx].retry_count += 1;
        if orphans[idx].retry_count < MAX_RETRIES {
            return None;
        }

        let orphan = orphans.remove(idx);
        if orphans.is_empty() {
            self.by_opener.remove(&opener_tab_id);
        }
        self.retry_exhausted += 1;
        info!(
            visit_id = %orphan.visit.id,
            opener_tab_id,
            retries = orphan.retry_count,
            "Orphan gave up waiting for opener; persisting as root"
        );
        Some(orphan)
    }

    /// Remove and return every orphan past the TTL.
    pub fn sweep_expired(&mut self) -> Vec<Orphan> {
        let now = Utc::now();
        let mut swept = Vec::new();

        self.by_opener.retain(|_, orphans| {
            let (expired, keep): (Vec<Orphan>, Vec<Orphan>) =
                orphans.drain(..).partition(|o| o.expired(now));
            swept.extend(expired);
            *orphans = keep;
            !orphans.is_empty()
        });

        for orphan in &swept {
            self.expired += 1;
            let age = (now - orphan.arrival_time).num_seconds();
            info!(
                visit_id = %orphan.visit.id,
                opener_tab_id = orphan.opener_tab_id,
                age_seconds = age,
                "OrphanExpired: opener never appeared; persisting as root"
            );
        }
        swept
    }

    pub fn stats(&self) -> OrphanStats {
        OrphanStats {
            waiting: self.by_opener.values().map(Vec::len).sum(),
            reparented: self.reparented,
            expired: self.expired,
            retry_exhausted: self.retry_exhausted,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn test_visit(url: &str) -> Visit {
        Visit::new(url, "2024-01-15T10:00:00Z", Utc::now(), "<html></html>")
    }

    #[test]
    fn test_add_and_take() {
        let mut manager = OrphanManager::new();
        manager.add(test_visit("https://a.example.com"), 7);
        manager.add(test_visit("https://b.example.com"), 7);
        manager.add(test_visit("https://c.example.com"), 8);

        let (taken, _) = manager.take_for(7);
        assert_eq!(taken.len(), 2);
        assert_eq!(manager.stats().waiting, 1);
        assert_eq!(manager.stats().reparented, 2);

        let (taken_again, _) = manager.take_for(7);
        assert!(taken_again.is_empty());
    }

    #[test]
    fn test_bump_until_exhausted() {
        let mut manager = OrphanManager::new();
        let visit = test_visit("https://a.example.com");
        let visit_id = visit.id.clone();
        manager.add(visit, 7);

        for _ in 0..MAX_RETRIES - 1 {
            assert!(manager.bump(7, &visit_id).is_none());
        }
        let exhausted = manager.bump(7, &visit_id).unwrap();
        assert_eq!(exhausted.retry_count, MAX_RETRIES);
        assert_eq!(manager.stats().waiting, 0);
        assert_eq!(manager.stats().retry_exhausted, 1);
    }

    #[test]
    fn test_expired_orphans_are_swept() {
        let mut manager = OrphanManager::new();
        manager.add(test_visit("https://a.example.com"), 7);

        // Backdate past the TTL
        for orphans in manager.by_opener.values_mut() {
            for orphan in orphans {
                orphan.arrival_time = Utc::now() - Duration::seconds(ORPHAN_TTL_SECS + 5);
            }
        }

        let swept = manager.sweep_expired();
        assert_eq!(swept.len(), 1);
        assert_eq!(manager.stats().waiting, 0);
        assert_eq!(manager.stats().expired, 1);
    }

    #[test]
    fn test_retryable_excludes_exhausted() {
        let mut manager = OrphanManager::new();
        let visit = test_visit("https://a.example.com");
        let visit_id = visit.id.clone();
        manager.add(visit, 7);
        manager.add(test_visit("https://b.example.com"), 8);

        for _ in 0..MAX_RETRIES {
            manager.bump(7, &visit_id);
        }

        let (retryable, _) = manager.retryable();
        assert_eq!(retryable.len(), 1);
        assert_eq!(retryable[0].opener_tab_id, 8);
    }
}
