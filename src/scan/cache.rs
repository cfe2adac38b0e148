/// Bounded, lock-free cache of closed scan records
///
/// Once a phase is closed its record no longer changes through the counter
/// path, so pollers can be served from memory. Each update swaps the whole
/// map pointer (ArcSwap), so reads never block behind writers. The cache is
/// owned by one aggregator and evicts in insertion order at capacity.
///
/// Status overrides may still happen elsewhere (another process sharing the
/// database), so an entry is served for at most `ttl` after it was cached,
/// and an older record never replaces a newer one.

use crate::scan::types::ScanRecord;
use arc_swap::ArcSwap;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct CachedRecord {
    record: ScanRecord,
    cached_at: Instant,
}

#[derive(Debug, Clone, Default)]
struct CacheState {
    entries: HashMap<Uuid, CachedRecord>,
    /// Insertion order, oldest first
    order: VecDeque<Uuid>,
}

/// Snapshot cache for closed phases
#[derive(Debug)]
pub struct PhaseCache {
    state: ArcSwap<CacheState>,
    capacity: usize,
    ttl: Duration,
}

impl PhaseCache {
    /// A capacity or ttl of zero disables caching
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            state: ArcSwap::from_pointee(CacheState::default()),
            capacity,
            ttl,
        }
    }

    /// Lock-free lookup; expired entries are treated as absent
    pub fn get(&self, token: &Uuid) -> Option<ScanRecord> {
        self.state
            .load()
            .entries
            .get(token)
            .filter(|cached| cached.cached_at.elapsed() < self.ttl)
            .map(|cached| cached.record.clone())
    }

    /// Cache a record if it is closed; open records are ignored, as is a
    /// record older than the one already cached
    pub fn insert(&self, record: &ScanRecord) {
        if self.capacity == 0 || self.ttl.is_zero() || !record.status.is_terminal() {
            return;
        }

        let capacity = self.capacity;
        self.state.rcu(|current| {
            let mut next = CacheState::clone(current);
            if let Some(existing) = next.entries.get(&record.token) {
                if existing.record.updated_at > record.updated_at {
                    return Arc::new(next);
                }
            }
            let entry = CachedRecord {
                record: record.clone(),
                cached_at: Instant::now(),
            };
            if next.entries.insert(record.token, entry).is_none() {
                next.order.push_back(record.token);
            }
            while next.entries.len() > capacity {
                match next.order.pop_front() {
                    Some(oldest) => {
                        next.entries.remove(&oldest);
                    }
                    None => break,
                }
            }
            Arc::new(next)
        });
    }

    /// Drop a record after its state changed outside the counter path
    pub fn invalidate(&self, token: &Uuid) {
        if !self.state.load().entries.contains_key(token) {
            return;
        }

        self.state.rcu(|current| {
            let mut next = CacheState::clone(current);
            next.entries.remove(token);
            next.order.retain(|cached| cached != token);
            Arc::new(next)
        });
    }

    pub fn len(&self) -> usize {
        self.state.load().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
