//! Active-processor counters, global and per policy-group
//!
//! Counters move only by ±1. The snapshot taken before a switch applies
//! its own transition is not atomic with that transition; concurrent
//! switches on other CPUs may make it briefly stale.

use crate::topology::PolicyId;
use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicU32, Ordering};

#[derive(Debug)]
pub struct ActiveCounters {
    global: CachePadded<AtomicU32>,
    per_policy: Box<[AtomicU32]>,
    max_others: u32,
}

/// Active counts of *other* processors, read before a switch is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveSnapshot {
    pub global: u32,
    pub policy: u32,
}

impl ActiveCounters {
    pub fn new(max_cpus: usize, max_policies: usize) -> Self {
        Self {
            global: CachePadded::new(AtomicU32::new(0)),
            per_policy: (0..max_policies).map(|_| AtomicU32::new(0)).collect(),
            max_others: u32::try_from(max_cpus.saturating_sub(1)).unwrap_or(u32::MAX),
        }
    }

    /// Current counts minus one
    ///
    /// Clamped to `[0, max_cpus - 1]`: a malformed event stream (a CPU
    /// going idle twice, say) can leave a counter wrapped, and the result
    /// must still name a bucket a real machine could reach.
    #[inline]
    pub fn snapshot_before(&self, policy: PolicyId) -> ActiveSnapshot {
        ActiveSnapshot {
            global: self.global().saturating_sub(1).min(self.max_others),
            policy: self.policy(policy).saturating_sub(1).min(self.max_others),
        }
    }

    #[inline]
    pub fn activate(&self, policy: PolicyId) {
        self.global.fetch_add(1, Ordering::Relaxed);
        if let Some(counter) = self.per_policy.get(policy as usize) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn deactivate(&self, policy: PolicyId) {
        self.global.fetch_sub(1, Ordering::Relaxed);
        if let Some(counter) = self.per_policy.get(policy as usize) {
            counter.fetch_sub(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn global(&self) -> u32 {
        self.global.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn policy(&self, policy: PolicyId) -> u32 {
        self.per_policy
            .get(policy as usize)
            .map_or(0, |counter| counter.load(Ordering::Relaxed))
    }

    pub fn policy_counts(&self) -> Vec<u32> {
        self.per_policy
            .iter()
            .map(|counter| counter.load(Ordering::Relaxed))
            .collect()
    }

    pub(crate) fn reset(&mut self) {
        *self.global.get_mut() = 0;
        for counter in self.per_policy.iter_mut() {
            *counter.get_mut() = 0;
        }
    }
}
