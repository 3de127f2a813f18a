//! Per-CPU counters of how each event was handled
//!
//! Early returns in the handlers are normal warm-up conditions, not
//! faults, so they are counted here rather than logged.

use crate::topology::CpuId;
use crossbeam::utils::CachePadded;
use serde::Serialize;
use std::ops::AddAssign;
use std::sync::atomic::{AtomicU64, Ordering};

/// What happened to one event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Attributed,
    FromIdle,
    FirstEvent,
    UnmappedCpu,
    FrequencyUnset,
    FrequencyUpdated,
    UnknownFrequency,
    DroppedTimeInState,
    DroppedConcurrent,
}

const COUNTERS: usize = 9;

impl Counter {
    #[inline]
    const fn slot(self) -> usize {
        match self {
            Counter::Attributed => 0,
            Counter::FromIdle => 1,
            Counter::FirstEvent => 2,
            Counter::UnmappedCpu => 3,
            Counter::FrequencyUnset => 4,
            Counter::FrequencyUpdated => 5,
            Counter::UnknownFrequency => 6,
            Counter::DroppedTimeInState => 7,
            Counter::DroppedConcurrent => 8,
        }
    }
}

#[derive(Debug, Default)]
struct CpuCounters {
    counts: [AtomicU64; COUNTERS],
}

/// Counters for every CPU, one cache line apart
#[derive(Debug)]
pub struct CpuDiagnostics {
    per_cpu: Box<[CachePadded<CpuCounters>]>,
}

impl CpuDiagnostics {
    pub fn new(max_cpus: usize) -> Self {
        Self {
            per_cpu: (0..max_cpus)
                .map(|_| CachePadded::new(CpuCounters::default()))
                .collect(),
        }
    }

    /// Count one event on `cpu`; events on out-of-range CPUs are not counted
    #[inline]
    pub fn record(&self, cpu: CpuId, counter: Counter) {
        if let Some(cpu) = self.per_cpu.get(cpu as usize) {
            cpu.counts[counter.slot()].fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Counters of a single CPU
    pub fn cpu(&self, cpu: CpuId) -> Diagnostics {
        self.per_cpu
            .get(cpu as usize)
            .map(|c| Diagnostics::from_counts(&c.counts))
            .unwrap_or_default()
    }

    /// Counters summed over all CPUs
    pub fn total(&self) -> Diagnostics {
        let mut total = Diagnostics::default();
        for cpu in self.per_cpu.iter() {
            total += Diagnostics::from_counts(&cpu.counts);
        }
        total
    }

    pub(crate) fn reset(&mut self) {
        for cpu in self.per_cpu.iter_mut() {
            for count in cpu.counts.iter_mut() {
                *count.get_mut() = 0;
            }
        }
    }
}

/// Plain snapshot of the diagnostic counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Diagnostics {
    /// Switches whose interval was charged to a UID
    pub attributed: u64,
    /// Switches out of idle (nothing to charge)
    pub from_idle: u64,
    /// First switch seen on a CPU (no previous timestamp)
    pub first_event: u64,
    /// Events on CPUs without a policy mapping
    pub unmapped_cpu: u64,
    /// Switches on a policy whose frequency was never observed
    pub frequency_unset: u64,
    pub frequency_updated: u64,
    /// Frequency changes to a value missing from the index table
    pub unknown_frequency: u64,
    /// Time-in-state charges lost to a full table
    pub dropped_time_in_state: u64,
    /// Concurrent-time charges lost to a full table
    pub dropped_concurrent: u64,
}

impl Diagnostics {
    fn from_counts(counts: &[AtomicU64; COUNTERS]) -> Self {
        let get = |c: Counter| counts[c.slot()].load(Ordering::Relaxed);
        Self {
            attributed: get(Counter::Attributed),
            from_idle: get(Counter::FromIdle),
            first_event: get(Counter::FirstEvent),
            unmapped_cpu: get(Counter::UnmappedCpu),
            frequency_unset: get(Counter::FrequencyUnset),
            frequency_updated: get(Counter::FrequencyUpdated),
            unknown_frequency: get(Counter::UnknownFrequency),
            dropped_time_in_state: get(Counter::DroppedTimeInState),
            dropped_concurrent: get(Counter::DroppedConcurrent),
        }
    }

    /// Charges lost because a record table was full
    pub fn dropped(&self) -> u64 {
        self.dropped_time_in_state + self.dropped_concurrent
    }
}

impl AddAssign for Diagnostics {
    fn add_assign(&mut self, rhs: Self) {
        self.attributed += rhs.attributed;
        self.from_idle += rhs.from_idle;
        self.first_event += rhs.first_event;
        self.unmapped_cpu += rhs.unmapped_cpu;
        self.frequency_unset += rhs.frequency_unset;
        self.frequency_updated += rhs.frequency_updated;
        self.unknown_frequency += rhs.unknown_frequency;
        self.dropped_time_in_state += rhs.dropped_time_in_state;
        self.dropped_concurrent += rhs.dropped_concurrent;
    }
}
