//! Monotonic clocks and the per-processor last-event clock

use crate::topology::CpuId;
use crossbeam::utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Nanosecond clock that never goes backwards on a single processor
pub trait MonotonicClock: Send + Sync {
    fn now_ns(&self) -> u64;
}

/// Wall clock backed by [`Instant`], counting from construction
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock for SystemClock {
    #[inline]
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Clock driven by hand, for replaying recorded events
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ns: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ns),
        }
    }

    pub fn set(&self, now_ns: u64) {
        self.now.store(now_ns, Ordering::Relaxed);
    }

    pub fn advance(&self, delta_ns: u64) -> u64 {
        self.now.fetch_add(delta_ns, Ordering::Relaxed) + delta_ns
    }
}

impl MonotonicClock for ManualClock {
    #[inline]
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

/// Timestamp of the last accounted event on each processor
///
/// Slots hold `timestamp + 1`; a zero slot has never seen an event, so a
/// genuine reading of 0 ns stays distinguishable from "never updated".
#[derive(Debug)]
pub struct CpuClocks {
    last: Box<[CachePadded<AtomicU64>]>,
}

impl CpuClocks {
    pub fn new(max_cpus: usize) -> Self {
        Self {
            last: (0..max_cpus)
                .map(|_| CachePadded::new(AtomicU64::new(0)))
                .collect(),
        }
    }

    /// Store `now` for `cpu` and return the previous timestamp
    ///
    /// `None` when `cpu` had no earlier event or is out of range. Each slot
    /// is written only by its own processor, so relaxed ordering suffices.
    #[inline]
    pub fn exchange(&self, cpu: CpuId, now: u64) -> Option<u64> {
        let slot = self.last.get(cpu as usize)?;
        slot.swap(now.wrapping_add(1), Ordering::Relaxed)
            .checked_sub(1)
    }

    /// Last timestamp of `cpu` without updating it
    pub fn last(&self, cpu: CpuId) -> Option<u64> {
        self.last
            .get(cpu as usize)?
            .load(Ordering::Relaxed)
            .checked_sub(1)
    }

    pub(crate) fn reset(&mut self) {
        for slot in self.last.iter_mut() {
            *slot.get_mut() = 0;
        }
    }
}
