//! Per-UID time-in-state and concurrent-time accounting engine
//!
//! Two entry points, both driven by external events and safe to call
//! concurrently from every CPU:
//!
//! - [`Engine::switch_at`] / [`Engine::on_switch`]: context switch on a CPU.
//!   Closes out the interval since the CPU's previous switch and charges it
//!   to the outgoing UID, at the policy's current frequency and at the
//!   number of other CPUs that were active.
//! - [`Engine::on_frequency_change`]: records the new frequency index of the
//!   CPU's policy. Nothing is charged here.
//!
//! Both only touch atomics and pre-allocated tables: no locks, no heap
//! allocation and no unbounded loops on the switch path.
//!
//! # Example
//!
//! ```
//! use timeinstate::engine::{Engine, EngineConfig};
//! use timeinstate::clock::ManualClock;
//!
//! let engine = Engine::with_clock(EngineConfig::small(4, 1), ManualClock::new(0));
//! engine.topology().set_cpu_policy(0, 0).unwrap();
//! engine.topology().set_policy_frequencies(0, &[300_000, 600_000, 900_000]).unwrap();
//! engine.on_frequency_change(0, 900_000);
//!
//! engine.switch_at(0, 0, None, Some(10_001));
//! engine.switch_at(0, 100, Some(10_001), None);
//!
//! let snapshot = engine.snapshot();
//! assert_eq!(snapshot.uid(10_001).unwrap().time_in_state[2], 100);
//! ```

use crate::active::{ActiveCounters, ActiveSnapshot};
use crate::clock::{CpuClocks, MonotonicClock, SystemClock};
use crate::diagnostics::{Counter, CpuDiagnostics, Diagnostics};
use crate::freq_state::PolicyFreqState;
use crate::table::{
    active_offset, freq_offset, same_bucket, ConcurrentTimeRecord, RecordKey, RecordTable,
    TimeInStateRecord, Uid,
};
use crate::topology::{CpuId, FreqKhz, PolicyId, Topology, DEFAULT_FREQ_INDEX_CAPACITY};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};

/// Table sizes of an [`Engine`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of CPU slots (CPU ids must be below this)
    pub max_cpus: usize,
    /// Number of policy-group slots
    pub max_policies: usize,
    /// Records in the time-in-state table (one per UID per 32 frequencies)
    pub time_in_state_capacity: usize,
    /// Records in the concurrent-time table (one per UID per 8 active counts)
    pub concurrent_capacity: usize,
    /// `(policy, frequency)` pairs the frequency-index table can hold
    pub freq_index_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_cpus: 1024,
            max_policies: 1024,
            time_in_state_capacity: 1024,
            concurrent_capacity: 1024,
            freq_index_capacity: DEFAULT_FREQ_INDEX_CAPACITY,
        }
    }
}

impl EngineConfig {
    /// Default table capacities with explicit CPU and policy counts
    pub fn small(max_cpus: usize, max_policies: usize) -> Self {
        Self {
            max_cpus,
            max_policies,
            ..Self::default()
        }
    }
}

/// How a context switch was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchOutcome {
    /// The CPU has no policy mapping
    UnmappedCpu,
    /// The CPU was idle before the switch
    FromIdle,
    /// First switch seen on this CPU
    FirstEvent,
    /// The policy has no known frequency yet
    FrequencyUnset,
    /// `delta_ns` was charged to `uid`
    Attributed { uid: Uid, delta_ns: u64 },
    /// `delta_ns` belonged to `uid` but the time-in-state table was full
    Dropped { uid: Uid, delta_ns: u64 },
}

/// How a frequency transition was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreqOutcome {
    UnmappedCpu,
    UnknownFrequency,
    Updated { policy: PolicyId, index: u8 },
}

/// The accounting engine: every table the two handlers share
#[derive(Debug)]
pub struct Engine<C = SystemClock> {
    config: EngineConfig,
    clock: C,
    topology: Topology,
    freq_state: PolicyFreqState,
    active: ActiveCounters,
    cpu_clocks: CpuClocks,
    time_in_state: RecordTable<TimeInStateRecord>,
    concurrent: RecordTable<ConcurrentTimeRecord>,
    diagnostics: CpuDiagnostics,
    overflow_warned: AtomicBool,
}

impl Engine<SystemClock> {
    /// Engine reading time from the system monotonic clock
    ///
    /// # Panics
    ///
    /// Panics if any table capacity is 0.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock(config, SystemClock::new())
    }
}

impl<C: MonotonicClock> Engine<C> {
    /// Engine reading time from `clock`
    ///
    /// # Panics
    ///
    /// Panics if any table capacity is 0.
    pub fn with_clock(config: EngineConfig, clock: C) -> Self {
        tracing::debug!(?config, "creating accounting engine");
        Self {
            topology: Topology::with_freq_capacity(
                config.max_cpus,
                config.max_policies,
                config.freq_index_capacity,
            ),
            freq_state: PolicyFreqState::new(config.max_policies),
            active: ActiveCounters::new(config.max_cpus, config.max_policies),
            cpu_clocks: CpuClocks::new(config.max_cpus),
            time_in_state: RecordTable::new(config.time_in_state_capacity),
            concurrent: RecordTable::new(config.concurrent_capacity),
            diagnostics: CpuDiagnostics::new(config.max_cpus),
            overflow_warned: AtomicBool::new(false),
            config,
            clock,
        }
    }

    /// Context switch on `cpu`, timestamped by the engine's clock
    ///
    /// `prev` is the UID of the outgoing task and `next` that of the
    /// incoming one; `None` stands for the idle task.
    #[inline]
    pub fn on_switch(&self, cpu: CpuId, prev: Option<Uid>, next: Option<Uid>) -> SwitchOutcome {
        self.switch_at(cpu, self.clock.now_ns(), prev, next)
    }

    /// Context switch on `cpu` at `now` nanoseconds
    pub fn switch_at(
        &self,
        cpu: CpuId,
        now: u64,
        prev: Option<Uid>,
        next: Option<Uid>,
    ) -> SwitchOutcome {
        // Stored before any early return so every CPU has a fresh reference point
        let old_last = self.cpu_clocks.exchange(cpu, now);

        let Some(policy) = self.topology.policy_of(cpu) else {
            self.diagnostics.record(cpu, Counter::UnmappedCpu);
            return SwitchOutcome::UnmappedCpu;
        };

        // Other CPUs active during the interval being closed, read before
        // this switch adjusts the counters
        let before = self.active.snapshot_before(policy);

        if prev.is_none() || (old_last.is_none() && next.is_some()) {
            self.active.activate(policy);
        }

        let Some(uid) = prev else {
            self.diagnostics.record(cpu, Counter::FromIdle);
            return SwitchOutcome::FromIdle;
        };
        // This CPU is not yet counted as active, so it must not be
        // decremented even when going idle
        let Some(old_last) = old_last else {
            self.diagnostics.record(cpu, Counter::FirstEvent);
            return SwitchOutcome::FirstEvent;
        };

        if next.is_none() {
            self.active.deactivate(policy);
        }

        let Some(freq_idx) = self.freq_state.current(policy) else {
            self.diagnostics.record(cpu, Counter::FrequencyUnset);
            return SwitchOutcome::FrequencyUnset;
        };

        let delta_ns = now.saturating_sub(old_last);
        if self.charge(cpu, uid, freq_idx, before, delta_ns) {
            self.diagnostics.record(cpu, Counter::Attributed);
            SwitchOutcome::Attributed { uid, delta_ns }
        } else {
            SwitchOutcome::Dropped { uid, delta_ns }
        }
    }

    /// Frequency transition of `cpu`'s policy to `freq`
    pub fn on_frequency_change(&self, cpu: CpuId, freq: FreqKhz) -> FreqOutcome {
        let Some(policy) = self.topology.policy_of(cpu) else {
            self.diagnostics.record(cpu, Counter::UnmappedCpu);
            return FreqOutcome::UnmappedCpu;
        };
        let Some(index) = self.topology.freq_index(policy, freq) else {
            self.diagnostics.record(cpu, Counter::UnknownFrequency);
            return FreqOutcome::UnknownFrequency;
        };

        self.freq_state.store(policy, index);
        self.diagnostics.record(cpu, Counter::FrequencyUpdated);
        FreqOutcome::Updated { policy, index }
    }

    /// Returns whether the time-in-state charge landed
    #[inline]
    fn charge(
        &self,
        cpu: CpuId,
        uid: Uid,
        freq_idx: u8,
        before: ActiveSnapshot,
        delta_ns: u64,
    ) -> bool {
        let charged = match self.time_in_state.get_or_insert(RecordKey::for_freq(uid, freq_idx)) {
            Some(record) => {
                record.add(freq_offset(freq_idx), delta_ns);
                true
            }
            None => {
                self.dropped(cpu, Counter::DroppedTimeInState);
                false
            }
        };

        let mut record = self
            .concurrent
            .get_or_insert(RecordKey::for_active(uid, before.global));
        match record {
            Some(r) => r.add_active(active_offset(before.global), delta_ns),
            None => self.dropped(cpu, Counter::DroppedConcurrent),
        }

        if !same_bucket(before.global, before.policy) {
            record = self
                .concurrent
                .get_or_insert(RecordKey::for_active(uid, before.policy));
        }
        match record {
            Some(r) => r.add_policy(active_offset(before.policy), delta_ns),
            None => self.dropped(cpu, Counter::DroppedConcurrent),
        }

        charged
    }

    #[cold]
    fn dropped(&self, cpu: CpuId, counter: Counter) {
        self.diagnostics.record(cpu, counter);
        if !self.overflow_warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                cpu,
                ?counter,
                "record table full, dropping charges for new UIDs. \
                 Consider increasing table capacity."
            );
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn freq_state(&self) -> &PolicyFreqState {
        &self.freq_state
    }

    pub fn active_counters(&self) -> &ActiveCounters {
        &self.active
    }

    pub fn cpu_clocks(&self) -> &CpuClocks {
        &self.cpu_clocks
    }

    pub fn time_in_state(&self) -> &RecordTable<TimeInStateRecord> {
        &self.time_in_state
    }

    pub fn concurrent_times(&self) -> &RecordTable<ConcurrentTimeRecord> {
        &self.concurrent
    }

    /// Diagnostic counters summed over all CPUs
    pub fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.total()
    }

    /// Diagnostic counters of one CPU
    pub fn cpu_diagnostics(&self, cpu: CpuId) -> Diagnostics {
        self.diagnostics.cpu(cpu)
    }

    /// Zero all accounting state, keeping the topology tables
    pub fn reset(&mut self) {
        self.freq_state.reset();
        self.active.reset();
        self.cpu_clocks.reset();
        self.time_in_state.reset();
        self.concurrent.reset();
        self.diagnostics.reset();
        *self.overflow_warned.get_mut() = false;
        tracing::debug!("accounting state reset");
    }
}
