//! Topology tables: processor → policy-group and (policy, frequency) → index
//!
//! Both tables are populated from outside the accounting engine (a loader
//! reading the platform's cpufreq layout, a config file, a test) and are
//! consulted read-mostly by the event handlers. Lookups are plain atomic
//! loads; writers never block them.
//!
//! # Encoding
//!
//! ```text
//! cpu_policy[cpu] = 0            → unmapped
//! cpu_policy[cpu] = policy + 1   → mapped to `policy`
//!
//! freq_to_idx[(policy, freq)]    → 1..=255 (0 is reserved for "unset")
//! ```

use crate::table::{RecordTable, ResetRecord, SlotKey};
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use thiserror::Error;

/// Processor identifier
pub type CpuId = u32;
/// Scheduling policy-group identifier (a set of CPUs sharing a frequency controller)
pub type PolicyId = u32;
/// Raw frequency value as reported by the frequency driver (usually kHz)
pub type FreqKhz = u32;

/// Highest frequency index that fits the per-policy state
pub const MAX_FREQ_INDEX: u8 = u8::MAX;

/// Default number of `(policy, frequency)` entries
pub const DEFAULT_FREQ_INDEX_CAPACITY: usize = 2048;

/// Errors raised while populating topology tables
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("cpu {cpu} out of range (max_cpus = {max})")]
    CpuOutOfRange { cpu: CpuId, max: usize },

    #[error("policy {policy} out of range (max_policies = {max})")]
    PolicyOutOfRange { policy: PolicyId, max: usize },

    #[error("frequency index 0 is reserved for an unset frequency")]
    ReservedIndex,

    #[error("policy {policy} lists {count} frequencies, at most {max} are trackable", max = MAX_FREQ_INDEX)]
    TooManyFrequencies { policy: PolicyId, count: usize },

    #[error("frequency index table is full, cannot index {freq} for policy {policy}")]
    FreqTableFull { policy: PolicyId, freq: FreqKhz },
}

/// Key of the frequency-index table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FreqIndexKey {
    pub policy: PolicyId,
    pub freq: FreqKhz,
}

// Policies stay below `u32::MAX`, so no key packs to the empty marker
impl SlotKey for FreqIndexKey {
    #[inline]
    fn pack(self) -> u64 {
        (u64::from(self.policy) << 32) | u64::from(self.freq)
    }

    #[inline]
    fn unpack(packed: u64) -> Self {
        Self {
            policy: (packed >> 32) as u32,
            freq: packed as u32,
        }
    }
}

/// Index of one `(policy, frequency)` pair, 0 once removed
#[derive(Debug, Default)]
struct FreqIndexEntry(AtomicU8);

impl FreqIndexEntry {
    #[inline]
    fn load(&self) -> Option<u8> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            index => Some(index),
        }
    }
}

impl ResetRecord for FreqIndexEntry {
    fn clear(&mut self) {
        *self.0.get_mut() = 0;
    }
}

/// Processor and frequency lookup tables
#[derive(Debug)]
pub struct Topology {
    cpu_policy: Box<[AtomicU32]>,
    max_policies: usize,
    freq_to_idx: RecordTable<FreqIndexEntry, FreqIndexKey>,
}

impl Topology {
    /// Create empty tables sized for `max_cpus` processors and `max_policies` groups
    pub fn new(max_cpus: usize, max_policies: usize) -> Self {
        Self::with_freq_capacity(max_cpus, max_policies, DEFAULT_FREQ_INDEX_CAPACITY)
    }

    /// As [`Topology::new`], with room for `freq_capacity` `(policy, frequency)` pairs
    ///
    /// # Panics
    ///
    /// Panics if `freq_capacity` is 0.
    pub fn with_freq_capacity(max_cpus: usize, max_policies: usize, freq_capacity: usize) -> Self {
        Self {
            cpu_policy: (0..max_cpus).map(|_| AtomicU32::new(0)).collect(),
            // `policy + 1` must fit the cpu_policy encoding
            max_policies: max_policies.min(u32::MAX as usize),
            freq_to_idx: RecordTable::new(freq_capacity),
        }
    }

    pub fn max_cpus(&self) -> usize {
        self.cpu_policy.len()
    }

    pub fn max_policies(&self) -> usize {
        self.max_policies
    }

    /// Map `cpu` to `policy`
    pub fn set_cpu_policy(&self, cpu: CpuId, policy: PolicyId) -> Result<(), TopologyError> {
        let slot = self
            .cpu_policy
            .get(cpu as usize)
            .ok_or(TopologyError::CpuOutOfRange {
                cpu,
                max: self.cpu_policy.len(),
            })?;
        self.check_policy(policy)?;
        slot.store(policy + 1, Ordering::Release);
        tracing::debug!(cpu, policy, "cpu mapped to policy");
        Ok(())
    }

    /// Remove the mapping for `cpu` (events on it become no-ops)
    pub fn clear_cpu_policy(&self, cpu: CpuId) {
        if let Some(slot) = self.cpu_policy.get(cpu as usize) {
            slot.store(0, Ordering::Release);
            tracing::debug!(cpu, "cpu unmapped");
        }
    }

    /// Policy-group of `cpu`, `None` when unmapped or out of range
    #[inline]
    pub fn policy_of(&self, cpu: CpuId) -> Option<PolicyId> {
        let raw = self.cpu_policy.get(cpu as usize)?.load(Ordering::Acquire);
        raw.checked_sub(1)
    }

    /// Assign a 1-based index to `(policy, freq)`
    pub fn set_freq_index(
        &self,
        policy: PolicyId,
        freq: FreqKhz,
        index: u8,
    ) -> Result<(), TopologyError> {
        self.check_policy(policy)?;
        if index == 0 {
            return Err(TopologyError::ReservedIndex);
        }
        self.insert_freq_index(policy, freq, index)
    }

    /// Index `freqs` as 1, 2, 3, ... in the order given, replacing the
    /// policy's previous list
    ///
    /// Returns the number of indices assigned. Frequencies missing from
    /// `freqs` stop being tracked; their table entries are kept for reuse.
    pub fn set_policy_frequencies(
        &self,
        policy: PolicyId,
        freqs: &[FreqKhz],
    ) -> Result<usize, TopologyError> {
        self.check_policy(policy)?;
        if freqs.len() > MAX_FREQ_INDEX as usize {
            return Err(TopologyError::TooManyFrequencies {
                policy,
                count: freqs.len(),
            });
        }
        // New indices first, so a frequency listed again is never briefly untracked
        for (i, &freq) in freqs.iter().enumerate() {
            self.insert_freq_index(policy, freq, (i + 1) as u8)?;
        }
        let mut removed = 0usize;
        for (key, entry) in self.freq_to_idx.iter() {
            if key.policy == policy && !freqs.contains(&key.freq) && entry.load().is_some() {
                entry.0.store(0, Ordering::Release);
                removed += 1;
            }
        }
        tracing::debug!(
            policy,
            count = freqs.len(),
            removed,
            "policy frequencies indexed"
        );
        Ok(freqs.len())
    }

    /// Index of `(policy, freq)`, `None` when the frequency is not tracked
    #[inline]
    pub fn freq_index(&self, policy: PolicyId, freq: FreqKhz) -> Option<u8> {
        self.freq_to_idx
            .get(FreqIndexKey { policy, freq })
            .and_then(FreqIndexEntry::load)
    }

    /// All `(freq, index)` pairs of `policy`, ordered by index
    pub fn policy_frequencies(&self, policy: PolicyId) -> Vec<(FreqKhz, u8)> {
        let mut out: Vec<(FreqKhz, u8)> = self
            .freq_to_idx
            .iter()
            .filter(|(key, _)| key.policy == policy)
            .filter_map(|(key, entry)| entry.load().map(|idx| (key.freq, idx)))
            .collect();
        out.sort_by_key(|&(freq, idx)| (idx, freq));
        out
    }

    /// Mapped CPUs as `(cpu, policy)` pairs
    pub fn cpu_mappings(&self) -> Vec<(CpuId, PolicyId)> {
        (0..self.cpu_policy.len() as CpuId)
            .filter_map(|cpu| self.policy_of(cpu).map(|policy| (cpu, policy)))
            .collect()
    }

    fn insert_freq_index(
        &self,
        policy: PolicyId,
        freq: FreqKhz,
        index: u8,
    ) -> Result<(), TopologyError> {
        let entry = self
            .freq_to_idx
            .get_or_insert(FreqIndexKey { policy, freq })
            .ok_or(TopologyError::FreqTableFull { policy, freq })?;
        entry.0.store(index, Ordering::Release);
        Ok(())
    }

    fn check_policy(&self, policy: PolicyId) -> Result<(), TopologyError> {
        if (policy as usize) < self.max_policies {
            Ok(())
        } else {
            Err(TopologyError::PolicyOutOfRange {
                policy,
                max: self.max_policies,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unmapped_cpu_reads_none() {
        let topo = Topology::new(4, 2);
        assert_eq!(topo.policy_of(0), None);
        assert_eq!(topo.policy_of(100), None);
    }

    #[test]
    fn test_policy_zero_is_distinct_from_unmapped() {
        let topo = Topology::new(4, 2);
        topo.set_cpu_policy(1, 0).unwrap();
        assert_eq!(topo.policy_of(1), Some(0));
        topo.clear_cpu_policy(1);
        assert_eq!(topo.policy_of(1), None);
    }

    #[test]
    fn test_out_of_range_rejected() {
        let topo = Topology::new(4, 2);
        assert_eq!(
            topo.set_cpu_policy(4, 0),
            Err(TopologyError::CpuOutOfRange { cpu: 4, max: 4 })
        );
        assert_eq!(
            topo.set_cpu_policy(0, 2),
            Err(TopologyError::PolicyOutOfRange { policy: 2, max: 2 })
        );
    }

    #[test]
    fn test_reserved_index_rejected() {
        let topo = Topology::new(4, 2);
        assert_eq!(
            topo.set_freq_index(0, 300_000, 0),
            Err(TopologyError::ReservedIndex)
        );
    }

    #[test]
    fn test_policy_frequencies_are_one_based() {
        let topo = Topology::new(4, 2);
        let n = topo
            .set_policy_frequencies(1, &[300_000, 600_000, 1_200_000])
            .unwrap();
        assert_eq!(n, 3);
        assert_eq!(topo.freq_index(1, 300_000), Some(1));
        assert_eq!(topo.freq_index(1, 1_200_000), Some(3));
        assert_eq!(topo.freq_index(0, 300_000), None);
        assert_eq!(
            topo.policy_frequencies(1),
            vec![(300_000, 1), (600_000, 2), (1_200_000, 3)]
        );
    }

    #[test]
    fn test_too_many_frequencies() {
        let topo = Topology::new(1, 1);
        let freqs: Vec<FreqKhz> = (0..256).collect();
        assert!(matches!(
            topo.set_policy_frequencies(0, &freqs),
            Err(TopologyError::TooManyFrequencies { count: 256, .. })
        ));
    }

    #[test]
    fn test_shorter_list_replaces_previous_frequencies() {
        let topo = Topology::new(1, 2);
        topo.set_policy_frequencies(0, &[100, 200, 300, 400]).unwrap();
        topo.set_policy_frequencies(1, &[100, 200]).unwrap();

        assert_eq!(topo.set_policy_frequencies(0, &[300, 100]), Ok(2));
        assert_eq!(topo.freq_index(0, 300), Some(1));
        assert_eq!(topo.freq_index(0, 100), Some(2));
        assert_eq!(topo.freq_index(0, 200), None);
        assert_eq!(topo.freq_index(0, 400), None);
        assert_eq!(topo.policy_frequencies(0), vec![(300, 1), (100, 2)]);
        // Other policies untouched
        assert_eq!(topo.policy_frequencies(1), vec![(100, 1), (200, 2)]);

        // A dropped frequency can be listed again
        topo.set_policy_frequencies(0, &[400]).unwrap();
        assert_eq!(topo.freq_index(0, 400), Some(1));
        assert_eq!(topo.freq_index(0, 300), None);
    }

    #[test]
    fn test_freq_table_full() {
        let topo = Topology::with_freq_capacity(1, 1, 2);
        assert_eq!(
            topo.set_policy_frequencies(0, &[1, 2, 3]),
            Err(TopologyError::FreqTableFull { policy: 0, freq: 3 })
        );
    }

    #[test]
    fn test_relisted_frequency_readable_during_update() {
        let topo = Topology::new(1, 1);
        topo.set_policy_frequencies(0, &[100, 200]).unwrap();
        let barrier = std::sync::Barrier::new(2);

        std::thread::scope(|s| {
            s.spawn(|| {
                barrier.wait();
                for round in 0..10_000u32 {
                    let freqs = if round % 2 == 0 { [100, 200] } else { [200, 100] };
                    topo.set_policy_frequencies(0, &freqs).unwrap();
                }
            });
            barrier.wait();
            for _ in 0..10_000 {
                // Both frequencies stay listed, so every read resolves
                assert!(matches!(topo.freq_index(0, 100), Some(1 | 2)));
            }
        });
    }

    #[test]
    fn test_cpu_mappings() {
        let topo = Topology::new(4, 2);
        topo.set_cpu_policy(0, 0).unwrap();
        topo.set_cpu_policy(3, 1).unwrap();
        assert_eq!(topo.cpu_mappings(), vec![(0, 0), (3, 1)]);
    }
}
