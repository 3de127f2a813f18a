//! Read-only snapshots of the accounting tables
//!
//! Sharded records are folded back into one flat vector per UID:
//! `time_in_state[i]` is the time spent at 0-based frequency index `i`,
//! `concurrent_active[n]` / `concurrent_policy[n]` the time spent while
//! `n` other CPUs were active system-wide / in the same policy.

use crate::clock::MonotonicClock;
use crate::diagnostics::Diagnostics;
use crate::engine::Engine;
use crate::table::{flatten, Uid, CPUS_PER_RECORD, FREQS_PER_RECORD};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Accumulated times of one UID, in nanoseconds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UidTimes {
    pub uid: Uid,
    pub time_in_state: Vec<u64>,
    pub concurrent_active: Vec<u64>,
    pub concurrent_policy: Vec<u64>,
}

impl UidTimes {
    /// Total time charged at any tracked frequency
    pub fn total_ns(&self) -> u64 {
        self.time_in_state.iter().sum()
    }
}

/// Point-in-time copy of every table the engine exposes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    /// Per-UID times, ordered by UID
    pub uids: Vec<UidTimes>,
    /// CPUs active system-wide
    pub active_cpus: u32,
    /// CPUs active in each policy
    pub policy_active_cpus: Vec<u32>,
    /// Current 1-based frequency index of each policy (0 = unset)
    pub policy_freq_index: Vec<u8>,
    pub diagnostics: Diagnostics,
}

impl Snapshot {
    pub fn uid(&self, uid: Uid) -> Option<&UidTimes> {
        self.uids
            .binary_search_by_key(&uid, |t| t.uid)
            .ok()
            .map(|i| &self.uids[i])
    }

    /// Total time charged to `uid`, 0 when unknown
    pub fn total_time(&self, uid: Uid) -> u64 {
        self.uid(uid).map_or(0, UidTimes::total_ns)
    }

    /// Keep only `uid`
    pub fn retain_uid(&mut self, uid: Uid) {
        self.uids.retain(|t| t.uid == uid);
    }

    /// Text report, see the [`fmt::Display`] impl
    pub fn render_text(&self) -> String {
        self.to_string()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// One line per UID: `uid: t0 t1 ...`, times in nanoseconds
impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Time in state (ns, by frequency index) ===")?;
        for t in &self.uids {
            writeln!(f, "{}: {}", t.uid, Joined(&t.time_in_state))?;
        }
        writeln!(f)?;
        writeln!(f, "=== Concurrent time (ns, by other active CPUs) ===")?;
        for t in &self.uids {
            writeln!(f, "{} active: {}", t.uid, Joined(&t.concurrent_active))?;
            writeln!(f, "{} policy: {}", t.uid, Joined(&t.concurrent_policy))?;
        }
        writeln!(f)?;
        write!(f, "{}", DiagnosticsSummary(&self.diagnostics))
    }
}

struct DiagnosticsSummary<'a>(&'a Diagnostics);

impl fmt::Display for DiagnosticsSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let d = self.0;
        writeln!(f, "=== Events ===")?;
        writeln!(f, "attributed:        {}", d.attributed)?;
        writeln!(f, "from idle:         {}", d.from_idle)?;
        writeln!(f, "first on cpu:      {}", d.first_event)?;
        writeln!(f, "unmapped cpu:      {}", d.unmapped_cpu)?;
        writeln!(f, "frequency unset:   {}", d.frequency_unset)?;
        writeln!(f, "frequency updates: {}", d.frequency_updated)?;
        writeln!(f, "unknown frequency: {}", d.unknown_frequency)?;
        writeln!(f, "dropped (full):    {}", d.dropped())
    }
}

/// Space-separated values
struct Joined<'a>(&'a [u64]);

impl fmt::Display for Joined<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, value) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{value}")?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct UidBuckets {
    time_in_state: Vec<(u32, [u64; FREQS_PER_RECORD])>,
    active: Vec<(u32, [u64; CPUS_PER_RECORD])>,
    policy: Vec<(u32, [u64; CPUS_PER_RECORD])>,
}

impl<C: MonotonicClock> Engine<C> {
    /// Copy every table into a [`Snapshot`]
    ///
    /// Counters keep moving while this runs; each accumulator is read
    /// atomically but the snapshot as a whole is not.
    pub fn snapshot(&self) -> Snapshot {
        let mut by_uid: BTreeMap<Uid, UidBuckets> = BTreeMap::new();

        for (key, record) in self.time_in_state().iter() {
            by_uid
                .entry(key.uid)
                .or_default()
                .time_in_state
                .push((key.bucket, record.load()));
        }
        for (key, record) in self.concurrent_times().iter() {
            let entry = by_uid.entry(key.uid).or_default();
            entry.active.push((key.bucket, record.load_active()));
            entry.policy.push((key.bucket, record.load_policy()));
        }

        let uids = by_uid
            .into_iter()
            .map(|(uid, buckets)| UidTimes {
                uid,
                time_in_state: flatten(&buckets.time_in_state),
                concurrent_active: trim_trailing_zeros(flatten(&buckets.active)),
                concurrent_policy: trim_trailing_zeros(flatten(&buckets.policy)),
            })
            .collect();

        Snapshot {
            uids,
            active_cpus: self.active_counters().global(),
            policy_active_cpus: self.active_counters().policy_counts(),
            policy_freq_index: self.freq_state().raw_indices(),
            diagnostics: self.diagnostics(),
        }
    }
}

/// Concurrent records are shared by the global and policy arrays, so one
/// array may carry a bucket that only the other populated
fn trim_trailing_zeros(mut values: Vec<u64>) -> Vec<u64> {
    while values.last() == Some(&0) {
        values.pop();
    }
    values
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::engine::EngineConfig;

    fn engine() -> Engine<ManualClock> {
        let engine = Engine::with_clock(EngineConfig::small(2, 1), ManualClock::new(0));
        engine.topology().set_cpu_policy(0, 0).unwrap();
        engine.topology().set_cpu_policy(1, 0).unwrap();
        engine
            .topology()
            .set_policy_frequencies(0, &[100, 200, 300])
            .unwrap();
        engine
    }

    #[test]
    fn test_empty_snapshot() {
        let snapshot = engine().snapshot();
        assert!(snapshot.uids.is_empty());
        assert_eq!(snapshot.active_cpus, 0);
        assert_eq!(snapshot.policy_freq_index, vec![0]);
        assert_eq!(snapshot.total_time(5), 0);
    }

    #[test]
    fn test_snapshot_flattens_buckets() {
        let engine = engine();
        engine.on_frequency_change(0, 200);
        engine.switch_at(0, 0, None, Some(7));
        engine.switch_at(0, 30, Some(7), None);
        engine.switch_at(1, 0, None, Some(3));
        engine.switch_at(1, 5, Some(3), Some(3));

        let snapshot = engine.snapshot();
        assert_eq!(snapshot.uids.len(), 2);
        assert_eq!(snapshot.uids[0].uid, 3);

        let seven = snapshot.uid(7).unwrap();
        assert_eq!(seven.time_in_state.len(), FREQS_PER_RECORD);
        assert_eq!(seven.time_in_state[1], 30);
        assert_eq!(seven.total_ns(), 30);
        assert_eq!(seven.concurrent_active, vec![30]);
        assert_eq!(seven.concurrent_policy, vec![30]);

        // CPU 1 switched while CPU 0 was still idle: no other CPU active
        assert_eq!(snapshot.total_time(3), 5);
        assert_eq!(snapshot.active_cpus, 1);
        assert_eq!(snapshot.policy_freq_index, vec![2]);
    }

    #[test]
    fn test_retain_uid_and_render() {
        let engine = engine();
        engine.on_frequency_change(0, 100);
        engine.switch_at(0, 0, None, Some(7));
        engine.switch_at(0, 12, Some(7), None);

        let mut snapshot = engine.snapshot();
        snapshot.retain_uid(7);
        let text = snapshot.render_text();
        assert_eq!(text, snapshot.to_string());
        assert!(text.contains("7: 12 0"));
        assert!(text.contains("7 active: 12"));
        assert!(text.contains("attributed:        1"));

        let json = snapshot.to_json().unwrap();
        assert!(json.contains("\"time_in_state\""));
        assert!(json.contains("\"uid\": 7"));
    }

    #[test]
    fn test_text_report_layout() {
        let engine = engine();
        engine.on_frequency_change(0, 300);
        engine.switch_at(0, 0, None, Some(7));
        engine.switch_at(0, 9, Some(7), None);

        let text = engine.snapshot().to_string();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "=== Time in state (ns, by frequency index) ===");
        assert!(lines[1].starts_with("7: 0 0 9 0"));
        assert_eq!(lines[2], "");
        assert_eq!(lines[3], "=== Concurrent time (ns, by other active CPUs) ===");
        assert_eq!(lines[4], "7 active: 9");
        assert_eq!(lines[5], "7 policy: 9");
        assert_eq!(lines[7], "=== Events ===");
        assert!(text.ends_with("dropped (full):    0\n"));
    }

    #[test]
    fn test_trim_trailing_zeros() {
        assert_eq!(trim_trailing_zeros(vec![1, 0, 2, 0, 0]), vec![1, 0, 2]);
        assert!(trim_trailing_zeros(vec![0, 0]).is_empty());
    }
}
