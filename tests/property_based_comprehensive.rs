//! Property-based tests for the accounting engine
//!
//! Core properties:
//! 1. Time-in-state totals equal the sum of charged intervals
//! 2. Active-CPU counts stay within [0, cpus] for well-formed streams
//! 3. Replaying a log into a fresh engine is deterministic
//! 4. Frequency index i always lands at offset i % 32 of bucket i / 32
//! 5. Active count n always lands at offset n % 8 of bucket n / 8

mod common;

use proptest::prelude::*;
use std::collections::HashMap;
use timeinstate::engine::SwitchOutcome;
use timeinstate::replay::{replay, Event};
use timeinstate::table::{
    active_offset, freq_offset, RecordKey, CPUS_PER_RECORD, FREQS_PER_RECORD,
};

const CPUS: u32 = 4;
const PER_POLICY: u32 = 2;
const NFREQS: u32 = 40;

/// One step on one CPU: run `uid` (None = idle) for `gap` ns, possibly
/// preceded by a frequency change
#[derive(Debug, Clone)]
struct Step {
    cpu: u32,
    next: Option<u32>,
    gap: u64,
    freq: Option<u32>,
}

fn step() -> impl Strategy<Value = Step> {
    (
        0..CPUS,
        prop::option::of(0u32..5),
        1u64..10_000,
        prop::option::weighted(0.2, 0u32..=NFREQS + 2),
    )
        .prop_map(|(cpu, next, gap, freq)| Step {
            cpu,
            next,
            gap,
            freq,
        })
}

/// Turn steps into a well-formed event log: per-CPU timestamps increase and
/// each switch's `prev` is the CPU's previous `next`. Idle-to-idle steps
/// are not switches and are dropped.
fn to_events(steps: &[Step]) -> Vec<Event> {
    let mut now = [0u64; CPUS as usize];
    let mut running: [Option<u32>; CPUS as usize] = [None; CPUS as usize];
    let mut events = Vec::new();
    for s in steps {
        let cpu = s.cpu as usize;
        if running[cpu].is_none() && s.next.is_none() {
            continue;
        }
        if let Some(index) = s.freq {
            // index 0 and anything past NFREQS are not in the table
            events.push(Event::Freq {
                cpu: s.cpu,
                freq: common::freq_for_index(index),
            });
        }
        now[cpu] += s.gap;
        events.push(Event::Switch {
            cpu: s.cpu,
            ts: now[cpu],
            prev: running[cpu],
            next: s.next,
        });
        running[cpu] = s.next;
    }
    events
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn prop_totals_match_attributed_intervals(steps in prop::collection::vec(step(), 0..200)) {
        let engine = common::engine(CPUS, PER_POLICY, NFREQS);
        let mut expected: HashMap<u32, u64> = HashMap::new();

        for event in to_events(&steps) {
            match event {
                Event::Switch { cpu, ts, prev, next } => {
                    if let SwitchOutcome::Attributed { uid, delta_ns } =
                        engine.switch_at(cpu, ts, prev, next)
                    {
                        prop_assert_eq!(Some(uid), prev);
                        *expected.entry(uid).or_default() += delta_ns;
                    }
                    let global = engine.active_counters().global();
                    prop_assert!(global <= CPUS);
                }
                Event::Freq { cpu, freq } => {
                    engine.on_frequency_change(cpu, freq);
                }
            }
        }

        let snapshot = engine.snapshot();
        for (uid, total) in &expected {
            prop_assert_eq!(snapshot.total_time(*uid), *total);
            let times = snapshot.uid(*uid).unwrap();
            prop_assert_eq!(times.concurrent_active.iter().sum::<u64>(), *total);
            prop_assert_eq!(times.concurrent_policy.iter().sum::<u64>(), *total);
        }
        prop_assert_eq!(snapshot.uids.len(), expected.len());
    }

    #[test]
    fn prop_replay_is_deterministic(steps in prop::collection::vec(step(), 0..150)) {
        let events = to_events(&steps);
        let a = common::engine(CPUS, PER_POLICY, NFREQS);
        let b = common::engine(CPUS, PER_POLICY, NFREQS);
        let stats_a = replay(&a, events.iter().copied());
        let stats_b = replay(&b, events);
        prop_assert_eq!(stats_a, stats_b);
        prop_assert_eq!(a.snapshot(), b.snapshot());
    }

    #[test]
    fn prop_frequency_bucket_invariant(index in 1u32..=64, delta in 1u64..1_000_000) {
        let engine = common::engine(1, 1, 64);
        engine.on_frequency_change(0, common::freq_for_index(index));
        engine.switch_at(0, 0, None, Some(7));
        engine.switch_at(0, delta, Some(7), None);

        let decoded = (index - 1) as u8;
        let bucket = u32::from(decoded) / FREQS_PER_RECORD as u32;
        let record = engine.time_in_state().get(RecordKey::new(7, bucket));
        prop_assert!(record.is_some());
        let values = record.unwrap().load();
        prop_assert_eq!(values[freq_offset(decoded)], delta);
        prop_assert_eq!(values.iter().sum::<u64>(), delta);
        prop_assert_eq!(engine.time_in_state().len(), 1);
    }

    #[test]
    fn prop_active_bucket_invariant(others in 0u32..20) {
        let cpus = others + 1;
        let engine = common::engine(cpus, cpus, 1);
        engine.on_frequency_change(0, common::freq_for_index(1));
        for cpu in 0..cpus {
            engine.switch_at(cpu, 0, None, Some(9));
        }
        engine.switch_at(0, 10, Some(9), None);

        let bucket = others / CPUS_PER_RECORD as u32;
        let record = engine.concurrent_times().get(RecordKey::new(9, bucket));
        prop_assert!(record.is_some());
        let record = record.unwrap();
        prop_assert_eq!(record.load_active()[active_offset(others)], 10);
        prop_assert_eq!(record.load_policy()[active_offset(others)], 10);
    }
}
