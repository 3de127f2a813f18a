// Shared helpers for integration tests
//
// Builds small engines with a manual clock and a fixed topology so tests
// can drive switches with explicit timestamps.

#![allow(dead_code)]

use timeinstate::clock::ManualClock;
use timeinstate::engine::{Engine, EngineConfig};
use timeinstate::topology::FreqKhz;

/// Frequencies of every test policy: index i (1-based) is i * 100 MHz
pub fn freqs(count: u32) -> Vec<FreqKhz> {
    (1..=count).map(|i| i * 100_000).collect()
}

/// Raw frequency whose 1-based index is `index`
pub fn freq_for_index(index: u32) -> FreqKhz {
    index * 100_000
}

/// Engine with `cpus` CPUs split into policies of `per_policy` CPUs each,
/// every policy indexing `nfreqs` frequencies
pub fn engine(cpus: u32, per_policy: u32, nfreqs: u32) -> Engine<ManualClock> {
    let policies = cpus.div_ceil(per_policy);
    let engine = Engine::with_clock(
        EngineConfig::small(cpus as usize, policies as usize),
        ManualClock::new(0),
    );
    for cpu in 0..cpus {
        engine
            .topology()
            .set_cpu_policy(cpu, cpu / per_policy)
            .expect("cpu in range");
    }
    for policy in 0..policies {
        engine
            .topology()
            .set_policy_frequencies(policy, &freqs(nfreqs))
            .expect("policy in range");
    }
    engine
}

/// Set every policy of `engine` to 1-based frequency `index`
pub fn set_all_freqs(engine: &Engine<ManualClock>, per_policy: u32, index: u32) {
    let cpus = engine.config().max_cpus as u32;
    for cpu in (0..cpus).step_by(per_policy as usize) {
        engine.on_frequency_change(cpu, freq_for_index(index));
    }
}
