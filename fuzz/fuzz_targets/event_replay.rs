#![no_main]

use libfuzzer_sys::fuzz_target;
use timeinstate::clock::ManualClock;
use timeinstate::engine::{Engine, EngineConfig};
use timeinstate::replay::{parse_events, replay};

fuzz_target!(|data: &[u8]| {
    // Arbitrary logs must never panic the parser or the engine
    let Ok(events) = parse_events(data) else {
        return;
    };

    let engine = Engine::with_clock(EngineConfig::small(8, 2), ManualClock::default());
    for cpu in 0..8 {
        let _ = engine.topology().set_cpu_policy(cpu, cpu / 4);
    }
    for policy in 0..2 {
        let _ = engine
            .topology()
            .set_policy_frequencies(policy, &[100_000, 200_000, 300_000]);
    }

    replay(&engine, events);
    let _ = engine.snapshot();
});
