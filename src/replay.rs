//! Event-log replay
//!
//! Drives an [`Engine`] from a recorded stream of scheduler and cpufreq
//! events, one JSON object per line:
//!
//! ```text
//! {"type":"freq","cpu":0,"freq":1804800}
//! {"type":"switch","cpu":0,"ts":1000,"prev":null,"next":10001}
//! {"type":"switch","cpu":0,"ts":2500,"prev":10001,"next":null}
//! ```
//!
//! `prev` / `next` are the UIDs of the outgoing and incoming tasks, `null`
//! for the idle task. Replaying a log into a fresh engine is deterministic.

use crate::clock::MonotonicClock;
use crate::engine::{Engine, FreqOutcome, SwitchOutcome};
use crate::table::Uid;
use crate::topology::{CpuId, FreqKhz};
use serde::{Deserialize, Serialize};
use std::io::BufRead;
use thiserror::Error;

/// One recorded event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Event {
    Switch {
        cpu: CpuId,
        ts: u64,
        prev: Option<Uid>,
        next: Option<Uid>,
    },
    Freq {
        cpu: CpuId,
        freq: FreqKhz,
    },
}

#[derive(Error, Debug)]
pub enum ReplayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: invalid event: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Parse a JSON-lines event log; blank lines and `#` comments are skipped
pub fn parse_events<R: BufRead>(reader: R) -> Result<Vec<Event>, ReplayError> {
    let mut events = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let event = serde_json::from_str(trimmed).map_err(|source| ReplayError::Parse {
            line: i + 1,
            source,
        })?;
        events.push(event);
    }
    tracing::debug!(count = events.len(), "parsed event log");
    Ok(events)
}

/// Outcome tally of a replay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReplayStats {
    pub switches: u64,
    pub freq_changes: u64,
    pub attributed: u64,
    /// Sum of all attributed intervals
    pub attributed_ns: u64,
    /// Switches whose interval was lost to a full time-in-state table
    pub dropped: u64,
    pub skipped: u64,
}

/// Feed `events` to `engine` in order
pub fn replay<C, I>(engine: &Engine<C>, events: I) -> ReplayStats
where
    C: MonotonicClock,
    I: IntoIterator<Item = Event>,
{
    let mut stats = ReplayStats::default();
    for event in events {
        match event {
            Event::Switch {
                cpu,
                ts,
                prev,
                next,
            } => {
                stats.switches += 1;
                match engine.switch_at(cpu, ts, prev, next) {
                    SwitchOutcome::Attributed { delta_ns, .. } => {
                        stats.attributed += 1;
                        stats.attributed_ns = stats.attributed_ns.saturating_add(delta_ns);
                    }
                    SwitchOutcome::Dropped { .. } => stats.dropped += 1,
                    _ => stats.skipped += 1,
                }
            }
            Event::Freq { cpu, freq } => {
                stats.freq_changes += 1;
                if !matches!(
                    engine.on_frequency_change(cpu, freq),
                    FreqOutcome::Updated { .. }
                ) {
                    stats.skipped += 1;
                }
            }
        }
    }
    tracing::debug!(?stats, "replay complete");
    stats
}
