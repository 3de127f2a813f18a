//! Per-policy current frequency index
//!
//! Written by the frequency change handler, read by the switch handler.
//! Slot value 0 means no frequency has been observed for the policy yet;
//! any other value is the 1-based index from the topology tables.

use crate::topology::PolicyId;
use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug)]
pub struct PolicyFreqState {
    current: Box<[AtomicU8]>,
}

impl PolicyFreqState {
    pub fn new(max_policies: usize) -> Self {
        Self {
            current: (0..max_policies).map(|_| AtomicU8::new(0)).collect(),
        }
    }

    /// Record `index` (1-based) as the current frequency of `policy`; last writer wins
    #[inline]
    pub fn store(&self, policy: PolicyId, index: u8) {
        if let Some(slot) = self.current.get(policy as usize) {
            slot.store(index, Ordering::Relaxed);
        }
    }

    /// Raw 1-based index, 0 when unset or out of range
    #[inline]
    pub fn load(&self, policy: PolicyId) -> u8 {
        self.current
            .get(policy as usize)
            .map_or(0, |slot| slot.load(Ordering::Relaxed))
    }

    /// Decoded 0-based index, `None` when unset
    #[inline]
    pub fn current(&self, policy: PolicyId) -> Option<u8> {
        self.load(policy).checked_sub(1)
    }

    /// Raw indices of every policy
    pub fn raw_indices(&self) -> Vec<u8> {
        self.current
            .iter()
            .map(|slot| slot.load(Ordering::Relaxed))
            .collect()
    }

    pub(crate) fn reset(&mut self) {
        for slot in self.current.iter_mut() {
            *slot.get_mut() = 0;
        }
    }
}
