//! Fixed-capacity, lock-free record tables
//!
//! Per-UID counters are sharded into fixed-width records so that a record
//! never grows: frequency index `i` lives at offset `i % 32` of bucket
//! `i / 32`, active-CPU count `n` at offset `n % 8` of bucket `n / 8`.
//!
//! # Design
//!
//! ```text
//! slots: [ key: AtomicU64 | record: R ] × 2·capacity (power of two)
//!
//! get_or_insert(key):
//!   h = fnv(key) & mask
//!   for i in 0..slots:
//!     slot[h + i].key == key    → hit
//!     slot[h + i].key == EMPTY  → reserve one of `capacity` records
//!                                   none left → None (event dropped)
//!                                 CAS(EMPTY → key)
//!                                   won  → fresh zeroed record
//!                                   lost → release; winner may hold our key
//! ```
//!
//! At most `capacity` slots are ever claimed, so the table stays at most
//! half full and a probe always reaches an empty slot within a short run.
//! Records are pre-allocated and zeroed at construction, so the hot path
//! never allocates. Slots are never freed while the table is shared;
//! [`RecordTable::reset`] needs exclusive access.

use fnv::FnvHasher;
use serde::Serialize;
use std::hash::Hasher;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Owner identity being charged for CPU time
pub type Uid = u32;

/// Frequencies tracked by one time-in-state record
pub const FREQS_PER_RECORD: usize = 32;
/// Active-CPU counts tracked by one concurrent-time record
pub const CPUS_PER_RECORD: usize = 8;

/// Packed value of a slot nobody has claimed
const EMPTY: u64 = u64::MAX;

/// Key a table slot is claimed with, packed into one `u64`
///
/// No key may pack to `u64::MAX`, the empty-slot marker.
pub trait SlotKey: Copy {
    fn pack(self) -> u64;
    fn unpack(packed: u64) -> Self;
}

/// Record key: owner identity and bucket number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RecordKey {
    pub uid: Uid,
    pub bucket: u32,
}

impl RecordKey {
    pub const fn new(uid: Uid, bucket: u32) -> Self {
        Self { uid, bucket }
    }

    /// Key of the time-in-state record holding frequency index `freq_idx` (0-based)
    #[inline]
    pub const fn for_freq(uid: Uid, freq_idx: u8) -> Self {
        Self::new(uid, freq_idx as u32 / FREQS_PER_RECORD as u32)
    }

    /// Key of the concurrent-time record holding active count `nactive`
    #[inline]
    pub const fn for_active(uid: Uid, nactive: u32) -> Self {
        Self::new(uid, nactive / CPUS_PER_RECORD as u32)
    }

}

// Buckets never reach `u32::MAX`, so no key packs to EMPTY
impl SlotKey for RecordKey {
    #[inline]
    fn pack(self) -> u64 {
        (u64::from(self.uid) << 32) | u64::from(self.bucket)
    }

    #[inline]
    fn unpack(packed: u64) -> Self {
        Self::new((packed >> 32) as u32, packed as u32)
    }
}

/// Offset of frequency index `freq_idx` within its record
#[inline]
pub const fn freq_offset(freq_idx: u8) -> usize {
    freq_idx as usize % FREQS_PER_RECORD
}

/// Offset of active count `nactive` within its record
#[inline]
pub const fn active_offset(nactive: u32) -> usize {
    nactive as usize % CPUS_PER_RECORD
}

/// Nanoseconds spent at each of 32 consecutive frequency indices
#[derive(Debug)]
pub struct TimeInStateRecord {
    times: [AtomicU64; FREQS_PER_RECORD],
}

impl Default for TimeInStateRecord {
    fn default() -> Self {
        Self {
            times: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl TimeInStateRecord {
    #[inline]
    pub fn add(&self, offset: usize, delta_ns: u64) {
        self.times[offset].fetch_add(delta_ns, Ordering::Relaxed);
    }

    pub fn load(&self) -> [u64; FREQS_PER_RECORD] {
        std::array::from_fn(|i| self.times[i].load(Ordering::Relaxed))
    }
}

/// Nanoseconds spent at each of 8 consecutive active-CPU counts, system-wide
/// (`active`) and within the running CPU's policy-group (`policy`)
#[derive(Debug)]
pub struct ConcurrentTimeRecord {
    active: [AtomicU64; CPUS_PER_RECORD],
    policy: [AtomicU64; CPUS_PER_RECORD],
}

impl Default for ConcurrentTimeRecord {
    fn default() -> Self {
        Self {
            active: std::array::from_fn(|_| AtomicU64::new(0)),
            policy: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl ConcurrentTimeRecord {
    #[inline]
    pub fn add_active(&self, offset: usize, delta_ns: u64) {
        self.active[offset].fetch_add(delta_ns, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_policy(&self, offset: usize, delta_ns: u64) {
        self.policy[offset].fetch_add(delta_ns, Ordering::Relaxed);
    }

    pub fn load_active(&self) -> [u64; CPUS_PER_RECORD] {
        std::array::from_fn(|i| self.active[i].load(Ordering::Relaxed))
    }

    pub fn load_policy(&self) -> [u64; CPUS_PER_RECORD] {
        std::array::from_fn(|i| self.policy[i].load(Ordering::Relaxed))
    }
}

/// Zeroing for records held in a table being reset
pub trait ResetRecord {
    fn clear(&mut self);
}

impl ResetRecord for TimeInStateRecord {
    fn clear(&mut self) {
        for t in self.times.iter_mut() {
            *t.get_mut() = 0;
        }
    }
}

impl ResetRecord for ConcurrentTimeRecord {
    fn clear(&mut self) {
        for t in self.active.iter_mut().chain(self.policy.iter_mut()) {
            *t.get_mut() = 0;
        }
    }
}

#[derive(Debug)]
struct Slot<R> {
    key: AtomicU64,
    record: R,
}

/// Pre-allocated open-addressing table with create-if-absent lookups
#[derive(Debug)]
pub struct RecordTable<R, K = RecordKey> {
    slots: Box<[Slot<R>]>,
    mask: usize,
    capacity: usize,
    /// Records claimed, plus reservations of inserts still in flight
    claimed: AtomicUsize,
    _key: PhantomData<fn() -> K>,
}

impl<R: Default + ResetRecord, K: SlotKey> RecordTable<R, K> {
    /// Create a table holding up to `capacity` records
    ///
    /// # Panics
    ///
    /// Panics if capacity is 0.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "Record table capacity must be > 0");

        let size = capacity.saturating_mul(2).next_power_of_two();
        let slots = (0..size)
            .map(|_| Slot {
                key: AtomicU64::new(EMPTY),
                record: R::default(),
            })
            .collect();

        Self {
            slots,
            mask: size - 1,
            capacity,
            claimed: AtomicUsize::new(0),
            _key: PhantomData,
        }
    }

    /// Find the record for `key`, claiming a zeroed slot if it has none
    ///
    /// Returns `None` when `capacity` records already exist; the caller
    /// drops the event. Near the limit an insert racing with another
    /// thread's lost claim can also be refused.
    #[inline]
    pub fn get_or_insert(&self, key: K) -> Option<&R> {
        let packed = key.pack();
        let start = Self::hash(packed);

        for i in 0..self.slots.len() {
            let slot = &self.slots[start.wrapping_add(i) & self.mask];
            let current = slot.key.load(Ordering::Acquire);
            if current == packed {
                return Some(&slot.record);
            }
            if current != EMPTY {
                continue;
            }
            if !self.reserve() {
                return None;
            }
            match slot
                .key
                .compare_exchange(EMPTY, packed, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Some(&slot.record),
                Err(winner) => {
                    self.claimed.fetch_sub(1, Ordering::Relaxed);
                    // The winner may have claimed it for the same key
                    if winner == packed {
                        return Some(&slot.record);
                    }
                }
            }
        }

        None
    }

    /// Find the record for `key` without creating it
    pub fn get(&self, key: K) -> Option<&R> {
        let packed = key.pack();
        let start = Self::hash(packed);

        for i in 0..self.slots.len() {
            let slot = &self.slots[start.wrapping_add(i) & self.mask];
            match slot.key.load(Ordering::Acquire) {
                k if k == packed => return Some(&slot.record),
                EMPTY => return None,
                _ => {}
            }
        }

        None
    }

    /// Occupied slots, in slot order
    pub fn iter(&self) -> impl Iterator<Item = (K, &R)> + '_ {
        self.slots.iter().filter_map(|slot| {
            let packed = slot.key.load(Ordering::Acquire);
            (packed != EMPTY).then(|| (K::unpack(packed), &slot.record))
        })
    }

    /// Number of records created so far
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Most records the table will hold
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every record
    pub fn reset(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot.key.get_mut() = EMPTY;
            slot.record.clear();
        }
        *self.claimed.get_mut() = 0;
    }

    /// Take one of the `capacity` records, `false` when none are left
    #[inline]
    fn reserve(&self) -> bool {
        if self.claimed.fetch_add(1, Ordering::Relaxed) < self.capacity {
            true
        } else {
            self.claimed.fetch_sub(1, Ordering::Relaxed);
            false
        }
    }

    #[inline]
    fn hash(packed: u64) -> usize {
        let mut hasher = FnvHasher::default();
        hasher.write_u64(packed);
        hasher.finish() as usize
    }
}

/// Flatten the records of one UID into a single vector indexed by
/// `bucket * width + offset`
pub(crate) fn flatten<const W: usize>(buckets: &[(u32, [u64; W])]) -> Vec<u64> {
    let len = buckets
        .iter()
        .map(|&(bucket, _)| (bucket as usize + 1) * W)
        .max()
        .unwrap_or(0);
    let mut out = vec![0u64; len];
    for &(bucket, values) in buckets {
        let base = bucket as usize * W;
        out[base..base + W].copy_from_slice(&values);
    }
    out
}

/// Policy-local and global concurrency buckets coincide, so one record serves both
#[inline]
pub(crate) fn same_bucket(global: u32, policy: u32) -> bool {
    global / CPUS_PER_RECORD as u32 == policy / CPUS_PER_RECORD as u32
}
