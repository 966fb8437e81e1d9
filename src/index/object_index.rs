//! The index engine: lookup, insert, delete, replace.
//!
//! Chains are walked in line-then-slot order. All mutation goes through
//! `&mut self`; shared-reference operations only touch the relaxed atomic
//! perf counters, so readers and the single writer must be serialized by
//! the caller (a mutex, a single owning thread, or one instance per shard).

use std::fmt;
use std::ptr::NonNull;

use crate::address::LogAddress;
use crate::config::IndexConfig;
use crate::constants::ENTRIES_PER_LINE;
use crate::error::IndexError;
use crate::index::table::{alloc_overflow_line, free_overflow_line};
use crate::index::{BucketArray, CacheLine, EntryView, KeyHash, LineEntry, PerfCounters, PerfSnapshot};
use crate::utility::{is_power_of_two, timestamp};

/// A map from 64-bit object ids to the location of each object's latest
/// version in the external append-only log.
///
/// The index is an array of buckets, one cache line each, chained into
/// overflow lines as they fill. It is scoped to a single logical table and
/// is **not** internally synchronized: one writer and one reader at a time,
/// with any concurrency layered on top by the caller.
///
/// A lookup hit is a *candidate*: the entry's 16-bit secondary hash matched,
/// but only the object record itself holds the authoritative key. Callers
/// dereference the returned address, compare the stored key, and on mismatch
/// continue through [`lookup_all`](Self::lookup_all).
pub struct ObjectIndex {
    buckets: BucketArray,
    perf: PerfCounters,
    /// Lines allocated beyond the bucket array, for growth accounting.
    overflow_lines: u64,
}

impl ObjectIndex {
    /// Construct an empty index.
    ///
    /// Returns [`IndexError::AllocationFailed`] when the bucket array cannot
    /// be allocated.
    ///
    /// # Panics
    /// Panics if `config.n_buckets` is zero.
    pub fn new(config: &IndexConfig) -> Result<Self, IndexError> {
        assert!(config.n_buckets > 0, "index needs at least one bucket");
        if !is_power_of_two(config.n_buckets) {
            tracing::warn!(
                n_buckets = config.n_buckets,
                "bucket count is not a power of two; bucket selection falls back to modulo"
            );
        }
        let buckets = BucketArray::allocate(config.n_buckets, config.use_large_pages)?;
        Ok(Self {
            buckets,
            perf: PerfCounters::new(),
            overflow_lines: 0,
        })
    }

    /// Get the number of buckets
    #[inline]
    pub fn n_buckets(&self) -> u64 {
        self.buckets.len()
    }

    /// Look up the first candidate for `key`.
    ///
    /// Returns the address stored in the first occupied entry whose secondary
    /// hash matches, in chain-then-slot order, or `None` when the chain holds
    /// no match. The caller verifies the key through the object record; see
    /// [`lookup_all`](Self::lookup_all) for continuing past a false match.
    pub fn lookup(&self, key: u64) -> Option<LogAddress> {
        let start = timestamp();
        let found = self.lookup_all(key).next();
        self.perf.record_lookup(timestamp().wrapping_sub(start));
        found
    }

    /// Iterate over every candidate for `key`, in chain order.
    ///
    /// Advancing the iterator past a candidate tells the index the caller
    /// rejected it after key verification, which is counted as a hash
    /// collision. The iterator does not feed the per-lookup cycle
    /// distribution; only [`lookup`](Self::lookup) is timed.
    pub fn lookup_all(&self, key: u64) -> Candidates<'_> {
        let hash = KeyHash::new(key);
        let head = self.buckets.line(hash.bucket_index(self.buckets.len()));
        Candidates {
            perf: &self.perf,
            line: Some(head),
            slot: 0,
            tag: hash.tag(),
            yielded: false,
        }
    }

    /// Insert a new entry for `key`.
    ///
    /// The address must be non-null and fit in 47 bits. The entry lands in
    /// the first unused slot of the bucket's chain; a full chain grows by
    /// exactly one overflow line. Insert never checks whether the key is
    /// already present — callers wanting upsert semantics use
    /// [`replace`](Self::replace).
    pub fn insert(&mut self, key: u64, address: LogAddress) -> Result<(), IndexError> {
        validate(address)?;
        let start = timestamp();
        let hash = KeyHash::new(key);
        let result = self.insert_packed(hash, LineEntry::occupied(hash.tag(), address));
        self.perf.record_insert(timestamp().wrapping_sub(start));
        result
    }

    /// Remove the first entry whose secondary hash matches `key`.
    ///
    /// Returns whether an entry was removed. Matching is by hash only; a
    /// caller that kept colliding keys apart through verification deletes
    /// the survivor it means by re-inserting the one it does not. Chains are
    /// never shrunk; a cleared slot is reused by later inserts.
    pub fn delete(&mut self, key: u64) -> bool {
        match self.find_occupied_slot(KeyHash::new(key)) {
            Some(slot) => {
                // SAFETY: slot points into a live line; &mut self is exclusive.
                unsafe { slot.as_ptr().write(LineEntry::UNUSED) };
                true
            }
            None => false,
        }
    }

    /// Point the first hash-matching entry for `key` at a new address.
    ///
    /// Returns `Ok(true)` when an existing entry was overwritten (its
    /// secondary hash bits are preserved) and `Ok(false)` when no entry
    /// matched and the address was inserted fresh.
    pub fn replace(&mut self, key: u64, address: LogAddress) -> Result<bool, IndexError> {
        validate(address)?;
        let hash = KeyHash::new(key);
        match self.find_occupied_slot(hash) {
            Some(slot) => {
                // SAFETY: slot points into a live line; &mut self is exclusive.
                unsafe { slot.as_ptr().write(LineEntry::occupied(hash.tag(), address)) };
                Ok(true)
            }
            None => {
                self.insert_packed(hash, LineEntry::occupied(hash.tag(), address))?;
                Ok(false)
            }
        }
    }

    /// Get a read-only snapshot of the performance counters
    pub fn perf_counters(&self) -> PerfSnapshot {
        self.perf.snapshot()
    }

    /// Walk every chain and report occupancy.
    pub fn stats(&self) -> IndexStats {
        let n_buckets = self.buckets.len();
        let mut total_slots = 0u64;
        let mut used_slots = 0u64;
        let mut buckets_in_use = 0u64;

        for index in 0..n_buckets as usize {
            let mut line: *const CacheLine = self.buckets.line(index);
            let mut bucket_used = 0u64;
            loop {
                let mut next: Option<NonNull<CacheLine>> = None;
                for slot in 0..ENTRIES_PER_LINE {
                    // SAFETY: line is the bucket head or an overflow line
                    // owned by this index; &self keeps both alive.
                    match unsafe { (*line).entries[slot] }.view() {
                        EntryView::Unused => total_slots += 1,
                        EntryView::Occupied { .. } => {
                            total_slots += 1;
                            used_slots += 1;
                            bucket_used += 1;
                        }
                        EntryView::Chain(p) => next = Some(p),
                    }
                }
                match next {
                    Some(p) => line = p.as_ptr(),
                    None => break,
                }
            }
            if bucket_used > 0 {
                buckets_in_use += 1;
            }
        }

        IndexStats {
            n_buckets,
            total_slots,
            used_slots,
            buckets_in_use,
            overflow_lines: self.overflow_lines,
            load_factor: used_slots as f64 / total_slots as f64,
        }
    }

    /// Find the first occupied slot whose tag matches, in chain order.
    fn find_occupied_slot(&mut self, hash: KeyHash) -> Option<NonNull<LineEntry>> {
        let tag = hash.tag();
        let mut line: *mut CacheLine = self.buckets.line_mut(hash.bucket_index(self.buckets.len()));
        loop {
            let mut next: Option<NonNull<CacheLine>> = None;
            for slot in 0..ENTRIES_PER_LINE {
                // SAFETY: line is a live bucket head or overflow line owned
                // by this index; &mut self is exclusive.
                match unsafe { (*line).entries[slot] }.view() {
                    EntryView::Occupied { tag: t, .. } if t == tag => {
                        return NonNull::new(unsafe { std::ptr::addr_of_mut!((*line).entries[slot]) });
                    }
                    EntryView::Chain(p) => next = Some(p),
                    _ => {}
                }
            }
            match next {
                Some(p) => line = p.as_ptr(),
                None => return None,
            }
        }
    }

    /// Place a packed occupied entry in the first unused slot of the
    /// bucket's chain, growing the chain by one line when it is full.
    fn insert_packed(&mut self, hash: KeyHash, new_entry: LineEntry) -> Result<(), IndexError> {
        let mut line: *mut CacheLine = self.buckets.line_mut(hash.bucket_index(self.buckets.len()));
        let mut free_slot: Option<NonNull<LineEntry>> = None;
        loop {
            let mut next: Option<NonNull<CacheLine>> = None;
            for slot in 0..ENTRIES_PER_LINE {
                // SAFETY: as in find_occupied_slot.
                match unsafe { (*line).entries[slot] }.view() {
                    EntryView::Unused => {
                        if free_slot.is_none() {
                            free_slot =
                                NonNull::new(unsafe { std::ptr::addr_of_mut!((*line).entries[slot]) });
                        }
                    }
                    EntryView::Chain(p) => next = Some(p),
                    EntryView::Occupied { .. } => {}
                }
            }
            match next {
                Some(p) => {
                    self.perf.record_insert_chain_follow();
                    line = p.as_ptr();
                }
                None => break,
            }
        }

        if let Some(slot) = free_slot {
            // SAFETY: slot points into a live line; &mut self is exclusive.
            unsafe { slot.as_ptr().write(new_entry) };
            return Ok(());
        }

        // The whole chain is occupied: grow by one fresh line. The terminal
        // line's last entry moves to slot 0 of the new line and its old slot
        // becomes the chain link, so no entry is lost and the new line is
        // only ever linked once.
        let overflow = alloc_overflow_line()?;
        // SAFETY: `line` is the terminal line of this bucket's chain and
        // `overflow` is freshly allocated, zeroed, and unreachable until the
        // chain link below is written.
        unsafe {
            let displaced = (*line).entries[CacheLine::LAST_SLOT];
            let mut slot = 0;
            if !displaced.is_unused() {
                (*overflow.as_ptr()).entries[0] = displaced;
                slot = 1;
            }
            (*overflow.as_ptr()).entries[slot] = new_entry;
            (*line).entries[CacheLine::LAST_SLOT] = LineEntry::chain(overflow);
        }
        self.overflow_lines += 1;
        Ok(())
    }
}

impl Drop for ObjectIndex {
    fn drop(&mut self) {
        // Walk every chain and free the overflow lines; the bucket array
        // itself is freed by BucketArray's own Drop.
        for index in 0..self.buckets.len() as usize {
            let mut next = self.buckets.line(index).chain_link();
            while let Some(line) = next {
                // SAFETY: overflow lines are exclusively owned by this index
                // and each is reachable through exactly one chain link.
                next = unsafe { line.as_ref() }.chain_link();
                unsafe { free_overflow_line(line) };
            }
        }
    }
}

impl fmt::Debug for ObjectIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectIndex")
            .field("n_buckets", &self.buckets.len())
            .field("overflow_lines", &self.overflow_lines)
            .finish()
    }
}

// SAFETY: the index exclusively owns the bucket array and every overflow
// line. Shared references only read entry words and update relaxed atomic
// counters; all entry mutation requires &mut.
unsafe impl Send for ObjectIndex {}
unsafe impl Sync for ObjectIndex {}

/// Validate a caller-supplied address before packing it.
#[inline]
fn validate(address: LogAddress) -> Result<(), IndexError> {
    if address.is_null() {
        return Err(IndexError::NullPointer);
    }
    if address.control() > LogAddress::MAX_ADDRESS {
        return Err(IndexError::PointerOutOfRange(address.control()));
    }
    Ok(())
}

/// Iterator over every candidate entry for one key, in chain order.
///
/// Created by [`ObjectIndex::lookup_all`]. Each advance past an already
/// yielded candidate records one hash collision: the caller only continues
/// when key verification against the object record failed.
pub struct Candidates<'a> {
    perf: &'a PerfCounters,
    line: Option<&'a CacheLine>,
    slot: usize,
    tag: u16,
    yielded: bool,
}

impl<'a> Iterator for Candidates<'a> {
    type Item = LogAddress;

    fn next(&mut self) -> Option<LogAddress> {
        if self.yielded {
            self.yielded = false;
            self.perf.record_hash_collision();
        }
        while let Some(line) = self.line {
            if self.slot == ENTRIES_PER_LINE {
                self.line = None;
                break;
            }
            let entry = line.entries[self.slot];
            self.slot += 1;
            match entry.view() {
                EntryView::Occupied { tag, address } if tag == self.tag => {
                    self.yielded = true;
                    return Some(address);
                }
                EntryView::Chain(next) => {
                    self.perf.record_lookup_chain_follow();
                    // SAFETY: the chain line is owned by the index borrowed
                    // for 'a; no mutation can happen while we hold it.
                    self.line = Some(unsafe { &*next.as_ptr() });
                    self.slot = 0;
                }
                _ => {}
            }
        }
        None
    }
}

/// Occupancy report produced by [`ObjectIndex::stats`].
#[derive(Debug, Clone)]
pub struct IndexStats {
    /// Number of buckets in the primary array.
    pub n_buckets: u64,
    /// Slots able to hold an object (chain-link slots excluded).
    pub total_slots: u64,
    /// Occupied slots.
    pub used_slots: u64,
    /// Buckets with at least one occupied slot.
    pub buckets_in_use: u64,
    /// Overflow lines allocated beyond the bucket array.
    pub overflow_lines: u64,
    /// used_slots / total_slots.
    pub load_factor: f64,
}

impl fmt::Display for IndexStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Index Statistics:")?;
        writeln!(f, "  Buckets: {}", self.n_buckets)?;
        writeln!(f, "  Total slots: {}", self.total_slots)?;
        writeln!(f, "  Used slots: {}", self.used_slots)?;
        writeln!(f, "  Buckets in use: {}", self.buckets_in_use)?;
        writeln!(f, "  Overflow lines: {}", self.overflow_lines)?;
        writeln!(f, "  Load factor: {:.2}%", self.load_factor * 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(control: u64) -> LogAddress {
        LogAddress::new(control).unwrap()
    }

    /// Keys shaped so the bucket and the tag are independently chosen.
    fn key(bucket: u64, tag: u64) -> u64 {
        (tag << 48) | bucket
    }

    #[test]
    fn test_single_line_fill_has_no_overflow() {
        let mut index = ObjectIndex::new(&IndexConfig::new(1)).unwrap();
        for tag in 0..ENTRIES_PER_LINE as u64 {
            index.insert(key(0, tag), addr(0x100 + tag)).unwrap();
        }

        let stats = index.stats();
        assert_eq!(stats.overflow_lines, 0);
        assert_eq!(stats.used_slots, ENTRIES_PER_LINE as u64);
        assert_eq!(stats.total_slots, ENTRIES_PER_LINE as u64);
        assert_eq!(stats.buckets_in_use, 1);
    }

    #[test]
    fn test_growth_displaces_last_entry() {
        let mut index = ObjectIndex::new(&IndexConfig::new(1)).unwrap();
        for tag in 0..=ENTRIES_PER_LINE as u64 {
            index.insert(key(0, tag), addr(0x100 + tag)).unwrap();
        }

        // Nine entries, one overflow line, and every key still reachable,
        // including the displaced eighth.
        let stats = index.stats();
        assert_eq!(stats.overflow_lines, 1);
        assert_eq!(stats.used_slots, 1 + ENTRIES_PER_LINE as u64);
        for tag in 0..=ENTRIES_PER_LINE as u64 {
            assert_eq!(index.lookup(key(0, tag)), Some(addr(0x100 + tag)), "tag {tag}");
        }
    }

    #[test]
    fn test_deleted_slot_is_reused() {
        let mut index = ObjectIndex::new(&IndexConfig::new(1)).unwrap();
        for tag in 0..ENTRIES_PER_LINE as u64 {
            index.insert(key(0, tag), addr(0x100 + tag)).unwrap();
        }
        assert!(index.delete(key(0, 3)));

        // The freed slot absorbs the next insert instead of growing a chain.
        index.insert(key(0, 100), addr(0x999)).unwrap();
        assert_eq!(index.stats().overflow_lines, 0);
        assert_eq!(index.lookup(key(0, 100)), Some(addr(0x999)));
    }

    #[test]
    fn test_long_chain_drop() {
        // Several lines in one bucket; Drop walks and frees them all.
        let mut index = ObjectIndex::new(&IndexConfig::new(1)).unwrap();
        for tag in 0..64 {
            index.insert(key(0, tag), addr(0x1000 + tag)).unwrap();
        }
        assert!(index.stats().overflow_lines >= 8);
        drop(index);
    }

    #[test]
    fn test_replace_preserves_collisions() {
        let mut index = ObjectIndex::new(&IndexConfig::new(4)).unwrap();
        // Two keys with the same bucket and tag: a true collision.
        let first = key(2, 0xaa);
        let second = key(2, 0xaa) | (1 << 8);
        index.insert(first, addr(0x10)).unwrap();
        index.insert(second, addr(0x20)).unwrap();

        // Replace rewrites the first matching entry only.
        assert!(index.replace(first, addr(0x30)).unwrap());
        let candidates: Vec<_> = index.lookup_all(first).collect();
        assert_eq!(candidates, vec![addr(0x30), addr(0x20)]);
    }

    #[test]
    fn test_validation_order() {
        let mut index = ObjectIndex::new(&IndexConfig::new(4)).unwrap();
        assert_eq!(
            index.insert(1, LogAddress::NULL),
            Err(IndexError::NullPointer)
        );
        assert_eq!(
            index.replace(1, LogAddress::from_control(1 << 47)),
            Err(IndexError::PointerOutOfRange(1 << 47))
        );
        // Nothing was stored by the failed calls.
        assert_eq!(index.stats().used_slots, 0);
    }

    #[test]
    fn test_modulo_indexing() {
        let mut index = ObjectIndex::new(&IndexConfig::new(3)).unwrap();
        for k in 0..30u64 {
            index.insert(k, addr(k + 1)).unwrap();
        }
        for k in 0..30u64 {
            let found = index.lookup_all(k).any(|a| a == addr(k + 1));
            assert!(found, "key {k}");
        }
    }
}
