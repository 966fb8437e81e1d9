//! Performance counters for the index.
//!
//! Each index instance owns one counter block; there is no process-global
//! state. All fields are relaxed atomics: exact under the single writer the
//! index is designed for, best-effort under concurrent snapshot readers,
//! and monotonically nondecreasing either way.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Frequency distribution of per-lookup tick counts.
pub struct PerfDistribution {
    /// `bins[i]` counts samples in `[i * BIN_WIDTH, (i + 1) * BIN_WIDTH)`.
    bins: Box<[AtomicU64]>,
    /// Samples beyond the last bin.
    bin_overflows: AtomicU64,
    /// Smallest sample seen; all-ones until the first sample.
    min: AtomicU64,
    /// Largest sample seen; zero until the first sample.
    max: AtomicU64,
}

impl PerfDistribution {
    /// Number of bins
    pub const NBINS: usize = 5000;

    /// Width of each bin in ticks
    pub const BIN_WIDTH: u64 = 10;

    /// Create an empty distribution
    pub fn new() -> Self {
        Self {
            bins: (0..Self::NBINS).map(|_| AtomicU64::new(0)).collect(),
            bin_overflows: AtomicU64::new(0),
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
        }
    }

    /// Record one sample.
    #[inline]
    pub fn store_sample(&self, value: u64) {
        match self.bins.get((value / Self::BIN_WIDTH) as usize) {
            Some(bin) => bin.fetch_add(1, Ordering::Relaxed),
            None => self.bin_overflows.fetch_add(1, Ordering::Relaxed),
        };
        self.min.fetch_min(value, Ordering::Relaxed);
        self.max.fetch_max(value, Ordering::Relaxed);
    }

    /// Copy the current state into an owned snapshot.
    pub fn snapshot(&self) -> DistributionSnapshot {
        DistributionSnapshot {
            bins: self
                .bins
                .iter()
                .map(|bin| bin.load(Ordering::Relaxed))
                .collect(),
            bin_overflows: self.bin_overflows.load(Ordering::Relaxed),
            min: self.min.load(Ordering::Relaxed),
            max: self.max.load(Ordering::Relaxed),
        }
    }
}

impl Default for PerfDistribution {
    fn default() -> Self {
        Self::new()
    }
}

/// Owned copy of a [`PerfDistribution`].
#[derive(Debug, Clone)]
pub struct DistributionSnapshot {
    /// Per-bin sample counts.
    pub bins: Box<[u64]>,
    /// Samples beyond the last bin.
    pub bin_overflows: u64,
    /// Smallest sample, or `u64::MAX` if none were recorded.
    pub min: u64,
    /// Largest sample, or zero if none were recorded.
    pub max: u64,
}

impl DistributionSnapshot {
    /// Total number of samples recorded.
    pub fn total_samples(&self) -> u64 {
        self.bins.iter().sum::<u64>() + self.bin_overflows
    }
}

/// Counter block owned by each index instance.
pub struct PerfCounters {
    /// Ticks spent across all inserts.
    insert_cycles: AtomicU64,
    /// Ticks spent across all lookups.
    lookup_cycles: AtomicU64,
    /// Chain links followed across all inserts.
    insert_chains_followed: AtomicU64,
    /// Chain links followed across all lookups.
    lookup_chains_followed: AtomicU64,
    /// Lookup candidates the caller rejected after key verification.
    lookup_hash_collisions: AtomicU64,
    /// Per-lookup tick distribution.
    lookup_dist: PerfDistribution,
}

impl PerfCounters {
    /// Create a zeroed counter block
    pub fn new() -> Self {
        Self {
            insert_cycles: AtomicU64::new(0),
            lookup_cycles: AtomicU64::new(0),
            insert_chains_followed: AtomicU64::new(0),
            lookup_chains_followed: AtomicU64::new(0),
            lookup_hash_collisions: AtomicU64::new(0),
            lookup_dist: PerfDistribution::new(),
        }
    }

    /// Record a completed insert.
    #[inline]
    pub fn record_insert(&self, ticks: u64) {
        self.insert_cycles.fetch_add(ticks, Ordering::Relaxed);
    }

    /// Record a completed lookup, feeding the distribution.
    #[inline]
    pub fn record_lookup(&self, ticks: u64) {
        self.lookup_cycles.fetch_add(ticks, Ordering::Relaxed);
        self.lookup_dist.store_sample(ticks);
    }

    /// Record one chain link followed while inserting.
    #[inline]
    pub fn record_insert_chain_follow(&self) {
        self.insert_chains_followed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one chain link followed while looking up.
    #[inline]
    pub fn record_lookup_chain_follow(&self) {
        self.lookup_chains_followed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a candidate whose secondary hash matched but whose object
    /// turned out to hold a different key.
    #[inline]
    pub fn record_hash_collision(&self) {
        self.lookup_hash_collisions.fetch_add(1, Ordering::Relaxed);
    }

    /// Copy the current state into an owned snapshot.
    pub fn snapshot(&self) -> PerfSnapshot {
        PerfSnapshot {
            insert_cycles: self.insert_cycles.load(Ordering::Relaxed),
            lookup_cycles: self.lookup_cycles.load(Ordering::Relaxed),
            insert_chains_followed: self.insert_chains_followed.load(Ordering::Relaxed),
            lookup_chains_followed: self.lookup_chains_followed.load(Ordering::Relaxed),
            lookup_hash_collisions: self.lookup_hash_collisions.load(Ordering::Relaxed),
            lookup_dist: self.lookup_dist.snapshot(),
        }
    }
}

impl Default for PerfCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Owned copy of a [`PerfCounters`] block.
#[derive(Debug, Clone)]
pub struct PerfSnapshot {
    /// Ticks spent across all inserts.
    pub insert_cycles: u64,
    /// Ticks spent across all lookups.
    pub lookup_cycles: u64,
    /// Chain links followed across all inserts.
    pub insert_chains_followed: u64,
    /// Chain links followed across all lookups.
    pub lookup_chains_followed: u64,
    /// Lookup candidates rejected by caller-side key verification.
    pub lookup_hash_collisions: u64,
    /// Per-lookup tick distribution.
    pub lookup_dist: DistributionSnapshot,
}

impl fmt::Display for PerfSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Index Perf Counters:")?;
        writeln!(f, "  insert cycles: {}", self.insert_cycles)?;
        writeln!(f, "  lookup cycles: {}", self.lookup_cycles)?;
        writeln!(
            f,
            "  chains followed: insert={} lookup={}",
            self.insert_chains_followed, self.lookup_chains_followed
        )?;
        writeln!(f, "  hash collisions: {}", self.lookup_hash_collisions)?;
        writeln!(
            f,
            "  lookup distribution: samples={} min={} max={} overflows={}",
            self.lookup_dist.total_samples(),
            self.lookup_dist.min,
            self.lookup_dist.max,
            self.lookup_dist.bin_overflows
        )
    }
}
