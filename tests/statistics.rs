//! Performance counter behavior.
//!
//! The counters are advisory, but their shape is load-bearing: cycle sums
//! and chain-follow counts only ever grow, collisions are attributed to
//! caller-driven continuation, and every timed lookup feeds the histogram.

use oxitable::{IndexConfig, LogAddress, ObjectIndex};

fn addr(control: u64) -> LogAddress {
    LogAddress::new(control).unwrap()
}

/// Build an index whose single bucket chains across several lines.
fn chained_index(entries: u64) -> ObjectIndex {
    let mut index = ObjectIndex::new(&IndexConfig::new(1)).unwrap();
    for tag in 0..entries {
        index.insert(tag << 48, addr(0x1000 + tag)).unwrap();
    }
    index
}

#[test]
fn test_cycle_sums_are_monotone() {
    let mut index = ObjectIndex::new(&IndexConfig::new(64)).unwrap();

    let mut last_insert = 0;
    let mut last_lookup = 0;
    for k in 1..=100u64 {
        index.insert(k, addr(k)).unwrap();
        index.lookup(k);

        let perf = index.perf_counters();
        assert!(perf.insert_cycles >= last_insert);
        assert!(perf.lookup_cycles >= last_lookup);
        last_insert = perf.insert_cycles;
        last_lookup = perf.lookup_cycles;
    }
    assert!(last_insert > 0);
    assert!(last_lookup > 0);
}

#[test]
fn test_insert_chain_follows_count_growth_walks() {
    let index = chained_index(9);
    // Inserts 1..=8 stay in the head line; the ninth walks zero links (the
    // head is terminal until it grows) but every later insert would follow
    // the new link.
    let after_nine = index.perf_counters().insert_chains_followed;
    assert_eq!(after_nine, 0);

    let mut index = chained_index(10);
    // The tenth insert walks the chain link created by the ninth.
    assert_eq!(index.perf_counters().insert_chains_followed, 1);
    index.insert(99 << 48, addr(0x9999)).unwrap();
    assert_eq!(index.perf_counters().insert_chains_followed, 2);
}

#[test]
fn test_lookup_chain_follows() {
    let index = chained_index(9);

    let before = index.perf_counters().lookup_chains_followed;
    index.lookup(0); // tag 0 sits in the head line
    assert_eq!(index.perf_counters().lookup_chains_followed, before);

    index.lookup(8 << 48); // tag 8 sits in the overflow line
    assert_eq!(index.perf_counters().lookup_chains_followed, before + 1);
}

#[test]
fn test_collisions_counted_on_continuation() {
    let mut index = ObjectIndex::new(&IndexConfig::new(4)).unwrap();
    let key_a = (7u64 << 48) | 0x1;
    let key_b = (7u64 << 48) | 0x11; // same bucket, same tag
    index.insert(key_a, addr(0xa)).unwrap();
    index.insert(key_b, addr(0xb)).unwrap();

    // Taking only the first candidate is not a collision.
    let _ = index.lookup_all(key_a).next();
    assert_eq!(index.perf_counters().lookup_hash_collisions, 0);

    // Walking past the first candidate means its key failed verification.
    let candidates: Vec<_> = index.lookup_all(key_a).collect();
    assert_eq!(candidates.len(), 2);
    // One rejection to reach the second candidate, one more when the
    // exhausted iterator reports the second candidate matched nothing.
    assert_eq!(index.perf_counters().lookup_hash_collisions, 2);
}

#[test]
fn test_histogram_tracks_every_timed_lookup() {
    let mut index = ObjectIndex::new(&IndexConfig::new(64)).unwrap();
    for k in 1..=50u64 {
        index.insert(k, addr(k)).unwrap();
    }

    for k in 1..=25u64 {
        index.lookup(k);
    }
    let mid = index.perf_counters().lookup_dist;
    assert_eq!(mid.total_samples(), 25);

    for k in 26..=50u64 {
        index.lookup(k);
    }
    let end = index.perf_counters().lookup_dist;
    assert_eq!(end.total_samples(), 50);

    // Samples only accumulate: every bin is at least its earlier value.
    for (bin, (earlier, later)) in mid.bins.iter().zip(end.bins.iter()).enumerate() {
        assert!(later >= earlier, "bin {bin} shrank");
    }
    assert!(end.bin_overflows >= mid.bin_overflows);
    assert!(end.min <= mid.min);
    assert!(end.max >= mid.max);
    assert!(end.min <= end.max);
}

#[test]
fn test_untouched_index_has_virgin_counters() {
    let index = ObjectIndex::new(&IndexConfig::new(8)).unwrap();
    let perf = index.perf_counters();

    assert_eq!(perf.insert_cycles, 0);
    assert_eq!(perf.lookup_cycles, 0);
    assert_eq!(perf.insert_chains_followed, 0);
    assert_eq!(perf.lookup_chains_followed, 0);
    assert_eq!(perf.lookup_hash_collisions, 0);
    assert_eq!(perf.lookup_dist.total_samples(), 0);
    assert_eq!(perf.lookup_dist.min, u64::MAX);
    assert_eq!(perf.lookup_dist.max, 0);
}

#[test]
fn test_reads_do_not_allocate_lines() {
    let mut index = chained_index(20);
    let lines_before = index.stats().overflow_lines;

    for tag in 0..20u64 {
        index.lookup(tag << 48);
        let _ = index.lookup_all(tag << 48).count();
    }
    assert!(index.delete(5 << 48));
    assert!(index.replace(6 << 48, addr(0xf00d)).unwrap());

    assert_eq!(index.stats().overflow_lines, lines_before);
}
