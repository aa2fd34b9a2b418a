use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use parking_lot::Mutex;

use super::snapshot::{availability, Snapshot};
use crate::config::bucket_shift;
use crate::error::ConfigError;

// ─── Percentile ranks ────────────────────────────────────────────

/// (numerator, denominator) of tp30, tp50, tp90, tp99, tp999
const RANKS: [(u64, u64); 5] = [(3, 10), (1, 2), (9, 10), (99, 100), (999, 1000)];

/// Reduces latency resolution as latency grows, so the bucket count
/// stays bounded however long the tail is.
///
/// | range        | step |
/// |--------------|------|
/// | `[0, 64)`    | 1    |
/// | `[64, 128)`  | 2    |
/// | `[128, 256)` | 4    |
/// | `[256, 768)` | 8    |
/// | `[768, ∞)`   | 16   |
pub fn align(latency_ms: u64) -> u64 {
    match latency_ms {
        0..=63 => latency_ms,
        64..=127 => latency_ms & !1,
        128..=255 => latency_ms & !3,
        256..=767 => latency_ms & !7,
        _ => latency_ms & !15,
    }
}

// ─── Histogram ───────────────────────────────────────────────────

/// Write-optimized latency accumulator for one window period.
///
/// Aligned latencies below `L²` land in an `L×L` matrix of counters whose
/// rows are allocated on first use; anything larger goes to a sparse,
/// ordered overflow map. Every counter is independent: writers never
/// coordinate, and a snapshot taken while writers are still active is
/// approximate. [`Window`](super::Window) only snapshots histograms it has
/// already detached from new writes.
pub struct Histogram {
    shift: u32,
    rows: Box<[OnceLock<Box<[AtomicU64]>>]>,
    overflow: Mutex<BTreeMap<u64, u64>>,

    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    records: AtomicU64,
    data_size: AtomicU64,
    elapsed_sum: AtomicU64,
    /// Successes that carried a latency (landed in a bucket)
    samples: AtomicU64,
}

impl Histogram {
    /// `bucket_len` is rounded up to the next power of two.
    pub fn new(bucket_len: usize) -> Result<Self, ConfigError> {
        Ok(Self::with_shift(bucket_shift(bucket_len)?))
    }

    pub(crate) fn with_shift(shift: u32) -> Self {
        let side = 1usize << shift;
        Self {
            shift,
            rows: (0..side).map(|_| OnceLock::new()).collect(),
            overflow: Mutex::new(BTreeMap::new()),
            requests: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            records: AtomicU64::new(0),
            data_size: AtomicU64::new(0),
            elapsed_sum: AtomicU64::new(0),
            samples: AtomicU64::new(0),
        }
    }

    /// Largest aligned latency the matrix can address (`L² - 1`).
    pub fn max_addressable(&self) -> u64 {
        (1u64 << (2 * self.shift)) - 1
    }

    /// Record a successful call. Negative latencies are dropped.
    pub fn success(&self, latency_ms: i64, records: i64, bytes: i64) {
        if latency_ms < 0 {
            return;
        }
        let latency = align(latency_ms as u64);

        self.count_success(records, bytes);
        self.elapsed_sum.fetch_add(latency, Ordering::Relaxed);
        self.samples.fetch_add(1, Ordering::Relaxed);

        if latency > self.max_addressable() {
            *self.overflow.lock().entry(latency).or_insert(0) += 1;
            return;
        }

        let side = 1usize << self.shift;
        let row = (latency >> self.shift) as usize;
        let col = (latency & (side as u64 - 1)) as usize;
        self.rows[row]
            .get_or_init(|| (0..side).map(|_| AtomicU64::new(0)).collect())[col]
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful call with no usable timing: it shows up in the
    /// totals but never in a latency bucket.
    pub fn untimed_success(&self, records: i64, bytes: i64) {
        self.count_success(records, bytes);
    }

    pub fn failure(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    fn count_success(&self, records: i64, bytes: i64) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        self.successes.fetch_add(1, Ordering::Relaxed);
        if records > 0 {
            self.records.fetch_add(records as u64, Ordering::Relaxed);
        }
        if bytes > 0 {
            self.data_size.fetch_add(bytes as u64, Ordering::Relaxed);
        }
    }

    pub fn requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Single ascending pass over the matrix, then the overflow map.
    pub fn snapshot(&self) -> Snapshot {
        let requests = self.requests();
        if requests == 0 {
            return Snapshot::empty();
        }
        let successes = self.successes();
        let failures = self.failures();

        let mut snapshot = Snapshot {
            requests,
            successes,
            failures,
            availability: availability(successes, failures),
            records: self.records.load(Ordering::Relaxed),
            data_size: self.data_size.load(Ordering::Relaxed),
            elapsed_time: self.elapsed_sum.load(Ordering::Relaxed),
            ..Snapshot::empty()
        };

        let samples = self.samples.load(Ordering::Relaxed);
        if samples == 0 {
            return snapshot;
        }

        let mut scan = Scan::new(samples);
        let mut done = false;
        'rows: for (i, row) in self.rows.iter().enumerate() {
            let Some(row) = row.get() else { continue };
            for (j, slot) in row.iter().enumerate() {
                let count = slot.load(Ordering::Relaxed);
                if count == 0 {
                    continue;
                }
                let latency = ((i as u64) << self.shift) | j as u64;
                if scan.push(latency, count) {
                    done = true;
                    break 'rows;
                }
            }
        }
        if !done {
            for (&latency, &count) in self.overflow.lock().iter() {
                if scan.push(latency, count) {
                    break;
                }
            }
        }

        scan.fill(&mut snapshot, samples);
        snapshot
    }
}

impl fmt::Debug for Histogram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Histogram")
            .field("bucket_len", &(1usize << self.shift))
            .field("requests", &self.requests())
            .field("successes", &self.successes())
            .field("failures", &self.failures())
            .finish()
    }
}

// ─── Scan state ──────────────────────────────────────────────────

/// Running cumulative count over buckets visited in ascending order.
struct Scan {
    total: u64,
    cumulative: u64,
    ranks: [u64; 5],
    hits: [Option<u64>; 5],
    min: Option<u64>,
    max: u64,
}

impl Scan {
    fn new(total: u64) -> Self {
        let ranks = RANKS.map(|(num, den)| (total as u128 * num as u128 / den as u128) as u64);
        Self {
            total,
            cumulative: 0,
            ranks,
            hits: [None; 5],
            min: None,
            max: 0,
        }
    }

    /// Returns true once every sample has been accounted for.
    fn push(&mut self, latency: u64, count: u64) -> bool {
        self.min.get_or_insert(latency);
        self.max = latency;
        self.cumulative += count;
        for (rank, hit) in self.ranks.iter().zip(self.hits.iter_mut()) {
            if hit.is_none() && self.cumulative >= *rank {
                *hit = Some(latency);
            }
        }
        self.cumulative >= self.total
    }

    fn fill(self, snapshot: &mut Snapshot, samples: u64) {
        // Ranks left unreached (counters raced ahead of buckets) fall on max.
        let [tp30, tp50, tp90, tp99, tp999] = self.hits.map(|hit| hit.unwrap_or(self.max));
        snapshot.min = self.min.unwrap_or(0);
        snapshot.max = self.max;
        snapshot.avg = snapshot.elapsed_time.div_ceil(samples);
        snapshot.tp30 = tp30;
        snapshot.tp50 = tp50;
        snapshot.tp90 = tp90;
        snapshot.tp99 = tp99;
        snapshot.tp999 = tp999;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn histogram() -> Histogram {
        Histogram::new(256).unwrap()
    }

    // ── align ───────────────────────────────────────────────────

    #[test]
    fn align_is_idempotent() {
        for v in 0..70_000u64 {
            assert_eq!(align(align(v)), align(v), "v = {v}");
        }
    }

    #[test]
    fn align_error_stays_within_step() {
        let ranges: [(u64, u64, u64); 5] = [
            (0, 64, 0),
            (64, 128, 1),
            (128, 256, 3),
            (256, 768, 7),
            (768, 20_000, 15),
        ];
        for (lo, hi, bound) in ranges {
            for v in lo..hi {
                let a = align(v);
                assert!(a <= v && v - a <= bound, "v = {v}, aligned = {a}");
            }
        }
    }

    #[test]
    fn align_keeps_range_boundaries() {
        assert_eq!(align(63), 63);
        assert_eq!(align(65), 64);
        assert_eq!(align(131), 128);
        assert_eq!(align(263), 256);
        assert_eq!(align(775), 768);
        assert_eq!(align(1000), 992);
    }

    // ── success / failure ───────────────────────────────────────

    #[test]
    fn constant_latency_collapses_all_statistics() {
        for c in [0i64, 1, 17, 63] {
            let h = histogram();
            for _ in 0..25 {
                h.success(c, 0, 0);
            }
            let s = h.snapshot();
            let c = c as u64;
            assert_eq!((s.min, s.max, s.avg), (c, c, c));
            assert_eq!((s.tp30, s.tp50, s.tp90, s.tp99, s.tp999), (c, c, c, c, c));
            assert_eq!(s.requests, 25);
            assert_eq!(s.successes, 25);
            assert_eq!(s.failures, 0);
            assert_eq!(s.availability, 100.0);
        }
    }

    #[test]
    fn negative_latency_is_dropped() {
        let h = histogram();
        h.success(-5, 3, 100);
        assert_eq!(h.requests(), 0);
        assert_eq!(h.snapshot(), Snapshot::empty());
    }

    #[test]
    fn failures_never_touch_buckets() {
        let h = histogram();
        h.failure();
        h.failure();
        let s = h.snapshot();
        assert_eq!(s.requests, 2);
        assert_eq!(s.failures, 2);
        assert_eq!(s.availability, 0.0);
        assert_eq!((s.min, s.max, s.avg, s.tp50, s.tp999), (0, 0, 0, 0, 0));
    }

    #[test]
    fn empty_histogram_is_all_zero() {
        assert_eq!(histogram().snapshot(), Snapshot::empty());
    }

    #[test]
    fn records_and_bytes_only_count_when_positive() {
        let h = histogram();
        h.success(10, 4, 1024);
        h.success(10, 0, -1);
        h.success(10, 2, 0);
        let s = h.snapshot();
        assert_eq!(s.records, 6);
        assert_eq!(s.data_size, 1024);
    }

    #[test]
    fn elapsed_time_sums_aligned_latencies() {
        let h = histogram();
        h.success(65, 0, 0);
        h.success(1000, 0, 0);
        let s = h.snapshot();
        assert_eq!(s.elapsed_time, 64 + 992);
        assert_eq!(s.avg, (64 + 992 + 1) / 2);
    }

    #[test]
    fn avg_rounds_up() {
        let h = histogram();
        h.success(1, 0, 0);
        h.success(2, 0, 0);
        assert_eq!(h.snapshot().avg, 2);
    }

    // ── overflow ────────────────────────────────────────────────

    #[test]
    fn latencies_past_matrix_go_to_overflow() {
        let h = histogram();
        assert_eq!(h.max_addressable(), 65_535);
        h.success(100, 0, 0);
        h.success(70_000, 0, 0);
        h.success(90_007, 0, 0);
        let s = h.snapshot();
        assert_eq!(s.min, 100);
        assert_eq!(s.max, 90_000);
        // ranks of 3 samples: tp50 = 1, tp90 = 2
        assert_eq!(s.tp50, 100);
        assert_eq!(s.tp90, 70_000);
        assert_eq!(s.successes, 3);
    }

    #[test]
    fn small_matrix_continues_cumulative_into_overflow() {
        // 4x4 matrix addresses 0..=15
        let h = Histogram::new(3).unwrap();
        assert_eq!(h.max_addressable(), 15);
        for latency in 10..30 {
            h.success(latency, 0, 0);
        }
        let s = h.snapshot();
        assert_eq!(s.min, 10);
        assert_eq!(s.max, 29);
        // rank 10 of 20 samples 10..29
        assert_eq!(s.tp50, 19);
    }

    #[test]
    fn zero_bucket_len_is_a_configuration_error() {
        assert_eq!(
            Histogram::new(0).unwrap_err(),
            ConfigError::ZeroBucketLength
        );
    }

    // ── percentiles ─────────────────────────────────────────────

    #[test]
    fn uniform_median_within_alignment_error() {
        let h = histogram();
        for latency in 0..1000 {
            h.success(latency, 0, 0);
        }
        let s = h.snapshot();
        // true median of 0..999 is 499.5; step at 499 is 8
        assert!(s.tp50.abs_diff(499) <= 8, "tp50 = {}", s.tp50);
        assert_eq!(s.min, 0);
        assert_eq!(s.max, 992);
    }

    #[test]
    fn percentiles_are_monotonic() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..20 {
            let h = histogram();
            let n = rng.gen_range(1..2000);
            for _ in 0..n {
                let latency = if rng.gen_bool(0.05) {
                    rng.gen_range(0..200_000)
                } else {
                    rng.gen_range(0..300)
                };
                h.success(latency, 0, 0);
            }
            let s = h.snapshot();
            assert!(s.min <= s.tp30);
            assert!(s.tp30 <= s.tp50);
            assert!(s.tp50 <= s.tp90);
            assert!(s.tp90 <= s.tp99);
            assert!(s.tp99 <= s.tp999);
            assert!(s.tp999 <= s.max);
        }
    }

    #[test]
    fn percentiles_track_hdr_reference() {
        let mut rng = StdRng::seed_from_u64(42);
        let h = histogram();
        let mut reference = hdrhistogram::Histogram::<u64>::new_with_bounds(1, 100_000, 3)
            .expect("reference histogram");
        for _ in 0..10_000 {
            let latency: u64 = rng.gen_range(0..5_000);
            h.success(latency as i64, 0, 0);
            reference.record(latency).unwrap();
        }
        let s = h.snapshot();
        for (ours, q) in [(s.tp50, 0.5), (s.tp90, 0.9), (s.tp99, 0.99)] {
            let exact = reference.value_at_quantile(q);
            // step 16 plus hdr's own 0.1% precision
            assert!(ours.abs_diff(exact) <= 24, "q = {q}: {ours} vs {exact}");
        }
    }

    #[test]
    fn untimed_successes_count_without_latency() {
        let h = histogram();
        h.success(40, 0, 0);
        h.untimed_success(1, 10);
        let s = h.snapshot();
        assert_eq!(s.requests, 2);
        assert_eq!(s.successes, 2);
        assert_eq!((s.min, s.max, s.avg, s.tp50), (40, 40, 40, 40));
        assert_eq!(s.records, 1);
    }

    #[test]
    fn concurrent_writers_lose_no_counts() {
        let h = histogram();
        std::thread::scope(|scope| {
            for t in 0..8 {
                let h = &h;
                scope.spawn(move || {
                    for i in 0..1000 {
                        if i % 10 == 0 {
                            h.failure();
                        } else {
                            h.success((t * 100 + i % 100) as i64, 1, 8);
                        }
                    }
                });
            }
        });
        let s = h.snapshot();
        assert_eq!(s.requests, 8000);
        assert_eq!(s.successes, 7200);
        assert_eq!(s.failures, 800);
        assert_eq!(s.records, 7200);
        assert_eq!(s.data_size, 7200 * 8);
    }
}
