// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Latency accounting.
//!
//! Every worker owns a private [`Bucket`] and logs each operation into it
//! without taking any lock. On a 10 ms cadence the bucket tries to push its
//! window into the process-wide [`Histogram`] with a try-lock; contention
//! just delays the merge to the next sample. A summary line is printed once
//! per second, and only after every active worker has contributed to the
//! window, so each line covers every live worker exactly once.

use std::sync::atomic::{AtomicU32, Ordering::SeqCst};
use std::sync::{Arc, Mutex};

use auto_ops::impl_op_ex;
use serde::Serialize;

use crate::clock::{self, lat, si, S};
use crate::config::BenchKind;

/// Merge attempt cadence for worker buckets.
const MERGE_INTERVAL: u64 = S / 100;

/// Minimum wall time between two summary lines.
const STAT_INTERVAL: u64 = S;

pub const SLOT_COUNT: usize = 167;

const SLOT_STEPS: [u64; 16] = [12, 14, 16, 18, 20, 25, 30, 35, 40, 45, 50, 60, 70, 80, 90, 100];

/// Upper bounds of the latency slots in nanoseconds. Strictly increasing,
/// the `u64::MAX` sentinel closes the last interval.
pub const SLOT_BOUNDS: [u64; SLOT_COUNT] = slot_bounds();

const fn slot_bounds() -> [u64; SLOT_COUNT] {
    const US: u64 = crate::clock::US;
    const MS: u64 = crate::clock::MS;

    let scales: [u64; 10] = [1, 10, 100, US, US * 10, US * 100, MS, MS * 10, MS * 100, S];

    let mut bounds = [0u64; SLOT_COUNT];
    bounds[0] = 9;

    let mut i = 1;
    let mut scale = 0;
    while scale < scales.len() {
        let mut step = 0;
        while step < SLOT_STEPS.len() {
            bounds[i] = scales[scale] * SLOT_STEPS[step];
            i += 1;
            step += 1;
        }
        scale += 1;
    }

    bounds[i] = S * 5 * 60;
    bounds[i + 1] = S * 30 * 60;
    bounds[i + 2] = S * 3600 * 4;
    bounds[i + 3] = S * 3600 * 8;
    bounds[i + 4] = S * 3600 * 24;
    bounds[i + 5] = u64::MAX;
    bounds
}

/// Cumulative counters, all monotonically non-decreasing. The squared sum
/// is widened so the root-mean-square cannot wrap on long latencies.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub n: u64,
    pub volume_sum: u64,
    pub latency_sum_ns: u64,
    pub latency_sum_sq: u128,
}

impl_op_ex!(+= |a: &mut Stats, b: &Stats| {
    a.n += b.n;
    a.volume_sum += b.volume_sum;
    a.latency_sum_ns += b.latency_sum_ns;
    a.latency_sum_sq += b.latency_sum_sq;
});

impl_op_ex!(-|a: &Stats, b: &Stats| -> Stats {
    Stats {
        n: a.n - b.n,
        volume_sum: a.volume_sum - b.volume_sum,
        latency_sum_ns: a.latency_sum_ns - b.latency_sum_ns,
        latency_sum_sq: a.latency_sum_sq - b.latency_sum_sq,
    }
});

/// Per-bench measurement state, used both inside worker buckets and for
/// the registry's master entries.
#[derive(Debug, Clone)]
struct Tally {
    enabled: bool,
    bench: BenchKind,

    min: u64,
    max: u64,
    whole_min: u64,
    whole_max: u64,

    checkpoint_ns: u64,
    begin_ns: u64,
    end_ns: u64,

    last: Stats,
    acc: Stats,
    slots: Box<[u64; SLOT_COUNT]>,
}

impl Tally {
    fn new(bench: BenchKind) -> Tally {
        Tally {
            enabled: false,
            bench,
            min: u64::MAX,
            max: 0,
            whole_min: u64::MAX,
            whole_max: 0,
            checkpoint_ns: 0,
            begin_ns: 0,
            end_ns: 0,
            last: Stats::default(),
            acc: Stats::default(),
            slots: Box::new([0; SLOT_COUNT]),
        }
    }

    /// Enables the tally for `bench` and clears the per-window accounting.
    /// The cumulative `acc`/`last` pair survives resets.
    fn reset(&mut self, bench: BenchKind) {
        self.enabled = true;
        self.bench = bench;

        self.min = u64::MAX;
        self.max = 0;
        self.whole_min = u64::MAX;
        self.whole_max = 0;
        self.slots.fill(0);

        let now = clock::now();
        self.checkpoint_ns = now;
        self.begin_ns = now;
        self.end_ns = now;
    }

    /// Window bookkeeping after a successful merge into the registry.
    fn rearm(&mut self, now: u64) {
        self.checkpoint_ns = now;
        self.min = u64::MAX;
        self.max = 0;
        self.last = self.acc;
        self.slots.fill(0);
    }
}

/// Per-worker latency accumulator. Holds a non-owning handle to its
/// registry; the registry must outlive every worker bucket.
pub struct Bucket {
    registry: Arc<Histogram>,
    is_worker: bool,
    merge_evo: u32,
    tally: Tally,
}

impl Bucket {
    pub fn new(registry: Arc<Histogram>, is_worker: bool) -> Bucket {
        let merge_evo = registry.merge_evo.load(SeqCst);
        if is_worker {
            registry.workers_active.fetch_add(1, SeqCst);
        }
        Bucket {
            registry,
            is_worker,
            merge_evo,
            tally: Tally::new(BenchKind::Set),
        }
    }

    /// Binds the bucket to `bench` for the next measurement window.
    pub fn reset(&mut self, bench: BenchKind) {
        self.tally.reset(bench);
    }

    /// Records one operation that started at `t0` and moved `volume` bytes,
    /// then opportunistically merges into the registry on the 10 ms cadence.
    pub fn add(&mut self, t0: u64, volume: usize) {
        let now = clock::now();
        let latency = now.saturating_sub(t0);

        let t = &mut self.tally;
        if t.begin_ns == 0 {
            t.begin_ns = t0;
        }
        t.end_ns = now;

        t.acc.n += 1;
        t.acc.volume_sum += volume as u64;
        t.acc.latency_sum_ns += latency;
        t.acc.latency_sum_sq += latency as u128 * latency as u128;

        t.min = t.min.min(latency);
        t.max = t.max.max(latency);

        // first slot whose upper bound holds the latency
        let slot = SLOT_BOUNDS.partition_point(|&b| b < latency);
        t.slots[slot] += 1;

        if self.merge_evo != self.registry.merge_evo.load(SeqCst)
            || now - t.checkpoint_ns < MERGE_INTERVAL
        {
            return;
        }

        // Contention skips the merge, the 10 ms cadence retries it.
        let registry = &self.registry;
        if let Ok(mut reg) = registry.mu.try_lock() {
            registry.merge_locked(&mut reg, &self.tally, &mut self.merge_evo, now);
            drop(reg);
            self.tally.rearm(now);
        }
    }
}

impl Drop for Bucket {
    fn drop(&mut self) {
        if self.is_worker {
            if self.merge_evo == self.registry.merge_evo.load(SeqCst) + 1 {
                self.registry.workers_merged.fetch_sub(1, SeqCst);
            }
            self.registry.workers_active.fetch_sub(1, SeqCst);
        }
    }
}

struct Registry {
    starting_point: u64,
    checkpoint_ns: u64,
    masters: [Tally; BenchKind::VARIANT_COUNT],
}

/// Per-bench cumulative figures for the JSON report.
#[derive(Debug, Clone, Serialize)]
pub struct BenchReport {
    pub bench: String,
    pub n: u64,
    pub volume_sum: u64,
    pub min_ns: u64,
    pub avg_ns: u64,
    pub rms_ns: u64,
    pub max_ns: u64,
    pub ops_per_sec: f64,
}

/// Process-wide registry of master buckets. Owns the per-bench masters;
/// worker buckets reference it through an `Arc`.
pub struct Histogram {
    mu: Mutex<Registry>,
    merge_evo: AtomicU32,
    workers_active: AtomicU32,
    workers_merged: AtomicU32,
}

impl Histogram {
    pub fn new<'a>(benchmarks: impl IntoIterator<Item = &'a BenchKind>) -> Arc<Histogram> {
        let now = clock::now();

        let mut masters = BenchKind::ALL.map(Tally::new);
        for bench in benchmarks {
            masters[*bench as usize].reset(*bench);
        }

        Arc::new(Histogram {
            mu: Mutex::new(Registry {
                starting_point: now,
                checkpoint_ns: now,
                masters,
            }),
            merge_evo: AtomicU32::new(0),
            workers_active: AtomicU32::new(0),
            workers_merged: AtomicU32::new(0),
        })
    }

    /// Unconditional merge of a worker bucket, used at bench boundaries.
    pub fn merge(&self, bucket: &mut Bucket) {
        self.merge_at(bucket, clock::now());
    }

    pub(crate) fn merge_at(&self, bucket: &mut Bucket, now: u64) {
        let mut reg = self.mu.lock().unwrap();
        self.merge_locked(&mut reg, &bucket.tally, &mut bucket.merge_evo, now);
        drop(reg);
        bucket.tally.rearm(now);
    }

    fn merge_locked(&self, reg: &mut Registry, src: &Tally, src_evo: &mut u32, now: u64) {
        let dst = &mut reg.masters[src.bench as usize];
        if !dst.enabled || src.acc.n == src.last.n {
            return;
        }

        dst.acc += src.acc - src.last;
        for (d, s) in dst.slots.iter_mut().zip(src.slots.iter()) {
            *d += *s;
        }

        if dst.begin_ns == 0 || dst.begin_ns > src.begin_ns {
            dst.begin_ns = src.begin_ns;
        }
        dst.end_ns = dst.end_ns.max(src.end_ns);
        dst.min = dst.min.min(src.min);
        dst.max = dst.max.max(src.max);

        if *src_evo == self.merge_evo.load(SeqCst) && self.summarize_locked(reg, now) >= 0 {
            *src_evo += 1;
        }
    }

    /// Emits the periodic summary line when the window is old enough and
    /// every active worker has merged since the last one. Returns -1 when
    /// called too early, 0 while peers are still pending, 1 on emit.
    pub fn summarize_at(&self, now: u64) -> i32 {
        let mut reg = self.mu.lock().unwrap();
        self.summarize_locked(&mut reg, now)
    }

    pub fn summarize(&self) -> i32 {
        self.summarize_at(clock::now())
    }

    fn summarize_locked(&self, reg: &mut Registry, now: u64) -> i32 {
        if now - reg.checkpoint_ns < STAT_INTERVAL {
            return -1;
        }

        let merged = self.workers_merged.fetch_add(1, SeqCst) + 1;
        if self.workers_active.load(SeqCst) > merged {
            return 0;
        }

        if reg.checkpoint_ns == reg.starting_point {
            let mut header = String::from("     time");
            for h in reg.masters.iter() {
                if h.enabled {
                    header += &format!(
                        " | {:5} {:>10} {:>10} {:>10} {:>10} {:>10} {:>12} {:>10}",
                        "bench", "rps", "min", "avg", "rms", "max", "vol", "#N"
                    );
                }
            }
            println!("{header}");
        }

        let timepoint = (now - reg.starting_point) as f64 / S as f64;
        let mut line = format!("{timepoint:9.3}");

        let wall = (now - reg.checkpoint_ns) as f64 / S as f64;
        reg.checkpoint_ns = now;

        for h in reg.masters.iter_mut() {
            if !h.enabled {
                continue;
            }

            let n = h.acc.n - h.last.n;
            let vol = h.acc.volume_sum - h.last.volume_sum;

            line += &format!(" | {:>5}:", h.bench);
            if n != 0 {
                let rms = ((h.acc.latency_sum_sq - h.last.latency_sum_sq) as f64 / n as f64)
                    .sqrt() as u64;
                let avg = (h.acc.latency_sum_ns - h.last.latency_sum_ns) / n;
                let rps = n as f64 / wall;
                let bps = vol as f64 / wall;

                line += &format!(
                    "{:>10} {:>10} {:>10} {:>10} {:>10} {:>12} {:>10}",
                    si(rps, ""),
                    lat(h.min),
                    lat(avg),
                    lat(rms),
                    lat(h.max),
                    si(bps, "bps"),
                    si(h.acc.n as f64, "")
                );
            } else {
                line += &format!(
                    "{:>10} {:>10} {:>10} {:>10} {:>10} {:>12} {:>10}",
                    "-", "-", "-", "-", "-", "-", "-"
                );
            }

            h.whole_min = h.whole_min.min(h.min);
            h.min = u64::MAX;
            h.whole_max = h.whole_max.max(h.max);
            h.max = 0;
            h.last = h.acc;
        }

        println!("{line}");

        self.workers_merged.store(0, SeqCst);
        self.merge_evo.fetch_add(1, SeqCst);
        1
    }

    /// Prints the final per-bench latency table and cumulative figures.
    pub fn print(&self) {
        let reg = self.mu.lock().unwrap();

        for h in reg.masters.iter() {
            if !h.enabled || h.acc.n == 0 {
                continue;
            }

            println!(
                "\n>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>>> {}({})",
                h.bench, h.acc.n
            );
            println!(
                "[ {:>9}  {:>9} ] {:>13} {:>8} {:>10}",
                "ltn_from", "ltn_to", "ops_count", "%", "p%"
            );
            println!("----------------------------------------------------------");

            let factor = 1e2 / h.acc.n as f64;
            let mut total_count = 0u64;
            for (i, &count) in h.slots.iter().enumerate() {
                if count == 0 {
                    continue;
                }
                total_count += count;

                let from = lat(if i > 0 { SLOT_BOUNDS[i - 1] } else { 0 });
                let to = lat(SLOT_BOUNDS[i] - 1);
                let percent = factor * count as f64;
                let percentile = factor * total_count as f64;

                println!(
                    "[ {:>9}, {:>9} ] {:13} {:7.2}% {:9.4}%",
                    from, to, count, percent, percentile
                );
            }
            println!("----------------------------------------------------------");

            println!(
                "total:       {:>9}  {:13}",
                lat(h.acc.latency_sum_ns),
                total_count
            );
            // a run shorter than one summary window has not rolled the
            // whole-run extremes yet, the current window still holds them
            println!("min latency: {:>9}/op", lat(h.whole_min.min(h.min)));
            println!("avg latency: {:>9}/op", lat(h.acc.latency_sum_ns / h.acc.n));
            println!(
                "rms latency: {:>9}/op",
                lat((h.acc.latency_sum_sq as f64 / h.acc.n as f64).sqrt() as u64)
            );
            println!("max latency: {:>9}/op", lat(h.whole_max.max(h.max)));

            let wall = h.end_ns.saturating_sub(h.begin_ns).max(1) as f64 / S as f64;
            println!(" throughput: {:>7}ops/s", si(h.acc.n as f64 / wall, ""));
        }
    }

    /// Cumulative per-bench figures for every enabled bench that ran.
    pub fn report(&self) -> Vec<BenchReport> {
        let reg = self.mu.lock().unwrap();

        reg.masters
            .iter()
            .filter(|h| h.enabled && h.acc.n > 0)
            .map(|h| {
                let wall = h.end_ns.saturating_sub(h.begin_ns).max(1) as f64 / S as f64;
                BenchReport {
                    bench: h.bench.to_string(),
                    n: h.acc.n,
                    volume_sum: h.acc.volume_sum,
                    min_ns: h.whole_min.min(h.min),
                    avg_ns: h.acc.latency_sum_ns / h.acc.n,
                    rms_ns: (h.acc.latency_sum_sq as f64 / h.acc.n as f64).sqrt() as u64,
                    max_ns: h.whole_max.max(h.max),
                    ops_per_sec: h.acc.n as f64 / wall,
                }
            })
            .collect()
    }

    /// Sum of the master slot arrays, used to cross-check conservation.
    pub fn slot_total(&self, bench: BenchKind) -> u64 {
        let reg = self.mu.lock().unwrap();
        reg.masters[bench as usize].slots.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MS;

    fn sample(bucket: &mut Bucket, latency_ns: u64) {
        let t0 = clock::now().saturating_sub(latency_ns);
        bucket.add(t0, 1);
    }

    #[test]
    fn slot_bounds_strictly_increase() {
        for w in SLOT_BOUNDS.windows(2) {
            assert!(w[0] < w[1]);
        }
        assert_eq!(SLOT_BOUNDS[0], 9);
        assert_eq!(SLOT_BOUNDS[SLOT_COUNT - 1], u64::MAX);
    }

    #[test]
    fn slot_placement_is_first_bound_not_below() {
        let place = |latency: u64| SLOT_BOUNDS.partition_point(|&b| b < latency);
        assert_eq!(place(0), 0);
        assert_eq!(place(9), 0);
        assert_eq!(place(10), 1);
        assert_eq!(place(12), 1);
        assert_eq!(place(13), 2);
        assert_eq!(place(u64::MAX), SLOT_COUNT - 1);
    }

    #[test]
    fn quorum_gates_the_summary() {
        let hist = Histogram::new(&[BenchKind::Set]);
        let mut b1 = Bucket::new(hist.clone(), true);
        let mut b2 = Bucket::new(hist.clone(), true);
        b1.reset(BenchKind::Set);
        b2.reset(BenchKind::Set);

        for _ in 0..100 {
            sample(&mut b1, 5_000);
            sample(&mut b2, 50_000);
        }

        let start = hist.mu.lock().unwrap().starting_point;

        // First merger after the 1 s window: quorum not reached yet.
        hist.merge_at(&mut b1, start + 1_200 * MS);
        assert_eq!(hist.workers_merged.load(SeqCst), 1);
        assert_eq!(hist.merge_evo.load(SeqCst), 0);

        // Second merger completes the quorum and emits the line.
        hist.merge_at(&mut b2, start + 1_500 * MS);
        assert_eq!(hist.workers_merged.load(SeqCst), 0);
        assert_eq!(hist.merge_evo.load(SeqCst), 1);

        let report = hist.report();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].n, 200);
        assert_eq!(hist.slot_total(BenchKind::Set), 200);
    }

    #[test]
    fn merged_workers_never_exceed_active() {
        let hist = Histogram::new(&[BenchKind::Get]);
        let mut buckets: Vec<_> = (0..4).map(|_| Bucket::new(hist.clone(), true)).collect();
        for b in buckets.iter_mut() {
            b.reset(BenchKind::Get);
            sample(b, 1_000);
        }

        let start = hist.mu.lock().unwrap().starting_point;
        for (i, b) in buckets.iter_mut().enumerate() {
            hist.merge_at(b, start + 2_000 * MS + i as u64);
            assert!(hist.workers_merged.load(SeqCst) <= hist.workers_active.load(SeqCst));
        }
        assert_eq!(hist.merge_evo.load(SeqCst), 1);
    }

    #[test]
    fn master_totals_conserve_worker_samples() {
        let hist = Histogram::new(&[BenchKind::Set, BenchKind::Get]);

        {
            let mut b = Bucket::new(hist.clone(), true);

            b.reset(BenchKind::Set);
            for _ in 0..10 {
                sample(&mut b, 2_000);
            }
            hist.merge(&mut b);

            // switching benches must not leak the previous window
            b.reset(BenchKind::Get);
            for _ in 0..7 {
                sample(&mut b, 3_000);
            }
            hist.merge(&mut b);

            b.reset(BenchKind::Set);
            for _ in 0..5 {
                sample(&mut b, 2_000);
            }
            hist.merge(&mut b);
        }

        let report = hist.report();
        let set = report.iter().find(|r| r.bench == "set").unwrap();
        let get = report.iter().find(|r| r.bench == "get").unwrap();
        assert_eq!(set.n, 15);
        assert_eq!(get.n, 7);
        assert_eq!(hist.slot_total(BenchKind::Set), 15);
        assert_eq!(hist.slot_total(BenchKind::Get), 7);
    }

    #[test]
    fn dropping_buckets_releases_the_worker_count() {
        let hist = Histogram::new(&[BenchKind::Set]);
        {
            let _b1 = Bucket::new(hist.clone(), true);
            let _b2 = Bucket::new(hist.clone(), true);
            assert_eq!(hist.workers_active.load(SeqCst), 2);
        }
        assert_eq!(hist.workers_active.load(SeqCst), 0);
    }

    #[test]
    fn stats_arithmetic() {
        let mut a = Stats {
            n: 3,
            volume_sum: 30,
            latency_sum_ns: 300,
            latency_sum_sq: 3000,
        };
        let b = Stats {
            n: 1,
            volume_sum: 10,
            latency_sum_ns: 100,
            latency_sum_sq: 1000,
        };
        a += b;
        assert_eq!(a.n, 4);
        let d = a - b;
        assert_eq!(d.n, 3);
        assert_eq!(d.latency_sum_sq, 3000);
    }
}
