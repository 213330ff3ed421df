// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! The runner partitions the bench set over read and write thread pools,
//! spawns the workers, and closes the run with the final tables and the
//! resource usage delta. The runner thread itself contributes load as
//! worker 0.

use std::path::PathBuf;
use std::sync::atomic::Ordering::SeqCst;
use std::sync::{Arc, Barrier};

use thiserror::Error;

use crate::config::{BenchKind, Config, MASK_2KEYSPACE, MASK_WRITE};
use crate::driver::{DbError, Driver};
use crate::histogram::Histogram;
use crate::keyer::KeyerOptions;
use crate::usage::Usage;
use crate::worker::{Worker, WorkerShared};

#[derive(Debug, Error)]
pub enum RunError {
    #[error("{0}")]
    Config(String),
    #[error("driver: {0}")]
    Driver(#[from] DbError),
    #[error("cannot read the resource usage snapshot")]
    Usage,
    #[error("benchmark failed")]
    Failed,
}

/// One worker assignment produced by the mask rotation.
#[derive(Debug, PartialEq, Eq)]
struct WorkerPlan {
    id: usize,
    mask: u32,
    key_space: u64,
    key_sequence: u64,
}

/// Rotates bench masks over one pool of `count` workers. Without
/// `separate` a worker takes the whole remaining set and the rotator is
/// cleared; once empty it resets to the full set. With `separate` each
/// worker gets a single bit rotating through the kinds. Write workers bump
/// the key space so they never collide, twice for two-keyspace benches.
fn plan_pool(
    count: usize,
    separate: bool,
    set: u32,
    rotator: &mut u32,
    nth: &mut usize,
    key_space: &mut u64,
    plans: &mut Vec<WorkerPlan>,
) {
    for _ in 0..count {
        debug_assert!(set != 0);

        if *rotator == 0 {
            *rotator = set;
        }

        let mask = if separate {
            let mut order = 0u32;
            let mut mask = 0;
            while mask == 0 {
                mask = *rotator & (1 << order);
                order = (order + 1) % BenchKind::VARIANT_COUNT as u32;
            }
            mask
        } else {
            *rotator
        };

        if mask & MASK_WRITE != 0 {
            *key_space += 1;
            if mask & MASK_2KEYSPACE != 0 {
                *key_space += 1;
            }
        }

        *nth += 1;
        plans.push(WorkerPlan {
            id: *nth,
            mask,
            key_space: *key_space,
            key_sequence: *nth as u64,
        });
        *rotator &= !mask;
    }
}

pub struct Runner<'a> {
    config: &'a mut Config,
    driver: &'static dyn Driver,
    histogram: Arc<Histogram>,
    datadir: PathBuf,

    set_rd: u32,
    set_wr: u32,
    keyer_options: KeyerOptions,
    shared: WorkerShared,
    before_open_ram: i64,
}

impl<'a> Runner<'a> {
    pub fn new(
        config: &'a mut Config,
        driver: &'static dyn Driver,
        histogram: Arc<Histogram>,
        datadir: PathBuf,
    ) -> Runner<'a> {
        Runner {
            config,
            driver,
            histogram,
            datadir,
            set_rd: 0,
            set_wr: 0,
            keyer_options: KeyerOptions::default(),
            shared: WorkerShared::default(),
            before_open_ram: 0,
        }
    }

    /// Snapshots the RAM baseline, opens the driver and derives the key
    /// space geometry from the thread counts and the bench partition.
    pub fn init(&mut self) -> Result<(), RunError> {
        let Some(before_open) = Usage::load(&self.datadir) else {
            return Err(RunError::Usage);
        };
        self.before_open_ram = before_open.ram;

        self.driver.open(self.config, &self.datadir)?;

        for bench in &self.config.benchmarks {
            if matches!(bench, BenchKind::Get | BenchKind::Iterate) {
                self.set_rd |= bench.bit();
            } else {
                self.set_wr |= bench.bit();
            }
        }

        if self.set_rd | self.set_wr == 0 {
            return Err(RunError::Config(
                "there are no tasks for either reading or writing".into(),
            ));
        }
        if self.set_rd == 0 {
            self.config.rthr = 0;
        }
        if self.set_wr == 0 {
            self.config.wthr = 0;
        }

        let sectors = self.config.rthr.max(self.config.wthr).max(1) as u64;
        let mut spaces = self.config.wthr.max(1) as u64;
        if self.set_wr & MASK_2KEYSPACE != 0 {
            spaces *= 2;
        }

        self.keyer_options = KeyerOptions {
            binary: self.config.binary,
            count: self.config.count,
            key_size: self.config.key_size,
            value_size: self.config.value_size,
            spaces_count: spaces,
            sectors_count: sectors,
        };

        Ok(())
    }

    /// Spawns the worker pools, runs the dual barrier, and prints the
    /// summary, the per-bench tables and the usage delta.
    pub fn run(&mut self) -> Result<(), RunError> {
        let mut plans = Vec::new();
        let mut nth = 0usize;
        let mut key_space = 0u64;
        let mut rot_rd = self.set_rd;
        let mut rot_wr = self.set_wr;

        plan_pool(
            self.config.rthr,
            self.config.separate,
            self.set_rd,
            &mut rot_rd,
            &mut nth,
            &mut key_space,
            &mut plans,
        );
        plan_pool(
            self.config.wthr,
            self.config.separate,
            self.set_wr,
            &mut rot_wr,
            &mut nth,
            &mut key_space,
            &mut plans,
        );

        let Some(mut rusage_start) = Usage::load(&self.datadir) else {
            return Err(RunError::Usage);
        };

        let start_barrier = Barrier::new(plans.len() + 1);
        let finish_barrier = Barrier::new(plans.len() + 1);

        let config: &Config = self.config;
        let driver = self.driver;
        let keyer_options = self.keyer_options;
        let shared = &self.shared;
        let histogram = &self.histogram;
        let full_mask = self.set_rd | self.set_wr;

        std::thread::scope(|s| {
            for plan in &plans {
                let mut worker = Worker::new(
                    plan.id,
                    plan.mask,
                    plan.key_space,
                    plan.key_sequence,
                    keyer_options,
                    config,
                    driver,
                    histogram.clone(),
                    shared,
                );
                let start_barrier = &start_barrier;
                let finish_barrier = &finish_barrier;
                s.spawn(move || {
                    start_barrier.wait();
                    if let Err(e) = worker.fulfil() {
                        println!("worker failed: {e}");
                        shared.failed.store(true, SeqCst);
                    }
                    finish_barrier.wait();
                });
            }

            std::thread::yield_now();
            start_barrier.wait();
            if full_mask != 0 {
                let mut worker = Worker::new(
                    0,
                    full_mask,
                    0,
                    0,
                    keyer_options,
                    config,
                    driver,
                    histogram.clone(),
                    shared,
                );
                if let Err(e) = worker.fulfil() {
                    println!("worker failed: {e}");
                    shared.failed.store(true, SeqCst);
                }
            }
            finish_barrier.wait();
        });

        let Some(rusage_finish) = Usage::load(&self.datadir) else {
            return Err(RunError::Usage);
        };

        if self.shared.failed.load(SeqCst) {
            return Err(RunError::Failed);
        }

        self.histogram.summarize();
        println!("complete.");
        self.histogram.print();

        rusage_start.ram = self.before_open_ram;
        rusage_start.disk = 0;
        Usage::print_delta(&rusage_start, &rusage_finish);

        self.write_report();
        Ok(())
    }

    /// Dumps the cumulative per-bench figures next to the data directory.
    /// A report failure does not fail an otherwise successful run.
    fn write_report(&self) {
        let report = serde_json::json!({
            "config": &self.config,
            "results": self.histogram.report(),
        });

        let path = self
            .config
            .dirname
            .join(format!("report-{}.json", self.driver.name()));
        let body = serde_json::to_vec_pretty(&report).expect("report is serializable");
        match std::fs::write(&path, body) {
            Ok(()) => println!("report: {}", path.display()),
            Err(e) => println!("error: cannot write report {}: {e}", path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(
        count: usize,
        separate: bool,
        set: u32,
        nth: &mut usize,
        key_space: &mut u64,
    ) -> Vec<WorkerPlan> {
        let mut rotator = set;
        let mut plans = Vec::new();
        plan_pool(count, separate, set, &mut rotator, nth, key_space, &mut plans);
        plans
    }

    #[test]
    fn combined_mode_hands_out_the_whole_set() {
        let mut nth = 0;
        let mut key_space = 0;
        let set = BenchKind::Get.bit();
        let plans = plan(2, false, set, &mut nth, &mut key_space);

        assert_eq!(plans.len(), 2);
        assert!(plans.iter().all(|p| p.mask == set));
        // read workers never bump the key space
        assert!(plans.iter().all(|p| p.key_space == 0));
        assert_eq!(plans[0].id, 1);
        assert_eq!(plans[1].key_sequence, 2);
    }

    #[test]
    fn write_workers_get_disjoint_key_spaces() {
        let mut nth = 0;
        let mut key_space = 0;
        let set = BenchKind::Set.bit() | BenchKind::Crud.bit();
        let plans = plan(3, false, set, &mut nth, &mut key_space);

        // two-keyspace benches reserve two spaces per worker
        assert_eq!(plans[0].key_space, 2);
        assert_eq!(plans[1].key_space, 4);
        assert_eq!(plans[2].key_space, 6);
    }

    #[test]
    fn separate_mode_rotates_single_bits() {
        let mut nth = 0;
        let mut key_space = 0;
        let set = BenchKind::Set.bit() | BenchKind::Delete.bit();
        let plans = plan(3, true, set, &mut nth, &mut key_space);

        assert_eq!(plans[0].mask, BenchKind::Set.bit());
        assert_eq!(plans[1].mask, BenchKind::Delete.bit());
        // rotator exhausted, resets to the full set
        assert_eq!(plans[2].mask, BenchKind::Set.bit());
    }
}
