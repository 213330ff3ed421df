// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! A worker executes one benchmark mix over the engine. It owns its
//! latency bucket and one keyer per key space, and talks to the store
//! only through the driver facade.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering::SeqCst};
use std::sync::Arc;

use crate::clock;
use crate::config::{mask_names, BenchKind, Config, MASK_2KEYSPACE};
use crate::driver::{DbError, DbResult, Driver, DriverContext, Record};
use crate::fatal;
use crate::histogram::{Bucket, Histogram};
use crate::keyer::{Keyer, KeyerOptions};

/// Coordination state shared by every worker of one run.
#[derive(Default)]
pub struct WorkerShared {
    /// Soft cancellation, checked at loop boundaries.
    pub failed: AtomicBool,
    /// Number of live workers.
    pub workers: AtomicUsize,
    /// Workers that completed their configured `nrepeat` passes.
    pub doers_done: AtomicUsize,
}

pub struct Worker<'a> {
    id: usize,
    key_space: u64,
    key_sequence: u64,
    mask: u32,

    config: &'a Config,
    driver: &'static dyn Driver,
    shared: &'a WorkerShared,
    histogram: Arc<Histogram>,
    bucket: Bucket,

    gen_a: Keyer,
    gen_b: Option<Keyer>,
}

fn log_not_found(op: &str, key: &[u8], id: usize, key_space: u64, key_sequence: u64) {
    println!(
        "error: key {} not found ({}, {}, {}+{})",
        String::from_utf8_lossy(key),
        op,
        id,
        key_space,
        key_sequence
    );
}

/// The inner crud sequence: Set(b), Set(a), Delete(b), Get(a). NotFound
/// from the delete or the get honors `ignore_keynotfound` strictly.
fn crud_sequence(
    driver: &'static dyn Driver,
    ctx: &mut DriverContext,
    config: &Config,
    id: usize,
    key_space: u64,
    key_sequence: u64,
    a: &Record<'_>,
    b: &Record<'_>,
) -> DbResult<()> {
    driver.next(ctx, BenchKind::Set, b)?;
    driver.next(ctx, BenchKind::Set, a)?;

    if let Err(e) = driver.next(ctx, BenchKind::Delete, b) {
        if e != DbError::NotFound {
            return Err(e);
        }
        log_not_found("crud.del", b.key, id, key_space, key_sequence);
        if !config.ignore_keynotfound {
            return Err(DbError::NotFound);
        }
    }

    if let Err(e) = driver.next(ctx, BenchKind::Get, a) {
        if e != DbError::NotFound {
            return Err(e);
        }
        log_not_found("crud.get", a.key, id, key_space, key_sequence);
        if !config.ignore_keynotfound {
            return Err(DbError::NotFound);
        }
    }

    Ok(())
}

impl<'a> Worker<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        mask: u32,
        key_space: u64,
        key_sequence: u64,
        keyer_options: KeyerOptions,
        config: &'a Config,
        driver: &'static dyn Driver,
        histogram: Arc<Histogram>,
        shared: &'a WorkerShared,
    ) -> Worker<'a> {
        if mask == 0 {
            fatal!("worker.{}: there are no tasks for the worker", id);
        }

        shared.workers.fetch_add(1, SeqCst);

        let names = mask_names(mask);
        let gen_a = Keyer::new(key_space, key_sequence, keyer_options);
        let gen_b = if mask & MASK_2KEYSPACE != 0 {
            println!(
                "worker.{id}: {names}, key-space {key_space} and {}, key-sequence {key_sequence}",
                key_space + 1
            );
            Some(Keyer::new(key_space + 1, key_sequence, keyer_options))
        } else {
            println!("worker.{id}: {names}, key-space {key_space}, key-sequence {key_sequence}");
            None
        };

        let bucket = Bucket::new(histogram.clone(), true);

        Worker {
            id,
            key_space,
            key_sequence,
            mask,
            config,
            driver,
            shared,
            histogram,
            bucket,
            gen_a,
            gen_b,
        }
    }

    /// The main loop: runs every bench of the mask `count` times per pass,
    /// `nrepeat` passes, merging the bucket at each bench boundary. With
    /// continuous completion the worker keeps producing load until every
    /// other worker has finished its passes.
    pub fn fulfil(&mut self) -> DbResult<()> {
        let Some(mut ctx) = self.driver.thread_new() else {
            return Err(DbError::Unexpected);
        };

        let mut result = Ok(());
        let mut pass = 0;
        while pass < self.config.nrepeat
            || (self.config.continuous_completing
                && self.shared.doers_done.load(SeqCst) < self.shared.workers.load(SeqCst))
        {
            let mut rc: DbResult<()> = Ok(());

            for kind in BenchKind::ALL {
                if rc.is_err() {
                    break;
                }
                if self.mask & kind.bit() == 0 {
                    continue;
                }

                self.bucket.reset(kind);

                let mut i = 0u64;
                while rc.is_ok() && i < self.config.count {
                    rc = match kind {
                        BenchKind::Set | BenchKind::Get | BenchKind::Delete => {
                            i += 1;
                            self.eval_single(&mut ctx, kind)
                        }
                        BenchKind::Crud => {
                            i += 1;
                            self.eval_crud(&mut ctx)
                        }
                        BenchKind::Batch => self.eval_batch(&mut ctx, &mut i),
                        BenchKind::Iterate => self.eval_iterate(&mut ctx, &mut i),
                    };
                }

                self.histogram.merge(&mut self.bucket);
            }

            pass += 1;
            if pass == self.config.nrepeat {
                self.shared.doers_done.fetch_add(1, SeqCst);
            }

            if rc.is_err() {
                result = rc;
                break;
            }
            if self.shared.failed.load(SeqCst) {
                break;
            }
        }

        self.driver.thread_dispose(ctx);
        result
    }

    /// Set, Get or Delete of one record. Latency covers the whole
    /// begin..next..done block. The byte volume is what the driver
    /// reports from `next`: a get counts key plus the fetched value,
    /// which the key-only record cannot know up front.
    fn eval_single(&mut self, ctx: &mut DriverContext, kind: BenchKind) -> DbResult<()> {
        let driver = self.driver;
        let rec = self.gen_a.next(kind != BenchKind::Set);
        let mut volume = if kind == BenchKind::Delete {
            rec.key.len()
        } else {
            rec.len()
        };

        let t0 = clock::now();
        let mut rc = driver.begin(ctx, kind);
        if rc.is_ok() {
            match driver.next(ctx, kind, &rec) {
                Ok(touched) => volume = touched,
                Err(e) => rc = Err(e),
            }
        }
        let rc2 = driver.done(ctx, kind);

        self.bucket.add(t0, volume);

        if matches!(rc, Err(DbError::NotFound)) {
            log_not_found(
                &kind.to_string(),
                rec.key,
                self.id,
                self.key_space,
                self.key_sequence,
            );
            if self.config.ignore_keynotfound {
                rc = Ok(());
            }
        }

        rc.and(rc2)
    }

    /// One crud group; the latency of the whole group is one sample.
    fn eval_crud(&mut self, ctx: &mut DriverContext) -> DbResult<()> {
        let driver = self.driver;
        let a = self.gen_a.next(false);
        let b = self
            .gen_b
            .as_mut()
            .expect("crud runs with two key spaces")
            .next(false);
        let volume = a.len() + b.len() + a.key.len() + b.key.len() + b.value.len();

        let t0 = clock::now();
        let mut rc = driver.begin(ctx, BenchKind::Crud);
        if rc.is_ok() {
            rc = crud_sequence(
                driver,
                ctx,
                self.config,
                self.id,
                self.key_space,
                self.key_sequence,
                &a,
                &b,
            );
        }
        if rc.is_ok() {
            rc = driver.done(ctx, BenchKind::Crud);
        }

        self.bucket.add(t0, volume);
        rc
    }

    /// Up to `batch_length` crud groups inside one driver transaction, fed
    /// from two pre-computed pools so no generator work interleaves with
    /// the driver calls.
    fn eval_batch(&mut self, ctx: &mut DriverContext, i: &mut u64) -> DbResult<()> {
        let driver = self.driver;
        let batch_length = self.config.batch_length;

        let mut pool_a = self.gen_a.batch(batch_length);
        let mut pool_b = self
            .gen_b
            .as_mut()
            .expect("batch runs with two key spaces")
            .batch(batch_length);

        let t0 = clock::now();
        let mut rc = driver.begin(ctx, BenchKind::Batch);
        if rc.is_ok() {
            for _ in 0..batch_length {
                let (Ok(a), Ok(b)) = (pool_a.load(), pool_b.load()) else {
                    return Err(DbError::Unexpected);
                };
                rc = crud_sequence(
                    driver,
                    ctx,
                    self.config,
                    self.id,
                    self.key_space,
                    self.key_sequence,
                    &a,
                    &b,
                );
                if rc.is_err() {
                    break;
                }
                *i += 1;
                if *i == self.config.count {
                    break;
                }
            }
        }
        if rc.is_ok() {
            rc = driver.done(ctx, BenchKind::Batch);
        }

        let record_size = 2 * (self.config.key_size + self.config.value_size);
        self.bucket.add(t0, record_size * batch_length as usize);
        rc
    }

    /// Walks the store, one latency sample per visited element. NotFound
    /// is the normal end of the iteration.
    fn eval_iterate(&mut self, ctx: &mut DriverContext, i: &mut u64) -> DbResult<()> {
        let driver = self.driver;
        let empty = Record::default();

        let mut t0 = clock::now();
        let mut rc = driver.begin(ctx, BenchKind::Iterate);
        while rc.is_ok() {
            let volume = match driver.next(ctx, BenchKind::Iterate, &empty) {
                Ok(v) => v,
                Err(e) => {
                    rc = Err(e);
                    0
                }
            };
            self.bucket.add(t0, volume);
            *i += 1;
            if *i == self.config.count {
                break;
            }
            t0 = clock::now();
        }

        if matches!(rc, Err(DbError::NotFound)) {
            rc = Ok(());
        }
        if rc.is_ok() {
            rc = driver.done(ctx, BenchKind::Iterate);
        }
        rc
    }
}

impl Drop for Worker<'_> {
    fn drop(&mut self) {
        self.shared.workers.fetch_sub(1, SeqCst);
    }
}
