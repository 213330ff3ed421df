// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! End-to-end runs of the harness against stub drivers: the logging debug
//! driver, a BTreeMap-backed store exercising every bench kind, and a
//! driver that reports every key as missing.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::ops::Bound;
use std::path::Path;
use std::sync::Mutex;

use cbench::config::{BenchKind, Config};
use cbench::driver::{DbError, DbResult, Driver, DriverContext, Record};
use cbench::histogram::BenchReport;
use cbench::runner::{RunError, Runner};
use cbench::{keyer, Histogram};

fn test_config(dir: &Path, benches: &[BenchKind]) -> Config {
    Config {
        driver_name: "debug".into(),
        dirname: dir.to_path_buf(),
        benchmarks: benches.iter().copied().collect::<BTreeSet<_>>(),
        count: 3,
        rthr: 0,
        wthr: 0,
        ..Config::default()
    }
}

fn run(config: &mut Config, driver: &'static dyn Driver) -> (Result<(), RunError>, Vec<BenchReport>) {
    keyer::init(42);

    let histogram = Histogram::new(&config.benchmarks);
    let datadir = config.dirname.join(driver.name());
    std::fs::create_dir_all(&datadir).unwrap();

    let mut runner = Runner::new(config, driver, histogram.clone(), datadir);
    runner.init().unwrap();
    let result = runner.run();

    (result, histogram.report())
}

fn counts(report: &[BenchReport]) -> Vec<(String, u64)> {
    report.iter().map(|r| (r.bench.clone(), r.n)).collect()
}

#[test]
fn debug_driver_smoke_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), &[BenchKind::Set, BenchKind::Get]);

    let driver = cbench::drivers::lookup("debug").unwrap();
    let (result, report) = run(&mut config, driver);

    result.unwrap();
    assert_eq!(
        counts(&report),
        vec![("set".to_string(), 3), ("get".to_string(), 3)]
    );
}

// ---------------------------------------------------------------------------
// BTreeMap-backed store
// ---------------------------------------------------------------------------

struct MemDriver {
    map: Mutex<BTreeMap<Vec<u8>, Vec<u8>>>,
}

#[derive(Default)]
struct MemContext {
    iter_pos: Option<Vec<u8>>,
}

impl Driver for MemDriver {
    fn name(&self) -> &'static str {
        "mem"
    }

    fn open(&self, _config: &Config, _datadir: &Path) -> DbResult<()> {
        Ok(())
    }

    fn close(&self) -> DbResult<()> {
        Ok(())
    }

    fn thread_new(&self) -> Option<DriverContext> {
        Some(Box::new(MemContext::default()))
    }

    fn begin(&self, ctx: &mut DriverContext, kind: BenchKind) -> DbResult<()> {
        let ctx = ctx.downcast_mut::<MemContext>().ok_or(DbError::Unexpected)?;
        if kind == BenchKind::Iterate {
            ctx.iter_pos = None;
        }
        Ok(())
    }

    fn next(&self, ctx: &mut DriverContext, kind: BenchKind, kv: &Record<'_>) -> DbResult<usize> {
        let ctx = ctx.downcast_mut::<MemContext>().ok_or(DbError::Unexpected)?;
        let mut map = self.map.lock().unwrap();

        match kind {
            BenchKind::Set => {
                map.insert(kv.key.to_vec(), kv.value.to_vec());
                Ok(kv.len())
            }
            BenchKind::Delete => map
                .remove(kv.key)
                .map(|_| kv.key.len())
                .ok_or(DbError::NotFound),
            BenchKind::Get => map
                .get(kv.key)
                .map(|v| kv.key.len() + v.len())
                .ok_or(DbError::NotFound),
            BenchKind::Iterate => {
                let next = match &ctx.iter_pos {
                    None => map.iter().next(),
                    Some(pos) => map
                        .range::<[u8], _>((Bound::Excluded(pos.as_slice()), Bound::Unbounded))
                        .next(),
                };
                match next {
                    None => Err(DbError::NotFound),
                    Some((k, v)) => {
                        let size = k.len() + v.len();
                        ctx.iter_pos = Some(k.clone());
                        Ok(size)
                    }
                }
            }
            BenchKind::Batch | BenchKind::Crud => Err(DbError::Unexpected),
        }
    }

    fn done(&self, ctx: &mut DriverContext, kind: BenchKind) -> DbResult<()> {
        let ctx = ctx.downcast_mut::<MemContext>().ok_or(DbError::Unexpected)?;
        if kind == BenchKind::Iterate {
            ctx.iter_pos = None;
        }
        Ok(())
    }
}

static MEM: MemDriver = MemDriver {
    map: Mutex::new(BTreeMap::new()),
};

#[test]
fn full_mix_against_memory_store() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(
        dir.path(),
        &[
            BenchKind::Set,
            BenchKind::Get,
            BenchKind::Iterate,
            BenchKind::Batch,
            BenchKind::Crud,
        ],
    );
    config.driver_name = "mem".into();

    let (result, report) = run(&mut config, &MEM);

    result.unwrap();
    assert_eq!(
        counts(&report),
        vec![
            ("set".to_string(), 3),
            ("get".to_string(), 3),
            ("iter".to_string(), 3),
            // a whole batch group is one latency sample
            ("batch".to_string(), 1),
            ("crud".to_string(), 3),
        ]
    );

    // The set bench stored the values the get bench fetches, so both
    // benches move key plus value bytes per operation.
    let pair = (config.key_size + config.value_size) as u64;
    let set = report.iter().find(|r| r.bench == "set").unwrap();
    assert_eq!(set.volume_sum, 3 * pair);
    let get = report.iter().find(|r| r.bench == "get").unwrap();
    assert_eq!(get.volume_sum, 3 * pair);
}

// ---------------------------------------------------------------------------
// NotFound policy
// ---------------------------------------------------------------------------

struct NotFoundDriver;

impl Driver for NotFoundDriver {
    fn name(&self) -> &'static str {
        "notfound"
    }

    fn open(&self, _config: &Config, _datadir: &Path) -> DbResult<()> {
        Ok(())
    }

    fn close(&self) -> DbResult<()> {
        Ok(())
    }

    fn thread_new(&self) -> Option<DriverContext> {
        Some(Box::new(()))
    }

    fn begin(&self, _ctx: &mut DriverContext, _kind: BenchKind) -> DbResult<()> {
        Ok(())
    }

    fn next(&self, _ctx: &mut DriverContext, kind: BenchKind, kv: &Record<'_>) -> DbResult<usize> {
        if kind == BenchKind::Get {
            Err(DbError::NotFound)
        } else {
            Ok(kv.len())
        }
    }

    fn done(&self, _ctx: &mut DriverContext, _kind: BenchKind) -> DbResult<()> {
        Ok(())
    }
}

static NOT_FOUND: NotFoundDriver = NotFoundDriver;

#[test]
fn missing_keys_fail_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), &[BenchKind::Get]);
    config.driver_name = "notfound".into();

    let (result, _) = run(&mut config, &NOT_FOUND);
    assert!(matches!(result, Err(RunError::Failed)));
}

#[test]
fn missing_keys_are_ignored_on_request() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path(), &[BenchKind::Get]);
    config.driver_name = "notfound".into();
    config.ignore_keynotfound = true;

    let (result, report) = run(&mut config, &NOT_FOUND);

    result.unwrap();
    assert_eq!(counts(&report), vec![("get".to_string(), 3)]);
}
