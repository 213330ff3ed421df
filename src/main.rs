// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use std::collections::BTreeSet;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use mimalloc::MiMalloc;

use cbench::config::{online_cpus, BenchKind, Config, SyncMode, WalMode};
use cbench::{drivers, keyer, Histogram, Runner};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "cbench", about = "Comparative benchmark for embedded key-value stores")]
struct Cli {
    /// Target database; the build decides which drivers are available
    #[arg(short = 'D', long = "database")]
    database: String,

    /// Load types, choices: set, get, delete, iterate, batch, crud
    #[arg(short = 'B', long = "benchmark", value_delimiter = ',', num_args = 1..)]
    benchmark: Vec<String>,

    /// Database sync mode
    #[arg(short = 'M', long = "sync-mode", value_enum, default_value_t = SyncMode::Lazy)]
    sync_mode: SyncMode,

    /// Database WAL mode
    #[arg(short = 'W', long = "wal-mode", value_enum, default_value_t = WalMode::Indef)]
    wal_mode: WalMode,

    /// Dirname for temporary files and reports
    #[arg(short = 'P', long = "dirname", default_value = "./_cbench.tmp")]
    dirname: PathBuf,

    /// Number of operations
    #[arg(short = 'n', default_value_t = 1_000_000)]
    count: u64,

    /// Key size
    #[arg(short = 'k', default_value_t = 16)]
    key_size: usize,

    /// Value size
    #[arg(short = 'v', default_value_t = 32)]
    value_size: usize,

    /// Number of read threads, zero to use a single thread
    #[arg(short = 'r', default_value_t = online_cpus())]
    rthr: usize,

    /// Number of write threads, zero to use a single thread
    #[arg(short = 'w', default_value_t = online_cpus())]
    wthr: usize,

    /// Generate binary (non ASCII) values
    #[arg(long)]
    binary: bool,

    /// Continuous completing mode
    #[arg(long = "continuous")]
    continuous: bool,

    /// Ignore key-not-found errors
    #[arg(long = "ignore-not-found")]
    ignore_not_found: bool,

    /// Seed for the key generator, zero picks the wall clock
    #[arg(long, default_value_t = 42)]
    kvseed: u64,

    /// Benchmark passes per worker
    #[arg(long, default_value_t = 1)]
    nrepeat: usize,

    /// Crud groups per batch transaction
    #[arg(long = "batch-length", default_value_t = 500)]
    batch_length: u64,

    /// One bench kind per worker instead of the whole set
    #[arg(long)]
    separate: bool,
}

fn config_from_cli(cli: Cli) -> Result<Config, String> {
    let mut config = Config {
        driver_name: cli.database,
        dirname: cli.dirname,
        count: cli.count,
        key_size: cli.key_size,
        value_size: cli.value_size,
        walmode: cli.wal_mode,
        syncmode: cli.sync_mode,
        rthr: cli.rthr,
        wthr: cli.wthr,
        kvseed: cli.kvseed,
        nrepeat: cli.nrepeat,
        batch_length: cli.batch_length,
        binary: cli.binary,
        separate: cli.separate,
        ignore_keynotfound: cli.ignore_not_found,
        continuous_completing: cli.continuous,
        ..Config::default()
    };

    if !cli.benchmark.is_empty() {
        let mut benchmarks = BTreeSet::new();
        for item in cli.benchmark.iter().flat_map(|s| s.split_whitespace()) {
            match BenchKind::from_name(item) {
                Some(bench) => {
                    benchmarks.insert(bench);
                }
                None => return Err(format!("unknown benchmark name: {item}")),
            }
        }
        config.benchmarks = benchmarks;
    }

    Ok(config)
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let mut config = match config_from_cli(cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    config.print();
    keyer::init(config.kvseed);

    let Some(driver) = drivers::lookup(&config.driver_name) else {
        eprintln!(
            "error: unknown database driver '{}', supported: {}",
            config.driver_name,
            drivers::supported()
        );
        return ExitCode::FAILURE;
    };

    let histogram = Histogram::new(&config.benchmarks);

    let datadir = config.dirname.join(driver.name());
    if let Err(e) = fs::create_dir_all(&datadir) {
        eprintln!("error: cannot create {}: {e}", datadir.display());
        return ExitCode::FAILURE;
    }
    if let Err(e) = fs::set_permissions(&config.dirname, fs::Permissions::from_mode(0o700)) {
        eprintln!(
            "error: cannot set permissions on {}: {e}",
            config.dirname.display()
        );
        return ExitCode::FAILURE;
    }

    let mut runner = Runner::new(&mut config, driver, histogram, datadir);
    if let Err(e) = runner.init() {
        eprintln!("error: {e}");
        let _ = driver.close();
        return ExitCode::FAILURE;
    }

    unsafe { libc::sync() };

    let result = runner.run();
    drop(runner);
    let _ = driver.close();

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
