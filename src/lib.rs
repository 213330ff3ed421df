// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

#![doc = include_str!("../README.md")]

pub mod clock;
pub mod config;
pub mod driver;
pub mod drivers;
pub mod histogram;
pub mod keyer;
pub mod runner;
pub mod usage;
pub mod worker;

pub use config::{BenchKind, Config, SyncMode, WalMode};
pub use driver::{DbError, DbResult, Driver, DriverContext, Record};
pub use histogram::{Bucket, Histogram, Stats};
pub use keyer::{Keyer, KeyerOptions};
pub use runner::{RunError, Runner};
pub use usage::Usage;
pub use worker::{Worker, WorkerShared};

/// Prints a diagnostic and terminates the process. Misconfiguration is
/// never handled locally.
#[macro_export]
macro_rules! fatal {
    ($($arg:tt)*) => {{
        eprintln!("\n*** cbench fatal: {}", format!($($arg)*));
        std::process::exit(1)
    }};
}
