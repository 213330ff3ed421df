// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Benchmark configuration: the bench-kind enum with its read/write/keyspace
//! partitions, sync and WAL modes, and the effective run configuration.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use clap::ValueEnum;
use serde::Serialize;
use variant_count::VariantCount;

/// One unit of workload. The declaration order is the execution and
/// reporting order everywhere in the harness.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, VariantCount)]
pub enum BenchKind {
    Set = 0,
    Get = 1,
    Delete = 2,
    Iterate = 3,
    Batch = 4,
    Crud = 5,
}

impl BenchKind {
    pub const ALL: [BenchKind; Self::VARIANT_COUNT] = [
        BenchKind::Set,
        BenchKind::Get,
        BenchKind::Delete,
        BenchKind::Iterate,
        BenchKind::Batch,
        BenchKind::Crud,
    ];

    #[inline]
    pub const fn bit(self) -> u32 {
        1 << self as u32
    }

    pub fn from_name(name: &str) -> Option<BenchKind> {
        match name {
            "set" => Some(BenchKind::Set),
            "get" => Some(BenchKind::Get),
            "del" | "delete" => Some(BenchKind::Delete),
            "iter" | "iterate" => Some(BenchKind::Iterate),
            "batch" => Some(BenchKind::Batch),
            "crud" | "transact" => Some(BenchKind::Crud),
            _ => None,
        }
    }
}

impl fmt::Display for BenchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BenchKind::Set => "set",
            BenchKind::Get => "get",
            BenchKind::Delete => "del",
            BenchKind::Iterate => "iter",
            BenchKind::Batch => "batch",
            BenchKind::Crud => "crud",
        };
        f.pad(name)
    }
}

/// Benches that only read the store.
pub const MASK_READ: u32 = BenchKind::Get.bit() | BenchKind::Iterate.bit();

/// Benches that mutate the store.
pub const MASK_WRITE: u32 =
    BenchKind::Set.bit() | BenchKind::Delete.bit() | BenchKind::Batch.bit() | BenchKind::Crud.bit();

/// Benches that consume two key spaces per worker (generator A and B).
pub const MASK_2KEYSPACE: u32 = BenchKind::Batch.bit() | BenchKind::Crud.bit();

/// Renders a bench mask as "set, get, crud".
pub fn mask_names(mask: u32) -> String {
    let mut line = String::new();
    for kind in BenchKind::ALL {
        if mask & kind.bit() != 0 {
            if !line.is_empty() {
                line.push_str(", ");
            }
            line.push_str(&kind.to_string());
        }
    }
    line
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
pub enum SyncMode {
    Sync,
    Nosync,
    Lazy,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            SyncMode::Sync => "sync",
            SyncMode::Nosync => "nosync",
            SyncMode::Lazy => "lazy",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ValueEnum)]
pub enum WalMode {
    /// Leave the engine's write-ahead-log default alone.
    Indef,
    Walon,
    Waloff,
}

impl fmt::Display for WalMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            WalMode::Indef => "indef",
            WalMode::Walon => "walon",
            WalMode::Waloff => "waloff",
        })
    }
}

/// Effective run configuration, assembled from the CLI by the binary.
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    pub driver_name: String,
    pub dirname: PathBuf,
    pub benchmarks: BTreeSet<BenchKind>,

    /// Operations per bench per pass.
    pub count: u64,
    pub key_size: usize,
    pub value_size: usize,

    pub walmode: WalMode,
    pub syncmode: SyncMode,

    pub rthr: usize,
    pub wthr: usize,

    pub kvseed: u64,
    pub nrepeat: usize,
    pub batch_length: u64,

    pub binary: bool,
    pub separate: bool,
    pub ignore_keynotfound: bool,
    pub continuous_completing: bool,
}

pub fn online_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

impl Default for Config {
    fn default() -> Self {
        Config {
            driver_name: String::new(),
            dirname: PathBuf::from("./_cbench.tmp"),
            benchmarks: BTreeSet::from([BenchKind::Get, BenchKind::Set]),
            count: 1_000_000,
            key_size: 16,
            value_size: 32,
            walmode: WalMode::Indef,
            syncmode: SyncMode::Lazy,
            rthr: online_cpus(),
            wthr: online_cpus(),
            kvseed: 42,
            nrepeat: 1,
            batch_length: 500,
            binary: false,
            separate: false,
            ignore_keynotfound: false,
            continuous_completing: false,
        }
    }
}

impl Config {
    pub fn bench_names(&self) -> String {
        let mut mask = 0;
        for b in &self.benchmarks {
            mask |= b.bit();
        }
        mask_names(mask)
    }

    pub fn print(&self) {
        let yesno = |b: bool| if b { "yes" } else { "no" };

        println!("Configuration:");
        println!("\tdatabase   = {}", self.driver_name);
        println!("\tdirname    = {}", self.dirname.display());
        println!("\tbenchmarks = {}", self.bench_names());
        println!();
        println!("\toperations = {}", self.count);
        println!();
        println!("\tWAL mode   = {}", self.walmode);
        println!("\tsync mode  = {}", self.syncmode);
        println!();
        println!("\tkey size   = {}", self.key_size);
        println!("\tvalue size = {}", self.value_size);
        println!();
        println!("\tr-threads    = {}", self.rthr);
        println!("\tw-threads    = {}", self.wthr);
        println!();
        println!("\tbinary                = {}", yesno(self.binary));
        println!("\tseparate              = {}", yesno(self.separate));
        println!("\tignore not found      = {}", yesno(self.ignore_keynotfound));
        println!(
            "\tcontinuous completing = {}",
            yesno(self.continuous_completing)
        );
        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bench_names_and_aliases() {
        assert_eq!(BenchKind::from_name("set"), Some(BenchKind::Set));
        assert_eq!(BenchKind::from_name("delete"), Some(BenchKind::Delete));
        assert_eq!(BenchKind::from_name("del"), Some(BenchKind::Delete));
        assert_eq!(BenchKind::from_name("iterate"), Some(BenchKind::Iterate));
        assert_eq!(BenchKind::from_name("iter"), Some(BenchKind::Iterate));
        assert_eq!(BenchKind::from_name("transact"), Some(BenchKind::Crud));
        assert_eq!(BenchKind::from_name("nope"), None);

        for kind in BenchKind::ALL {
            assert_eq!(BenchKind::from_name(&kind.to_string()), Some(kind));
        }
    }

    #[test]
    fn masks_partition_the_kinds() {
        assert_eq!(MASK_READ & MASK_WRITE, 0);
        for kind in BenchKind::ALL {
            assert!((MASK_READ | MASK_WRITE) & kind.bit() != 0);
        }
        assert_eq!(MASK_2KEYSPACE & MASK_READ, 0);
    }

    #[test]
    fn mask_names_in_enum_order() {
        let mask = BenchKind::Crud.bit() | BenchKind::Set.bit() | BenchKind::Get.bit();
        assert_eq!(mask_names(mask), "set, get, crud");
    }
}
