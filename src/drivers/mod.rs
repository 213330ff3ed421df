// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Driver registry. Drivers are registered at build time; the runner
//! looks them up by name and calls them through the `Driver` trait only.

mod debug;
#[cfg(feature = "lmdb")]
mod lmdb;
#[cfg(feature = "rocksdb")]
mod rocksdb;
#[cfg(feature = "sled")]
mod sled;

use crate::driver::Driver;

static DEBUG: debug::DebugDriver = debug::DebugDriver;
#[cfg(feature = "lmdb")]
static LMDB: lmdb::LmdbDriver = lmdb::LmdbDriver::new();
#[cfg(feature = "rocksdb")]
static ROCKSDB: rocksdb::RocksDbDriver = rocksdb::RocksDbDriver::new();
#[cfg(feature = "sled")]
static SLED: sled::SledDriver = sled::SledDriver::new();

fn all() -> Vec<&'static dyn Driver> {
    let mut drivers: Vec<&'static dyn Driver> = vec![&DEBUG];
    #[cfg(feature = "lmdb")]
    drivers.push(&LMDB);
    #[cfg(feature = "rocksdb")]
    drivers.push(&ROCKSDB);
    #[cfg(feature = "sled")]
    drivers.push(&SLED);
    drivers
}

/// Returns the driver singleton for `name`, if it was built in.
pub fn lookup(name: &str) -> Option<&'static dyn Driver> {
    all().into_iter().find(|d| d.name() == name)
}

/// A comma separated list of the driver names in this build.
pub fn supported() -> String {
    all()
        .iter()
        .map(|d| d.name())
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_driver_is_always_registered() {
        assert!(supported().contains("debug"));
        assert_eq!(lookup("debug").unwrap().name(), "debug");
        assert!(lookup("no-such-engine").is_none());
    }
}
