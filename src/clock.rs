// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Monotonic nanosecond clock and the SI-suffix pretty printers used by
//! the summary line and the final tables.

use std::sync::OnceLock;
use std::time::Instant;

pub const US: u64 = 1_000;
pub const MS: u64 = 1_000_000;
pub const S: u64 = 1_000_000_000;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic nanoseconds since the first call in this process.
#[inline]
pub fn now() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

/// Renders `val` with a metric suffix, three fractional digits.
/// 120512.0 becomes "120.512K", 0.0000021 becomes "2.100u".
pub fn si(mut val: f64, unit: &str) -> String {
    const DEC: [char; 10] = ['K', 'M', 'G', 'T', 'P', 'E', 'Z', 'Y', 'R', 'Q'];
    const INC: [char; 10] = ['m', 'u', 'n', 'p', 'f', 'a', 'z', 'y', 'r', 'q'];

    let mut suffix = None;

    let mut dec = DEC.iter();
    while val > 995.0 {
        let Some(&c) = dec.next() else { break };
        val *= 1e-3;
        suffix = Some(c);
    }

    let mut inc = INC.iter();
    while val < 1.0 && val > 0.0 {
        let Some(&c) = inc.next() else { break };
        val *= 1e3;
        suffix = Some(c);
    }

    match suffix {
        Some(s) => format!("{val:0.3}{s}{unit}"),
        None => format!("{val:0.3}{unit}"),
    }
}

/// Renders a nanosecond latency as seconds with a suffix, e.g. "8.210us".
pub fn lat(ns: u64) -> String {
    si(ns as f64 / S as f64, "s")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn si_scales_down() {
        assert_eq!(si(120_512.0, ""), "120.512K");
        assert_eq!(si(5_783_000.0, "bps"), "5.783Mbps");
    }

    #[test]
    fn si_scales_up() {
        assert_eq!(si(0.0021, "s"), "2.100ms");
        assert_eq!(lat(2_110), "2.110us");
        assert_eq!(lat(S), "1.000s");
    }

    #[test]
    fn si_plain_range() {
        assert_eq!(si(1.0, ""), "1.000");
        assert_eq!(si(995.0, ""), "995.000");
        assert_eq!(si(0.0, ""), "0.000");
    }

    #[test]
    fn clock_is_monotonic() {
        let a = now();
        let b = now();
        assert!(b >= a);
    }
}
