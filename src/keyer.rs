// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Deterministic record generator.
//!
//! Every worker owns one `Keyer` per key space. A keyer maps the dense
//! integers `base..base+count` one-to-one onto key byte strings, so a run
//! with the same seed produces byte-identical streams in any process while
//! keys within a cycle never collide and distinct key spaces never overlap.

use std::sync::OnceLock;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::driver::{DbError, DbResult, Record};
use crate::fatal;

pub const SEED_BOX_SIZE: usize = 2048;

/// The 64-symbol alphabet used in printable mode: 2 + 10 + 26 + 26.
const ALPHABET: [u8; 64] = *b"@0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ_";

// The additive constant is a 'fractal' prime: prime by mod 2^{8,16,..,64}
// with enough one-bits. The remix constant stirs the rotated point.
const INJECTION_STIR: u64 = 0x8B5A_3C9F_3D9B_3AC3;
const REMIX_STIR: u64 = 0x6165_4A6B_5A6A_2DC3;

static SEED_BOX: OnceLock<[u16; SEED_BOX_SIZE]> = OnceLock::new();

/// Fills the process-wide seed box from `seed` (0 picks the wall clock).
/// The first initialization wins; the box is read-only afterwards.
pub fn init(seed: u64) {
    let seed = if seed == 0 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(1)
    } else {
        seed
    };

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let _ = SEED_BOX.set(std::array::from_fn(|_| rng.random()));
}

fn seed_box() -> &'static [u16; SEED_BOX_SIZE] {
    SEED_BOX.get().expect("keyer seed box is not initialized")
}

/// Bitmask covering the low `n` bits.
const fn bitmask(n: u32) -> u64 {
    u64::MAX >> (64 - n)
}

/// Aligns `n` up to an 8 byte boundary.
const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Maps x to y one-to-one within the configured bit width. You can think
/// of this as a hash function for a number without collisions, since the
/// cardinality of the input and output sets is equal.
///
/// The multipliers are magic primes found and verified with a bit of brute
/// force so that every lane is a bijection.
fn injection(width: u32, x: u64) -> u64 {
    let x = x.wrapping_add(INJECTION_STIR);

    // stirs the lower bits
    let x = x ^ seed_box()[(x & (SEED_BOX_SIZE as u64 - 1)) as usize] as u64;

    match width {
        1 => {
            let mut y = x as u8;
            y ^= y >> 1;
            y = y.wrapping_mul(113);
            y ^= y << 2;
            y as u64
        }
        2 => {
            let mut y = x as u16;
            y ^= y >> 1;
            y = y.wrapping_mul(25_693);
            y ^= y << 7;
            y as u64
        }
        3 => {
            const M: u32 = 0x00FF_FFFF;
            let mut y = x as u32 & M;
            y ^= y >> 1;
            y = y.wrapping_mul(5_537_317);
            y ^= y << 12;
            (y & M) as u64
        }
        4 => {
            let mut y = x as u32;
            y ^= y >> 1;
            y = y.wrapping_mul(1_923_730_889);
            y ^= y << 15;
            y as u64
        }
        5 => {
            let m = bitmask(40);
            let mut y = x & m;
            y ^= y >> 1;
            y = y.wrapping_mul(274_992_889_273);
            y ^= y << 13;
            y & m
        }
        6 => {
            let m = bitmask(48);
            let mut y = x & m;
            y ^= y >> 1;
            y = y.wrapping_mul(70_375_646_670_269);
            y ^= y << 15;
            y & m
        }
        7 => {
            let m = bitmask(56);
            let mut y = x & m;
            y ^= y >> 1;
            y = y.wrapping_mul(23_022_548_244_171_181);
            y ^= y << 4;
            y & m
        }
        8 => {
            let mut y = x;
            y ^= y >> 1;
            y = y.wrapping_mul(4_613_509_448_041_658_233);
            y ^= y << 25;
            y
        }
        _ => unreachable!("keyer width out of range"),
    }
}

/// Fast and dirty remix, refreshes bits between key and value and across
/// 8 byte value spans. Not injective.
const fn remix(point: u64) -> u64 {
    point ^ point.rotate_left(47).wrapping_add(REMIX_STIR)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct KeyerOptions {
    pub binary: bool,
    pub count: u64,
    pub key_size: usize,
    pub value_size: usize,
    pub spaces_count: u64,
    pub sectors_count: u64,
}

fn key_span(options: &KeyerOptions) -> usize {
    if options.binary {
        align8(options.key_size)
    } else {
        options.key_size + 1
    }
}

fn record_bytes(options: &KeyerOptions) -> usize {
    if options.binary {
        align8(options.key_size) + align8(options.value_size)
    } else {
        options.key_size
            + 1
            + if options.value_size > 0 {
                options.value_size + 1
            } else {
                0
            }
    }
}

/// Emits `length` bytes derived from `point` into `dst`, updating `point`
/// as bits run out. Printable mode writes alphabet symbols plus one NUL;
/// binary mode writes little-endian words covering `align8(length)` bytes.
fn fill(width: u32, binary: bool, point: &mut u64, dst: &mut [u8], length: usize) {
    if !binary {
        let mut left = width * 8;
        let mut acc = *point;
        let mut remaining = length;
        let mut off = 0;

        loop {
            dst[off] = ALPHABET[(acc & 63) as usize];
            off += 1;
            remaining -= 1;
            if remaining == 0 {
                break;
            }
            acc >>= 6;
            left -= 6;
            if left < 6 {
                *point = remix(point.wrapping_add(acc));
                acc = *point;
                left = width * 8;
            }
        }
        dst[off] = 0;
    } else {
        let words = length.div_ceil(8);
        for (w, chunk) in dst[..words * 8].chunks_exact_mut(8).enumerate() {
            chunk.copy_from_slice(&point.to_le_bytes());
            if w + 1 < words {
                *point = remix(*point);
            }
        }
    }
}

/// Packs the record for `point`: the key from the injected point, then the
/// value (when `vsize > 0`) from a remix of the post-key state.
fn record_pair(options: &KeyerOptions, width: u32, vsize: usize, point: u64, dst: &mut [u8]) {
    let mut p = injection(width, point);

    let kspan = key_span(options);
    fill(width, options.binary, &mut p, &mut dst[..kspan], options.key_size);

    if vsize > 0 {
        let vspan = if options.binary { align8(vsize) } else { vsize + 1 };
        let mut p = remix(p);
        fill(
            width,
            options.binary,
            &mut p,
            &mut dst[kspan..kspan + vspan],
            vsize,
        );
    }
}

/// An infinite cyclic sequence of records over one (space, sector).
/// Owned by exactly one worker thread.
pub struct Keyer {
    options: KeyerOptions,
    width: u32,
    base: u64,
    serial: u64,
    buf: Vec<u8>,
}

impl Keyer {
    /// Rejects infeasible geometry with a diagnostic and process exit: the
    /// whole key universe must fit 64-bit arithmetic and `key_size` must
    /// hold the chosen width in the chosen alphabet.
    pub fn new(space: u64, sector: u64, options: KeyerOptions) -> Keyer {
        let Some(maxkey) = options.count.checked_mul(options.spaces_count) else {
            fatal!(
                "key-gen: {} sectors of {} items is too huge, unable to provide by 64-bit arithmetic",
                options.sectors_count,
                options.count
            );
        };
        if maxkey < 2 {
            fatal!("key-gen: at least 2 keys required, got {}", maxkey);
        }

        let bits = [16u32, 24, 32, 40, 48, 56]
            .into_iter()
            .find(|&b| maxkey < bitmask(b))
            .or(if maxkey < u64::MAX { Some(64) } else { None });
        let Some(bits) = bits else {
            fatal!(
                "key-gen: {} sectors of {} items is too huge, unable to provide by 64-bit arithmetic",
                options.sectors_count,
                options.count
            );
        };

        let cardinality = if options.binary { 256.0 } else { ALPHABET.len() as f64 };
        let bytes4maxkey = (bitmask(bits) as f64).ln() / cardinality.ln();
        if bytes4maxkey > options.key_size as f64 {
            fatal!(
                "key-gen: key-length {} is insufficient for {} sectors of {} {} items, at least {} required",
                options.key_size,
                options.sectors_count,
                options.count,
                if options.binary { "binary" } else { "printable" },
                bytes4maxkey.ceil()
            );
        }

        println!("key-gen: using {} bits, up to {} keys", bits, maxkey);

        let mut serial = 0;
        if sector != 0 {
            serial = (options.count * sector / options.sectors_count) % options.count;
        }

        Keyer {
            options,
            width: bits / 8,
            base: space * options.count,
            serial,
            buf: vec![0u8; record_bytes(&options)],
        }
    }

    /// Advances one step and exposes the next record as slices into the
    /// keyer's internal buffer. With `key_only` the value is left empty.
    pub fn next(&mut self, key_only: bool) -> Record<'_> {
        let point = self.base + self.serial;
        self.serial = (self.serial + 1) % self.options.count;

        let vsize = if key_only { 0 } else { self.options.value_size };
        record_pair(&self.options, self.width, vsize, point, &mut self.buf);

        let key = &self.buf[..self.options.key_size];
        let value = if vsize > 0 {
            let voff = key_span(&self.options);
            &self.buf[voff..voff + vsize]
        } else {
            &[][..]
        };

        Record { key, value }
    }

    /// Pre-computes `pool_size` consecutive full records into one buffer,
    /// advancing the schedule as if `next` had been called that many times.
    pub fn batch(&mut self, pool_size: u64) -> Batch {
        let rb = record_bytes(&self.options);
        let mut buf = vec![0u8; rb * pool_size as usize];

        for chunk in buf.chunks_exact_mut(rb) {
            let point = self.base + self.serial;
            self.serial = (self.serial + 1) % self.options.count;
            record_pair(
                &self.options,
                self.width,
                self.options.value_size,
                point,
                chunk,
            );
        }

        Batch {
            options: self.options,
            pos: 0,
            buf,
        }
    }
}

/// A pool of pre-computed records. Non-restartable: `load` slices records
/// out in order and fails once the pool is exhausted.
pub struct Batch {
    options: KeyerOptions,
    pos: usize,
    buf: Vec<u8>,
}

impl Batch {
    pub fn load(&mut self) -> DbResult<Record<'_>> {
        if self.buf.len() - self.pos < record_bytes(&self.options) {
            return Err(DbError::Unexpected);
        }

        let key = &self.buf[self.pos..self.pos + self.options.key_size];
        let mut off = self.pos + key_span(&self.options);

        let value = if self.options.value_size > 0 {
            let v = &self.buf[off..off + self.options.value_size];
            off += if self.options.binary {
                align8(self.options.value_size)
            } else {
                self.options.value_size + 1
            };
            v
        } else {
            &[][..]
        };

        self.pos = off;
        Ok(Record { key, value })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn opts(count: u64, key_size: usize, value_size: usize) -> KeyerOptions {
        KeyerOptions {
            binary: false,
            count,
            key_size,
            value_size,
            spaces_count: 1,
            sectors_count: 1,
        }
    }

    fn keys_of(gen: &mut Keyer, n: u64) -> Vec<Vec<u8>> {
        (0..n).map(|_| gen.next(true).key.to_vec()).collect()
    }

    #[test]
    fn identical_keyers_emit_identical_streams() {
        init(42);

        let mut a = Keyer::new(0, 0, opts(8, 8, 0));
        let mut b = Keyer::new(0, 0, opts(8, 8, 0));

        let ka = keys_of(&mut a, 8);
        let kb = keys_of(&mut b, 8);
        assert_eq!(ka, kb);

        let distinct: BTreeSet<_> = ka.iter().collect();
        assert_eq!(distinct.len(), 8);

        for key in &ka {
            assert_eq!(key.len(), 8);
            assert!(key.iter().all(|b| ALPHABET.contains(b)));
        }
    }

    #[test]
    fn printable_key_is_nul_terminated() {
        init(42);

        let mut gen = Keyer::new(0, 0, opts(16, 16, 32));
        let _ = gen.next(false);
        assert_eq!(gen.buf[16], 0);
        assert_eq!(gen.buf[16 + 1 + 32], 0);
    }

    #[test]
    fn one_cycle_has_no_duplicates() {
        init(42);

        let mut gen = Keyer::new(0, 0, opts(100, 12, 0));
        let keys = keys_of(&mut gen, 100);
        let distinct: BTreeSet<_> = keys.iter().collect();
        assert_eq!(distinct.len(), 100);

        // the schedule is cyclic with period `count`
        assert_eq!(gen.next(true).key, keys[0].as_slice());
    }

    #[test]
    fn key_spaces_never_overlap() {
        init(42);

        let options = KeyerOptions {
            spaces_count: 2,
            ..opts(100, 12, 0)
        };
        let mut s0 = Keyer::new(0, 0, options);
        let mut s1 = Keyer::new(1, 0, options);

        let mut all: BTreeSet<Vec<u8>> = keys_of(&mut s0, 100).into_iter().collect();
        all.extend(keys_of(&mut s1, 100));
        assert_eq!(all.len(), 200);
    }

    #[test]
    fn sector_rotates_the_schedule() {
        init(42);

        let options = KeyerOptions {
            sectors_count: 3,
            ..opts(12, 10, 0)
        };
        let mut s0 = Keyer::new(0, 0, options);
        let mut s1 = Keyer::new(0, 1, options);

        let base = keys_of(&mut s0, 12);
        let rotated = keys_of(&mut s1, 12);

        let delta = (12 * 1 / 3) % 12;
        for t in 0..12 {
            assert_eq!(rotated[t], base[(t + delta) % 12]);
        }
    }

    #[test]
    fn batch_matches_streaming_schedule() {
        init(42);

        let options = opts(32, 12, 24);
        let mut streaming = Keyer::new(0, 0, options);
        let mut pooled = Keyer::new(0, 0, options);

        let mut batch = pooled.batch(10);
        for _ in 0..10 {
            let want = streaming.next(false);
            let got = batch.load().expect("pool must hold 10 records");
            assert_eq!(got.key, want.key);
            assert_eq!(got.value, want.value);
        }
        assert_eq!(batch.load().unwrap_err(), DbError::Unexpected);

        // both generators advanced the same number of steps
        assert_eq!(streaming.serial, pooled.serial);
    }

    #[test]
    fn binary_values_are_remixed_le_words() {
        init(42);

        let options = KeyerOptions {
            binary: true,
            ..opts(16, 8, 16)
        };
        let mut gen = Keyer::new(0, 0, options);
        let rec = gen.next(false);

        assert_eq!(rec.key.len(), 8);
        assert_eq!(rec.value.len(), 16);

        let w0 = u64::from_le_bytes(rec.value[..8].try_into().unwrap());
        let w1 = u64::from_le_bytes(rec.value[8..16].try_into().unwrap());
        assert_eq!(w1, remix(w0));
    }

    proptest! {
        #[test]
        fn cycle_is_bijective_for_legal_options(
            count in 2u64..=300,
            spaces in 1u64..=3,
            key_size in 8usize..=24,
            value_size in proptest::sample::select(vec![0usize, 16]),
            binary in any::<bool>(),
        ) {
            init(42);

            let options = KeyerOptions {
                binary,
                count,
                key_size,
                value_size,
                spaces_count: spaces,
                sectors_count: 1,
            };

            let mut gen = Keyer::new(spaces - 1, 0, options);
            let keys: BTreeSet<Vec<u8>> =
                (0..count).map(|_| gen.next(true).key.to_vec()).collect();
            prop_assert_eq!(keys.len() as u64, count);
        }
    }
}
