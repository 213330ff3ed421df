// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! RocksDB driver. Crud and batch blocks accumulate into a `WriteBatch`
//! that is written at `done`; gets inside such a block read the committed
//! state, so an absent key there is not an error.

use std::path::Path;
use std::sync::OnceLock;

use rocksdb::{DBRawIterator, Options, ReadOptions, WriteBatch, WriteOptions, DB};

use crate::config::{BenchKind, Config, SyncMode, WalMode};
use crate::driver::{DbError, DbResult, Driver, DriverContext, Record};

pub struct RocksDbDriver {
    state: OnceLock<State>,
}

struct State {
    db: &'static DB,
    write_opts: WriteOptions,
}

#[derive(Default)]
struct RocksContext {
    iter: Option<DBRawIterator<'static>>,
    batch: Option<WriteBatch>,
}

fn system(e: rocksdb::Error) -> DbError {
    DbError::System(e.to_string())
}

fn read_opts() -> ReadOptions {
    let mut opts = ReadOptions::default();
    opts.fill_cache(false);
    opts
}

impl RocksDbDriver {
    pub const fn new() -> RocksDbDriver {
        RocksDbDriver {
            state: OnceLock::new(),
        }
    }

    fn state(&self) -> DbResult<&State> {
        self.state.get().ok_or(DbError::Unexpected)
    }
}

impl Driver for RocksDbDriver {
    fn name(&self) -> &'static str {
        "rocksdb"
    }

    fn open(&self, config: &Config, datadir: &Path) -> DbResult<()> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::None);

        let mut write_opts = WriteOptions::default();
        match config.syncmode {
            SyncMode::Sync => {
                write_opts.set_sync(true);
                opts.set_use_fsync(true);
            }
            SyncMode::Lazy | SyncMode::Nosync => {
                write_opts.set_sync(false);
                opts.set_use_fsync(false);
            }
        }

        match config.walmode {
            WalMode::Indef => {}
            WalMode::Walon => write_opts.disable_wal(false),
            WalMode::Waloff => write_opts.disable_wal(true),
        }

        let db = DB::open(&opts, datadir).map_err(system)?;
        // process-lifetime singleton, iterators in the contexts borrow it
        let db: &'static DB = Box::leak(Box::new(db));

        self.state
            .set(State { db, write_opts })
            .map_err(|_| DbError::Unexpected)?;
        Ok(())
    }

    fn close(&self) -> DbResult<()> {
        if let Some(state) = self.state.get() {
            state.db.flush().map_err(system)?;
        }
        Ok(())
    }

    fn thread_new(&self) -> Option<DriverContext> {
        self.state.get()?;
        Some(Box::new(RocksContext::default()))
    }

    fn begin(&self, ctx: &mut DriverContext, kind: BenchKind) -> DbResult<()> {
        let state = self.state()?;
        let ctx = ctx
            .downcast_mut::<RocksContext>()
            .ok_or(DbError::Unexpected)?;

        match kind {
            BenchKind::Set | BenchKind::Get | BenchKind::Delete => {}
            BenchKind::Iterate => {
                let db = state.db;
                let mut iter = db.raw_iterator_opt(read_opts());
                iter.seek_to_first();
                ctx.iter = Some(iter);
            }
            BenchKind::Batch | BenchKind::Crud => {
                ctx.batch = Some(WriteBatch::default());
            }
        }
        Ok(())
    }

    fn next(&self, ctx: &mut DriverContext, kind: BenchKind, kv: &Record<'_>) -> DbResult<usize> {
        let state = self.state()?;
        let ctx = ctx
            .downcast_mut::<RocksContext>()
            .ok_or(DbError::Unexpected)?;

        match kind {
            BenchKind::Set => {
                if let Some(batch) = ctx.batch.as_mut() {
                    batch.put(kv.key, kv.value);
                } else {
                    state
                        .db
                        .put_opt(kv.key, kv.value, &state.write_opts)
                        .map_err(system)?;
                }
                Ok(kv.len())
            }

            BenchKind::Delete => {
                if let Some(batch) = ctx.batch.as_mut() {
                    batch.delete(kv.key);
                } else {
                    state
                        .db
                        .delete_opt(kv.key, &state.write_opts)
                        .map_err(system)?;
                }
                Ok(kv.key.len())
            }

            BenchKind::Get => match state.db.get_pinned_opt(kv.key, &read_opts()) {
                Ok(Some(value)) => Ok(kv.key.len() + value.len()),
                // inside a crud/batch block the matching set is still
                // buffered, an absent key is expected
                Ok(None) if ctx.batch.is_some() => Ok(kv.key.len()),
                Ok(None) => Err(DbError::NotFound),
                Err(e) => Err(system(e)),
            },

            BenchKind::Iterate => {
                let iter = ctx.iter.as_mut().ok_or(DbError::Unexpected)?;
                if !iter.valid() {
                    return Err(DbError::NotFound);
                }
                let size = iter.key().map_or(0, <[u8]>::len) + iter.value().map_or(0, <[u8]>::len);
                iter.next();
                Ok(size)
            }

            BenchKind::Batch | BenchKind::Crud => Err(DbError::Unexpected),
        }
    }

    fn done(&self, ctx: &mut DriverContext, kind: BenchKind) -> DbResult<()> {
        let state = self.state()?;
        let ctx = ctx
            .downcast_mut::<RocksContext>()
            .ok_or(DbError::Unexpected)?;

        match kind {
            BenchKind::Set | BenchKind::Get | BenchKind::Delete => Ok(()),
            BenchKind::Iterate => {
                ctx.iter = None;
                Ok(())
            }
            BenchKind::Batch | BenchKind::Crud => {
                if let Some(batch) = ctx.batch.take() {
                    state
                        .db
                        .write_opt(batch, &state.write_opts)
                        .map_err(system)?;
                }
                Ok(())
            }
        }
    }
}
