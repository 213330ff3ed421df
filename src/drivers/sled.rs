// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! sled driver, the embedded B-tree engine. Crud and batch blocks apply as
//! one `sled::Batch` at `done`; sync mode flushes the tree after every
//! write block.

use std::path::Path;
use std::sync::OnceLock;

use crate::config::{BenchKind, Config, SyncMode, WalMode};
use crate::driver::{DbError, DbResult, Driver, DriverContext, Record};

pub struct SledDriver {
    state: OnceLock<State>,
}

struct State {
    db: sled::Db,
    flush_each_done: bool,
}

#[derive(Default)]
struct SledContext {
    iter: Option<sled::Iter>,
    batch: Option<sled::Batch>,
}

fn system(e: sled::Error) -> DbError {
    DbError::System(e.to_string())
}

impl SledDriver {
    pub const fn new() -> SledDriver {
        SledDriver {
            state: OnceLock::new(),
        }
    }

    fn state(&self) -> DbResult<&State> {
        self.state.get().ok_or(DbError::Unexpected)
    }
}

impl Driver for SledDriver {
    fn name(&self) -> &'static str {
        "sled"
    }

    fn open(&self, config: &Config, datadir: &Path) -> DbResult<()> {
        // sled always keeps its log, the WAL cannot be toggled
        match config.walmode {
            WalMode::Indef => {}
            other => {
                return Err(DbError::System(format!("unsupported walmode {other}")));
            }
        }

        let mut sled_config = sled::Config::default()
            .path(datadir)
            .mode(sled::Mode::HighThroughput);

        let flush_each_done = match config.syncmode {
            SyncMode::Sync => true,
            SyncMode::Lazy => {
                sled_config = sled_config.flush_every_ms(Some(500));
                false
            }
            SyncMode::Nosync => {
                sled_config = sled_config.flush_every_ms(None);
                false
            }
        };

        let db = sled_config.open().map_err(system)?;
        self.state
            .set(State {
                db,
                flush_each_done,
            })
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
        Some(Box::new(SledContext::default()))
    }

    fn begin(&self, ctx: &mut DriverContext, kind: BenchKind) -> DbResult<()> {
        let state = self.state()?;
        let ctx = ctx.downcast_mut::<SledContext>().ok_or(DbError::Unexpected)?;

        match kind {
            BenchKind::Set | BenchKind::Get | BenchKind::Delete => {}
            BenchKind::Iterate => {
                ctx.iter = Some(state.db.iter());
            }
            BenchKind::Batch | BenchKind::Crud => {
                ctx.batch = Some(sled::Batch::default());
            }
        }
        Ok(())
    }

    fn next(&self, ctx: &mut DriverContext, kind: BenchKind, kv: &Record<'_>) -> DbResult<usize> {
        let state = self.state()?;
        let ctx = ctx.downcast_mut::<SledContext>().ok_or(DbError::Unexpected)?;

        match kind {
            BenchKind::Set => {
                if let Some(batch) = ctx.batch.as_mut() {
                    batch.insert(kv.key, kv.value);
                } else {
                    state.db.insert(kv.key, kv.value).map_err(system)?;
                }
                Ok(kv.len())
            }

            BenchKind::Delete => {
                if let Some(batch) = ctx.batch.as_mut() {
                    batch.remove(kv.key);
                    Ok(kv.key.len())
                } else {
                    match state.db.remove(kv.key) {
                        Ok(Some(_)) => Ok(kv.key.len()),
                        Ok(None) => Err(DbError::NotFound),
                        Err(e) => Err(system(e)),
                    }
                }
            }

            BenchKind::Get => match state.db.get(kv.key) {
                Ok(Some(value)) => Ok(kv.key.len() + value.len()),
                // the matching set may still sit in the pending batch
                Ok(None) if ctx.batch.is_some() => Ok(kv.key.len()),
                Ok(None) => Err(DbError::NotFound),
                Err(e) => Err(system(e)),
            },

            BenchKind::Iterate => {
                let iter = ctx.iter.as_mut().ok_or(DbError::Unexpected)?;
                match iter.next() {
                    None => Err(DbError::NotFound),
                    Some(Ok((key, value))) => Ok(key.len() + value.len()),
                    Some(Err(e)) => Err(system(e)),
                }
            }

            BenchKind::Batch | BenchKind::Crud => Err(DbError::Unexpected),
        }
    }

    fn done(&self, ctx: &mut DriverContext, kind: BenchKind) -> DbResult<()> {
        let state = self.state()?;
        let ctx = ctx.downcast_mut::<SledContext>().ok_or(DbError::Unexpected)?;

        match kind {
            BenchKind::Get => Ok(()),
            BenchKind::Iterate => {
                ctx.iter = None;
                Ok(())
            }
            BenchKind::Set | BenchKind::Delete => {
                if state.flush_each_done {
                    state.db.flush().map_err(system)?;
                }
                Ok(())
            }
            BenchKind::Batch | BenchKind::Crud => {
                if let Some(batch) = ctx.batch.take() {
                    state.db.apply_batch(batch).map_err(system)?;
                }
                if state.flush_each_done {
                    state.db.flush().map_err(system)?;
                }
                Ok(())
            }
        }
    }
}
