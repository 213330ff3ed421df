// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! LMDB driver. Every begin..done write block runs one read-write
//! transaction, so a whole crud or batch group commits atomically and its
//! reads observe the pending writes. Read blocks use a plain read-only
//! transaction; iteration resumes behind the last returned key with a
//! range cursor.

use std::path::Path;
use std::sync::OnceLock;

use lmdb::{Cursor, Database, Environment, EnvironmentFlags, Transaction, WriteFlags};
use lmdb_sys::{MDB_FIRST, MDB_NEXT, MDB_SET_RANGE};

use crate::config::{BenchKind, Config, SyncMode, WalMode};
use crate::driver::{DbError, DbResult, Driver, DriverContext, Record};

pub struct LmdbDriver {
    state: OnceLock<State>,
}

struct State {
    env: &'static Environment,
    db: Database,
}

#[derive(Default)]
struct LmdbContext {
    rw: Option<lmdb::RwTransaction<'static>>,
    ro: Option<lmdb::RoTransaction<'static>>,
    /// Last key the iteration returned; the cursor resumes past it.
    iter_pos: Option<Vec<u8>>,
}

fn system(e: lmdb::Error) -> DbError {
    DbError::System(e.to_string())
}

impl LmdbDriver {
    pub const fn new() -> LmdbDriver {
        LmdbDriver {
            state: OnceLock::new(),
        }
    }

    fn state(&self) -> DbResult<&State> {
        self.state.get().ok_or(DbError::Unexpected)
    }
}

impl Driver for LmdbDriver {
    fn name(&self) -> &'static str {
        "lmdb"
    }

    fn open(&self, config: &Config, datadir: &Path) -> DbResult<()> {
        let flags = match config.syncmode {
            SyncMode::Sync => EnvironmentFlags::empty(),
            SyncMode::Lazy => EnvironmentFlags::NO_SYNC | EnvironmentFlags::NO_META_SYNC,
            SyncMode::Nosync => EnvironmentFlags::WRITE_MAP | EnvironmentFlags::MAP_ASYNC,
        };

        match config.walmode {
            WalMode::Indef | WalMode::Waloff => {}
            WalMode::Walon => {
                return Err(DbError::System(format!(
                    "unsupported walmode {}",
                    config.walmode
                )));
            }
        }

        let env = Environment::new()
            .set_flags(flags | EnvironmentFlags::NO_READAHEAD)
            .set_map_size(4 << 30)
            .open(datadir)
            .map_err(system)?;

        // The driver is a process-lifetime singleton, transactions stored
        // in the per-thread contexts borrow the environment at 'static.
        let env: &'static Environment = Box::leak(Box::new(env));
        let db = env.open_db(None).map_err(system)?;

        self.state
            .set(State { env, db })
            .map_err(|_| DbError::Unexpected)?;
        Ok(())
    }

    fn close(&self) -> DbResult<()> {
        if let Some(state) = self.state.get() {
            state.env.sync(true).map_err(system)?;
        }
        Ok(())
    }

    fn thread_new(&self) -> Option<DriverContext> {
        self.state.get()?;
        Some(Box::new(LmdbContext::default()))
    }

    fn begin(&self, ctx: &mut DriverContext, kind: BenchKind) -> DbResult<()> {
        let state = self.state()?;
        let ctx = ctx.downcast_mut::<LmdbContext>().ok_or(DbError::Unexpected)?;

        match kind {
            BenchKind::Set | BenchKind::Delete | BenchKind::Batch | BenchKind::Crud => {
                // a read transaction cannot be reused for writes
                ctx.ro = None;
                ctx.iter_pos = None;
                ctx.rw = Some(state.env.begin_rw_txn().map_err(system)?);
            }
            BenchKind::Get | BenchKind::Iterate => {
                ctx.rw = None;
                ctx.iter_pos = None;
                ctx.ro = Some(state.env.begin_ro_txn().map_err(system)?);
            }
        }
        Ok(())
    }

    fn next(&self, ctx: &mut DriverContext, kind: BenchKind, kv: &Record<'_>) -> DbResult<usize> {
        let state = self.state()?;
        let ctx = ctx.downcast_mut::<LmdbContext>().ok_or(DbError::Unexpected)?;

        match kind {
            BenchKind::Set => {
                let txn = ctx.rw.as_mut().ok_or(DbError::Unexpected)?;
                txn.put(state.db, &kv.key, &kv.value, WriteFlags::empty())
                    .map_err(system)?;
                Ok(kv.len())
            }

            BenchKind::Delete => {
                let txn = ctx.rw.as_mut().ok_or(DbError::Unexpected)?;
                match txn.del(state.db, &kv.key, None) {
                    Ok(()) => Ok(kv.key.len()),
                    Err(lmdb::Error::NotFound) => Err(DbError::NotFound),
                    Err(e) => Err(system(e)),
                }
            }

            BenchKind::Get => {
                // inside a crud/batch block the get runs on the write
                // transaction and observes the pending operations
                let found = if let Some(txn) = ctx.rw.as_ref() {
                    txn.get(state.db, &kv.key)
                } else if let Some(txn) = ctx.ro.as_ref() {
                    txn.get(state.db, &kv.key)
                } else {
                    return Err(DbError::Unexpected);
                };
                match found {
                    Ok(value) => Ok(kv.key.len() + value.len()),
                    Err(lmdb::Error::NotFound) => Err(DbError::NotFound),
                    Err(e) => Err(system(e)),
                }
            }

            BenchKind::Iterate => {
                let txn = ctx.ro.as_ref().ok_or(DbError::Unexpected)?;
                let cursor = txn.open_ro_cursor(state.db).map_err(system)?;

                let result = match ctx.iter_pos.as_deref() {
                    None => cursor.get(None, None, MDB_FIRST),
                    Some(pos) => match cursor.get(Some(pos), None, MDB_SET_RANGE) {
                        // the resume key may still be present, step past it
                        Ok((Some(k), _)) if k == pos => cursor.get(None, None, MDB_NEXT),
                        other => other,
                    },
                };

                match result {
                    Ok((key, value)) => {
                        let key = key.unwrap_or(&[]);
                        let size = key.len() + value.len();
                        ctx.iter_pos = Some(key.to_vec());
                        Ok(size)
                    }
                    Err(lmdb::Error::NotFound) => {
                        ctx.iter_pos = None;
                        Err(DbError::NotFound)
                    }
                    Err(e) => Err(system(e)),
                }
            }

            BenchKind::Batch | BenchKind::Crud => Err(DbError::Unexpected),
        }
    }

    fn done(&self, ctx: &mut DriverContext, kind: BenchKind) -> DbResult<()> {
        let ctx = ctx.downcast_mut::<LmdbContext>().ok_or(DbError::Unexpected)?;

        match kind {
            BenchKind::Set | BenchKind::Delete | BenchKind::Batch | BenchKind::Crud => {
                let txn = ctx.rw.take().ok_or(DbError::Unexpected)?;
                txn.commit().map_err(system)
            }
            BenchKind::Get | BenchKind::Iterate => {
                ctx.ro = None;
                ctx.iter_pos = None;
                Ok(())
            }
        }
    }
}
