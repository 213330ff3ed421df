// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! Debug driver: logs every call and succeeds. Useful as a dry run of the
//! harness itself and as a reference for new drivers.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering::Relaxed};

use crate::config::{BenchKind, Config};
use crate::driver::{DbResult, Driver, DriverContext, Record};

pub struct DebugDriver;

struct DebugContext {
    id: usize,
}

static NEXT_CONTEXT: AtomicUsize = AtomicUsize::new(1);

fn ctx_id(ctx: &DriverContext) -> usize {
    ctx.downcast_ref::<DebugContext>().map_or(0, |c| c.id)
}

impl Driver for DebugDriver {
    fn name(&self) -> &'static str {
        "debug"
    }

    fn open(&self, _config: &Config, datadir: &Path) -> DbResult<()> {
        println!("{}.open({})", self.name(), datadir.display());
        Ok(())
    }

    fn close(&self) -> DbResult<()> {
        println!("{}.close()", self.name());
        Ok(())
    }

    fn thread_new(&self) -> Option<DriverContext> {
        let id = NEXT_CONTEXT.fetch_add(1, Relaxed);
        println!("{}.thread_new() = {:#x}", self.name(), id);
        Some(Box::new(DebugContext { id }))
    }

    fn thread_dispose(&self, ctx: DriverContext) {
        println!("{}.thread_dispose({:#x})", self.name(), ctx_id(&ctx));
    }

    fn begin(&self, ctx: &mut DriverContext, kind: BenchKind) -> DbResult<()> {
        println!("{}.begin({:#x}, {})", self.name(), ctx_id(ctx), kind);
        Ok(())
    }

    fn next(&self, ctx: &mut DriverContext, kind: BenchKind, kv: &Record<'_>) -> DbResult<usize> {
        let id = ctx_id(ctx);
        match kind {
            BenchKind::Set => println!(
                "{}.next({:#x}, {}, {} -> {})",
                self.name(),
                id,
                kind,
                String::from_utf8_lossy(kv.key),
                String::from_utf8_lossy(kv.value)
            ),
            BenchKind::Get | BenchKind::Delete => println!(
                "{}.next({:#x}, {}, {})",
                self.name(),
                id,
                kind,
                String::from_utf8_lossy(kv.key)
            ),
            _ => println!("{}.next({:#x}, {})", self.name(), id, kind),
        }
        Ok(kv.len())
    }

    fn done(&self, ctx: &mut DriverContext, kind: BenchKind) -> DbResult<()> {
        println!("{}.done({:#x}, {})", self.name(), ctx_id(ctx), kind);
        Ok(())
    }
}
