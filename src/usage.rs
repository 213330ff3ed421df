// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

//! OS resource usage snapshots: rusage counters for the process plus the
//! on-disk footprint of the data directory. The runner reads one snapshot
//! before and one after the run and prints the delta.

use std::io;
use std::mem::MaybeUninit;
use std::path::Path;

use serde::Serialize;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct Usage {
    /// Peak resident set in bytes.
    pub ram: i64,
    /// Bytes under the data directory.
    pub disk: i64,

    pub iops_read: i64,
    pub iops_write: i64,
    pub iops_page: i64,

    pub cpu_user_ns: i64,
    pub cpu_kernel_ns: i64,
}

fn timeval_ns(tv: libc::timeval) -> i64 {
    tv.tv_sec as i64 * 1_000_000_000 + tv.tv_usec as i64 * 1_000
}

fn dir_size(path: &Path) -> io::Result<u64> {
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else {
            total += meta.len();
        }
    }
    Ok(total)
}

impl Usage {
    /// Reads the snapshot, `None` when either the rusage call or the
    /// directory walk fails.
    pub fn load(datadir: &Path) -> Option<Usage> {
        let mut ru = MaybeUninit::<libc::rusage>::zeroed();
        if unsafe { libc::getrusage(libc::RUSAGE_SELF, ru.as_mut_ptr()) } != 0 {
            return None;
        }
        let ru = unsafe { ru.assume_init() };

        let disk = if datadir.as_os_str().is_empty() {
            0
        } else {
            match dir_size(datadir) {
                Ok(bytes) => bytes as i64,
                Err(e) => {
                    println!("error: {}: {e}", datadir.display());
                    return None;
                }
            }
        };

        Some(Usage {
            // ru_maxrss is reported in kilobytes
            ram: ru.ru_maxrss as i64 * 1024,
            disk,
            iops_read: ru.ru_inblock as i64,
            iops_write: ru.ru_oublock as i64,
            iops_page: ru.ru_majflt as i64,
            cpu_user_ns: timeval_ns(ru.ru_utime),
            cpu_kernel_ns: timeval_ns(ru.ru_stime),
        })
    }

    pub fn print_delta(start: &Usage, finish: &Usage) {
        println!("\n>>>>>>>>>>>>>>>>>>>>>>> resources usage <<<<<<<<<<<<<<<<<<<<<<<");

        println!(
            "iops: read {}, write {}, page {}",
            finish.iops_read - start.iops_read,
            finish.iops_write - start.iops_write,
            finish.iops_page - start.iops_page
        );

        println!(
            "cpu: user {:.6}, system {:.6}",
            (finish.cpu_user_ns - start.cpu_user_ns) as f64 / 1e9,
            (finish.cpu_kernel_ns - start.cpu_kernel_ns) as f64 / 1e9
        );

        let mb = (1u64 << 20) as f64;
        println!(
            "space: disk {:.6}, ram {:.6}",
            (finish.disk - start.disk) as f64 / mb,
            (finish.ram - start.ram) as f64 / mb
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn snapshot_reads_rusage() {
        let usage = Usage::load(&PathBuf::new()).expect("rusage must be readable");
        assert!(usage.ram > 0);
        assert!(usage.cpu_user_ns >= 0);
        assert_eq!(usage.disk, 0);
    }

    #[test]
    fn disk_usage_counts_file_bytes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), vec![0u8; 1000]).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/b"), vec![0u8; 500]).unwrap();

        let usage = Usage::load(dir.path()).unwrap();
        assert_eq!(usage.disk, 1500);
    }

    #[test]
    fn missing_directory_fails_the_snapshot() {
        assert!(Usage::load(Path::new("/definitely/not/here")).is_none());
    }
}
