#![cfg(target_os = "linux")]
//! `/proc`-based process reader for Linux.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::os::unix::fs::FileExt;

use crate::error::{Result, ScanError};
use crate::reader::ProcessReader;
use crate::region::{Perm, Region};

/// Reads a live process through `/proc/<pid>/maps` and `/proc/<pid>/mem`.
#[derive(Debug)]
pub struct ProcReader {
    pid: i32,
    mem: File,
}

impl ProcReader {
    /// Open `/proc/<pid>/mem` for reading. Requires ptrace-level access to
    /// the target (same user or CAP_SYS_PTRACE).
    pub fn attach(pid: i32) -> Result<Self> {
        let mem_path = format!("/proc/{pid}/mem");
        let mem = File::open(&mem_path)
            .map_err(|e| ScanError::Io(io::Error::new(e.kind(), format!("open {mem_path}: {e}"))))?;
        Ok(Self { pid, mem })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn page_size() -> usize {
        // SAFETY: sysconf has no preconditions.
        unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
    }
}

/// Parse one `/proc/<pid>/maps` record.
///
/// Format: `start-end perms offset dev inode [pathname]`, e.g.
/// `00400000-0040b000 r-xp 00000000 08:01 131104 /usr/bin/cat`.
fn parse_maps_line(line: &str) -> Option<Region> {
    let mut parts = line.splitn(6, ' ').filter(|s| !s.is_empty());
    let addrs = parts.next()?;
    let perms = parts.next()?;
    let _offset = parts.next();
    let _dev = parts.next();
    let _inode = parts.next();
    let path = parts.next().map(str::trim).unwrap_or("");

    let (start, end) = addrs.split_once('-')?;
    let start = u64::from_str_radix(start, 16).ok()?;
    let end = u64::from_str_radix(end, 16).ok()?;

    let bytes = perms.as_bytes();
    let perm = Perm {
        read: bytes.first() == Some(&b'r'),
        write: bytes.get(1) == Some(&b'w'),
        execute: bytes.get(2) == Some(&b'x'),
    };

    // Anonymous mappings carry no pathname; give them a synthetic identity
    // so they can still anchor or terminate a chain.
    let path = if path.is_empty() { "[anon]" } else { path };

    Some(Region::new(start, end, path, perm))
}

impl ProcessReader for ProcReader {
    fn list_regions(&self) -> Result<Vec<Region>> {
        let maps_path = format!("/proc/{}/maps", self.pid);
        let file = File::open(&maps_path)
            .map_err(|e| ScanError::Io(io::Error::new(e.kind(), format!("open {maps_path}: {e}"))))?;

        let mut regions = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            let Some(region) = parse_maps_line(&line) else {
                log::warn!("unparseable maps record: {line:?}");
                continue;
            };
            if region.perm.read && !region.is_empty() {
                regions.push(region);
            }
        }
        Ok(regions)
    }

    fn read_at(&self, addr: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.mem.read_at(buf, addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_file_backed_record() {
        let r = parse_maps_line("00400000-0040b000 r-xp 00000000 08:01 131104 /usr/bin/cat").unwrap();
        assert_eq!(r.start, 0x400000);
        assert_eq!(r.end, 0x40b000);
        assert_eq!(r.path, "/usr/bin/cat");
        assert!(r.perm.read && !r.perm.write && r.perm.execute);
    }

    #[test]
    fn test_parse_heap_record() {
        let r = parse_maps_line("55e0a000-55e2b000 rw-p 00000000 00:00 0 [heap]").unwrap();
        assert_eq!(r.path, "[heap]");
        assert!(r.perm.write);
    }

    #[test]
    fn test_parse_anonymous_record() {
        let r = parse_maps_line("7f2a000000-7f2a021000 rw-p 00000000 00:00 0").unwrap();
        assert_eq!(r.path, "[anon]");
    }

    #[test]
    fn test_parse_garbage_rejected() {
        assert!(parse_maps_line("not a maps line").is_none());
    }

    #[test]
    fn test_attach_self() {
        // Reading our own /proc entry needs no extra privileges.
        let me = std::process::id() as i32;
        let reader = ProcReader::attach(me).unwrap();
        let regions = reader.list_regions().unwrap();
        assert!(!regions.is_empty());
        assert!(regions.windows(2).all(|w| w[0].start <= w[1].start));
    }
}
