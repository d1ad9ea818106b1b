//! The process reader capability set consumed by the dump phase.

use std::io;

use crate::error::Result;
use crate::region::{Perm, Region};

/// Abstract view of a running process: enumerate its readable regions and
/// read raw bytes out of its address space.
///
/// Implementations must return regions in ascending `start` order,
/// non-overlapping, readable-only, with records split by the kernel coalesced
/// when path and permissions match. A read that fails or comes up short is
/// reported through the `io::Result`; the dump phase treats it as a skipped
/// region, never as a fatal error.
pub trait ProcessReader {
    fn list_regions(&self) -> Result<Vec<Region>>;

    /// Read up to `buf.len()` bytes at `addr`, returning the count actually
    /// copied. A short read means the tail of the range is gone.
    fn read_at(&self, addr: u64, buf: &mut [u8]) -> io::Result<usize>;
}

/// A reader over an in-memory snapshot: a handful of regions with their
/// bytes. Backs the dump round-trip tests and any caller that wants to build
/// a pointer map from a core-dump-like capture instead of a live process.
#[derive(Debug, Default)]
pub struct SnapshotReader {
    segments: Vec<(Region, Vec<u8>)>,
}

impl SnapshotReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a region backed by `bytes`; `bytes.len()` fixes the region end.
    pub fn add_region(&mut self, start: u64, path: &str, perm: Perm, bytes: Vec<u8>) {
        let region = Region::new(start, start + bytes.len() as u64, path, perm);
        self.segments.push((region, bytes));
        self.segments.sort_by_key(|(r, _)| r.start);
    }

    /// Poke a little-endian word of `width` bytes into the snapshot.
    ///
    /// Panics if `addr` is not inside any segment; snapshots are test
    /// fixtures and a miss is a broken fixture.
    pub fn write_word(&mut self, addr: u64, value: u64, width: usize) {
        let (region, bytes) = self
            .segments
            .iter_mut()
            .find(|(r, _)| r.contains(addr))
            .expect("write_word outside snapshot");
        let off = (addr - region.start) as usize;
        bytes[off..off + width].copy_from_slice(&value.to_le_bytes()[..width]);
    }
}

impl ProcessReader for SnapshotReader {
    fn list_regions(&self) -> Result<Vec<Region>> {
        Ok(self.segments.iter().map(|(r, _)| r.clone()).collect())
    }

    fn read_at(&self, addr: u64, buf: &mut [u8]) -> io::Result<usize> {
        let Some((region, bytes)) = self.segments.iter().find(|(r, _)| r.contains(addr)) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("address {addr:#x} is not mapped"),
            ));
        };
        let off = (addr - region.start) as usize;
        let n = buf.len().min(bytes.len() - off);
        buf[..n].copy_from_slice(&bytes[off..off + n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_read_within_segment() {
        let mut snap = SnapshotReader::new();
        snap.add_region(0x1000, "m", Perm::R, vec![0xAA; 0x100]);

        let mut buf = [0u8; 16];
        let n = snap.read_at(0x1010, &mut buf).unwrap();
        assert_eq!(n, 16);
        assert_eq!(buf, [0xAA; 16]);
    }

    #[test]
    fn test_snapshot_short_read_at_segment_end() {
        let mut snap = SnapshotReader::new();
        snap.add_region(0x1000, "m", Perm::R, vec![0; 0x20]);

        let mut buf = [0u8; 64];
        let n = snap.read_at(0x1010, &mut buf).unwrap();
        assert_eq!(n, 0x10);
    }

    #[test]
    fn test_snapshot_unmapped_read_fails() {
        let snap = SnapshotReader::new();
        let mut buf = [0u8; 8];
        assert!(snap.read_at(0x1000, &mut buf).is_err());
    }

    #[test]
    fn test_write_word_roundtrip() {
        let mut snap = SnapshotReader::new();
        snap.add_region(0x1000, "m", Perm::RW, vec![0; 0x100]);
        snap.write_word(0x1010, 0xdead_beef_cafe, 8);

        let mut buf = [0u8; 8];
        snap.read_at(0x1010, &mut buf).unwrap();
        assert_eq!(u64::from_le_bytes(buf), 0xdead_beef_cafe);
    }

    #[test]
    fn test_regions_listed_in_order() {
        let mut snap = SnapshotReader::new();
        snap.add_region(0x3000, "[heap]", Perm::RW, vec![0; 0x10]);
        snap.add_region(0x1000, "m", Perm::R, vec![0; 0x10]);

        let regions = snap.list_regions().unwrap();
        assert_eq!(regions[0].start, 0x1000);
        assert_eq!(regions[1].start, 0x3000);
    }
}
