//! Memory regions and the sorted containment index built over them.

/// Regions longer than this are split so per-region offsets fit in 32 bits.
pub const MAX_REGION_LEN: u64 = 2 * 1024 * 1024 * 1024;

/// Readability bits of a region, parsed from the OS mapping records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Perm {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Perm {
    pub const R: Perm = Perm { read: true, write: false, execute: false };
    pub const RW: Perm = Perm { read: true, write: true, execute: false };
    pub const RX: Perm = Perm { read: true, write: false, execute: true };
}

/// A half-open interval `[start, end)` of a process's address space.
///
/// The `path` string is the anchor identity: the backing file, or a synthetic
/// name such as `[heap]`, `[stack]`, `[anon]`. Two regions sharing a path are
/// the same logical module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub start: u64,
    pub end: u64,
    pub path: String,
    pub perm: Perm,
}

impl Region {
    pub fn new(start: u64, end: u64, path: impl Into<String>, perm: Perm) -> Self {
        Self { start, end, path: path.into(), perm }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }

    /// Whether this region looks like data rather than code: heap, stack,
    /// anonymous mappings, and writable file-backed mappings.
    pub fn is_data(&self) -> bool {
        self.path == "[heap]"
            || self.path.starts_with("[stack")
            || self.path.starts_with("[anon")
            || self.path.is_empty()
            || self.perm.write
    }
}

/// Regions sorted ascending by `start`, non-overlapping, with adjacent
/// same-path same-permission records coalesced and over-long records split
/// at [`MAX_REGION_LEN`].
#[derive(Debug, Clone)]
pub struct RegionSet {
    regions: Vec<Region>,
}

impl RegionSet {
    pub fn new(mut regions: Vec<Region>) -> Self {
        regions.retain(|r| !r.is_empty());
        regions.sort_by_key(|r| r.start);

        let mut merged: Vec<Region> = Vec::with_capacity(regions.len());
        for region in regions {
            match merged.last_mut() {
                Some(prev)
                    if prev.end == region.start
                        && prev.path == region.path
                        && prev.perm == region.perm =>
                {
                    prev.end = region.end;
                }
                _ => merged.push(region),
            }
        }

        let mut split = Vec::with_capacity(merged.len());
        for region in merged {
            let mut start = region.start;
            while region.end - start > MAX_REGION_LEN {
                split.push(Region::new(start, start + MAX_REGION_LEN, region.path.clone(), region.perm));
                start += MAX_REGION_LEN;
            }
            split.push(Region::new(start, region.end, region.path.clone(), region.perm));
        }

        Self { regions: split }
    }

    /// Adopt an already-ordered table verbatim, as read back from a pointer
    /// map file. Returns `None` when the table is not ascending and
    /// non-overlapping; no coalescing or splitting is applied, so offsets
    /// stay relative to the recorded region starts.
    pub fn from_sorted(regions: Vec<Region>) -> Option<Self> {
        let ok = regions.iter().all(|r| !r.is_empty())
            && regions.windows(2).all(|w| w[0].end <= w[1].start);
        ok.then_some(Self { regions })
    }

    pub fn as_slice(&self) -> &[Region] {
        &self.regions
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// The region containing `addr`, if any. O(log n).
    pub fn find(&self, addr: u64) -> Option<&Region> {
        let idx = self.regions.partition_point(|r| r.end <= addr);
        self.regions.get(idx).filter(|r| r.contains(addr))
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.find(addr).is_some()
    }

    /// All regions whose path matches `path` exactly, in address order.
    pub fn by_path(&self, path: &str) -> Vec<&Region> {
        self.regions.iter().filter(|r| r.path == path).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region(start: u64, end: u64, path: &str) -> Region {
        Region::new(start, end, path, Perm::R)
    }

    #[test]
    fn test_contains_half_open() {
        let r = region(0x1000, 0x2000, "m");
        assert!(r.contains(0x1000));
        assert!(r.contains(0x1fff));
        assert!(!r.contains(0x2000));
        assert!(!r.contains(0xfff));
    }

    #[test]
    fn test_find_binary_search() {
        let set = RegionSet::new(vec![
            region(0x3000, 0x4000, "[heap]"),
            region(0x1000, 0x2000, "m"),
        ]);
        assert_eq!(set.find(0x1800).unwrap().path, "m");
        assert_eq!(set.find(0x3000).unwrap().path, "[heap]");
        assert!(set.find(0x2800).is_none());
        assert!(set.find(0x4000).is_none());
    }

    #[test]
    fn test_coalesce_adjacent_same_path() {
        let set = RegionSet::new(vec![
            region(0x1000, 0x2000, "libc.so"),
            region(0x2000, 0x3000, "libc.so"),
            region(0x3000, 0x4000, "[heap]"),
        ]);
        assert_eq!(set.len(), 2);
        assert_eq!(set.as_slice()[0].end, 0x3000);
    }

    #[test]
    fn test_no_coalesce_across_perm_change() {
        let mut a = region(0x1000, 0x2000, "libc.so");
        a.perm = Perm::RX;
        let b = region(0x2000, 0x3000, "libc.so");
        let set = RegionSet::new(vec![a, b]);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_split_over_cap() {
        let set = RegionSet::new(vec![region(0, 5 * 1024 * 1024 * 1024, "big")]);
        assert_eq!(set.len(), 3);
        assert!(set.as_slice().iter().all(|r| r.len() <= MAX_REGION_LEN));
        assert_eq!(set.as_slice()[2].end, 5 * 1024 * 1024 * 1024);
    }

    #[test]
    fn test_by_path_exact_match() {
        let set = RegionSet::new(vec![
            region(0x1000, 0x2000, "libfoo.so"),
            region(0x5000, 0x6000, "libfoo.so"),
            region(0x3000, 0x4000, "libfoo.so.1"),
        ]);
        let hits = set.by_path("libfoo.so");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].start, 0x1000);
        assert_eq!(hits[1].start, 0x5000);
    }

    #[test]
    fn test_is_data() {
        assert!(region(0, 1, "[heap]").is_data());
        assert!(region(0, 1, "[stack]").is_data());
        assert!(region(0, 1, "[anon:libc_malloc]").is_data());
        assert!(region(0, 1, "").is_data());
        let mut rw = region(0, 1, "/usr/lib/libc.so");
        assert!(!rw.is_data());
        rw.perm = Perm::RW;
        assert!(rw.is_data());
    }
}
