//! Pointer-map loader and the in-memory index the search engine runs on.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::dump::{FORMAT_VERSION, HEADER_LEN, MAGIC, PtrWidth};
use crate::error::{Result, ScanError};
use crate::region::{Region, RegionSet};

/// Owned bytes of a loaded map file: read into the heap, or mapped in place.
enum Backing {
    Heap(Vec<u8>),
    Mapped(Mmap),
}

impl Backing {
    fn as_bytes(&self) -> &[u8] {
        match self {
            Backing::Heap(v) => v,
            Backing::Mapped(m) => m,
        }
    }
}

/// A loaded pointer map.
///
/// Owns its backing storage exclusively; dropping the index releases the
/// mapping. All accessors take `&self`, so several searches may run against
/// one index in parallel.
pub struct PointerIndex {
    backing: Backing,
    /// Byte offset of the pair stream inside the backing.
    pairs_offset: usize,
    width: PtrWidth,
    flags: u8,
    regions: RegionSet,
    pair_count: usize,
    /// `(dst, src)` sorted ascending by `dst`, then `src`. 16 bytes per pair.
    reverse: Vec<(u64, u64)>,
}

impl PointerIndex {
    /// Memory-map `path` and index it without copying the pair stream.
    pub fn load(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        // SAFETY: the map file is treated as immutable once written; we never
        // hand out slices that outlive the index that owns the mapping.
        let map = unsafe { Mmap::map(&file)? };
        Self::from_backing(Backing::Mapped(map))
    }

    /// Read `path` fully into the heap and index it.
    pub fn load_eager(path: &Path) -> Result<Self> {
        Self::from_bytes(std::fs::read(path)?)
    }

    /// Index an in-memory map image.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        Self::from_backing(Backing::Heap(bytes))
    }

    fn from_backing(backing: Backing) -> Result<Self> {
        let buf = backing.as_bytes();
        if buf.len() < HEADER_LEN as usize {
            return Err(corrupt("file shorter than header"));
        }
        if buf[..8] != MAGIC {
            return Err(corrupt("bad magic"));
        }
        let version = u16::from_le_bytes(buf[8..10].try_into().expect("header sized"));
        if version != FORMAT_VERSION {
            return Err(corrupt(format!("unsupported version {version}")));
        }
        let width = PtrWidth::from_bytes(buf[10])
            .ok_or_else(|| corrupt(format!("bad pointer width {}", buf[10])))?;
        let flags = buf[11];
        let region_count = u32::from_le_bytes(buf[12..16].try_into().expect("header sized"));
        let pair_count = u64::from_le_bytes(buf[16..24].try_into().expect("header sized"));

        let mut pos = HEADER_LEN as usize;
        let mut regions = Vec::with_capacity(region_count as usize);
        for _ in 0..region_count {
            let rec = buf.get(pos..pos + 18).ok_or_else(|| corrupt("truncated region table"))?;
            let start = u64::from_le_bytes(rec[..8].try_into().expect("record sized"));
            let end = u64::from_le_bytes(rec[8..16].try_into().expect("record sized"));
            let path_len = u16::from_le_bytes(rec[16..18].try_into().expect("record sized")) as usize;
            if end <= start {
                return Err(corrupt(format!("inverted region {start:#x}-{end:#x}")));
            }
            let path = buf
                .get(pos + 18..pos + 18 + path_len)
                .ok_or_else(|| corrupt("truncated region path"))?;
            let path = std::str::from_utf8(path).map_err(|_| corrupt("region path is not UTF-8"))?;
            regions.push(Region::new(start, end, path, Default::default()));
            pos += 18 + path_len;
        }
        let regions =
            RegionSet::from_sorted(regions).ok_or_else(|| corrupt("region table not ascending"))?;

        let pair_bytes = 2 * width.bytes() as u64;
        let expected = pair_count
            .checked_mul(pair_bytes)
            .and_then(|n| n.checked_add(pos as u64))
            .ok_or_else(|| corrupt(format!("absurd pair count {pair_count}")))?;
        if buf.len() as u64 != expected {
            return Err(corrupt(format!(
                "pair count {pair_count} inconsistent with file size ({} != {expected})",
                buf.len()
            )));
        }

        let pair_count = pair_count as usize;
        let mut reverse = Vec::with_capacity(pair_count);
        let mut prev_src = None;
        for i in 0..pair_count {
            let (src, dst) = decode_pair(&buf[pos..], i, width);
            if src % width.bytes() as u64 != 0 {
                return Err(corrupt(format!("unaligned source {src:#x}")));
            }
            if prev_src.is_some_and(|p| p >= src) {
                return Err(corrupt(format!("pair stream not ascending at {src:#x}")));
            }
            prev_src = Some(src);
            if !regions.contains(src) || !regions.contains(dst) {
                return Err(corrupt(format!("pair {src:#x} -> {dst:#x} outside region table")));
            }
            reverse.push((dst, src));
        }
        reverse.sort_unstable();

        Ok(Self { backing, pairs_offset: pos, width, flags, regions, pair_count, reverse })
    }

    pub fn width(&self) -> PtrWidth {
        self.width
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn pair_count(&self) -> usize {
        self.pair_count
    }

    /// The region table, in the order it was dumped.
    pub fn regions(&self) -> &[Region] {
        self.regions.as_slice()
    }

    /// Anchor lookup: every region whose path matches exactly.
    pub fn regions_by_path(&self, path: &str) -> Vec<&Region> {
        self.regions.by_path(path)
    }

    pub fn contains(&self, addr: u64) -> bool {
        self.regions.contains(addr)
    }

    /// The recorded word at `src`, following the map rather than the live
    /// process. O(log n) over the ascending pair stream.
    pub fn forward_lookup(&self, src: u64) -> Option<u64> {
        let stream = &self.backing.as_bytes()[self.pairs_offset..];
        let mut lo = 0usize;
        let mut hi = self.pair_count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let (s, d) = decode_pair(stream, mid, self.width);
            match s.cmp(&src) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => return Some(d),
            }
        }
        None
    }

    /// All `(dst, src)` pairs with `lo <= dst <= hi`, ascending by `dst`
    /// then `src`. O(log n) to locate, O(k) to walk.
    pub fn range_query(&self, lo: u64, hi: u64) -> &[(u64, u64)] {
        let from = self.reverse.partition_point(|&(d, _)| d < lo);
        let to = self.reverse.partition_point(|&(d, _)| d <= hi);
        &self.reverse[from..to]
    }
}

fn decode_pair(stream: &[u8], index: usize, width: PtrWidth) -> (u64, u64) {
    let w = width.bytes();
    let at = index * 2 * w;
    let word = |off: usize| match width {
        PtrWidth::U32 => u64::from(u32::from_le_bytes(stream[off..off + 4].try_into().expect("pair sized"))),
        PtrWidth::U64 => u64::from_le_bytes(stream[off..off + 8].try_into().expect("pair sized")),
    };
    (word(at), word(at + w))
}

fn corrupt(msg: impl Into<String>) -> ScanError {
    ScanError::Corrupt(msg.into())
}
