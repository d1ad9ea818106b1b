//! Pointer-map builder: scan a process's readable regions and persist every
//! word that lands inside a known region as a `(src, dst)` pair.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use crate::error::{Result, ScanError};
use crate::reader::ProcessReader;
use crate::region::RegionSet;

pub const MAGIC: [u8; 8] = *b"PTRSX\0\0\0";
pub const FORMAT_VERSION: u16 = 1;
/// magic + version + width + flags + region_count + pair_count
pub const HEADER_LEN: u64 = 8 + 2 + 1 + 1 + 4 + 8;
/// Byte offset of the backpatched pair count inside the header.
const PAIR_COUNT_OFFSET: u64 = 16;

/// Header flag: only data-like regions were scanned for sources.
pub const FLAG_DATA_ONLY: u8 = 0x01;

const CHUNK_LEN: usize = 64 * 1024;

/// Pointer width of the dumped process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtrWidth {
    U32,
    U64,
}

impl PtrWidth {
    pub fn bytes(self) -> usize {
        match self {
            PtrWidth::U32 => 4,
            PtrWidth::U64 => 8,
        }
    }

    pub fn from_bytes(n: u8) -> Option<Self> {
        match n {
            4 => Some(PtrWidth::U32),
            8 => Some(PtrWidth::U64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DumpOptions {
    pub width: PtrWidth,
    /// Restrict the scanned subset to data-like regions (heap, stack,
    /// anonymous, writable file-backed). Pointer destinations are still
    /// validated against the full readable set.
    pub align_only: bool,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self { width: PtrWidth::U64, align_only: true }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DumpStats {
    pub regions_scanned: usize,
    /// Regions that vanished or failed to read mid-scan; the dump stays valid.
    pub regions_skipped: usize,
    pub bytes_scanned: u64,
    pub pairs: u64,
}

/// Scan `reader` and stream a pointer map to `out`.
///
/// The region table records the full readable set; pairs are emitted in
/// ascending `src` order and never held in memory. The header's pair count
/// is backpatched once the stream is complete.
pub fn write_pointer_map<R, W>(reader: &R, opts: &DumpOptions, out: W) -> Result<DumpStats>
where
    R: ProcessReader + ?Sized,
    W: Write + Seek,
{
    let table = RegionSet::new(reader.list_regions()?);
    if table.is_empty() {
        return Err(ScanError::InvalidArgument("process has no readable regions".into()));
    }

    let mut w = BufWriter::new(out);
    write_header(&mut w, opts, table.len() as u32, 0)?;
    for region in table.as_slice() {
        w.write_all(&region.start.to_le_bytes())?;
        w.write_all(&region.end.to_le_bytes())?;
        let path = region.path.as_bytes();
        w.write_all(&(path.len() as u16).to_le_bytes())?;
        w.write_all(path)?;
    }

    let width = opts.width.bytes() as u64;
    let mut stats = DumpStats::default();
    let mut buf = vec![0u8; CHUNK_LEN];

    for region in table.as_slice() {
        if opts.align_only && !region.is_data() {
            continue;
        }
        // 4-byte dumps only cover the low 4 GiB.
        if opts.width == PtrWidth::U32 && region.end > u64::from(u32::MAX) {
            continue;
        }

        stats.regions_scanned += 1;
        let mut addr = region.start.next_multiple_of(width);
        let mut truncated = false;

        while addr < region.end && !truncated {
            let want = CHUNK_LEN.min((region.end - addr) as usize);
            let got = match reader.read_at(addr, &mut buf[..want]) {
                Ok(n) => n,
                Err(e) => {
                    log::warn!("region {:#x}-{:#x} ({}) unreadable at {addr:#x}: {e}", region.start, region.end, region.path);
                    stats.regions_skipped += 1;
                    break;
                }
            };
            if got < want {
                // The tail of the mapping is gone; keep what we read.
                stats.regions_skipped += 1;
                truncated = true;
            }
            stats.bytes_scanned += got as u64;

            let mut off = 0;
            while off + width as usize <= got {
                let value = read_word(&buf[off..], opts.width);
                if table.contains(value) {
                    let src = addr + off as u64;
                    write_word(&mut w, src, opts.width)?;
                    write_word(&mut w, value, opts.width)?;
                    stats.pairs += 1;
                }
                off += width as usize;
            }
            addr += want as u64;
        }
    }

    let mut out = w.into_inner().map_err(|e| ScanError::Io(e.into_error()))?;
    out.seek(SeekFrom::Start(PAIR_COUNT_OFFSET))?;
    out.write_all(&stats.pairs.to_le_bytes())?;
    out.flush()?;

    Ok(stats)
}

/// Dump straight to a freshly created file at `path`.
pub fn dump_to_file<R>(reader: &R, opts: &DumpOptions, path: &Path) -> Result<DumpStats>
where
    R: ProcessReader + ?Sized,
{
    let file = File::create(path)?;
    write_pointer_map(reader, opts, file)
}

fn write_header<W: Write>(w: &mut W, opts: &DumpOptions, region_count: u32, pair_count: u64) -> Result<()> {
    w.write_all(&MAGIC)?;
    w.write_all(&FORMAT_VERSION.to_le_bytes())?;
    w.write_all(&[opts.width.bytes() as u8])?;
    let flags = if opts.align_only { FLAG_DATA_ONLY } else { 0 };
    w.write_all(&[flags])?;
    w.write_all(&region_count.to_le_bytes())?;
    w.write_all(&pair_count.to_le_bytes())?;
    Ok(())
}

fn read_word(buf: &[u8], width: PtrWidth) -> u64 {
    match width {
        PtrWidth::U32 => u64::from(u32::from_le_bytes(buf[..4].try_into().expect("width checked"))),
        PtrWidth::U64 => u64::from_le_bytes(buf[..8].try_into().expect("width checked")),
    }
}

fn write_word<W: Write>(w: &mut W, value: u64, width: PtrWidth) -> Result<()> {
    match width {
        PtrWidth::U32 => w.write_all(&(value as u32).to_le_bytes())?,
        PtrWidth::U64 => w.write_all(&value.to_le_bytes())?,
    }
    Ok(())
}
