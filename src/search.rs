//! Chain search engine: a depth-bounded reverse walk from the target
//! address through the reverse pointer index, emitting every chain that
//! starts inside an anchor module.

use std::collections::HashSet;
use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::thread;
use std::time::Duration;

use rayon::prelude::*;

use crate::error::{Result, ScanError};
use crate::map::PointerIndex;

/// Offset windows wider than this make the per-step arithmetic meaningless;
/// real chains use windows of a few KiB.
const MAX_RANGE: u64 = 1 << 31;

const SINK_OPEN_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct ScanParams {
    /// The address the chains must land on (within the offset window).
    pub target: u64,
    /// Maximum number of dereference steps.
    pub depth: u32,
    /// Minimum chain length eligible for emission, `1..=depth`.
    pub min_len: u32,
    /// Positive offset window `R+`, applied at every step.
    pub range_ahead: u64,
    /// Negative offset window `R-`.
    pub range_behind: u64,
    /// Module paths chains may start in; resolved against the region table.
    pub anchors: Vec<String>,
    /// Worker count; 0 means host parallelism, 1 is the canonical
    /// single-threaded order.
    pub threads: usize,
}

impl Default for ScanParams {
    fn default() -> Self {
        Self {
            target: 0,
            depth: 7,
            min_len: 1,
            range_ahead: 0x600,
            range_behind: 0,
            anchors: Vec::new(),
            threads: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    Completed,
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct ScanStats {
    pub outcome: ScanOutcome,
    pub chains: u64,
}

/// Lifecycle of a search, observable while it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ScanState {
    Idle = 0,
    Preparing = 1,
    Searching = 2,
    Completed = 3,
    Aborted = 4,
}

impl ScanState {
    fn from_u8(v: u8) -> ScanState {
        match v {
            1 => ScanState::Preparing,
            2 => ScanState::Searching,
            3 => ScanState::Completed,
            4 => ScanState::Aborted,
            _ => ScanState::Idle,
        }
    }
}

/// Shared cancellation flag and progress counters for one search.
///
/// Cancellation is polled between frontier expansions; a cancelled run
/// finishes with [`ScanOutcome::Cancelled`] and a flushed, untruncated sink.
#[derive(Debug, Default)]
pub struct ScanControl {
    cancelled: AtomicBool,
    state: AtomicU8,
    chains: AtomicU64,
}

impl ScanControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> ScanState {
        ScanState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn chains_emitted(&self) -> u64 {
        self.chains.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: ScanState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    fn note_chain(&self) {
        self.chains.fetch_add(1, Ordering::Relaxed);
    }
}

/// An anchor region resolved to its span and path-table slot.
#[derive(Debug, Clone, Copy)]
struct AnchorSpan {
    start: u64,
    end: u64,
    path_idx: usize,
}

enum Interrupt {
    Cancelled,
    SinkFailed,
}

struct Shared<'a, W: Write> {
    sink: Mutex<W>,
    sink_error: Mutex<Option<io::Error>>,
    abort: AtomicBool,
    ctl: &'a ScanControl,
}

struct Walker<'a, W: Write> {
    index: &'a PointerIndex,
    spans: &'a [AnchorSpan],
    paths: &'a [String],
    params: &'a ScanParams,
    shared: &'a Shared<'a, W>,
    /// Depth-keyed visited set, scoped to one first-level subtree. Per-worker
    /// rather than shared: workers may redo work another subtree already did,
    /// but never contend, and chain tuples stay unique because each subtree
    /// explores a disjoint family of pair paths.
    visited: HashSet<(u64, u32)>,
    /// Offsets of the chain under construction, innermost first.
    suffix: Vec<i64>,
    line: String,
}

impl<'a, W: Write> Walker<'a, W> {
    fn new(
        index: &'a PointerIndex,
        spans: &'a [AnchorSpan],
        paths: &'a [String],
        params: &'a ScanParams,
        shared: &'a Shared<'a, W>,
    ) -> Self {
        Self {
            index,
            spans,
            paths,
            params,
            shared,
            visited: HashSet::new(),
            suffix: Vec::with_capacity(params.depth as usize),
            line: String::with_capacity(96),
        }
    }

    /// Run one first-level subtree: `src` with final offset `offset`.
    fn run_subtree(&mut self, src: u64, offset: i64) -> std::result::Result<(), Interrupt> {
        self.visited.clear();
        self.suffix.clear();
        self.suffix.push(offset);
        self.walk(src, self.params.depth - 1)
    }

    fn walk(&mut self, addr: u64, depth_left: u32) -> std::result::Result<(), Interrupt> {
        if self.shared.ctl.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        if self.shared.abort.load(Ordering::Relaxed) {
            return Err(Interrupt::SinkFailed);
        }
        debug_assert!(self.index.contains(addr), "frontier {addr:#x} outside every region");

        // A chain terminates wherever the frontier lands in an anchor; the
        // walk still continues below, because longer chains through the same
        // word are independent hits.
        if self.suffix.len() as u32 >= self.params.min_len {
            if let Some(span) = find_span(self.spans, addr) {
                self.emit(span, addr)?;
            }
        }
        if depth_left == 0 {
            return Ok(());
        }
        if !self.visited.insert((addr, depth_left)) {
            return Ok(());
        }

        let lo = addr.saturating_sub(self.params.range_ahead);
        let hi = addr.saturating_add(self.params.range_behind);
        for &(dst, src) in self.index.range_query(lo, hi) {
            let offset = addr.wrapping_sub(dst) as i64;
            self.suffix.push(offset);
            self.walk(src, depth_left - 1)?;
            self.suffix.pop();
        }
        Ok(())
    }

    fn emit(&mut self, span: AnchorSpan, addr: u64) -> std::result::Result<(), Interrupt> {
        self.line.clear();
        push_chain_line(&mut self.line, &self.paths[span.path_idx], addr - span.start, &self.suffix);

        let Ok(mut sink) = self.shared.sink.lock() else {
            self.shared.abort.store(true, Ordering::Relaxed);
            return Err(Interrupt::SinkFailed);
        };
        if let Err(e) = sink.write_all(self.line.as_bytes()) {
            drop(sink);
            if let Ok(mut slot) = self.shared.sink_error.lock() {
                slot.get_or_insert(e);
            }
            self.shared.abort.store(true, Ordering::Relaxed);
            return Err(Interrupt::SinkFailed);
        }
        drop(sink);
        self.shared.ctl.note_chain();
        Ok(())
    }
}

/// Format one output record: `<path>+<root_off>-><o1>->...-><ok>\n`, offsets
/// signed hex, innermost suffix entry printed last.
fn push_chain_line(line: &mut String, path: &str, root_off: u64, suffix: &[i64]) {
    let _ = write!(line, "{path}+{root_off:x}");
    for &offset in suffix.iter().rev() {
        if offset >= 0 {
            let _ = write!(line, "->+{offset:x}");
        } else {
            let _ = write!(line, "->-{:x}", offset.unsigned_abs());
        }
    }
    line.push('\n');
}

fn find_span(spans: &[AnchorSpan], addr: u64) -> Option<AnchorSpan> {
    let idx = spans.partition_point(|s| s.end <= addr);
    spans.get(idx).copied().filter(|s| addr >= s.start && addr < s.end)
}

fn validate(index: &PointerIndex, params: &ScanParams) -> Result<(Vec<AnchorSpan>, Vec<String>)> {
    if params.depth == 0 {
        return Err(ScanError::InvalidArgument("depth must be at least 1".into()));
    }
    if params.min_len == 0 || params.min_len > params.depth {
        return Err(ScanError::InvalidArgument(format!(
            "minimum chain length {} must be within 1..={}",
            params.min_len, params.depth
        )));
    }
    if params.range_ahead > MAX_RANGE || params.range_behind > MAX_RANGE {
        return Err(ScanError::InvalidArgument("offset window too large".into()));
    }
    if params.anchors.is_empty() {
        return Err(ScanError::InvalidArgument("anchor set is empty".into()));
    }

    let mut paths: Vec<String> = Vec::with_capacity(params.anchors.len());
    let mut spans = Vec::new();
    for anchor in &params.anchors {
        if paths.iter().any(|p| p == anchor) {
            continue;
        }
        let regions = index.regions_by_path(anchor);
        if regions.is_empty() {
            return Err(ScanError::InvalidArgument(format!(
                "anchor module {anchor:?} not found in pointer map"
            )));
        }
        let path_idx = paths.len();
        paths.push(anchor.clone());
        spans.extend(regions.iter().map(|r| AnchorSpan { start: r.start, end: r.end, path_idx }));
    }
    spans.sort_by_key(|s| s.start);
    Ok((spans, paths))
}

/// First-level frontier: every pair able to reach the target window, with
/// its canonical final offset.
///
/// The final step differs from the deeper ones: the chain may land anywhere
/// in `[target - R-, target + R+]`, so a pair qualifies when some in-window
/// offset reaches that interval, and the offset closest to an exact hit is
/// recorded. Deeper steps land exactly on the frontier address and their
/// offset is forced.
fn first_level(index: &PointerIndex, params: &ScanParams) -> Vec<(u64, i64)> {
    let reach = params.range_ahead + params.range_behind;
    let lo = params.target.saturating_sub(reach);
    let hi = params.target.saturating_add(reach);
    let window_lo = params.target as i128 - params.range_behind as i128;
    let window_hi = params.target as i128 + params.range_ahead as i128;

    let mut roots = Vec::new();
    for &(dst, src) in index.range_query(lo, hi) {
        let offset = (params.target as i128 - dst as i128)
            .clamp(-(params.range_behind as i128), params.range_ahead as i128);
        let landing = dst as i128 + offset;
        if landing >= window_lo && landing <= window_hi {
            roots.push((src, offset as i64));
        }
    }
    roots
}

/// Search `index` for pointer chains per `params`, streaming records to
/// `sink`. The emitted set is deterministic for fixed inputs; with
/// `threads == 1` the emission order is the canonical depth-first,
/// ascending-frontier order.
pub fn scan_pointer_chains<W: Write + Send>(
    index: &PointerIndex,
    params: &ScanParams,
    sink: W,
    ctl: &ScanControl,
) -> Result<ScanStats> {
    ctl.set_state(ScanState::Preparing);
    let (spans, paths) = match validate(index, params) {
        Ok(v) => v,
        Err(e) => {
            ctl.set_state(ScanState::Aborted);
            return Err(e);
        }
    };
    let roots = first_level(index, params);
    log::debug!(
        "searching {} first-level subtrees, depth {}, window +{:#x}/-{:#x}",
        roots.len(),
        params.depth,
        params.range_ahead,
        params.range_behind
    );

    ctl.set_state(ScanState::Searching);
    let shared = Shared {
        sink: Mutex::new(sink),
        sink_error: Mutex::new(None),
        abort: AtomicBool::new(false),
        ctl,
    };

    let interrupt = if params.threads == 1 {
        let mut walker = Walker::new(index, &spans, &paths, params, &shared);
        roots.iter().try_for_each(|&(src, off)| walker.run_subtree(src, off)).err()
    } else {
        let work = |&(src, off): &(u64, i64)| {
            Walker::new(index, &spans, &paths, params, &shared).run_subtree(src, off)
        };
        let pool = match build_pool(params.threads) {
            Ok(pool) => pool,
            Err(e) => {
                ctl.set_state(ScanState::Aborted);
                return Err(e);
            }
        };
        match pool {
            Some(pool) => pool.install(|| roots.par_iter().try_for_each(work)).err(),
            None => roots.par_iter().try_for_each(work).err(),
        }
    };

    let flushed = match shared.sink.lock() {
        Ok(mut sink) => sink.flush(),
        Err(_) => Err(io::Error::other("output sink poisoned")),
    };
    if let Some(e) = shared.sink_error.lock().ok().and_then(|mut slot| slot.take()) {
        ctl.set_state(ScanState::Aborted);
        return Err(ScanError::Io(e));
    }
    if let Err(e) = flushed {
        ctl.set_state(ScanState::Aborted);
        return Err(ScanError::Io(e));
    }

    let chains = ctl.chains_emitted();
    match interrupt {
        None => {
            ctl.set_state(ScanState::Completed);
            Ok(ScanStats { outcome: ScanOutcome::Completed, chains })
        }
        Some(Interrupt::Cancelled) => {
            ctl.set_state(ScanState::Aborted);
            Ok(ScanStats { outcome: ScanOutcome::Cancelled, chains })
        }
        Some(Interrupt::SinkFailed) => {
            ctl.set_state(ScanState::Aborted);
            Err(ScanError::Io(io::Error::other("output sink failed")))
        }
    }
}

/// Validate `params` first, then open `path` and run the search. Invalid
/// arguments are rejected before the output file exists.
pub fn scan_to_file(
    index: &PointerIndex,
    params: &ScanParams,
    path: &Path,
    ctl: &ScanControl,
) -> Result<ScanStats> {
    validate(index, params)?;
    let file = create_sink_with_retry(path)?;
    scan_pointer_chains(index, params, BufWriter::new(file), ctl)
}

/// `<prefix>.scandata`, the default output name for a scan.
pub fn default_scan_path(prefix: &str) -> PathBuf {
    PathBuf::from(format!("{prefix}.scandata"))
}

fn build_pool(threads: usize) -> Result<Option<rayon::ThreadPool>> {
    if threads == 0 {
        return Ok(None);
    }
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .map_err(|e| ScanError::Io(io::Error::other(e)))?;
    Ok(Some(pool))
}

/// Create the sink, retrying transient filesystem errors a few times with a
/// linear backoff before giving up.
fn create_sink_with_retry(path: &Path) -> Result<File> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match File::create(path) {
            Ok(file) => return Ok(file),
            Err(e) if attempt < SINK_OPEN_ATTEMPTS && is_transient(e.kind()) => {
                log::warn!("creating {} failed ({e}), retrying", path.display());
                thread::sleep(Duration::from_millis(25 * u64::from(attempt)));
            }
            Err(e) => return Err(ScanError::Io(e)),
        }
    }
}

fn is_transient(kind: io::ErrorKind) -> bool {
    matches!(kind, io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_line_format() {
        let mut line = String::new();
        // Suffix is innermost-first; the printed order is root to target.
        push_chain_line(&mut line, "libfoo.so", 0x10, &[0x8, 0x0, -0x20]);
        assert_eq!(line, "libfoo.so+10->-20->+0->+8\n");
    }

    #[test]
    fn test_chain_line_zero_offsets() {
        let mut line = String::new();
        push_chain_line(&mut line, "m", 0, &[0]);
        assert_eq!(line, "m+0->+0\n");
    }

    #[test]
    fn test_find_span() {
        let spans = vec![
            AnchorSpan { start: 0x1000, end: 0x2000, path_idx: 0 },
            AnchorSpan { start: 0x5000, end: 0x6000, path_idx: 1 },
        ];
        assert_eq!(find_span(&spans, 0x1000).unwrap().path_idx, 0);
        assert_eq!(find_span(&spans, 0x5fff).unwrap().path_idx, 1);
        assert!(find_span(&spans, 0x2000).is_none());
        assert!(find_span(&spans, 0x800).is_none());
    }

    #[test]
    fn test_scan_state_transitions_encoding() {
        let ctl = ScanControl::new();
        assert_eq!(ctl.state(), ScanState::Idle);
        ctl.set_state(ScanState::Searching);
        assert_eq!(ctl.state(), ScanState::Searching);
        assert!(!ctl.is_cancelled());
        ctl.cancel();
        assert!(ctl.is_cancelled());
    }

    #[test]
    fn test_default_scan_path() {
        assert_eq!(default_scan_path("session"), PathBuf::from("session.scandata"));
    }
}
