//! Two-phase pointer-chain scanner.
//!
//! Phase 1 ([`dump`]) reads a live process through a [`ProcessReader`],
//! keeps every aligned word whose value lands inside a readable region, and
//! persists the result as a compact pointer-map file. Phase 2 ([`map`] +
//! [`search`]) loads that file into a [`PointerIndex`] and walks it
//! backwards from a target address, streaming every chain that starts inside
//! an anchor module to an output file.
//!
//! ```no_run
//! use ptrscan::{PointerIndex, ScanControl, ScanParams, default_scan_path};
//!
//! # fn main() -> ptrscan::Result<()> {
//! let index = PointerIndex::load("1234.ptrmap".as_ref())?;
//! let params = ScanParams {
//!     target: 0x7f80_1234_5678,
//!     anchors: vec!["/usr/lib/libgame.so".into()],
//!     ..Default::default()
//! };
//! let ctl = ScanControl::new();
//! let stats = ptrscan::scan_to_file(&index, &params, &default_scan_path("game"), &ctl)?;
//! println!("{} chains", stats.chains);
//! # Ok(())
//! # }
//! ```

// OS-specific reader backends
pub mod linux;

// Platform-independent core
pub mod dump;
pub mod error;
pub mod map;
pub mod reader;
pub mod region;
pub mod scanner;
pub mod search;

pub use dump::{DumpOptions, DumpStats, PtrWidth, dump_to_file, write_pointer_map};
pub use error::{Result, ScanError, clear_last_error, last_error, report_error};
pub use map::PointerIndex;
pub use reader::{ProcessReader, SnapshotReader};
pub use region::{Perm, Region, RegionSet};
pub use scanner::PointerScanner;
pub use search::{
    ScanControl, ScanOutcome, ScanParams, ScanState, ScanStats, default_scan_path,
    scan_pointer_chains, scan_to_file,
};

#[cfg(target_os = "linux")]
pub use linux::ProcReader;
