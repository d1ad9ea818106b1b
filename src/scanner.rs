//! The owned scanner handle: a loaded map plus the operations foreign
//! callers drive through it.

use std::path::Path;

use crate::error::{Result, ScanError};
use crate::map::PointerIndex;
use crate::region::Region;
use crate::search::{ScanControl, ScanParams, ScanStats, scan_to_file};

/// Owns an optionally-loaded pointer map and runs searches against it.
///
/// This is the plain-object form of the opaque handle the C ABI hands out:
/// created by an initializer, released explicitly by dropping it, no hidden
/// statics. Operations that need a map fail with [`ScanError::NotReady`]
/// until one is loaded.
#[derive(Default)]
pub struct PointerScanner {
    index: Option<PointerIndex>,
}

impl PointerScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a map file, memory-mapping its pair stream. Replaces any
    /// previously loaded map.
    pub fn load_map(&mut self, path: &Path) -> Result<()> {
        self.index = Some(PointerIndex::load(path)?);
        Ok(())
    }

    /// Load a map file fully into the heap.
    pub fn load_map_eager(&mut self, path: &Path) -> Result<()> {
        self.index = Some(PointerIndex::load_eager(path)?);
        Ok(())
    }

    /// Drop the loaded map and release its backing storage.
    pub fn unload(&mut self) {
        self.index = None;
    }

    pub fn is_loaded(&self) -> bool {
        self.index.is_some()
    }

    pub fn index(&self) -> Result<&PointerIndex> {
        self.index.as_ref().ok_or(ScanError::NotReady)
    }

    /// The loaded region table, for anchor discovery.
    pub fn modules(&self) -> Result<&[Region]> {
        Ok(self.index()?.regions())
    }

    /// Run a chain search against the loaded map, writing to `out`.
    pub fn scan(&self, params: &ScanParams, out: &Path, ctl: &ScanControl) -> Result<ScanStats> {
        scan_to_file(self.index()?, params, out, ctl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::report_error;

    #[test]
    fn test_not_ready_before_load() {
        let scanner = PointerScanner::new();
        assert!(!scanner.is_loaded());
        let err = scanner.modules().unwrap_err();
        assert!(matches!(err, ScanError::NotReady));
        assert_eq!(report_error(&err), crate::error::CODE_NO_MAP);
    }

    #[test]
    fn test_scan_without_map_is_not_ready() {
        let scanner = PointerScanner::new();
        let params = ScanParams { anchors: vec!["m".into()], ..Default::default() };
        let ctl = ScanControl::new();
        let err = scanner.scan(&params, Path::new("never.scandata"), &ctl).unwrap_err();
        assert!(matches!(err, ScanError::NotReady));
        assert!(!Path::new("never.scandata").exists());
    }
}
