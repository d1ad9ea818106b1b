//! Error taxonomy and the thread-local last-error slot consumed by the
//! C-ABI wrapper.

use std::cell::RefCell;
use std::io;

use thiserror::Error;

/// Result code returned to foreign callers on success.
pub const CODE_OK: i32 = 0;
/// Result code for rejected inputs.
pub const CODE_INVALID_ARGUMENT: i32 = -1;
/// Result code for operations that need a loaded pointer map.
pub const CODE_NO_MAP: i32 = -2;
/// Result code for everything else; the message carries the detail.
pub const CODE_INTERNAL: i32 = -3;

/// The error kinds surfaced by the dump, load, and search phases.
#[derive(Debug, Error)]
pub enum ScanError {
    /// Rejected before any work started; no side effects.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A scan was requested without a loaded pointer map.
    #[error("no pointer map loaded")]
    NotReady,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The map file failed validation at load time.
    #[error("corrupt pointer map: {0}")]
    Corrupt(String),

    /// External cancellation was observed; a distinct outcome rather than a
    /// failure, so callers can tell a completed run from an aborted one.
    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ScanError>;

impl ScanError {
    /// The integer result code for this error under the C-ABI contract.
    pub fn code(&self) -> i32 {
        match self {
            ScanError::InvalidArgument(_) => CODE_INVALID_ARGUMENT,
            ScanError::NotReady => CODE_NO_MAP,
            ScanError::Io(_) | ScanError::Corrupt(_) | ScanError::Cancelled => CODE_INTERNAL,
        }
    }
}

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

/// Store `err` in the calling thread's last-error slot and return its code.
///
/// Fatal paths call this right before handing a negative code across the
/// boundary; the message stays retrievable until the caller clears it.
pub fn report_error(err: &ScanError) -> i32 {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(err.to_string()));
    err.code()
}

/// The message recorded by the most recent [`report_error`] on this thread.
pub fn last_error() -> Option<String> {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

/// Clear this thread's last-error slot.
pub fn clear_last_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(ScanError::InvalidArgument("x".into()).code(), -1);
        assert_eq!(ScanError::NotReady.code(), -2);
        assert_eq!(ScanError::Corrupt("bad magic".into()).code(), -3);
        assert_eq!(ScanError::Cancelled.code(), -3);
        let io_err = ScanError::Io(io::Error::other("disk"));
        assert_eq!(io_err.code(), -3);
    }

    #[test]
    fn test_last_error_roundtrip() {
        clear_last_error();
        assert!(last_error().is_none());

        let code = report_error(&ScanError::NotReady);
        assert_eq!(code, CODE_NO_MAP);
        assert_eq!(last_error().as_deref(), Some("no pointer map loaded"));

        clear_last_error();
        assert!(last_error().is_none());
    }

    #[test]
    fn test_last_error_is_thread_local() {
        report_error(&ScanError::NotReady);
        let other = std::thread::spawn(|| last_error()).join().unwrap();
        assert!(other.is_none());
        clear_last_error();
    }
}
