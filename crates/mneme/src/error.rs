//! Error types, separated by pipeline stage.
//!
//! Keeping setup, recording, and reading failures distinct lets callers
//! handle user feedback and recovery policies accurately without string
//! matching. Hook-path failures never surface as errors at all: the
//! tracker deactivates itself and the host program keeps running.

use std::{fmt, io, path::PathBuf};

use crate::wire::WireError;

/// Error starting or closing a tracker.
#[derive(Debug)]
pub enum TrackerError {
    /// Another tracker is already installed in this process.
    AlreadyActive,
    /// The capture file exists and overwrite was not requested.
    OutputExists(PathBuf),
    /// The sink could not be opened or written.
    Io(io::Error),
    /// Tracking was deactivated mid-run (recording failure); the capture
    /// is truncated but readable up to the failure point.
    Deactivated,
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyActive => write!(f, "a tracker is already active in this process"),
            Self::OutputExists(path) => {
                write!(f, "output file {} already exists (pass overwrite to replace it)", path.display())
            }
            Self::Io(error) => write!(f, "capture i/o error: {error}"),
            Self::Deactivated => write!(f, "tracking was deactivated after a recording failure"),
        }
    }
}

impl std::error::Error for TrackerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(error) => Some(error),
            _ => None,
        }
    }
}

impl From<io::Error> for TrackerError {
    fn from(error: io::Error) -> Self {
        Self::Io(error)
    }
}

/// Structural failure while reading a capture.
///
/// `offset` is the position of the offending record in the logical record
/// stream: bytes from the start of the file for plain captures, bytes of
/// decompressed body (plus header length) for compressed ones.
#[derive(Debug)]
pub struct ReadError {
    pub kind: ReadErrorKind,
    pub offset: u64,
}

#[derive(Debug)]
pub enum ReadErrorKind {
    Io(io::Error),
    /// Malformed bytes: unknown tag, bad varint, payload mismatch, or a
    /// malformed header.
    Wire(WireError),
    /// A `FRAME_POP` would underflow the replayed stack of this thread.
    PopUnderflow { tid: u64 },
    /// A `FRAME_POP` with count zero.
    EmptyPop,
    /// A frame push or allocation referenced a code id never defined.
    UnknownCodeId(u32),
    /// An allocation referenced a native frame id never defined.
    UnknownNativeId(u32),
    /// A record that is meaningless where it appeared (e.g. a
    /// thread-scoped record before any `CONTEXT_SWITCH`).
    UnexpectedRecord(&'static str),
    /// The requested analysis needs per-event records but the capture is
    /// pre-aggregated.
    WrongFileFormat(&'static str),
}

impl ReadError {
    #[must_use]
    pub fn new(kind: ReadErrorKind, offset: u64) -> Self {
        Self { kind, offset }
    }
}

impl fmt::Display for ReadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            ReadErrorKind::Io(error) => write!(f, "i/o error at offset {}: {error}", self.offset),
            ReadErrorKind::Wire(error) => write!(f, "corrupt record at offset {}: {error}", self.offset),
            ReadErrorKind::PopUnderflow { tid } => {
                write!(f, "frame pop underflows the stack of thread {tid} at offset {}", self.offset)
            }
            ReadErrorKind::EmptyPop => write!(f, "frame pop with count zero at offset {}", self.offset),
            ReadErrorKind::UnknownCodeId(id) => {
                write!(f, "reference to unknown code object {id} at offset {}", self.offset)
            }
            ReadErrorKind::UnknownNativeId(id) => {
                write!(f, "reference to unknown native frame {id} at offset {}", self.offset)
            }
            ReadErrorKind::UnexpectedRecord(what) => write!(f, "{what} at offset {}", self.offset),
            ReadErrorKind::WrongFileFormat(what) => write!(f, "{what}"),
        }
    }
}

impl std::error::Error for ReadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            ReadErrorKind::Io(error) => Some(error),
            ReadErrorKind::Wire(error) => Some(error),
            _ => None,
        }
    }
}

/// How a capture stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// The trailer was present; the capture is complete.
    Complete,
    /// The stream ended before the trailer (the traced process exited
    /// without teardown, or the file was cut short). Every record that
    /// fully parsed was still delivered.
    Truncated,
}
