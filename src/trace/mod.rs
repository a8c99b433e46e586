//! The on-disk trace container: a directory of independently compressed,
//! append-only streams plus a couple of plain files.
//!
//! ```text
//! <trace-dir>/version    plain text, container format version
//! <trace-dir>/events     fixed-size TraceFrame records (compressed)
//! <trace-dir>/data       variable-length syscall payloads (compressed),
//!                        addressed from frames by byte offset
//! <trace-dir>/mmaps      mapping records (compressed)
//! <trace-dir>/args_env   original command line, environment, cwd
//! ```

pub mod compressed_reader;
pub mod compressed_writer;
pub mod trace_frame;
pub mod trace_reader;
pub mod trace_stream;
pub mod trace_writer;

use std::fmt;

/// Why a trace could not be read. Replay makes no attempt to continue
/// past any of these; the replay command maps them to a distinct exit
/// code.
#[derive(Debug)]
pub enum TraceError {
    /// The `version` file names a format we don't speak.
    VersionMismatch { found: u32, expected: u32 },
    /// A stream ended in the middle of a chunk or record.
    TruncatedChunk,
    /// Structurally invalid data (bad event tag, impossible sizes, ...).
    Corrupt(String),
    Io(std::io::Error),
}

impl fmt::Display for TraceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceError::VersionMismatch { found, expected } => write!(
                f,
                "trace version {} not supported (expected {})",
                found, expected
            ),
            TraceError::TruncatedChunk => write!(f, "trace stream truncated mid-chunk"),
            TraceError::Corrupt(what) => write!(f, "trace corrupt: {}", what),
            TraceError::Io(e) => write!(f, "trace I/O error: {}", e),
        }
    }
}

impl From<std::io::Error> for TraceError {
    fn from(e: std::io::Error) -> TraceError {
        TraceError::Io(e)
    }
}
