use libc::pid_t;
use std::path::{Path, PathBuf};

/// Bump on any incompatible change to the container layout or frame
/// encoding.
pub const TRACE_VERSION: u32 = 1;

/// Update `substream_name` when you update this list.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(usize)]
pub enum Substream {
    /// Fixed-size event frames.
    Events = 0,
    /// Variable-length syscall payload records.
    RawData = 1,
    /// Metadata about every mapping observed during recording.
    Mmaps = 2,
}

pub const SUBSTREAM_COUNT: usize = 3;

pub fn substream_name(s: Substream) -> &'static str {
    match s {
        Substream::Events => "events",
        Substream::RawData => "data",
        Substream::Mmaps => "mmaps",
    }
}

pub fn substream_path(dir: &Path, s: Substream) -> PathBuf {
    dir.join(substream_name(s))
}

pub fn version_path(dir: &Path) -> PathBuf {
    dir.join("version")
}

pub fn args_env_path(dir: &Path) -> PathBuf {
    dir.join("args_env")
}

/// One kernel-written memory region captured at a syscall exit: where it
/// lives in the tracee and how many payload bytes follow in the data
/// stream.
#[derive(Clone)]
pub struct RawDataRecord {
    pub addr: usize,
    pub rec_tid: pid_t,
    pub data: Vec<u8>,
}

/// Where replay should obtain the bytes backing a recorded mapping.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u32)]
pub enum MappedDataSource {
    /// Contents were captured into the data stream.
    SourceTrace = 0,
    /// Map the original file (unchanged since recording, e.g. executables).
    SourceFile = 1,
    /// Anonymous zero-filled; nothing to restore.
    SourceZero = 2,
}

impl MappedDataSource {
    pub fn from_raw(raw: u32) -> Option<MappedDataSource> {
        match raw {
            0 => Some(MappedDataSource::SourceTrace),
            1 => Some(MappedDataSource::SourceFile),
            2 => Some(MappedDataSource::SourceZero),
            _ => None,
        }
    }
}
