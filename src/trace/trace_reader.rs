use super::compressed_reader::CompressedReader;
use super::trace_frame::{FrameTime, TraceFrame, FRAME_WIRE_SIZE};
use super::trace_stream::*;
use super::trace_writer::{parse_args_env, ArgsEnv};
use super::TraceError;
use crate::session::address_space::kernel_mapping::KernelMapping;
use crate::session::address_space::memory_range::MemoryRange;
use crate::util::trace_save_dir;
use std::convert::TryInto;
use std::ffi::OsString;
use std::mem::size_of;
use std::os::unix::ffi::OsStringExt;
use std::path::{Path, PathBuf};

/// A mapping record from the mmaps stream.
pub struct TraceMapping {
    pub time: FrameTime,
    pub map: KernelMapping,
    pub source: MappedDataSource,
    pub contents: Vec<u8>,
}

/// Reads one recording back, in frame order. All corruption is surfaced
/// as `TraceError`; no partial replay is attempted past it.
pub struct TraceReader {
    dir: PathBuf,
    events: CompressedReader,
    data: CompressedReader,
    mmaps: CompressedReader,
    /// Current byte position in the (uncompressed) data stream.
    data_pos: u64,
    args_env: ArgsEnv,
    /// Time of the most recently read frame.
    time: FrameTime,
}

impl TraceReader {
    /// Open `dir`, or the most recent trace when `dir` is None.
    pub fn open(dir: Option<&Path>) -> Result<TraceReader, TraceError> {
        let dir: PathBuf = match dir {
            Some(d) => d.to_path_buf(),
            None => trace_save_dir().join("latest-trace"),
        };
        let dir = std::fs::canonicalize(&dir)?;

        let version_text = std::fs::read_to_string(version_path(&dir))?;
        let found: u32 = version_text
            .trim()
            .parse()
            .map_err(|_| TraceError::Corrupt("unparseable version file".into()))?;
        if found != TRACE_VERSION {
            return Err(TraceError::VersionMismatch {
                found,
                expected: TRACE_VERSION,
            });
        }

        let events = CompressedReader::open(substream_path(&dir, Substream::Events).as_os_str())?;
        let data = CompressedReader::open(substream_path(&dir, Substream::RawData).as_os_str())?;
        let mmaps = CompressedReader::open(substream_path(&dir, Substream::Mmaps).as_os_str())?;

        let args_env_bytes = std::fs::read(args_env_path(&dir))?;
        let args_env = parse_args_env(&args_env_bytes)
            .ok_or_else(|| TraceError::Corrupt("args_env fails to parse".into()))?;

        Ok(TraceReader {
            dir,
            events,
            data,
            mmaps,
            data_pos: 0,
            args_env,
            time: 0,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn args_env(&self) -> &ArgsEnv {
        &self.args_env
    }

    pub fn time(&self) -> FrameTime {
        self.time
    }

    /// Next frame plus its payload records; None at end of trace.
    pub fn read_frame(
        &mut self,
    ) -> Result<Option<(TraceFrame, Vec<RawDataRecord>)>, TraceError> {
        let mut bytes = [0u8; FRAME_WIRE_SIZE];
        if !self.events.read_exact(&mut bytes)? {
            return Ok(None);
        }
        let frame = TraceFrame::from_wire_bytes(&bytes)?;
        if frame.time <= self.time {
            return Err(TraceError::Corrupt(format!(
                "frame times not monotonic ({} after {})",
                frame.time, self.time
            )));
        }
        self.time = frame.time;

        let raw = self.read_raw_records(&frame)?;
        Ok(Some((frame, raw)))
    }

    fn read_raw_records(&mut self, frame: &TraceFrame) -> Result<Vec<RawDataRecord>, TraceError> {
        if frame.data_len == 0 {
            return Ok(Vec::new());
        }
        if frame.data_offset < self.data_pos {
            return Err(TraceError::Corrupt(
                "frame data offset points backwards".into(),
            ));
        }
        if frame.data_offset > self.data_pos {
            // Frames can be dropped by post-processing tools; their payload
            // bytes stay in the stream.
            self.data
                .skip((frame.data_offset - self.data_pos).try_into().unwrap())?;
            self.data_pos = frame.data_offset;
        }

        let mut raw = Vec::new();
        let mut consumed: u64 = 0;
        while consumed < frame.data_len as u64 {
            let mut header_bytes = [0u8; 16];
            if !self.data.read_exact(&mut header_bytes)? {
                return Err(TraceError::TruncatedChunk);
            }
            let addr = u64::from_le_bytes(header_bytes[0..8].try_into().unwrap());
            let rec_tid = i32::from_le_bytes(header_bytes[8..12].try_into().unwrap());
            let len = u32::from_le_bytes(header_bytes[12..16].try_into().unwrap());
            if consumed + 16 + len as u64 > frame.data_len as u64 {
                return Err(TraceError::Corrupt("raw record overruns frame".into()));
            }
            let mut data = vec![0u8; len as usize];
            if !self.data.read_exact(&mut data)? {
                return Err(TraceError::TruncatedChunk);
            }
            consumed += 16 + len as u64;
            raw.push(RawDataRecord {
                addr: addr as usize,
                rec_tid,
                data,
            });
        }
        self.data_pos += consumed;
        Ok(raw)
    }

    /// Next mapping record; None at end of the mmaps stream. Records are
    /// consumed in the order recording wrote them.
    pub fn read_mapping(&mut self) -> Result<Option<TraceMapping>, TraceError> {
        let mut header_bytes = [0u8; 72];
        if !self.mmaps.read_exact(&mut header_bytes)? {
            return Ok(None);
        }
        let get_u64 = |o: usize| u64::from_le_bytes(header_bytes[o..o + 8].try_into().unwrap());
        let get_i32 = |o: usize| i32::from_le_bytes(header_bytes[o..o + 4].try_into().unwrap());
        let get_u32 = |o: usize| u32::from_le_bytes(header_bytes[o..o + 4].try_into().unwrap());

        let time = get_u64(0);
        let start = get_u64(8);
        let end = get_u64(16);
        let device = get_u64(24);
        let inode = get_u64(32);
        let offset = get_u64(40);
        let contents_len = get_u64(48);
        let prot = get_i32(56);
        let flags = get_i32(60);
        let source = MappedDataSource::from_raw(get_u32(64))
            .ok_or_else(|| TraceError::Corrupt("bad mapping source".into()))?;
        let fsname_len = get_u32(68);

        if end < start {
            return Err(TraceError::Corrupt("mapping with negative size".into()));
        }

        let mut fsname_bytes = vec![0u8; fsname_len as usize];
        if !self.mmaps.read_exact(&mut fsname_bytes)? {
            return Err(TraceError::TruncatedChunk);
        }
        let mut contents = vec![0u8; contents_len as usize];
        if !self.mmaps.read_exact(&mut contents)? {
            return Err(TraceError::TruncatedChunk);
        }

        let map = KernelMapping::new(
            MemoryRange::from_range(start as usize, end as usize),
            &OsString::from_vec(fsname_bytes),
            device,
            inode,
            prot,
            flags,
            offset,
        );
        Ok(Some(TraceMapping {
            time,
            map,
            source,
            contents,
        }))
    }
}

const_assert_eq!(72, 7 * size_of::<u64>() + 2 * size_of::<i32>() + 2 * size_of::<u32>());
