use super::compressed_writer::CompressedWriter;
use super::trace_frame::{FrameTime, TraceFrame};
use super::trace_stream::*;
use crate::event::Event;
use crate::extra_registers::ExtraRegisters;
use crate::log::LogLevel::LogInfo;
use crate::registers::Registers;
use crate::session::address_space::kernel_mapping::KernelMapping;
use crate::ticks::Ticks;
use crate::util::{trace_save_dir, write_all};
use libc::pid_t;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use std::ffi::{OsStr, OsString};
use std::io::Write;
use std::mem::size_of;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

#[repr(C)]
#[derive(Copy, Clone)]
struct RawDataHeader {
    addr: u64,
    rec_tid: i32,
    len: u32,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct MappingHeader {
    time: u64,
    start: u64,
    end: u64,
    device: u64,
    inode: u64,
    offset: u64,
    contents_len: u64,
    prot: i32,
    flags: i32,
    source: u32,
    fsname_len: u32,
}

/// Writes one recording. Assigns `global_time` to frames as they are
/// produced; by construction frames land in the events stream strictly
/// ordered by it.
pub struct TraceWriter {
    dir: PathBuf,
    /// Time of the last frame written; the next frame gets time + 1.
    global_time: FrameTime,
    events: CompressedWriter,
    data: CompressedWriter,
    mmaps: CompressedWriter,
    /// Running byte offset into the (uncompressed) data stream.
    data_offset: u64,
    closed: bool,
}

impl TraceWriter {
    /// Create `<trace root>/<exe basename>-<n>` with the first free n, and
    /// point the `latest-trace` symlink at it.
    pub fn new(exe_path: &OsStr) -> TraceWriter {
        let base = Path::new(exe_path)
            .file_name()
            .unwrap_or_else(|| OsStr::new("unknown"))
            .to_os_string();
        let root = trace_save_dir();
        let mut dir = PathBuf::new();
        for n in 0.. {
            dir = root.join(format!("{}-{}", base.to_string_lossy(), n));
            if std::fs::create_dir(&dir).is_ok() {
                break;
            }
        }

        // The version file is written first and plain so even a truncated
        // trace identifies itself.
        let version_file = version_path(&dir);
        let fd = crate::scoped_fd::ScopedFd::open_path_with_mode(
            version_file.as_os_str(),
            OFlag::O_CLOEXEC | OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_EXCL,
            Mode::S_IRUSR | Mode::S_IWUSR,
        );
        write_all(fd.as_raw(), format!("{}\n", TRACE_VERSION).as_bytes());

        let events = CompressedWriter::create(substream_path(&dir, Substream::Events).as_os_str());
        let data = CompressedWriter::create(substream_path(&dir, Substream::RawData).as_os_str());
        let mmaps = CompressedWriter::create(substream_path(&dir, Substream::Mmaps).as_os_str());

        let latest = root.join("latest-trace");
        let _ = std::fs::remove_file(&latest);
        if let Err(e) = symlink(&dir, &latest) {
            log!(LogInfo, "Can't update latest-trace symlink: {:?}", e);
        }

        log!(LogInfo, "Saving execution to trace directory {:?}", dir);

        TraceWriter {
            dir,
            global_time: 0,
            events,
            data,
            mmaps,
            data_offset: 0,
            closed: false,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn time(&self) -> FrameTime {
        self.global_time
    }

    /// Append one frame and its payload records. Returns the global time
    /// assigned to the frame.
    pub fn write_frame(
        &mut self,
        tid: pid_t,
        event: Event,
        regs: &Registers,
        extra_regs: &ExtraRegisters,
        ticks: Ticks,
        raw: &[RawDataRecord],
    ) -> FrameTime {
        self.global_time += 1;

        let data_offset = self.data_offset;
        let mut data_len: u64 = 0;
        for rec in raw {
            let header = RawDataHeader {
                addr: rec.addr as u64,
                rec_tid: rec.rec_tid,
                len: rec.data.len() as u32,
            };
            let header_bytes: [u8; size_of::<RawDataHeader>()] =
                unsafe { std::mem::transmute(header) };
            self.data.write_all(&header_bytes).unwrap_or_else(|e| {
                fatal!("Can't write data stream: {:?}", e);
            });
            self.data.write_all(&rec.data).unwrap_or_else(|e| {
                fatal!("Can't write data stream: {:?}", e);
            });
            data_len += (size_of::<RawDataHeader>() + rec.data.len()) as u64;
        }
        self.data_offset += data_len;

        let frame = TraceFrame {
            time: self.global_time,
            tid,
            event,
            ticks,
            regs: *regs,
            extra_regs: *extra_regs,
            data_offset,
            data_len: data_len as u32,
        };
        self.events
            .write_all(&frame.to_wire_bytes())
            .unwrap_or_else(|e| {
                fatal!("Can't write events stream: {:?}", e);
            });
        self.global_time
    }

    /// Record a mapping, optionally with a snapshot of its contents.
    pub fn write_mapping(
        &mut self,
        km: &KernelMapping,
        source: MappedDataSource,
        time: FrameTime,
        contents: Option<&[u8]>,
    ) {
        let fsname = km.fsname().as_bytes();
        let contents_len = contents.map_or(0, |c| c.len());
        let header = MappingHeader {
            time,
            start: km.start().as_usize() as u64,
            end: km.end().as_usize() as u64,
            device: km.device(),
            inode: km.inode() as u64,
            offset: km.file_offset_bytes(),
            contents_len: contents_len as u64,
            prot: km.prot(),
            flags: km.flags(),
            source: source as u32,
            fsname_len: fsname.len() as u32,
        };
        let header_bytes: [u8; size_of::<MappingHeader>()] = unsafe { std::mem::transmute(header) };
        let res = self
            .mmaps
            .write_all(&header_bytes)
            .and_then(|_| self.mmaps.write_all(fsname))
            .and_then(|_| self.mmaps.write_all(contents.unwrap_or(&[])));
        if let Err(e) = res {
            fatal!("Can't write mmaps stream: {:?}", e);
        }
    }

    /// Save the original invocation so replay can identify and re-exec it.
    pub fn write_args_env(
        &mut self,
        exe: &OsStr,
        argv: &[OsString],
        envp: &[OsString],
        cwd: &OsStr,
    ) {
        let mut out: Vec<u8> = Vec::new();
        put_os_bytes(&mut out, exe.as_bytes());
        put_os_bytes(&mut out, cwd.as_bytes());
        put_u32(&mut out, argv.len() as u32);
        for a in argv {
            put_os_bytes(&mut out, a.as_bytes());
        }
        put_u32(&mut out, envp.len() as u32);
        for e in envp {
            put_os_bytes(&mut out, e.as_bytes());
        }
        if let Err(e) = std::fs::write(args_env_path(&self.dir), out) {
            fatal!("Can't write args_env: {:?}", e);
        }
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.events.close(true);
        self.data.close(true);
        self.mmaps.close(true);
        if !(self.events.good() && self.data.good() && self.mmaps.good()) {
            fatal!("Trace stream write failed; trace {:?} is incomplete", self.dir);
        }
        self.closed = true;
    }
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_os_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

/// The command line and environment of a recording.
#[derive(Clone, Default)]
pub struct ArgsEnv {
    pub exe: OsString,
    pub cwd: OsString,
    pub argv: Vec<OsString>,
    pub envp: Vec<OsString>,
}

pub fn parse_args_env(bytes: &[u8]) -> Option<ArgsEnv> {
    let mut pos = 0usize;
    let exe = get_os_bytes(bytes, &mut pos)?;
    let cwd = get_os_bytes(bytes, &mut pos)?;
    let argc = get_u32(bytes, &mut pos)? as usize;
    let mut argv = Vec::with_capacity(argc);
    for _ in 0..argc {
        argv.push(get_os_bytes(bytes, &mut pos)?);
    }
    let envc = get_u32(bytes, &mut pos)? as usize;
    let mut envp = Vec::with_capacity(envc);
    for _ in 0..envc {
        envp.push(get_os_bytes(bytes, &mut pos)?);
    }
    Some(ArgsEnv {
        exe,
        cwd,
        argv,
        envp,
    })
}

fn get_u32(bytes: &[u8], pos: &mut usize) -> Option<u32> {
    if *pos + 4 > bytes.len() {
        return None;
    }
    let mut v = [0u8; 4];
    v.copy_from_slice(&bytes[*pos..*pos + 4]);
    *pos += 4;
    Some(u32::from_le_bytes(v))
}

fn get_os_bytes(bytes: &[u8], pos: &mut usize) -> Option<OsString> {
    let len = get_u32(bytes, pos)? as usize;
    if *pos + len > bytes.len() {
        return None;
    }
    let s = OsString::from_vec(bytes[*pos..*pos + len].to_vec());
    *pos += len;
    Some(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn args_env_roundtrip() {
        let mut out = Vec::new();
        put_os_bytes(&mut out, b"/bin/prog");
        put_os_bytes(&mut out, b"/home/u");
        put_u32(&mut out, 2);
        put_os_bytes(&mut out, b"prog");
        put_os_bytes(&mut out, b"--flag");
        put_u32(&mut out, 1);
        put_os_bytes(&mut out, b"PATH=/bin");

        let parsed = parse_args_env(&out).unwrap();
        assert_eq!(OsString::from("/bin/prog"), parsed.exe);
        assert_eq!(2, parsed.argv.len());
        assert_eq!(OsString::from("--flag"), parsed.argv[1]);
        assert_eq!(1, parsed.envp.len());
    }

    #[test]
    fn args_env_truncation_rejected() {
        let mut out = Vec::new();
        put_os_bytes(&mut out, b"/bin/prog");
        out.truncate(out.len() - 2);
        assert!(parse_args_env(&out).is_none());
    }
}
