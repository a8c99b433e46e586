use crate::bindings::kernel::PAGE_SIZE;
use crate::scoped_fd::ScopedFd;
use nix::unistd::ftruncate;
use std::convert::TryInto;
use std::env;
use std::ffi::{CStr, CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;

pub fn page_size() -> usize {
    PAGE_SIZE
}

pub fn floor_page_size(sz: usize) -> usize {
    sz & !(page_size() - 1)
}

pub fn ceil_page_size(sz: usize) -> usize {
    (sz + page_size() - 1) & !(page_size() - 1)
}

/// Write the whole buffer, retrying on short writes and EINTR. Aborts on
/// real errors: trace output failing mid-record is not recoverable.
pub fn write_all(fd: RawFd, mut buf: &[u8]) {
    while !buf.is_empty() {
        let ret = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if ret < 0 {
            let errno = nix::errno::errno();
            if errno == libc::EINTR {
                continue;
            }
            fatal!("Can't write {} bytes", buf.len());
        }
        if ret == 0 {
            fatal!("Zero-length write, fd closed under us?");
        }
        buf = &buf[ret as usize..];
    }
}

/// Read exactly `buf.len()` bytes. Returns false on a clean EOF at offset
/// zero; a short read elsewhere aborts.
pub fn read_all(fd: RawFd, mut buf: &mut [u8]) -> bool {
    let full = buf.len();
    while !buf.is_empty() {
        let ret = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if ret < 0 {
            let errno = nix::errno::errno();
            if errno == libc::EINTR {
                continue;
            }
            fatal!("Can't read {} bytes", full);
        }
        if ret == 0 {
            if buf.len() == full {
                return false;
            }
            fatal!("Unexpected EOF with {} of {} bytes read", full - buf.len(), full);
        }
        let n = ret as usize;
        buf = &mut buf[n..];
    }
    true
}

pub fn resize_shmem_segment(fd: &ScopedFd, num_bytes: usize) {
    if let Err(e) = ftruncate(fd.as_raw(), num_bytes.try_into().unwrap()) {
        fatal!("Failed to resize shmem to {} bytes: {:?}", num_bytes, e);
    }
}

pub fn to_cstring_array(ar: &[&OsStr]) -> Vec<CString> {
    ar.iter()
        .map(|s| CString::new(s.as_bytes()).unwrap())
        .collect()
}

pub fn to_cstr_array(ar: &[CString]) -> Vec<&CStr> {
    ar.iter().map(|s| s.as_c_str()).collect()
}

/// Is syscall buffering on for this run? Controlled by
/// RETRACE_USE_SYSCALLBUF=enabled|disabled; enabled unless told otherwise.
pub fn syscallbuf_enabled() -> bool {
    match env::var("RETRACE_USE_SYSCALLBUF") {
        Ok(v) => v != "disabled",
        Err(_) => true,
    }
}

/// Directory that holds trace dirs, creating it if necessary.
pub fn trace_save_dir() -> std::path::PathBuf {
    let dir = match env::var_os("RETRACE_TRACE_DIR") {
        Some(d) => std::path::PathBuf::from(d),
        None => {
            let home = env::var_os("HOME").unwrap_or_else(|| "/tmp".into());
            let mut p = std::path::PathBuf::from(home);
            p.push(".retrace");
            p
        }
    };
    if let Err(e) = std::fs::create_dir_all(&dir) {
        fatal!("Can't create trace directory {:?}: {:?}", dir, e);
    }
    dir
}

/// Parse one line of /proc/<pid>/maps:
/// `start-end perms offset dev:dev inode  path`.
pub fn parse_proc_maps_line(line: &str) -> Option<crate::session::address_space::kernel_mapping::KernelMapping> {
    use crate::session::address_space::kernel_mapping::KernelMapping;
    use crate::session::address_space::memory_range::MemoryRange;

    let mut fields = line.split_whitespace();
    let range = fields.next()?;
    let perms = fields.next()?;
    let offset = usize::from_str_radix(fields.next()?, 16).ok()?;
    let dev = fields.next()?;
    let inode: u64 = fields.next()?.parse().ok()?;
    let path = fields.next().unwrap_or("");

    let dash = range.find('-')?;
    let start = usize::from_str_radix(&range[..dash], 16).ok()?;
    let end = usize::from_str_radix(&range[dash + 1..], 16).ok()?;

    let mut prot = 0;
    let perms_bytes = perms.as_bytes();
    if perms_bytes.first() == Some(&b'r') {
        prot |= libc::PROT_READ;
    }
    if perms_bytes.get(1) == Some(&b'w') {
        prot |= libc::PROT_WRITE;
    }
    if perms_bytes.get(2) == Some(&b'x') {
        prot |= libc::PROT_EXEC;
    }
    let mut flags = if perms_bytes.get(3) == Some(&b's') {
        libc::MAP_SHARED
    } else {
        libc::MAP_PRIVATE
    };
    if inode == 0 {
        flags |= libc::MAP_ANONYMOUS;
    }

    let colon = dev.find(':')?;
    let major = u64::from_str_radix(&dev[..colon], 16).ok()?;
    let minor = u64::from_str_radix(&dev[colon + 1..], 16).ok()?;
    let device = (major << 8) | minor;

    Some(KernelMapping::new(
        MemoryRange::from_range(start, end),
        OsStr::new(path),
        device,
        inode,
        prot,
        flags,
        offset as u64,
    ))
}

/// Snapshot a live task's memory map.
pub fn read_proc_maps(tid: libc::pid_t) -> Vec<crate::session::address_space::kernel_mapping::KernelMapping> {
    let text = match std::fs::read_to_string(format!("/proc/{}/maps", tid)) {
        Ok(t) => t,
        Err(_) => return Vec::new(),
    };
    text.lines().filter_map(parse_proc_maps_line).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proc_maps_line_parses() {
        let km = parse_proc_maps_line(
            "7f1234561000-7f1234563000 r-xp 00002000 08:01 393338  /usr/lib/libc.so.6",
        )
        .unwrap();
        assert_eq!(0x7f1234561000, km.start().as_usize());
        assert_eq!(0x2000, km.size());
        assert_eq!(libc::PROT_READ | libc::PROT_EXEC, km.prot());
        assert_eq!(0x2000, km.file_offset_bytes());
        assert_eq!(393338, km.inode());
        assert!(!km.is_shared());
        assert!(!km.is_anonymous());

        let anon = parse_proc_maps_line("7ffd1000-7ffd3000 rw-p 00000000 00:00 0").unwrap();
        assert!(anon.is_anonymous());
        assert_eq!(libc::PROT_READ | libc::PROT_WRITE, anon.prot());
    }

    #[test]
    fn page_rounding() {
        assert_eq!(0, floor_page_size(0));
        assert_eq!(0, floor_page_size(4095));
        assert_eq!(4096, floor_page_size(4096));
        assert_eq!(4096, ceil_page_size(1));
        assert_eq!(4096, ceil_page_size(4096));
        assert_eq!(8192, ceil_page_size(4097));
    }
}
