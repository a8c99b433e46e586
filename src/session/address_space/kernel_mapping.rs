use super::memory_range::MemoryRange;
use crate::remote_ptr::{RemotePtr, Void};
use std::ffi::{OsStr, OsString};
use std::fmt::{Display, Formatter, Result};

pub const NO_DEVICE: u64 = 0;
pub const NO_INODE: u64 = 0;

/// One entry of a tracee's memory map: the virtual range plus everything
/// needed to re-create the backing at replay (original path, device/inode
/// as recorded, permissions, map flags, file offset).
#[derive(Clone)]
pub struct KernelMapping {
    range: MemoryRange,
    fsname: OsString,
    device: u64,
    inode: u64,
    prot: i32,
    flags: i32,
    offset: u64,
}

impl KernelMapping {
    pub fn new(
        range: MemoryRange,
        fsname: &OsStr,
        device: u64,
        inode: u64,
        prot: i32,
        flags: i32,
        offset: u64,
    ) -> KernelMapping {
        KernelMapping {
            range,
            fsname: fsname.to_os_string(),
            device,
            inode,
            prot,
            flags,
            offset,
        }
    }

    pub fn range(&self) -> MemoryRange {
        self.range
    }

    pub fn start(&self) -> RemotePtr<Void> {
        self.range.start()
    }

    pub fn end(&self) -> RemotePtr<Void> {
        self.range.end()
    }

    pub fn size(&self) -> usize {
        self.range.size()
    }

    pub fn fsname(&self) -> &OsStr {
        &self.fsname
    }

    pub fn device(&self) -> u64 {
        self.device
    }

    pub fn inode(&self) -> u64 {
        self.inode
    }

    pub fn prot(&self) -> i32 {
        self.prot
    }

    pub fn flags(&self) -> i32 {
        self.flags
    }

    pub fn file_offset_bytes(&self) -> u64 {
        self.offset
    }

    pub fn is_anonymous(&self) -> bool {
        self.flags & libc::MAP_ANONYMOUS != 0
    }

    pub fn is_shared(&self) -> bool {
        self.flags & libc::MAP_SHARED != 0
    }

    pub fn is_file_backed(&self) -> bool {
        !self.is_anonymous() && self.inode != NO_INODE
    }

    /// Identical backing modulo address, i.e. the two can coalesce when
    /// adjacent and the file offsets line up.
    pub fn compatible_with(&self, other: &KernelMapping) -> bool {
        if self.prot != other.prot
            || self.flags != other.flags
            || self.device != other.device
            || self.inode != other.inode
            || self.fsname != other.fsname
        {
            return false;
        }
        if !self.is_file_backed() {
            return true;
        }
        // File offsets must be contiguous in the same order as addresses.
        let addr_delta = other.start().as_usize() as i64 - self.start().as_usize() as i64;
        other.offset as i64 - self.offset as i64 == addr_delta
    }

    /// The same mapping narrowed to `subrange`, offset adjusted.
    pub fn subrange(&self, subrange: MemoryRange) -> KernelMapping {
        debug_assert!(self.range.contains_range(&subrange));
        let delta = subrange.start().as_usize() - self.start().as_usize();
        KernelMapping {
            range: subrange,
            fsname: self.fsname.clone(),
            device: self.device,
            inode: self.inode,
            prot: self.prot,
            flags: self.flags,
            offset: if self.is_file_backed() {
                self.offset + delta as u64
            } else {
                self.offset
            },
        }
    }

    pub fn set_prot(&mut self, prot: i32) {
        self.prot = prot;
    }

    pub fn set_range(&mut self, range: MemoryRange) {
        self.range = range;
    }
}

impl Display for KernelMapping {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        let r = if self.prot & libc::PROT_READ != 0 { 'r' } else { '-' };
        let w = if self.prot & libc::PROT_WRITE != 0 { 'w' } else { '-' };
        let x = if self.prot & libc::PROT_EXEC != 0 { 'x' } else { '-' };
        let s = if self.is_shared() { 's' } else { 'p' };
        write!(
            f,
            "{} {}{}{}{} {:x} {}:{} {:?}",
            self.range, r, w, x, s, self.offset, self.device, self.inode, self.fsname
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn km(start: usize, end: usize, prot: i32, offset: u64) -> KernelMapping {
        KernelMapping::new(
            MemoryRange::from_range(start, end),
            OsStr::new("/lib/libc.so"),
            8,
            4242,
            prot,
            libc::MAP_PRIVATE,
            offset,
        )
    }

    #[test]
    fn coalescing_compatibility() {
        let a = km(0x1000, 0x2000, libc::PROT_READ, 0);
        let b = km(0x2000, 0x3000, libc::PROT_READ, 0x1000);
        assert!(a.compatible_with(&b));
        // Wrong offset progression.
        let c = km(0x2000, 0x3000, libc::PROT_READ, 0x2000);
        assert!(!a.compatible_with(&c));
        // Different protections never coalesce.
        let d = km(0x2000, 0x3000, libc::PROT_READ | libc::PROT_WRITE, 0x1000);
        assert!(!a.compatible_with(&d));
    }

    #[test]
    fn subrange_adjusts_offset() {
        let a = km(0x1000, 0x4000, libc::PROT_READ, 0x8000);
        let sub = a.subrange(MemoryRange::from_range(0x2000, 0x3000));
        assert_eq!(0x9000, sub.file_offset_bytes());
        assert_eq!(0x1000, sub.size());
    }
}
