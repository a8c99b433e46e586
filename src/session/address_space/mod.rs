//! The tracer's model of one mm: all mappings, plus installed breakpoints
//! and watchpoints. Kept authoritative by observing every
//! mmap/munmap/mprotect/mremap/brk/execve the tracee performs.
//!
//! This module is pure bookkeeping: planting a breakpoint here only
//! records it; the Task layer does the actual tracee memory writes and
//! debug-register programming. That split keeps the map algebra testable
//! without a live tracee.

pub mod kernel_mapping;
pub mod memory_range;

use crate::emu_fs::EmuFileSharedPtr;
use crate::kernel_abi::BREAKPOINT_INSTRUCTION;
use crate::remote_code_ptr::RemoteCodePtr;
use crate::remote_ptr::{RemotePtr, Void};
use kernel_mapping::KernelMapping;
use memory_range::MemoryRange;
use std::collections::{BTreeMap, HashMap};
use std::ffi::{OsStr, OsString};

/// One mapping plus its replay-side backing, if any.
#[derive(Clone)]
pub struct Mapping {
    pub map: KernelMapping,
    /// Present during replay when the mapping is backed by an emulated
    /// file.
    pub emu_file: Option<EmuFileSharedPtr>,
}

impl Mapping {
    pub fn new(map: KernelMapping) -> Mapping {
        Mapping {
            map,
            emu_file: None,
        }
    }
}

#[derive(Clone)]
struct Breakpoint {
    /// Multiple subscribers (user, internal single-step) may install at
    /// the same address; the byte is restored when the last one leaves.
    refcount: u32,
    overwritten_data: u8,
}

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum WatchType {
    WatchRead,
    WatchWrite,
    WatchReadWrite,
}

/// What the Task layer needs to program one debug register.
#[derive(Copy, Clone, Debug)]
pub struct WatchConfig {
    pub addr: RemotePtr<Void>,
    pub num_bytes: usize,
    pub kind: WatchType,
}

#[derive(Clone)]
struct Watchpoint {
    refcount: u32,
    kind: WatchType,
}

/// x86 exposes four debug-register slots.
pub const MAX_WATCHPOINTS: usize = 4;

pub struct AddressSpace {
    mem: BTreeMap<MemoryRange, Mapping>,
    breakpoints: HashMap<RemoteCodePtr, Breakpoint>,
    watchpoints: HashMap<MemoryRange, Watchpoint>,
    /// Current program break, tracked from brk().
    brk_end: RemotePtr<Void>,
    /// The exe this mm was created by.
    exe_name: OsString,
}

impl AddressSpace {
    pub fn new(exe_name: &OsStr) -> AddressSpace {
        AddressSpace {
            mem: BTreeMap::new(),
            breakpoints: HashMap::new(),
            watchpoints: HashMap::new(),
            brk_end: RemotePtr::null(),
            exe_name: exe_name.to_os_string(),
        }
    }

    pub fn exe_name(&self) -> &OsStr {
        &self.exe_name
    }

    pub fn brk_end(&self) -> RemotePtr<Void> {
        self.brk_end
    }

    pub fn set_brk_end(&mut self, addr: RemotePtr<Void>) {
        self.brk_end = addr;
    }

    /// What is mapped at `addr`?
    pub fn mapping_of(&self, addr: RemotePtr<Void>) -> Option<&Mapping> {
        // The last range starting at or before addr; compare key has max
        // end so a mapping that starts exactly at addr sorts before it.
        let probe = MemoryRange::from_range(addr.as_usize(), usize::MAX);
        let (_, m) = self.mem.range(..=probe).next_back()?;
        if m.map.range().contains(addr) {
            Some(m)
        } else {
            None
        }
    }

    pub fn has_mapping(&self, addr: RemotePtr<Void>) -> bool {
        self.mapping_of(addr).is_some()
    }

    /// All mappings intersecting `range`, in address order.
    pub fn maps_intersecting(&self, range: MemoryRange) -> Vec<KernelMapping> {
        self.mem
            .values()
            .filter(|m| m.map.range().intersects(&range))
            .map(|m| m.map.clone())
            .collect()
    }

    pub fn maps(&self) -> impl Iterator<Item = &Mapping> {
        self.mem.values()
    }

    pub fn mapping_count(&self) -> usize {
        self.mem.len()
    }

    /// Record a new mapping, evicting anything it overlaps (MAP_FIXED
    /// semantics, which is also what observing a fresh /proc map entry
    /// means), then coalescing with compatible neighbors.
    pub fn map(&mut self, km: KernelMapping, emu_file: Option<EmuFileSharedPtr>) {
        self.unmap_internal(km.range());
        let range = km.range();
        self.mem.insert(
            range,
            Mapping {
                map: km,
                emu_file,
            },
        );
        self.coalesce_around(range);
    }

    /// Forget `range`. Mappings partially covered are split.
    pub fn unmap(&mut self, range: MemoryRange) {
        self.unmap_internal(range);
    }

    fn unmap_internal(&mut self, range: MemoryRange) {
        if range.is_empty() {
            return;
        }
        let victims: Vec<MemoryRange> = self
            .mem
            .keys()
            .filter(|r| r.intersects(&range))
            .cloned()
            .collect();
        for victim in victims {
            let m = self.mem.remove(&victim).unwrap();
            if victim.start() < range.start() {
                let left = MemoryRange::from_range(
                    victim.start().as_usize(),
                    range.start().as_usize(),
                );
                let mut left_m = m.clone();
                left_m.map = m.map.subrange(left);
                self.mem.insert(left, left_m);
            }
            if range.end() < victim.end() {
                let right =
                    MemoryRange::from_range(range.end().as_usize(), victim.end().as_usize());
                let mut right_m = m.clone();
                right_m.map = m.map.subrange(right);
                self.mem.insert(right, right_m);
            }
        }
    }

    /// Apply an mprotect observation.
    pub fn protect(&mut self, addr: RemotePtr<Void>, num_bytes: usize, prot: i32) {
        let range = MemoryRange::new_range(addr, num_bytes);
        let victims: Vec<MemoryRange> = self
            .mem
            .keys()
            .filter(|r| r.intersects(&range))
            .cloned()
            .collect();
        for victim in victims {
            let m = self.mem.remove(&victim).unwrap();
            let inside = victim.intersect(&range);
            for piece in [
                MemoryRange::from_range(victim.start().as_usize(), inside.start().as_usize()),
                inside,
                MemoryRange::from_range(inside.end().as_usize(), victim.end().as_usize()),
            ]
            .iter()
            .filter(|p| !p.is_empty())
            {
                let mut piece_m = m.clone();
                piece_m.map = m.map.subrange(*piece);
                if *piece == inside {
                    piece_m.map.set_prot(prot);
                }
                self.mem.insert(*piece, piece_m);
            }
        }
        self.coalesce_around(range);
    }

    /// Apply an mremap observation.
    pub fn remap(
        &mut self,
        old_addr: RemotePtr<Void>,
        old_size: usize,
        new_addr: RemotePtr<Void>,
        new_size: usize,
    ) {
        let old_range = MemoryRange::new_range(old_addr, old_size);
        let m = match self.mapping_of(old_addr) {
            Some(m) => m.clone(),
            None => return,
        };
        self.unmap_internal(old_range);
        let new_range = MemoryRange::new_range(new_addr, new_size);
        self.unmap_internal(new_range);
        let mut new_m = m;
        new_m.map.set_range(new_range);
        self.mem.insert(new_range, new_m);
    }

    /// The copy a fork child starts with: same mappings (including any
    /// breakpoint bytes already in its memory image) and break.
    pub fn fork_copy(&self) -> AddressSpace {
        AddressSpace {
            mem: self.mem.clone(),
            breakpoints: self.breakpoints.clone(),
            watchpoints: HashMap::new(),
            brk_end: self.brk_end,
            exe_name: self.exe_name.clone(),
        }
    }

    /// An execve replaced this mm wholesale.
    pub fn post_exec(&mut self, exe_name: &OsStr) {
        self.mem.clear();
        self.breakpoints.clear();
        self.watchpoints.clear();
        self.brk_end = RemotePtr::null();
        self.exe_name = exe_name.to_os_string();
    }

    fn coalesce_around(&mut self, range: MemoryRange) {
        // Look one mapping left and right of the affected range and merge
        // runs of adjacent-compatible mappings.
        let keys: Vec<MemoryRange> = self.mem.keys().cloned().collect();
        let mut i = 0;
        while i + 1 < keys.len() {
            let a = keys[i];
            let b = keys[i + 1];
            if (a.intersects(&range)
                || b.intersects(&range)
                || a.end() == range.start()
                || b.start() == range.end())
                && a.end() == b.start()
            {
                let (ma, mb) = (self.mem[&a].clone(), self.mem[&b].clone());
                let same_emu = match (&ma.emu_file, &mb.emu_file) {
                    (None, None) => true,
                    (Some(x), Some(y)) => std::rc::Rc::ptr_eq(x, y),
                    _ => false,
                };
                if ma.map.compatible_with(&mb.map) && same_emu {
                    self.mem.remove(&a);
                    self.mem.remove(&b);
                    let merged_range =
                        MemoryRange::from_range(a.start().as_usize(), b.end().as_usize());
                    let mut merged = ma.clone();
                    merged.map.set_range(merged_range);
                    self.mem.insert(merged_range, merged);
                    return self.coalesce_around(range);
                }
            }
            i += 1;
        }
    }

    // --- breakpoints ---

    /// Register a breakpoint at `addr` whose site currently holds
    /// `original_byte`. Returns true when the caller must write the int3
    /// byte (first subscriber).
    pub fn plant_breakpoint(&mut self, addr: RemoteCodePtr, original_byte: u8) -> bool {
        match self.breakpoints.get_mut(&addr) {
            Some(bp) => {
                bp.refcount += 1;
                false
            }
            None => {
                self.breakpoints.insert(
                    addr,
                    Breakpoint {
                        refcount: 1,
                        overwritten_data: original_byte,
                    },
                );
                true
            }
        }
    }

    /// Drop one subscription; Some(byte) means the caller must restore the
    /// original byte (last subscriber left).
    pub fn erase_breakpoint(&mut self, addr: RemoteCodePtr) -> Option<u8> {
        let bp = self.breakpoints.get_mut(&addr)?;
        bp.refcount -= 1;
        if bp.refcount == 0 {
            let byte = bp.overwritten_data;
            self.breakpoints.remove(&addr);
            Some(byte)
        } else {
            None
        }
    }

    pub fn has_breakpoint(&self, addr: RemoteCodePtr) -> bool {
        self.breakpoints.contains_key(&addr)
    }

    pub fn breakpoint_addrs(&self) -> Vec<RemoteCodePtr> {
        self.breakpoints.keys().cloned().collect()
    }

    /// Tracees must never observe int3 bytes when reading their own text:
    /// patch any breakpointed locations inside `buf` (read starting at
    /// `start`) back to the original bytes.
    pub fn replace_breakpoints_with_original_bytes(
        &self,
        start: RemotePtr<Void>,
        buf: &mut [u8],
    ) {
        if self.breakpoints.is_empty() {
            return;
        }
        let range = MemoryRange::new_range(start, buf.len());
        for (addr, bp) in &self.breakpoints {
            let p = addr.to_data_ptr::<Void>();
            if range.contains(p) {
                let idx = p.as_usize() - start.as_usize();
                if buf[idx] == BREAKPOINT_INSTRUCTION {
                    buf[idx] = bp.overwritten_data;
                }
            }
        }
    }

    // --- watchpoints ---

    /// Returns false when all hardware slots are taken.
    pub fn add_watchpoint(
        &mut self,
        addr: RemotePtr<Void>,
        num_bytes: usize,
        kind: WatchType,
    ) -> bool {
        let range = MemoryRange::new_range(addr, num_bytes);
        if let Some(wp) = self.watchpoints.get_mut(&range) {
            wp.refcount += 1;
            return true;
        }
        if self.watchpoints.len() >= MAX_WATCHPOINTS {
            return false;
        }
        self.watchpoints.insert(range, Watchpoint { refcount: 1, kind });
        true
    }

    pub fn remove_watchpoint(&mut self, addr: RemotePtr<Void>, num_bytes: usize) {
        let range = MemoryRange::new_range(addr, num_bytes);
        if let Some(wp) = self.watchpoints.get_mut(&range) {
            wp.refcount -= 1;
            if wp.refcount == 0 {
                self.watchpoints.remove(&range);
            }
        }
    }

    /// The set the Task layer programs into DR0..DR3.
    pub fn watch_configs(&self) -> Vec<WatchConfig> {
        self.watchpoints
            .iter()
            .map(|(range, wp)| WatchConfig {
                addr: range.start(),
                num_bytes: range.size(),
                kind: wp.kind,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn km(start: usize, end: usize, prot: i32) -> KernelMapping {
        KernelMapping::new(
            MemoryRange::from_range(start, end),
            OsStr::new(""),
            kernel_mapping::NO_DEVICE,
            kernel_mapping::NO_INODE,
            prot,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            0,
        )
    }

    fn vm_with(mappings: &[(usize, usize, i32)]) -> AddressSpace {
        let mut vm = AddressSpace::new(OsStr::new("/bin/test"));
        for (s, e, p) in mappings {
            vm.map(km(*s, *e, *p), None);
        }
        vm
    }

    #[test]
    fn point_queries() {
        let vm = vm_with(&[(0x1000, 0x3000, libc::PROT_READ)]);
        assert!(vm.has_mapping(RemotePtr::new(0x1000)));
        assert!(vm.has_mapping(RemotePtr::new(0x2fff)));
        assert!(!vm.has_mapping(RemotePtr::new(0x3000)));
        assert!(!vm.has_mapping(RemotePtr::new(0xfff)));
    }

    #[test]
    fn adjacent_identical_mappings_coalesce() {
        let vm = vm_with(&[
            (0x1000, 0x2000, libc::PROT_READ),
            (0x2000, 0x3000, libc::PROT_READ),
        ]);
        assert_eq!(1, vm.mapping_count());
        let m = vm.mapping_of(RemotePtr::new(0x1500)).unwrap();
        assert_eq!(0x2000, m.map.size());
    }

    #[test]
    fn incompatible_neighbors_stay_split() {
        let vm = vm_with(&[
            (0x1000, 0x2000, libc::PROT_READ),
            (0x2000, 0x3000, libc::PROT_READ | libc::PROT_WRITE),
        ]);
        assert_eq!(2, vm.mapping_count());
    }

    #[test]
    fn unmap_splits_mapping() {
        let mut vm = vm_with(&[(0x1000, 0x4000, libc::PROT_READ)]);
        vm.unmap(MemoryRange::from_range(0x2000, 0x3000));
        assert_eq!(2, vm.mapping_count());
        assert!(vm.has_mapping(RemotePtr::new(0x1000)));
        assert!(!vm.has_mapping(RemotePtr::new(0x2000)));
        assert!(!vm.has_mapping(RemotePtr::new(0x2fff)));
        assert!(vm.has_mapping(RemotePtr::new(0x3000)));
    }

    #[test]
    fn protect_splits_then_coalesces_back() {
        let mut vm = vm_with(&[(0x1000, 0x4000, libc::PROT_READ)]);
        vm.protect(RemotePtr::new(0x2000), 0x1000, libc::PROT_READ | libc::PROT_WRITE);
        assert_eq!(3, vm.mapping_count());
        let mid = vm.mapping_of(RemotePtr::new(0x2800)).unwrap();
        assert_eq!(libc::PROT_READ | libc::PROT_WRITE, mid.map.prot());
        // Restoring the original protection merges everything again.
        vm.protect(RemotePtr::new(0x2000), 0x1000, libc::PROT_READ);
        assert_eq!(1, vm.mapping_count());
    }

    #[test]
    fn map_evicts_overlap() {
        let mut vm = vm_with(&[(0x1000, 0x4000, libc::PROT_READ)]);
        vm.map(km(0x2000, 0x3000, libc::PROT_EXEC), None);
        assert_eq!(3, vm.mapping_count());
        assert_eq!(
            libc::PROT_EXEC,
            vm.mapping_of(RemotePtr::new(0x2000)).unwrap().map.prot()
        );
    }

    #[test]
    fn remap_moves_mapping() {
        let mut vm = vm_with(&[(0x1000, 0x2000, libc::PROT_READ)]);
        vm.remap(RemotePtr::new(0x1000), 0x1000, RemotePtr::new(0x8000), 0x2000);
        assert!(!vm.has_mapping(RemotePtr::new(0x1000)));
        let m = vm.mapping_of(RemotePtr::new(0x8000)).unwrap();
        assert_eq!(0x2000, m.map.size());
    }

    #[test]
    fn breakpoint_refcounting() {
        let mut vm = vm_with(&[(0x1000, 0x2000, libc::PROT_EXEC)]);
        let addr = RemoteCodePtr::new(0x1800);
        assert!(vm.plant_breakpoint(addr, 0x55));
        // Second subscriber at the same address: nothing to write.
        assert!(!vm.plant_breakpoint(addr, 0x55));
        assert_eq!(None, vm.erase_breakpoint(addr));
        assert_eq!(Some(0x55), vm.erase_breakpoint(addr));
        assert!(!vm.has_breakpoint(addr));
    }

    #[test]
    fn breakpoint_bytes_masked_from_reads() {
        let mut vm = vm_with(&[(0x1000, 0x2000, libc::PROT_EXEC)]);
        vm.plant_breakpoint(RemoteCodePtr::new(0x1004), 0x90);
        let mut buf = [0x11, 0x22, 0x33, 0x44, BREAKPOINT_INSTRUCTION, 0x66];
        vm.replace_breakpoints_with_original_bytes(RemotePtr::new(0x1000), &mut buf);
        assert_eq!([0x11, 0x22, 0x33, 0x44, 0x90, 0x66], buf);
    }

    #[test]
    fn watchpoint_slots_limited() {
        let mut vm = vm_with(&[(0x1000, 0x10000, libc::PROT_READ)]);
        for i in 0..MAX_WATCHPOINTS {
            assert!(vm.add_watchpoint(
                RemotePtr::new(0x2000 + i * 8),
                8,
                WatchType::WatchWrite
            ));
        }
        assert!(!vm.add_watchpoint(RemotePtr::new(0x9000), 8, WatchType::WatchWrite));
        vm.remove_watchpoint(RemotePtr::new(0x2000), 8);
        assert!(vm.add_watchpoint(RemotePtr::new(0x9000), 8, WatchType::WatchWrite));
        assert_eq!(MAX_WATCHPOINTS, vm.watch_configs().len());
    }
}
