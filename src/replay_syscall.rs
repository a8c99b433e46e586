//! Replay-side syscall effects. Most syscalls are cancelled by SYSEMU and
//! fully emulated from the trace: outparams written back, result register
//! set. The exceptions are the calls whose kernel-side effects we need
//! for real: process-tree changes (clone/fork/execve/exit) execute live,
//! and memory-management calls are re-applied through remote syscalls so
//! the tracee's mm actually changes shape.

use crate::auto_remote_syscalls::AutoRemoteSyscalls;
use crate::emu_fs::{EmuFileSharedPtr, EmuFsSharedPtr};
use crate::log::LogLevel::LogDebug;
use crate::remote_ptr::{RemotePtr, Void};
use crate::session::address_space::kernel_mapping::KernelMapping;
use crate::session::address_space::AddressSpace;
use crate::session::task::Task;
use crate::trace::trace_reader::TraceMapping;
use crate::trace::trace_stream::MappedDataSource;
use crate::util::ceil_page_size;
use std::ffi::OsStr;

/// Syscalls that must execute for real during replay because they change
/// the task tree itself.
pub fn executes_live(syscallno: i64) -> bool {
    matches!(
        syscallno,
        libc::SYS_clone
            | libc::SYS_fork
            | libc::SYS_vfork
            | libc::SYS_execve
            | libc::SYS_exit
            | libc::SYS_exit_group
    )
}

/// Memory-management syscalls whose effects are re-applied via remote
/// syscalls after the original was cancelled.
pub fn replays_via_remote_mm(syscallno: i64) -> bool {
    matches!(
        syscallno,
        libc::SYS_mmap | libc::SYS_munmap | libc::SYS_mprotect | libc::SYS_mremap | libc::SYS_brk
    )
}

/// Re-create a recorded mmap in the tracee, backing it per the mapping
/// record: original file, trace snapshot through EmuFs, or zero pages.
pub fn rep_process_mmap(
    t: &mut Task,
    vm: &mut AddressSpace,
    emu_fs: &EmuFsSharedPtr,
    mapping: &TraceMapping,
) {
    let km = &mapping.map;
    let length = ceil_page_size(km.size());
    let fixed_flags = km.flags() | libc::MAP_FIXED;

    log!(LogDebug, "replaying mmap {}", km);

    let emu_file: Option<EmuFileSharedPtr> = match mapping.source {
        MappedDataSource::SourceZero => {
            if km.is_shared() {
                // Shared-anonymous memory must alias across tasks and
                // survive unmaps by one of them; give it an emulated
                // backing keyed synthetically by its address.
                let synthetic = KernelMapping::new(
                    km.range(),
                    km.fsname(),
                    u64::MAX,
                    km.start().as_usize() as u64,
                    km.prot(),
                    km.flags(),
                    0,
                );
                Some(emu_fs.borrow_mut().get_or_create(&synthetic))
            } else {
                let mut remote = AutoRemoteSyscalls::new(t);
                remote.infallible_mmap(
                    km.start(),
                    length,
                    km.prot(),
                    fixed_flags,
                    -1,
                    0,
                );
                None
            }
        }
        MappedDataSource::SourceFile => {
            map_file_in_tracee(t, km, km.fsname(), length, fixed_flags, km.file_offset_bytes());
            None
        }
        MappedDataSource::SourceTrace => {
            let f = emu_fs.borrow_mut().get_or_create(km);
            // Fill the emulated file with the recorded snapshot.
            let contents = &mapping.contents;
            if !contents.is_empty() {
                let written = unsafe {
                    libc::pwrite64(
                        f.borrow().fd().as_raw(),
                        contents.as_ptr() as *const libc::c_void,
                        contents.len(),
                        km.file_offset_bytes() as i64,
                    )
                };
                if written != contents.len() as isize {
                    fatal!("Can't populate emulated file for {:?}", km.fsname());
                }
            }
            Some(f)
        }
    };

    if let Some(ref f) = emu_file {
        let (proc_path, offset) = {
            let fb = f.borrow();
            (
                fb.proc_path(),
                if mapping.source == MappedDataSource::SourceTrace {
                    km.file_offset_bytes()
                } else {
                    0
                },
            )
        };
        map_file_in_tracee(
            t,
            km,
            OsStr::new(&proc_path),
            length,
            (km.flags() & !libc::MAP_ANONYMOUS) | libc::MAP_SHARED | libc::MAP_FIXED,
            offset,
        );
    }

    let mut m = crate::session::address_space::Mapping::new(km.clone());
    m.emu_file = emu_file;
    vm.map(m.map.clone(), m.emu_file);
}

/// Remote open + mmap + close of `path` at the recorded address.
fn map_file_in_tracee(
    t: &mut Task,
    km: &KernelMapping,
    path: &OsStr,
    length: usize,
    flags: i32,
    offset: u64,
) {
    let mut remote = AutoRemoteSyscalls::new(t);
    let fd = remote.syscall_with_path(libc::SYS_open, path, &[libc::O_RDWR as usize, 0]);
    let fd = if fd < 0 {
        // Some originals are read-only (system libraries).
        let ro = remote.syscall_with_path(libc::SYS_open, path, &[libc::O_RDONLY as usize, 0]);
        if ro < 0 {
            ed_assert!(
                remote.task(),
                false,
                "can't open {:?} in tracee ({})",
                path,
                ro
            );
        }
        ro
    } else {
        fd
    };

    // A writable shared mapping of a read-only fd fails; retry private.
    let mut use_flags = flags;
    let mut ret = remote.syscall(
        libc::SYS_mmap,
        &[
            km.start().as_usize(),
            length,
            km.prot() as usize,
            use_flags as usize,
            fd as usize,
            offset as usize,
        ],
    );
    if ret < 0 && use_flags & libc::MAP_SHARED != 0 {
        use_flags = (use_flags & !libc::MAP_SHARED) | libc::MAP_PRIVATE;
        ret = remote.syscall(
            libc::SYS_mmap,
            &[
                km.start().as_usize(),
                length,
                km.prot() as usize,
                use_flags as usize,
                fd as usize,
                offset as usize,
            ],
        );
    }
    if ret as usize != km.start().as_usize() {
        ed_assert!(
            remote.task(),
            false,
            "remote mmap of {:?} returned {:#x}, wanted {}",
            path,
            ret,
            km.start()
        );
    }
    remote.syscall(libc::SYS_close, &[fd as usize]);
}

/// Apply a cancelled memory-management syscall through remote calls.
pub fn rep_apply_mm_effects(t: &mut Task, vm: &mut AddressSpace, syscallno: i64) {
    // The recorded registers still carry the original arguments.
    let (a1, a2, a3) = (t.regs.arg1(), t.regs.arg2(), t.regs.arg3());
    let ret = t.regs.syscall_result();
    match syscallno {
        libc::SYS_munmap => {
            let mut remote = AutoRemoteSyscalls::new(t);
            remote.infallible_munmap(RemotePtr::new(a1), ceil_page_size(a2));
            vm.unmap(crate::session::address_space::memory_range::MemoryRange::new_range(
                RemotePtr::new(a1),
                ceil_page_size(a2),
            ));
        }
        libc::SYS_mprotect => {
            let r = {
                let mut remote = AutoRemoteSyscalls::new(t);
                remote.syscall(libc::SYS_mprotect, &[a1, a2, a3])
            };
            ed_assert!(t, r == 0, "remote mprotect failed with {}", r);
            vm.protect(RemotePtr::new(a1), ceil_page_size(a2), a3 as i32);
        }
        libc::SYS_mremap => {
            let r = {
                let mut remote = AutoRemoteSyscalls::new(t);
                remote.syscall(
                    libc::SYS_mremap,
                    &[
                        a1,
                        a2,
                        a3,
                        (libc::MREMAP_MAYMOVE | libc::MREMAP_FIXED) as usize,
                        ret,
                    ],
                )
            };
            ed_assert!(t, r as usize == ret, "remote mremap landed at {:#x}", r);
            vm.remap(
                RemotePtr::new(a1),
                ceil_page_size(a2),
                RemotePtr::new(ret),
                ceil_page_size(a3),
            );
        }
        libc::SYS_brk => {
            let r = {
                let mut remote = AutoRemoteSyscalls::new(t);
                remote.syscall(libc::SYS_brk, &[a1])
            };
            ed_assert!(t, r as usize == ret, "remote brk returned {:#x}, recorded {:#x}", r, ret);
            vm.set_brk_end(RemotePtr::<Void>::new(ret));
        }
        _ => (),
    }
}
