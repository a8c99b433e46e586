//! Per-syscall recording rules: what to do at syscall entry (mostly:
//! decide whether the scheduler may switch away while the syscall runs)
//! and at syscall exit (copy the kernel-written outparam bytes into the
//! trace, and apply memory-map effects to the AddressSpace model).
//!
//! Unknown syscalls record no payload; their register effects are always
//! captured by the exit frame itself. That loses outparams of exotic
//! calls, which shows up at replay as a divergence rather than silent
//! corruption.

use crate::event::Switchable;
use crate::kernel_abi::is_may_block_syscall;
use crate::log::LogLevel::{LogDebug, LogWarn};
use crate::remote_ptr::{RemotePtr, Void};
use crate::session::address_space::kernel_mapping::{KernelMapping, NO_DEVICE, NO_INODE};
use crate::session::address_space::memory_range::MemoryRange;
use crate::session::session_inner::SessionInner;
use crate::session::task::Task;
use crate::trace::trace_frame::FrameTime;
use crate::trace::trace_stream::{MappedDataSource, RawDataRecord};
use crate::trace::trace_writer::TraceWriter;
use crate::util::ceil_page_size;
use nix::fcntl::readlink;
use nix::sys::stat::stat;
use std::ffi::OsString;
use std::mem::size_of;

/// Called at syscall entry, before the syscall runs.
pub fn rec_prepare_syscall(t: &mut Task) -> Switchable {
    let syscallno = t.regs.original_syscallno();
    if is_may_block_syscall(syscallno) {
        Switchable::AllowSwitch
    } else {
        Switchable::PreventSwitch
    }
}

/// Read `len` bytes at `addr` from the tracee as a payload record.
fn record_remote(t: &Task, addr: usize, len: usize) -> Option<RawDataRecord> {
    if addr == 0 || len == 0 {
        return None;
    }
    let mut data = vec![0u8; len];
    if !t.read_mem(RemotePtr::new(addr), &mut data) {
        log!(
            LogWarn,
            "can't read {} outparam bytes at {:#x} from {}",
            len,
            addr,
            t.tid
        );
        return None;
    }
    Some(RawDataRecord {
        addr,
        rec_tid: t.rec_tid,
        data,
    })
}

fn push_remote(out: &mut Vec<RawDataRecord>, t: &Task, addr: usize, len: usize) {
    if let Some(rec) = record_remote(t, addr, len) {
        out.push(rec);
    }
}

/// Called at syscall exit with the result in the registers. Returns the
/// payload records for the exit frame.
pub fn rec_process_syscall_exit(
    t: &mut Task,
    inner: &mut SessionInner,
    trace: &mut TraceWriter,
    time_hint: FrameTime,
) -> Vec<RawDataRecord> {
    let syscallno = t.regs.original_syscallno();
    let ret = t.regs.syscall_result_signed();
    let failed = t.regs.syscall_failed();
    let mut out: Vec<RawDataRecord> = Vec::new();

    log!(
        LogDebug,
        "processing exit of {} in {} -> {}",
        crate::kernel_metadata::syscall_name(syscallno),
        t.tid,
        ret
    );

    if failed {
        // Failed syscalls wrote nothing; the exit frame's registers carry
        // the errno.
        return out;
    }

    match syscallno {
        libc::SYS_read | libc::SYS_pread64 => {
            push_remote(&mut out, t, t.regs.arg2(), ret as usize);
        }
        libc::SYS_readv => {
            record_iovec_outparams(&mut out, t, t.regs.arg2(), t.regs.arg3(), ret as usize);
        }
        libc::SYS_getrandom => {
            push_remote(&mut out, t, t.regs.arg1(), ret as usize);
        }
        libc::SYS_getcwd => {
            push_remote(&mut out, t, t.regs.arg1(), ret as usize);
        }
        libc::SYS_readlink => {
            push_remote(&mut out, t, t.regs.arg2(), ret as usize);
        }
        libc::SYS_getdents64 => {
            push_remote(&mut out, t, t.regs.arg2(), ret as usize);
        }
        libc::SYS_stat | libc::SYS_fstat | libc::SYS_lstat => {
            push_remote(&mut out, t, t.regs.arg2(), size_of::<libc::stat>());
        }
        libc::SYS_newfstatat => {
            push_remote(&mut out, t, t.regs.arg3(), size_of::<libc::stat>());
        }
        libc::SYS_statfs | libc::SYS_fstatfs => {
            push_remote(&mut out, t, t.regs.arg2(), size_of::<libc::statfs>());
        }
        libc::SYS_poll | libc::SYS_ppoll => {
            let nfds = t.regs.arg2();
            push_remote(&mut out, t, t.regs.arg1(), nfds * size_of::<libc::pollfd>());
        }
        libc::SYS_epoll_wait | libc::SYS_epoll_pwait => {
            push_remote(
                &mut out,
                t,
                t.regs.arg2(),
                ret as usize * size_of::<libc::epoll_event>(),
            );
        }
        libc::SYS_select => {
            let fdset_bytes = 128;
            push_remote(&mut out, t, t.regs.arg2(), fdset_bytes);
            push_remote(&mut out, t, t.regs.arg3(), fdset_bytes);
            push_remote(&mut out, t, t.regs.arg4(), fdset_bytes);
            push_remote(&mut out, t, t.regs.arg5(), size_of::<libc::timeval>());
        }
        libc::SYS_nanosleep => {
            push_remote(&mut out, t, t.regs.arg2(), size_of::<libc::timespec>());
        }
        libc::SYS_clock_nanosleep => {
            push_remote(&mut out, t, t.regs.arg4(), size_of::<libc::timespec>());
        }
        libc::SYS_clock_gettime | libc::SYS_clock_getres => {
            push_remote(&mut out, t, t.regs.arg2(), size_of::<libc::timespec>());
        }
        libc::SYS_gettimeofday => {
            push_remote(&mut out, t, t.regs.arg1(), size_of::<libc::timeval>());
            push_remote(&mut out, t, t.regs.arg2(), 8);
        }
        libc::SYS_time => {
            push_remote(&mut out, t, t.regs.arg1(), size_of::<libc::time_t>());
        }
        libc::SYS_uname => {
            push_remote(&mut out, t, t.regs.arg1(), size_of::<libc::utsname>());
        }
        libc::SYS_pipe | libc::SYS_pipe2 => {
            push_remote(&mut out, t, t.regs.arg1(), 2 * size_of::<i32>());
        }
        libc::SYS_socketpair => {
            push_remote(&mut out, t, t.regs.arg4(), 2 * size_of::<i32>());
        }
        libc::SYS_accept | libc::SYS_accept4 | libc::SYS_getsockname | libc::SYS_getpeername => {
            record_sockaddr_outparam(&mut out, t, t.regs.arg2(), t.regs.arg3());
        }
        libc::SYS_recvfrom => {
            push_remote(&mut out, t, t.regs.arg2(), ret as usize);
            record_sockaddr_outparam(&mut out, t, t.regs.arg5(), t.regs.arg6());
        }
        libc::SYS_getsockopt => {
            record_sockaddr_outparam(&mut out, t, t.regs.arg4(), t.regs.arg5());
        }
        libc::SYS_wait4 => {
            push_remote(&mut out, t, t.regs.arg2(), size_of::<i32>());
            push_remote(&mut out, t, t.regs.arg4(), size_of::<libc::rusage>());
        }
        libc::SYS_waitid => {
            push_remote(&mut out, t, t.regs.arg3(), size_of::<crate::bindings::signal::siginfo_t>());
        }
        libc::SYS_getrusage => {
            push_remote(&mut out, t, t.regs.arg2(), size_of::<libc::rusage>());
        }
        libc::SYS_getrlimit => {
            push_remote(&mut out, t, t.regs.arg2(), size_of::<libc::rlimit>());
        }
        libc::SYS_prlimit64 => {
            push_remote(&mut out, t, t.regs.arg4(), size_of::<libc::rlimit64>());
        }
        libc::SYS_sysinfo => {
            push_remote(&mut out, t, t.regs.arg1(), size_of::<libc::sysinfo>());
        }
        libc::SYS_times => {
            push_remote(&mut out, t, t.regs.arg1(), size_of::<libc::tms>());
        }
        libc::SYS_rt_sigaction => {
            // The kernel's sigaction layout: handler, flags, restorer,
            // 8-byte mask.
            push_remote(&mut out, t, t.regs.arg3(), 32);
        }
        libc::SYS_rt_sigprocmask | libc::SYS_rt_sigpending => {
            let old_set = if syscallno == libc::SYS_rt_sigprocmask {
                t.regs.arg3()
            } else {
                t.regs.arg1()
            };
            push_remote(&mut out, t, old_set, 8);
        }
        libc::SYS_sigaltstack => {
            push_remote(&mut out, t, t.regs.arg2(), size_of::<libc::stack_t>());
        }
        libc::SYS_getitimer => {
            push_remote(&mut out, t, t.regs.arg2(), size_of::<libc::itimerval>());
        }
        libc::SYS_setitimer => {
            push_remote(&mut out, t, t.regs.arg3(), size_of::<libc::itimerval>());
        }
        libc::SYS_sched_getaffinity => {
            push_remote(&mut out, t, t.regs.arg3(), t.regs.arg2());
        }
        libc::SYS_set_robust_list | libc::SYS_set_tid_address => (),
        libc::SYS_sched_yield => {
            // Handled by the scheduler (fair-queue mode); no outparams.
        }

        libc::SYS_mmap => {
            process_mmap(t, inner, trace, time_hint);
        }
        libc::SYS_munmap => {
            let range = MemoryRange::new_range(
                RemotePtr::new(t.regs.arg1()),
                ceil_page_size(t.regs.arg2()),
            );
            inner.vm_mut(t.vm).unmap(range);
        }
        libc::SYS_mprotect => {
            inner
                .vm_mut(t.vm)
                .protect(RemotePtr::new(t.regs.arg1()), ceil_page_size(t.regs.arg2()), t.regs.arg3() as i32);
        }
        libc::SYS_mremap => {
            inner.vm_mut(t.vm).remap(
                RemotePtr::new(t.regs.arg1()),
                ceil_page_size(t.regs.arg2()),
                RemotePtr::new(t.regs.syscall_result()),
                ceil_page_size(t.regs.arg3()),
            );
        }
        libc::SYS_brk => {
            process_brk(t, inner, trace, time_hint);
        }

        _ => {
            log!(
                LogDebug,
                "no outparam rule for {}; registers only",
                crate::kernel_metadata::syscall_name(syscallno)
            );
        }
    }

    out
}

/// readv-family: the kernel scatters `total` bytes across the iovec
/// array; record each touched chunk.
fn record_iovec_outparams(
    out: &mut Vec<RawDataRecord>,
    t: &Task,
    iov_addr: usize,
    iovcnt: usize,
    mut total: usize,
) {
    for i in 0..iovcnt {
        if total == 0 {
            break;
        }
        let entry_addr = iov_addr + i * size_of::<libc::iovec>();
        let iov: libc::iovec = match t.read_val(RemotePtr::new(entry_addr)) {
            Some(v) => v,
            None => return,
        };
        let chunk = total.min(iov.iov_len);
        push_remote(out, t, iov.iov_base as usize, chunk);
        total -= chunk;
    }
}

/// sockaddr-style outparam pair: a length word the kernel updated, then
/// that many bytes of payload.
fn record_sockaddr_outparam(out: &mut Vec<RawDataRecord>, t: &Task, addr: usize, len_ptr: usize) {
    if len_ptr == 0 {
        return;
    }
    let len: u32 = match t.read_val(RemotePtr::new(len_ptr)) {
        Some(l) => l,
        None => return,
    };
    push_remote(out, t, len_ptr, size_of::<u32>());
    if addr != 0 {
        push_remote(out, t, addr, len as usize);
    }
}

/// A successful mmap: update the model and record enough to re-create the
/// mapping at replay.
fn process_mmap(t: &mut Task, inner: &mut SessionInner, trace: &mut TraceWriter, time: FrameTime) {
    let addr = t.regs.syscall_result();
    let length = ceil_page_size(t.regs.arg2());
    let prot = t.regs.arg3() as i32;
    let flags = t.regs.arg4() as i32;
    let fd = t.regs.arg5() as i32;
    let offset = t.regs.arg6() as u64;

    let range = MemoryRange::new_range(RemotePtr::new(addr), length);
    let km;
    let source;
    let mut contents: Option<Vec<u8>> = None;

    if flags & libc::MAP_ANONYMOUS != 0 {
        km = KernelMapping::new(range, std::ffi::OsStr::new(""), NO_DEVICE, NO_INODE, prot, flags, 0);
        // Shared-anonymous regions get an EmuFs backing at replay; their
        // (synthetic) identity is the address-space id plus start address
        // so distinct regions never collide.
        source = MappedDataSource::SourceZero;
    } else {
        let fd_path = format!("/proc/{}/fd/{}", t.tid, fd);
        let fsname = readlink(fd_path.as_str()).unwrap_or_else(|_| OsString::from("<unknown>"));
        let (device, inode) = match stat(fd_path.as_str()) {
            Ok(st) => (st.st_dev, st.st_ino),
            Err(_) => (NO_DEVICE, NO_INODE),
        };
        km = KernelMapping::new(range, &fsname, device, inode, prot, flags, offset);
        if flags & libc::MAP_SHARED != 0 || prot & libc::PROT_WRITE != 0 {
            // The file may change after recording; snapshot the mapped
            // bytes now.
            let mut buf = vec![0u8; length];
            if t.read_mem(RemotePtr::new(addr), &mut buf) {
                contents = Some(buf);
            }
            source = MappedDataSource::SourceTrace;
        } else {
            // Read-only private file mappings (program text, libraries)
            // are re-mapped from the original file at replay.
            source = MappedDataSource::SourceFile;
        }
    }

    trace.write_mapping(&km, source, time, contents.as_deref());
    inner.vm_mut(t.vm).map(km, None);
}

/// brk grows or shrinks the heap mapping.
fn process_brk(t: &mut Task, inner: &mut SessionInner, trace: &mut TraceWriter, time: FrameTime) {
    let new_end = RemotePtr::<Void>::new(t.regs.syscall_result());
    let vm = inner.vm_mut(t.vm);
    let old_end = vm.brk_end();
    if old_end.is_null() || new_end == old_end {
        vm.set_brk_end(new_end);
        return;
    }
    if new_end > old_end {
        let km = KernelMapping::new(
            MemoryRange::from_range(old_end.as_usize(), new_end.as_usize()),
            std::ffi::OsStr::new("[heap]"),
            NO_DEVICE,
            NO_INODE,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            0,
        );
        trace.write_mapping(&km, MappedDataSource::SourceZero, time, None);
        vm.map(km, None);
    } else {
        vm.unmap(MemoryRange::from_range(new_end.as_usize(), old_end.as_usize()));
    }
    vm.set_brk_end(new_end);
}
