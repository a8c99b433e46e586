//! The tracee half of the syscall-buffering protocol: per-thread ring
//! management, the prep/commit pair around each buffered syscall, and
//! the desched event that tells the tracer when a buffered call blocks.
//!
//! Ring discipline: a record's body is completely written before
//! `num_rec_bytes` is advanced past it, and the tracer only looks at the
//! ring while this thread is stopped, so no atomics are needed. The
//! `locked` byte makes re-entry (a signal handler calling a wrapper while
//! a wrapper is live) fall back to traced syscalls instead of corrupting
//! the ring.

use crate::preload_interface::*;
use crate::raw::*;
use core::cell::Cell;
use core::mem::size_of;
use core::ptr;

const PERF_EVENT_IOC_ENABLE: usize = 0x2400;
const PERF_EVENT_IOC_DISABLE: usize = 0x2401;

// Not exposed by the `libc` crate for this target; these mirror the
// glibc/kernel definitions in <bits/fcntl-linux.h>.
#[allow(non_camel_case_types)]
#[repr(C)]
struct f_owner_ex {
    type_: libc::c_int,
    pid: libc::pid_t,
}
const F_SETOWN_EX: libc::c_int = 15;
const F_SETSIG: libc::c_int = 10;
const F_OWNER_TID: libc::c_int = 0;

/// Process-wide state shared with the tracer.
pub static mut GLOBALS: preload_globals = preload_globals {
    in_replay: 0,
    in_diversion: 0,
    desched_sig: 0,
    _pad: 0,
    mprotect_record_count: 0,
    mprotect_records: [mprotect_record {
        start: 0,
        size: 0,
        prot: 0,
        padding: 0,
    }; MPROTECT_RECORD_COUNT],
};

pub static mut BUFFERING_ENABLED: bool = false;

thread_local! {
    /// This thread's ring, or null before set_up_buffer ran.
    static BUFFER: Cell<*mut u8> = const { Cell::new(ptr::null_mut()) };
    /// This thread's desched event fd, or -1.
    static DESCHED_FD: Cell<i32> = const { Cell::new(-1) };
}

fn buffer_hdr() -> *mut syscallbuf_hdr {
    BUFFER.with(|b| b.get()) as *mut syscallbuf_hdr
}

unsafe fn buffer_last() -> *mut u8 {
    let hdr = buffer_hdr();
    (hdr as *mut u8)
        .add(SYSCALLBUF_HDR_SIZE)
        .add((*hdr).num_rec_bytes as usize)
}

unsafe fn buffer_end() -> *mut u8 {
    (buffer_hdr() as *mut u8).add(SYSCALLBUF_BUFFER_SIZE)
}

/// Allocate and announce this thread's ring. Runs lazily from the first
/// wrapper call on the thread; every syscall here takes the traced path.
pub unsafe fn set_up_buffer() -> bool {
    let ring = traced_syscall(
        libc::SYS_mmap,
        [
            0,
            SYSCALLBUF_BUFFER_SIZE,
            (libc::PROT_READ | libc::PROT_WRITE) as usize,
            (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS) as usize,
            -1isize as usize,
            0,
        ],
    );
    if ring < 0 {
        return false;
    }
    let ring = ring as *mut u8;
    ptr::write_bytes(ring, 0, SYSCALLBUF_HDR_SIZE);

    let desched_fd = open_desched_event_counter();
    if desched_fd < 0 {
        traced_syscall2(libc::SYS_munmap, ring as usize, SYSCALLBUF_BUFFER_SIZE);
        return false;
    }
    send_fd_to_tracer(desched_fd);

    BUFFER.with(|b| b.set(ring));
    DESCHED_FD.with(|d| d.set(desched_fd));

    traced_syscall2(SYS_rtcall_init_buffers, ring as usize, desched_fd as usize);
    true
}

/// A software counter that fires on this task's first kernel
/// deschedule: sample period 1, counting context switches, delivering
/// SIGIO to this thread only.
unsafe fn open_desched_event_counter() -> i32 {
    #[repr(C)]
    struct PerfEventAttr {
        type_: u32,
        size: u32,
        config: u64,
        sample_period: u64,
        sample_type: u64,
        read_format: u64,
        flags: u64,
        rest: [u64; 6],
    }
    const PERF_TYPE_SOFTWARE: u32 = 1;
    const PERF_COUNT_SW_CONTEXT_SWITCHES: u64 = 3;
    const FLAG_DISABLED: u64 = 1;

    let mut attr: PerfEventAttr = core::mem::zeroed();
    attr.type_ = PERF_TYPE_SOFTWARE;
    attr.size = size_of::<PerfEventAttr>() as u32;
    attr.config = PERF_COUNT_SW_CONTEXT_SWITCHES;
    attr.sample_period = 1;
    attr.flags = FLAG_DISABLED;

    let tid = traced_syscall(libc::SYS_gettid, [0; 6]) as i32;
    let fd = traced_syscall(
        libc::SYS_perf_event_open,
        [&attr as *const _ as usize, tid as usize, usize::MAX, usize::MAX, 0, 0],
    );
    if fd < 0 {
        return -1;
    }
    // Applications assume ownership of low fd numbers; stay above the
    // floor.
    let fd = traced_syscall3(
        libc::SYS_fcntl,
        fd as usize,
        libc::F_DUPFD_CLOEXEC as usize,
        DESCHED_EVENT_FLOOR_FD as usize,
    );
    if fd < 0 {
        return -1;
    }

    let owner = f_owner_ex {
        type_: F_OWNER_TID,
        pid: tid,
    };
    traced_syscall3(
        libc::SYS_fcntl,
        fd as usize,
        F_SETOWN_EX as usize,
        &owner as *const _ as usize,
    );
    traced_syscall3(
        libc::SYS_fcntl,
        fd as usize,
        libc::F_SETFL as usize,
        libc::O_ASYNC as usize,
    );
    traced_syscall3(
        libc::SYS_fcntl,
        fd as usize,
        F_SETSIG as usize,
        libc::SIGIO as usize,
    );
    fd as i32
}

/// Hand the tracer its own reference to the desched fd over the
/// inherited socketpair, so we can't close or reprogram it behind the
/// tracer's back.
unsafe fn send_fd_to_tracer(fd: i32) {
    let mut byte = 0u8;
    let mut iov = libc::iovec {
        iov_base: &mut byte as *mut u8 as *mut libc::c_void,
        iov_len: 1,
    };
    let mut cmsg_buf = [0u8; 64];
    let mut msg: libc::msghdr = core::mem::zeroed();
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = unsafe_cmsg_space(size_of::<i32>());

    let cmsg = libc::CMSG_FIRSTHDR(&msg);
    (*cmsg).cmsg_level = libc::SOL_SOCKET;
    (*cmsg).cmsg_type = libc::SCM_RIGHTS;
    (*cmsg).cmsg_len = libc::CMSG_LEN(size_of::<i32>() as u32) as usize;
    ptr::copy_nonoverlapping(
        &fd as *const i32 as *const u8,
        libc::CMSG_DATA(cmsg),
        size_of::<i32>(),
    );

    traced_syscall3(
        libc::SYS_sendmsg,
        RESERVED_SOCKET_FD as usize,
        &msg as *const _ as usize,
        0,
    );
}

fn unsafe_cmsg_space(len: usize) -> usize {
    unsafe { libc::CMSG_SPACE(len as u32) as usize }
}

/// A reserved region in the ring for one syscall's record, or None when
/// the buffered path can't be used right now.
pub struct PrepedSyscall {
    rec: *mut syscallbuf_record,
    /// Staging area for outparams, inside the record.
    pub staging: *mut u8,
    desched_armed: bool,
}

/// Begin a buffered syscall with up to `payload_len` outparam bytes.
/// Fails (routing the caller to the traced path) when buffering is off,
/// the ring is locked by a re-entrant caller, or the record won't fit.
pub unsafe fn prep_syscall(syscallno: i64, payload_len: usize, will_block: bool) -> Option<PrepedSyscall> {
    if !BUFFERING_ENABLED || GLOBALS.in_diversion != 0 {
        return None;
    }
    if BUFFER.with(|b| b.get()).is_null() && !set_up_buffer() {
        return None;
    }
    let hdr = buffer_hdr();
    if (*hdr).locked != 0 {
        // A signal handler interrupted a wrapper and called back in.
        return None;
    }
    (*hdr).locked |= SYSCALLBUF_LOCKED_TRACEE;

    let record_len = stored_record_size((SYSCALLBUF_RECORD_HEADER_SIZE + payload_len) as u32);
    let rec = buffer_last() as *mut syscallbuf_record;
    if (rec as *mut u8).add(record_len as usize) >= buffer_end() {
        // Ask the tracer to drain the ring, then fall back this once.
        (*hdr).locked &= !SYSCALLBUF_LOCKED_TRACEE;
        traced_syscall1(SYS_rtcall_flush_syscallbuf, 0);
        return None;
    }

    (*rec).syscallno = syscallno as u16;
    (*rec).ret = 0;
    (*rec).desched = will_block as u8;
    (*rec).size = (SYSCALLBUF_RECORD_HEADER_SIZE + payload_len) as u32;

    let mut prep = PrepedSyscall {
        rec,
        staging: (rec as *mut u8).add(SYSCALLBUF_RECORD_HEADER_SIZE),
        desched_armed: false,
    };
    if will_block {
        arm_desched_event(hdr);
        prep.desched_armed = true;
    }
    Some(prep)
}

/// Finish a buffered syscall: record the result and publish the record,
/// unless the tracer marked the commit aborted (it recorded this syscall
/// through the traced path after a desched).
pub unsafe fn commit_syscall(prep: PrepedSyscall, raw_ret: isize) -> isize {
    let hdr = buffer_hdr();
    if prep.desched_armed {
        disarm_desched_event(hdr);
    }
    (*prep.rec).ret = raw_ret as i64;
    if (*hdr).abort_commit != 0 {
        // Each syscall is represented exactly once in the trace; ours
        // already went through the traced path.
        (*hdr).abort_commit = 0;
    } else {
        (*hdr).num_rec_bytes += stored_record_size((*prep.rec).size);
    }
    (*hdr).locked &= !SYSCALLBUF_LOCKED_TRACEE;
    commit_errno(raw_ret)
}

unsafe fn arm_desched_event(hdr: *mut syscallbuf_hdr) {
    (*hdr).desched_signal_may_be_relevant = 1;
    let fd = DESCHED_FD.with(|d| d.get());
    untraced_syscall3(libc::SYS_ioctl, fd as usize, PERF_EVENT_IOC_ENABLE, 0);
}

unsafe fn disarm_desched_event(hdr: *mut syscallbuf_hdr) {
    let fd = DESCHED_FD.with(|d| d.get());
    untraced_syscall3(libc::SYS_ioctl, fd as usize, PERF_EVENT_IOC_DISABLE, 0);
    (*hdr).desched_signal_may_be_relevant = 0;
}

/// Queue a buffered mprotect's effect for the tracer's memory model.
pub unsafe fn push_mprotect_record(start: usize, size: usize, prot: i32) {
    let i = GLOBALS.mprotect_record_count as usize;
    if i < MPROTECT_RECORD_COUNT {
        GLOBALS.mprotect_records[i] = mprotect_record {
            start: start as u64,
            size: size as u64,
            prot,
            padding: 0,
        };
        GLOBALS.mprotect_record_count += 1;
    }
}
