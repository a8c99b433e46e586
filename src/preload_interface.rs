#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]

//! The contract between the tracer and the in-tracee preload shim. This
//! file is compiled into both sides (the shim includes it via `#[path]`),
//! so it must stay free of crate-local imports.
//!
//! Bump SYSCALLBUF_PROTOCOL_VERSION whenever the layout of anything here
//! changes in a way replay can observe. The version is stored in the trace
//! header, so replay always knows the protocol a recording used.

pub const SYSCALLBUF_PROTOCOL_VERSION: u16 = 1;

pub const SYSCALLBUF_LIB_FILENAME: &str = "libretrace_preload.so";

/// Set to `disabled` to force every syscall through the traced path.
pub const SYSCALLBUF_ENABLED_ENV_VAR: &str = "RETRACE_USE_SYSCALLBUF";

/// Size of each thread's ring, header included. Must be a power of two;
/// chosen at build time (spec'd wire format, not tunable at runtime).
pub const SYSCALLBUF_BUFFER_SIZE: usize = 1 << 20;

/// The shim keeps the desched event fd out of the low range that
/// applications tend to assume they own.
pub const DESCHED_EVENT_FLOOR_FD: i32 = 100;

/// Fd number where the spawn bootstrap parks the tracee end of the
/// fd-transfer socketpair. Tracee close()/dup2() of this fd would break
/// the handshake; applications that touch four-digit fds get what they
/// deserve.
pub const RESERVED_SOCKET_FD: i32 = 1001;

/// A page of syscall stubs mapped at a fixed address in every tracee right
/// after exec, so the seccomp filter (installed before exec, when no shim
/// code is mapped yet) can name the untraced entry as a constant. Each
/// stub is `syscall; ret`, 3 bytes.
pub const RETRACE_PAGE_ADDR: usize = 0x7000_0000;
pub const RETRACE_PAGE_SYSCALL_STUB_SIZE: usize = 3;
/// IP value as seen by seccomp: the address of the instruction after the
/// `syscall` itself.
pub const RETRACE_PAGE_SYSCALL_INSTRUCTION_END: usize = 2;

pub const fn retrace_page_syscall_addr(index: usize) -> usize {
    RETRACE_PAGE_ADDR + RETRACE_PAGE_SYSCALL_STUB_SIZE * index
}

/// Stub whose callsite the filter traps: used by the shim for calls it
/// wants the tracer to see.
pub const RETRACE_PAGE_SYSCALL_TRACED: usize = retrace_page_syscall_addr(0);
/// Stub whose callsite the filter allows: the single untraced entry point.
pub const RETRACE_PAGE_SYSCALL_UNTRACED: usize = retrace_page_syscall_addr(1);

/// The IP the seccomp filter must whitelist (the kernel reports the
/// post-syscall-instruction address).
pub const RETRACE_PAGE_UNTRACED_SYSCALL_IP: usize =
    RETRACE_PAGE_SYSCALL_UNTRACED + RETRACE_PAGE_SYSCALL_INSTRUCTION_END;

/// Pseudo-syscalls issued by the shim over the traced path. Numbers sit
/// above the real syscall table; the tracer intercepts them at
/// syscall-entry and never lets them reach the kernel.
///
/// Issued once per process when the shim finishes loading. arg1 is the
/// tracee address of its `preload_globals`, arg2 the untraced entry IP.
pub const SYS_rtcall_init_preload: i64 = 442;
/// Issued by every new thread. arg1 is the tracee address of the thread's
/// ring; the tracer maps it shared and takes the desched fd via SCM_RIGHTS.
pub const SYS_rtcall_init_buffers: i64 = 443;
/// Issued when a record won't fit: asks the tracer to flush and reset the
/// ring.
pub const SYS_rtcall_flush_syscallbuf: i64 = 444;

/// Reasons the ring is unavailable. A signal handler re-entering the shim
/// sees LOCKED_TRACEE and falls back to a traced syscall.
pub const SYSCALLBUF_LOCKED_TRACEE: u8 = 0x1;
/// Set by the tracer to suppress buffering while it needs syscalls
/// observable (e.g. during diversion).
pub const SYSCALLBUF_LOCKED_TRACER: u8 = 0x2;

pub const MPROTECT_RECORD_COUNT: usize = 1000;

/// A buffered mprotect's effect, queued for the tracer so its memory-map
/// model can be updated at the next flush.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default)]
pub struct mprotect_record {
    pub start: u64,
    pub size: u64,
    pub prot: i32,
    pub padding: i32,
}

/// Shared state between the shim and the tracer, living at a fixed place
/// in the tracee: the shim passes its address in rtcall_init_preload.
/// The tracer writes `in_replay`/`in_diversion`; the shim only reads them,
/// and only via conditional moves so control flow can't diverge between
/// record and replay.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct preload_globals {
    /// 0 during recording, 1 during replay. Set by the tracer.
    pub in_replay: u8,
    /// 1 during diversion. Set by the tracer.
    pub in_diversion: u8,
    /// The signal the desched event delivers.
    pub desched_sig: u8,
    pub _pad: u8,
    /// Number of valid entries in `mprotect_records`. Written by the shim,
    /// cleared by the tracer at flush.
    pub mprotect_record_count: u32,
    pub mprotect_records: [mprotect_record; MPROTECT_RECORD_COUNT],
}

/// One buffered syscall. The kernel-written outparam bytes follow the
/// fixed fields inline; `size` covers both.
#[repr(C)]
#[derive(Copy, Clone, Default, Debug)]
pub struct syscallbuf_record {
    /// Return value from the syscall. Can be a memory address, so must be
    /// as big as one.
    pub ret: i64,
    /// The x86-64 table tops out well below u16::MAX.
    pub syscallno: u16,
    /// Did the tracee arm/disarm the desched notification for this call?
    pub desched: u8,
    pub _padding: u8,
    /// Size of the whole record in bytes: this struct plus the inline
    /// outparam data, not counting alignment padding.
    pub size: u32,
    /// Outparam bytes start here.
    pub extra_data: [u8; 0],
}

pub const SYSCALLBUF_RECORD_HEADER_SIZE: usize = 16;

/// Ring state, located at the start of the buffer.
///
/// Publication order invariant: a record's body is fully written before
/// `num_rec_bytes` moves past it, and the tracer only reads the ring while
/// the tracee is stopped, so no atomics are needed on either side.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct syscallbuf_hdr {
    /// Bytes of valid records in the buffer, excluding this header.
    pub num_rec_bytes: u32,
    /// Set by the tracer when the record being committed was already
    /// recorded through the traced path (desched interruption); the shim
    /// observes it in commit and drops its own record.
    pub abort_commit: u8,
    /// See SYSCALLBUF_LOCKED_*.
    pub locked: u8,
    /// Nonzero while a desched arming could deliver a stale signal; when
    /// zero the tracer discards desched signals outright.
    pub desched_signal_may_be_relevant: u8,
    pub _pad: u8,
    pub recs: [syscallbuf_record; 0],
}

pub const SYSCALLBUF_HDR_SIZE: usize = 8;

/// Usable record bytes in a ring.
pub const fn syscallbuf_data_size() -> usize {
    SYSCALLBUF_BUFFER_SIZE - SYSCALLBUF_HDR_SIZE
}

/// Bytes a record of `length` occupies once committed, padded to a whole
/// number of 64-bit words so the next record header is aligned.
pub const fn stored_record_size(length: u32) -> u32 {
    (length + 7) & !7u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_alignment() {
        assert_eq!(16, stored_record_size(16));
        assert_eq!(24, stored_record_size(17));
        assert_eq!(24, stored_record_size(24));
        assert_eq!(
            SYSCALLBUF_RECORD_HEADER_SIZE as u32,
            stored_record_size(SYSCALLBUF_RECORD_HEADER_SIZE as u32)
        );
    }

    #[test]
    fn header_layouts() {
        assert_eq!(
            SYSCALLBUF_RECORD_HEADER_SIZE,
            std::mem::size_of::<syscallbuf_record>()
        );
        assert_eq!(SYSCALLBUF_HDR_SIZE, std::mem::size_of::<syscallbuf_hdr>());
    }

    #[test]
    fn ring_size_is_power_of_two() {
        assert_eq!(0, SYSCALLBUF_BUFFER_SIZE & (SYSCALLBUF_BUFFER_SIZE - 1));
    }
}
