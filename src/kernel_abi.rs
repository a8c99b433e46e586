//! Architecture plumbing. Recording and replay must happen on the same
//! microarchitecture, so a trace is tagged with the arch it was made on
//! and replay refuses anything else.

use std::fmt;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
#[repr(u32)]
pub enum SupportedArch {
    X64 = 0,
}

pub const NATIVE_ARCH: SupportedArch = SupportedArch::X64;

impl SupportedArch {
    pub fn from_raw(raw: u32) -> Option<SupportedArch> {
        match raw {
            0 => Some(SupportedArch::X64),
            _ => None,
        }
    }
}

impl fmt::Display for SupportedArch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SupportedArch::X64 => write!(f, "x86_64"),
        }
    }
}

/// The two-byte encoding of the `syscall` instruction.
pub const SYSCALL_INSTRUCTION: [u8; 2] = [0x0f, 0x05];
/// The two-byte encoding of `rdtsc`.
pub const RDTSC_INSTRUCTION: [u8; 2] = [0x0f, 0x31];
/// int3
pub const BREAKPOINT_INSTRUCTION: u8 = 0xcc;
/// Length of the instruction a breakpoint replaces.
pub const BREAKPOINT_INSN_LEN: usize = 1;

pub fn is_execve_syscall(syscallno: i64) -> bool {
    syscallno == libc::SYS_execve
}

pub fn is_exit_syscall(syscallno: i64) -> bool {
    syscallno == libc::SYS_exit
}

pub fn is_exit_group_syscall(syscallno: i64) -> bool {
    syscallno == libc::SYS_exit_group
}

pub fn is_clone_syscall(syscallno: i64) -> bool {
    syscallno == libc::SYS_clone
}

pub fn is_fork_syscall(syscallno: i64) -> bool {
    syscallno == libc::SYS_fork || syscallno == libc::SYS_vfork
}

pub fn is_sigreturn_syscall(syscallno: i64) -> bool {
    syscallno == libc::SYS_rt_sigreturn
}

/// Syscalls that may block indefinitely, and therefore must allow a
/// context switch (and arm the desched event when buffered). This list
/// errs on the side of allowing switches; a non-blocking completion of any
/// of these is handled fine.
pub fn is_may_block_syscall(syscallno: i64) -> bool {
    matches!(
        syscallno,
        libc::SYS_read
            | libc::SYS_readv
            | libc::SYS_poll
            | libc::SYS_ppoll
            | libc::SYS_select
            | libc::SYS_epoll_wait
            | libc::SYS_epoll_pwait
            | libc::SYS_nanosleep
            | libc::SYS_clock_nanosleep
            | libc::SYS_futex
            | libc::SYS_wait4
            | libc::SYS_waitid
            | libc::SYS_accept
            | libc::SYS_accept4
            | libc::SYS_recvfrom
            | libc::SYS_recvmsg
            | libc::SYS_connect
            | libc::SYS_pause
            | libc::SYS_rt_sigtimedwait
            | libc::SYS_rt_sigsuspend
            | libc::SYS_msync
            | libc::SYS_flock
            | libc::SYS_fsync
            | libc::SYS_write
            | libc::SYS_writev
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arch_raw_roundtrip() {
        assert_eq!(
            Some(SupportedArch::X64),
            SupportedArch::from_raw(NATIVE_ARCH as u32)
        );
        assert_eq!(None, SupportedArch::from_raw(77));
    }

    #[test]
    fn blocking_classification() {
        assert!(is_may_block_syscall(libc::SYS_read));
        assert!(is_may_block_syscall(libc::SYS_futex));
        assert!(!is_may_block_syscall(libc::SYS_getpid));
        assert!(!is_may_block_syscall(libc::SYS_mmap));
    }
}
