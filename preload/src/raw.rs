//! Raw syscall plumbing for the shim. Every kernel entry goes through
//! one of the two fixed stubs the tracer mapped at the retrace page: the
//! traced stub (the filter reports it) or the untraced stub (the single
//! callsite the filter lets through). Keeping the callsites to exactly
//! these two addresses is what makes the seccomp policy airtight.

use crate::preload_interface::{RETRACE_PAGE_SYSCALL_TRACED, RETRACE_PAGE_SYSCALL_UNTRACED};
use core::arch::asm;

/// Call a `syscall; ret` stub at `stub`. Syscall convention, not C: arg4
/// lives in r10.
#[inline(always)]
unsafe fn stub_syscall6(
    stub: usize,
    no: i64,
    a1: usize,
    a2: usize,
    a3: usize,
    a4: usize,
    a5: usize,
    a6: usize,
) -> isize {
    let ret: isize;
    asm!(
        "call {stub}",
        stub = in(reg) stub,
        inlateout("rax") no as isize => ret,
        in("rdi") a1,
        in("rsi") a2,
        in("rdx") a3,
        in("r10") a4,
        in("r8") a5,
        in("r9") a6,
        lateout("rcx") _,
        lateout("r11") _,
    );
    ret
}

pub unsafe fn traced_syscall(no: i64, args: [usize; 6]) -> isize {
    stub_syscall6(
        RETRACE_PAGE_SYSCALL_TRACED,
        no,
        args[0],
        args[1],
        args[2],
        args[3],
        args[4],
        args[5],
    )
}

pub unsafe fn untraced_syscall(no: i64, args: [usize; 6]) -> isize {
    stub_syscall6(
        RETRACE_PAGE_SYSCALL_UNTRACED,
        no,
        args[0],
        args[1],
        args[2],
        args[3],
        args[4],
        args[5],
    )
}

/// Kernel result to libc convention: negative errno values set errno and
/// collapse to -1.
pub unsafe fn commit_errno(raw: isize) -> isize {
    if raw < 0 && raw > -4096 {
        *libc::__errno_location() = -raw as i32;
        -1
    } else {
        raw
    }
}

pub unsafe fn traced_syscall1(no: i64, a1: usize) -> isize {
    traced_syscall(no, [a1, 0, 0, 0, 0, 0])
}

pub unsafe fn traced_syscall2(no: i64, a1: usize, a2: usize) -> isize {
    traced_syscall(no, [a1, a2, 0, 0, 0, 0])
}

pub unsafe fn traced_syscall3(no: i64, a1: usize, a2: usize, a3: usize) -> isize {
    traced_syscall(no, [a1, a2, a3, 0, 0, 0])
}

pub unsafe fn untraced_syscall1(no: i64, a1: usize) -> isize {
    untraced_syscall(no, [a1, 0, 0, 0, 0, 0])
}

pub unsafe fn untraced_syscall2(no: i64, a1: usize, a2: usize) -> isize {
    untraced_syscall(no, [a1, a2, 0, 0, 0, 0])
}

pub unsafe fn untraced_syscall3(no: i64, a1: usize, a2: usize, a3: usize) -> isize {
    untraced_syscall(no, [a1, a2, a3, 0, 0, 0])
}
