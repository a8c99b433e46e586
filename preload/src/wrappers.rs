//! The buffered syscall wrappers, exported so LD_PRELOAD interposes them
//! over libc. Each follows the same shape: reserve a record, point the
//! kernel's outparams at the record's staging area, issue the real call
//! through the untraced entry, copy staging back to the caller, commit.
//! Any reason not to buffer (ring locked, record too big, buffering off)
//! falls back to an ordinary traced syscall, which the tracer records
//! the slow way.

use crate::raw::*;
use crate::syscallbuf::*;
use core::ptr;

unsafe fn fallback(no: i64, args: [usize; 6]) -> isize {
    commit_errno(traced_syscall(no, args))
}

#[no_mangle]
pub unsafe extern "C" fn clock_gettime(clk: libc::clockid_t, tp: *mut libc::timespec) -> i32 {
    let payload = core::mem::size_of::<libc::timespec>();
    let prep = match prep_syscall(libc::SYS_clock_gettime, payload, false) {
        Some(p) => p,
        None => return fallback(libc::SYS_clock_gettime, [clk as usize, tp as usize, 0, 0, 0, 0]) as i32,
    };
    let raw = untraced_syscall2(libc::SYS_clock_gettime, clk as usize, prep.staging as usize);
    if raw == 0 && !tp.is_null() {
        ptr::copy_nonoverlapping(prep.staging as *const libc::timespec, tp, 1);
    }
    commit_syscall(prep, raw) as i32
}

#[no_mangle]
pub unsafe extern "C" fn gettimeofday(tp: *mut libc::timeval, tz: *mut libc::c_void) -> i32 {
    if !tz.is_null() {
        // Nobody passes a timezone in this century; don't buffer it.
        return fallback(libc::SYS_gettimeofday, [tp as usize, tz as usize, 0, 0, 0, 0]) as i32;
    }
    let payload = core::mem::size_of::<libc::timeval>();
    let prep = match prep_syscall(libc::SYS_gettimeofday, payload, false) {
        Some(p) => p,
        None => return fallback(libc::SYS_gettimeofday, [tp as usize, 0, 0, 0, 0, 0]) as i32,
    };
    let raw = untraced_syscall2(libc::SYS_gettimeofday, prep.staging as usize, 0);
    if raw == 0 && !tp.is_null() {
        ptr::copy_nonoverlapping(prep.staging as *const libc::timeval, tp, 1);
    }
    commit_syscall(prep, raw) as i32
}

#[no_mangle]
pub unsafe extern "C" fn time(tloc: *mut libc::time_t) -> libc::time_t {
    let prep = match prep_syscall(libc::SYS_time, 0, false) {
        Some(p) => p,
        None => return fallback(libc::SYS_time, [tloc as usize, 0, 0, 0, 0, 0]) as libc::time_t,
    };
    let raw = untraced_syscall1(libc::SYS_time, 0);
    if raw >= 0 && !tloc.is_null() {
        *tloc = raw as libc::time_t;
    }
    commit_syscall(prep, raw) as libc::time_t
}

#[no_mangle]
pub unsafe extern "C" fn read(fd: i32, buf: *mut libc::c_void, count: usize) -> isize {
    let prep = match prep_syscall(libc::SYS_read, count, true) {
        Some(p) => p,
        None => return fallback(libc::SYS_read, [fd as usize, buf as usize, count, 0, 0, 0]),
    };
    let raw = untraced_syscall3(libc::SYS_read, fd as usize, prep.staging as usize, count);
    if raw > 0 && !buf.is_null() {
        ptr::copy_nonoverlapping(prep.staging, buf as *mut u8, raw as usize);
    }
    commit_syscall(prep, raw)
}

#[no_mangle]
pub unsafe extern "C" fn write(fd: i32, buf: *const libc::c_void, count: usize) -> isize {
    // The kernel only reads our memory here; no staging, no payload.
    let prep = match prep_syscall(libc::SYS_write, 0, true) {
        Some(p) => p,
        None => return fallback(libc::SYS_write, [fd as usize, buf as usize, count, 0, 0, 0]),
    };
    let raw = untraced_syscall3(libc::SYS_write, fd as usize, buf as usize, count);
    commit_syscall(prep, raw)
}

#[no_mangle]
pub unsafe extern "C" fn close(fd: i32) -> i32 {
    let prep = match prep_syscall(libc::SYS_close, 0, false) {
        Some(p) => p,
        None => return fallback(libc::SYS_close, [fd as usize, 0, 0, 0, 0, 0]) as i32,
    };
    let raw = untraced_syscall1(libc::SYS_close, fd as usize);
    commit_syscall(prep, raw) as i32
}

#[no_mangle]
pub unsafe extern "C" fn poll(fds: *mut libc::pollfd, nfds: libc::nfds_t, timeout: i32) -> i32 {
    let payload = nfds as usize * core::mem::size_of::<libc::pollfd>();
    let prep = match prep_syscall(libc::SYS_poll, payload, timeout != 0) {
        Some(p) => p,
        None => {
            return fallback(
                libc::SYS_poll,
                [fds as usize, nfds as usize, timeout as usize, 0, 0, 0],
            ) as i32
        }
    };
    // The kernel reads revents slots too; stage the caller's array in.
    if !fds.is_null() {
        ptr::copy_nonoverlapping(fds as *const u8, prep.staging, payload);
    }
    let raw = untraced_syscall3(
        libc::SYS_poll,
        prep.staging as usize,
        nfds as usize,
        timeout as usize,
    );
    if raw >= 0 && !fds.is_null() {
        ptr::copy_nonoverlapping(prep.staging as *const u8, fds as *mut u8, payload);
    }
    commit_syscall(prep, raw) as i32
}

#[no_mangle]
pub unsafe extern "C" fn epoll_wait(
    epfd: i32,
    events: *mut libc::epoll_event,
    maxevents: i32,
    timeout: i32,
) -> i32 {
    if maxevents <= 0 {
        return fallback(
            libc::SYS_epoll_wait,
            [epfd as usize, events as usize, maxevents as usize, timeout as usize, 0, 0],
        ) as i32;
    }
    let payload = maxevents as usize * core::mem::size_of::<libc::epoll_event>();
    let prep = match prep_syscall(libc::SYS_epoll_wait, payload, timeout != 0) {
        Some(p) => p,
        None => {
            return fallback(
                libc::SYS_epoll_wait,
                [epfd as usize, events as usize, maxevents as usize, timeout as usize, 0, 0],
            ) as i32
        }
    };
    let raw = untraced_syscall(
        libc::SYS_epoll_wait,
        [
            epfd as usize,
            prep.staging as usize,
            maxevents as usize,
            timeout as usize,
            0,
            0,
        ],
    );
    if raw > 0 && !events.is_null() {
        ptr::copy_nonoverlapping(
            prep.staging as *const libc::epoll_event,
            events,
            raw as usize,
        );
    }
    commit_syscall(prep, raw) as i32
}

#[no_mangle]
pub unsafe extern "C" fn nanosleep(
    req: *const libc::timespec,
    rem: *mut libc::timespec,
) -> i32 {
    let payload = core::mem::size_of::<libc::timespec>();
    let prep = match prep_syscall(libc::SYS_nanosleep, payload, true) {
        Some(p) => p,
        None => return fallback(libc::SYS_nanosleep, [req as usize, rem as usize, 0, 0, 0, 0]) as i32,
    };
    let raw = untraced_syscall2(libc::SYS_nanosleep, req as usize, prep.staging as usize);
    if !rem.is_null() {
        // On interruption the kernel wrote the remaining time there.
        ptr::copy_nonoverlapping(prep.staging as *const libc::timespec, rem, 1);
    }
    commit_syscall(prep, raw) as i32
}

#[no_mangle]
pub unsafe extern "C" fn madvise(addr: *mut libc::c_void, length: usize, advice: i32) -> i32 {
    let prep = match prep_syscall(libc::SYS_madvise, 0, false) {
        Some(p) => p,
        None => {
            return fallback(
                libc::SYS_madvise,
                [addr as usize, length, advice as usize, 0, 0, 0],
            ) as i32
        }
    };
    let raw = untraced_syscall3(libc::SYS_madvise, addr as usize, length, advice as usize);
    commit_syscall(prep, raw) as i32
}

#[no_mangle]
pub unsafe extern "C" fn mprotect(addr: *mut libc::c_void, length: usize, prot: i32) -> i32 {
    let prep = match prep_syscall(libc::SYS_mprotect, 0, false) {
        Some(p) => p,
        None => {
            return fallback(
                libc::SYS_mprotect,
                [addr as usize, length, prot as usize, 0, 0, 0],
            ) as i32
        }
    };
    let raw = untraced_syscall3(libc::SYS_mprotect, addr as usize, length, prot as usize);
    if raw == 0 {
        push_mprotect_record(addr as usize, length, prot);
    }
    commit_syscall(prep, raw) as i32
}

#[no_mangle]
pub unsafe extern "C" fn getpid() -> libc::pid_t {
    let prep = match prep_syscall(libc::SYS_getpid, 0, false) {
        Some(p) => p,
        None => return fallback(libc::SYS_getpid, [0; 6]) as libc::pid_t,
    };
    let raw = untraced_syscall(libc::SYS_getpid, [0; 6]);
    commit_syscall(prep, raw) as libc::pid_t
}
