//! The in-tracee shim, loaded via LD_PRELOAD into every recorded
//! process. It interposes a whitelisted set of libc entry points and
//! routes them through a per-thread ring shared with the tracer, so they
//! complete without a single ptrace stop; everything else still takes
//! the traced path installed by the spawn-time seccomp filter.
//!
//! Code here runs inside arbitrary applications, so it must stay quiet:
//! no output, no allocation beyond its own ring, and any failure just
//! degrades to unbuffered (fully traced) recording.

#![allow(non_camel_case_types)]
#![allow(non_upper_case_globals)]

#[path = "../../src/preload_interface.rs"]
mod preload_interface;
mod raw;
mod syscallbuf;
mod wrappers;

use preload_interface::{RETRACE_PAGE_UNTRACED_SYSCALL_IP, SYS_rtcall_init_preload};
use raw::traced_syscall2;
use syscallbuf::{BUFFERING_ENABLED, GLOBALS};

#[link_section = ".init_array"]
#[used]
static INIT_PRELOAD: extern "C" fn() = init;

/// Runs when the dynamic linker finishes loading us, before main.
/// Announces the shared globals to the tracer and publishes the untraced
/// entry address; if we're not actually being traced the rtcall returns
/// ENOSYS from the kernel and we stay inert.
extern "C" fn init() {
    unsafe {
        let ret = traced_syscall2(
            SYS_rtcall_init_preload,
            &GLOBALS as *const _ as usize,
            RETRACE_PAGE_UNTRACED_SYSCALL_IP,
        );
        if ret != 0 {
            // No tracer on the other side; behave like a plain library.
            return;
        }
        if !syscallbuf_disabled_by_env() {
            BUFFERING_ENABLED = true;
        }
    }
}

unsafe fn syscallbuf_disabled_by_env() -> bool {
    let key = b"RETRACE_USE_SYSCALLBUF\0";
    let val = libc::getenv(key.as_ptr() as *const libc::c_char);
    if val.is_null() {
        return false;
    }
    let disabled = b"disabled\0";
    libc::strcmp(val, disabled.as_ptr() as *const libc::c_char) == 0
}
