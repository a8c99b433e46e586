//! Execute syscalls inside a stopped tracee on the tracer's behalf: save
//! the register file, plant a `syscall` instruction at the current ip,
//! set up the argument registers, step the tracee through the call, and
//! restore everything on drop.
//!
//! Errors are returned numerically (negative errno), per the propagation
//! policy for this layer: the caller decides what's fatal.

use crate::kernel_abi::SYSCALL_INSTRUCTION;
use crate::log::LogLevel::LogDebug;
use crate::registers::Registers;
use crate::remote_code_ptr::RemoteCodePtr;
use crate::remote_ptr::{RemotePtr, Void};
use crate::scoped_fd::ScopedFd;
use crate::session::task::task_inner::{ResumeRequest, TicksRequest, WaitRequest};
use crate::session::task::Task;
use crate::wait_status::WaitType;
use nix::sys::socket::{recvmsg, ControlMessageOwned, MsgFlags};
use nix::sys::uio::IoVec;

pub struct AutoRemoteSyscalls<'a> {
    t: &'a mut Task,
    saved_regs: Registers,
    code_addr: RemoteCodePtr,
    saved_code: [u8; SYSCALL_INSTRUCTION.len()],
}

impl<'a> AutoRemoteSyscalls<'a> {
    /// The tracee must be stopped. Its current ip is used as the scratch
    /// code location; at any stop it points into mapped executable text.
    pub fn new(t: &'a mut Task) -> AutoRemoteSyscalls<'a> {
        debug_assert!(t.is_stopped());
        let saved_regs = t.regs;
        let code_addr = t.regs.ip();
        let mut saved_code = [0u8; SYSCALL_INSTRUCTION.len()];
        if !t.read_mem(code_addr.to_data_ptr(), &mut saved_code) {
            fatal!("Can't read tracee text at {} for remote syscall", code_addr);
        }
        if !t.write_mem(code_addr.to_data_ptr(), &SYSCALL_INSTRUCTION) {
            fatal!("Can't write syscall instruction at {}", code_addr);
        }
        AutoRemoteSyscalls {
            t,
            saved_regs,
            code_addr,
            saved_code,
        }
    }

    pub fn task(&mut self) -> &mut Task {
        self.t
    }

    /// Execute one syscall; returns the raw result register (negative
    /// errno on failure).
    pub fn syscall(&mut self, no: i64, args: &[usize]) -> isize {
        debug_assert!(args.len() <= 6);
        let mut regs = self.saved_regs;
        regs.set_ip(self.code_addr);
        regs.raw_mut().rax = no as u64;
        let setters: [fn(&mut Registers, usize); 6] = [
            Registers::set_arg1,
            Registers::set_arg2,
            Registers::set_arg3,
            Registers::set_arg4,
            Registers::set_arg5,
            Registers::set_arg6,
        ];
        for (i, v) in args.iter().enumerate() {
            setters[i](&mut regs, *v);
        }
        self.t.regs = regs;
        self.t.registers_dirty = true;

        // Step through the planted instruction. With the recording filter
        // live the call raises a seccomp stop first; pass through any
        // intermediate stop until the syscall has exited.
        loop {
            self.t.resume_execution(
                ResumeRequest::ResumeSyscall,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeNoTicks,
                None,
            );
            match self.t.wait_status.wait_type() {
                WaitType::SyscallStop => {
                    // Only the exit of *our* call counts: when this runs
                    // at an exec or clone event stop, the first exit stop
                    // seen belongs to that original syscall.
                    if self.t.state == crate::session::task::TaskState::AtSyscallExit
                        && self.t.regs.original_syscallno() == no
                    {
                        break;
                    }
                }
                WaitType::PtraceEvent => continue,
                WaitType::Exit | WaitType::FatalSignal => {
                    log!(LogDebug, "tracee died during remote syscall");
                    return -(libc::ESRCH as isize);
                }
                _ => {
                    ed_assert!(
                        self.t,
                        false,
                        "unexpected stop during remote syscall {}",
                        no
                    );
                }
            }
        }
        self.t.regs.syscall_result_signed()
    }

    /// Remote mmap, fatal on failure; returns the mapped address.
    pub fn infallible_mmap(
        &mut self,
        addr: RemotePtr<Void>,
        length: usize,
        prot: i32,
        flags: i32,
        fd: i32,
        offset: u64,
    ) -> RemotePtr<Void> {
        let ret = self.syscall(
            libc::SYS_mmap,
            &[
                addr.as_usize(),
                length,
                prot as usize,
                flags as usize,
                fd as usize,
                offset as usize,
            ],
        );
        if ret < 0 && ret > -4096 {
            ed_assert!(self.t, false, "remote mmap failed with {}", ret);
        }
        RemotePtr::new(ret as usize)
    }

    pub fn infallible_munmap(&mut self, addr: RemotePtr<Void>, length: usize) {
        let ret = self.syscall(libc::SYS_munmap, &[addr.as_usize(), length]);
        if ret != 0 {
            ed_assert!(self.t, false, "remote munmap failed with {}", ret);
        }
    }

    /// Execute a syscall whose first argument is a path. The string is
    /// staged on the tracee stack below sp and the clobbered bytes are
    /// restored afterwards.
    pub fn syscall_with_path(&mut self, no: i64, path: &std::ffi::OsStr, args: &[usize]) -> isize {
        use std::os::unix::ffi::OsStrExt;
        let mut bytes = path.as_bytes().to_vec();
        bytes.push(0);
        // Stay clear of the 128-byte red zone.
        let staging = self.saved_regs.sp().byte_offset(-(256 + bytes.len() as isize));
        let mut saved = vec![0u8; bytes.len()];
        if !self.t.read_mem(staging, &mut saved) || !self.t.write_mem(staging, &bytes) {
            return -(libc::EFAULT as isize);
        }
        let mut full_args = vec![staging.as_usize()];
        full_args.extend_from_slice(args);
        let ret = self.syscall(no, &full_args);
        self.t.write_mem(staging, &saved);
        ret
    }
}

impl<'a> Drop for AutoRemoteSyscalls<'a> {
    fn drop(&mut self) {
        if !self
            .t
            .write_mem(self.code_addr.to_data_ptr(), &self.saved_code)
        {
            fatal!("Can't restore tracee text at {}", self.code_addr);
        }
        self.t.regs = self.saved_regs;
        self.t.registers_dirty = true;
    }
}

/// Map the fixed-address syscall stub page into a freshly exec'd tracee
/// and fill in the `syscall; ret` stubs. The untraced stub's address is
/// the one callsite the seccomp filter lets through.
pub fn map_syscall_stub_page(t: &mut Task) {
    use crate::preload_interface::{
        retrace_page_syscall_addr, RETRACE_PAGE_ADDR, RETRACE_PAGE_SYSCALL_STUB_SIZE,
    };
    let page_addr;
    {
        let mut remote = AutoRemoteSyscalls::new(t);
        page_addr = remote.infallible_mmap(
            RemotePtr::new(RETRACE_PAGE_ADDR),
            crate::util::page_size(),
            libc::PROT_READ | libc::PROT_EXEC,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_FIXED,
            -1,
            0,
        );
    }
    ed_assert!(
        t,
        page_addr.as_usize() == RETRACE_PAGE_ADDR,
        "stub page landed at {} instead of {:#x}",
        page_addr,
        RETRACE_PAGE_ADDR
    );
    let mut stubs = [0u8; 2 * RETRACE_PAGE_SYSCALL_STUB_SIZE];
    for i in 0..2 {
        let off = i * RETRACE_PAGE_SYSCALL_STUB_SIZE;
        stubs[off..off + 2].copy_from_slice(&SYSCALL_INSTRUCTION);
        stubs[off + 2] = 0xc3;
    }
    // /proc/pid/mem writes bypass the page protections.
    if !t.write_mem(RemotePtr::new(retrace_page_syscall_addr(0)), &stubs) {
        fatal!("Can't write syscall stubs into tracee {}", t.tid);
    }
}

/// Receive one fd sent by the tracee shim over its socketpair with
/// SCM_RIGHTS. The tracer takes ownership, so the tracee can't close or
/// reprogram the underlying object behind our back.
pub fn recv_fd(sock: &ScopedFd) -> Option<ScopedFd> {
    let mut byte_buf = [0u8; 1];
    let iov = [IoVec::from_mut_slice(&mut byte_buf)];
    let mut cmsg_space = nix::cmsg_space!([std::os::unix::io::RawFd; 1]);
    let msg = recvmsg(
        sock.as_raw(),
        &iov,
        Some(&mut cmsg_space),
        MsgFlags::empty(),
    )
    .ok()?;
    for cmsg in msg.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            if let Some(fd) = fds.first() {
                return Some(ScopedFd::from_raw(*fd));
            }
        }
    }
    None
}
