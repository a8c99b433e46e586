//! The task-step primitive: resume a stopped tracee in one of the ptrace
//! resume modes, block until its next stop, and refresh the cached
//! register/tick state. Everything above this layer deals in classified
//! stops; everything below is raw ptrace.

use super::{Task, TaskState};
use crate::bindings::ptrace::*;
use crate::bindings::signal::siginfo_t;
use crate::extra_registers::FXSAVE_AREA_SIZE;
use crate::kernel_abi::RDTSC_INSTRUCTION;
use crate::log::LogLevel::{LogDebug, LogWarn};
use crate::perf_counters::NO_INTERRUPT_PERIOD;
use crate::registers::REGISTERS_RAW_SIZE;
use crate::remote_ptr::{RemotePtr, Void};
use crate::scoped_fd::ScopedFd;
use crate::seccomp_bpf::{sock_fprog, SeccompFilter};
use crate::session::address_space::{WatchConfig, WatchType};
use crate::sig::Sig;
use crate::ticks::Ticks;
use crate::util::{to_cstr_array, to_cstring_array};
use crate::wait_status::WaitStatus;
use libc::{c_long, c_void, pid_t, ESRCH, PR_SET_NO_NEW_PRIVS, PR_SET_PDEATHSIG};
use nix::errno::errno;
use nix::fcntl::OFlag;
use std::convert::TryInto;
use std::ffi::{OsStr, OsString};
use std::mem::size_of;

/// Ways to resume execution. A separate type from the raw requests so the
/// SYSEMU family (not part of the official ptrace API) can't be confused
/// with anything else.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ResumeRequest {
    ResumeCont = PTRACE_CONT,
    ResumeSinglestep = PTRACE_SINGLESTEP,
    ResumeSyscall = PTRACE_SYSCALL,
    ResumeSysemu = PTRACE_SYSEMU,
    ResumeSysemuSinglestep = PTRACE_SYSEMU_SINGLESTEP,
}

#[derive(Copy, Clone, Eq, PartialEq)]
pub enum WaitRequest {
    /// Block in waitpid until the tracee stops again.
    ResumeWait,
    /// Don't wait after resuming.
    ResumeNonblocking,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TicksRequest {
    /// No ticks expected; the counter isn't (re)programmed. Small
    /// optimization for stops we fully control like remote syscalls.
    ResumeNoTicks,
    /// Count, but never interrupt.
    ResumeUnlimitedTicks,
    /// Interrupt after this many ticks (clamped to >= 1).
    ResumeWithTicksRequest(Ticks),
}

pub const MAX_TICKS_REQUEST: Ticks = 2_000_000_000;

impl Task {
    // --- raw ptrace ---

    fn ptrace_raw(&self, request: u32, addr: usize, data: *mut c_void) -> c_long {
        unsafe { libc::ptrace(request as _, self.tid, addr, data) }
    }

    /// ptrace that must succeed; anything else is a tracer bug or a
    /// vanished tracee we should have noticed.
    pub fn xptrace(&self, request: u32, addr: usize, data: *mut c_void) {
        nix::errno::Errno::clear();
        let ret = self.ptrace_raw(request, addr, data);
        if ret == -1 && errno() != 0 {
            fatal!(
                "ptrace(req {}, tid {}, addr={:#x}) failed: {}",
                request,
                self.tid,
                addr,
                crate::kernel_metadata::errno_name(errno())
            );
        }
    }

    /// ptrace where ESRCH (task died underneath us) is survivable.
    /// Returns false in that case.
    pub fn ptrace_if_alive(&self, request: u32, addr: usize, data: *mut c_void) -> bool {
        nix::errno::Errno::clear();
        let ret = self.ptrace_raw(request, addr, data);
        if ret == -1 && errno() == ESRCH {
            log!(LogDebug, "ptrace on dying task {} ignored", self.tid);
            return false;
        }
        if ret == -1 && errno() != 0 {
            fatal!(
                "ptrace(req {}) on task {} failed: {}",
                request,
                self.tid,
                crate::kernel_metadata::errno_name(errno())
            );
        }
        true
    }

    // --- memory ---

    pub fn open_mem_fd(&mut self) {
        let path = format!("/proc/{}/mem", self.tid);
        match ScopedFd::try_open_path(path.as_str(), OFlag::O_CLOEXEC | OFlag::O_RDWR) {
            Some(fd) => self.child_mem_fd = fd,
            None => log!(LogWarn, "Can't open {} (task dying?)", path),
        }
    }

    /// Read tracee memory. Returns false if the range isn't fully
    /// readable.
    pub fn read_mem(&self, addr: RemotePtr<Void>, buf: &mut [u8]) -> bool {
        if buf.is_empty() {
            return true;
        }
        let mut done = 0usize;
        while done < buf.len() {
            let ret = unsafe {
                libc::pread64(
                    self.child_mem_fd.as_raw(),
                    buf[done..].as_mut_ptr() as *mut c_void,
                    buf.len() - done,
                    (addr.as_usize() + done) as i64,
                )
            };
            if ret <= 0 {
                return false;
            }
            done += ret as usize;
        }
        true
    }

    pub fn write_mem(&self, addr: RemotePtr<Void>, buf: &[u8]) -> bool {
        if buf.is_empty() {
            return true;
        }
        let mut done = 0usize;
        while done < buf.len() {
            let ret = unsafe {
                libc::pwrite64(
                    self.child_mem_fd.as_raw(),
                    buf[done..].as_ptr() as *const c_void,
                    buf.len() - done,
                    (addr.as_usize() + done) as i64,
                )
            };
            if ret <= 0 {
                return false;
            }
            done += ret as usize;
        }
        true
    }

    pub fn read_val<T: Copy>(&self, addr: RemotePtr<T>) -> Option<T> {
        let mut val = std::mem::MaybeUninit::<T>::uninit();
        let buf = unsafe {
            std::slice::from_raw_parts_mut(val.as_mut_ptr() as *mut u8, size_of::<T>())
        };
        if !self.read_mem(RemotePtr::cast(addr), buf) {
            return None;
        }
        Some(unsafe { val.assume_init() })
    }

    pub fn write_val<T: Copy>(&self, addr: RemotePtr<T>, val: &T) -> bool {
        let buf =
            unsafe { std::slice::from_raw_parts(val as *const T as *const u8, size_of::<T>()) };
        self.write_mem(RemotePtr::cast(addr), buf)
    }

    // --- registers ---

    pub fn refresh_registers(&mut self) {
        let regs_ptr = self.regs.raw_mut() as *mut libc::user_regs_struct as *mut c_void;
        self.xptrace(PTRACE_GETREGS, 0, regs_ptr);
        self.registers_dirty = false;
    }

    pub fn flush_registers(&mut self) {
        if self.registers_dirty {
            let regs_ptr = self.regs.raw_mut() as *mut libc::user_regs_struct as *mut c_void;
            self.xptrace(PTRACE_SETREGS, 0, regs_ptr);
            self.registers_dirty = false;
        }
    }

    pub fn refresh_extra_registers(&mut self) {
        let data_ptr = {
            let data = self.extra_regs.data_mut_for_ptrace();
            debug_assert_eq!(FXSAVE_AREA_SIZE, data.len());
            data.as_mut_ptr() as *mut c_void
        };
        if self.ptrace_if_alive(PTRACE_GETFPREGS, 0, data_ptr) {
            self.extra_registers_known = true;
        }
    }

    pub fn set_siginfo(&mut self, si: &siginfo_t) {
        let mut copy = *si;
        self.xptrace(
            PTRACE_SETSIGINFO,
            0,
            &mut copy as *mut siginfo_t as *mut c_void,
        );
        self.pending_siginfo = copy;
    }

    // --- resume / wait / status (the step primitive) ---

    /// Resume the tracee. Program the tick counter per `tick_request`,
    /// push back dirty registers, optionally deliver `sig`, and if
    /// `wait_how` says so block until the next stop and refresh state.
    pub fn resume_execution(
        &mut self,
        how: ResumeRequest,
        wait_how: WaitRequest,
        tick_request: TicksRequest,
        sig: Option<Sig>,
    ) {
        debug_assert!(self.is_stopped());
        self.flush_registers();
        match tick_request {
            TicksRequest::ResumeNoTicks => self.ticks_programmed = false,
            TicksRequest::ResumeUnlimitedTicks => {
                self.hpc.reset(NO_INTERRUPT_PERIOD);
                self.ticks_programmed = true;
            }
            TicksRequest::ResumeWithTicksRequest(n) => {
                let n = n.max(1).min(MAX_TICKS_REQUEST);
                self.hpc.reset(n);
                self.ticks_programmed = true;
            }
        }
        let sig_data = sig.map_or(0usize, |s| s.as_raw() as usize);
        log!(
            LogDebug,
            "resuming task {} with {:?}{}",
            self.tid,
            how,
            match sig {
                Some(s) => format!(", delivering {}", s),
                None => String::new(),
            }
        );
        self.how_last_resumed = how;
        self.state = TaskState::Running;
        if !self.ptrace_if_alive(how as u32, 0, sig_data as *mut c_void) {
            // Task died before it could be resumed; synthesize the exit.
            self.state = TaskState::Exited;
            return;
        }
        if wait_how == WaitRequest::ResumeWait {
            self.wait();
        }
    }

    /// Block until the next stop of this task.
    pub fn wait(&mut self) {
        debug_assert!(self.state == TaskState::Running);
        let mut raw_status: i32 = 0;
        loop {
            let ret = unsafe { libc::waitpid(self.tid, &mut raw_status, libc::__WALL) };
            if ret == self.tid {
                break;
            }
            if ret < 0 && errno() == libc::EINTR {
                continue;
            }
            fatal!("waitpid({}) failed: {}", self.tid, errno());
        }
        self.did_waitpid(WaitStatus::new(raw_status));
    }

    /// Record the result of a waitpid on this task: refresh registers,
    /// sample the event counter, classify the stop.
    pub fn did_waitpid(&mut self, status: WaitStatus) {
        self.wait_status = status;
        use crate::wait_status::WaitType::*;
        if matches!(status.wait_type(), Exit | FatalSignal) {
            self.state = TaskState::Exited;
            return;
        }

        // Every stop refreshes the cached registers and samples the
        // event counter.
        self.refresh_registers();
        self.refresh_extra_registers();
        if self.ticks_programmed {
            let delta = self.hpc.read_ticks();
            self.accumulate_ticks(delta);
            self.hpc.stop_counting();
            self.ticks_programmed = false;
        }

        match status.wait_type() {
            SignalStop => {
                self.state = TaskState::StoppedBySignal;
                // The siginfo tells us which signal really fired (the
                // status only has the number).
                let mut si = siginfo_t::default();
                if self.ptrace_if_alive(
                    PTRACE_GETSIGINFO,
                    0,
                    &mut si as *mut siginfo_t as *mut c_void,
                ) {
                    self.pending_siginfo = si;
                }
            }
            SyscallStop => {
                // At every syscall entry the kernel parks -ENOSYS in the
                // result register; anything else means we're seeing the
                // exit. Robust against in-kernel restarts, unlike
                // counting entry/exit pairs.
                if self.regs.syscall_result_signed() == -(libc::ENOSYS as isize) {
                    self.state = TaskState::AtSyscallEntry;
                    self.in_syscall = true;
                } else {
                    self.state = TaskState::AtSyscallExit;
                    self.in_syscall = false;
                }
            }
            GroupStop | PtraceEvent => {
                self.state = TaskState::Runnable;
                if status.ptrace_event() == Some(PTRACE_EVENT_EXIT) {
                    self.seen_ptrace_exit_event = true;
                }
            }
            Exit | FatalSignal => unreachable!(),
        }
    }

    /// The ptrace event of the current stop, if any.
    pub fn maybe_ptrace_event(&self) -> Option<u32> {
        self.wait_status.ptrace_event()
    }

    /// For PTRACE_EVENT_CLONE/FORK: the new task's tid.
    pub fn get_event_msg(&self) -> Option<pid_t> {
        let mut msg: usize = 0;
        if self.ptrace_if_alive(
            PTRACE_GETEVENTMSG,
            0,
            &mut msg as *mut usize as *mut c_void,
        ) {
            Some(msg as pid_t)
        } else {
            None
        }
    }

    // --- rdtsc virtualization ---

    /// Is the current (deterministic SIGSEGV) stop a trapped rdtsc?
    pub fn at_rdtsc(&self) -> bool {
        let mut insn = [0u8; 2];
        if !self.read_mem(self.ip().to_data_ptr(), &mut insn) {
            return false;
        }
        insn == RDTSC_INSTRUCTION
    }

    /// Emulate the trapped rdtsc in place: deposit `value` in edx:eax and
    /// step over the 2-byte instruction. The caller supplies the value
    /// (fresh at record, recorded at replay).
    pub fn emulate_rdtsc(&mut self, value: u64) {
        self.regs.set_rdtsc_output(value);
        self.regs.set_ip(self.regs.ip() + RDTSC_INSTRUCTION.len());
        self.registers_dirty = true;
        log!(LogDebug, "emulated rdtsc for {} -> {:#x}", self.tid, value);
    }

    // --- hardware watchpoints ---

    /// Program DR0..DR3/DR7 from the vm's watchpoint set. Returns false
    /// if the configuration doesn't fit the hardware.
    pub fn set_debug_regs(&self, configs: &[WatchConfig]) -> bool {
        if configs.len() > crate::session::address_space::MAX_WATCHPOINTS {
            return false;
        }
        let dr_base = offset_of!(libc::user, u_debugreg);
        let mut dr7: usize = 0;
        for (i, cfg) in configs.iter().enumerate() {
            let len_bits: usize = match cfg.num_bytes {
                1 => 0b00,
                2 => 0b01,
                4 => 0b11,
                8 => 0b10,
                _ => return false,
            };
            // x86 has no read-only watch; reads are caught with rw.
            let rw_bits: usize = match cfg.kind {
                WatchType::WatchWrite => 0b01,
                WatchType::WatchRead | WatchType::WatchReadWrite => 0b11,
            };
            if !self.ptrace_if_alive(
                PTRACE_POKEUSER,
                dr_base + i * size_of::<usize>(),
                cfg.addr.as_usize() as *mut c_void,
            ) {
                return false;
            }
            dr7 |= 1 << (2 * i);
            dr7 |= rw_bits << (16 + 4 * i);
            dr7 |= len_bits << (18 + 4 * i);
        }
        self.ptrace_if_alive(
            PTRACE_POKEUSER,
            dr_base + 7 * size_of::<usize>(),
            dr7 as *mut c_void,
        )
    }

    // --- spawn ---

    /// Fork the initial tracee. The child arranges to be traced, installs
    /// the recording seccomp filter when asked, and execs; the parent
    /// drives it to the PTRACE_EVENT_EXEC stop and returns its pid plus
    /// the tracer end of the fd-transfer socketpair.
    pub fn spawn(
        exe: &OsStr,
        argv: &[OsString],
        envp: &[OsString],
        install_seccomp_filter: bool,
    ) -> (pid_t, ScopedFd) {
        let arg_cstrings = to_cstring_array(
            &argv.iter().map(|s| s.as_os_str()).collect::<Vec<_>>(),
        );
        let env_cstrings = to_cstring_array(
            &envp.iter().map(|s| s.as_os_str()).collect::<Vec<_>>(),
        );
        let exe_cstring = std::ffi::CString::new(
            std::os::unix::ffi::OsStrExt::as_bytes(exe),
        )
        .unwrap();

        // The socketpair over which tracees pass fds (SCM_RIGHTS); the
        // child's end gets parked at a reserved number before exec.
        let mut sock_fds = [0i32; 2];
        if unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_CLOEXEC,
                0,
                sock_fds.as_mut_ptr(),
            )
        } != 0
        {
            fatal!("socketpair failed");
        }
        let tracer_sock = ScopedFd::from_raw(sock_fds[0]);

        let pid = unsafe { libc::fork() };
        if pid < 0 {
            fatal!("fork failed");
        }
        if pid == 0 {
            // In the child. Nothing here may touch tracer state.
            unsafe {
                libc::close(sock_fds[0]);
                // dup2 clears CLOEXEC, which is the point: the reserved
                // fd must survive the exec.
                libc::dup2(sock_fds[1], crate::preload_interface::RESERVED_SOCKET_FD);
                libc::close(sock_fds[1]);
                libc::ptrace(PTRACE_TRACEME as _, 0, 0, 0);
                libc::prctl(PR_SET_PDEATHSIG, libc::SIGKILL);
                // Address layout must be identical at replay.
                libc::personality(libc::ADDR_NO_RANDOMIZE as u64);
                // Virtualize rdtsc: every execution raises a
                // deterministic SIGSEGV we emulate.
                libc::prctl(libc::PR_SET_TSC, libc::PR_TSC_SIGSEGV, 0, 0, 0);
                libc::raise(libc::SIGSTOP);

                if install_seccomp_filter {
                    set_up_seccomp_filter();
                }

                let arg_ptrs = to_cstr_array(&arg_cstrings);
                let env_ptrs = to_cstr_array(&env_cstrings);
                let _ = nix::unistd::execve(exe_cstring.as_c_str(), &arg_ptrs, &env_ptrs);
                // Exec failed; 126 mirrors the shell convention.
                libc::_exit(126);
            }
        }

        // Parent: wait for the SIGSTOP, set options, run to the exec.
        unsafe { libc::close(sock_fds[1]) };
        let mut status: i32 = 0;
        unsafe { libc::waitpid(pid, &mut status, libc::__WALL) };
        let ws = WaitStatus::new(status);
        if ws.stop_sig() != Some(libc::SIGSTOP) {
            fatal!("Tracee {} failed to stop at spawn ({})", pid, ws);
        }

        let options = PTRACE_O_TRACESYSGOOD
            | PTRACE_O_TRACECLONE
            | PTRACE_O_TRACEFORK
            | PTRACE_O_TRACEVFORK
            | PTRACE_O_TRACEEXEC
            | PTRACE_O_TRACEEXIT
            | PTRACE_O_TRACESECCOMP
            | PTRACE_O_EXITKILL;
        nix::errno::Errno::clear();
        if unsafe { libc::ptrace(PTRACE_SETOPTIONS as _, pid, 0, options as usize) } == -1
            && errno() != 0
        {
            fatal!("PTRACE_SETOPTIONS failed for {}", pid);
        }

        // Run to the exec event, passing through the seccomp stop that
        // the execve syscall itself triggers once the filter is live.
        loop {
            unsafe {
                libc::ptrace(PTRACE_CONT as _, pid, 0, 0);
                libc::waitpid(pid, &mut status, libc::__WALL);
            }
            let ws = WaitStatus::new(status);
            match ws.ptrace_event() {
                Some(PTRACE_EVENT_EXEC) => break,
                Some(PTRACE_EVENT_SECCOMP) => continue,
                _ => {
                    if ws.exit_code() == Some(126) {
                        clean_fatal!("Failed to exec {:?}", exe);
                    }
                    fatal!("Unexpected stop {} while spawning {:?}", ws, exe);
                }
            }
        }

        (pid, tracer_sock)
    }
}

/// Runs in the freshly forked child: no-new-privs, then the filter that
/// traces every syscall not issued from the fixed untraced entry.
fn set_up_seccomp_filter() {
    let filter = SeccompFilter::for_recording(
        crate::preload_interface::RETRACE_PAGE_UNTRACED_SYSCALL_IP as u64,
    );
    let mut filters = filter.filters;
    let prog = sock_fprog {
        len: filters.len().try_into().unwrap(),
        filter: filters.as_mut_ptr(),
    };
    unsafe {
        if libc::prctl(PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0
            || libc::prctl(
                libc::PR_SET_SECCOMP,
                libc::SECCOMP_MODE_FILTER,
                &prog as *const sock_fprog,
            ) != 0
        {
            libc::_exit(125);
        }
    }
}
