//! The unit of scheduling: one kernel task (thread) under ptrace. A
//! single concrete struct serves recording, replay and diversion; the
//! variant-specific behavior lives in the sessions, not in a task class
//! hierarchy.

pub mod record_task;
pub mod replay_task;
pub mod task_inner;

use crate::bindings::signal::siginfo_t;
use crate::extra_registers::ExtraRegisters;
use crate::kernel_abi::NATIVE_ARCH;
use crate::log::LogLevel::LogDebug;
use crate::perf_counters::PerfCounters;
use crate::registers::Registers;
use crate::remote_ptr::{RemotePtr, Void};
use crate::scoped_fd::ScopedFd;
use crate::session::AddressSpaceId;
use crate::sig::Sig;
use crate::ticks::Ticks;
use crate::wait_status::WaitStatus;
use libc::pid_t;
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use task_inner::ResumeRequest;

pub type TaskSharedPtr = Rc<RefCell<Task>>;
pub type TaskSharedWeakPtr = Weak<RefCell<Task>>;

/// Where the task is in its lifecycle, as far as the tracer knows.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum TaskState {
    /// Stopped, eligible to run.
    Runnable,
    /// Resumed and not yet reported back.
    Running,
    StoppedBySignal,
    AtSyscallEntry,
    AtSyscallExit,
    Exited,
}

pub struct Task {
    /// The tid of the live task. During replay this is the replayed
    /// task's real tid, which can differ from `rec_tid`.
    pub tid: pid_t,
    /// The tid as recorded in the trace; the key in the session's table.
    pub rec_tid: pid_t,
    pub tgid: pid_t,
    /// Session-unique, survives tid reuse.
    pub serial: u32,
    pub vm: AddressSpaceId,

    pub regs: Registers,
    pub extra_regs: ExtraRegisters,
    /// regs were modified and must be pushed back before the next resume.
    pub registers_dirty: bool,
    pub extra_registers_known: bool,

    pub state: TaskState,
    pub wait_status: WaitStatus,
    pub pending_siginfo: siginfo_t,
    /// The signal to hand the tracee at its next resume.
    pub pending_sig: Option<Sig>,

    /// Retired conditional branches since the last recorded event.
    /// Zeroed every time a frame is written for this task.
    pub ticks: Ticks,
    /// Lifetime retired-conditional-branch count. Never reset; this is
    /// what timeslice accounting keys off, so that per-frame resets of
    /// `ticks` can't hand a chatty task a fresh slice at every syscall.
    pub ticks_total: Ticks,
    pub hpc: PerfCounters,
    /// The counter was programmed for the in-flight resume; only then is
    /// its value a fresh delta worth accumulating at the next stop.
    pub ticks_programmed: bool,

    /// Open handle on /proc/<tid>/mem.
    pub child_mem_fd: ScopedFd,
    /// Tracer-owned dup of the tracee's desched event fd, received over
    /// SCM_RIGHTS at buffer setup so the tracee can't close or reprogram
    /// it out from under us.
    pub desched_fd: ScopedFd,
    /// Tracer end of the fd-transfer socketpair with this task.
    pub session_sock: ScopedFd,
    /// The desched event's fd number inside the tracee, for matching
    /// SIGIO siginfo against it. -1 until buffers are set up.
    pub desched_fd_child: i32,

    /// The thread's syscallbuf ring in tracee coordinates; null until the
    /// shim announces it.
    pub syscallbuf_child: RemotePtr<Void>,
    /// The shim's preload_globals in tracee coordinates.
    pub preload_globals_child: RemotePtr<Void>,

    pub priority: i32,
    pub in_round_robin_queue: bool,
    /// Between an observed syscall entry and its exit.
    pub in_syscall: bool,
    /// A desched event is currently armed for a buffered syscall.
    pub desched_armed: bool,
    pub seen_ptrace_exit_event: bool,
    /// Task is dying in a way that can't produce a clean exit frame.
    pub unstable: bool,

    pub how_last_resumed: ResumeRequest,

    /// Signals that arrived while we were busy with something that must
    /// not be interrupted; delivered at the next opportunity.
    pub stashed_signals: Vec<(Sig, siginfo_t)>,
}

impl Task {
    pub fn new(tid: pid_t, rec_tid: pid_t, tgid: pid_t, serial: u32, vm: AddressSpaceId) -> Task {
        Task {
            tid,
            rec_tid,
            tgid,
            serial,
            vm,
            regs: Registers::new(NATIVE_ARCH),
            extra_regs: ExtraRegisters::new(NATIVE_ARCH),
            registers_dirty: false,
            extra_registers_known: false,
            state: TaskState::Runnable,
            wait_status: WaitStatus::default(),
            pending_siginfo: siginfo_t::default(),
            pending_sig: None,
            ticks: 0,
            ticks_total: 0,
            hpc: PerfCounters::new(tid),
            ticks_programmed: false,
            child_mem_fd: ScopedFd::new(),
            desched_fd: ScopedFd::new(),
            session_sock: ScopedFd::new(),
            desched_fd_child: -1,
            syscallbuf_child: RemotePtr::null(),
            preload_globals_child: RemotePtr::null(),
            priority: 0,
            in_round_robin_queue: false,
            in_syscall: false,
            desched_armed: false,
            seen_ptrace_exit_event: false,
            unstable: false,
            how_last_resumed: ResumeRequest::ResumeCont,
            stashed_signals: Vec::new(),
        }
    }

    pub fn is_stopped(&self) -> bool {
        !matches!(self.state, TaskState::Running)
    }

    pub fn has_exited(&self) -> bool {
        self.state == TaskState::Exited
    }

    pub fn ip(&self) -> crate::remote_code_ptr::RemoteCodePtr {
        self.regs.ip()
    }

    /// Credit freshly retired branches to both the per-event counter and
    /// the lifetime counter.
    pub fn accumulate_ticks(&mut self, delta: Ticks) {
        self.ticks += delta;
        self.ticks_total += delta;
    }

    /// A frame was written for this task: restart the per-event counter.
    /// The lifetime counter is deliberately left alone.
    pub fn on_frame_recorded(&mut self) {
        self.ticks = 0;
    }

    /// Last-resort teardown: SIGKILL and detach. Used by
    /// kill_all_tasks; normal exits go through the exit events.
    pub fn kill(t: &mut Task) {
        if t.has_exited() {
            return;
        }
        log!(LogDebug, "sending SIGKILL to task {}", t.tid);
        unsafe {
            libc::syscall(libc::SYS_tgkill, t.tgid, t.tid, libc::SIGKILL);
        }
        // Reap whatever stop the kill produces so the zombie doesn't
        // linger; the task may already be gone, ignore errors.
        let mut status = 0i32;
        unsafe { libc::waitpid(t.tid, &mut status, libc::__WALL) };
        t.state = TaskState::Exited;
    }
}
