//! The recording tracer loop: schedule one task, run it to its next stop
//! of interest, classify the stop, record frames, repeat. At most one
//! tracee runs at any moment, so every mutation of session state happens
//! while the affected tracee is stopped.

use super::session_inner::SessionInner;
use super::task::task_inner::{ResumeRequest, TicksRequest, WaitRequest};
use super::task::{Task, TaskSharedPtr, TaskState};
use crate::auto_remote_syscalls::{map_syscall_stub_page, recv_fd};
use crate::bindings::ptrace::*;
use crate::event::{
    DeschedEventData, DeschedState, Event, Switchable, SyscallEventData, SyscallState,
};
use crate::kernel_abi::NATIVE_ARCH;
use crate::log::LogLevel::{LogDebug, LogInfo, LogWarn};
use crate::perf_counters::init_pmu;
use crate::preload_interface::{
    mprotect_record, preload_globals, syscallbuf_record, SYSCALLBUF_HDR_SIZE,
    SYSCALLBUF_LIB_FILENAME, SYS_rtcall_flush_syscallbuf, SYS_rtcall_init_buffers,
    SYS_rtcall_init_preload,
};
use crate::record_signal::{classify_signal, SignalOutcome};
use crate::record_syscall::{rec_prepare_syscall, rec_process_syscall_exit};
use crate::remote_ptr::RemotePtr;
use crate::scheduler::Scheduler;
use crate::sig::Sig;
use crate::trace::trace_stream::{MappedDataSource, RawDataRecord};
use crate::trace::trace_writer::TraceWriter;
use crate::util::{read_proc_maps, syscallbuf_enabled};
use crate::wait_status::WaitType;
use libc::pid_t;
use std::cell::RefCell;
use std::convert::TryFrom;
use std::env;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::rc::Rc;

/// One iteration of the record loop either made progress or found the
/// tracee tree gone.
pub enum RecordResult {
    StepContinue,
    AllExited {
        /// Status of the initial task, mirrored as our exit code.
        exit_status: i32,
    },
}

pub struct RecordSession {
    pub inner: SessionInner,
    scheduler: Scheduler,
    trace_out: TraceWriter,
    syscallbuf_enabled: bool,
    /// tgid of the task we report the exit status of.
    initial_tgid: pid_t,
    initial_exit_status: i32,
}

impl RecordSession {
    /// Spawn `exe` under trace and return the session with the initial
    /// task stopped just after its exec.
    pub fn create(exe: &OsStr, args: &[OsString]) -> RecordSession {
        init_pmu();
        let syscallbuf = syscallbuf_enabled();

        let mut argv: Vec<OsString> = vec![exe.to_os_string()];
        argv.extend_from_slice(args);

        let mut envp: Vec<OsString> = env::vars_os()
            .map(|(mut k, v)| {
                k.push("=");
                k.push(v);
                k
            })
            .collect();
        if syscallbuf {
            match find_preload_lib() {
                Some(lib) => {
                    let mut e = OsString::from("LD_PRELOAD=");
                    e.push(lib);
                    envp.push(e);
                }
                None => {
                    log!(
                        LogWarn,
                        "{} not found; recording without syscall buffering",
                        SYSCALLBUF_LIB_FILENAME
                    );
                }
            }
        }

        let mut trace_out = TraceWriter::new(exe);
        let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        trace_out.write_args_env(exe, &argv, &envp, cwd.as_os_str());

        let (tid, tracer_sock) = Task::spawn(exe, &argv, &envp, true);

        let mut inner = SessionInner::new();
        let vm = inner.vm_create(exe);
        let serial = inner.next_task_serial();
        let mut t = Task::new(tid, tid, tid, serial, vm);
        t.session_sock = tracer_sock;
        t.open_mem_fd();
        // We're stopped at the exec event; ptrace stops report Runnable.
        t.state = TaskState::Runnable;
        t.refresh_registers();
        map_syscall_stub_page(&mut t);

        let mut session = RecordSession {
            scheduler: Scheduler::new(),
            trace_out,
            syscallbuf_enabled: syscallbuf,
            initial_tgid: tid,
            initial_exit_status: 0,
            inner,
        };
        session.snapshot_exec_mappings(&mut t);
        session.scheduler.on_create(tid, t.priority);
        session.inner.add_task(tid, Rc::new(RefCell::new(t)));
        session
    }

    pub fn trace_writer(&self) -> &TraceWriter {
        &self.trace_out
    }

    pub fn trace_writer_mut(&mut self) -> &mut TraceWriter {
        &mut self.trace_out
    }

    /// Read the post-exec memory layout into the vm model and the trace.
    fn snapshot_exec_mappings(&mut self, t: &mut Task) {
        let time = self.trace_out.time();
        for km in read_proc_maps(t.tid) {
            let source = if km.is_file_backed() && !km.is_shared() {
                MappedDataSource::SourceFile
            } else {
                MappedDataSource::SourceZero
            };
            self.trace_out.write_mapping(&km, source, time, None);
            self.inner.vm_mut(t.vm).map(km, None);
        }
    }

    /// Write one frame for `t` and restart its event counter: frame ticks
    /// are "ticks since this task's previous frame". Timeslice accounting
    /// runs on the task's lifetime counter and is untouched here.
    fn write_frame(&mut self, t: &mut Task, event: Event, raw: &[RawDataRecord]) {
        self.trace_out
            .write_frame(t.rec_tid, event, &t.regs, &t.extra_regs, t.ticks, raw);
        t.on_frame_recorded();
    }

    /// One iteration: schedule, run, classify, record.
    pub fn record_step(&mut self) -> RecordResult {
        let t_ptr = match self.scheduler.get_next_task(&self.inner) {
            Some(t) => t,
            None => {
                return RecordResult::AllExited {
                    exit_status: self.initial_exit_status,
                }
            }
        };

        {
            let mut t = t_ptr.borrow_mut();
            if t.state == TaskState::Runnable {
                // Deliver any deferred async signal first, now that the
                // ring is quiescent again.
                if t.has_stashed_sig() && !self.in_syscallbuf_critical_section(&t) {
                    if let Some((sig, si)) = t.pop_stashed_sig() {
                        self.maybe_flush_syscallbuf(&mut t, false);
                        let sed = crate::event::SignalEventData::new(
                            &si,
                            crate::event::SignalDeterministic::NondeterministicSig,
                        );
                        self.write_frame(&mut t, Event::Signal(sed), &[]);
                        t.pending_sig = Some(sig);
                    }
                }
                self.resume_task(&mut t);
                if t.state == TaskState::Running {
                    // Switchable syscall in flight; let the scheduler find
                    // other work (or block for any stop).
                    return RecordResult::StepContinue;
                }
            }
        }

        self.process_stop(&t_ptr)
    }

    /// Resume `t` appropriately for its position in the syscall state
    /// machine, and wait unless it entered a may-block syscall.
    fn resume_task(&mut self, t: &mut Task) {
        let ticks_left = self.scheduler.interrupt_after(t.ticks_total);
        let how = if t.in_syscall {
            ResumeRequest::ResumeSyscall
        } else {
            ResumeRequest::ResumeCont
        };
        let sig = t.pending_sig.take();
        if t.in_syscall {
            // Waiting for a syscall exit that may never come (blocking
            // call): resume without waiting, the desched event or a
            // wait-any will tell us when something happens.
            t.resume_execution(how, WaitRequest::ResumeNonblocking, TicksRequest::ResumeNoTicks, sig);
        } else {
            t.resume_execution(
                how,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeWithTicksRequest(ticks_left),
                sig,
            );
        }
    }

    fn process_stop(&mut self, t_ptr: &TaskSharedPtr) -> RecordResult {
        let mut t = t_ptr.borrow_mut();
        match t.wait_status.wait_type() {
            WaitType::Exit | WaitType::FatalSignal => {
                self.record_exit(&mut t);
                drop(t);
                let rec_tid = t_ptr.borrow().rec_tid;
                let priority = t_ptr.borrow().priority;
                self.scheduler.on_destroy(rec_tid, priority);
                self.inner.on_task_destroyed(rec_tid);
                if self.inner.task_count() == 0 {
                    return RecordResult::AllExited {
                        exit_status: self.initial_exit_status,
                    };
                }
            }
            WaitType::PtraceEvent => self.process_ptrace_event(&mut t),
            WaitType::SyscallStop => {
                if t.state == TaskState::AtSyscallExit {
                    self.process_syscall_exit(&mut t);
                } else {
                    // Raw syscall-entry stops only occur for the allowed
                    // numbers (clone/fork handled via their events) and
                    // restart_syscall; run them to completion.
                    t.in_syscall = true;
                    t.resume_execution(
                        ResumeRequest::ResumeSyscall,
                        WaitRequest::ResumeNonblocking,
                        TicksRequest::ResumeNoTicks,
                        None,
                    );
                }
            }
            WaitType::SignalStop => self.process_signal_stop(&mut t),
            WaitType::GroupStop => {
                // Nothing to record; pass the stop through.
                t.state = TaskState::Runnable;
            }
        }
        RecordResult::StepContinue
    }

    fn record_exit(&mut self, t: &mut Task) {
        let status = t.wait_status;
        let event = if t.unstable {
            Event::UnstableExit
        } else {
            Event::Exit(status.get())
        };
        log!(LogInfo, "task {} exited with {}", t.tid, status);
        self.write_frame(t, event, &[]);
        if t.tgid == self.initial_tgid {
            self.initial_exit_status = match (status.exit_code(), status.fatal_sig()) {
                (Some(code), _) => code,
                (_, Some(sig)) => 128 + sig,
                _ => 0,
            };
        }
    }

    fn process_ptrace_event(&mut self, t: &mut Task) {
        match t.maybe_ptrace_event() {
            Some(PTRACE_EVENT_SECCOMP) => self.process_syscall_entry(t),
            Some(PTRACE_EVENT_CLONE) | Some(PTRACE_EVENT_FORK) | Some(PTRACE_EVENT_VFORK) => {
                self.process_clone_event(t)
            }
            Some(PTRACE_EVENT_EXEC) => self.process_exec_event(t),
            Some(PTRACE_EVENT_EXIT) => {
                // The task is on its way out; the final status arrives as
                // a real exit. If it dies inside a syscall there will be
                // no matching exit frame, which Event::UnstableExit marks.
                if t.in_syscall {
                    t.unstable = true;
                }
                t.resume_execution(
                    ResumeRequest::ResumeCont,
                    WaitRequest::ResumeNonblocking,
                    TicksRequest::ResumeNoTicks,
                    None,
                );
            }
            other => {
                ed_assert!(&t, false, "unhandled ptrace event {:?}", other);
            }
        }
    }

    /// A seccomp-TRACE stop: the traced-path syscall entry.
    fn process_syscall_entry(&mut self, t: &mut Task) {
        let syscallno = t.regs.original_syscallno();

        if self.process_rtcall(t, syscallno) {
            return;
        }

        self.maybe_flush_syscallbuf(t, false);

        let event = Event::Syscall(SyscallEventData {
            state: SyscallState::EnteringSyscall,
            number: syscallno,
            arch: NATIVE_ARCH,
        });
        self.write_frame(t, event, &[]);

        if syscallno == libc::SYS_sched_yield {
            self.scheduler.schedule_all_round_robin();
        }

        let switchable = rec_prepare_syscall(t);
        t.in_syscall = true;
        match switchable {
            Switchable::PreventSwitch => {
                // Run the syscall to completion now; nothing else may be
                // scheduled until its effects are recorded.
                t.resume_execution(
                    ResumeRequest::ResumeSyscall,
                    WaitRequest::ResumeWait,
                    TicksRequest::ResumeNoTicks,
                    None,
                );
                if t.state == TaskState::AtSyscallExit {
                    self.process_syscall_exit(t);
                } else if t.maybe_ptrace_event().is_some() {
                    // The syscall turned into an event (exec, a nested
                    // clone); classify it right here so the stop isn't
                    // lost.
                    self.process_ptrace_event(t);
                } else if t.state == TaskState::StoppedBySignal {
                    self.process_signal_stop(t);
                }
            }
            Switchable::AllowSwitch => {
                t.resume_execution(
                    ResumeRequest::ResumeSyscall,
                    WaitRequest::ResumeNonblocking,
                    TicksRequest::ResumeNoTicks,
                    None,
                );
            }
        }
    }

    fn process_syscall_exit(&mut self, t: &mut Task) {
        let time_hint = self.trace_out.time();
        let raw = rec_process_syscall_exit(t, &mut self.inner, &mut self.trace_out, time_hint);
        let syscallno = t.regs.original_syscallno();
        let event = Event::Syscall(SyscallEventData {
            state: SyscallState::ExitingSyscall,
            number: syscallno,
            arch: NATIVE_ARCH,
        });
        self.write_frame(t, event, &raw);

        if t.desched_armed {
            // This was the blocked buffered syscall the desched event
            // flagged; tell the shim to drop its own (duplicate) record
            // and close the desched bracket. Each syscall must appear in
            // the trace exactly once.
            t.set_abort_commit();
            self.write_frame(t, Event::SyscallbufAbortCommit, &[]);
            let event = Event::Desched(DeschedEventData {
                state: DeschedState::DisarmingDesched,
                inner_syscallno: syscallno,
            });
            self.write_frame(t, event, &[]);
            t.desched_armed = false;
        }
        // Stop fully consumed.
        t.state = TaskState::Runnable;
    }

    /// Is the tracee inside the shim's prep..commit critical section? No
    /// interrupt or async signal may be recorded there: an interrupted
    /// wrapper would leave an executed-but-uncommitted record whose
    /// results replay can't supply.
    fn in_syscallbuf_critical_section(&self, t: &Task) -> bool {
        match t.read_syscallbuf_hdr() {
            Some(hdr) => hdr.locked & crate::preload_interface::SYSCALLBUF_LOCKED_TRACEE != 0,
            None => false,
        }
    }

    fn process_signal_stop(&mut self, t: &mut Task) {
        match classify_signal(t) {
            SignalOutcome::TimeSliceExpired => {
                if self.in_syscallbuf_critical_section(t) {
                    // Try again once the wrapper commits.
                    t.state = TaskState::Runnable;
                    return;
                }
                log!(LogDebug, "timeslice of {} expired", t.tid);
                self.maybe_flush_syscallbuf(t, false);
                self.write_frame(t, Event::Sched, &[]);
                t.state = TaskState::Runnable;
                // choose_runnable rotates away from an expired task by
                // itself; nothing else to do.
            }
            SignalOutcome::DeschedFired => self.process_desched(t),
            SignalOutcome::ConsumedSilently => {
                t.state = TaskState::Runnable;
            }
            SignalOutcome::EmulatedRdtsc { .. } => {
                self.write_frame(t, Event::InstructionTrap, &[]);
                t.state = TaskState::Runnable;
            }
            SignalOutcome::Deliver(sed) => {
                let sig = Sig::try_from(sed.signo()).unwrap();
                if sed.deterministic == crate::event::SignalDeterministic::NondeterministicSig
                    && self.in_syscallbuf_critical_section(t)
                {
                    // Deferred past the wrapper's commit.
                    t.stash_sig(sig, &sed.siginfo);
                    t.state = TaskState::Runnable;
                    return;
                }
                self.maybe_flush_syscallbuf(t, false);
                log!(LogDebug, "recording {} for task {}", sig, t.tid);
                self.write_frame(t, Event::Signal(sed), &[]);
                t.pending_sig = Some(sig);
                t.state = TaskState::Runnable;
            }
        }
    }

    /// The desched event fired inside a buffered may-block syscall: the
    /// task is blocked. Record the desched bracket and the in-progress
    /// syscall through the traced path, then let the scheduler move on.
    fn process_desched(&mut self, t: &mut Task) {
        // The record being filled sits at the ring's current end; its
        // header names the inner syscall.
        let inner_syscallno = match t.read_syscallbuf_hdr() {
            Some(hdr) => {
                let rec_ptr: RemotePtr<syscallbuf_record> = RemotePtr::cast(
                    t.syscallbuf_child + SYSCALLBUF_HDR_SIZE + hdr.num_rec_bytes as usize,
                );
                t.read_val(rec_ptr).map(|rec: syscallbuf_record| rec.syscallno as i64)
            }
            None => None,
        }
        .unwrap_or_else(|| t.regs.original_syscallno());

        self.maybe_flush_syscallbuf(t, true);

        let event = Event::Desched(DeschedEventData {
            state: DeschedState::ArmingDesched,
            inner_syscallno,
        });
        self.write_frame(t, event, &[]);

        let event = Event::Syscall(SyscallEventData {
            state: SyscallState::EnteringSyscall,
            number: inner_syscallno,
            arch: NATIVE_ARCH,
        });
        self.write_frame(t, event, &[]);

        t.in_syscall = true;
        t.desched_armed = true;
        // Resume without delivering the SIGIO; the tracee goes back to
        // blocking in the kernel.
        t.resume_execution(
            ResumeRequest::ResumeSyscall,
            WaitRequest::ResumeNonblocking,
            TicksRequest::ResumeNoTicks,
            None,
        );
    }

    fn process_clone_event(&mut self, t: &mut Task) {
        let new_tid = match t.get_event_msg() {
            Some(tid) => tid,
            None => {
                ed_assert!(&t, false, "clone event without child tid");
                unreachable!()
            }
        };
        let is_clone = t.maybe_ptrace_event() == Some(PTRACE_EVENT_CLONE);
        let shares_vm = is_clone && (t.regs.arg1() as i32) & libc::CLONE_VM != 0;

        // The child pops into existence in a stop; collect it.
        let mut status: i32 = 0;
        unsafe { libc::waitpid(new_tid, &mut status, libc::__WALL) };

        let vm = if shares_vm {
            self.inner.vm_ref(t.vm);
            t.vm
        } else {
            self.inner.vm_fork(t.vm)
        };
        let tgid = if is_clone && (t.regs.arg1() as i32) & libc::CLONE_THREAD != 0 {
            t.tgid
        } else {
            new_tid
        };
        let serial = self.inner.next_task_serial();
        let mut child = Task::new(new_tid, new_tid, tgid, serial, vm);
        child.open_mem_fd();
        child.state = TaskState::Runnable;
        child.refresh_registers();
        child.priority = t.priority;
        if t.session_sock.is_open() {
            // All tasks funnel fd transfers through the one socketpair.
            let dupfd = unsafe { libc::dup(t.session_sock.as_raw()) };
            if dupfd >= 0 {
                child.session_sock = crate::scoped_fd::ScopedFd::from_raw(dupfd);
            }
        }
        log!(
            LogInfo,
            "new task {} (tgid {}) cloned from {}",
            new_tid,
            tgid,
            t.tid
        );
        self.scheduler.on_create(new_tid, child.priority);
        self.inner.add_task(new_tid, Rc::new(RefCell::new(child)));

        // The clone syscall in the parent was allowed by the filter, so
        // synthesize its entry frame here and run it to its exit stop.
        let event = Event::Syscall(SyscallEventData {
            state: SyscallState::EnteringSyscall,
            number: t.regs.original_syscallno(),
            arch: NATIVE_ARCH,
        });
        self.write_frame(t, event, &[]);
        t.in_syscall = true;
        t.resume_execution(
            ResumeRequest::ResumeSyscall,
            WaitRequest::ResumeWait,
            TicksRequest::ResumeNoTicks,
            None,
        );
        if t.state == TaskState::AtSyscallExit {
            self.process_syscall_exit(t);
        }
    }

    fn process_exec_event(&mut self, t: &mut Task) {
        log!(LogInfo, "task {} exec'd", t.tid);
        // The old mm is gone, syscallbuf and all.
        t.syscallbuf_child = RemotePtr::null();
        t.preload_globals_child = RemotePtr::null();
        t.desched_fd_child = -1;
        t.desched_fd.close();
        t.open_mem_fd();
        t.refresh_registers();
        let exe = self.inner.vm(t.vm).exe_name().to_os_string();
        self.inner.vm_mut(t.vm).post_exec(&exe);

        // Run to the execve exit stop first; the remote syscalls that set
        // up the stub page would otherwise swallow it.
        t.resume_execution(
            ResumeRequest::ResumeSyscall,
            WaitRequest::ResumeWait,
            TicksRequest::ResumeNoTicks,
            None,
        );
        if t.state != TaskState::AtSyscallExit {
            // Killed mid-exec; the exit machinery picks it up.
            return;
        }
        map_syscall_stub_page(t);
        self.snapshot_exec_mappings(t);
        self.process_syscall_exit(t);
    }

    /// Intercept the shim's pseudo-syscalls. Returns true when the stop
    /// was one of them and has been fully handled.
    fn process_rtcall(&mut self, t: &mut Task, syscallno: i64) -> bool {
        match syscallno {
            SYS_rtcall_init_preload => {
                t.preload_globals_child = RemotePtr::new(t.regs.arg1());
                log!(
                    LogInfo,
                    "shim initialized in {}; globals at {:#x}",
                    t.tid,
                    t.regs.arg1()
                );
            }
            SYS_rtcall_init_buffers => {
                self.process_init_buffers(t);
            }
            SYS_rtcall_flush_syscallbuf => {
                self.maybe_flush_syscallbuf(t, true);
            }
            _ => return false,
        }

        // The number is invalid as far as the kernel is concerned; let it
        // bounce off and overwrite the result with success so the shim
        // sees a clean handshake. The bounced result is ENOSYS, which is
        // also the kernel's entry sentinel, so this stop is the exit no
        // matter how it classifies.
        t.resume_execution(
            ResumeRequest::ResumeSyscall,
            WaitRequest::ResumeWait,
            TicksRequest::ResumeNoTicks,
            None,
        );
        if matches!(t.state, TaskState::AtSyscallEntry | TaskState::AtSyscallExit) {
            t.regs.set_syscall_result(0);
            t.registers_dirty = true;
            t.in_syscall = false;
            // The shim executes during replay too and re-issues the same
            // rtcalls, so they get ordinary frames for the driver to step
            // to.
            let event = Event::Syscall(SyscallEventData {
                state: SyscallState::EnteringSyscall,
                number: syscallno,
                arch: NATIVE_ARCH,
            });
            self.write_frame(t, event, &[]);
            let event = Event::Syscall(SyscallEventData {
                state: SyscallState::ExitingSyscall,
                number: syscallno,
                arch: NATIVE_ARCH,
            });
            self.write_frame(t, event, &[]);
            t.state = TaskState::Runnable;
        }
        true
    }

    /// rtcall_init_buffers: the shim passes its ring address and desched
    /// fd number; the desched fd itself arrives over the socketpair.
    fn process_init_buffers(&mut self, t: &mut Task) {
        t.syscallbuf_child = RemotePtr::new(t.regs.arg1());
        t.desched_fd_child = t.regs.arg2() as i32;
        if t.session_sock.is_open() {
            match recv_fd(&t.session_sock) {
                Some(fd) => t.desched_fd = fd,
                None => log!(LogWarn, "didn't receive desched fd from {}", t.tid),
            }
        }
        log!(
            LogInfo,
            "task {} ring at {:#x}, desched fd {} (tracee side)",
            t.tid,
            t.regs.arg1(),
            t.desched_fd_child
        );
    }

    /// If the task's ring holds committed records, write them out as a
    /// flush frame and reset the ring. `even_if_locked` is for the
    /// desched path, where abort_commit keeps the in-progress record from
    /// double-counting.
    fn maybe_flush_syscallbuf(&mut self, t: &mut Task, even_if_locked: bool) {
        if !self.syscallbuf_enabled || !t.has_syscallbuf() {
            return;
        }
        let hdr = match t.read_syscallbuf_hdr() {
            Some(hdr) => hdr,
            None => return,
        };
        if hdr.num_rec_bytes == 0 {
            return;
        }
        if hdr.locked != 0 && !even_if_locked {
            return;
        }
        let ring = match t.read_ring_prefix() {
            Some(ring) => ring,
            None => return,
        };
        log!(
            LogDebug,
            "flushing {} ring bytes of task {}",
            ring.len(),
            t.tid
        );
        let raw = [RawDataRecord {
            addr: t.syscallbuf_child.as_usize(),
            rec_tid: t.rec_tid,
            data: ring,
        }];
        self.write_frame(t, Event::SyscallbufFlush, &raw);

        self.apply_buffered_mprotects(t);
        t.reset_syscallbuf();
    }

    /// Buffered mprotect calls queue their effects in preload_globals;
    /// apply them to the vm model at flush time.
    fn apply_buffered_mprotects(&mut self, t: &mut Task) {
        if t.preload_globals_child.is_null() {
            return;
        }
        let globals_ptr: RemotePtr<preload_globals> = RemotePtr::cast(t.preload_globals_child);
        let count_addr = RemotePtr::<u32>::new(
            globals_ptr.as_usize() + offset_of!(preload_globals, mprotect_record_count),
        );
        let count: u32 = match t.read_val(count_addr) {
            Some(c) => c,
            None => return,
        };
        let base = globals_ptr.as_usize() + offset_of!(preload_globals, mprotect_records);
        for i in 0..count.min(crate::preload_interface::MPROTECT_RECORD_COUNT as u32) {
            let rec_addr = RemotePtr::<mprotect_record>::new(
                base + i as usize * std::mem::size_of::<mprotect_record>(),
            );
            if let Some(rec) = t.read_val(rec_addr) {
                self.inner.vm_mut(t.vm).protect(
                    RemotePtr::new(rec.start as usize),
                    rec.size as usize,
                    rec.prot,
                );
            }
        }
        let zero: u32 = 0;
        t.write_val(count_addr, &zero);
    }

    /// Close out the trace. The final frame count is logged for the
    /// user's benefit.
    pub fn finish_recording(&mut self) {
        let frames = self.trace_out.time();
        self.trace_out.close();
        log!(LogInfo, "recording finished: {} frames", frames);
    }
}

/// The shim library is looked up next to our own binary, or wherever
/// RETRACE_PRELOAD_LIB points.
fn find_preload_lib() -> Option<OsString> {
    if let Some(p) = env::var_os("RETRACE_PRELOAD_LIB") {
        return Some(p);
    }
    let exe = std::fs::read_link("/proc/self/exe").ok()?;
    let dir = exe.parent()?;
    let candidate = dir.join(SYSCALLBUF_LIB_FILENAME);
    if candidate.exists() {
        return Some(candidate.into_os_string());
    }
    None
}
