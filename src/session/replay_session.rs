//! The replay driver: read frames in order, steer the addressed task to
//! the exact point the frame was recorded at, and re-create its effects
//! from the trace instead of the world.
//!
//! Execution is driven with the SYSEMU resume modes so no tracee syscall
//! ever reaches the kernel unless we decide it must (process-tree and
//! memory-management calls). Buffered-period syscalls are emulated at the
//! untraced entry stop from the ring records carried by the preceding
//! flush frame.

use super::session_inner::SessionInner;
use super::task::task_inner::{ResumeRequest, TicksRequest, WaitRequest};
use super::task::{Task, TaskSharedPtr, TaskState};
use crate::auto_remote_syscalls::map_syscall_stub_page;
use crate::bindings::ptrace::*;
use crate::emu_fs::{EmuFs, EmuFsSharedPtr};
use crate::event::{Event, SignalDeterministic, SyscallState};
use crate::log::LogLevel::{LogDebug, LogInfo};
use crate::perf_counters::{init_pmu, SKID_SIZE, TIME_SLICE_SIGNAL};
use crate::preload_interface::{
    preload_globals, syscallbuf_record, RETRACE_PAGE_UNTRACED_SYSCALL_IP,
    SYSCALLBUF_HDR_SIZE, SYSCALLBUF_RECORD_HEADER_SIZE, SYS_rtcall_flush_syscallbuf,
    SYS_rtcall_init_buffers, SYS_rtcall_init_preload,
};
use crate::remote_ptr::RemotePtr;
use crate::replay_syscall::{executes_live, rep_apply_mm_effects, rep_process_mmap, replays_via_remote_mm};
use crate::sig::Sig;
use crate::trace::trace_frame::TraceFrame;
use crate::trace::trace_reader::{TraceMapping, TraceReader};
use crate::trace::trace_stream::RawDataRecord;
use crate::trace::TraceError;
use crate::wait_status::WaitType;
use libc::pid_t;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::convert::TryFrom;
use std::path::Path;
use std::rc::Rc;

pub enum ReplayStatus {
    ReplayContinue,
    ReplayedAllEvents,
}

/// One ring record from a flush frame, queued for consumption at the
/// untraced entry stops of the following buffered period.
struct RingRecord {
    /// Offset of the record within the ring's record area.
    offset: usize,
    syscallno: i64,
    ret: i64,
    payload: Vec<u8>,
}

pub struct ReplaySession {
    pub inner: SessionInner,
    trace_in: TraceReader,
    emu_fs: EmuFsSharedPtr,
    pending_mapping: Option<TraceMapping>,
    /// Real tid of the most recently adopted clone child, pending re-key
    /// under its recorded tid.
    last_cloned_child: Option<pid_t>,
    /// Per-task queues of ring records loaded from flush frames.
    ring_records: HashMap<pid_t, VecDeque<RingRecord>>,
    /// A Desched(arming) frame announced that the next untraced stop is
    /// a traced-path syscall, per task.
    desched_active: HashMap<pid_t, bool>,
}

impl ReplaySession {
    pub fn create(dir: Option<&Path>) -> Result<ReplaySession, TraceError> {
        init_pmu();
        let trace_in = TraceReader::open(dir)?;
        let args_env = trace_in.args_env().clone();

        let _ = std::env::set_current_dir(&args_env.cwd);
        let (tid, _tracer_sock) = Task::spawn(&args_env.exe, &args_env.argv, &args_env.envp, false);

        let mut inner = SessionInner::new();
        let vm = inner.vm_create(&args_env.exe);
        let serial = inner.next_task_serial();
        let mut t = Task::new(tid, tid, tid, serial, vm);
        t.open_mem_fd();
        t.state = TaskState::Runnable;
        t.refresh_registers();
        map_syscall_stub_page(&mut t);
        let rec_tid = t.rec_tid;
        inner.add_task(rec_tid, Rc::new(RefCell::new(t)));

        log!(LogInfo, "replaying {:?} from {:?}", args_env.exe, trace_in.dir());

        let mut session = ReplaySession {
            inner,
            trace_in,
            emu_fs: EmuFs::create(),
            pending_mapping: None,
            last_cloned_child: None,
            ring_records: HashMap::new(),
            desched_active: HashMap::new(),
        };
        // The recording starts with a layout snapshot of the initial
        // exec; our own exec of the same binary (ASLR off) re-created it,
        // so those records are consumed and dropped.
        session.drain_mapping_records(0);
        Ok(session)
    }

    pub fn trace_reader(&self) -> &TraceReader {
        &self.trace_in
    }

    pub fn emu_fs(&self) -> &EmuFsSharedPtr {
        &self.emu_fs
    }

    /// Replay one frame.
    pub fn replay_step(&mut self) -> Result<ReplayStatus, TraceError> {
        let (frame, raw) = match self.trace_in.read_frame()? {
            Some(x) => x,
            None => return Ok(ReplayStatus::ReplayedAllEvents),
        };

        log!(LogDebug, "replaying frame {}", frame);

        let t_ptr = match self.inner.find_task(frame.tid) {
            Some(t) => t,
            None => {
                return Err(TraceError::Corrupt(format!(
                    "frame {} addresses unknown task {}",
                    frame.time, frame.tid
                )))
            }
        };

        match &frame.event {
            Event::Syscall(sys) => match sys.state {
                SyscallState::EnteringSyscall => self.rep_syscall_enter(&t_ptr, &frame),
                SyscallState::ExitingSyscall => self.rep_syscall_exit(&t_ptr, &frame, &raw),
            },
            Event::Signal(_) => self.rep_signal(&t_ptr, &frame),
            Event::Sched => {
                let mut t = t_ptr.borrow_mut();
                self.land_at(&mut t, &frame);
                t.on_frame_recorded();
            }
            Event::SyscallbufFlush => self.rep_load_flush(&t_ptr, &frame, &raw),
            Event::SyscallbufAbortCommit => {
                let t = t_ptr.borrow_mut();
                t.set_abort_commit();
            }
            Event::Desched(d) => {
                self.desched_active.insert(
                    frame.tid,
                    d.state == crate::event::DeschedState::ArmingDesched,
                );
                t_ptr.borrow_mut().on_frame_recorded();
            }
            Event::InstructionTrap => self.rep_instruction_trap(&t_ptr, &frame),
            Event::Exit(_) | Event::UnstableExit => {
                self.rep_exit(&t_ptr, &frame);
            }
            Event::TraceTermination => return Ok(ReplayStatus::ReplayedAllEvents),
        }
        Ok(ReplayStatus::ReplayContinue)
    }

    // --- syscall frames ---

    fn rep_syscall_enter(&mut self, t_ptr: &TaskSharedPtr, frame: &TraceFrame) {
        let syscallno = match &frame.event {
            Event::Syscall(sys) => sys.number,
            _ => unreachable!(),
        };
        let mut t = t_ptr.borrow_mut();
        self.advance_to_syscall_entry(&mut t, frame, syscallno);
        self.process_rtcall_side_effects(&mut t, syscallno);
        t.on_frame_recorded();
    }

    fn rep_syscall_exit(&mut self, t_ptr: &TaskSharedPtr, frame: &TraceFrame, raw: &[RawDataRecord]) {
        let syscallno = match &frame.event {
            Event::Syscall(sys) => sys.number,
            _ => unreachable!(),
        };
        let mut t = t_ptr.borrow_mut();

        if executes_live(syscallno) {
            self.run_live_syscall_to_exit(&mut t, syscallno);
        }

        // Deposit the recorded outparams and the recorded register file
        // (result included).
        t.apply_all_data_records(raw);
        t.set_regs_from_trace(&frame.regs);

        if matches!(syscallno, libc::SYS_clone | libc::SYS_fork | libc::SYS_vfork) {
            if let Some(real_tid) = self.last_cloned_child.take() {
                let rec_child_tid = t.regs.syscall_result() as pid_t;
                drop(t);
                self.fixup_cloned_child(real_tid, rec_child_tid);
                t = t_ptr.borrow_mut();
            }
        } else if syscallno == libc::SYS_execve && !t.regs.syscall_failed() {
            map_syscall_stub_page(&mut t);
            // The exec-time layout snapshot re-creates itself through the
            // real exec; its mapping records are consumed and dropped.
            self.drain_mapping_records(frame.time);
        }

        if syscallno == libc::SYS_mmap && !t.regs.syscall_failed() {
            let mapping = self.take_mapping_record(frame.time);
            match mapping {
                Some(mapping) => {
                    let vm_id = t.vm;
                    // Model + real mapping via remote syscalls.
                    let emu_fs = self.emu_fs.clone();
                    let vm = self.inner.vm_mut(vm_id);
                    rep_process_mmap(&mut t, vm, &emu_fs, &mapping);
                }
                None => {
                    ed_assert!(&t, false, "mmap frame without a mapping record");
                }
            }
        } else if replays_via_remote_mm(syscallno) && !t.regs.syscall_failed() {
            if syscallno == libc::SYS_brk {
                // A growing brk wrote one mapping record; a shrink or a
                // first-probe brk wrote none.
                let vm_id = t.vm;
                let old_end = self.inner.vm(vm_id).brk_end();
                if !old_end.is_null() && t.regs.syscall_result() > old_end.as_usize() {
                    let _ = self.take_mapping_record(frame.time);
                }
            }
            let vm_id = t.vm;
            let vm = self.inner.vm_mut(vm_id);
            rep_apply_mm_effects(&mut t, vm, syscallno);
            // The remote calls clobbered the register file; restore the
            // recorded exit state.
            t.set_regs_from_trace(&frame.regs);
        }

        t.in_syscall = false;
        t.on_frame_recorded();
        // Stop fully consumed; the next advance starts from scratch.
        t.state = TaskState::Runnable;
    }

    /// clone/fork/execve actually execute; drive them from the entry stop
    /// through their ptrace events to the exit stop.
    fn run_live_syscall_to_exit(&mut self, t: &mut Task, syscallno: i64) {
        loop {
            let sig = t.pending_sig.take();
            t.resume_execution(
                ResumeRequest::ResumeSyscall,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeNoTicks,
                sig,
            );
            match t.wait_status.wait_type() {
                WaitType::SyscallStop => {
                    if t.state == TaskState::AtSyscallExit
                        && t.regs.original_syscallno() == syscallno
                    {
                        return;
                    }
                }
                WaitType::PtraceEvent => match t.maybe_ptrace_event() {
                    Some(PTRACE_EVENT_CLONE) | Some(PTRACE_EVENT_FORK)
                    | Some(PTRACE_EVENT_VFORK) => {
                        self.handle_live_clone(t);
                    }
                    Some(PTRACE_EVENT_EXEC) => {
                        self.handle_live_exec(t);
                    }
                    Some(PTRACE_EVENT_EXIT) => {
                        // exit/exit_group: no exit stop will come.
                        return;
                    }
                    other => {
                        ed_assert!(&*t, false, "unexpected event {:?} during live {}", other, syscallno);
                    }
                },
                WaitType::Exit | WaitType::FatalSignal => return,
                _ => {
                    ed_assert!(
                        &*t,
                        false,
                        "unexpected stop {} during live syscall {}",
                        t.wait_status,
                        syscallno
                    );
                }
            }
        }
    }

    /// A real clone happened during replay; adopt the child. Its recorded
    /// tid is the parent's recorded result, which arrives with the exit
    /// frame, so the child is registered under the *real* parent result
    /// for now and fixed up in rep_syscall_exit's register deposit.
    fn handle_live_clone(&mut self, t: &mut Task) {
        let new_tid = match t.get_event_msg() {
            Some(tid) => tid,
            None => {
                ed_assert!(&*t, false, "clone event without child tid");
                unreachable!()
            }
        };
        let mut status: i32 = 0;
        unsafe { libc::waitpid(new_tid, &mut status, libc::__WALL) };

        let is_clone = t.maybe_ptrace_event() == Some(PTRACE_EVENT_CLONE);
        let shares_vm = is_clone && (t.regs.arg1() as i32) & libc::CLONE_VM != 0;
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

        // Registered under the real tid for now; once the parent's exit
        // frame reveals the recorded child tid, fixup_cloned_child
        // re-keys it.
        let serial = self.inner.next_task_serial();
        let mut child = Task::new(new_tid, new_tid, tgid, serial, vm);
        child.open_mem_fd();
        child.state = TaskState::Runnable;
        child.refresh_registers();
        log!(LogInfo, "replay adopted child {} of {}", new_tid, t.tid);
        self.inner.add_task(new_tid, Rc::new(RefCell::new(child)));
        self.last_cloned_child = Some(new_tid);
    }

    /// Bookkeeping only; the stub page is mapped after the execve exit
    /// stop (remote syscalls from the event stop would swallow it).
    fn handle_live_exec(&mut self, t: &mut Task) {
        t.syscallbuf_child = RemotePtr::null();
        t.preload_globals_child = RemotePtr::null();
        t.desched_fd_child = -1;
        t.open_mem_fd();
        t.refresh_registers();
        let exe = self.inner.vm(t.vm).exe_name().to_os_string();
        self.inner.vm_mut(t.vm).post_exec(&exe);
    }

    /// After a clone exit frame is applied, the recorded child tid (the
    /// parent's recorded result) may differ from the real child tid; fix
    /// the task-table key so later frames find it.
    pub fn fixup_cloned_child(&mut self, real_tid: pid_t, rec_tid: pid_t) {
        if real_tid == rec_tid {
            return;
        }
        if let Some(child) = self.inner.find_task(real_tid) {
            // Re-key under the recorded tid.
            self.inner.on_task_destroyed(real_tid);
            {
                let mut c = child.borrow_mut();
                c.rec_tid = rec_tid;
                // on_task_destroyed dropped a vm ref; restore it.
            }
            let vm = child.borrow().vm;
            self.inner.vm_ref(vm);
            self.inner.add_task(rec_tid, child);
        }
    }

    /// rtcall frames drive tracer-side bookkeeping during replay too.
    fn process_rtcall_side_effects(&mut self, t: &mut Task, syscallno: i64) {
        match syscallno {
            SYS_rtcall_init_preload => {
                t.preload_globals_child = RemotePtr::new(t.regs.arg1());
                // Tell the shim it's living in a replay.
                let addr = RemotePtr::<u8>::new(
                    t.preload_globals_child.as_usize()
                        + offset_of!(preload_globals, in_replay),
                );
                let one: u8 = 1;
                t.write_val(addr, &one);
            }
            SYS_rtcall_init_buffers => {
                t.syscallbuf_child = RemotePtr::new(t.regs.arg1());
                t.desched_fd_child = t.regs.arg2() as i32;
            }
            SYS_rtcall_flush_syscallbuf => (),
            _ => (),
        }
    }

    // --- advancing ---

    /// Run the task forward to its next traced syscall entry and check it
    /// is the recorded one. Untraced stops on the way are emulated from
    /// the ring-record queue.
    fn advance_to_syscall_entry(&mut self, t: &mut Task, frame: &TraceFrame, syscallno: i64) {
        if t.state == TaskState::AtSyscallEntry {
            // Already parked there by a previous advance.
            t.validate_regs(&frame.regs);
            return;
        }
        let how = if executes_live(syscallno) {
            ResumeRequest::ResumeSyscall
        } else {
            ResumeRequest::ResumeSysemu
        };
        // The enter frame of a desched'd buffered syscall was recorded at
        // the SIGIO stop, mid-restart; its volatile registers can't match
        // a clean entry, so only the stable landing is checked there.
        let mut strict_validation = true;
        loop {
            let sig = t.pending_sig.take();
            t.resume_execution(how, WaitRequest::ResumeWait, TicksRequest::ResumeUnlimitedTicks, sig);
            match t.wait_status.wait_type() {
                WaitType::SyscallStop => {
                    if t.state != TaskState::AtSyscallEntry {
                        continue;
                    }
                    if t.ip().as_usize() == RETRACE_PAGE_UNTRACED_SYSCALL_IP {
                        let desched = self.desched_active.get(&t.rec_tid) == Some(&true);
                        if desched && t.regs.original_syscallno() == syscallno {
                            // The desched'd buffered syscall, recorded
                            // through the traced path.
                            strict_validation = false;
                            break;
                        }
                        self.emulate_untraced_stop(t);
                        continue;
                    }
                    // A traced entry: must be the recorded one.
                    ed_assert!(
                        &*t,
                        t.regs.original_syscallno() == syscallno,
                        "expected entry to {}, got {}",
                        crate::kernel_metadata::syscall_name(syscallno),
                        crate::kernel_metadata::syscall_name(t.regs.original_syscallno())
                    );
                    break;
                }
                WaitType::SignalStop => {
                    self.consume_stray_signal(t);
                }
                WaitType::Exit | WaitType::FatalSignal => {
                    ed_assert!(&*t, false, "task died while advancing to syscall entry");
                }
                _ => continue,
            }
        }
        if strict_validation {
            t.validate_regs(&frame.regs);
        }
    }

    /// An untraced syscall entry stop outside a desched bracket: either a
    /// desched arm/disarm ioctl (always answered 0) or the next buffered
    /// syscall, answered from the queue.
    fn emulate_untraced_stop(&mut self, t: &mut Task) {
        let syscallno = t.regs.original_syscallno();
        if syscallno == libc::SYS_ioctl && t.regs.arg1() as i32 == t.desched_fd_child {
            t.regs.set_syscall_result(0);
            t.registers_dirty = true;
            t.in_syscall = false;
            return;
        }
        let queue = self.ring_records.entry(t.rec_tid).or_default();
        let rec = match queue.pop_front() {
            Some(rec) => rec,
            None => {
                ed_assert!(
                    &*t,
                    false,
                    "untraced {} with no ring record queued",
                    crate::kernel_metadata::syscall_name(syscallno)
                );
                unreachable!()
            }
        };
        ed_assert!(
            &*t,
            rec.syscallno == syscallno,
            "ring record is {}, tracee issued {}",
            crate::kernel_metadata::syscall_name(rec.syscallno),
            crate::kernel_metadata::syscall_name(syscallno)
        );
        // Stage the recorded outparam bytes where the wrapper's copy-out
        // expects them, and deliver the recorded result.
        if !rec.payload.is_empty() {
            let staging = t.syscallbuf_child
                + SYSCALLBUF_HDR_SIZE
                + rec.offset
                + SYSCALLBUF_RECORD_HEADER_SIZE;
            t.write_mem(staging, &rec.payload);
        }
        t.regs.set_syscall_result_signed(rec.ret as isize);
        t.registers_dirty = true;
        t.in_syscall = false;
    }

    fn consume_stray_signal(&mut self, t: &mut Task) {
        let sig = t.wait_status.stop_sig().unwrap_or(0);
        if sig == TIME_SLICE_SIGNAL {
            return;
        }
        if sig == libc::SIGTRAP {
            // Single-step or breakpoint leftovers while advancing.
            return;
        }
        ed_assert!(&*t, false, "unexpected signal {} during replay advance",
                   crate::kernel_metadata::signal_name(sig));
    }

    // --- exact landing ---

    /// Steer `t` to the recorded (tick count, ip) of an asynchronous
    /// event: run with the counter programmed short of the target, then
    /// single-step the rest, tie-breaking repeated visits of the same ip
    /// with the extra-register hash.
    fn land_at(&mut self, t: &mut Task, frame: &TraceFrame) {
        let target = frame.ticks;
        while t.ticks + SKID_SIZE < target {
            let budget = target - t.ticks - SKID_SIZE;
            let sig = t.pending_sig.take();
            t.resume_execution(
                ResumeRequest::ResumeSysemu,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeWithTicksRequest(budget),
                sig,
            );
            match t.wait_status.wait_type() {
                WaitType::SignalStop => {
                    let sig = t.wait_status.stop_sig().unwrap_or(0);
                    if sig != TIME_SLICE_SIGNAL {
                        self.consume_stray_signal(t);
                    }
                }
                WaitType::SyscallStop => {
                    if t.state == TaskState::AtSyscallEntry
                        && t.ip().as_usize() == RETRACE_PAGE_UNTRACED_SYSCALL_IP
                    {
                        self.emulate_untraced_stop(t);
                    } else {
                        ed_assert!(&*t, false, "traced syscall while landing at async event");
                    }
                }
                _ => {
                    ed_assert!(&*t, false, "unexpected stop {} while landing", t.wait_status);
                }
            }
        }

        // Single-step home.
        loop {
            let ip_matches = t.ip() == frame.regs.ip();
            let extra_matches = t.extra_regs.hash() == frame.extra_regs.hash();
            if t.ticks == target && ip_matches && extra_matches {
                break;
            }
            ed_assert!(
                &*t,
                t.ticks <= target,
                "overshot landing: at {} ticks, wanted {}",
                t.ticks,
                target
            );
            let sig = t.pending_sig.take();
            t.resume_execution(
                ResumeRequest::ResumeSysemuSinglestep,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeUnlimitedTicks,
                sig,
            );
            if t.state == TaskState::AtSyscallEntry
                && t.ip().as_usize() == RETRACE_PAGE_UNTRACED_SYSCALL_IP
            {
                self.emulate_untraced_stop(t);
            }
        }
        t.validate_regs(&frame.regs);
    }

    // --- signals ---

    fn rep_signal(&mut self, t_ptr: &TaskSharedPtr, frame: &TraceFrame) {
        let (siginfo, deterministic) = match &frame.event {
            Event::Signal(sed) => (sed.siginfo, sed.deterministic),
            _ => unreachable!(),
        };
        let signo = siginfo.si_signo;
        let mut t = t_ptr.borrow_mut();

        match deterministic {
            SignalDeterministic::DeterministicSig => {
                // The instruction stream re-raises it; just run there.
                loop {
                    let sig = t.pending_sig.take();
                    t.resume_execution(
                        ResumeRequest::ResumeSysemu,
                        WaitRequest::ResumeWait,
                        TicksRequest::ResumeUnlimitedTicks,
                        sig,
                    );
                    match t.wait_status.wait_type() {
                        WaitType::SignalStop if t.wait_status.stop_sig() == Some(signo) => break,
                        WaitType::SignalStop => self.consume_stray_signal(&mut t),
                        WaitType::SyscallStop
                            if t.ip().as_usize() == RETRACE_PAGE_UNTRACED_SYSCALL_IP =>
                        {
                            self.emulate_untraced_stop(&mut t)
                        }
                        _ => {
                            ed_assert!(&*t, false, "expected {} to recur", crate::kernel_metadata::signal_name(signo));
                        }
                    }
                }
                t.validate_regs(&frame.regs);
            }
            SignalDeterministic::NondeterministicSig => {
                self.land_at(&mut t, frame);
                t.set_siginfo(&siginfo);
            }
        }
        // Deliver at the next resume, exactly like the recording did.
        t.pending_sig = Sig::try_from(signo).ok();
        t.on_frame_recorded();
    }

    fn rep_instruction_trap(&mut self, t_ptr: &TaskSharedPtr, frame: &TraceFrame) {
        let mut t = t_ptr.borrow_mut();
        // Deterministic rdtsc trap: run to the SIGSEGV, then deposit the
        // recorded post-emulation registers (counter value and advanced
        // ip included).
        loop {
            let sig = t.pending_sig.take();
            t.resume_execution(
                ResumeRequest::ResumeSysemu,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeUnlimitedTicks,
                sig,
            );
            match t.wait_status.wait_type() {
                WaitType::SignalStop if t.wait_status.stop_sig() == Some(libc::SIGSEGV) => break,
                WaitType::SignalStop => self.consume_stray_signal(&mut t),
                WaitType::SyscallStop
                    if t.ip().as_usize() == RETRACE_PAGE_UNTRACED_SYSCALL_IP =>
                {
                    self.emulate_untraced_stop(&mut t)
                }
                _ => {
                    ed_assert!(&*t, false, "expected rdtsc trap, got {}", t.wait_status);
                }
            }
        }
        ed_assert!(&*t, t.at_rdtsc(), "SIGSEGV not at an rdtsc during trap replay");
        t.set_regs_from_trace(&frame.regs);
        t.on_frame_recorded();
    }

    // --- syscallbuf ---

    /// A flush frame: parse the recorded ring image into per-record
    /// entries and queue them for the untraced stops that follow.
    fn rep_load_flush(&mut self, t_ptr: &TaskSharedPtr, frame: &TraceFrame, raw: &[RawDataRecord]) {
        let t = t_ptr.borrow();
        let queue = self.ring_records.entry(t.rec_tid).or_default();
        ed_assert!(
            &*t,
            queue.is_empty(),
            "{} ring records from the previous flush never consumed",
            queue.len()
        );
        let ring = match raw.first() {
            Some(rec) => &rec.data,
            None => {
                ed_assert!(&*t, false, "flush frame without ring payload");
                unreachable!()
            }
        };
        match parse_ring_records(&ring[SYSCALLBUF_HDR_SIZE..]) {
            Some(records) => queue.extend(records),
            None => {
                ed_assert!(&*t, false, "flush frame carries a malformed ring image");
            }
        }
        log!(
            LogDebug,
            "loaded {} ring records for task {} at time {}",
            queue.len(),
            t.rec_tid,
            frame.time
        );
        drop(t);
        t_ptr.borrow_mut().on_frame_recorded();
    }

    // --- exits ---

    fn rep_exit(&mut self, t_ptr: &TaskSharedPtr, frame: &TraceFrame) {
        {
            let mut t = t_ptr.borrow_mut();
            while !t.has_exited() {
                let sig = t.pending_sig.take();
                t.resume_execution(
                    ResumeRequest::ResumeCont,
                    WaitRequest::ResumeWait,
                    TicksRequest::ResumeNoTicks,
                    sig,
                );
                if t.wait_status.wait_type() == WaitType::PtraceEvent {
                    continue;
                }
            }
            if let Event::Exit(recorded_status) = frame.event {
                let live = t.wait_status.get();
                ed_assert!(
                    &*t,
                    live == recorded_status,
                    "exit status diverged: live {:#x}, recorded {:#x}",
                    live,
                    recorded_status
                );
            }
        }
        let rec_tid = t_ptr.borrow().rec_tid;
        log!(LogInfo, "replayed task {} exited", rec_tid);
        self.inner.on_task_destroyed(rec_tid);
        self.ring_records.remove(&rec_tid);
        self.desched_active.remove(&rec_tid);
    }

    // --- mapping records ---

    /// The next mapping record if it belongs to the current time.
    fn take_mapping_record(&mut self, time: u64) -> Option<TraceMapping> {
        if self.pending_mapping.is_none() {
            self.pending_mapping = self.trace_in.read_mapping().ok().flatten();
        }
        match &self.pending_mapping {
            Some(m) if m.time <= time => self.pending_mapping.take(),
            _ => None,
        }
    }

    /// Discard mapping records up to `time` (exec snapshots re-create the
    /// layout through the real exec).
    pub fn drain_mapping_records(&mut self, time: u64) {
        while self.take_mapping_record(time).is_some() {}
    }
}

/// Split a flushed ring image (header stripped) into its records. None
/// if the image is malformed: every committed record must lie entirely
/// within the flushed prefix.
fn parse_ring_records(records_bytes: &[u8]) -> Option<Vec<RingRecord>> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset + SYSCALLBUF_RECORD_HEADER_SIZE <= records_bytes.len() {
        let rec: syscallbuf_record = {
            let mut hdr_bytes = [0u8; SYSCALLBUF_RECORD_HEADER_SIZE];
            hdr_bytes
                .copy_from_slice(&records_bytes[offset..offset + SYSCALLBUF_RECORD_HEADER_SIZE]);
            unsafe { std::mem::transmute(hdr_bytes) }
        };
        if rec.size == 0 {
            // Zeroed tail past the last committed record.
            break;
        }
        if (rec.size as usize) < SYSCALLBUF_RECORD_HEADER_SIZE {
            return None;
        }
        let payload_len = rec.size as usize - SYSCALLBUF_RECORD_HEADER_SIZE;
        let payload_start = offset + SYSCALLBUF_RECORD_HEADER_SIZE;
        if payload_start + payload_len > records_bytes.len() {
            return None;
        }
        out.push(RingRecord {
            offset,
            syscallno: rec.syscallno as i64,
            ret: rec.ret,
            payload: records_bytes[payload_start..payload_start + payload_len].to_vec(),
        });
        offset += crate::preload_interface::stored_record_size(rec.size) as usize;
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preload_interface::stored_record_size;

    fn push_record(ring: &mut Vec<u8>, syscallno: u16, ret: i64, payload: &[u8]) {
        let mut rec = syscallbuf_record::default();
        rec.syscallno = syscallno;
        rec.ret = ret;
        rec.size = (SYSCALLBUF_RECORD_HEADER_SIZE + payload.len()) as u32;
        let hdr_bytes: [u8; SYSCALLBUF_RECORD_HEADER_SIZE] =
            unsafe { std::mem::transmute(rec) };
        let start = ring.len();
        ring.extend_from_slice(&hdr_bytes);
        ring.extend_from_slice(payload);
        let padded = stored_record_size(rec.size) as usize;
        ring.resize(start + padded, 0);
    }

    #[test]
    fn ring_image_parses_in_order() {
        let mut ring = Vec::new();
        push_record(&mut ring, libc::SYS_clock_gettime as u16, 0, &[1u8; 16]);
        push_record(&mut ring, libc::SYS_read as u16, 5, b"hello");
        // Zeroed tail, as reset_syscallbuf leaves it.
        ring.extend_from_slice(&[0u8; 64]);

        let records = parse_ring_records(&ring).unwrap();
        assert_eq!(2, records.len());
        assert_eq!(libc::SYS_clock_gettime, records[0].syscallno);
        assert_eq!(0, records[0].offset);
        assert_eq!(16, records[0].payload.len());
        assert_eq!(libc::SYS_read, records[1].syscallno);
        assert_eq!(5, records[1].ret);
        assert_eq!(b"hello".to_vec(), records[1].payload);
        // Records are aligned to 64-bit boundaries.
        assert_eq!(0, records[1].offset % 8);
    }

    #[test]
    fn truncated_ring_image_rejected() {
        let mut ring = Vec::new();
        push_record(&mut ring, libc::SYS_read as u16, 100, &[7u8; 100]);
        // Chop into the payload.
        ring.truncate(SYSCALLBUF_RECORD_HEADER_SIZE + 10);
        assert!(parse_ring_records(&ring).is_none());
    }

    #[test]
    fn empty_ring_image_is_empty() {
        assert!(parse_ring_records(&[]).unwrap().is_empty());
        assert!(parse_ring_records(&[0u8; 256]).unwrap().is_empty());
    }
}
