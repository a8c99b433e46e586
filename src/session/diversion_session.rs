//! Diversion: speculative live execution forked off a replay at debugger
//! request ("call this function in the tracee"). The tracees run against
//! the real kernel; whatever they do is discarded when the debugger
//! restarts replay. Two things must not leak out of the sandbox: syscalls
//! that expose or transmit real identifiers, and writes to emulated
//! files shared with the abandoned replay.

use super::session_inner::SessionInner;
use super::task::task_inner::{ResumeRequest, TicksRequest, WaitRequest};
use super::task::{Task, TaskSharedPtr, TaskState};
use crate::emu_fs::EmuFsSharedPtr;
use crate::log::LogLevel::{LogDebug, LogInfo};
use crate::sig::Sig;
use crate::wait_status::WaitType;

/// Syscalls emulated as immediate success: they would leak or transmit
/// the replay's real (not recorded) identifiers. The multiplexed `ipc`
/// entry point belongs on this list too, but it has no syscall number on
/// x86-64 (i386-only ABI), so there is nothing to match here.
fn is_identifier_leaking_syscall(syscallno: i64) -> bool {
    matches!(
        syscallno,
        libc::SYS_kill
            | libc::SYS_tgkill
            | libc::SYS_tkill
            | libc::SYS_rt_sigqueueinfo
            | libc::SYS_rt_tgsigqueueinfo
    )
}

pub enum DiversionStatus {
    DiversionContinue,
    /// The diverted task stopped with something the debugger should see
    /// (breakpoint, signal).
    DiversionStopped(Option<Sig>),
    DiversionExited,
}

#[derive(Copy, Clone, Eq, PartialEq)]
pub enum DiversionResume {
    DiversionContinueExec,
    DiversionSinglestep,
}

pub struct DiversionSession {
    pub inner: SessionInner,
    emu_fs: EmuFsSharedPtr,
    /// Incremented by debugger siginfo reads, decremented by writes; the
    /// diversion dies when a resume finds it at zero.
    diversion_refcount: u32,
}

impl DiversionSession {
    /// Take over the tasks of a replay. The replay itself is dead after
    /// this; the debugger restarts it from the trace when the diversion
    /// ends. The emulated files are cloned so diverted writes can't
    /// corrupt a later replay of the same trace.
    pub fn new(inner: SessionInner, replay_emu_fs: &EmuFsSharedPtr) -> DiversionSession {
        let (emu_fs, _pairs) = replay_emu_fs.borrow().clone_for_diversion();
        log!(LogInfo, "diversion session created over {} tasks", inner.task_count());
        DiversionSession {
            inner,
            emu_fs,
            diversion_refcount: 0,
        }
    }

    pub fn ref_diversion(&mut self) {
        self.diversion_refcount += 1;
    }

    pub fn unref_diversion(&mut self) {
        if self.diversion_refcount > 0 {
            self.diversion_refcount -= 1;
        }
    }

    pub fn refcount(&self) -> u32 {
        self.diversion_refcount
    }

    /// Run `t` live until it stops in a way the debugger cares about.
    pub fn diversion_step(
        &mut self,
        t_ptr: &TaskSharedPtr,
        how: DiversionResume,
        sig: Option<Sig>,
    ) -> DiversionStatus {
        if self.diversion_refcount == 0 {
            log!(LogDebug, "diversion refcount hit zero; retiring");
            return DiversionStatus::DiversionExited;
        }
        let mut t = t_ptr.borrow_mut();
        loop {
            let resume = match how {
                DiversionResume::DiversionContinueExec => ResumeRequest::ResumeSyscall,
                DiversionResume::DiversionSinglestep => ResumeRequest::ResumeSinglestep,
            };
            t.resume_execution(
                resume,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeUnlimitedTicks,
                sig,
            );
            match t.wait_status.wait_type() {
                WaitType::SyscallStop => {
                    if t.state == TaskState::AtSyscallEntry {
                        self.process_diverted_syscall_entry(&mut t);
                    }
                    if how == DiversionResume::DiversionSinglestep {
                        return DiversionStatus::DiversionStopped(None);
                    }
                    continue;
                }
                WaitType::SignalStop => {
                    use std::convert::TryFrom;
                    let signo = t.wait_status.stop_sig().unwrap_or(0);
                    return DiversionStatus::DiversionStopped(Sig::try_from(signo).ok());
                }
                WaitType::Exit | WaitType::FatalSignal => {
                    return DiversionStatus::DiversionExited;
                }
                _ => continue,
            }
        }
    }

    /// At a live syscall entry: neuter the blacklist and the desched
    /// ioctl, pass everything else to the kernel untouched.
    fn process_diverted_syscall_entry(&mut self, t: &mut Task) {
        let syscallno = t.regs.original_syscallno();
        let neuter = is_identifier_leaking_syscall(syscallno)
            || (syscallno == libc::SYS_ioctl && t.regs.arg1() as i32 == t.desched_fd_child);
        if neuter {
            log!(
                LogDebug,
                "diversion neutering {}",
                crate::kernel_metadata::syscall_name(syscallno)
            );
            // Cancel the call in the kernel, then fake success at exit.
            t.regs.set_original_syscallno(-1);
            t.registers_dirty = true;
            t.resume_execution(
                ResumeRequest::ResumeSyscall,
                WaitRequest::ResumeWait,
                TicksRequest::ResumeNoTicks,
                None,
            );
            if t.state == TaskState::AtSyscallExit {
                t.regs.set_syscall_result(0);
                t.regs.set_original_syscallno(syscallno);
                t.registers_dirty = true;
            }
        }
    }
}
