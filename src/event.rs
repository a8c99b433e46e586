use crate::bindings::signal::siginfo_t;
use crate::kernel_abi::SupportedArch;
use crate::kernel_metadata::{signal_name, syscall_name};
use std::convert::TryFrom;
use std::fmt::{Display, Formatter, Result};

/// Whether the record loop may schedule another task while the current
/// event is in flight. Entering a potentially blocking syscall must allow
/// a switch or we risk deadlock; syscalls that complete immediately
/// prevent it so their memory effects are recorded before anyone else
/// runs.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Switchable {
    PreventSwitch,
    AllowSwitch,
}

/// A syscall is recorded as two frames, one at each kernel boundary.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SyscallState {
    EnteringSyscall,
    ExitingSyscall,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum SignalDeterministic {
    /// Arrived asynchronously; replay must steer execution to the exact
    /// (ip, tick count) key before injecting.
    NondeterministicSig = 0,
    /// Raised as a side effect of retiring the previous instruction; it
    /// will recur at replay by itself.
    DeterministicSig = 1,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DeschedState {
    ArmingDesched = 0,
    DisarmingDesched = 1,
}

#[derive(Copy, Clone)]
pub struct SyscallEventData {
    pub state: SyscallState,
    pub number: i64,
    pub arch: SupportedArch,
}

#[derive(Copy, Clone)]
pub struct SignalEventData {
    pub siginfo: siginfo_t,
    pub deterministic: SignalDeterministic,
}

impl SignalEventData {
    pub fn new(siginfo: &siginfo_t, deterministic: SignalDeterministic) -> SignalEventData {
        SignalEventData {
            siginfo: *siginfo,
            deterministic,
        }
    }

    pub fn signo(&self) -> i32 {
        self.siginfo.si_signo
    }
}

/// Tracks that a desched notification fired during a may-block buffered
/// syscall. The syscall itself is additionally recorded through the traced
/// path; `abort_commit` keeps the two representations from both counting.
#[derive(Copy, Clone)]
pub struct DeschedEventData {
    pub state: DeschedState,
    pub inner_syscallno: i64,
}

/// The trace's logical unit. Everything a replayer needs to know about one
/// stop of one task, minus registers/ticks which live in the frame proper.
#[derive(Copy, Clone)]
pub enum Event {
    Syscall(SyscallEventData),
    Signal(SignalEventData),
    /// Timeslice interrupt; replay context-switches at the same tick.
    Sched,
    /// The ring's valid prefix was copied into the data stream.
    SyscallbufFlush,
    SyscallbufAbortCommit,
    Desched(DeschedEventData),
    /// A virtualized instruction (rdtsc) trapped and was emulated.
    InstructionTrap,
    /// Task exited; the raw wait status is attached.
    Exit(i32),
    /// Task was killed while in an unstable state (e.g. mid-exit); no
    /// ordinary exit frame could be produced.
    UnstableExit,
    /// Synthesized at the end of the trace, never during recording.
    TraceTermination,
}

const TAG_SYSCALL: u32 = 1;
const TAG_SIGNAL: u32 = 2;
const TAG_SCHED: u32 = 3;
const TAG_SYSCALLBUF_FLUSH: u32 = 4;
const TAG_SYSCALLBUF_ABORT_COMMIT: u32 = 5;
const TAG_DESCHED: u32 = 6;
const TAG_INSTRUCTION_TRAP: u32 = 7;
const TAG_EXIT: u32 = 8;
const TAG_UNSTABLE_EXIT: u32 = 9;
const TAG_TRACE_TERMINATION: u32 = 10;

/// The wire form of an Event inside a frame: fixed words plus the frame's
/// siginfo slot (zeroed for non-signal events).
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct EncodedEvent {
    pub tag: u32,
    pub arch: u32,
    pub a: u64,
    pub b: u64,
}

impl Event {
    pub fn encode(&self) -> (EncodedEvent, siginfo_t) {
        let mut e = EncodedEvent::default();
        let mut si = siginfo_t::default();
        match self {
            Event::Syscall(sys) => {
                e.tag = TAG_SYSCALL;
                e.arch = sys.arch as u32;
                e.a = match sys.state {
                    SyscallState::EnteringSyscall => 0,
                    SyscallState::ExitingSyscall => 1,
                };
                e.b = sys.number as u64;
            }
            Event::Signal(sig) => {
                e.tag = TAG_SIGNAL;
                e.a = sig.deterministic as u64;
                si = sig.siginfo;
            }
            Event::Sched => e.tag = TAG_SCHED,
            Event::SyscallbufFlush => e.tag = TAG_SYSCALLBUF_FLUSH,
            Event::SyscallbufAbortCommit => e.tag = TAG_SYSCALLBUF_ABORT_COMMIT,
            Event::Desched(d) => {
                e.tag = TAG_DESCHED;
                e.a = d.state as u64;
                e.b = d.inner_syscallno as u64;
            }
            Event::InstructionTrap => e.tag = TAG_INSTRUCTION_TRAP,
            Event::Exit(status) => {
                e.tag = TAG_EXIT;
                e.a = *status as u32 as u64;
            }
            Event::UnstableExit => e.tag = TAG_UNSTABLE_EXIT,
            Event::TraceTermination => e.tag = TAG_TRACE_TERMINATION,
        }
        (e, si)
    }

    /// None means the tag is garbage, i.e. the trace is corrupt.
    pub fn decode(e: &EncodedEvent, si: &siginfo_t) -> Option<Event> {
        let ev = match e.tag {
            TAG_SYSCALL => Event::Syscall(SyscallEventData {
                state: if e.a == 0 {
                    SyscallState::EnteringSyscall
                } else {
                    SyscallState::ExitingSyscall
                },
                number: e.b as i64,
                arch: SupportedArch::from_raw(e.arch)?,
            }),
            TAG_SIGNAL => Event::Signal(SignalEventData {
                siginfo: *si,
                deterministic: if e.a == 0 {
                    SignalDeterministic::NondeterministicSig
                } else {
                    SignalDeterministic::DeterministicSig
                },
            }),
            TAG_SCHED => Event::Sched,
            TAG_SYSCALLBUF_FLUSH => Event::SyscallbufFlush,
            TAG_SYSCALLBUF_ABORT_COMMIT => Event::SyscallbufAbortCommit,
            TAG_DESCHED => Event::Desched(DeschedEventData {
                state: if e.a == 0 {
                    DeschedState::ArmingDesched
                } else {
                    DeschedState::DisarmingDesched
                },
                inner_syscallno: e.b as i64,
            }),
            TAG_INSTRUCTION_TRAP => Event::InstructionTrap,
            TAG_EXIT => Event::Exit(u32::try_from(e.a).ok()? as i32),
            TAG_UNSTABLE_EXIT => Event::UnstableExit,
            TAG_TRACE_TERMINATION => Event::TraceTermination,
            _ => return None,
        };
        Some(ev)
    }

    pub fn is_syscall_event(&self) -> bool {
        matches!(self, Event::Syscall(_))
    }

    pub fn is_signal_event(&self) -> bool {
        matches!(self, Event::Signal(_))
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            Event::Syscall(sys) => {
                let state = match sys.state {
                    SyscallState::EnteringSyscall => "enter",
                    SyscallState::ExitingSyscall => "exit",
                };
                write!(f, "SYSCALL({}, {})", syscall_name(sys.number), state)
            }
            Event::Signal(sig) => {
                let det = match sig.deterministic {
                    SignalDeterministic::DeterministicSig => "det",
                    SignalDeterministic::NondeterministicSig => "async",
                };
                write!(f, "SIGNAL({}, {})", signal_name(sig.signo()), det)
            }
            Event::Sched => write!(f, "SCHED"),
            Event::SyscallbufFlush => write!(f, "SYSCALLBUF_FLUSH"),
            Event::SyscallbufAbortCommit => write!(f, "SYSCALLBUF_ABORT_COMMIT"),
            Event::Desched(d) => {
                let state = match d.state {
                    DeschedState::ArmingDesched => "arming",
                    DeschedState::DisarmingDesched => "disarming",
                };
                write!(f, "DESCHED({}, {})", state, syscall_name(d.inner_syscallno))
            }
            Event::InstructionTrap => write!(f, "SEGV_RDTSC"),
            Event::Exit(status) => write!(f, "EXIT({:#x})", status),
            Event::UnstableExit => write!(f, "UNSTABLE_EXIT"),
            Event::TraceTermination => write!(f, "TRACE_TERMINATION"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel_abi::NATIVE_ARCH;

    fn roundtrip(ev: Event) -> Event {
        let (enc, si) = ev.encode();
        Event::decode(&enc, &si).unwrap()
    }

    #[test]
    fn syscall_event_roundtrip() {
        let ev = roundtrip(Event::Syscall(SyscallEventData {
            state: SyscallState::ExitingSyscall,
            number: libc::SYS_nanosleep,
            arch: NATIVE_ARCH,
        }));
        match ev {
            Event::Syscall(sys) => {
                assert_eq!(SyscallState::ExitingSyscall, sys.state);
                assert_eq!(libc::SYS_nanosleep, sys.number);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn signal_event_keeps_siginfo() {
        let mut si = siginfo_t::default();
        si.si_signo = libc::SIGUSR1;
        si.si_code = -6;
        let ev = roundtrip(Event::Signal(SignalEventData::new(
            &si,
            SignalDeterministic::NondeterministicSig,
        )));
        match ev {
            Event::Signal(sig) => {
                assert_eq!(libc::SIGUSR1, sig.signo());
                assert_eq!(-6, sig.siginfo.si_code);
                assert_eq!(SignalDeterministic::NondeterministicSig, sig.deterministic);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn bad_tag_is_rejected() {
        let enc = EncodedEvent {
            tag: 0xdead,
            ..Default::default()
        };
        assert!(Event::decode(&enc, &siginfo_t::default()).is_none());
    }

    #[test]
    fn exit_status_roundtrip() {
        match roundtrip(Event::Exit(0x1700)) {
            Event::Exit(status) => assert_eq!(0x1700, status),
            _ => panic!("wrong variant"),
        }
    }
}
