use crate::bindings::ptrace::{PTRACE_EVENT_STOP, PTRACE_O_TRACESYSGOOD};
use crate::kernel_metadata::ptrace_event_name;
use crate::kernel_metadata::signal_name;
use libc::{SIGSTOP, SIGTRAP};
use libc::{WEXITSTATUS, WIFEXITED, WIFSIGNALED, WIFSTOPPED, WSTOPSIG, WTERMSIG};
use std::fmt::Display;
use std::fmt::Formatter;
use std::fmt::Result;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum WaitType {
    /// Task exited normally.
    Exit,
    /// Task exited due to fatal signal.
    FatalSignal,
    /// Task is in a signal-delivery-stop.
    SignalStop,
    /// Task is in a group-stop. (See ptrace man page.)
    /// You must use PTRACE_SEIZE to generate PTRACE_EVENT_STOPs, or these
    /// will be treated as SignalStop.
    GroupStop,
    /// Task is in a syscall-stop triggered by PTRACE_SYSCALL
    /// and PTRACE_O_TRACESYSGOOD.
    SyscallStop,
    /// Task is in a PTRACE_EVENT stop, except for PTRACE_EVENT_STOP
    /// which is treated as GroupStop.
    PtraceEvent,
}

/// The raw status word reported by waitpid(2), decoded on demand.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct WaitStatus {
    status: i32,
}

impl Default for WaitStatus {
    fn default() -> Self {
        Self::new(0)
    }
}

impl WaitStatus {
    pub fn new(status: i32) -> WaitStatus {
        WaitStatus { status }
    }

    pub fn wait_type(&self) -> WaitType {
        if self.exit_code().is_some() {
            return WaitType::Exit;
        }

        if self.fatal_sig().is_some() {
            return WaitType::FatalSignal;
        }

        if self.stop_sig().is_some() {
            return WaitType::SignalStop;
        }

        if self.group_stop_sig().is_some() {
            return WaitType::GroupStop;
        }

        if self.is_syscall() {
            return WaitType::SyscallStop;
        }

        if self.ptrace_event().is_some() {
            return WaitType::PtraceEvent;
        }

        fatal!("Status {:#x} not understood", self.status);
    }

    /// Exit code if wait_type() == Exit, otherwise None.
    pub fn exit_code(&self) -> Option<i32> {
        unsafe {
            if WIFEXITED(self.status) {
                Some(WEXITSTATUS(self.status))
            } else {
                None
            }
        }
    }

    /// Fatal signal if wait_type() == FatalSignal, otherwise None.
    pub fn fatal_sig(&self) -> Option<i32> {
        unsafe {
            let termsig = WTERMSIG(self.status);
            // Subtle. Makes sure Option<> is what we mean.
            if WIFSIGNALED(self.status) && termsig > 0 {
                Some(termsig)
            } else {
                None
            }
        }
    }

    /// Stop signal if wait_type() == SignalStop, otherwise None. A zero
    /// signal (rare but observed via PTRACE_INTERRUPT) is converted to
    /// SIGSTOP.
    pub fn stop_sig(&self) -> Option<i32> {
        unsafe {
            // ((status >> 16) & 0xff != 0) means this is a ptrace event or a
            // group stop, not a plain signal-delivery stop.
            if !WIFSTOPPED(self.status) || ((self.status >> 16) & 0xff != 0) {
                return None;
            }
        }

        let mut sig: i32 = unsafe { WSTOPSIG(self.status) };

        if sig == (SIGTRAP | 0x80) {
            // A syscall-enter or syscall-exit stop under
            // PTRACE_O_TRACESYSGOOD.
            return None;
        }

        sig &= !0x80;
        if sig != 0 {
            Some(sig)
        } else {
            Some(SIGSTOP)
        }
    }

    /// Group stop signal if wait_type() == GroupStop, otherwise None. A
    /// zero signal is converted to SIGSTOP.
    pub fn group_stop_sig(&self) -> Option<i32> {
        unsafe {
            // (status >> 16) & 0xff == PTRACE_EVENT_STOP is the signature of
            // a group stop when PTRACE_SEIZE is used.
            if !WIFSTOPPED(self.status) || ((self.status >> 16) & 0xff != PTRACE_EVENT_STOP as i32)
            {
                return None;
            }
        }

        let mut sig: i32 = unsafe { WSTOPSIG(self.status) };

        sig &= !0x80;
        if sig != 0 {
            Some(sig)
        } else {
            Some(SIGSTOP)
        }
    }

    pub fn is_syscall(&self) -> bool {
        unsafe {
            if self.ptrace_event().is_some() || !WIFSTOPPED(self.status) {
                return false;
            }

            // We're using PTRACE_O_TRACESYSGOOD.
            WSTOPSIG(self.status) == (SIGTRAP | 0x80)
        }
    }

    /// ptrace event if wait_type() == PtraceEvent, None otherwise.
    pub fn ptrace_event(&self) -> Option<u32> {
        let event: u32 = ((self.status >> 16) & 0xff) as u32;
        if event == PTRACE_EVENT_STOP || event == 0 {
            None
        } else {
            Some(event)
        }
    }

    /// For Exit and FatalSignal, returns None. For all other types returns
    /// the signal involved.
    pub fn ptrace_signal(&self) -> Option<i32> {
        unsafe {
            if WIFSTOPPED(self.status) {
                Some(WSTOPSIG(self.status) & 0x7f)
            } else {
                None
            }
        }
    }

    /// Return a WaitStatus for a process exit.
    pub fn for_exit_code(code: i32) -> WaitStatus {
        debug_assert!(code >= 0 && code < 0x100);
        WaitStatus { status: code << 8 }
    }

    /// Return a WaitStatus for a fatal signal.
    pub fn for_fatal_sig(sig: i32) -> WaitStatus {
        debug_assert!(sig >= 1 && sig < 0x80);
        WaitStatus { status: sig }
    }

    /// Return a WaitStatus for a stop signal.
    pub fn for_stop_sig(sig: i32) -> WaitStatus {
        debug_assert!(sig >= 1 && sig < 0x80);
        WaitStatus {
            status: (sig << 8) | 0x7f,
        }
    }

    /// Return a WaitStatus for a syscall-stop under PTRACE_O_TRACESYSGOOD.
    pub fn for_syscall() -> WaitStatus {
        WaitStatus {
            status: (((SIGTRAP | 0x80) << 8) | 0x7f),
        }
    }

    pub fn for_ptrace_event(ptrace_event: i32) -> WaitStatus {
        debug_assert!(ptrace_event >= 1 && ptrace_event < 0x100);
        WaitStatus {
            status: (ptrace_event << 16) | (SIGTRAP << 8) | 0x7f,
        }
    }

    pub fn get(&self) -> i32 {
        self.status
    }
}

impl Display for WaitStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:#x}", self.status)?;
        match self.wait_type() {
            WaitType::Exit => write!(f, " (EXIT-{})", self.exit_code().unwrap()),
            WaitType::FatalSignal => {
                write!(f, " (FATAL-{})", signal_name(self.fatal_sig().unwrap()))
            }
            WaitType::SignalStop => write!(f, " (STOP-{})", signal_name(self.stop_sig().unwrap())),
            WaitType::GroupStop => write!(
                f,
                " (GROUP-STOP-{})",
                signal_name(self.group_stop_sig().unwrap())
            ),
            WaitType::SyscallStop => write!(f, " (SYSCALL)"),
            WaitType::PtraceEvent => {
                write!(f, " ({})", ptrace_event_name(self.ptrace_event().unwrap()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_roundtrip() {
        let ws = WaitStatus::for_exit_code(12);
        assert_eq!(WaitType::Exit, ws.wait_type());
        assert_eq!(Some(12), ws.exit_code());
        assert_eq!(None, ws.fatal_sig());
    }

    #[test]
    fn fatal_sig_roundtrip() {
        let ws = WaitStatus::for_fatal_sig(libc::SIGKILL);
        assert_eq!(WaitType::FatalSignal, ws.wait_type());
        assert_eq!(Some(libc::SIGKILL), ws.fatal_sig());
    }

    #[test]
    fn stop_sig_roundtrip() {
        let ws = WaitStatus::for_stop_sig(libc::SIGUSR1);
        assert_eq!(WaitType::SignalStop, ws.wait_type());
        assert_eq!(Some(libc::SIGUSR1), ws.stop_sig());
        assert_eq!(None, ws.ptrace_event());
    }

    #[test]
    fn syscall_stop() {
        let ws = WaitStatus::for_syscall();
        assert_eq!(WaitType::SyscallStop, ws.wait_type());
        assert!(ws.is_syscall());
        assert_eq!(None, ws.stop_sig());
    }

    #[test]
    fn ptrace_event_roundtrip() {
        use crate::bindings::ptrace::PTRACE_EVENT_EXEC;
        let ws = WaitStatus::for_ptrace_event(PTRACE_EVENT_EXEC as i32);
        assert_eq!(WaitType::PtraceEvent, ws.wait_type());
        assert_eq!(Some(PTRACE_EVENT_EXEC), ws.ptrace_event());
    }
}
