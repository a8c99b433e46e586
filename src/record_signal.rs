//! Signal classification during recording. A stop with a pending signal
//! is one of: our own timeslice interrupt, a desched notification from
//! the syscallbuf machinery, a trapped rdtsc to virtualize, or a real
//! signal to record and deliver. Real signals split into deterministic
//! (re-raised by the instruction stream itself at replay) and
//! asynchronous (keyed on the (ip, tick count, extra-registers) tuple and
//! re-injected at the exact landing point).

use crate::bindings::signal::{siginfo_t, POLL_IN, SI_KERNEL, SI_USER};
use crate::event::{SignalDeterministic, SignalEventData};
use crate::log::LogLevel::LogDebug;
use crate::perf_counters::TIME_SLICE_SIGNAL;
use crate::session::task::Task;
use crate::sig::Sig;
use std::convert::TryFrom;

/// What the record loop should do with the stop.
pub enum SignalOutcome {
    /// Counter overflow: record a SCHED event and preempt.
    TimeSliceExpired,
    /// The desched event fired: the current buffered syscall is blocking.
    DeschedFired,
    /// Expected noise (pseudo desched deliveries, stale counter signals);
    /// drop it and resume.
    ConsumedSilently,
    /// A trapped rdtsc was emulated in place; record an instruction-trap
    /// event.
    EmulatedRdtsc { value: u64 },
    /// A real signal: record it and deliver at the next resume.
    Deliver(SignalEventData),
}

/// Hardware-trap signals whose recurrence is guaranteed by the
/// instruction stream.
fn is_trap_sig(sig: i32) -> bool {
    matches!(
        sig,
        libc::SIGSEGV | libc::SIGBUS | libc::SIGILL | libc::SIGFPE | libc::SIGTRAP
    )
}

/// A signal is deterministic when it's a hardware trap raised by the
/// preceding instruction: trap signal number, kernel-origin si_code.
/// Anything user- or timer-generated is asynchronous, even SIGSEGV
/// (kill -SEGV exists).
pub fn is_deterministic_signal(si: &siginfo_t) -> SignalDeterministic {
    let sig = si.si_signo;
    // Positive si_code values are kernel-generated trap causes
    // (SEGV_MAPERR etc.); SI_KERNEL also counts. si_code <= 0 means a
    // user-space origin (SI_USER, SI_TKILL, SI_QUEUE, ...).
    if is_trap_sig(sig) && (si.si_code > 0 || si.si_code == SI_KERNEL) && si.si_code != SI_USER {
        SignalDeterministic::DeterministicSig
    } else {
        SignalDeterministic::NondeterministicSig
    }
}

/// Classify the signal-stop `t` is currently in.
pub fn classify_signal(t: &mut Task) -> SignalOutcome {
    let sig = match t.wait_status.stop_sig() {
        Some(s) => s,
        None => fatal!("classify_signal on a non-signal stop"),
    };
    let si = t.pending_siginfo;

    if sig == TIME_SLICE_SIGNAL {
        // Our counter interrupt. One can arrive late, after we already
        // reprogrammed the counter; those are stale but harmless, and a
        // SCHED event for them is still correct. The signal itself is
        // never delivered to the tracee.
        return SignalOutcome::TimeSliceExpired;
    }

    if sig == libc::SIGIO && si.si_code == POLL_IN && si.si_fd() == t.desched_fd_child {
        return classify_desched_sigio(t);
    }

    if sig == libc::SIGSEGV
        && is_deterministic_signal(&si) == SignalDeterministic::DeterministicSig
        && t.at_rdtsc()
    {
        // Virtualized rdtsc: PR_TSC_SIGSEGV turned the instruction into a
        // deterministic trap. Emulate it with the tracer's own counter
        // and step over it.
        let value = unsafe { core::arch::x86_64::_rdtsc() };
        t.emulate_rdtsc(value);
        return SignalOutcome::EmulatedRdtsc { value };
    }

    let deterministic = is_deterministic_signal(&si);
    match Sig::try_from(sig) {
        Ok(_) => SignalOutcome::Deliver(SignalEventData::new(&si, deterministic)),
        Err(_) => {
            log!(LogDebug, "dropping garbage signal {} for {}", sig, t.tid);
            SignalOutcome::ConsumedSilently
        }
    }
}

/// A SIGIO from the task's own desched counter. Each kernel deschedule
/// produces the real notification plus two pseudo-deliveries (one from
/// arming the event, one from the counter rollover when the tracee is
/// switched back in); only a delivery while the shim says the desched
/// might matter is meaningful.
fn classify_desched_sigio(t: &mut Task) -> SignalOutcome {
    let hdr = match t.read_syscallbuf_hdr() {
        Some(hdr) => hdr,
        None => return SignalOutcome::ConsumedSilently,
    };
    if hdr.desched_signal_may_be_relevant == 0 {
        log!(LogDebug, "consuming pseudo desched SIGIO for {}", t.tid);
        return SignalOutcome::ConsumedSilently;
    }
    log!(LogDebug, "desched fired for {}: buffered syscall blocks", t.tid);
    SignalOutcome::DeschedFired
}

#[cfg(test)]
mod tests {
    use super::*;

    fn si(signo: i32, code: i32) -> siginfo_t {
        let mut s = siginfo_t::default();
        s.si_signo = signo;
        s.si_code = code;
        s
    }

    #[test]
    fn hardware_traps_are_deterministic() {
        use crate::bindings::signal::SEGV_MAPERR;
        assert_eq!(
            SignalDeterministic::DeterministicSig,
            is_deterministic_signal(&si(libc::SIGSEGV, SEGV_MAPERR))
        );
        assert_eq!(
            SignalDeterministic::DeterministicSig,
            is_deterministic_signal(&si(libc::SIGFPE, 1))
        );
    }

    #[test]
    fn user_sent_signals_are_async() {
        use crate::bindings::signal::{SI_TKILL, SI_USER};
        // Even a SIGSEGV is asynchronous when a user sent it.
        assert_eq!(
            SignalDeterministic::NondeterministicSig,
            is_deterministic_signal(&si(libc::SIGSEGV, SI_USER))
        );
        assert_eq!(
            SignalDeterministic::NondeterministicSig,
            is_deterministic_signal(&si(libc::SIGUSR1, SI_TKILL))
        );
        assert_eq!(
            SignalDeterministic::NondeterministicSig,
            is_deterministic_signal(&si(libc::SIGALRM, 0))
        );
    }
}
