//! Hand-maintained bindings for kernel ABI surface that libc does not
//! export: ptrace requests (including the SYSEMU family), the perf-event
//! attr layout, seccomp/BPF constants, and a siginfo layout with the
//! fields we actually inspect.

pub mod kernel;
pub mod perf_event;
pub mod ptrace;
pub mod signal;
