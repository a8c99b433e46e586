//! Builder for the syscall-interception BPF program, installed by the
//! in-tracee bootstrap before exec (see Task::spawn).
//!
//! The program says: a syscall is allowed through untraced if and only if
//! its originating instruction pointer equals the published untraced entry
//! stub, or its number is one of the few the kernel issues from addresses
//! we can't predict (restart blocks, clone trampolines). Everything else
//! is a SECCOMP_RET_TRACE stop for the tracer.

pub const BPF_LD: u16 = 0x00;
pub const BPF_W: u16 = 0x00;
pub const BPF_ABS: u16 = 0x20;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_JEQ: u16 = 0x10;
pub const BPF_K: u16 = 0x00;
pub const BPF_RET: u16 = 0x06;

pub const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
pub const SECCOMP_RET_TRACE: u32 = 0x7ff0_0000;
pub const SECCOMP_RET_DATA: u32 = 0x0000_ffff;

/// Field offsets into struct seccomp_data. Checked against the real
/// layout in the tests below.
pub const SECCOMP_DATA_NR_OFFSET: u32 = 0;
pub const SECCOMP_DATA_IP_OFFSET: u32 = 8;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct sock_filter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

#[repr(C)]
pub struct sock_fprog {
    pub len: u16,
    pub filter: *mut sock_filter,
}

fn bpf_stmt(code: u16, k: u32) -> sock_filter {
    sock_filter {
        code,
        jt: 0,
        jf: 0,
        k,
    }
}

fn bpf_jump(code: u16, k: u32, jt: u8, jf: u8) -> sock_filter {
    sock_filter { code, jt, jf, k }
}

#[derive(Clone, Default)]
pub struct SeccompFilter {
    pub filters: Vec<sock_filter>,
}

impl SeccompFilter {
    pub fn new() -> SeccompFilter {
        SeccompFilter {
            filters: Vec::new(),
        }
    }

    pub fn allow(&mut self) {
        self.filters
            .push(bpf_stmt(BPF_RET + BPF_K, SECCOMP_RET_ALLOW));
    }

    pub fn trace(&mut self) {
        self.filters
            .push(bpf_stmt(BPF_RET + BPF_K, SECCOMP_RET_TRACE | SECCOMP_RET_DATA));
    }

    /// Allow any syscall whose originating IP is `ip`. The low 32 bits are
    /// compared first and the high bits only on match, so the common
    /// mismatch costs two instructions.
    pub fn allow_syscalls_from_callsite(&mut self, ip: u64) {
        self.filters
            .push(bpf_stmt(BPF_LD + BPF_W + BPF_ABS, SECCOMP_DATA_IP_OFFSET));
        self.filters
            .push(bpf_jump(BPF_JMP + BPF_JEQ + BPF_K, ip as u32, 0, 3));
        self.filters
            .push(bpf_stmt(BPF_LD + BPF_W + BPF_ABS, SECCOMP_DATA_IP_OFFSET + 4));
        self.filters
            .push(bpf_jump(BPF_JMP + BPF_JEQ + BPF_K, (ip >> 32) as u32, 0, 1));
        self.allow();
    }

    /// Allow one syscall number regardless of callsite.
    pub fn allow_syscall_number(&mut self, nr: u32) {
        self.filters
            .push(bpf_stmt(BPF_LD + BPF_W + BPF_ABS, SECCOMP_DATA_NR_OFFSET));
        self.filters
            .push(bpf_jump(BPF_JMP + BPF_JEQ + BPF_K, nr, 0, 1));
        self.allow();
    }

    /// The recording filter: one allowed callsite, a handful of allowed
    /// numbers, trace everything else.
    pub fn for_recording(untraced_entry_ip: u64) -> SeccompFilter {
        let mut f = SeccompFilter::new();
        f.allow_syscalls_from_callsite(untraced_entry_ip);
        // The kernel issues these from restart blocks / clone trampolines
        // whose IP is not the untraced entry; they must not be blocked on
        // that account. They still raise ptrace stops via TRACESYSGOOD.
        f.allow_syscall_number(libc::SYS_restart_syscall as u32);
        f.allow_syscall_number(libc::SYS_clone as u32);
        f.allow_syscall_number(libc::SYS_fork as u32);
        f.trace();
        f
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seccomp_data_offsets_match_abi() {
        use crate::bindings::kernel::seccomp_data;
        assert_eq!(
            SECCOMP_DATA_NR_OFFSET as usize,
            offset_of!(seccomp_data, nr)
        );
        assert_eq!(
            SECCOMP_DATA_IP_OFFSET as usize,
            offset_of!(seccomp_data, instruction_pointer)
        );
    }

    /// The recording filter must allow exactly one callsite: every ALLOW
    /// verdict other than the per-number ones is guarded by an IP compare
    /// against the published entry.
    #[test]
    fn single_allowed_callsite() {
        let ip: u64 = 0x7f00_dead_0000;
        let f = SeccompFilter::for_recording(ip);
        let ip_loads: Vec<usize> = f
            .filters
            .iter()
            .enumerate()
            .filter(|(_, insn)| {
                insn.code == BPF_LD + BPF_W + BPF_ABS && insn.k == SECCOMP_DATA_IP_OFFSET
            })
            .map(|(i, _)| i)
            .collect();
        assert_eq!(1, ip_loads.len());
        // The IP compared against is the published one.
        let cmp = f.filters[ip_loads[0] + 1];
        assert_eq!(ip as u32, cmp.k);
        // Program ends in a TRACE verdict.
        let last = f.filters.last().unwrap();
        assert_eq!(BPF_RET + BPF_K, last.code);
        assert_eq!(SECCOMP_RET_TRACE | SECCOMP_RET_DATA, last.k);
    }
}
