use crate::kernel_abi::SupportedArch;
use crate::log::LogLevel::LogError;
use crate::remote_code_ptr::RemoteCodePtr;
use crate::remote_ptr::{RemotePtr, Void};
use libc::user_regs_struct;
use std::fmt;
use std::mem::size_of;

/// The user-visible register file of a stopped tracee. A thin wrapper over
/// the ptrace GETREGS layout so it can be moved in and out of the kernel
/// and the trace without conversion.
///
/// Replay correctness hinges on comparing these bit for bit, so all
/// accessors go through the raw struct; nothing is cached.
#[derive(Copy, Clone)]
pub struct Registers {
    arch: SupportedArch,
    u: user_regs_struct,
}

pub const REGISTERS_RAW_SIZE: usize = size_of::<user_regs_struct>();

const_assert_eq!(std::mem::size_of::<user_regs_struct>(), 216);

/// How to report a register comparison.
#[derive(Copy, Clone, Eq, PartialEq)]
pub enum MismatchBehavior {
    ExpectMatches,
    LogMismatches,
    BailOnMismatch,
}

impl Registers {
    pub fn new(arch: SupportedArch) -> Registers {
        Registers {
            arch,
            u: unsafe { std::mem::zeroed() },
        }
    }

    pub fn arch(&self) -> SupportedArch {
        self.arch
    }

    pub fn raw(&self) -> &user_regs_struct {
        &self.u
    }

    pub fn raw_mut(&mut self) -> &mut user_regs_struct {
        &mut self.u
    }

    pub fn ip(&self) -> RemoteCodePtr {
        RemoteCodePtr::new(self.u.rip as usize)
    }

    pub fn set_ip(&mut self, addr: RemoteCodePtr) {
        self.u.rip = addr.as_usize() as u64;
    }

    pub fn sp(&self) -> RemotePtr<Void> {
        RemotePtr::new(self.u.rsp as usize)
    }

    pub fn set_sp(&mut self, addr: RemotePtr<Void>) {
        self.u.rsp = addr.as_usize() as u64;
    }

    /// The syscall number at a syscall-stop. The kernel stashes it in
    /// orig_rax because rax already holds -ENOSYS by the time the stop is
    /// reported.
    pub fn original_syscallno(&self) -> i64 {
        self.u.orig_rax as i64
    }

    pub fn set_original_syscallno(&mut self, no: i64) {
        self.u.orig_rax = no as u64;
    }

    pub fn syscall_result(&self) -> usize {
        self.u.rax as usize
    }

    pub fn syscall_result_signed(&self) -> isize {
        self.u.rax as isize
    }

    pub fn set_syscall_result(&mut self, result: usize) {
        self.u.rax = result as u64;
    }

    pub fn set_syscall_result_signed(&mut self, result: isize) {
        self.u.rax = result as u64;
    }

    /// True when rax holds an errno-range failure.
    pub fn syscall_failed(&self) -> bool {
        let result = self.syscall_result_signed();
        -4096 < result && result < 0
    }

    pub fn arg1(&self) -> usize {
        self.u.rdi as usize
    }
    pub fn arg2(&self) -> usize {
        self.u.rsi as usize
    }
    pub fn arg3(&self) -> usize {
        self.u.rdx as usize
    }
    pub fn arg4(&self) -> usize {
        self.u.r10 as usize
    }
    pub fn arg5(&self) -> usize {
        self.u.r8 as usize
    }
    pub fn arg6(&self) -> usize {
        self.u.r9 as usize
    }

    pub fn set_arg1(&mut self, v: usize) {
        self.u.rdi = v as u64;
    }
    pub fn set_arg2(&mut self, v: usize) {
        self.u.rsi = v as u64;
    }
    pub fn set_arg3(&mut self, v: usize) {
        self.u.rdx = v as u64;
    }
    pub fn set_arg4(&mut self, v: usize) {
        self.u.r10 = v as u64;
    }
    pub fn set_arg5(&mut self, v: usize) {
        self.u.r8 = v as u64;
    }
    pub fn set_arg6(&mut self, v: usize) {
        self.u.r9 = v as u64;
    }

    pub fn flags(&self) -> u64 {
        self.u.eflags
    }

    pub fn set_flags(&mut self, flags: u64) {
        self.u.eflags = flags;
    }

    /// Deliver a 64-bit counter value the way rdtsc does: low half in
    /// eax, high half in edx.
    pub fn set_rdtsc_output(&mut self, value: u64) {
        self.u.rax = value & 0xffff_ffff;
        self.u.rdx = value >> 32;
    }

    pub fn rdtsc_output(&self) -> u64 {
        (self.u.rdx << 32) | (self.u.rax & 0xffff_ffff)
    }

    /// Bit-exact comparison of the register files that must match between
    /// record and replay. Segment-base registers are included; ds/es/fs/gs
    /// selectors are not meaningful on x86-64 and are skipped.
    pub fn matches(&self, other: &Registers) -> bool {
        self.compare_with(other, MismatchBehavior::ExpectMatches)
    }

    pub fn compare_with(&self, other: &Registers, behavior: MismatchBehavior) -> bool {
        let mut ok = true;
        macro_rules! check_reg {
            ($field:ident) => {
                if self.u.$field != other.u.$field {
                    ok = false;
                    if behavior != MismatchBehavior::ExpectMatches {
                        log!(
                            LogError,
                            "{} {:#x} != {:#x} (replaying vs. recorded)",
                            stringify!($field),
                            self.u.$field,
                            other.u.$field
                        );
                    }
                }
            };
        }
        check_reg!(r15);
        check_reg!(r14);
        check_reg!(r13);
        check_reg!(r12);
        check_reg!(rbp);
        check_reg!(rbx);
        check_reg!(r11);
        check_reg!(r10);
        check_reg!(r9);
        check_reg!(r8);
        check_reg!(rax);
        check_reg!(rcx);
        check_reg!(rdx);
        check_reg!(rsi);
        check_reg!(rdi);
        check_reg!(orig_rax);
        check_reg!(rip);
        check_reg!(eflags);
        check_reg!(rsp);
        check_reg!(fs_base);
        check_reg!(gs_base);
        ok
    }

    pub fn to_raw_bytes(&self) -> [u8; REGISTERS_RAW_SIZE] {
        unsafe { std::mem::transmute(self.u) }
    }

    pub fn from_raw_bytes(arch: SupportedArch, bytes: &[u8; REGISTERS_RAW_SIZE]) -> Registers {
        Registers {
            arch,
            u: unsafe { std::mem::transmute(*bytes) },
        }
    }
}

impl fmt::Display for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ ip:{:#x} sp:{:#x} rax:{:#x} orig_rax:{:#x} rdi:{:#x} rsi:{:#x} rdx:{:#x} flags:{:#x} }}",
            self.u.rip,
            self.u.rsp,
            self.u.rax,
            self.u.orig_rax,
            self.u.rdi,
            self.u.rsi,
            self.u.rdx,
            self.u.eflags
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel_abi::NATIVE_ARCH;

    #[test]
    fn raw_bytes_roundtrip() {
        let mut r = Registers::new(NATIVE_ARCH);
        r.set_ip(RemoteCodePtr::new(0xdead_beef));
        r.set_syscall_result(42);
        r.set_arg3(7);
        let bytes = r.to_raw_bytes();
        let r2 = Registers::from_raw_bytes(NATIVE_ARCH, &bytes);
        assert!(r.matches(&r2));
        assert_eq!(0xdead_beef, r2.ip().as_usize());
        assert_eq!(42, r2.syscall_result());
        assert_eq!(7, r2.arg3());
    }

    #[test]
    fn mismatch_detected() {
        let r = Registers::new(NATIVE_ARCH);
        let mut r2 = r;
        r2.set_arg1(1);
        assert!(!r.matches(&r2));
    }

    #[test]
    fn rdtsc_output_split() {
        let mut r = Registers::new(NATIVE_ARCH);
        r.set_rdtsc_output(0x1234_5678_9abc_def0);
        assert_eq!(0x9abc_def0, r.syscall_result());
        assert_eq!(0x1234_5678_9abc_def0, r.rdtsc_output());
    }

    #[test]
    fn syscall_failure_range() {
        let mut r = Registers::new(NATIVE_ARCH);
        r.set_syscall_result_signed(-(libc::ENOENT as isize));
        assert!(r.syscall_failed());
        r.set_syscall_result(0x7fff_0000_0000);
        assert!(!r.syscall_failed());
    }
}
