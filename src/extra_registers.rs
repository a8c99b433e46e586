use crate::kernel_abi::SupportedArch;
use std::fmt;

/// The FXSAVE area is fixed-size; we don't record the variable XSAVE
/// extensions. Traces are tied to one microarchitecture anyway, and the
/// x87/SSE state captured here is what the exact-landing tie-break needs.
pub const FXSAVE_AREA_SIZE: usize = 512;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Format {
    None,
    FxSave,
}

/// Floating point / vector state of a stopped tracee, as read by
/// PTRACE_GETFPREGS. Used two ways: bit-exact record/replay comparison,
/// and as a tie-break hash when two visits to the same instruction share a
/// tick count.
#[derive(Copy, Clone)]
pub struct ExtraRegisters {
    format: Format,
    data: [u8; FXSAVE_AREA_SIZE],
}

impl ExtraRegisters {
    pub fn new(_arch: SupportedArch) -> ExtraRegisters {
        ExtraRegisters {
            format: Format::None,
            data: [0; FXSAVE_AREA_SIZE],
        }
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn is_empty(&self) -> bool {
        self.format == Format::None
    }

    pub fn data(&self) -> &[u8; FXSAVE_AREA_SIZE] {
        &self.data
    }

    /// Raw storage for a PTRACE_GETFPREGS destination. Marks the value
    /// present; callers only invoke this when the ptrace call succeeded.
    pub fn data_mut_for_ptrace(&mut self) -> &mut [u8; FXSAVE_AREA_SIZE] {
        self.format = Format::FxSave;
        &mut self.data
    }

    pub fn from_raw_bytes(bytes: &[u8; FXSAVE_AREA_SIZE]) -> ExtraRegisters {
        ExtraRegisters {
            format: Format::FxSave,
            data: *bytes,
        }
    }

    pub fn matches(&self, other: &ExtraRegisters) -> bool {
        self.format == other.format && self.data[..] == other.data[..]
    }

    /// FNV-1a over the save area. Only meaningful for comparing two states
    /// of the same task on the same machine.
    pub fn hash(&self) -> u64 {
        let mut h: u64 = 0xcbf2_9ce4_8422_2325;
        for b in self.data.iter() {
            h ^= *b as u64;
            h = h.wrapping_mul(0x1000_0000_01b3);
        }
        h
    }
}

impl fmt::Debug for ExtraRegisters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ExtraRegisters {{ format: {:?}, hash: {:#x} }}",
            self.format,
            self.hash()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel_abi::NATIVE_ARCH;

    #[test]
    fn starts_empty() {
        let er = ExtraRegisters::new(NATIVE_ARCH);
        assert!(er.is_empty());
    }

    #[test]
    fn hash_differs_on_content() {
        let mut a = ExtraRegisters::new(NATIVE_ARCH);
        let mut b = ExtraRegisters::new(NATIVE_ARCH);
        a.data_mut_for_ptrace()[0] = 1;
        b.data_mut_for_ptrace()[0] = 2;
        assert_ne!(a.hash(), b.hash());
        assert!(!a.matches(&b));
        b.data_mut_for_ptrace()[0] = 1;
        assert!(a.matches(&b));
    }
}
