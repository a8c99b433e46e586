use crate::remote_ptr::{RemotePtr, Void};
use std::fmt::{Debug, Display, Formatter, Result};
use std::ops::{Add, Sub};

/// A code address in a tracee. Kept distinct from `RemotePtr` so that
/// instruction-pointer arithmetic (always byte-granular) can't be mixed up
/// with scaled data-pointer arithmetic.
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RemoteCodePtr {
    ptr: usize,
}

impl RemoteCodePtr {
    pub fn null() -> RemoteCodePtr {
        RemoteCodePtr { ptr: 0 }
    }

    pub fn new(val: usize) -> RemoteCodePtr {
        RemoteCodePtr { ptr: val }
    }

    pub fn as_usize(self) -> usize {
        self.ptr
    }

    /// The value as it appears in a register, e.g. for seccomp-BPF IP
    /// comparisons.
    pub fn register_value(self) -> u64 {
        self.ptr as u64
    }

    pub fn is_null(self) -> bool {
        self.ptr == 0
    }

    pub fn to_data_ptr<T>(self) -> RemotePtr<T> {
        RemotePtr::<T>::new(self.ptr)
    }

    pub fn from_data_ptr(p: RemotePtr<Void>) -> RemoteCodePtr {
        RemoteCodePtr { ptr: p.as_usize() }
    }
}

impl Display for RemoteCodePtr {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:#x}", self.ptr)
    }
}

impl Debug for RemoteCodePtr {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{:#x}", self.ptr)
    }
}

impl Add<usize> for RemoteCodePtr {
    type Output = Self;

    fn add(self, delta: usize) -> Self::Output {
        Self::new(self.ptr + delta)
    }
}

impl Sub<usize> for RemoteCodePtr {
    type Output = Self;

    fn sub(self, delta: usize) -> Self::Output {
        Self::new(self.ptr - delta)
    }
}

impl Sub<RemoteCodePtr> for RemoteCodePtr {
    type Output = isize;

    fn sub(self, rhs: RemoteCodePtr) -> Self::Output {
        self.ptr as isize - rhs.ptr as isize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_granular_arithmetic() {
        let a = RemoteCodePtr::new(0x1000);
        assert_eq!(0x1002, (a + 2).as_usize());
        assert_eq!(2, (a + 2) - a);
    }
}
