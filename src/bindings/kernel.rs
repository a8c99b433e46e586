#![allow(non_camel_case_types)]

//! Misc kernel ABI that libc doesn't cover.

pub const PAGE_SIZE: usize = 4096;

/// The data seccomp-BPF programs match against.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct seccomp_data {
    pub nr: i32,
    pub arch: u32,
    pub instruction_pointer: u64,
    pub args: [u64; 6],
}

pub const SECCOMP_SET_MODE_FILTER: u32 = 1;
