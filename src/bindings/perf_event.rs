#![allow(non_camel_case_types)]

//! The perf_event_open(2) ABI. Flag bitfields are collapsed into one u64
//! with shift constants for the bits we program.

pub const PERF_TYPE_HARDWARE: u32 = 0;
pub const PERF_TYPE_SOFTWARE: u32 = 1;
pub const PERF_TYPE_RAW: u32 = 4;

pub const PERF_COUNT_HW_CPU_CYCLES: u64 = 0;
pub const PERF_COUNT_SW_CONTEXT_SWITCHES: u64 = 3;
pub const PERF_COUNT_SW_DUMMY: u64 = 9;

/// attr.flags bit positions (see linux/perf_event.h bitfield order).
pub const PERF_FLAG_DISABLED: u64 = 1 << 0;
pub const PERF_FLAG_PINNED: u64 = 1 << 2;
pub const PERF_FLAG_EXCLUDE_USER: u64 = 1 << 4;
pub const PERF_FLAG_EXCLUDE_KERNEL: u64 = 1 << 5;
pub const PERF_FLAG_EXCLUDE_HV: u64 = 1 << 6;
pub const PERF_FLAG_ENABLE_ON_EXEC: u64 = 1 << 12;
pub const PERF_FLAG_EXCLUDE_GUEST: u64 = 1 << 20;

pub const PERF_EVENT_IOC_ENABLE: u64 = 0x2400;
pub const PERF_EVENT_IOC_DISABLE: u64 = 0x2401;
pub const PERF_EVENT_IOC_RESET: u64 = 0x2403;
/// _IOW('$', 4, u64)
pub const PERF_EVENT_IOC_PERIOD: u64 = 0x4008_2404;

/// perf_event_attr with the unions flattened to the members we use
/// (`sample_period`, `config1`/`config2` unused). Layout-compatible with
/// the kernel's struct for the prefix we pass; `size` tells the kernel how
/// much of it to read.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct perf_event_attr {
    pub type_: u32,
    pub size: u32,
    pub config: u64,
    pub sample_period: u64,
    pub sample_type: u64,
    pub read_format: u64,
    pub flags: u64,
    pub wakeup_events: u32,
    pub bp_type: u32,
    pub bp_addr: u64,
    pub bp_len: u64,
    pub branch_sample_type: u64,
    pub sample_regs_user: u64,
    pub sample_stack_user: u32,
    pub clockid: i32,
    pub sample_regs_intr: u64,
    pub aux_watermark: u32,
    pub sample_max_stack: u16,
    pub __reserved_2: u16,
}

pub const PERF_ATTR_SIZE: u32 = std::mem::size_of::<perf_event_attr>() as u32;

const_assert_eq!(std::mem::size_of::<perf_event_attr>(), 112);
