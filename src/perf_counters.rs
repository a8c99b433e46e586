//! The tick counter: retired conditional branches, counted per task by a
//! hardware perf event. Ticks are the replayable clock; every asynchronous
//! event is keyed on (ip, tick count) and replay re-creates the key by
//! programming the same counter.
//!
//! The event encoding differs per microarchitecture, so detection happens
//! once via cpuid and everything else goes through this module's API:
//! `reset` (program a sample period), `read_ticks`, `stop`.

use crate::bindings::perf_event::*;
use crate::log::LogLevel::{LogDebug, LogInfo};
use crate::scoped_fd::ScopedFd;
use crate::ticks::Ticks;
use libc::{c_ulong, pid_t, F_SETFL, O_ASYNC};
use raw_cpuid::CpuId;
use std::io::{stderr, Write};
use std::mem::size_of;

/// Linux doesn't use SIGSTKFLT so we hope tracees don't either.
pub const TIME_SLICE_SIGNAL: i32 = libc::SIGSTKFLT;

// Not exposed by the `libc` crate for this target; these mirror the
// glibc/kernel definitions in <bits/fcntl-linux.h>.
#[allow(non_camel_case_types)]
#[repr(C)]
struct f_owner_ex {
    type_: libc::c_int,
    pid: libc::pid_t,
}
const F_SETOWN_EX: libc::c_int = 15;
const F_SETSIG: libc::c_int = 10;
const F_OWNER_TID: libc::c_int = 0;

/// A counter interrupt can fire this many ticks late. Replay must program
/// interrupts at least this early and single-step the remainder.
pub const SKID_SIZE: Ticks = 1000;

/// Effectively "never fires". Programming zero disables sampling, so an
/// explicit huge period stands in for "count but don't interrupt".
pub const NO_INTERRUPT_PERIOD: Ticks = 1 << 60;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum CpuMicroarch {
    IntelNehalem,
    IntelWestmere,
    IntelSandyBridge,
    IntelIvyBridge,
    IntelHaswell,
    IntelBroadwell,
    IntelSkylake,
    IntelSilvermont,
    IntelGoldmont,
    IntelKabylake,
    IntelCometlake,
    AmdZen,
}
use CpuMicroarch::*;

struct PmuConfig {
    uarch: CpuMicroarch,
    name: &'static str,
    /// Event encoding for retired conditional branches.
    rcb_event: u64,
}

const PMU_CONFIGS: &[PmuConfig] = &[
    PmuConfig { uarch: IntelNehalem, name: "Nehalem", rcb_event: 0x5101c4 },
    PmuConfig { uarch: IntelWestmere, name: "Westmere", rcb_event: 0x5101c4 },
    PmuConfig { uarch: IntelSandyBridge, name: "Sandy Bridge", rcb_event: 0x5101c4 },
    PmuConfig { uarch: IntelIvyBridge, name: "Ivy Bridge", rcb_event: 0x5101c4 },
    PmuConfig { uarch: IntelHaswell, name: "Haswell", rcb_event: 0x5101c4 },
    PmuConfig { uarch: IntelBroadwell, name: "Broadwell", rcb_event: 0x5101c4 },
    PmuConfig { uarch: IntelSkylake, name: "Skylake", rcb_event: 0x5101c4 },
    PmuConfig { uarch: IntelSilvermont, name: "Silvermont", rcb_event: 0x5101c4 },
    PmuConfig { uarch: IntelGoldmont, name: "Goldmont", rcb_event: 0x5101c4 },
    PmuConfig { uarch: IntelKabylake, name: "Kaby Lake", rcb_event: 0x5101c4 },
    PmuConfig { uarch: IntelCometlake, name: "Comet Lake", rcb_event: 0x5101c4 },
    PmuConfig { uarch: AmdZen, name: "Zen", rcb_event: 0x5100d1 },
];

/// Identify this CPU from cpuid, or die: recording on an unrecognized PMU
/// would produce traces whose tick counts mean nothing.
fn get_cpu_microarch() -> CpuMicroarch {
    let cpuid = CpuId::new();
    let vendor_info_string = cpuid.get_vendor_info().unwrap().as_string().to_owned();

    if vendor_info_string != "GenuineIntel" && vendor_info_string != "AuthenticAMD" {
        clean_fatal!("Unknown CPU vendor '{}'", vendor_info_string);
    }

    let cpuid_data = cpuid.get_feature_info().unwrap();
    let cpu_type: u32 = ((cpuid_data.model_id() as u32) << 4)
        + ((cpuid_data.family_id() as u32) << 8)
        + ((cpuid_data.extended_model_id() as u32) << 16);
    let ext_family: u8 = cpuid_data.extended_family_id();

    match cpu_type {
        0x106A0 | 0x106E0 | 0x206E0 => return IntelNehalem,
        0x20650 | 0x206C0 | 0x206F0 => return IntelWestmere,
        0x206A0 | 0x206D0 | 0x306e0 => return IntelSandyBridge,
        0x306A0 => return IntelIvyBridge,
        0x306C0 | 0x306F0 | 0x40650 | 0x40660 => return IntelHaswell,
        0x306D0 | 0x40670 | 0x406F0 | 0x50660 => return IntelBroadwell,
        0x406e0 | 0x50650 | 0x506e0 => return IntelSkylake,
        0x30670 | 0x406c0 | 0x50670 => return IntelSilvermont,
        0x506f0 => return IntelGoldmont,
        0x806e0 | 0x906e0 => return IntelKabylake,
        0xa0660 => return IntelCometlake,
        0x00f10 => {
            if ext_family == 8 {
                if !crate::flags::Flags::get().suppress_environment_warnings {
                    write!(
                        stderr(),
                        "Zen retired-conditional-branch counting can overcount;\n\
                         recordings may be unreliable on this CPU.\n"
                    )
                    .unwrap();
                }
                return AmdZen;
            }
        }
        _ => (),
    }

    clean_fatal!("CPU type {:#x} ({}) unknown", cpu_type, vendor_info_string);
}

lazy_static! {
    static ref TICKS_ATTR: perf_event_attr = ticks_attr_init();
}

fn ticks_attr_init() -> perf_event_attr {
    let uarch = get_cpu_microarch();
    let pmu = PMU_CONFIGS
        .iter()
        .find(|p| p.uarch == uarch)
        .unwrap();
    log!(LogInfo, "Using PMU config for {}", pmu.name);

    let mut attr = perf_event_attr::default();
    attr.type_ = PERF_TYPE_RAW;
    attr.size = PERF_ATTR_SIZE;
    attr.config = pmu.rcb_event;
    attr.flags = PERF_FLAG_EXCLUDE_KERNEL | PERF_FLAG_EXCLUDE_HV | PERF_FLAG_EXCLUDE_GUEST;
    attr
}

/// Force PMU detection early so a hopeless machine fails before any tracee
/// is spawned.
pub fn init_pmu() {
    let config = TICKS_ATTR.config;
    log!(LogDebug, "Initialized PMU, rcb event {:#x}", config);
}

fn start_counter(tid: pid_t, group_fd: i32, attr: &mut perf_event_attr) -> ScopedFd {
    let fd = unsafe {
        libc::syscall(
            libc::SYS_perf_event_open,
            attr as *mut perf_event_attr,
            tid,
            -1,
            group_fd,
            0,
        )
    } as i32;
    if fd < 0 {
        fatal!("Failed to initialize counter for tid {}", tid);
    }
    ScopedFd::from_raw(fd)
}

fn perf_ioctl(fd: &ScopedFd, request: u64, arg: c_ulong) {
    if unsafe { libc::ioctl(fd.as_raw(), request as c_ulong, arg) } != 0 {
        fatal!("ioctl({:#x}) on perf fd failed", request);
    }
}

/// One task's tick counter. The fd outlives any number of reprogram
/// cycles; `reset` rewrites the sample period in place.
pub struct PerfCounters {
    tid: pid_t,
    fd_ticks: ScopedFd,
    started: bool,
    counting: bool,
}

impl PerfCounters {
    pub fn new(tid: pid_t) -> PerfCounters {
        PerfCounters {
            tid,
            fd_ticks: ScopedFd::new(),
            started: false,
            counting: false,
        }
    }

    pub fn tid(&self) -> pid_t {
        self.tid
    }

    /// (Re)start counting from zero. When `ticks_period` ticks have been
    /// retired the counter delivers TIME_SLICE_SIGNAL to the task, which
    /// the tracer sees as a ptrace signal-stop.
    pub fn reset(&mut self, ticks_period: Ticks) {
        debug_assert!(ticks_period > 0);
        if !self.started {
            let mut attr = *TICKS_ATTR;
            attr.sample_period = ticks_period;
            attr.flags |= PERF_FLAG_DISABLED;
            self.fd_ticks = start_counter(self.tid, -1, &mut attr);

            let own = f_owner_ex {
                type_: F_OWNER_TID,
                pid: self.tid,
            };
            if unsafe { libc::fcntl(self.fd_ticks.as_raw(), F_SETOWN_EX, &own) } != 0 {
                fatal!("Failed to SETOWN_EX ticks event fd");
            }
            if unsafe { libc::fcntl(self.fd_ticks.as_raw(), F_SETFL, O_ASYNC) } != 0
                || unsafe { libc::fcntl(self.fd_ticks.as_raw(), F_SETSIG, TIME_SLICE_SIGNAL) }
                    != 0
            {
                fatal!("Failed to make ticks counter ASYNC with signal {}",
                       crate::kernel_metadata::signal_name(TIME_SLICE_SIGNAL));
            }
            self.started = true;
        } else {
            perf_ioctl(&self.fd_ticks, PERF_EVENT_IOC_RESET, 0);
            perf_ioctl(
                &self.fd_ticks,
                PERF_EVENT_IOC_PERIOD,
                &ticks_period as *const Ticks as c_ulong,
            );
        }
        perf_ioctl(&self.fd_ticks, PERF_EVENT_IOC_ENABLE, 0);
        self.counting = true;
    }

    pub fn stop_counting(&mut self) {
        if self.counting {
            perf_ioctl(&self.fd_ticks, PERF_EVENT_IOC_DISABLE, 0);
            self.counting = false;
        }
    }

    /// Ticks retired since the last `reset`.
    pub fn read_ticks(&self) -> Ticks {
        if !self.started {
            return 0;
        }
        let mut val: i64 = 0;
        let nread = unsafe {
            libc::read(
                self.fd_ticks.as_raw(),
                &mut val as *mut i64 as *mut libc::c_void,
                size_of::<i64>(),
            )
        };
        if nread != size_of::<i64>() as isize {
            fatal!("Short read of ticks counter for tid {}", self.tid);
        }
        val as Ticks
    }

    pub fn is_counting(&self) -> bool {
        self.counting
    }
}
