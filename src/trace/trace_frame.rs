use super::TraceError;
use crate::bindings::signal::siginfo_t;
use crate::event::{EncodedEvent, Event};
use crate::extra_registers::{ExtraRegisters, FXSAVE_AREA_SIZE};
use crate::kernel_abi::SupportedArch;
use crate::registers::{Registers, REGISTERS_RAW_SIZE};
use crate::ticks::Ticks;
use libc::pid_t;
use std::fmt::{Display, Formatter};
use std::mem::size_of;

/// The index of a frame in the trace: a monotonically increasing integer
/// assigned by the tracer. Frames are totally ordered by it.
pub type FrameTime = u64;

/// One serialized event for one task: everything replay needs to reproduce
/// the stop, plus the location of any payload bytes in the data stream.
#[derive(Clone)]
pub struct TraceFrame {
    pub time: FrameTime,
    pub tid: pid_t,
    pub event: Event,
    pub ticks: Ticks,
    pub regs: Registers,
    pub extra_regs: ExtraRegisters,
    /// Byte offset of this frame's payload records in the data stream;
    /// meaningless when data_len == 0.
    pub data_offset: u64,
    pub data_len: u32,
}

/// The wire form: fixed size so the events stream is seekable by record
/// index within a chunk.
#[repr(C)]
#[derive(Copy, Clone)]
struct FrameWire {
    time: u64,
    tid: i32,
    arch: u32,
    event: EncodedEvent,
    ticks: u64,
    data_offset: u64,
    data_len: u32,
    _pad: u32,
    regs: [u8; REGISTERS_RAW_SIZE],
    extra_regs: [u8; FXSAVE_AREA_SIZE],
    siginfo: [u8; size_of::<siginfo_t>()],
}

pub const FRAME_WIRE_SIZE: usize = size_of::<FrameWire>();

const_assert_eq!(
    std::mem::size_of::<FrameWire>(),
    8 + 4 + 4 + 24 + 8 + 8 + 4 + 4 + 216 + 512 + 128
);

impl TraceFrame {
    pub fn to_wire_bytes(&self) -> [u8; FRAME_WIRE_SIZE] {
        let (event, siginfo) = self.event.encode();
        let wire = FrameWire {
            time: self.time,
            tid: self.tid,
            arch: self.regs.arch() as u32,
            event,
            ticks: self.ticks,
            data_offset: self.data_offset,
            data_len: self.data_len,
            _pad: 0,
            regs: self.regs.to_raw_bytes(),
            extra_regs: *self.extra_regs.data(),
            siginfo: siginfo.as_bytes(),
        };
        unsafe { std::mem::transmute(wire) }
    }

    pub fn from_wire_bytes(bytes: &[u8; FRAME_WIRE_SIZE]) -> Result<TraceFrame, TraceError> {
        let wire: FrameWire = unsafe { std::mem::transmute(*bytes) };
        let arch = SupportedArch::from_raw(wire.arch)
            .ok_or_else(|| TraceError::Corrupt(format!("unknown arch {}", wire.arch)))?;
        let siginfo = siginfo_t::from_bytes(&wire.siginfo);
        let event = Event::decode(&wire.event, &siginfo)
            .ok_or_else(|| TraceError::Corrupt(format!("bad event tag {}", wire.event.tag)))?;
        Ok(TraceFrame {
            time: wire.time,
            tid: wire.tid,
            event,
            ticks: wire.ticks,
            regs: Registers::from_raw_bytes(arch, &wire.regs),
            extra_regs: ExtraRegisters::from_raw_bytes(&wire.extra_regs),
            data_offset: wire.data_offset,
            data_len: wire.data_len,
        })
    }
}

impl Display for TraceFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{ time:{} tid:{} ticks:{} {} ip:{:#x} }}",
            self.time,
            self.tid,
            self.ticks,
            self.event,
            self.regs.ip().as_usize()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{SyscallEventData, SyscallState};
    use crate::kernel_abi::NATIVE_ARCH;
    use crate::remote_code_ptr::RemoteCodePtr;

    #[test]
    fn frame_wire_roundtrip() {
        let mut regs = Registers::new(NATIVE_ARCH);
        regs.set_ip(RemoteCodePtr::new(0x401000));
        regs.set_syscall_result(0);
        let frame = TraceFrame {
            time: 99,
            tid: 1234,
            event: Event::Syscall(SyscallEventData {
                state: SyscallState::EnteringSyscall,
                number: libc::SYS_write,
                arch: NATIVE_ARCH,
            }),
            ticks: 555_000,
            regs,
            extra_regs: ExtraRegisters::new(NATIVE_ARCH),
            data_offset: 4096,
            data_len: 12,
        };
        let bytes = frame.to_wire_bytes();
        let back = TraceFrame::from_wire_bytes(&bytes).unwrap();
        assert_eq!(99, back.time);
        assert_eq!(1234, back.tid);
        assert_eq!(555_000, back.ticks);
        assert_eq!(4096, back.data_offset);
        assert_eq!(12, back.data_len);
        assert!(back.regs.matches(&frame.regs));
        match back.event {
            Event::Syscall(sys) => {
                assert_eq!(libc::SYS_write, sys.number);
                assert_eq!(SyscallState::EnteringSyscall, sys.state);
            }
            _ => panic!("wrong event"),
        }
    }

    #[test]
    fn corrupt_frame_rejected() {
        let frame = TraceFrame {
            time: 1,
            tid: 1,
            event: Event::Sched,
            ticks: 0,
            regs: Registers::new(NATIVE_ARCH),
            extra_regs: ExtraRegisters::new(NATIVE_ARCH),
            data_offset: 0,
            data_len: 0,
        };
        let mut bytes = frame.to_wire_bytes();
        // Stomp the event tag.
        bytes[16] = 0xff;
        assert!(TraceFrame::from_wire_bytes(&bytes).is_err());
    }
}
