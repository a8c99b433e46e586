//! Replay-side task operations: depositing recorded memory and registers
//! so the tracee's observable state equals the recording's, bit for bit.

use super::Task;
use crate::log::LogLevel::LogDebug;
use crate::registers::{MismatchBehavior, Registers};
use crate::remote_ptr::RemotePtr;
use crate::trace::trace_stream::RawDataRecord;

impl Task {
    /// Write every payload record of a frame back into tracee memory.
    /// Records for scratch/unmapped regions that no longer exist are a
    /// replay divergence and fatal.
    pub fn apply_all_data_records(&self, raw: &[RawDataRecord]) {
        for rec in raw {
            if rec.data.is_empty() {
                continue;
            }
            log!(
                LogDebug,
                "restoring {} bytes at {:#x} in task {}",
                rec.data.len(),
                rec.addr,
                self.tid
            );
            if !self.write_mem(RemotePtr::new(rec.addr), &rec.data) {
                ed_assert!(
                    self,
                    false,
                    "Can't restore {} recorded bytes at {:#x}",
                    rec.data.len(),
                    rec.addr
                );
            }
        }
    }

    /// Force this task's registers to the recorded ones.
    pub fn set_regs_from_trace(&mut self, recorded: &Registers) {
        self.regs = *recorded;
        self.registers_dirty = true;
    }

    /// Replay invariant: after a frame is applied the live registers must
    /// equal the recorded ones exactly. A mismatch is a correctness bug,
    /// never a user error, so it aborts.
    pub fn validate_regs(&self, recorded: &Registers) {
        let ok = self
            .regs
            .compare_with(recorded, MismatchBehavior::LogMismatches);
        ed_assert!(self, ok, "replayed registers diverged from the recording");
    }
}
