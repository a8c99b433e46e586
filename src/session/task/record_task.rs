//! Record-side task operations: syscallbuf ring inspection, ring reset,
//! and stashed-signal bookkeeping. The ring may only be touched while the
//! tracee is stopped; together with the shim's publication order on
//! `num_rec_bytes` that makes these reads consistent without atomics.

use super::Task;
use crate::bindings::signal::siginfo_t;
use crate::log::LogLevel::LogDebug;
use crate::preload_interface::{
    syscallbuf_hdr, SYSCALLBUF_BUFFER_SIZE, SYSCALLBUF_HDR_SIZE,
};
use crate::remote_ptr::RemotePtr;
use crate::sig::Sig;

impl Task {
    pub fn has_syscallbuf(&self) -> bool {
        !self.syscallbuf_child.is_null()
    }

    pub fn syscallbuf_hdr_ptr(&self) -> RemotePtr<syscallbuf_hdr> {
        RemotePtr::cast(self.syscallbuf_child)
    }

    pub fn read_syscallbuf_hdr(&self) -> Option<syscallbuf_hdr> {
        if !self.has_syscallbuf() {
            return None;
        }
        self.read_val(self.syscallbuf_hdr_ptr())
    }

    pub fn write_syscallbuf_hdr(&self, hdr: &syscallbuf_hdr) {
        debug_assert!(self.has_syscallbuf());
        if !self.write_val(self.syscallbuf_hdr_ptr(), hdr) {
            fatal!("Can't write syscallbuf header of task {}", self.tid);
        }
    }

    /// The ring's valid prefix: header plus `num_rec_bytes` of records,
    /// verbatim. This is what a SYSCALLBUF_FLUSH frame carries.
    pub fn read_ring_prefix(&self) -> Option<Vec<u8>> {
        let hdr = self.read_syscallbuf_hdr()?;
        let total = SYSCALLBUF_HDR_SIZE + hdr.num_rec_bytes as usize;
        if total > SYSCALLBUF_BUFFER_SIZE {
            fatal!(
                "Tracee {} claims {} record bytes, more than the ring holds",
                self.tid,
                hdr.num_rec_bytes
            );
        }
        let mut buf = vec![0u8; total];
        if !self.read_mem(self.syscallbuf_child, &mut buf) {
            return None;
        }
        Some(buf)
    }

    /// Tell the shim to drop the record it is about to commit: the
    /// syscall was already recorded through the traced path.
    pub fn set_abort_commit(&self) {
        if let Some(mut hdr) = self.read_syscallbuf_hdr() {
            hdr.abort_commit = 1;
            self.write_syscallbuf_hdr(&hdr);
        }
    }

    /// Return the ring to its empty state, zeroing the consumed region so
    /// the next flush's suffix invariant holds.
    pub fn reset_syscallbuf(&self) {
        let hdr = match self.read_syscallbuf_hdr() {
            Some(hdr) => hdr,
            None => return,
        };
        if hdr.num_rec_bytes > 0 {
            let zeros = vec![0u8; hdr.num_rec_bytes as usize];
            self.write_mem(
                self.syscallbuf_child + SYSCALLBUF_HDR_SIZE,
                &zeros,
            );
        }
        let mut new_hdr = hdr;
        new_hdr.num_rec_bytes = 0;
        new_hdr.abort_commit = 0;
        self.write_syscallbuf_hdr(&new_hdr);
        log!(LogDebug, "reset syscallbuf of task {}", self.tid);
    }

    // --- stashed signals ---

    pub fn stash_sig(&mut self, sig: Sig, si: &siginfo_t) {
        log!(LogDebug, "task {} stashing {}", self.tid, sig);
        self.stashed_signals.push((sig, *si));
    }

    pub fn pop_stashed_sig(&mut self) -> Option<(Sig, siginfo_t)> {
        if self.stashed_signals.is_empty() {
            None
        } else {
            Some(self.stashed_signals.remove(0))
        }
    }

    pub fn has_stashed_sig(&self) -> bool {
        !self.stashed_signals.is_empty()
    }
}
