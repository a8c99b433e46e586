//! Sessions own all live tasks. Exactly one session is active in the
//! tracer at a time: a RecordSession while recording, a ReplaySession
//! while replaying, and a short-lived DiversionSession cloned from a
//! replay when the debugger wants to execute speculatively.
//!
//! The variants share `SessionInner` (task table, address-space arena)
//! and a small common operation set; everything else is variant-specific
//! and reached by matching. No inheritance games.

pub mod address_space;
pub mod diversion_session;
pub mod record_session;
pub mod replay_session;
pub mod session_inner;
pub mod task;

use diversion_session::DiversionSession;
use record_session::RecordSession;
use replay_session::ReplaySession;
use session_inner::SessionInner;
use std::path::Path;
use task::TaskSharedPtr;

/// Index into the session's address-space arena. Tasks hold this instead
/// of a pointer so Task, AddressSpace and breakpoint storage don't form
/// reference cycles.
pub type AddressSpaceId = usize;

pub enum Session {
    Record(RecordSession),
    Replay(ReplaySession),
    Diversion(DiversionSession),
}

impl Session {
    pub fn inner(&self) -> &SessionInner {
        match self {
            Session::Record(s) => &s.inner,
            Session::Replay(s) => &s.inner,
            Session::Diversion(s) => &s.inner,
        }
    }

    pub fn inner_mut(&mut self) -> &mut SessionInner {
        match self {
            Session::Record(s) => &mut s.inner,
            Session::Replay(s) => &mut s.inner,
            Session::Diversion(s) => &mut s.inner,
        }
    }

    pub fn find_task(&self, rec_tid: libc::pid_t) -> Option<TaskSharedPtr> {
        self.inner().find_task(rec_tid)
    }

    pub fn kill_all_tasks(&mut self) {
        self.inner_mut().kill_all_tasks();
    }

    /// The trace directory this session records to or replays from;
    /// diversions have none.
    pub fn trace_dir(&self) -> Option<&Path> {
        match self {
            Session::Record(s) => Some(s.trace_writer().dir()),
            Session::Replay(s) => Some(s.trace_reader().dir()),
            Session::Diversion(_) => None,
        }
    }
}
