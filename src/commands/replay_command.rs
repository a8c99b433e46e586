use super::{EXIT_FAILURE, EXIT_SUCCESS, EXIT_TRACE_CORRUPT};
use crate::gdb_server::GdbServer;
use crate::log::LogLevel::LogError;
use crate::session::replay_session::{ReplaySession, ReplayStatus};
use crate::trace::TraceError;
use std::path::{Path, PathBuf};

/// `retrace replay [-s port] [trace-dir]`. Zero on a complete replay; a
/// distinct exit code for trace corruption, with no partial replay
/// attempted past the damage.
pub fn run(port: Option<u16>, trace_dir: Option<PathBuf>) -> i32 {
    match replay(port, trace_dir.as_deref()) {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            log!(LogError, "replay failed: {}", e);
            match e {
                TraceError::VersionMismatch { .. }
                | TraceError::TruncatedChunk
                | TraceError::Corrupt(_) => EXIT_TRACE_CORRUPT,
                TraceError::Io(_) => EXIT_FAILURE,
            }
        }
    }
}

fn replay(port: Option<u16>, trace_dir: Option<&Path>) -> Result<(), TraceError> {
    let session = ReplaySession::create(trace_dir)?;
    match port {
        Some(port) => {
            let mut server = GdbServer::new(session, trace_dir.map(|p| p.to_path_buf()));
            server.serve(port)
        }
        None => {
            let mut session = session;
            loop {
                if let ReplayStatus::ReplayedAllEvents = session.replay_step()? {
                    return Ok(());
                }
            }
        }
    }
}
