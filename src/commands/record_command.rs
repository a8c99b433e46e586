use crate::log::LogLevel::LogInfo;
use crate::session::record_session::{RecordResult, RecordSession};
use std::ffi::{OsStr, OsString};

/// `retrace record <cmd> [args...]`: drive the record loop until the
/// whole tracee tree is gone, then mirror the initial task's exit
/// status.
pub fn run(exe: &OsStr, args: &[OsString]) -> i32 {
    let mut session = RecordSession::create(exe, args);
    let exit_status;
    loop {
        match session.record_step() {
            RecordResult::StepContinue => (),
            RecordResult::AllExited { exit_status: status } => {
                exit_status = status;
                break;
            }
        }
    }
    session.finish_recording();
    log!(
        LogInfo,
        "recording of {:?} finished; exit status {}",
        exe,
        exit_status
    );
    exit_status
}
