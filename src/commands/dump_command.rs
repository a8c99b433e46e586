use super::{EXIT_SUCCESS, EXIT_TRACE_CORRUPT};
use crate::trace::trace_reader::TraceReader;
use crate::trace::TraceError;
use std::path::PathBuf;

/// `retrace dump [trace-dir]`: print every frame of a trace, for humans
/// and tests poking at recordings.
pub fn run(trace_dir: Option<PathBuf>) -> i32 {
    match dump(trace_dir) {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("dump failed: {}", e);
            EXIT_TRACE_CORRUPT
        }
    }
}

fn dump(trace_dir: Option<PathBuf>) -> Result<(), TraceError> {
    let mut reader = TraceReader::open(trace_dir.as_deref())?;
    println!(
        "trace {:?}: {:?} {:?}",
        reader.dir(),
        reader.args_env().exe,
        reader.args_env().argv
    );
    while let Some((frame, raw)) = reader.read_frame()? {
        let payload: usize = raw.iter().map(|r| r.data.len()).sum();
        if payload > 0 {
            println!("{}  [{} payload bytes in {} records]", frame, payload, raw.len());
        } else {
            println!("{}", frame);
        }
    }
    Ok(())
}
