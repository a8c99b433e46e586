use crate::commands::options::RetraceOptions;
use structopt::StructOpt;

lazy_static! {
    static ref FLAGS: Flags = init_flags();
}

/// Process-wide option snapshot, parsed once from the command line.
#[derive(Clone)]
pub struct Flags {
    /// Any warning or error that would be printed is treated as fatal.
    pub fatal_errors_and_warnings: bool,
    /// Suppress warnings about environmental features outside our
    /// control (CPU quirks, missing preload library).
    pub suppress_environment_warnings: bool,
}

impl Flags {
    pub fn get() -> &'static Flags {
        &*FLAGS
    }
}

fn init_flags() -> Flags {
    let options = RetraceOptions::from_args();
    Flags {
        fatal_errors_and_warnings: options.fatal_errors,
        suppress_environment_warnings: options.suppress_environment_warnings,
    }
}
