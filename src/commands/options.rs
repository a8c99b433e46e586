use std::ffi::OsString;
use std::path::PathBuf;
use structopt::clap::AppSettings;
use structopt::StructOpt;

#[derive(Debug, StructOpt)]
#[structopt(
    name = "retrace",
    about = "Record and replay Linux process trees deterministically",
    after_help = "Use RETRACE_LOG to control logging; e.g. \
                  RETRACE_LOG=all:warn,scheduler:debug. \
                  RETRACE_USE_SYSCALLBUF=disabled turns off syscall \
                  buffering; RETRACE_MAX_TICKS tunes the timeslice."
)]
#[structopt(global_settings = &[AppSettings::AllowNegativeNumbers, AppSettings::UnifiedHelpMessage])]
pub struct RetraceOptions {
    #[structopt(
        short = "E",
        long = "fatal-errors",
        help = "Any warning or error that is printed is treated as fatal."
    )]
    pub fatal_errors: bool,

    #[structopt(
        long = "suppress-environment-warnings",
        help = "Suppress warnings about issues in the environment outside our control."
    )]
    pub suppress_environment_warnings: bool,

    #[structopt(subcommand)]
    pub cmd: RetraceSubcommand,
}

#[derive(Debug, StructOpt)]
pub enum RetraceSubcommand {
    /// Record the execution of a command into a trace directory.
    #[structopt(name = "record")]
    Record {
        #[structopt(parse(from_os_str))]
        exe: OsString,
        #[structopt(parse(from_os_str))]
        args: Vec<OsString>,
    },

    /// Replay a recorded trace (the most recent one by default).
    #[structopt(name = "replay")]
    Replay {
        /// Serve a debugger on this TCP port instead of replaying
        /// straight through.
        #[structopt(short = "s", long = "serve")]
        port: Option<u16>,
        #[structopt(parse(from_os_str))]
        trace_dir: Option<PathBuf>,
    },

    /// Print the frames of a recorded trace.
    #[structopt(name = "dump")]
    Dump {
        #[structopt(parse(from_os_str))]
        trace_dir: Option<PathBuf>,
    },
}
