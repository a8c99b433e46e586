#![allow(dead_code)]

#[macro_use]
extern crate lazy_static;
#[macro_use]
extern crate memoffset;
#[macro_use]
extern crate static_assertions;

#[macro_use]
mod log;

mod auto_remote_syscalls;
mod bindings;
mod commands;
mod emu_fs;
mod event;
mod extra_registers;
mod flags;
mod gdb_connection;
mod gdb_server;
mod kernel_abi;
mod kernel_metadata;
mod perf_counters;
mod preload_interface;
mod record_signal;
mod record_syscall;
mod registers;
mod remote_code_ptr;
mod remote_ptr;
mod replay_syscall;
mod scheduler;
mod scoped_fd;
mod seccomp_bpf;
mod session;
mod sig;
mod ticks;
mod trace;
mod util;
mod wait_status;

use commands::options::{RetraceOptions, RetraceSubcommand};
use structopt::StructOpt;

fn main() {
    let options = RetraceOptions::from_args();
    // Force the flags snapshot before anything logs.
    let _ = flags::Flags::get();

    let exit_code = match options.cmd {
        RetraceSubcommand::Record { exe, args } => commands::record_command::run(&exe, &args),
        RetraceSubcommand::Replay { port, trace_dir } => {
            commands::replay_command::run(port, trace_dir)
        }
        RetraceSubcommand::Dump { trace_dir } => commands::dump_command::run(trace_dir),
    };
    std::process::exit(exit_code);
}
