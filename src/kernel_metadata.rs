//! Name tables for syscalls, signals, errnos and ptrace events. These are
//! given data; only entries the tracer can actually encounter are spelled
//! out, everything else formats numerically.

use crate::bindings::ptrace::*;

pub fn syscall_name(syscallno: i64) -> String {
    let name = match syscallno {
        libc::SYS_read => "read",
        libc::SYS_write => "write",
        libc::SYS_open => "open",
        libc::SYS_close => "close",
        libc::SYS_stat => "stat",
        libc::SYS_fstat => "fstat",
        libc::SYS_lstat => "lstat",
        libc::SYS_poll => "poll",
        libc::SYS_lseek => "lseek",
        libc::SYS_mmap => "mmap",
        libc::SYS_mprotect => "mprotect",
        libc::SYS_munmap => "munmap",
        libc::SYS_brk => "brk",
        libc::SYS_rt_sigaction => "rt_sigaction",
        libc::SYS_rt_sigprocmask => "rt_sigprocmask",
        libc::SYS_rt_sigreturn => "rt_sigreturn",
        libc::SYS_ioctl => "ioctl",
        libc::SYS_pread64 => "pread64",
        libc::SYS_pwrite64 => "pwrite64",
        libc::SYS_readv => "readv",
        libc::SYS_writev => "writev",
        libc::SYS_access => "access",
        libc::SYS_pipe => "pipe",
        libc::SYS_select => "select",
        libc::SYS_sched_yield => "sched_yield",
        libc::SYS_mremap => "mremap",
        libc::SYS_msync => "msync",
        libc::SYS_madvise => "madvise",
        libc::SYS_dup => "dup",
        libc::SYS_dup2 => "dup2",
        libc::SYS_pause => "pause",
        libc::SYS_nanosleep => "nanosleep",
        libc::SYS_getitimer => "getitimer",
        libc::SYS_alarm => "alarm",
        libc::SYS_setitimer => "setitimer",
        libc::SYS_getpid => "getpid",
        libc::SYS_socket => "socket",
        libc::SYS_connect => "connect",
        libc::SYS_accept => "accept",
        libc::SYS_sendto => "sendto",
        libc::SYS_recvfrom => "recvfrom",
        libc::SYS_sendmsg => "sendmsg",
        libc::SYS_recvmsg => "recvmsg",
        libc::SYS_shutdown => "shutdown",
        libc::SYS_bind => "bind",
        libc::SYS_listen => "listen",
        libc::SYS_getsockname => "getsockname",
        libc::SYS_getpeername => "getpeername",
        libc::SYS_socketpair => "socketpair",
        libc::SYS_setsockopt => "setsockopt",
        libc::SYS_getsockopt => "getsockopt",
        libc::SYS_clone => "clone",
        libc::SYS_fork => "fork",
        libc::SYS_vfork => "vfork",
        libc::SYS_execve => "execve",
        libc::SYS_exit => "exit",
        libc::SYS_wait4 => "wait4",
        libc::SYS_kill => "kill",
        libc::SYS_uname => "uname",
        libc::SYS_fcntl => "fcntl",
        libc::SYS_flock => "flock",
        libc::SYS_fsync => "fsync",
        libc::SYS_getcwd => "getcwd",
        libc::SYS_chdir => "chdir",
        libc::SYS_rename => "rename",
        libc::SYS_mkdir => "mkdir",
        libc::SYS_rmdir => "rmdir",
        libc::SYS_creat => "creat",
        libc::SYS_link => "link",
        libc::SYS_unlink => "unlink",
        libc::SYS_readlink => "readlink",
        libc::SYS_chmod => "chmod",
        libc::SYS_chown => "chown",
        libc::SYS_umask => "umask",
        libc::SYS_gettimeofday => "gettimeofday",
        libc::SYS_getrlimit => "getrlimit",
        libc::SYS_getrusage => "getrusage",
        libc::SYS_sysinfo => "sysinfo",
        libc::SYS_times => "times",
        libc::SYS_ptrace => "ptrace",
        libc::SYS_getuid => "getuid",
        libc::SYS_getgid => "getgid",
        libc::SYS_geteuid => "geteuid",
        libc::SYS_getegid => "getegid",
        libc::SYS_getppid => "getppid",
        libc::SYS_getpgrp => "getpgrp",
        libc::SYS_setsid => "setsid",
        libc::SYS_rt_sigpending => "rt_sigpending",
        libc::SYS_rt_sigtimedwait => "rt_sigtimedwait",
        libc::SYS_rt_sigqueueinfo => "rt_sigqueueinfo",
        libc::SYS_rt_sigsuspend => "rt_sigsuspend",
        libc::SYS_sigaltstack => "sigaltstack",
        libc::SYS_statfs => "statfs",
        libc::SYS_fstatfs => "fstatfs",
        libc::SYS_sched_setaffinity => "sched_setaffinity",
        libc::SYS_sched_getaffinity => "sched_getaffinity",
        libc::SYS_prctl => "prctl",
        libc::SYS_arch_prctl => "arch_prctl",
        libc::SYS_setrlimit => "setrlimit",
        libc::SYS_sync => "sync",
        libc::SYS_gettid => "gettid",
        libc::SYS_futex => "futex",
        libc::SYS_getdents64 => "getdents64",
        libc::SYS_set_tid_address => "set_tid_address",
        libc::SYS_restart_syscall => "restart_syscall",
        libc::SYS_fadvise64 => "fadvise64",
        libc::SYS_timer_create => "timer_create",
        libc::SYS_timer_settime => "timer_settime",
        libc::SYS_timer_delete => "timer_delete",
        libc::SYS_clock_gettime => "clock_gettime",
        libc::SYS_clock_getres => "clock_getres",
        libc::SYS_clock_nanosleep => "clock_nanosleep",
        libc::SYS_exit_group => "exit_group",
        libc::SYS_epoll_wait => "epoll_wait",
        libc::SYS_epoll_ctl => "epoll_ctl",
        libc::SYS_tgkill => "tgkill",
        libc::SYS_waitid => "waitid",
        libc::SYS_openat => "openat",
        libc::SYS_mkdirat => "mkdirat",
        libc::SYS_newfstatat => "newfstatat",
        libc::SYS_unlinkat => "unlinkat",
        libc::SYS_renameat => "renameat",
        libc::SYS_faccessat => "faccessat",
        libc::SYS_ppoll => "ppoll",
        libc::SYS_set_robust_list => "set_robust_list",
        libc::SYS_get_robust_list => "get_robust_list",
        libc::SYS_utimensat => "utimensat",
        libc::SYS_epoll_pwait => "epoll_pwait",
        libc::SYS_accept4 => "accept4",
        libc::SYS_eventfd2 => "eventfd2",
        libc::SYS_epoll_create1 => "epoll_create1",
        libc::SYS_dup3 => "dup3",
        libc::SYS_pipe2 => "pipe2",
        libc::SYS_tkill => "tkill",
        libc::SYS_time => "time",
        libc::SYS_prlimit64 => "prlimit64",
        libc::SYS_getrandom => "getrandom",
        libc::SYS_memfd_create => "memfd_create",
        _ => return format!("syscall({})", syscallno),
    };
    name.to_owned()
}

pub fn signal_name(sig: i32) -> String {
    let name = match sig {
        libc::SIGHUP => "SIGHUP",
        libc::SIGINT => "SIGINT",
        libc::SIGQUIT => "SIGQUIT",
        libc::SIGILL => "SIGILL",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGKILL => "SIGKILL",
        libc::SIGUSR1 => "SIGUSR1",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGUSR2 => "SIGUSR2",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGALRM => "SIGALRM",
        libc::SIGTERM => "SIGTERM",
        libc::SIGSTKFLT => "SIGSTKFLT",
        libc::SIGCHLD => "SIGCHLD",
        libc::SIGCONT => "SIGCONT",
        libc::SIGSTOP => "SIGSTOP",
        libc::SIGTSTP => "SIGTSTP",
        libc::SIGTTIN => "SIGTTIN",
        libc::SIGTTOU => "SIGTTOU",
        libc::SIGURG => "SIGURG",
        libc::SIGXCPU => "SIGXCPU",
        libc::SIGXFSZ => "SIGXFSZ",
        libc::SIGVTALRM => "SIGVTALRM",
        libc::SIGPROF => "SIGPROF",
        libc::SIGWINCH => "SIGWINCH",
        libc::SIGIO => "SIGIO",
        libc::SIGPWR => "SIGPWR",
        libc::SIGSYS => "SIGSYS",
        _ => {
            if sig >= libc::SIGRTMIN() && sig <= libc::SIGRTMAX() {
                return format!("SIGRT{}", sig - libc::SIGRTMIN());
            }
            return format!("signal({})", sig);
        }
    };
    name.to_owned()
}

pub fn errno_name(err: i32) -> String {
    let name = match err {
        0 => "SUCCESS",
        libc::EPERM => "EPERM",
        libc::ENOENT => "ENOENT",
        libc::ESRCH => "ESRCH",
        libc::EINTR => "EINTR",
        libc::EIO => "EIO",
        libc::ENXIO => "ENXIO",
        libc::E2BIG => "E2BIG",
        libc::ENOEXEC => "ENOEXEC",
        libc::EBADF => "EBADF",
        libc::ECHILD => "ECHILD",
        libc::EAGAIN => "EAGAIN",
        libc::ENOMEM => "ENOMEM",
        libc::EACCES => "EACCES",
        libc::EFAULT => "EFAULT",
        libc::ENOTBLK => "ENOTBLK",
        libc::EBUSY => "EBUSY",
        libc::EEXIST => "EEXIST",
        libc::EXDEV => "EXDEV",
        libc::ENODEV => "ENODEV",
        libc::ENOTDIR => "ENOTDIR",
        libc::EISDIR => "EISDIR",
        libc::EINVAL => "EINVAL",
        libc::ENFILE => "ENFILE",
        libc::EMFILE => "EMFILE",
        libc::ENOTTY => "ENOTTY",
        libc::ETXTBSY => "ETXTBSY",
        libc::EFBIG => "EFBIG",
        libc::ENOSPC => "ENOSPC",
        libc::ESPIPE => "ESPIPE",
        libc::EROFS => "EROFS",
        libc::EMLINK => "EMLINK",
        libc::EPIPE => "EPIPE",
        libc::EDOM => "EDOM",
        libc::ERANGE => "ERANGE",
        libc::EDEADLK => "EDEADLK",
        libc::ENAMETOOLONG => "ENAMETOOLONG",
        libc::ENOLCK => "ENOLCK",
        libc::ENOSYS => "ENOSYS",
        libc::ENOTEMPTY => "ENOTEMPTY",
        libc::ELOOP => "ELOOP",
        libc::ETIMEDOUT => "ETIMEDOUT",
        libc::ECONNREFUSED => "ECONNREFUSED",
        libc::ECONNRESET => "ECONNRESET",
        libc::EINPROGRESS => "EINPROGRESS",
        _ => return format!("errno({})", err),
    };
    name.to_owned()
}

pub fn ptrace_event_name(event: u32) -> String {
    let name = match event {
        PTRACE_EVENT_FORK => "PTRACE_EVENT_FORK",
        PTRACE_EVENT_VFORK => "PTRACE_EVENT_VFORK",
        PTRACE_EVENT_CLONE => "PTRACE_EVENT_CLONE",
        PTRACE_EVENT_EXEC => "PTRACE_EVENT_EXEC",
        PTRACE_EVENT_VFORK_DONE => "PTRACE_EVENT_VFORK_DONE",
        PTRACE_EVENT_EXIT => "PTRACE_EVENT_EXIT",
        PTRACE_EVENT_SECCOMP => "PTRACE_EVENT_SECCOMP",
        PTRACE_EVENT_STOP => "PTRACE_EVENT_STOP",
        _ => return format!("PTRACE_EVENT({})", event),
    };
    name.to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_syscall_names() {
        assert_eq!("read", syscall_name(libc::SYS_read));
        assert_eq!("exit_group", syscall_name(libc::SYS_exit_group));
    }

    #[test]
    fn unknown_syscall_formats_numerically() {
        assert_eq!("syscall(99999)", syscall_name(99999));
    }

    #[test]
    fn signal_names() {
        assert_eq!("SIGSEGV", signal_name(libc::SIGSEGV));
        assert_eq!("SIGSTKFLT", signal_name(libc::SIGSTKFLT));
    }
}
