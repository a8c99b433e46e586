use nix::fcntl::open;
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::close;
use nix::NixPath;
use std::os::unix::io::RawFd;

/// An owned file descriptor, closed on drop. The tracer juggles many fds
/// per tracee (perf counters, /proc/pid/mem, desched events) and leaking
/// any of them counts as resource exhaustion.
pub struct ScopedFd {
    fd: RawFd,
}

impl ScopedFd {
    pub fn new() -> Self {
        ScopedFd { fd: -1 }
    }

    pub fn from_raw(fd: RawFd) -> Self {
        ScopedFd { fd }
    }

    /// Open `path`, aborting on failure. Use `try_open_path` when failure
    /// is survivable.
    pub fn open_path_with_mode<P: ?Sized + NixPath>(path: &P, oflag: OFlag, mode: Mode) -> Self {
        match open(path, oflag, mode) {
            Ok(rawfd) => ScopedFd { fd: rawfd },
            Err(e) => {
                let mut name = Vec::new();
                let _ = path.with_nix_path(|p| name = p.to_bytes().to_vec());
                fatal!("Failed to open {:?}: {:?}", String::from_utf8_lossy(&name), e);
            }
        }
    }

    pub fn try_open_path<P: ?Sized + NixPath>(path: &P, oflag: OFlag) -> Option<Self> {
        open(path, oflag, Mode::empty())
            .ok()
            .map(|rawfd| ScopedFd { fd: rawfd })
    }

    pub fn close(&mut self) {
        if self.fd >= 0 {
            // The fd may already be gone if the tracee died; ignore errors.
            let _ = close(self.fd);
        }

        self.fd = -1;
    }

    pub fn is_open(&self) -> bool {
        self.fd >= 0
    }

    pub fn as_raw(&self) -> RawFd {
        self.fd
    }

    /// Give up ownership without closing.
    pub fn extract(&mut self) -> RawFd {
        let result = self.fd;
        self.fd = -1;
        result
    }
}

impl Default for ScopedFd {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScopedFd {
    fn drop(&mut self) {
        self.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_closed() {
        let fd = ScopedFd::new();
        assert!(!fd.is_open());
        assert_eq!(-1, fd.as_raw());
    }

    #[test]
    fn extract_relinquishes() {
        let mut fd = ScopedFd::from_raw(42);
        assert_eq!(42, fd.extract());
        assert!(!fd.is_open());
    }
}
