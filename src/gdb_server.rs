//! Binds the debugger channel to a replay: serves register/memory reads,
//! breakpoints and watchpoints against the replaying tracees, and swaps
//! the replay for a diversion when the debugger starts manipulating
//! siginfo (the request pattern that precedes "call this function in the
//! tracee").
//!
//! The server owns one `Session` at a time; diversion entry and exit are
//! session swaps, and the replay is rebuilt from the trace when a
//! diversion retires, so later frames reproduce the original state.

use crate::gdb_connection::{to_hex, DebuggerConnection, DebuggerRequest};
use crate::kernel_abi::BREAKPOINT_INSTRUCTION;
use crate::log::LogLevel::{LogInfo, LogWarn};
use crate::remote_code_ptr::RemoteCodePtr;
use crate::remote_ptr::RemotePtr;
use crate::session::address_space::WatchType;
use crate::session::diversion_session::{DiversionResume, DiversionSession, DiversionStatus};
use crate::session::replay_session::{ReplaySession, ReplayStatus};
use crate::session::session_inner::SessionInner;
use crate::session::task::TaskSharedPtr;
use crate::session::Session;
use crate::trace::TraceError;
use libc::pid_t;
use std::path::PathBuf;

pub struct GdbServer {
    session: Session,
    trace_dir: Option<PathBuf>,
    current_thread: Option<pid_t>,
}

impl GdbServer {
    pub fn new(replay: ReplaySession, trace_dir: Option<PathBuf>) -> GdbServer {
        GdbServer {
            session: Session::Replay(replay),
            trace_dir,
            current_thread: None,
        }
    }

    /// Serve one debugger until it detaches or the trace ends. Errors on
    /// the channel close it; the replay finishes headless.
    pub fn serve(&mut self, port: u16) -> Result<(), TraceError> {
        let mut conn = match DebuggerConnection::await_debugger(port) {
            Ok(c) => c,
            Err(e) => {
                log!(LogWarn, "debugger channel failed ({}); replaying headless", e);
                return self.finish_headless();
            }
        };

        loop {
            let req = match conn.read_request() {
                Some(r) => r,
                None => {
                    log!(LogInfo, "debugger disconnected; finishing replay");
                    return self.finish_headless();
                }
            };
            match req {
                DebuggerRequest::Cont => {
                    let reply = self.do_continue()?;
                    conn.reply(reply.as_bytes());
                }
                DebuggerRequest::Step => {
                    let reply = self.do_step()?;
                    conn.reply(reply.as_bytes());
                }
                DebuggerRequest::ReadRegs(tid) => match self.session.find_task(tid) {
                    Some(t) => {
                        let bytes = t.borrow().regs.to_raw_bytes();
                        conn.reply(to_hex(&bytes).as_bytes());
                    }
                    None => conn.reply_error("no such thread"),
                },
                DebuggerRequest::WriteRegs(tid, bytes) => {
                    match (self.session.find_task(tid), bytes.len()) {
                        (Some(t), crate::registers::REGISTERS_RAW_SIZE) => {
                            let mut raw = [0u8; crate::registers::REGISTERS_RAW_SIZE];
                            raw.copy_from_slice(&bytes);
                            let mut tb = t.borrow_mut();
                            let arch = tb.regs.arch();
                            tb.regs = crate::registers::Registers::from_raw_bytes(arch, &raw);
                            tb.registers_dirty = true;
                            conn.reply_ok();
                        }
                        _ => conn.reply_error("bad registers"),
                    }
                }
                DebuggerRequest::ReadMem(addr, len) => match self.read_mem_masked(addr, len) {
                    Some(bytes) => conn.reply(to_hex(&bytes).as_bytes()),
                    None => conn.reply_error("unmapped"),
                },
                DebuggerRequest::WriteMem(addr, bytes) => {
                    let ok = self
                        .any_task()
                        .map(|t| t.borrow().write_mem(RemotePtr::new(addr), &bytes))
                        .unwrap_or(false);
                    if ok {
                        conn.reply_ok();
                    } else {
                        conn.reply_error("unmapped");
                    }
                }
                DebuggerRequest::SetBreakpoint(addr) => {
                    if self.set_breakpoint(addr) {
                        conn.reply_ok();
                    } else {
                        conn.reply_error("can't set breakpoint");
                    }
                }
                DebuggerRequest::ClearBreakpoint(addr) => {
                    self.clear_breakpoint(addr);
                    conn.reply_ok();
                }
                DebuggerRequest::SetWatchpoint(addr, len, kind) => {
                    let kind = match kind {
                        'r' => WatchType::WatchRead,
                        'w' => WatchType::WatchWrite,
                        _ => WatchType::WatchReadWrite,
                    };
                    if self.set_watchpoint(addr, len, kind) {
                        conn.reply_ok();
                    } else {
                        conn.reply_error("out of watchpoint slots");
                    }
                }
                DebuggerRequest::ClearWatchpoint(addr, len) => {
                    self.clear_watchpoint(addr, len);
                    conn.reply_ok();
                }
                DebuggerRequest::ReadSiginfo(tid) => {
                    self.ensure_diversion();
                    if let Session::Diversion(d) = &mut self.session {
                        d.ref_diversion();
                    }
                    match self.session.find_task(tid) {
                        Some(t) => {
                            let si = t.borrow().pending_siginfo;
                            conn.reply(to_hex(&si.as_bytes()).as_bytes());
                        }
                        None => conn.reply_error("no such thread"),
                    }
                }
                DebuggerRequest::WriteSiginfo(tid, bytes) => {
                    if let Session::Diversion(d) = &mut self.session {
                        d.unref_diversion();
                    }
                    match (self.session.find_task(tid), bytes.len()) {
                        (Some(t), 128) => {
                            let mut raw = [0u8; 128];
                            raw.copy_from_slice(&bytes);
                            let si = crate::bindings::signal::siginfo_t::from_bytes(&raw);
                            t.borrow_mut().set_siginfo(&si);
                            conn.reply_ok();
                        }
                        _ => conn.reply_error("bad siginfo"),
                    }
                }
                DebuggerRequest::Restart => {
                    self.restart_replay()?;
                    conn.reply_ok();
                }
                DebuggerRequest::ThreadList => {
                    let tids: Vec<String> = self
                        .session
                        .inner()
                        .tasks()
                        .keys()
                        .map(|t| t.to_string())
                        .collect();
                    conn.reply(tids.join(",").as_bytes());
                }
                DebuggerRequest::SelectThread(tid) => {
                    if self.session.find_task(tid).is_some() {
                        self.current_thread = Some(tid);
                        conn.reply_ok();
                    } else {
                        conn.reply_error("no such thread");
                    }
                }
                DebuggerRequest::Detach => {
                    conn.reply_ok();
                    return self.finish_headless();
                }
            }
        }
    }

    fn any_task(&self) -> Option<TaskSharedPtr> {
        let inner = self.session.inner();
        self.current_thread
            .and_then(|tid| inner.find_task(tid))
            .or_else(|| inner.tasks().values().next().cloned())
    }

    /// Debugger reads never observe planted int3 bytes.
    fn read_mem_masked(&self, addr: usize, len: usize) -> Option<Vec<u8>> {
        let t = self.any_task()?;
        let t = t.borrow();
        let mut buf = vec![0u8; len];
        if !t.read_mem(RemotePtr::new(addr), &mut buf) {
            return None;
        }
        self.session
            .inner()
            .vm(t.vm)
            .replace_breakpoints_with_original_bytes(RemotePtr::new(addr), &mut buf);
        Some(buf)
    }

    fn set_breakpoint(&mut self, addr: usize) -> bool {
        let t = match self.any_task() {
            Some(t) => t,
            None => return false,
        };
        let t = t.borrow();
        let code_addr = RemoteCodePtr::new(addr);
        let mut original = [0u8; 1];
        if !t.read_mem(RemotePtr::new(addr), &mut original) {
            return false;
        }
        let vm_id = t.vm;
        if self
            .session
            .inner_mut()
            .vm_mut(vm_id)
            .plant_breakpoint(code_addr, original[0])
        {
            return t.write_mem(RemotePtr::new(addr), &[BREAKPOINT_INSTRUCTION]);
        }
        true
    }

    fn clear_breakpoint(&mut self, addr: usize) {
        let t = match self.any_task() {
            Some(t) => t,
            None => return,
        };
        let t = t.borrow();
        let vm_id = t.vm;
        if let Some(byte) = self
            .session
            .inner_mut()
            .vm_mut(vm_id)
            .erase_breakpoint(RemoteCodePtr::new(addr))
        {
            t.write_mem(RemotePtr::new(addr), &[byte]);
        }
    }

    fn set_watchpoint(&mut self, addr: usize, len: usize, kind: WatchType) -> bool {
        let t = match self.any_task() {
            Some(t) => t,
            None => return false,
        };
        let vm_id = t.borrow().vm;
        let inner = self.session.inner_mut();
        if !inner
            .vm_mut(vm_id)
            .add_watchpoint(RemotePtr::new(addr), len, kind)
        {
            return false;
        }
        let configs = inner.vm(vm_id).watch_configs();
        let result = t.borrow().set_debug_regs(&configs);
        result
    }

    fn clear_watchpoint(&mut self, addr: usize, len: usize) {
        let t = match self.any_task() {
            Some(t) => t,
            None => return,
        };
        let vm_id = t.borrow().vm;
        let inner = self.session.inner_mut();
        inner
            .vm_mut(vm_id)
            .remove_watchpoint(RemotePtr::new(addr), len);
        let configs = inner.vm(vm_id).watch_configs();
        t.borrow().set_debug_regs(&configs);
    }

    /// Continue: in a diversion, run the diverted thread; otherwise
    /// replay frames until a breakpoint fires or the trace ends.
    fn do_continue(&mut self) -> Result<String, TraceError> {
        if matches!(self.session, Session::Diversion(_)) {
            return Ok(self.diversion_resume(DiversionResume::DiversionContinueExec));
        }
        loop {
            let status = match &mut self.session {
                Session::Replay(r) => r.replay_step()?,
                _ => unreachable!(),
            };
            match status {
                ReplayStatus::ReplayedAllEvents => return Ok("exited".into()),
                ReplayStatus::ReplayContinue => {
                    if let Some(tid) = self.breakpoint_hit() {
                        return Ok(format!("stopped {}", tid));
                    }
                }
            }
        }
    }

    fn do_step(&mut self) -> Result<String, TraceError> {
        if matches!(self.session, Session::Diversion(_)) {
            return Ok(self.diversion_resume(DiversionResume::DiversionSinglestep));
        }
        let status = match &mut self.session {
            Session::Replay(r) => r.replay_step()?,
            _ => unreachable!(),
        };
        match status {
            ReplayStatus::ReplayedAllEvents => Ok("exited".into()),
            ReplayStatus::ReplayContinue => match self.breakpoint_hit() {
                Some(tid) => Ok(format!("stopped {}", tid)),
                None => Ok("stepped".into()),
            },
        }
    }

    fn diversion_resume(&mut self, how: DiversionResume) -> String {
        let t = match self.any_task() {
            Some(t) => t,
            None => return "exited".into(),
        };
        let status = match &mut self.session {
            Session::Diversion(d) => d.diversion_step(&t, how, None),
            _ => unreachable!(),
        };
        match status {
            DiversionStatus::DiversionContinue => "running".into(),
            DiversionStatus::DiversionStopped(Some(sig)) => format!("signal {}", sig),
            DiversionStatus::DiversionStopped(None) => "stepped".into(),
            DiversionStatus::DiversionExited => {
                // Diversion over: discard it and rebuild the replay so
                // subsequent frames reproduce the original, not the
                // diverted, state.
                match self.restart_replay() {
                    Ok(()) => "diversion-done".into(),
                    Err(_) => "exited".into(),
                }
            }
        }
    }

    /// Any replayed task sitting on a planted breakpoint?
    fn breakpoint_hit(&self) -> Option<pid_t> {
        let inner = self.session.inner();
        for (tid, t) in inner.tasks() {
            let tb = t.borrow();
            // The int3 has executed by the time we see the stop; the
            // breakpoint address is one byte back.
            let ip = tb.ip();
            if ip.as_usize() > 0 {
                let bp_addr = ip - crate::kernel_abi::BREAKPOINT_INSN_LEN;
                if inner.vm(tb.vm).has_breakpoint(bp_addr) {
                    return Some(*tid);
                }
            }
        }
        None
    }

    /// Swap the replay out for a diversion over the same task tree.
    fn ensure_diversion(&mut self) {
        if matches!(self.session, Session::Diversion(_)) {
            return;
        }
        log!(LogInfo, "entering diversion");
        let placeholder =
            Session::Diversion(DiversionSession::new(SessionInner::new(), &crate::emu_fs::EmuFs::create()));
        if let Session::Replay(mut replay) = std::mem::replace(&mut self.session, placeholder) {
            let inner = std::mem::take(&mut replay.inner);
            let emu_fs = replay.emu_fs().clone();
            self.session = Session::Diversion(DiversionSession::new(inner, &emu_fs));
            // The gutted replay object drops here; it is rebuilt from the
            // trace when the diversion retires.
        }
    }

    fn restart_replay(&mut self) -> Result<(), TraceError> {
        log!(LogInfo, "restarting replay from the beginning");
        self.session.kill_all_tasks();
        self.session = Session::Replay(ReplaySession::create(self.trace_dir.as_deref())?);
        Ok(())
    }

    fn finish_headless(&mut self) -> Result<(), TraceError> {
        match &mut self.session {
            Session::Diversion(_) => {
                // Nothing worth finishing; diverted state is discarded.
                self.session.kill_all_tasks();
                Ok(())
            }
            Session::Replay(r) => loop {
                if let ReplayStatus::ReplayedAllEvents = r.replay_step()? {
                    return Ok(());
                }
            },
            Session::Record(_) => unreachable!(),
        }
    }
}
