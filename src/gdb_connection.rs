//! The debugger channel: a line-oriented request/response protocol over
//! TCP. Requests are parsed into a small command set; reply bodies are
//! opaque byte blobs as far as the rest of the tracer is concerned (the
//! server hex-encodes whatever it wants the debugger to see).

use crate::log::LogLevel::{LogDebug, LogInfo};
use libc::pid_t;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};

#[derive(Clone, Debug)]
pub enum DebuggerRequest {
    Cont,
    Step,
    ReadRegs(pid_t),
    WriteRegs(pid_t, Vec<u8>),
    ReadMem(usize, usize),
    WriteMem(usize, Vec<u8>),
    SetBreakpoint(usize),
    ClearBreakpoint(usize),
    SetWatchpoint(usize, usize, char),
    ClearWatchpoint(usize, usize),
    ReadSiginfo(pid_t),
    WriteSiginfo(pid_t, Vec<u8>),
    Restart,
    ThreadList,
    SelectThread(pid_t),
    Detach,
}

pub struct DebuggerConnection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl DebuggerConnection {
    /// Listen on `port` and accept one debugger.
    pub fn await_debugger(port: u16) -> std::io::Result<DebuggerConnection> {
        let listener = TcpListener::bind(("127.0.0.1", port))?;
        log!(LogInfo, "waiting for debugger on 127.0.0.1:{}", port);
        let (stream, peer) = listener.accept()?;
        log!(LogInfo, "debugger connected from {}", peer);
        let reader = BufReader::new(stream.try_clone()?);
        Ok(DebuggerConnection {
            reader,
            writer: stream,
        })
    }

    /// Next request, None when the debugger hung up or spoke garbage
    /// (protocol errors close the channel; replay continues headless).
    pub fn read_request(&mut self) -> Option<DebuggerRequest> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).ok()? == 0 {
            return None;
        }
        let req = parse_request(line.trim());
        if req.is_none() {
            log!(LogDebug, "unparseable debugger request {:?}", line.trim());
        }
        req
    }

    /// Replies are a single line; binary payloads are hex-encoded by the
    /// caller.
    pub fn reply(&mut self, body: &[u8]) {
        let _ = self.writer.write_all(body);
        let _ = self.writer.write_all(b"\n");
        let _ = self.writer.flush();
    }

    pub fn reply_ok(&mut self) {
        self.reply(b"OK");
    }

    pub fn reply_error(&mut self, what: &str) {
        self.reply(format!("E {}", what).as_bytes());
    }
}

fn parse_request(line: &str) -> Option<DebuggerRequest> {
    let mut words = line.split_whitespace();
    let cmd = words.next()?;
    let req = match cmd {
        "cont" => DebuggerRequest::Cont,
        "step" => DebuggerRequest::Step,
        "regs" => DebuggerRequest::ReadRegs(words.next()?.parse().ok()?),
        "setregs" => DebuggerRequest::WriteRegs(
            words.next()?.parse().ok()?,
            parse_hex(words.next()?)?,
        ),
        "mem" => DebuggerRequest::ReadMem(
            parse_addr(words.next()?)?,
            words.next()?.parse().ok()?,
        ),
        "setmem" => DebuggerRequest::WriteMem(parse_addr(words.next()?)?, parse_hex(words.next()?)?),
        "break" => DebuggerRequest::SetBreakpoint(parse_addr(words.next()?)?),
        "delbreak" => DebuggerRequest::ClearBreakpoint(parse_addr(words.next()?)?),
        "watch" => DebuggerRequest::SetWatchpoint(
            parse_addr(words.next()?)?,
            words.next()?.parse().ok()?,
            words.next()?.chars().next()?,
        ),
        "delwatch" => DebuggerRequest::ClearWatchpoint(
            parse_addr(words.next()?)?,
            words.next()?.parse().ok()?,
        ),
        "siginfo" => DebuggerRequest::ReadSiginfo(words.next()?.parse().ok()?),
        "setsiginfo" => DebuggerRequest::WriteSiginfo(
            words.next()?.parse().ok()?,
            parse_hex(words.next()?)?,
        ),
        "restart" => DebuggerRequest::Restart,
        "threads" => DebuggerRequest::ThreadList,
        "thread" => DebuggerRequest::SelectThread(words.next()?.parse().ok()?),
        "detach" => DebuggerRequest::Detach,
        _ => return None,
    };
    Some(req)
}

fn parse_addr(s: &str) -> Option<usize> {
    let s = s.trim_start_matches("0x");
    usize::from_str_radix(s, 16).ok()
}

fn parse_hex(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_core_requests() {
        assert!(matches!(parse_request("cont"), Some(DebuggerRequest::Cont)));
        assert!(matches!(
            parse_request("break 0x401000"),
            Some(DebuggerRequest::SetBreakpoint(0x401000))
        ));
        match parse_request("mem 7f0000 16") {
            Some(DebuggerRequest::ReadMem(addr, len)) => {
                assert_eq!(0x7f0000, addr);
                assert_eq!(16, len);
            }
            other => panic!("bad parse: {:?}", other),
        }
        match parse_request("watch 1000 8 w") {
            Some(DebuggerRequest::SetWatchpoint(0x1000, 8, 'w')) => (),
            other => panic!("bad parse: {:?}", other),
        }
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_request("").is_none());
        assert!(parse_request("bogus command").is_none());
        assert!(parse_request("break nothex").is_none());
    }

    #[test]
    fn hex_roundtrip() {
        let bytes = vec![0x00, 0xff, 0x7f, 0x10];
        assert_eq!(Some(bytes.clone()), parse_hex(&to_hex(&bytes)));
        assert!(parse_hex("abc").is_none());
    }
}
