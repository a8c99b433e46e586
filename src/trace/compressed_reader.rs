use super::compressed_writer::{BlockHeader, BLOCK_HEADER_SIZE, BLOCK_SIZE};
use super::TraceError;
use crate::scoped_fd::ScopedFd;
use brotli_sys::{
    BrotliDecoderCreateInstance, BrotliDecoderDecompressStream, BrotliDecoderDestroyInstance,
    BROTLI_DECODER_RESULT_SUCCESS,
};
use nix::fcntl::OFlag;
use std::ffi::OsStr;
use std::ptr;

/// Reads the chunk stream produced by CompressedWriter: a sequence of
/// independently compressed blocks, each preceded by its BlockHeader.
/// Record framing is the caller's concern; this only guarantees that a
/// clean EOF falls on a chunk boundary, anything else is truncation.
pub struct CompressedReader {
    fd: ScopedFd,
    /// Current decompressed chunk.
    buffer: Vec<u8>,
    buffer_pos: usize,
    at_eof: bool,
}

impl CompressedReader {
    pub fn open(filename: &OsStr) -> Result<CompressedReader, TraceError> {
        let fd = match ScopedFd::try_open_path(filename, OFlag::O_CLOEXEC | OFlag::O_RDONLY) {
            Some(fd) => fd,
            None => {
                return Err(TraceError::Corrupt(format!(
                    "can't open trace stream {:?}",
                    filename
                )))
            }
        };
        Ok(CompressedReader {
            fd,
            buffer: Vec::new(),
            buffer_pos: 0,
            at_eof: false,
        })
    }

    fn remaining_in_buffer(&self) -> usize {
        self.buffer.len() - self.buffer_pos
    }

    /// Pull in the next chunk. False on clean EOF.
    fn refill(&mut self) -> Result<bool, TraceError> {
        debug_assert_eq!(0, self.remaining_in_buffer());
        let mut header_bytes = [0u8; BLOCK_HEADER_SIZE];
        let n = read_some(&self.fd, &mut header_bytes)?;
        if n == 0 {
            self.at_eof = true;
            return Ok(false);
        }
        if n != BLOCK_HEADER_SIZE {
            return Err(TraceError::TruncatedChunk);
        }
        let header: BlockHeader = unsafe { std::mem::transmute(header_bytes) };
        if header.uncompressed_length as usize > BLOCK_SIZE || header.compressed_length == 0 {
            return Err(TraceError::Corrupt(format!(
                "implausible chunk header ({} compressed, {} uncompressed)",
                header.compressed_length, header.uncompressed_length
            )));
        }

        let mut compressed = vec![0u8; header.compressed_length as usize];
        if read_some(&self.fd, &mut compressed)? != compressed.len() {
            return Err(TraceError::TruncatedChunk);
        }

        self.buffer = vec![0u8; header.uncompressed_length as usize];
        self.buffer_pos = 0;
        unsafe { do_decompress(&compressed, &mut self.buffer) }?;
        Ok(true)
    }

    /// Read exactly `buf.len()` bytes. Ok(false) on a clean EOF before the
    /// first byte; truncation inside a record is an error.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<bool, TraceError> {
        let mut written = 0;
        while written < buf.len() {
            if self.remaining_in_buffer() == 0 {
                if !self.refill()? {
                    if written == 0 {
                        return Ok(false);
                    }
                    return Err(TraceError::TruncatedChunk);
                }
            }
            let avail = self.remaining_in_buffer().min(buf.len() - written);
            buf[written..written + avail]
                .copy_from_slice(&self.buffer[self.buffer_pos..self.buffer_pos + avail]);
            self.buffer_pos += avail;
            written += avail;
        }
        Ok(true)
    }

    /// Skip forward, decompressing as needed (chunks are independent but
    /// record offsets are byte-granular).
    pub fn skip(&mut self, mut n: usize) -> Result<(), TraceError> {
        while n > 0 {
            if self.remaining_in_buffer() == 0 && !self.refill()? {
                return Err(TraceError::TruncatedChunk);
            }
            let avail = self.remaining_in_buffer().min(n);
            self.buffer_pos += avail;
            n -= avail;
        }
        Ok(())
    }
}

/// Read up to buf.len() bytes, retrying EINTR; short only at EOF.
fn read_some(fd: &ScopedFd, buf: &mut [u8]) -> Result<usize, TraceError> {
    let mut got = 0;
    while got < buf.len() {
        let ret = unsafe {
            libc::read(
                fd.as_raw(),
                buf[got..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - got,
            )
        };
        if ret < 0 {
            let errno = nix::errno::errno();
            if errno == libc::EINTR {
                continue;
            }
            return Err(TraceError::Io(std::io::Error::from_raw_os_error(errno)));
        }
        if ret == 0 {
            break;
        }
        got += ret as usize;
    }
    Ok(got)
}

unsafe fn do_decompress(input: &[u8], output: &mut [u8]) -> Result<(), TraceError> {
    let state = BrotliDecoderCreateInstance(None, None, ptr::null_mut());
    if state.is_null() {
        fatal!("BrotliDecoderCreateInstance failed");
    }

    let mut total_out: usize = 0;
    let mut avail_in: usize = input.len();
    let mut next_in: *const u8 = input.as_ptr();
    let mut avail_out: usize = output.len();
    let mut next_out: *mut u8 = output.as_mut_ptr();

    let result = BrotliDecoderDecompressStream(
        state,
        &mut avail_in,
        &mut next_in,
        &mut avail_out,
        &mut next_out,
        &mut total_out,
    );
    BrotliDecoderDestroyInstance(state);

    if result != BROTLI_DECODER_RESULT_SUCCESS || total_out != output.len() {
        return Err(TraceError::Corrupt("chunk fails to decompress".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::super::compressed_writer::CompressedWriter;
    use super::*;
    use std::io::Write;

    fn temp_file_name(tag: &str) -> std::ffi::OsString {
        let mut p = std::env::temp_dir();
        p.push(format!(
            "retrace-cw-test-{}-{}",
            tag,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&p);
        p.into_os_string()
    }

    #[test]
    fn roundtrip_small() {
        let name = temp_file_name("small");
        let mut w = CompressedWriter::create(&name);
        w.write_all(b"hello trace").unwrap();
        w.close(false);
        assert!(w.good());

        let mut r = CompressedReader::open(&name).unwrap();
        let mut buf = [0u8; 11];
        assert!(r.read_exact(&mut buf).unwrap());
        assert_eq!(b"hello trace", &buf);
        let mut end = [0u8; 1];
        assert!(!r.read_exact(&mut end).unwrap());
        std::fs::remove_file(&name).unwrap();
    }

    #[test]
    fn roundtrip_multi_chunk() {
        let name = temp_file_name("multi");
        // More than one chunk of patterned data.
        let payload: Vec<u8> = (0..(BLOCK_SIZE * 2 + 12345))
            .map(|i| (i % 251) as u8)
            .collect();
        let mut w = CompressedWriter::create(&name);
        w.write_all(&payload).unwrap();
        w.close(false);

        let mut r = CompressedReader::open(&name).unwrap();
        let mut got = vec![0u8; payload.len()];
        assert!(r.read_exact(&mut got).unwrap());
        assert_eq!(payload, got);
        std::fs::remove_file(&name).unwrap();
    }

    #[test]
    fn skip_lands_at_offset() {
        let name = temp_file_name("skip");
        let payload: Vec<u8> = (0..100_000).map(|i| (i % 97) as u8).collect();
        let mut w = CompressedWriter::create(&name);
        w.write_all(&payload).unwrap();
        w.close(false);

        let mut r = CompressedReader::open(&name).unwrap();
        r.skip(54_321).unwrap();
        let mut got = [0u8; 4];
        assert!(r.read_exact(&mut got).unwrap());
        assert_eq!(&payload[54_321..54_325], &got);
        std::fs::remove_file(&name).unwrap();
    }

    #[test]
    fn truncation_detected() {
        let name = temp_file_name("trunc");
        let payload = vec![7u8; 4000];
        let mut w = CompressedWriter::create(&name);
        w.write_all(&payload).unwrap();
        w.close(false);

        // Chop the file mid-chunk.
        let full = std::fs::read(&name).unwrap();
        std::fs::write(&name, &full[..full.len() - 3]).unwrap();

        let mut r = CompressedReader::open(&name).unwrap();
        let mut got = vec![0u8; 4000];
        assert!(r.read_exact(&mut got).is_err());
        std::fs::remove_file(&name).unwrap();
    }
}
