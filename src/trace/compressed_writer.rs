use crate::scoped_fd::ScopedFd;
use crate::util::write_all;
use brotli_sys::{
    BrotliEncoderCompressStream, BrotliEncoderCreateInstance, BrotliEncoderDestroyInstance,
    BrotliEncoderSetParameter, BROTLI_OPERATION_FINISH, BROTLI_OPERATION_PROCESS,
    BROTLI_PARAM_QUALITY,
};
use nix::fcntl::OFlag;
use nix::sys::stat::Mode;
use nix::unistd::fsync;
use std::ffi::OsStr;
use std::io::{Error, ErrorKind, Result, Write};
use std::mem::size_of;
use std::ptr;

/// Quality level 5 is the sweet spot for trace data: levels above cost
/// encode time for little size, levels below bloat the trace.
const BROTLI_LEVEL: u32 = 5;

/// Uncompressed bytes per chunk. Each chunk is compressed independently so
/// a reader can resynchronize at any chunk boundary.
pub const BLOCK_SIZE: usize = 1024 * 1024;

#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct BlockHeader {
    pub compressed_length: u32,
    pub uncompressed_length: u32,
}

pub const BLOCK_HEADER_SIZE: usize = size_of::<BlockHeader>();

/// CompressedWriter opens an output file and appends compressed chunks:
/// each chunk of up to BLOCK_SIZE input bytes is brotli-compressed and
/// written behind a BlockHeader. All writing happens on the caller's
/// thread; the tracer is single-threaded and trace output is not the
/// bottleneck it would need to be to justify a compressor pool.
pub struct CompressedWriter {
    fd: ScopedFd,
    buffer: Vec<u8>,
    error: bool,
}

impl CompressedWriter {
    pub fn create(filename: &OsStr) -> CompressedWriter {
        let fd = ScopedFd::open_path_with_mode(
            filename,
            OFlag::O_CLOEXEC
                | OFlag::O_WRONLY
                | OFlag::O_CREAT
                | OFlag::O_EXCL
                | OFlag::O_LARGEFILE,
            Mode::S_IRUSR | Mode::S_IWUSR,
        );
        CompressedWriter {
            fd,
            buffer: Vec::with_capacity(BLOCK_SIZE),
            error: false,
        }
    }

    pub fn good(&self) -> bool {
        !self.error
    }

    fn write_block(&mut self) {
        if self.buffer.is_empty() || self.error {
            return;
        }
        // Slop for incompressible data.
        let mut outputbuf = vec![0u8; self.buffer.len() + self.buffer.len() / 8 + 1024];
        let compressed_length = unsafe { do_compress(&self.buffer, &mut outputbuf) };
        if compressed_length == 0 {
            self.error = true;
            return;
        }
        let header = BlockHeader {
            compressed_length: compressed_length as u32,
            uncompressed_length: self.buffer.len() as u32,
        };
        let header_bytes: [u8; BLOCK_HEADER_SIZE] = unsafe { std::mem::transmute(header) };
        write_all(self.fd.as_raw(), &header_bytes);
        write_all(self.fd.as_raw(), &outputbuf[..compressed_length]);
        self.buffer.clear();
    }

    /// Flush any buffered partial chunk and close the file. `sync` forces
    /// the data to stable storage first.
    pub fn close(&mut self, sync: bool) {
        if !self.fd.is_open() {
            return;
        }
        self.write_block();
        if sync && fsync(self.fd.as_raw()).is_err() {
            self.error = true;
        }
        self.fd.close();
    }
}

impl Drop for CompressedWriter {
    fn drop(&mut self) {
        self.close(false);
    }
}

impl Write for CompressedWriter {
    fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.error {
            return Err(Error::new(ErrorKind::Other, "CompressedWriter error"));
        }
        let mut remaining = data;
        while !remaining.is_empty() {
            let space = BLOCK_SIZE - self.buffer.len();
            let amount = space.min(remaining.len());
            self.buffer.extend_from_slice(&remaining[..amount]);
            remaining = &remaining[amount..];
            if self.buffer.len() == BLOCK_SIZE {
                self.write_block();
                if self.error {
                    return Err(Error::new(ErrorKind::Other, "CompressedWriter error"));
                }
            }
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> Result<()> {
        // Deliberately not chunk-flushing here: callers use write() sizes
        // as the framing and close() for the final partial chunk.
        Ok(())
    }
}

unsafe fn do_compress(input: &[u8], output_buf: &mut [u8]) -> usize {
    let state = BrotliEncoderCreateInstance(None, None, ptr::null_mut());
    if state.is_null() {
        fatal!("BrotliEncoderCreateInstance failed");
    }

    if 0 == BrotliEncoderSetParameter(state, BROTLI_PARAM_QUALITY, BROTLI_LEVEL) {
        fatal!("Brotli initialization failed");
    }

    let mut total_out: usize = 0;
    let mut avail_in: usize = input.len();
    let mut next_in: *const u8 = input.as_ptr();
    let mut avail_out: usize = output_buf.len();
    let mut next_out: *mut u8 = output_buf.as_mut_ptr();

    if 0 == BrotliEncoderCompressStream(
        state,
        BROTLI_OPERATION_PROCESS,
        &mut avail_in,
        &mut next_in,
        &mut avail_out,
        &mut next_out,
        &mut total_out,
    ) {
        fatal!("Brotli compression failed");
    }
    let mut zero: usize = 0;
    if 0 == BrotliEncoderCompressStream(
        state,
        BROTLI_OPERATION_FINISH,
        &mut zero,
        ptr::null_mut(),
        &mut avail_out,
        &mut next_out,
        &mut total_out,
    ) {
        fatal!("Brotli compression failed");
    }

    BrotliEncoderDestroyInstance(state);
    total_out
}
