//! Buffered, typed IPC over pipes.
//!
//! Both directions carry one JSON message per line. Readers and writers are
//! generic over `Read`/`Write` so the worker loop can be driven from memory
//! in tests and from raw pipe descriptors in production.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

/// Buffer size for IPC (64KB).
const IPC_BUFFER_SIZE: usize = 64 * 1024;

/// A pipe descriptor that retries reads and writes interrupted by signals.
pub struct PipeFd {
    fd: OwnedFd,
}

impl PipeFd {
    pub fn new(fd: OwnedFd) -> Self {
        Self { fd }
    }

    /// Take ownership of a raw file descriptor.
    ///
    /// # Safety
    /// `fd` must be open and not owned by anything else.
    pub unsafe fn from_raw(fd: RawFd) -> Self {
        Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        }
    }
}

impl From<OwnedFd> for PipeFd {
    fn from(fd: OwnedFd) -> Self {
        Self::new(fd)
    }
}

impl AsFd for PipeFd {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for PipeFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Read for PipeFd {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::read(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }
}

impl Write for PipeFd {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            match nix::unistd::write(&self.fd, buf) {
                Ok(n) => return Ok(n),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Outcome of reading one line from the peer.
#[derive(Debug)]
pub enum Received<T> {
    Message(T),
    /// The line was not a valid message; carries the raw line and parse error.
    Invalid { line: String, error: String },
    /// The peer closed its end.
    Closed,
}

/// Reads newline-delimited JSON messages.
pub struct MessageReader<R: Read> {
    reader: BufReader<R>,
    line_buffer: String,
}

impl<R: Read> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::with_capacity(IPC_BUFFER_SIZE, inner),
            line_buffer: String::with_capacity(4096),
        }
    }

    /// Read the next non-blank line, without the trailing newline.
    ///
    /// Returns `None` on EOF.
    pub fn read_line(&mut self) -> io::Result<Option<&str>> {
        loop {
            self.line_buffer.clear();
            if self.reader.read_line(&mut self.line_buffer)? == 0 {
                return Ok(None);
            }
            let trimmed_len = self.line_buffer.trim_end_matches(['\n', '\r']).len();
            self.line_buffer.truncate(trimmed_len);
            if !self.line_buffer.trim().is_empty() {
                return Ok(Some(&self.line_buffer));
            }
        }
    }

    /// Read and decode the next message.
    pub fn recv<T: DeserializeOwned>(&mut self) -> io::Result<Received<T>> {
        match self.read_line()? {
            None => Ok(Received::Closed),
            Some(line) => match serde_json::from_str(line) {
                Ok(message) => Ok(Received::Message(message)),
                Err(e) => Ok(Received::Invalid {
                    line: line.to_string(),
                    error: e.to_string(),
                }),
            },
        }
    }
}

/// Writes newline-delimited JSON messages, flushing after each one.
pub struct MessageWriter<W: Write> {
    writer: BufWriter<W>,
}

impl<W: Write> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            writer: BufWriter::with_capacity(IPC_BUFFER_SIZE, inner),
        }
    }

    pub fn send<T: Serialize>(&mut self, message: &T) -> io::Result<()> {
        serde_json::to_writer(&mut self.writer, message)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()
    }
}
