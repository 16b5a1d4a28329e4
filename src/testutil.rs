//! Test-only duplex loopback transport.
//!
//! A bare `std::io::Cursor<Vec<u8>>` cannot stand in for a TCP socket in
//! tests that both write (`Connection::connect`'s `StartupMessage`) and
//! read canned backend bytes on the same stream: reads and writes would
//! share one cursor position, so a write clobbers the canned bytes it's
//! about to read back. This splits the two directions the way a real
//! socket's send/receive buffers are split.

use std::io::{self, Cursor, Read, Write};

pub(crate) struct Loopback {
  read: Cursor<Vec<u8>>,
  pub(crate) written: Vec<u8>,
}

impl Loopback {
  pub(crate) fn new(canned_backend_bytes: Vec<u8>) -> Self {
    Self {
      read: Cursor::new(canned_backend_bytes),
      written: Vec::new(),
    }
  }
}

impl Read for Loopback {
  fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
    self.read.read(buf)
  }
}

impl Write for Loopback {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.written.extend_from_slice(buf);
    Ok(buf.len())
  }

  fn flush(&mut self) -> io::Result<()> {
    Ok(())
  }
}
